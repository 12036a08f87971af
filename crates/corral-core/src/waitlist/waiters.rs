//! Long-poll waiter registrations for tickets.
//!
//! One reader (the HTTP handler) owns each receiver; the queue workers are
//! the writers. Wake-ups happen only after the corresponding status change
//! is durable in the store.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use uuid::Uuid;

use super::ticket::Ticket;

#[derive(Default)]
pub(crate) struct TicketWaiters {
    inner: Mutex<HashMap<Uuid, Vec<oneshot::Sender<Ticket>>>>,
}

impl TicketWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for a ticket's next status change.
    pub fn register(&self, uuid: Uuid) -> oneshot::Receiver<Ticket> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("waiter lock poisoned")
            .entry(uuid)
            .or_default()
            .push(tx);
        rx
    }

    /// Wake every waiter registered for this ticket with its new state.
    pub fn wake(&self, ticket: &Ticket) {
        let waiters = self
            .inner
            .lock()
            .expect("waiter lock poisoned")
            .remove(&ticket.uuid);
        if let Some(waiters) = waiters {
            for tx in waiters {
                // A closed receiver just means the client went away.
                let _ = tx.send(ticket.clone());
            }
        }
    }

    /// Drop registrations whose client has disconnected.
    pub fn prune_closed(&self) {
        let mut inner = self.inner.lock().expect("waiter lock poisoned");
        inner.retain(|_, txs| {
            txs.retain(|tx| !tx.is_closed());
            !txs.is_empty()
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("waiter lock poisoned").len()
    }
}
