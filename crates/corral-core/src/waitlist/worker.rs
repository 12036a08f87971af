//! Per-queue worker: the single writer for one (server, scope) queue.
//!
//! All mutations of a queue's tickets flow through its worker's inbox, so
//! per-queue operations appear serial within the process; cross-process
//! consistency comes from the store's etag checks. Waiter wake-ups happen
//! only after a change is durable.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use corral_store::{BatchOp, Etag, ObjectStore};

use super::ticket::{QueueKey, TICKETS_BUCKET, Ticket, TicketStatus};
use super::timer::ExpiryTimer;
use super::waiters::TicketWaiters;
use super::{find_paged, live_queue_filter, queue_sort};
use crate::config::WaitlistConfig;
use crate::{Error, Result};

/// Commands accepted by a queue worker.
pub(crate) enum QueueCmd {
    Create {
        ticket: Ticket,
        reply: oneshot::Sender<Result<CreatedTicket>>,
    },
    Release {
        uuid: Uuid,
        reply: oneshot::Sender<Result<Ticket>>,
    },
    /// Fired by the expiry timer; no reply.
    Expire,
    /// Recovery / explicit invariant repair.
    Reconcile {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Result of creating a ticket: the stored ticket plus a snapshot of the
/// whole queue as seen immediately after creation.
#[derive(Debug, Clone)]
pub struct CreatedTicket {
    pub ticket: Ticket,
    pub queue: Vec<Ticket>,
}

pub(crate) struct QueueWorker {
    key: QueueKey,
    store: Arc<dyn ObjectStore>,
    waiters: Arc<TicketWaiters>,
    timer: Arc<ExpiryTimer>,
    config: WaitlistConfig,
}

impl QueueWorker {
    pub fn spawn(
        key: QueueKey,
        store: Arc<dyn ObjectStore>,
        waiters: Arc<TicketWaiters>,
        timer: Arc<ExpiryTimer>,
        config: WaitlistConfig,
        cancel: CancellationToken,
    ) -> mpsc::Sender<QueueCmd> {
        let (tx, rx) = mpsc::channel(64);
        let worker = Self {
            key,
            store,
            waiters,
            timer,
            config,
        };
        tokio::spawn(worker.run(rx, cancel));
        tx
    }

    async fn run(self, mut inbox: mpsc::Receiver<QueueCmd>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                cmd = inbox.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        debug!(queue = %self.key, "queue worker stopped");
    }

    async fn handle(&self, cmd: QueueCmd) {
        match cmd {
            QueueCmd::Create { ticket, reply } => {
                let _ = reply.send(self.handle_create(ticket).await);
            }
            QueueCmd::Release { uuid, reply } => {
                let _ = reply.send(self.handle_release(uuid).await);
            }
            QueueCmd::Expire => {
                if let Err(err) = self.reconcile().await {
                    warn!(queue = %self.key, error = %err, "expiry reconcile failed");
                }
            }
            QueueCmd::Reconcile { reply } => {
                let _ = reply.send(self.reconcile().await);
            }
        }
    }

    /// Persist a new queued ticket, then reconcile so it is promoted right
    /// away when it is alone in the queue.
    async fn handle_create(&self, ticket: Ticket) -> Result<CreatedTicket> {
        let doc = ticket.to_doc()?;
        self.store
            .put(TICKETS_BUCKET, &ticket.storage_key(), doc, None)
            .await?;
        self.timer.schedule(ticket.expires_at, self.key.clone());

        self.reconcile().await?;

        let queue = self.load_queue().await?;
        let stored = match queue.iter().find(|t| t.uuid == ticket.uuid) {
            Some(t) => t.clone(),
            // Already terminal (e.g. created with a deadline in the past).
            None => self.load_ticket(ticket.uuid).await?.0,
        };
        Ok(CreatedTicket {
            ticket: stored,
            queue,
        })
    }

    /// `active -> finished`, then promote the next queued ticket.
    async fn handle_release(&self, uuid: Uuid) -> Result<Ticket> {
        let mut attempt = 0;
        loop {
            let (mut ticket, etag) = self.load_ticket(uuid).await?;
            if ticket.status != TicketStatus::Active {
                return Err(Error::NotActive(uuid));
            }

            ticket.status = TicketStatus::Finished;
            ticket.updated_at = Utc::now();
            let doc = ticket.to_doc()?;
            match self
                .store
                .put(TICKETS_BUCKET, &ticket.storage_key(), doc, Some(&etag))
                .await
            {
                Ok(_) => {
                    self.waiters.wake(&ticket);
                    self.reconcile().await?;
                    return Ok(ticket);
                }
                Err(err) if err.is_etag_conflict() && attempt < self.config.etag_retries => {
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Re-establish the queue invariants:
    ///
    /// 1. Load all non-terminal tickets, FIFO order.
    /// 2. Expire any whose deadline has passed (queued or active).
    /// 3. If none is active, promote the head.
    /// 4. Persist every change in one atomic batch; on an etag conflict
    ///    re-read and retry.
    /// 5. Wake waiters for each changed ticket after the batch commits.
    async fn reconcile(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            let entries = self.load_live_with_etags().await?;
            let now = Utc::now();

            let mut changed: Vec<Ticket> = Vec::new();
            let mut ops: Vec<BatchOp> = Vec::new();
            let mut live: Vec<(Ticket, Etag)> = Vec::new();

            for (mut ticket, etag) in entries {
                if ticket.expires_at <= now {
                    ticket.status = TicketStatus::Expired;
                    ticket.updated_at = now;
                    ops.push(put_op(&ticket, etag)?);
                    changed.push(ticket);
                } else {
                    live.push((ticket, etag));
                }
            }

            let has_active = live
                .iter()
                .any(|(t, _)| t.status == TicketStatus::Active);
            if !has_active {
                if let Some((head, etag)) = live.first_mut() {
                    head.status = TicketStatus::Active;
                    head.updated_at = now;
                    ops.push(put_op(head, etag.clone())?);
                    changed.push(head.clone());
                }
            }

            // Re-arm for the earliest live deadline; a fired duplicate just
            // reconciles again harmlessly.
            if let Some(deadline) = live.iter().map(|(t, _)| t.expires_at).min() {
                self.timer.schedule(deadline, self.key.clone());
            }

            if changed.is_empty() {
                return Ok(());
            }

            match self.store.batch(ops).await {
                Ok(()) => {
                    for ticket in &changed {
                        debug!(
                            queue = %self.key,
                            ticket = %ticket.uuid,
                            status = %ticket.status,
                            "ticket transitioned"
                        );
                        self.waiters.wake(ticket);
                    }
                    return Ok(());
                }
                Err(err) if err.is_etag_conflict() && attempt < self.config.etag_retries => {
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Non-terminal tickets of this queue in FIFO order, paging past the
    /// store's per-query cap.
    async fn load_live_with_etags(&self) -> Result<Vec<(Ticket, Etag)>> {
        let objects = find_paged(
            self.store.as_ref(),
            &live_queue_filter(&self.key),
            queue_sort(),
            0,
            None,
        )
        .await?;
        objects
            .iter()
            .map(|obj| Ok((Ticket::from_object(obj)?, obj.etag.clone())))
            .collect()
    }

    async fn load_queue(&self) -> Result<Vec<Ticket>> {
        Ok(self
            .load_live_with_etags()
            .await?
            .into_iter()
            .map(|(ticket, _)| ticket)
            .collect())
    }

    async fn load_ticket(&self, uuid: Uuid) -> Result<(Ticket, Etag)> {
        let object = self
            .store
            .get(TICKETS_BUCKET, &uuid.to_string())
            .await
            .map_err(|err| match err {
                corral_store::StoreError::NotFound { .. } => {
                    Error::NotFound(format!("ticket {uuid}"))
                }
                other => other.into(),
            })?;
        Ok((Ticket::from_object(&object)?, object.etag))
    }
}

fn put_op(ticket: &Ticket, expected: Etag) -> Result<BatchOp> {
    Ok(BatchOp::Put {
        bucket: TICKETS_BUCKET.to_owned(),
        key: ticket.storage_key(),
        value: ticket.to_doc()?,
        expected: Some(expected),
    })
}
