//! The waitlist scheduler: per-(server, scope) FIFO queues of tickets.
//!
//! A ticket is a durable token granting entry to a critical section on a
//! compute node. Among the non-terminal tickets of a queue the earliest
//! created is `active` and all others are `queued`; release and expiry
//! promote the next in line. Three independent expiry mechanisms coexist:
//! per-ticket deadlines (driven by [`timer::ExpiryTimer`]), long-poll
//! waiter timeouts, and a retention sweep that deletes old terminal
//! tickets.

pub mod ticket;
pub(crate) mod timer;
pub(crate) mod waiters;
pub mod worker;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use corral_store::{BatchOp, Filter, FindOpts, ObjectStore, SortKey, StoreError, StoredObject};

use crate::config::WaitlistConfig;
use crate::{Error, Result, timestamp};

pub use ticket::{QueueKey, TICKETS_BUCKET, Ticket, TicketStatus};
pub use worker::CreatedTicket;

use timer::ExpiryTimer;
use waiters::TicketWaiters;
use worker::{QueueCmd, QueueWorker};

/// Parameters for creating a ticket.
#[derive(Debug, Clone)]
pub struct TicketRequest {
    pub server_id: String,
    pub scope: String,
    pub id: String,
    pub expires_at: DateTime<Utc>,
    pub action: Option<String>,
    pub extra: Option<Value>,
}

/// Options for listing a server's tickets.
#[derive(Debug, Clone, Default)]
pub struct ListTickets {
    pub limit: Option<usize>,
    pub offset: usize,
    pub scope: Option<String>,
    pub status: Option<TicketStatus>,
}

/// The waitlist scheduler.
///
/// One instance per process. Mutations route through per-queue worker
/// tasks; reads go straight to the store.
pub struct Waitlist {
    store: Arc<dyn ObjectStore>,
    config: WaitlistConfig,
    waiters: Arc<TicketWaiters>,
    timer: Arc<ExpiryTimer>,
    queues: Mutex<HashMap<QueueKey, mpsc::Sender<QueueCmd>>>,
    cancel: CancellationToken,
}

impl Waitlist {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        config: WaitlistConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            waiters: Arc::new(TicketWaiters::new()),
            timer: Arc::new(ExpiryTimer::new()),
            queues: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Spawn the expiry-timer driver and the retention sweeper. Call after
    /// [`Waitlist::recover`].
    pub fn start(self: Arc<Self>) {
        let waitlist = Arc::clone(&self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { waitlist.run_timer(cancel).await });

        let cancel = self.cancel.clone();
        tokio::spawn(async move { self.run_sweeper(cancel).await });
    }

    /// Reconcile every queue that has non-terminal tickets. Run once at
    /// process start, before accepting requests: this expires overdue
    /// tickets from a previous life and rebuilds the expiry timer. Tickets
    /// that were active stay active -- their owner may still release them.
    pub async fn recover(&self) -> Result<()> {
        let objects = find_paged(
            self.store.as_ref(),
            &live_status_filter(),
            queue_sort(),
            0,
            None,
        )
        .await?;

        let mut keys = BTreeSet::new();
        for object in &objects {
            keys.insert(Ticket::from_object(object)?.queue_key());
        }

        info!(queues = keys.len(), "recovering waitlist queues");
        let reconciles = keys.into_iter().map(|key| {
            let tx = self.queue_tx(&key);
            async move {
                let (reply, rx) = oneshot::channel();
                tx.send(QueueCmd::Reconcile { reply })
                    .await
                    .map_err(|_| shutdown_err())?;
                rx.await.map_err(|_| shutdown_err())?
            }
        });
        for result in futures::future::join_all(reconciles).await {
            result?;
        }
        Ok(())
    }

    /// Create a ticket. It is persisted `queued`, then the queue is
    /// reconciled, so a ticket that is alone in its queue comes back
    /// already `active`. The result carries a snapshot of the queue as
    /// seen immediately after creation.
    pub async fn create_ticket(&self, req: TicketRequest) -> Result<CreatedTicket> {
        for (field, value) in [
            ("server_id", &req.server_id),
            ("scope", &req.scope),
            ("id", &req.id),
        ] {
            if value.is_empty() {
                return Err(Error::BadParam(format!("{field} must not be empty")));
            }
        }

        let now = Utc::now();
        let ticket = Ticket {
            uuid: Uuid::new_v4(),
            server_id: req.server_id,
            scope: req.scope,
            id: req.id,
            status: TicketStatus::Queued,
            expires_at: req.expires_at,
            created_at: now,
            updated_at: now,
            action: req.action,
            extra: req.extra,
        };

        let (reply, rx) = oneshot::channel();
        self.queue_tx(&ticket.queue_key())
            .send(QueueCmd::Create { ticket, reply })
            .await
            .map_err(|_| shutdown_err())?;
        rx.await.map_err(|_| shutdown_err())?
    }

    /// Read a ticket straight from the store.
    pub async fn get_ticket(&self, uuid: Uuid) -> Result<Ticket> {
        let object = self
            .store
            .get(TICKETS_BUCKET, &uuid.to_string())
            .await
            .map_err(|err| match err {
                StoreError::NotFound { .. } => Error::NotFound(format!("ticket {uuid}")),
                other => other.into(),
            })?;
        Ticket::from_object(&object)
    }

    /// List a server's tickets, `created_at` ascending. Paging is correct
    /// even when the requested window exceeds the store's per-query cap.
    pub async fn list_tickets(&self, server_id: &str, opts: &ListTickets) -> Result<Vec<Ticket>> {
        let limit = match opts.limit {
            None => self.config.max_limit,
            Some(limit) if (1..=self.config.max_limit).contains(&limit) => limit,
            Some(limit) => {
                return Err(Error::BadParam(format!(
                    "limit must be between 1 and {}, got {limit}",
                    self.config.max_limit
                )));
            }
        };

        let mut terms = vec![Filter::eq("server_id", server_id)];
        if let Some(scope) = &opts.scope {
            terms.push(Filter::eq("scope", scope.as_str()));
        }
        if let Some(status) = opts.status {
            terms.push(Filter::eq("status", status.as_str()));
        }

        let objects = find_paged(
            self.store.as_ref(),
            &Filter::and(terms),
            queue_sort(),
            opts.offset,
            Some(limit),
        )
        .await?;
        objects.iter().map(Ticket::from_object).collect()
    }

    /// Block until the ticket is `active` or terminal, or the timeout
    /// elapses ([`Error::Timeout`]). A ticket that is already past
    /// `queued` resolves immediately.
    pub async fn wait_ticket(&self, uuid: Uuid, timeout: Option<Duration>) -> Result<Ticket> {
        let ticket = self.get_ticket(uuid).await?;
        if ticket_ready(&ticket) {
            return Ok(ticket);
        }

        let rx = self.waiters.register(uuid);
        // Close the gap with a wake that landed between the read above and
        // the registration.
        let ticket = self.get_ticket(uuid).await?;
        if ticket_ready(&ticket) {
            return Ok(ticket);
        }

        let timeout = timeout.unwrap_or(self.config.default_wait_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ticket)) => Ok(ticket),
            Ok(Err(_)) => Err(Error::Internal(anyhow!(
                "ticket notification channel closed"
            ))),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Release an active ticket (`active -> finished`) and promote the
    /// next in line. Releasing a ticket that is not active fails with
    /// [`Error::NotActive`] and never promotes.
    pub async fn release_ticket(&self, uuid: Uuid) -> Result<Ticket> {
        // Resolve the queue first; the worker re-reads under its own lock.
        let ticket = self.get_ticket(uuid).await?;

        let (reply, rx) = oneshot::channel();
        self.queue_tx(&ticket.queue_key())
            .send(QueueCmd::Release { uuid, reply })
            .await
            .map_err(|_| shutdown_err())?;
        rx.await.map_err(|_| shutdown_err())?
    }

    /// Bulk-delete a server's tickets, in pages. Without `force` the call
    /// fails while any ticket is active. Returns the number deleted.
    pub async fn delete_tickets(&self, server_id: &str, force: bool) -> Result<usize> {
        if !force {
            let active = self
                .store
                .find(
                    TICKETS_BUCKET,
                    &Filter::and(vec![
                        Filter::eq("server_id", server_id),
                        Filter::eq("status", TicketStatus::Active.as_str()),
                    ]),
                    &FindOpts::default().limit(1),
                )
                .await?;
            if !active.is_empty() {
                return Err(Error::Conflict(format!(
                    "server {server_id} has active tickets; retry with force"
                )));
            }
        }

        let filter = Filter::eq("server_id", server_id);
        let mut deleted = 0;
        loop {
            let page = self
                .store
                .find(TICKETS_BUCKET, &filter, &FindOpts::default())
                .await?;
            if page.is_empty() {
                break;
            }
            deleted += page.len();
            let ops = page
                .into_iter()
                .map(|object| BatchOp::Delete {
                    bucket: TICKETS_BUCKET.to_owned(),
                    key: object.key,
                })
                .collect();
            self.store.batch(ops).await?;
        }

        info!(server_id, deleted, force, "tickets deleted");
        Ok(deleted)
    }

    /// Get or spawn the worker for a queue.
    fn queue_tx(&self, key: &QueueKey) -> mpsc::Sender<QueueCmd> {
        let mut queues = self.queues.lock().expect("waitlist lock poisoned");
        if let Some(tx) = queues.get(key) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let tx = QueueWorker::spawn(
            key.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.waiters),
            Arc::clone(&self.timer),
            self.config.clone(),
            self.cancel.child_token(),
        );
        queues.insert(key.clone(), tx.clone());
        tx
    }

    /// Driver for ticket deadlines: sleep until the nearest one, then fire
    /// the affected queues' reconciles and re-arm.
    async fn run_timer(&self, cancel: CancellationToken) {
        loop {
            match self.timer.next_deadline() {
                None => {
                    tokio::select! {
                        _ = self.timer.changed() => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                Some(deadline) => {
                    let now = Utc::now();
                    if deadline <= now {
                        for key in self.timer.take_due(now) {
                            let tx = self.queue_tx(&key);
                            if tx.send(QueueCmd::Expire).await.is_err() {
                                warn!(queue = %key, "queue worker unavailable for expiry");
                            }
                        }
                        continue;
                    }
                    let sleep = (deadline - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        // A nearer deadline was scheduled; re-arm.
                        _ = self.timer.changed() => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Periodically delete terminal tickets older than the retention
    /// window and drop disconnected waiters.
    async fn run_sweeper(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_retention().await {
                        warn!(error = %err, "retention sweep failed");
                    }
                    self.waiters.prune_closed();
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn sweep_retention(&self) -> Result<usize> {
        let window = chrono::Duration::from_std(self.config.retention_window)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        let cutoff = Utc::now() - window;

        let filter = Filter::and(vec![
            Filter::or(vec![
                Filter::eq("status", TicketStatus::Finished.as_str()),
                Filter::eq("status", TicketStatus::Expired.as_str()),
            ]),
            Filter::le("updated_at", timestamp::format(&cutoff)),
        ]);

        let mut deleted = 0;
        loop {
            let page = self
                .store
                .find(TICKETS_BUCKET, &filter, &FindOpts::default())
                .await?;
            if page.is_empty() {
                break;
            }
            deleted += page.len();
            let ops = page
                .into_iter()
                .map(|object| BatchOp::Delete {
                    bucket: TICKETS_BUCKET.to_owned(),
                    key: object.key,
                })
                .collect();
            self.store.batch(ops).await?;
        }

        if deleted > 0 {
            info!(deleted, "retention sweep removed terminal tickets");
        }
        Ok(deleted)
    }
}

fn ticket_ready(ticket: &Ticket) -> bool {
    ticket.status == TicketStatus::Active || ticket.status.is_terminal()
}

fn shutdown_err() -> Error {
    Error::Internal(anyhow!("waitlist is shutting down"))
}

/// Filter matching the non-terminal tickets of one queue.
pub(crate) fn live_queue_filter(key: &QueueKey) -> Filter {
    Filter::and(vec![
        Filter::eq("server_id", key.server_id.as_str()),
        Filter::eq("scope", key.scope.as_str()),
        live_status_filter(),
    ])
}

/// Filter matching all non-terminal tickets.
pub(crate) fn live_status_filter() -> Filter {
    Filter::or(vec![
        Filter::eq("status", TicketStatus::Queued.as_str()),
        Filter::eq("status", TicketStatus::Active.as_str()),
    ])
}

/// FIFO order: `created_at` ascending, ties broken by uuid.
pub(crate) fn queue_sort() -> Vec<SortKey> {
    vec![SortKey::asc("created_at"), SortKey::asc("uuid")]
}

/// Collect up to `want` objects (all when `None`), requesting successive
/// pages so results are complete even past the store's per-query cap.
pub(crate) async fn find_paged(
    store: &dyn ObjectStore,
    filter: &Filter,
    sort: Vec<SortKey>,
    offset: usize,
    want: Option<usize>,
) -> Result<Vec<StoredObject>> {
    let cap = store.page_cap();
    let want = want.unwrap_or(usize::MAX);
    let mut out: Vec<StoredObject> = Vec::new();

    while out.len() < want {
        let batch = cap.min(want - out.len());
        let opts = FindOpts {
            sort: sort.clone(),
            limit: Some(batch),
            offset: offset + out.len(),
        };
        let page = store.find(TICKETS_BUCKET, filter, &opts).await?;
        let got = page.len();
        out.extend(page);
        if got < batch {
            break;
        }
    }
    Ok(out)
}
