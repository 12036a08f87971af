//! The task registry: create, track, and wait on agent tasks.
//!
//! The registry owns every in-flight task record and the long-poll waiters
//! attached to them. Agent events arrive over an mpsc channel (see
//! [`crate::transport`]) and are applied under one lock; a terminal event
//! wakes every waiter for that task exactly once. Waiters that arrive after
//! the terminal event return immediately with the stored state, which stays
//! readable for `retention` before the sweeper drops it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HistoryEntry, Task, TaskStatus};
use crate::config::TaskConfig;
use crate::transport::{AgentEvent, AgentTransport, TerminalStatus};
use crate::{Error, Result};

/// How long events for an unknown task id are buffered. Covers the window
/// between the agent accepting work and the dispatching call storing the
/// record.
const PENDING_EVENT_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a task long-poll.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// The task reached a terminal status.
    Completed(Task),
    /// The wait deadline passed first; carries the still-active task.
    TimedOut(Task),
}

struct TaskRecord {
    task: Task,
    /// Highest progress `seq` applied, for duplicate-delivery drops.
    last_seq: u64,
    /// Set when the task turns terminal; the sweeper collects it after
    /// this instant.
    gc_after: Option<DateTime<Utc>>,
}

struct PendingEvents {
    events: Vec<AgentEvent>,
    since: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, TaskRecord>,
    waiters: HashMap<String, Vec<oneshot::Sender<Task>>>,
    /// Events that raced ahead of the record insert.
    pending: HashMap<String, PendingEvents>,
}

/// In-memory registry of agent tasks.
pub struct TaskRegistry {
    transport: Arc<dyn AgentTransport>,
    config: TaskConfig,
    inner: Mutex<Inner>,
}

impl TaskRegistry {
    pub fn new(transport: Arc<dyn AgentTransport>, config: TaskConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Consume agent events from the transport channel until cancelled.
    pub fn spawn_event_pump(
        self: Arc<Self>,
        mut events: mpsc::Receiver<AgentEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => self.apply(event),
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Periodically collect terminal tasks past retention and force-fail
    /// abandoned ones.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.sweep(Utc::now()),
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Dispatch work to a server's agent and start tracking it.
    ///
    /// Transport errors fail the call synchronously; on success the task is
    /// stored `active` and returned immediately.
    pub async fn create_task(&self, server_id: &str, kind: &str, params: Value) -> Result<Task> {
        let task_id = self.transport.dispatch(server_id, kind, &params).await?;
        let now = Utc::now();
        let task = Task {
            id: task_id.clone(),
            server_id: server_id.to_owned(),
            kind: kind.to_owned(),
            params,
            status: TaskStatus::Active,
            history: Vec::new(),
            created_at: now,
            last_modified: now,
        };

        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.tasks.insert(
            task_id.clone(),
            TaskRecord {
                task: task.clone(),
                last_seq: 0,
                gc_after: None,
            },
        );

        // Apply any events that beat us to the registry.
        if let Some(pending) = inner.pending.remove(&task_id) {
            for event in pending.events {
                Self::apply_event(&mut inner, event, &self.config);
            }
        }

        info!(task = %task_id, server_id, kind, "task dispatched");
        let stored = inner.tasks.get(&task_id).map(|record| record.task.clone());
        Ok(stored.unwrap_or(task))
    }

    /// Read the current state of a task.
    pub fn get_task(&self, id: &str) -> Result<Task> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .tasks
            .get(id)
            .map(|record| record.task.clone())
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    /// Tasks for a server, newest first.
    pub fn list_task_history(&self, server_id: &str) -> Vec<Task> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|record| record.task.server_id == server_id)
            .map(|record| record.task.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }

    /// Block until the task is terminal or the timeout elapses.
    ///
    /// A task that is already terminal resolves immediately. On timeout the
    /// current (still active) task is returned as [`WaitOutcome::TimedOut`];
    /// the task itself is unaffected.
    pub async fn wait_task(&self, id: &str, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let rx = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            let record = inner
                .tasks
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            if record.task.status.is_terminal() {
                return Ok(WaitOutcome::Completed(record.task.clone()));
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(id.to_owned()).or_default().push(tx);
            rx
        };

        let timeout = timeout.unwrap_or(self.config.default_wait_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(task)) => Ok(WaitOutcome::Completed(task)),
            Ok(Err(_)) => Err(Error::Internal(anyhow!(
                "task notification channel closed"
            ))),
            Err(_) => {
                // The wake may have raced the deadline; report whichever
                // state is current.
                let task = self.get_task(id)?;
                if task.status.is_terminal() {
                    Ok(WaitOutcome::Completed(task))
                } else {
                    Ok(WaitOutcome::TimedOut(task))
                }
            }
        }
    }

    /// Administrative override for a task whose agent never reported back:
    /// force `failure` with a synthesized history entry and wake waiters.
    pub fn force_fail(&self, id: &str, reason: &str) -> Result<Task> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let now = Utc::now();
        let retention = chrono_duration(self.config.retention);

        let record = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        if record.task.status.is_terminal() {
            return Err(Error::Conflict(format!("task {id} is already terminal")));
        }

        record.task.status = TaskStatus::Failure;
        record.task.history.push(HistoryEntry {
            timestamp: now,
            event: "error".to_owned(),
            detail: json!({"message": reason, "synthesized": true}),
        });
        record.task.last_modified = now;
        record.gc_after = Some(now + retention);
        let task = record.task.clone();

        warn!(task = %id, reason, "task force-failed");
        Self::wake_waiters(&mut inner, id, &task);
        Ok(task)
    }

    /// Apply one agent event. Called from the event pump.
    pub(crate) fn apply(&self, event: AgentEvent) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.tasks.contains_key(event.task_id()) {
            Self::apply_event(&mut inner, event, &self.config);
        } else {
            // The dispatching call has not stored the record yet; hold the
            // event until it does.
            inner
                .pending
                .entry(event.task_id().to_owned())
                .or_insert_with(|| PendingEvents {
                    events: Vec::new(),
                    since: Utc::now(),
                })
                .events
                .push(event);
        }
    }

    fn apply_event(inner: &mut Inner, event: AgentEvent, config: &TaskConfig) {
        match event {
            AgentEvent::Progress {
                task_id,
                seq,
                event,
                detail,
            } => {
                let Some(record) = inner.tasks.get_mut(&task_id) else {
                    return;
                };
                if record.task.status.is_terminal() {
                    debug!(task = %task_id, "progress after terminal dropped");
                    return;
                }
                if seq <= record.last_seq {
                    debug!(task = %task_id, seq, "duplicate progress dropped");
                    return;
                }
                record.last_seq = seq;
                let now = Utc::now();
                record.task.history.push(HistoryEntry {
                    timestamp: now,
                    event,
                    detail,
                });
                record.task.last_modified = now;
            }
            AgentEvent::Terminal {
                task_id,
                status,
                result,
            } => {
                let Some(record) = inner.tasks.get_mut(&task_id) else {
                    return;
                };
                if record.task.status.is_terminal() {
                    warn!(task = %task_id, "duplicate terminal dropped");
                    return;
                }
                let now = Utc::now();
                record.task.status = status.into();
                record.task.history.push(HistoryEntry {
                    timestamp: now,
                    event: match status {
                        TerminalStatus::Complete => "finish".to_owned(),
                        TerminalStatus::Failure => "error".to_owned(),
                    },
                    detail: result,
                });
                record.task.last_modified = now;
                record.gc_after = Some(now + chrono_duration(config.retention));
                let task = record.task.clone();
                Self::wake_waiters(inner, &task_id, &task);
            }
        }
    }

    fn wake_waiters(inner: &mut Inner, id: &str, task: &Task) {
        if let Some(waiters) = inner.waiters.remove(id) {
            for tx in waiters {
                // A closed receiver just means the client went away.
                let _ = tx.send(task.clone());
            }
        }
    }

    /// One sweep pass: GC terminal tasks past retention, drop stale
    /// pending-event buffers, force-fail abandoned tasks.
    pub(crate) fn sweep(&self, now: DateTime<Utc>) {
        let abandon_after = chrono_duration(self.config.abandon_after);
        let abandoned: Vec<String> = {
            let mut guard = self.inner.lock().expect("registry lock poisoned");
            let inner = &mut *guard;

            inner
                .tasks
                .retain(|_, record| record.gc_after.is_none_or(|at| at > now));
            // Waiters on GCed tasks were woken at the terminal event; what
            // remains here is disconnected clients.
            inner.waiters.retain(|_, txs| {
                txs.retain(|tx| !tx.is_closed());
                !txs.is_empty()
            });
            inner
                .pending
                .retain(|_, p| now - p.since < chrono_duration(PENDING_EVENT_WINDOW));

            inner
                .tasks
                .values()
                .filter(|record| {
                    record.task.status == TaskStatus::Active
                        && now - record.task.last_modified >= abandon_after
                })
                .map(|record| record.task.id.clone())
                .collect()
        };

        for id in abandoned {
            let _ = self.force_fail(&id, "agent never reported a terminal event");
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}
