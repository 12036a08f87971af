//! Simulated agent transport.
//!
//! Runs agent work in-process: the `nop` task kind sleeps for
//! `params.sleep` seconds (emitting a progress event first) and then
//! reports `complete`, or `failure` when `params.error` is set. Used by the
//! test suite and by standalone deployments with no real agents.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{AgentEvent, AgentTransport, TerminalStatus};
use crate::{Error, Result};

/// Task kind the simulated agent understands.
pub const KIND_NOP: &str = "nop";

/// In-process agent transport.
pub struct SimTransport {
    events: mpsc::Sender<AgentEvent>,
    /// When set, dispatch to servers outside this set fails with NotFound.
    servers: Option<HashSet<String>>,
    /// Per-server cancellation roots; `cancel_pending` cancels and replaces
    /// a server's root, draining its in-flight work.
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl SimTransport {
    /// Build a transport that accepts dispatch to any server.
    pub fn new(events: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            events,
            servers: None,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Build a transport with a fixed server inventory.
    pub fn with_servers<I, S>(events: mpsc::Sender<AgentEvent>, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events,
            servers: Some(servers.into_iter().map(Into::into).collect()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    fn work_token(&self, server_id: &str) -> CancellationToken {
        let mut cancels = self.cancels.lock().expect("transport lock poisoned");
        cancels
            .entry(server_id.to_owned())
            .or_insert_with(CancellationToken::new)
            .child_token()
    }
}

#[async_trait]
impl AgentTransport for SimTransport {
    async fn dispatch(&self, server_id: &str, kind: &str, params: &Value) -> Result<String> {
        if let Some(known) = &self.servers {
            if !known.contains(server_id) {
                return Err(Error::NotFound(format!("server {server_id}")));
            }
        }
        if kind != KIND_NOP {
            return Err(Error::AgentRejected(format!(
                "unsupported task kind {kind:?}"
            )));
        }

        let sleep = params.get("sleep").and_then(Value::as_f64).unwrap_or(0.0);
        let fail = params
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let task_id = Uuid::new_v4().to_string();
        let cancel = self.work_token(server_id);
        let events = self.events.clone();
        let id = task_id.clone();

        tokio::spawn(async move {
            let _ = events
                .send(AgentEvent::Progress {
                    task_id: id.clone(),
                    seq: 1,
                    event: "start".to_owned(),
                    detail: json!({}),
                })
                .await;

            // Clamp to a day so a bogus parameter cannot overflow the timer.
            let work = Duration::from_secs_f64(sleep.clamp(0.0, 86_400.0));
            tokio::select! {
                _ = tokio::time::sleep(work) => {}
                _ = cancel.cancelled() => {
                    debug!(task_id = %id, "simulated work canceled");
                    let _ = events
                        .send(AgentEvent::Terminal {
                            task_id: id,
                            status: TerminalStatus::Failure,
                            result: json!({"error": "canceled"}),
                        })
                        .await;
                    return;
                }
            }

            let (status, result) = match fail {
                Some(message) => (TerminalStatus::Failure, json!({"error": message})),
                None => (TerminalStatus::Complete, json!({})),
            };
            let _ = events
                .send(AgentEvent::Terminal {
                    task_id: id,
                    status,
                    result,
                })
                .await;
        });

        Ok(task_id)
    }

    async fn cancel_pending(&self, server_id: &str) -> Result<()> {
        let token = {
            let mut cancels = self.cancels.lock().expect("transport lock poisoned");
            cancels.remove(server_id)
        };
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nop_completes_with_progress_then_terminal() {
        let (tx, mut rx) = mpsc::channel(16);
        let transport = SimTransport::new(tx);

        let task_id = transport
            .dispatch("s1", KIND_NOP, &json!({}))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            AgentEvent::Progress { task_id: id, seq, .. } => {
                assert_eq!(id, task_id);
                assert_eq!(seq, 1);
            }
            other => panic!("expected progress, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            AgentEvent::Terminal { status, .. } => {
                assert_eq!(status, TerminalStatus::Complete)
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_param_fails_the_task() {
        let (tx, mut rx) = mpsc::channel(16);
        let transport = SimTransport::new(tx);

        transport
            .dispatch("s1", KIND_NOP, &json!({"error": "die"}))
            .await
            .unwrap();

        // Skip the progress event.
        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            AgentEvent::Terminal { status, result, .. } => {
                assert_eq!(status, TerminalStatus::Failure);
                assert_eq!(result["error"], "die");
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let (tx, _rx) = mpsc::channel(16);
        let transport = SimTransport::with_servers(tx, ["known"]);

        let err = transport
            .dispatch("mystery", KIND_NOP, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let (tx, _rx) = mpsc::channel(16);
        let transport = SimTransport::new(tx);

        let err = transport
            .dispatch("s1", "machine_create", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentRejected(_)));
    }

    #[tokio::test]
    async fn cancel_pending_drains_in_flight_work() {
        let (tx, mut rx) = mpsc::channel(16);
        let transport = SimTransport::new(tx);

        transport
            .dispatch("s1", KIND_NOP, &json!({"sleep": 30}))
            .await
            .unwrap();
        rx.recv().await.unwrap(); // progress

        transport.cancel_pending("s1").await.unwrap();

        match rx.recv().await.unwrap() {
            AgentEvent::Terminal { status, result, .. } => {
                assert_eq!(status, TerminalStatus::Failure);
                assert_eq!(result["error"], "canceled");
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }
}
