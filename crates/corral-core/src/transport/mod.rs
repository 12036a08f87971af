//! The agent transport -- the adapter interface to on-host agents.
//!
//! `dispatch` hands work to the agent on a named server and returns the
//! task id the agent accepted it under. Everything the agent reports back
//! afterwards flows over an `mpsc` channel of [`AgentEvent`]s that the task
//! registry consumes; for a single task, every `Progress` event precedes
//! the one `Terminal` event.

pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Terminal outcome an agent reports for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Complete,
    Failure,
}

/// An event reported by an agent about a dispatched task.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental progress. `seq` increases per task so redelivered
    /// events can be dropped.
    Progress {
        task_id: String,
        seq: u64,
        event: String,
        detail: Value,
    },
    /// The single terminal report for a task.
    Terminal {
        task_id: String,
        status: TerminalStatus,
        result: Value,
    },
}

impl AgentEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress { task_id, .. } | Self::Terminal { task_id, .. } => task_id,
        }
    }
}

/// Adapter interface for handing work to on-host agents.
///
/// # Object Safety
///
/// The trait is object-safe so deployments can select a transport at
/// runtime and share it as `Arc<dyn AgentTransport>`.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Hand work to the agent on `server_id`. Returns once the agent has
    /// accepted it, with the task id the agent assigned.
    ///
    /// Errors: [`crate::Error::NotFound`] for an unknown server,
    /// [`crate::Error::AgentUnreachable`] when the agent cannot be reached,
    /// [`crate::Error::AgentRejected`] when it refuses the work.
    async fn dispatch(&self, server_id: &str, kind: &str, params: &Value) -> Result<String>;

    /// Drain work that is queued on the agent but not yet running. Used by
    /// administrative "pause agent" flows.
    async fn cancel_pending(&self, server_id: &str) -> Result<()>;
}

// Compile-time assertion: AgentTransport must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentTransport) {}
};
