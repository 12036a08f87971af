//! Task tracking: ephemeral handles to work running on agents.
//!
//! Tasks are deliberately not persisted -- the agent is authoritative for
//! execution, the registry only tracks handles so callers can poll or
//! long-poll for the outcome.

pub mod registry;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::TerminalStatus;

pub use registry::{TaskRegistry, WaitOutcome};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Complete,
    Failure,
}

impl TaskStatus {
    /// Terminal statuses are absorbing: once set they never change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failure)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "complete" => Ok(Self::Complete),
            "failure" => Ok(Self::Failure),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

impl From<TerminalStatus> for TaskStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Complete => Self::Complete,
            TerminalStatus::Failure => Self::Failure,
        }
    }
}

/// One progress entry reported by the agent. History is append-only and
/// preserves transport order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub detail: Value,
}

/// An ephemeral handle to work submitted to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub server_id: String,
    pub kind: String,
    pub params: Value,
    pub status: TaskStatus,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}
