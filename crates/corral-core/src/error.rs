use thiserror::Error;
use uuid::Uuid;

use corral_store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy of the control plane.
///
/// Store etag conflicts never appear here: they are retried internally and
/// escalate to [`Error::StoreUnavailable`] when the retry budget runs out.
#[derive(Debug, Error)]
pub enum Error {
    /// Input failed validation.
    #[error("invalid parameter: {0}")]
    BadParam(String),

    /// Unknown task, ticket, or server.
    #[error("{0} not found")]
    NotFound(String),

    /// Release against a ticket that is not currently active.
    #[error("ticket {0} is not active")]
    NotActive(Uuid),

    /// The request conflicts with current state.
    #[error("{0}")]
    Conflict(String),

    /// A long-poll wait exceeded its deadline.
    #[error("wait timed out")]
    Timeout,

    /// The object store failed or kept conflicting past the retry budget.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// The on-host agent could not be reached during dispatch.
    #[error("agent on server {0} is unreachable")]
    AgentUnreachable(String),

    /// The on-host agent refused the dispatched work.
    #[error("agent rejected the task: {0}")]
    AgentRejected(String),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key, .. } => Error::NotFound(format!("object {key}")),
            other => Error::StoreUnavailable(other),
        }
    }
}
