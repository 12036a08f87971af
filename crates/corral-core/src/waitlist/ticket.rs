//! The waitlist ticket: a durable token granting entry to a
//! (server, scope) critical section.

use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use corral_store::StoredObject;

use crate::Result;

/// Store bucket holding all waitlist tickets, keyed by ticket uuid.
pub const TICKETS_BUCKET: &str = "cnapi_waitlist_tickets";

/// Status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Queued,
    Active,
    Finished,
    Expired,
}

impl TicketStatus {
    /// Terminal statuses are absorbing: once set they never change.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = TicketStatusParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "finished" => Ok(Self::Finished),
            "expired" => Ok(Self::Expired),
            other => Err(TicketStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TicketStatus`] string.
#[derive(Debug, Clone)]
pub struct TicketStatusParseError(pub String);

impl fmt::Display for TicketStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ticket status: {:?}", self.0)
    }
}

impl std::error::Error for TicketStatusParseError {}

/// Identity of one waitlist queue. Tickets with the same key contend for
/// the same critical section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub server_id: String,
    pub scope: String,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.scope)
    }
}

/// A durable waitlist ticket.
///
/// Timestamps serialize in a fixed-width format so the store can order
/// tickets lexicographically by `created_at`; ties break on the uuid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub uuid: Uuid,
    pub server_id: String,
    pub scope: String,
    /// Resource identity within the scope (e.g. a VM uuid).
    pub id: String,
    pub status: TicketStatus,
    #[serde(with = "crate::timestamp")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "crate::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Ticket {
    /// Key the ticket is stored under.
    pub fn storage_key(&self) -> String {
        self.uuid.to_string()
    }

    pub fn queue_key(&self) -> QueueKey {
        QueueKey {
            server_id: self.server_id.clone(),
            scope: self.scope.clone(),
        }
    }

    pub(crate) fn to_doc(&self) -> Result<Value> {
        serde_json::to_value(self)
            .context("failed to serialize ticket")
            .map_err(Into::into)
    }

    pub(crate) fn from_object(object: &StoredObject) -> Result<Self> {
        serde_json::from_value(object.value.clone())
            .with_context(|| format!("corrupt ticket document {}", object.key))
            .map_err(Into::into)
    }
}
