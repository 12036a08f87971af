//! Core services of the corral control plane.
//!
//! Two subsystems do the real work: the [`tasks`] registry tracks in-flight
//! agent work and fans terminal events out to long-poll waiters, and the
//! [`waitlist`] scheduler serializes conflicting operations against a
//! compute node through per-(server, scope) ticket queues backed by the
//! object store.

pub mod config;
pub mod error;
pub mod tasks;
pub mod timestamp;
pub mod transport;
pub mod waitlist;

pub use error::{Error, Result};
