//! Construction-time configuration for the core services.
//!
//! All tunables travel in these structs; there is no global configuration
//! state. The binary builds them from its config file, tests build them
//! directly with short durations.

use std::time::Duration;

/// Tunables for the [`crate::waitlist::Waitlist`] scheduler.
#[derive(Debug, Clone)]
pub struct WaitlistConfig {
    /// Upper bound for the `limit` parameter of ticket listings.
    pub max_limit: usize,
    /// Wait applied to ticket long-polls that carry no explicit timeout.
    pub default_wait_timeout: Duration,
    /// How many times an etag-conflicted write is retried before the
    /// conflict escalates to a store error.
    pub etag_retries: u32,
    /// Terminal tickets older than this are deleted by the sweeper.
    pub retention_window: Duration,
    /// Cadence of the retention sweeper.
    pub sweep_interval: Duration,
}

impl Default for WaitlistConfig {
    fn default() -> Self {
        Self {
            max_limit: 1000,
            default_wait_timeout: Duration::from_secs(60),
            etag_retries: 3,
            retention_window: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Tunables for the [`crate::tasks::TaskRegistry`].
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// How long a terminal task stays readable before garbage collection.
    pub retention: Duration,
    /// An active task with no agent traffic for this long is force-failed
    /// with a synthesized history entry.
    pub abandon_after: Duration,
    /// Wait applied to task long-polls that carry no explicit timeout.
    pub default_wait_timeout: Duration,
    /// Cadence of the registry sweeper.
    pub sweep_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
            abandon_after: Duration::from_secs(3600),
            default_wait_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
