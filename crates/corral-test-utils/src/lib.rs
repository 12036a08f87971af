//! Shared test harness: a fully wired control plane on the in-memory
//! store with the simulated agent transport and test-scaled timings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use corral_core::config::{TaskConfig, WaitlistConfig};
use corral_core::tasks::TaskRegistry;
use corral_core::transport::sim::SimTransport;
use corral_core::waitlist::{TicketRequest, Waitlist};
use corral_store::memory::MemoryStore;

/// Waitlist tunables scaled down so sweeps and retries complete within a
/// test run.
pub fn fast_waitlist_config() -> WaitlistConfig {
    WaitlistConfig {
        max_limit: 1000,
        default_wait_timeout: Duration::from_secs(5),
        etag_retries: 3,
        // Long enough that terminal tickets stay visible to assertions.
        retention_window: Duration::from_secs(60),
        sweep_interval: Duration::from_millis(100),
    }
}

/// Task-registry tunables scaled down the same way.
pub fn fast_task_config() -> TaskConfig {
    TaskConfig {
        retention: Duration::from_secs(60),
        abandon_after: Duration::from_secs(3600),
        default_wait_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(100),
    }
}

/// A wired-up control plane for tests. Background drivers stop when the
/// harness is dropped.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<SimTransport>,
    pub registry: Arc<TaskRegistry>,
    pub waitlist: Arc<Waitlist>,
    cancel: CancellationToken,
}

impl TestHarness {
    /// Build a harness on a fresh memory store with the default page cap.
    pub async fn start() -> Self {
        Self::with_store(Arc::new(MemoryStore::new())).await
    }

    /// Build a harness on a caller-provided store (e.g. a small page cap,
    /// or one pre-seeded for recovery tests).
    pub async fn with_store(store: Arc<MemoryStore>) -> Self {
        let cancel = CancellationToken::new();

        let (events_tx, events_rx) = mpsc::channel(256);
        let transport = Arc::new(SimTransport::new(events_tx));
        let registry = TaskRegistry::new(
            Arc::clone(&transport) as Arc<dyn corral_core::transport::AgentTransport>,
            fast_task_config(),
        );
        Arc::clone(&registry).spawn_event_pump(events_rx, cancel.child_token());
        Arc::clone(&registry).spawn_sweeper(cancel.child_token());

        let waitlist = Waitlist::new(
            Arc::clone(&store) as Arc<dyn corral_store::ObjectStore>,
            fast_waitlist_config(),
            cancel.child_token(),
        );
        waitlist
            .recover()
            .await
            .expect("waitlist recovery should succeed on a fresh store");
        Arc::clone(&waitlist).start();

        Self {
            store,
            transport,
            registry,
            waitlist,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A ticket request for `server` with everything else defaulted; `ttl` is
/// the time until expiry.
pub fn ticket_request(server: &str, scope: &str, id: &str, ttl: Duration) -> TicketRequest {
    TicketRequest {
        server_id: server.to_owned(),
        scope: scope.to_owned(),
        id: id.to_owned(),
        expires_at: in_future(ttl),
        action: None,
        extra: None,
    }
}

/// A wall-clock instant `ttl` from now.
pub fn in_future(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).expect("test ttl fits chrono range")
}
