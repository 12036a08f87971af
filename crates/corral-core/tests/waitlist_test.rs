//! Integration tests for the waitlist scheduler: FIFO ordering, promotion
//! on release, deadline expiry (from both queued and active), long-poll
//! waits, listing, bulk delete, and restart recovery -- all against the
//! in-memory store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corral_core::Error;
use corral_core::config::WaitlistConfig;
use corral_core::waitlist::{
    ListTickets, TICKETS_BUCKET, Ticket, TicketStatus, Waitlist,
};
use corral_store::ObjectStore;
use corral_store::memory::MemoryStore;
use corral_test_utils::{TestHarness, in_future, ticket_request};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SCOPE: &str = "vm-provision";

/// Space out consecutive creates so FIFO order comes from `created_at`
/// rather than the same-millisecond uuid tie-break.
async fn next_tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// Seed a ticket document directly into the store, bypassing the
/// scheduler. Used for recovery and tie-break scenarios.
async fn seed_ticket(store: &MemoryStore, ticket: &Ticket) {
    store
        .put(
            TICKETS_BUCKET,
            &ticket.storage_key(),
            serde_json::to_value(ticket).expect("ticket serializes"),
            None,
        )
        .await
        .expect("seed put should succeed");
}

fn raw_ticket(uuid: Uuid, server: &str, created_offset_ms: i64, ttl: Duration) -> Ticket {
    let created = Utc::now() + chrono::Duration::milliseconds(created_offset_ms);
    Ticket {
        uuid,
        server_id: server.to_owned(),
        scope: SCOPE.to_owned(),
        id: "vm-1".to_owned(),
        status: TicketStatus::Queued,
        expires_at: in_future(ttl),
        created_at: created,
        updated_at: created,
        action: None,
        extra: None,
    }
}

// ---------------------------------------------------------------------------
// Creation, FIFO, promotion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lone_ticket_is_promoted_on_create() {
    let harness = TestHarness::start().await;

    let created = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .expect("create should succeed");

    assert_eq!(created.ticket.status, TicketStatus::Active);
    assert_eq!(created.queue.len(), 1);
    assert_eq!(created.queue[0].uuid, created.ticket.uuid);
}

#[tokio::test]
async fn second_ticket_queues_behind_the_head() {
    let harness = TestHarness::start().await;

    let first = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    next_tick().await;
    let second = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(second.ticket.status, TicketStatus::Queued);
    // The queue snapshot lists strictly by created_at ascending.
    let statuses: Vec<TicketStatus> = second.queue.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TicketStatus::Active, TicketStatus::Queued]);
    assert_eq!(second.queue[0].uuid, first.ticket.uuid);
    assert_eq!(second.queue[1].uuid, second.ticket.uuid);
}

#[tokio::test]
async fn scopes_are_independent_queues() {
    let harness = TestHarness::start().await;

    let a = harness
        .waitlist
        .create_ticket(ticket_request("s1", "vm-provision", "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    let b = harness
        .waitlist
        .create_ticket(ticket_request("s1", "dataset-import", "pool0", Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(a.ticket.status, TicketStatus::Active);
    assert_eq!(b.ticket.status, TicketStatus::Active);
}

#[tokio::test]
async fn create_then_get_returns_equal_record() {
    let harness = TestHarness::start().await;

    let created = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    let fetched = harness.waitlist.get_ticket(created.ticket.uuid).await.unwrap();
    assert_eq!(fetched, created.ticket);
}

#[tokio::test]
async fn release_finishes_and_promotes_next() {
    let harness = TestHarness::start().await;

    let first = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    next_tick().await;
    let second = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();

    let released = harness
        .waitlist
        .release_ticket(first.ticket.uuid)
        .await
        .expect("release should succeed");
    assert_eq!(released.status, TicketStatus::Finished);

    let promoted = harness
        .waitlist
        .wait_ticket(second.ticket.uuid, Some(Duration::from_secs(2)))
        .await
        .expect("promotion should wake the waiter");
    assert_eq!(promoted.status, TicketStatus::Active);
}

#[tokio::test]
async fn double_release_is_not_active() {
    let harness = TestHarness::start().await;

    let created = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();

    harness.waitlist.release_ticket(created.ticket.uuid).await.unwrap();
    let err = harness
        .waitlist
        .release_ticket(created.ticket.uuid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotActive(_)));
}

#[tokio::test]
async fn releasing_a_queued_ticket_never_promotes_it() {
    let harness = TestHarness::start().await;

    harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    next_tick().await;
    let queued = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();

    let err = harness
        .waitlist
        .release_ticket(queued.ticket.uuid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotActive(_)));
    let still = harness.waitlist.get_ticket(queued.ticket.uuid).await.unwrap();
    assert_eq!(still.status, TicketStatus::Queued);
}

#[tokio::test]
async fn unknown_ticket_is_not_found() {
    let harness = TestHarness::start().await;
    let uuid = Uuid::new_v4();

    assert!(matches!(
        harness.waitlist.get_ticket(uuid).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        harness.waitlist.release_ticket(uuid).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        harness.waitlist.wait_ticket(uuid, None).await,
        Err(Error::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_head_promotes_the_next_ticket() {
    let harness = TestHarness::start().await;

    let first = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_millis(400)))
        .await
        .unwrap();
    next_tick().await;
    let second = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.waitlist.get_ticket(first.ticket.uuid).await.unwrap().status,
        TicketStatus::Active
    );
    assert_eq!(
        harness.waitlist.get_ticket(second.ticket.uuid).await.unwrap().status,
        TicketStatus::Queued
    );

    // The deadline timer must expire the head and promote the successor
    // without any further API traffic.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(
        harness.waitlist.get_ticket(first.ticket.uuid).await.unwrap().status,
        TicketStatus::Expired
    );
    assert_eq!(
        harness.waitlist.get_ticket(second.ticket.uuid).await.unwrap().status,
        TicketStatus::Active
    );
}

#[tokio::test]
async fn queued_ticket_expires_without_ever_running() {
    let harness = TestHarness::start().await;

    let head = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    next_tick().await;
    let doomed = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_millis(300)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(
        harness.waitlist.get_ticket(doomed.ticket.uuid).await.unwrap().status,
        TicketStatus::Expired
    );
    // The head is untouched by its neighbor's deadline.
    assert_eq!(
        harness.waitlist.get_ticket(head.ticket.uuid).await.unwrap().status,
        TicketStatus::Active
    );
}

#[tokio::test]
async fn expiry_wakes_waiters_on_the_expired_ticket() {
    let harness = TestHarness::start().await;

    harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    next_tick().await;
    let doomed = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_millis(300)))
        .await
        .unwrap();

    let woken = harness
        .waitlist
        .wait_ticket(doomed.ticket.uuid, Some(Duration::from_secs(5)))
        .await
        .expect("expiry should wake the waiter");
    assert_eq!(woken.status, TicketStatus::Expired);
}

// ---------------------------------------------------------------------------
// Wait semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_on_active_or_terminal_returns_immediately() {
    let harness = TestHarness::start().await;

    let active = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();

    let started = Instant::now();
    let got = harness
        .waitlist
        .wait_ticket(active.ticket.uuid, None)
        .await
        .unwrap();
    assert_eq!(got.status, TicketStatus::Active);
    assert!(started.elapsed() < Duration::from_millis(50));

    harness.waitlist.release_ticket(active.ticket.uuid).await.unwrap();
    let started = Instant::now();
    let got = harness
        .waitlist
        .wait_ticket(active.ticket.uuid, None)
        .await
        .unwrap();
    assert_eq!(got.status, TicketStatus::Finished);
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn wait_timeout_leaves_the_ticket_untouched() {
    let harness = TestHarness::start().await;

    harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    next_tick().await;
    let queued = harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();

    let started = Instant::now();
    let err = harness
        .waitlist
        .wait_ticket(queued.ticket.uuid, Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(200) && elapsed < Duration::from_secs(2),
        "waiter deadline was not honored: {elapsed:?}"
    );

    assert_eq!(
        harness.waitlist.get_ticket(queued.ticket.uuid).await.unwrap().status,
        TicketStatus::Queued
    );
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_is_created_at_ascending_with_filters() {
    let harness = TestHarness::start().await;

    let mut uuids = Vec::new();
    for i in 0..3 {
        let created = harness
            .waitlist
            .create_ticket(ticket_request(
                "s1",
                SCOPE,
                &format!("vm-{i}"),
                Duration::from_secs(30),
            ))
            .await
            .unwrap();
        uuids.push(created.ticket.uuid);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    harness
        .waitlist
        .create_ticket(ticket_request("s2", SCOPE, "vm-9", Duration::from_secs(30)))
        .await
        .unwrap();

    let listed = harness
        .waitlist
        .list_tickets("s1", &ListTickets::default())
        .await
        .unwrap();
    let got: Vec<Uuid> = listed.iter().map(|t| t.uuid).collect();
    assert_eq!(got, uuids, "listing must be created_at ascending");

    let queued_only = harness
        .waitlist
        .list_tickets(
            "s1",
            &ListTickets {
                status: Some(TicketStatus::Queued),
                ..ListTickets::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(queued_only.len(), 2);

    let scoped = harness
        .waitlist
        .list_tickets(
            "s1",
            &ListTickets {
                scope: Some("no-such-scope".into()),
                ..ListTickets::default()
            },
        )
        .await
        .unwrap();
    assert!(scoped.is_empty());
}

#[tokio::test]
async fn list_rejects_out_of_range_limits() {
    let harness = TestHarness::start().await;

    for limit in [0, 1001, usize::MAX] {
        let err = harness
            .waitlist
            .list_tickets(
                "s1",
                &ListTickets {
                    limit: Some(limit),
                    ..ListTickets::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadParam(_)), "limit {limit} must fail");
    }

    // The boundary values themselves are fine.
    for limit in [1, 1000] {
        harness
            .waitlist
            .list_tickets(
                "s1",
                &ListTickets {
                    limit: Some(limit),
                    ..ListTickets::default()
                },
            )
            .await
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Bulk delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_without_force_conflicts_while_active() {
    let harness = TestHarness::start().await;

    harness
        .waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();

    let err = harness.waitlist.delete_tickets("s1", false).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let deleted = harness.waitlist.delete_tickets("s1", true).await.unwrap();
    assert_eq!(deleted, 1);
    assert!(
        harness
            .waitlist
            .list_tickets("s1", &ListTickets::default())
            .await
            .unwrap()
            .is_empty()
    );
}

// ---------------------------------------------------------------------------
// Recovery & ordering ties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recovery_promotes_and_expires_seeded_state() {
    let store = Arc::new(MemoryStore::new());

    // A queue left behind by a dead process: the head expired while it was
    // down, the successor is still queued.
    let mut expired_head = raw_ticket(Uuid::new_v4(), "s1", -2000, Duration::ZERO);
    expired_head.expires_at = Utc::now() - chrono::Duration::seconds(1);
    seed_ticket(&store, &expired_head).await;

    let successor = raw_ticket(Uuid::new_v4(), "s1", -1000, Duration::from_secs(30));
    seed_ticket(&store, &successor).await;

    let harness = TestHarness::with_store(store).await;

    assert_eq!(
        harness.waitlist.get_ticket(expired_head.uuid).await.unwrap().status,
        TicketStatus::Expired
    );
    assert_eq!(
        harness.waitlist.get_ticket(successor.uuid).await.unwrap().status,
        TicketStatus::Active
    );
}

#[tokio::test]
async fn recovery_keeps_an_active_ticket_active() {
    let store = Arc::new(MemoryStore::new());

    let mut holder = raw_ticket(Uuid::new_v4(), "s1", -2000, Duration::from_secs(30));
    holder.status = TicketStatus::Active;
    seed_ticket(&store, &holder).await;
    let waiting = raw_ticket(Uuid::new_v4(), "s1", -1000, Duration::from_secs(30));
    seed_ticket(&store, &waiting).await;

    let harness = TestHarness::with_store(store).await;

    // The owner may still release it; recovery must not double-promote.
    assert_eq!(
        harness.waitlist.get_ticket(holder.uuid).await.unwrap().status,
        TicketStatus::Active
    );
    assert_eq!(
        harness.waitlist.get_ticket(waiting.uuid).await.unwrap().status,
        TicketStatus::Queued
    );
}

#[tokio::test]
async fn same_millisecond_ties_break_by_uuid() {
    let store = Arc::new(MemoryStore::new());

    let low = Uuid::parse_str("00000000-0000-4000-8000-000000000001").unwrap();
    let high = Uuid::parse_str("ffffffff-ffff-4fff-bfff-fffffffffffe").unwrap();
    let mut a = raw_ticket(high, "s1", -1000, Duration::from_secs(30));
    let mut b = raw_ticket(low, "s1", -1000, Duration::from_secs(30));
    // Identical creation instants: deterministic order must come from the
    // uuid, regardless of insertion order.
    b.created_at = a.created_at;
    b.updated_at = a.updated_at;
    seed_ticket(&store, &a).await;
    seed_ticket(&store, &b).await;

    let harness = TestHarness::with_store(store).await;

    a = harness.waitlist.get_ticket(high).await.unwrap();
    b = harness.waitlist.get_ticket(low).await.unwrap();
    assert_eq!(b.status, TicketStatus::Active, "lexicographically smaller uuid wins");
    assert_eq!(a.status, TicketStatus::Queued);
}

// ---------------------------------------------------------------------------
// Retention sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retention_sweep_deletes_old_terminal_tickets() {
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let config = WaitlistConfig {
        retention_window: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(50),
        ..corral_test_utils::fast_waitlist_config()
    };
    let waitlist = Waitlist::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        config,
        cancel.clone(),
    );
    waitlist.recover().await.unwrap();
    Arc::clone(&waitlist).start();

    let created = waitlist
        .create_ticket(ticket_request("s1", SCOPE, "vm-1", Duration::from_secs(30)))
        .await
        .unwrap();
    waitlist.release_ticket(created.ticket.uuid).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        matches!(
            waitlist.get_ticket(created.ticket.uuid).await,
            Err(Error::NotFound(_))
        ),
        "terminal ticket should be swept after the retention window"
    );
    cancel.cancel();
}
