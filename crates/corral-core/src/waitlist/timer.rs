//! Deadline bookkeeping for ticket expiry.
//!
//! A min-heap of (deadline, queue) entries shared between the queue workers
//! (which schedule deadlines) and the single driver task in
//! [`super::Waitlist`] (which sleeps until the nearest one and fires queue
//! reconciles). Entries for tickets that are already terminal by the time
//! they fire are harmless -- the reconcile is a no-op.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::ticket::QueueKey;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: DateTime<Utc>,
    key: QueueKey,
}

#[derive(Default)]
pub(crate) struct ExpiryTimer {
    heap: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    notify: Notify,
}

impl ExpiryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a deadline for a queue and nudge the driver so it can re-arm if
    /// this one is nearer than what it is sleeping on.
    pub fn schedule(&self, deadline: DateTime<Utc>, key: QueueKey) {
        self.heap
            .lock()
            .expect("timer lock poisoned")
            .push(Reverse(TimerEntry { deadline, key }));
        self.notify.notify_one();
    }

    /// The nearest scheduled deadline, if any.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.heap
            .lock()
            .expect("timer lock poisoned")
            .peek()
            .map(|Reverse(entry)| entry.deadline)
    }

    /// Pop every queue whose deadline has passed, de-duplicated.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<QueueKey> {
        let mut heap = self.heap.lock().expect("timer lock poisoned");
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            if !due.contains(&entry.key) {
                due.push(entry.key);
            }
        }
        due
    }

    /// Resolves when a new deadline is scheduled.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}
