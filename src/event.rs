//! Structured history recorded by the store on every task transition.
//!
//! Events are the queue's audit trail: `snappea show` prints them, and
//! tests use them to observe retries that the final row state hides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{TaskId, WorkerId};

/// A recorded task event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number across all tasks.
    pub seq: i64,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Enqueued {
        task_type: String,
        not_before: DateTime<Utc>,
    },
    /// A second enqueue hit a live task with the same idempotency key.
    Deduplicated {
        idempotency_key: String,
    },
    Claimed {
        worker: WorkerId,
        attempt: u32,
        /// True when taken over from an expired lease.
        reclaimed: bool,
    },
    Completed {
        attempt: u32,
    },
    RetryScheduled {
        attempt: u32,
        not_before: DateTime<Utc>,
        error: String,
    },
    DeadLettered {
        attempt: u32,
        reason: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Enqueued { .. } => "enqueued",
            EventKind::Deduplicated { .. } => "deduplicated",
            EventKind::Claimed { .. } => "claimed",
            EventKind::Completed { .. } => "completed",
            EventKind::RetryScheduled { .. } => "retry_scheduled",
            EventKind::DeadLettered { .. } => "dead_lettered",
        }
    }
}
