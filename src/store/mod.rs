//! Task store contract.
//!
//! The store is the single source of truth for task state. Two backends
//! implement it: [`crate::db::Db`] (Postgres) and [`MemoryStore`] (in-process).
//!
//! Every write that acts on a claimed task is conditional on the caller still
//! owning the lease. A worker whose lease was taken over gets
//! [`Error::LeaseLost`](crate::error::Error::LeaseLost) and must drop the task.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::event::Event;
use crate::model::{NewTask, Status, SubmitResult, Task, TaskId, WorkerId};

/// Reason recorded when an orphaned task had no attempts left.
pub const ORPHAN_EXHAUSTED_REASON: &str = "lease expired on final attempt";

/// Parameters for one claim-next call.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub owner: WorkerId,
    /// Upper bound on tasks returned.
    pub capacity: usize,
    /// How long the new leases last.
    pub lease: chrono::Duration,
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.now + self.lease
    }
}

/// Filter for listing tasks. Results are newest first.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<Status>,
    pub task_type: Option<String>,
    pub limit: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            limit: 50,
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task, or return the live task holding its idempotency key.
    async fn insert(&self, new: &NewTask, now: DateTime<Utc>) -> Result<SubmitResult>;

    async fn get(&self, id: TaskId) -> Result<Task>;

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Atomically lease up to `capacity` eligible tasks, oldest `not_before`
    /// first, ties by id. Increments `attempts` on each claimed task.
    ///
    /// Expired leases on tasks with no attempts left are dead-lettered in the
    /// same step rather than handed out again.
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Vec<Task>>;

    /// Push the lease expiry forward while a handler is still running.
    async fn renew_lease(
        &self,
        id: TaskId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_done(&self, id: TaskId, owner: &WorkerId, now: DateTime<Utc>) -> Result<()>;

    /// Return the task to `pending`, eligible again at `not_before`.
    async fn mark_failed_retry(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_dead(
        &self,
        id: TaskId,
        owner: &WorkerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Dead-letter a task that has not been claimed yet.
    async fn cancel(&self, id: TaskId, reason: &str, now: DateTime<Utc>) -> Result<()>;

    /// Event history for one task, in sequence order.
    async fn events_for(&self, id: TaskId) -> Result<Vec<Event>>;

    /// Block until new work may be available, or `max_wait` elapses.
    async fn wait_for_work(&self, max_wait: Duration);

    /// Trivial round trip, used by the health reporter.
    async fn ping(&self) -> Result<()>;
}
