//! In-process task store.
//!
//! Holds everything behind one mutex, so claim-next is a single critical
//! section. Used by tests and by embedders that don't need durability.
//! [`MemoryStore::set_available`] simulates an unreachable database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use super::{ClaimRequest, ORPHAN_EXHAUSTED_REASON, TaskFilter, TaskStore};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;

#[derive(Default)]
struct Inner {
    next_id: i64,
    next_seq: i64,
    tasks: BTreeMap<TaskId, Task>,
    events: Vec<Event>,
}

impl Inner {
    fn record(&mut self, task_id: TaskId, now: DateTime<Utc>, kind: EventKind) {
        self.next_seq += 1;
        self.events.push(Event {
            seq: self.next_seq,
            task_id,
            timestamp: now,
            kind,
        });
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    /// Fetch a task the caller claims to hold, checking ownership and the
    /// requested transition.
    fn leased_mut(&mut self, id: TaskId, owner: &WorkerId, to: Status) -> Result<&mut Task> {
        let task = self.task_mut(id)?;
        if task.status != Status::InProgress || task.lease_owner.as_ref() != Some(owner) {
            return Err(Error::LeaseLost(id.to_string()));
        }
        validate_transition(task.status, to)?;
        Ok(task)
    }
}

fn release(task: &mut Task, status: Status, now: DateTime<Utc>) {
    task.status = status;
    task.lease_owner = None;
    task.lease_expires_at = None;
    task.updated_at = now;
}

/// Task store backed by process memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
    wakeup: Notify,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            wakeup: Notify::new(),
        }
    }

    /// Toggle simulated outages. While unavailable, every operation fails
    /// with [`Error::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of rows, in any status.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory store switched off".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(&self, new: &NewTask, now: DateTime<Utc>) -> Result<SubmitResult> {
        let mut inner = self.lock()?;

        if let Some(ref key) = new.idempotency_key {
            let existing = inner
                .tasks
                .values()
                .find(|t| {
                    t.status.is_live()
                        && t.task_type == new.task_type
                        && t.idempotency_key.as_deref() == Some(key.as_str())
                })
                .map(|t| t.id);
            if let Some(id) = existing {
                inner.record(
                    id,
                    now,
                    EventKind::Deduplicated {
                        idempotency_key: key.clone(),
                    },
                );
                return Ok(SubmitResult::Deduplicated(id));
            }
        }

        inner.next_id += 1;
        let id = TaskId(inner.next_id);
        let not_before = new.not_before.unwrap_or(now);
        inner.tasks.insert(
            id,
            Task {
                id,
                task_type: new.task_type.clone(),
                arguments: new.arguments.clone(),
                status: Status::Pending,
                attempts: 0,
                max_attempts: new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                not_before,
                lease_owner: None,
                lease_expires_at: None,
                last_error: None,
                idempotency_key: new.idempotency_key.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        inner.record(
            id,
            now,
            EventKind::Enqueued {
                task_type: new.task_type.clone(),
                not_before,
            },
        );
        drop(inner);

        self.wakeup.notify_one();
        Ok(SubmitResult::Created(id))
    }

    async fn get(&self, id: TaskId) -> Result<Task> {
        let inner = self.lock()?;
        inner
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .values()
            .rev()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                filter
                    .task_type
                    .as_deref()
                    .is_none_or(|ty| t.task_type == ty)
            })
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Vec<Task>> {
        let mut inner = self.lock()?;
        let now = request.now;

        let orphans: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.is_exhausted_orphan(now))
            .map(|t| t.id)
            .collect();
        for id in orphans {
            let task = inner.task_mut(id)?;
            let attempt = task.attempts;
            task.last_error = Some(ORPHAN_EXHAUSTED_REASON.to_string());
            release(task, Status::Dead, now);
            inner.record(
                id,
                now,
                EventKind::DeadLettered {
                    attempt,
                    reason: ORPHAN_EXHAUSTED_REASON.to_string(),
                },
            );
        }

        if request.capacity == 0 {
            return Ok(Vec::new());
        }

        let mut eligible: Vec<(DateTime<Utc>, TaskId)> = inner
            .tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .map(|t| (t.not_before, t.id))
            .collect();
        eligible.sort();
        eligible.truncate(request.capacity);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            let task = inner.task_mut(id)?;
            let reclaimed = task.status == Status::InProgress;
            validate_transition(task.status, Status::InProgress)?;
            task.status = Status::InProgress;
            task.attempts += 1;
            task.lease_owner = Some(request.owner.clone());
            task.lease_expires_at = Some(request.expires_at());
            task.updated_at = now;
            let snapshot = task.clone();
            inner.record(
                id,
                now,
                EventKind::Claimed {
                    worker: request.owner.clone(),
                    attempt: snapshot.attempts,
                    reclaimed,
                },
            );
            claimed.push(snapshot);
        }

        Ok(claimed)
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner.leased_mut(id, owner, Status::InProgress)?;
        task.lease_expires_at = Some(expires_at);
        task.updated_at = now;
        Ok(())
    }

    async fn mark_done(&self, id: TaskId, owner: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner.leased_mut(id, owner, Status::Done)?;
        let attempt = task.attempts;
        release(task, Status::Done, now);
        inner.record(id, now, EventKind::Completed { attempt });
        Ok(())
    }

    async fn mark_failed_retry(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner.leased_mut(id, owner, Status::Failed)?;
        validate_transition(Status::Failed, Status::Pending)?;
        let attempt = task.attempts;
        task.last_error = Some(error.to_string());
        task.not_before = not_before;
        release(task, Status::Pending, now);
        inner.record(
            id,
            now,
            EventKind::RetryScheduled {
                attempt,
                not_before,
                error: error.to_string(),
            },
        );
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: TaskId,
        owner: &WorkerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner.leased_mut(id, owner, Status::Dead)?;
        let attempt = task.attempts;
        task.last_error = Some(reason.to_string());
        release(task, Status::Dead, now);
        inner.record(
            id,
            now,
            EventKind::DeadLettered {
                attempt,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    async fn cancel(&self, id: TaskId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner.task_mut(id)?;
        if task.status != Status::Pending {
            return Err(Error::InvalidTransition {
                from: task.status,
                to: Status::Dead,
            });
        }
        let attempt = task.attempts;
        task.last_error = Some(reason.to_string());
        release(task, Status::Dead, now);
        inner.record(
            id,
            now,
            EventKind::DeadLettered {
                attempt,
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    async fn events_for(&self, id: TaskId) -> Result<Vec<Event>> {
        let inner = self.lock()?;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.task_id == id)
            .cloned()
            .collect())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.wakeup.notified()).await;
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}
