//! Task operations on Postgres: insert with dedup, claim-next, outcome writes.
//!
//! claim-next runs as one transaction: a `FOR UPDATE SKIP LOCKED` select of
//! eligible rows feeding a conditional update, so concurrent runners never
//! lease the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use sqlx::types::Json;
use std::time::Duration;

use super::{Db, WAKEUP_CHANNEL};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;
use crate::store::{ClaimRequest, ORPHAN_EXHAUSTED_REASON, TaskFilter, TaskStore};

macro_rules! task_columns {
    () => {
        "id, task_type, arguments, status, attempts, max_attempts, not_before, lease_owner, \
         lease_expires_at, last_error, idempotency_key, created_at, updated_at"
    };
}

/// Append one event row inside the caller's transaction.
async fn record_event(
    conn: &mut PgConnection,
    task_id: TaskId,
    at: DateTime<Utc>,
    kind: &EventKind,
) -> Result<()> {
    sqlx::query("INSERT INTO task_events (task_id, at, kind) VALUES ($1, $2, $3)")
        .bind(task_id.0)
        .bind(at)
        .bind(Json(kind))
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl TaskStore for Db {
    async fn insert(&self, new: &NewTask, now: DateTime<Utc>) -> Result<SubmitResult> {
        let not_before = new.not_before.unwrap_or(now);
        let max_attempts = new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS) as i32;
        let mut tx = self.pool.begin().await?;

        // A conflicting live row can finish between our INSERT and SELECT;
        // in that case the key is free again and the insert is retried.
        for _ in 0..3 {
            let inserted: Option<(i64,)> = sqlx::query_as(
                "INSERT INTO tasks (task_type, arguments, status, attempts, max_attempts, not_before, idempotency_key, created_at, updated_at)
                 VALUES ($1, $2, 'pending', 0, $3, $4, $5, $6, $6)
                 ON CONFLICT (task_type, idempotency_key)
                     WHERE idempotency_key IS NOT NULL AND status IN ('pending', 'in_progress')
                 DO NOTHING
                 RETURNING id",
            )
            .bind(&new.task_type)
            .bind(Json(&new.arguments))
            .bind(max_attempts)
            .bind(not_before)
            .bind(&new.idempotency_key)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((id,)) = inserted {
                let id = TaskId(id);
                record_event(
                    &mut tx,
                    id,
                    now,
                    &EventKind::Enqueued {
                        task_type: new.task_type.clone(),
                        not_before,
                    },
                )
                .await?;

                // NOTIFY is transactional and fires on commit
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(WAKEUP_CHANNEL)
                    .bind(&new.task_type)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                return Ok(SubmitResult::Created(id));
            }

            let Some(ref key) = new.idempotency_key else {
                return Err(Error::Other(
                    "insert without idempotency key returned no row".to_string(),
                ));
            };

            let existing: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM tasks
                 WHERE task_type = $1 AND idempotency_key = $2
                 AND status IN ('pending', 'in_progress')
                 LIMIT 1",
            )
            .bind(&new.task_type)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((id,)) = existing {
                let id = TaskId(id);
                record_event(
                    &mut tx,
                    id,
                    now,
                    &EventKind::Deduplicated {
                        idempotency_key: key.clone(),
                    },
                )
                .await?;
                tx.commit().await?;
                return Ok(SubmitResult::Deduplicated(id));
            }
        }

        Err(Error::Other(format!(
            "idempotency key for {} kept conflicting",
            new.task_type
        )))
    }

    async fn get(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(concat!("SELECT ", task_columns!(), " FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(concat!(
            "SELECT ",
            task_columns!(),
            " FROM tasks
              WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR task_type = $2)
              ORDER BY id DESC
              LIMIT $3"
        ))
        .bind(filter.status.map(Status::as_str))
        .bind(filter.task_type.as_deref())
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Vec<Task>> {
        let now = request.now;
        let mut tx = self.pool.begin().await?;

        let orphans: Vec<(i64, i32)> = sqlx::query_as(
            "UPDATE tasks
             SET status = 'dead', last_error = $1, lease_owner = NULL, lease_expires_at = NULL, updated_at = $2
             WHERE status = 'in_progress' AND lease_expires_at <= $2 AND attempts >= max_attempts
             RETURNING id, attempts",
        )
        .bind(ORPHAN_EXHAUSTED_REASON)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for (id, attempts) in orphans {
            record_event(
                &mut tx,
                TaskId(id),
                now,
                &EventKind::DeadLettered {
                    attempt: attempts as u32,
                    reason: ORPHAN_EXHAUSTED_REASON.to_string(),
                },
            )
            .await?;
        }

        if request.capacity == 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let rows: Vec<ClaimedRow> = sqlx::query_as(
            "WITH candidates AS (
                 SELECT id, status AS prev_status FROM tasks
                 WHERE (status = 'pending' AND not_before <= $1)
                    OR (status = 'in_progress' AND lease_expires_at <= $1 AND attempts < max_attempts)
                 ORDER BY not_before ASC, id ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE tasks t
             SET status = 'in_progress', attempts = t.attempts + 1,
                 lease_owner = $3, lease_expires_at = $4, updated_at = $1
             FROM candidates c
             WHERE t.id = c.id
             RETURNING t.id, t.task_type, t.arguments, t.status, t.attempts, t.max_attempts,
                       t.not_before, t.lease_owner, t.lease_expires_at, t.last_error,
                       t.idempotency_key, t.created_at, t.updated_at, c.prev_status",
        )
        .bind(now)
        .bind(request.capacity as i64)
        .bind(&request.owner.0)
        .bind(request.expires_at())
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let reclaimed = row.prev_status == Status::InProgress.as_str();
            let task = row.task.try_into_task()?;
            record_event(
                &mut tx,
                task.id,
                now,
                &EventKind::Claimed {
                    worker: request.owner.clone(),
                    attempt: task.attempts,
                    reclaimed,
                },
            )
            .await?;
            claimed.push(task);
        }

        tx.commit().await?;

        // UPDATE ... RETURNING does not preserve the CTE's order
        claimed.sort_by_key(|t| (t.not_before, t.id));
        Ok(claimed)
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        owner: &WorkerId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET lease_expires_at = $3, updated_at = $4
             WHERE id = $1 AND status = 'in_progress' AND lease_owner = $2",
        )
        .bind(id.0)
        .bind(&owner.0)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::LeaseLost(id.to_string()));
        }
        Ok(())
    }

    async fn mark_done(&self, id: TaskId, owner: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        validate_transition(Status::InProgress, Status::Done)?;

        let mut tx = self.pool.begin().await?;
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE tasks SET status = 'done', lease_owner = NULL, lease_expires_at = NULL, updated_at = $3
             WHERE id = $1 AND status = 'in_progress' AND lease_owner = $2
             RETURNING attempts",
        )
        .bind(id.0)
        .bind(&owner.0)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let (attempts,) = row.ok_or_else(|| Error::LeaseLost(id.to_string()))?;
        record_event(
            &mut tx,
            id,
            now,
            &EventKind::Completed {
                attempt: attempts as u32,
            },
        )
        .await?;
        tx.commit().await?;
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
        validate_transition(Status::InProgress, Status::Failed)?;
        validate_transition(Status::Failed, Status::Pending)?;

        let mut tx = self.pool.begin().await?;
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE tasks
             SET status = 'pending', not_before = $3, last_error = $4,
                 lease_owner = NULL, lease_expires_at = NULL, updated_at = $5
             WHERE id = $1 AND status = 'in_progress' AND lease_owner = $2
             RETURNING attempts",
        )
        .bind(id.0)
        .bind(&owner.0)
        .bind(not_before)
        .bind(error)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let (attempts,) = row.ok_or_else(|| Error::LeaseLost(id.to_string()))?;
        record_event(
            &mut tx,
            id,
            now,
            &EventKind::RetryScheduled {
                attempt: attempts as u32,
                not_before,
                error: error.to_string(),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: TaskId,
        owner: &WorkerId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        validate_transition(Status::InProgress, Status::Dead)?;

        let mut tx = self.pool.begin().await?;
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE tasks
             SET status = 'dead', last_error = $3, lease_owner = NULL, lease_expires_at = NULL, updated_at = $4
             WHERE id = $1 AND status = 'in_progress' AND lease_owner = $2
             RETURNING attempts",
        )
        .bind(id.0)
        .bind(&owner.0)
        .bind(reason)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let (attempts,) = row.ok_or_else(|| Error::LeaseLost(id.to_string()))?;
        record_event(
            &mut tx,
            id,
            now,
            &EventKind::DeadLettered {
                attempt: attempts as u32,
                reason: reason.to_string(),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel(&self, id: TaskId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE tasks SET status = 'dead', last_error = $2, updated_at = $3
             WHERE id = $1 AND status = 'pending'
             RETURNING attempts",
        )
        .bind(id.0)
        .bind(reason)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts,)) = row else {
            drop(tx);
            let current = self.get(id).await?;
            return Err(Error::InvalidTransition {
                from: current.status,
                to: Status::Dead,
            });
        };

        record_event(
            &mut tx,
            id,
            now,
            &EventKind::DeadLettered {
                attempt: attempts as u32,
                reason: reason.to_string(),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn events_for(&self, id: TaskId) -> Result<Vec<Event>> {
        let rows: Vec<(i64, i64, DateTime<Utc>, Json<EventKind>)> = sqlx::query_as(
            "SELECT seq, task_id, at, kind FROM task_events WHERE task_id = $1 ORDER BY seq ASC",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(seq, task_id, timestamp, Json(kind))| Event {
                seq,
                task_id: TaskId(task_id),
                timestamp,
                kind,
            })
            .collect())
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        self.wait_for_notify(max_wait).await;
    }

    async fn ping(&self) -> Result<()> {
        self.health_check().await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    task_type: String,
    arguments: Json<Arguments>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    not_before: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A claimed row plus the status it had before the claim.
#[derive(sqlx::FromRow)]
struct ClaimedRow {
    #[sqlx(flatten)]
    task: TaskRow,
    prev_status: String,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            task_type: self.task_type,
            arguments: self.arguments.0,
            status: self.status.parse()?,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            not_before: self.not_before,
            lease_owner: self.lease_owner.map(WorkerId),
            lease_expires_at: self.lease_expires_at,
            last_error: self.last_error,
            idempotency_key: self.idempotency_key,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
