//! Enqueuer: validates and persists new tasks.
//!
//! Checks the task type against the registry and the arguments against the
//! serialization contract before anything reaches the store. Never waits for
//! execution.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Arguments, DEFAULT_MAX_ATTEMPTS, NewTask, SubmitResult, TaskId};
use crate::registry::TaskRegistry;
use crate::store::TaskStore;
use crate::telemetry::metrics;

/// Optional knobs for [`Enqueuer::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    default_max_attempts: u32,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            store,
            registry,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Attempt ceiling for tasks that don't set their own.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Serialize `arguments` and enqueue a task. Returns the id of the new
    /// task, or of the live task already holding the idempotency key.
    pub async fn enqueue<A>(
        &self,
        task_type: &str,
        arguments: &A,
        options: EnqueueOptions,
    ) -> Result<TaskId>
    where
        A: Serialize + ?Sized,
    {
        let arguments = match Arguments::from_serializable(arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                self.count(task_type, "rejected");
                return Err(e);
            }
        };

        let mut new = NewTask::new(task_type).arguments(arguments);
        if let Some(key) = options.idempotency_key {
            new = new.idempotency_key(key);
        }
        if let Some(at) = options.not_before {
            new = new.not_before(at);
        }
        if let Some(n) = options.max_attempts {
            new = new.max_attempts(n);
        }

        Ok(self.submit(new).await?.id())
    }

    /// Persist a prepared task.
    pub async fn submit(&self, mut new: NewTask) -> Result<SubmitResult> {
        if !self.registry.contains(&new.task_type) {
            self.count(&new.task_type, "rejected");
            return Err(Error::UnknownTaskType(new.task_type));
        }
        if new.max_attempts == Some(0) {
            self.count(&new.task_type, "rejected");
            return Err(Error::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if new.idempotency_key.as_deref().is_some_and(str::is_empty) {
            self.count(&new.task_type, "rejected");
            return Err(Error::Validation(
                "idempotency key must not be empty".to_string(),
            ));
        }
        new.max_attempts.get_or_insert(self.default_max_attempts);

        match self.store.insert(&new, Utc::now()).await {
            Ok(SubmitResult::Created(id)) => {
                self.count(&new.task_type, "ok");
                info!(task_type = %new.task_type, %id, "task enqueued");
                Ok(SubmitResult::Created(id))
            }
            Ok(SubmitResult::Deduplicated(id)) => {
                self.count(&new.task_type, "duplicate");
                debug!(
                    task_type = %new.task_type,
                    %id,
                    key = new.idempotency_key.as_deref().unwrap_or_default(),
                    "enqueue deduplicated"
                );
                Ok(SubmitResult::Deduplicated(id))
            }
            Err(e) => {
                self.count(&new.task_type, "error");
                warn!(task_type = %new.task_type, error = %e, "enqueue failed");
                Err(e)
            }
        }
    }

    fn count(&self, task_type: &str, result: &'static str) {
        metrics::task_enqueued().add(
            1,
            &[
                KeyValue::new("task_type", task_type.to_string()),
                KeyValue::new("result", result),
            ],
        );
    }
}
