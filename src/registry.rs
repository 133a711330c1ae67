//! Task registry: the fixed map from task type to handler.
//!
//! Built once at startup from an explicit list of `(task_type, handler)`
//! pairs and shared read-only by the enqueuer and the runner. Registering
//! the same task type twice is a startup error.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{Arguments, TaskId};

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl TaskContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Failure reported by a handler.
///
/// Transient failures are retried with backoff; permanent ones dead-letter
/// the task immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    Transient(String),
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl fmt::Display) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn permanent(msg: impl fmt::Display) -> Self {
        Self::Permanent(msg.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient: {msg}"),
            Self::Permanent(msg) => write!(f, "permanent: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(format!("{e:#}"))
    }
}

impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        match e {
            // Arguments that don't fit the handler won't fit next time either.
            Error::Validation(msg) => Self::Permanent(msg),
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Executes one task type.
///
/// Delivery is at-least-once: a handler may see the same task again after a
/// worker crash, so it must tolerate reprocessing.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        ctx: TaskContext,
        arguments: Arguments,
    ) -> std::result::Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn run(
        &self,
        ctx: TaskContext,
        arguments: Arguments,
    ) -> std::result::Result<(), HandlerError> {
        (self.0)(ctx, arguments).await
    }
}

/// Registry of task handlers, indexed by task type.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl TaskRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build from an explicit list of pairs.
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Arc<dyn TaskHandler>)>,
    {
        let mut builder = Self::builder();
        for (task_type, handler) in pairs {
            builder = builder.register_arc(task_type, handler)?;
        }
        Ok(builder.build())
    }

    /// Look up a handler by task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Accumulates registrations; rejects duplicates as they arrive.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("task_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RegistryBuilder {
    pub fn register<H>(self, task_type: impl Into<String>, handler: H) -> Result<Self>
    where
        H: TaskHandler + 'static,
    {
        self.register_arc(task_type, Arc::new(handler))
    }

    pub fn register_arc(
        mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self> {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(Error::Config("task type must not be empty".to_string()));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(Error::DuplicateTaskType(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(self)
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_handler() -> impl TaskHandler {
        handler_fn(|_ctx, _args| async { Ok(()) })
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let err = TaskRegistry::builder()
            .register("send_digest", ok_handler())
            .unwrap()
            .register("send_digest", ok_handler())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTaskType(t) if t == "send_digest"));
    }

    #[test]
    fn from_pairs_rejects_duplicates() {
        let h: Arc<dyn TaskHandler> = Arc::new(ok_handler());
        let result = TaskRegistry::from_pairs(vec![
            ("a".to_string(), Arc::clone(&h)),
            ("a".to_string(), h),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn lookup_by_task_type() {
        let registry = TaskRegistry::builder()
            .register("b", ok_handler())
            .unwrap()
            .register("a", ok_handler())
            .unwrap()
            .build();
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.task_types(), vec!["a", "b"]);
    }

    #[test]
    fn empty_task_type_is_a_config_error() {
        let err = TaskRegistry::builder().register(" ", ok_handler()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn closure_handler_runs() {
        let handler = handler_fn(|ctx: TaskContext, _args| async move {
            if ctx.attempt < 2 {
                Err(HandlerError::transient("not yet"))
            } else {
                Ok(())
            }
        });
        let ctx = TaskContext {
            task_id: TaskId(1),
            task_type: "t".into(),
            attempt: 1,
            max_attempts: 3,
        };
        assert!(handler.run(ctx.clone(), Arguments::empty()).await.is_err());
        let ctx = TaskContext { attempt: 2, ..ctx };
        assert!(handler.run(ctx, Arguments::empty()).await.is_ok());
    }

    #[test]
    fn validation_errors_become_permanent() {
        let e: HandlerError = Error::Validation("missing user_id".into()).into();
        assert!(e.is_permanent());
        let e: HandlerError = anyhow::anyhow!("smtp timeout").into();
        assert!(!e.is_permanent());
    }
}
