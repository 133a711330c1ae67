//! Core data model.
//!
//! A task is a unit of deferred work. It has a type (resolved against the
//! registry), JSON arguments, a lifecycle status, and lease bookkeeping for
//! whichever worker currently holds it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Attempt ceiling applied when neither the task nor the config names one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Which handler runs this task.
    pub task_type: String,

    /// Handler input. The store never looks inside.
    pub arguments: Arguments,

    pub status: Status,

    /// Executions started so far, counted at claim time.
    pub attempts: u32,

    /// Once `attempts` reaches this, the next failure dead-letters the task.
    pub max_attempts: u32,

    /// Earliest time the task may be claimed.
    pub not_before: DateTime<Utc>,

    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Diagnostic text from the most recent failed attempt.
    pub last_error: Option<String>,

    pub idempotency_key: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Does `owner` hold a lease on this task that is still live at `now`?
    pub fn is_leased_by(&self, owner: &WorkerId, now: DateTime<Utc>) -> bool {
        self.status == Status::InProgress
            && self.lease_owner.as_ref() == Some(owner)
            && self.lease_expires_at.is_some_and(|exp| exp > now)
    }

    /// Is this task eligible for claim-next at `now`?
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            Status::Pending => self.not_before <= now,
            Status::InProgress => {
                self.attempts < self.max_attempts && self.lease_expired(now)
            }
            _ => false,
        }
    }

    /// An in-progress task whose lease ran out after its final attempt.
    pub fn is_exhausted_orphan(&self, now: DateTime<Utc>) -> bool {
        self.status == Status::InProgress
            && self.attempts >= self.max_attempts
            && self.lease_expired(now)
    }

    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_none_or(|exp| exp <= now)
    }
}

/// Newtype for task IDs. Assigned by the store in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(TaskId)
            .map_err(|_| Error::Validation(format!("not a task id: {s}")))
    }
}

/// Identity of a worker process, used as the lease owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// A fresh identity: pid plus a random suffix, unique across restarts.
    pub fn new() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{}-{}", std::process::id(), &suffix[..8]))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for `not_before` and a free worker.
    Pending,
    /// Leased by a worker.
    InProgress,
    /// Handler succeeded. Terminal.
    Done,
    /// Attempt failed, retry decision pending.
    Failed,
    /// Exhausted retries or failed permanently. Terminal.
    Dead,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Dead)          // cancelled
                | (InProgress, InProgress) // reclaimed after lease expiry
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, Pending)    // retry
                | (InProgress, Dead)
                | (Failed, Pending)
                | (Failed, Dead)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Dead)
    }

    /// Statuses that block a second enqueue with the same idempotency key.
    pub fn is_live(self) -> bool {
        matches!(self, Status::Pending | Status::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Done => "done",
            Status::Failed => "failed",
            Status::Dead => "dead",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "done" => Ok(Status::Done),
            "failed" => Ok(Status::Failed),
            "dead" => Ok(Status::Dead),
            other => Err(Error::Validation(format!("unknown status: {other}"))),
        }
    }
}

/// Check a transition against the table, as an error.
pub fn validate_transition(from: Status, to: Status) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Maximum nesting depth of an argument document.
pub const MAX_ARGUMENT_DEPTH: usize = 32;

/// Maximum encoded size of an argument document, in bytes.
pub const MAX_ARGUMENT_BYTES: usize = 256 * 1024;

/// Task arguments: a JSON object of plain data.
///
/// Anything that serializes through serde into a bounded JSON object is
/// accepted. Scalars, arrays, and non-string map keys at the top level are not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arguments(serde_json::Map<String, serde_json::Value>);

impl Arguments {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Serialize `value` and check it against the argument contract.
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Validation(format!("arguments are not serializable: {e}")))?;
        Self::try_from(value)
    }

    /// Deserialize the arguments into a handler's own input type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_value())
            .map_err(|e| Error::Validation(format!("arguments do not match handler input: {e}")))
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<serde_json::Value> for Arguments {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = value else {
            return Err(Error::Validation(format!(
                "arguments must be a JSON object, got {}",
                json_kind(&value)
            )));
        };

        let depth = json_depth(&serde_json::Value::Object(map.clone()));
        if depth > MAX_ARGUMENT_DEPTH {
            return Err(Error::Validation(format!(
                "arguments nested {depth} levels deep (max {MAX_ARGUMENT_DEPTH})"
            )));
        }

        let size = serde_json::to_vec(&map)?.len();
        if size > MAX_ARGUMENT_BYTES {
            return Err(Error::Validation(format!(
                "arguments are {size} bytes (max {MAX_ARGUMENT_BYTES})"
            )));
        }

        Ok(Self(map))
    }
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        serde_json::Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new tasks. Validated by the enqueuer, persisted by the store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) task_type: String,
    pub(crate) arguments: Arguments,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) not_before: Option<DateTime<Utc>>,
    pub(crate) max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            arguments: Arguments::empty(),
            idempotency_key: None,
            not_before: None,
            max_attempts: None,
        }
    }

    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }
}

/// What happened when a task was inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    /// New row written.
    Created(TaskId),
    /// A live task with the same idempotency key already exists.
    Deduplicated(TaskId),
}

impl SubmitResult {
    pub fn id(self) -> TaskId {
        match self {
            SubmitResult::Created(id) | SubmitResult::Deduplicated(id) => id,
        }
    }
}
