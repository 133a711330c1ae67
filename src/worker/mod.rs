//! Worker side of the queue: retry backoff and the runner loop.

pub mod backoff;
pub mod runner;

pub use backoff::{BackoffPolicy, jittered};
pub use runner::{Runner, RunnerConfig};
