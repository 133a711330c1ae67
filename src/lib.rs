//! # snappea
//!
//! Postgres-backed task queue and worker runner for an error tracker's
//! background work: digest mail, event ingestion follow-ups, cleanup jobs.
//!
//! Callers enqueue typed tasks through the [`enqueue::Enqueuer`]; one or
//! more [`worker::Runner`]s lease them from a shared [`store::TaskStore`],
//! run the registered handler and write back the outcome with retry,
//! backoff and dead-lettering. Delivery is at-least-once.

pub mod command;
pub mod config;
pub mod db;
pub mod enqueue;
pub mod error;
pub mod event;
pub mod health;
pub mod model;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod worker;
