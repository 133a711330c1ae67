//! Postgres task store: connection pool, migrations, health check, and
//! wake-up notifications.
//!
//! The queue database is addressed separately from the application's
//! primary database and carries its own migration set.

pub mod tasks;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// NOTIFY channel fired on commit of every new task.
pub const WAKEUP_CHANNEL: &str = "snappea_task_ready";

/// Database handle. Owns the connection pool and the wake-up listener.
pub struct Db {
    pool: PgPool,
    listener: Mutex<Option<PgListener>>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            listener: Mutex::new(None),
        })
    }

    /// Run all pending queue migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Round-trip a `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Wait for a NOTIFY on [`WAKEUP_CHANNEL`], falling back to a plain
    /// sleep when the listener can't be established.
    pub(crate) async fn wait_for_notify(&self, max_wait: Duration) {
        let mut guard = self.listener.lock().await;

        if guard.is_none() {
            match PgListener::connect_with(&self.pool).await {
                Ok(mut listener) => match listener.listen(WAKEUP_CHANNEL).await {
                    Ok(()) => *guard = Some(listener),
                    Err(e) => warn!("LISTEN {WAKEUP_CHANNEL} failed: {e}, falling back to poll"),
                },
                Err(e) => warn!("PgListener connect failed: {e}, falling back to poll"),
            }
        }

        let received = match guard.as_mut() {
            Some(listener) => Some(tokio::time::timeout(max_wait, listener.recv()).await),
            None => None,
        };

        match received {
            Some(Ok(Ok(notification))) => {
                debug!(task_type = notification.payload(), "woken by enqueue");
            }
            Some(Ok(Err(e))) => {
                warn!("PgListener error: {e}, falling back to poll");
                *guard = None;
                drop(guard);
                tokio::time::sleep(max_wait).await;
            }
            Some(Err(_)) => {}
            None => {
                drop(guard);
                tokio::time::sleep(max_wait).await;
            }
        }
    }
}
