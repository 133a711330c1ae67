//! Liveness and readiness reporting for external probes.
//!
//! Liveness only says the process is up and never touches the store.
//! Readiness makes two checks: the store answers a trivial round trip within
//! a short timeout, and the registry was initialized. The report is
//! informational; nothing here stops or slows the runner.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::registry::TaskRegistry;
use crate::store::TaskStore;

/// Round-trip budget for the store check.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

const OK: &str = "ok";

/// Readiness snapshot, serialized as the probe's JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `"ok"` or `"error"`.
    pub status: String,
    pub store: String,
    pub registry: String,
    pub version: String,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == OK
    }
}

#[derive(Clone)]
pub struct HealthReporter {
    store: Arc<dyn TaskStore>,
    registry: Option<Arc<TaskRegistry>>,
}

impl HealthReporter {
    /// A reporter whose registry has not been built yet.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Liveness answer. Store and registry state do not affect it.
    pub fn live() -> &'static str {
        OK
    }

    pub async fn check(&self) -> HealthReport {
        let store = match tokio::time::timeout(PING_TIMEOUT, self.store.ping()).await {
            Ok(Ok(())) => OK.to_string(),
            Ok(Err(e)) => {
                error!(error = %e, "store health check failed");
                format!("error: {e}")
            }
            Err(_) => {
                error!(timeout = ?PING_TIMEOUT, "store health check timed out");
                format!("error: no response within {:?}", PING_TIMEOUT)
            }
        };

        let registry = match &self.registry {
            Some(registry) if !registry.is_empty() => OK.to_string(),
            Some(_) => "error: no task handlers registered".to_string(),
            None => "error: registry not initialized".to_string(),
        };

        let status = if store == OK && registry == OK {
            OK
        } else {
            "error"
        };

        HealthReport {
            status: status.to_string(),
            store,
            registry,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
