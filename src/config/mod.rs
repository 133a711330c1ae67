//! Typed configuration from an optional TOML file and environment variables.
//!
//! Loads once at startup, fails fast if required values are missing or
//! malformed. Environment variables override the file. The queue database
//! URL is wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use crate::model::DEFAULT_MAX_ATTEMPTS;
use crate::worker::{BackoffPolicy, RunnerConfig};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub queue_database_url: SecretString,
    pub slots: usize,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub lease_duration: Duration,
    pub task_timeout: Duration,
    pub grace_period: Duration,
    /// Directory of `*.toml` task declarations for the worker binary.
    pub tasks_dir: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// On-disk shape of the config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub queue_database_url: Option<String>,
    pub slots: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub lease_secs: Option<u64>,
    pub task_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
    pub tasks_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_sources(FileConfig::default(), |name| std::env::var(name).ok())
    }

    /// Load the optional file, then let the environment override it.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file = match file {
            Some(path) => FileConfig::read(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(file, |name| std::env::var(name).ok())
    }

    /// Merge a file config with a variable lookup. The lookup wins.
    pub fn from_sources<F>(file: FileConfig, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_database_url = var("QUEUE_DATABASE_URL")
            .or(file.queue_database_url)
            .ok_or_else(|| {
                Error::Config("required setting QUEUE_DATABASE_URL is not set".to_string())
            })?;

        let config = Self {
            queue_database_url: SecretString::from(queue_database_url),
            slots: parsed(&var, "SNAPPEA_SLOTS")?.or(file.slots).unwrap_or(4),
            poll_interval: Duration::from_millis(
                parsed(&var, "SNAPPEA_POLL_INTERVAL_MS")?
                    .or(file.poll_interval_ms)
                    .unwrap_or(1000),
            ),
            max_attempts: parsed(&var, "SNAPPEA_MAX_ATTEMPTS")?
                .or(file.max_attempts)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff_base: Duration::from_millis(
                parsed(&var, "SNAPPEA_BACKOFF_BASE_MS")?
                    .or(file.backoff_base_ms)
                    .unwrap_or(1000),
            ),
            backoff_cap: Duration::from_millis(
                parsed(&var, "SNAPPEA_BACKOFF_CAP_MS")?
                    .or(file.backoff_cap_ms)
                    .unwrap_or(300_000),
            ),
            lease_duration: Duration::from_secs(
                parsed(&var, "SNAPPEA_LEASE_SECS")?
                    .or(file.lease_secs)
                    .unwrap_or(60),
            ),
            task_timeout: Duration::from_secs(
                parsed(&var, "SNAPPEA_TASK_TIMEOUT_SECS")?
                    .or(file.task_timeout_secs)
                    .unwrap_or(300),
            ),
            grace_period: Duration::from_secs(
                parsed(&var, "SNAPPEA_GRACE_PERIOD_SECS")?
                    .or(file.grace_period_secs)
                    .unwrap_or(10),
            ),
            tasks_dir: var("SNAPPEA_TASKS_DIR")
                .map(PathBuf::from)
                .or(file.tasks_dir)
                .unwrap_or_else(|| PathBuf::from("tasks")),
            otel_endpoint: var("OTEL_ENDPOINT").or(file.otel_endpoint),
            log_level: var("LOG_LEVEL")
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.slots == 0 {
            return Err(Error::Config("SNAPPEA_SLOTS must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "SNAPPEA_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(Error::Config(format!(
                "backoff base ({:?}) exceeds cap ({:?})",
                self.backoff_base, self.backoff_cap
            )));
        }
        if self.lease_duration.is_zero() {
            return Err(Error::Config("SNAPPEA_LEASE_SECS must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "SNAPPEA_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(Error::Config(
                "SNAPPEA_TASK_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_cap)
    }

    /// Runner settings derived from this config.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            slots: self.slots,
            poll_interval: self.poll_interval,
            lease_duration: self.lease_duration,
            renew_interval: self.lease_duration / 3,
            task_timeout: self.task_timeout,
            grace_period: self.grace_period,
            backoff: self.backoff(),
            ..RunnerConfig::default()
        }
    }
}

fn parsed<T, F>(var: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        None => Ok(None),
    }
}
