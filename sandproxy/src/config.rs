//! Host configuration.
//!
//! Built in code with the `with_*` builder, or read from the environment:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `SANDPROXY_WORKER` | worker program to spawn | `sandproxy-worker` |
//! | `SANDPROXY_LOG_DIR` | session log directory | required |
//! | `SANDPROXY_COMMAND_TIMEOUT_SECS` | per-command timeout | none |
//! | `SANDPROXY_SHUTDOWN_GRACE_SECS` | wait for exit before killing | 5 |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::spawn::{ProcessSpawner, WorkerSpawner};

pub const DEFAULT_WORKER_PROGRAM: &str = "sandproxy-worker";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const ENV_WORKER: &str = "SANDPROXY_WORKER";
pub const ENV_LOG_DIR: &str = "SANDPROXY_LOG_DIR";
pub const ENV_COMMAND_TIMEOUT: &str = "SANDPROXY_COMMAND_TIMEOUT_SECS";
pub const ENV_SHUTDOWN_GRACE: &str = "SANDPROXY_SHUTDOWN_GRACE_SECS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var} must be a non-negative number of seconds, got '{value}'")]
    InvalidDuration { var: &'static str, value: String },
}

/// Host controller configuration.
#[derive(Clone)]
pub struct HostConfig {
    /// Directory receiving `events.jsonl` and `metrics.jsonl`.
    pub log_dir: PathBuf,
    /// Default timeout for `send`; `None` waits indefinitely.
    pub command_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("log_dir", &self.log_dir)
            .field("command_timeout", &self.command_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl HostConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            command_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            spawner: Arc::new(ProcessSpawner::new(DEFAULT_WORKER_PROGRAM)),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Spawn `program` as the worker process.
    pub fn with_worker_program(self, program: impl Into<PathBuf>) -> Self {
        self.with_spawner(Arc::new(ProcessSpawner::new(program)))
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to its
    /// value. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let log_dir = get(ENV_LOG_DIR).ok_or(ConfigError::Missing(ENV_LOG_DIR))?;
        let mut config = Self::new(log_dir);

        if let Some(program) = get(ENV_WORKER) {
            config = config.with_worker_program(program);
        }
        if let Some(value) = get(ENV_COMMAND_TIMEOUT) {
            config = config.with_command_timeout(parse_secs(ENV_COMMAND_TIMEOUT, &value)?);
        }
        if let Some(value) = get(ENV_SHUTDOWN_GRACE) {
            config = config.with_shutdown_grace(parse_secs(ENV_SHUTDOWN_GRACE, &value)?);
        }
        Ok(config)
    }
}

fn parse_secs(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| ConfigError::InvalidDuration {
            var,
            value: value.to_string(),
        })
}
