//! Runtime configuration loaded from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | required |
//! | `STAGEHAND_WORKER_COUNT` | available parallelism |
//! | `STAGEHAND_POLL_INTERVAL_MS` | 1000 |
//! | `STAGEHAND_HEARTBEAT_INTERVAL_MS` | stale running TTL / 4 |
//! | `STAGEHAND_JOB_TIMEOUT_MS` | none |
//! | `STAGEHAND_MAX_ATTEMPTS` | 5 |
//! | `STAGEHAND_RETRY_DELAY_MS` | 30000 |
//! | `STAGEHAND_STALE_RUNNING_TTL_MS` | 120000 |
//! | `REDIS_URL` | none |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use stagehand_core::ClaimPolicy;

use crate::jobs::WorkerConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var}: cannot parse `{value}`")]
    Invalid { var: &'static str, value: String },

    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_url: String,
    pub worker_count: usize,
    pub worker: WorkerConfig,
    pub policy: ClaimPolicy,
    pub redis_url: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source, then validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let worker_count = match get("STAGEHAND_WORKER_COUNT") {
            Some(v) => parse("STAGEHAND_WORKER_COUNT", &v)?,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let mut policy = ClaimPolicy::default();
        if let Some(v) = get("STAGEHAND_MAX_ATTEMPTS") {
            policy.max_attempts = parse("STAGEHAND_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("STAGEHAND_RETRY_DELAY_MS") {
            policy.retry_delay = millis("STAGEHAND_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("STAGEHAND_STALE_RUNNING_TTL_MS") {
            policy.stale_running_ttl = millis("STAGEHAND_STALE_RUNNING_TTL_MS", &v)?;
        }

        let mut worker = WorkerConfig::default();
        worker.heartbeat_interval = match get("STAGEHAND_HEARTBEAT_INTERVAL_MS") {
            Some(v) => millis("STAGEHAND_HEARTBEAT_INTERVAL_MS", &v)?,
            None => policy.stale_running_ttl / 4,
        };
        if let Some(v) = get("STAGEHAND_POLL_INTERVAL_MS") {
            worker.poll_interval = millis("STAGEHAND_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("STAGEHAND_JOB_TIMEOUT_MS") {
            worker.job_timeout = Some(millis("STAGEHAND_JOB_TIMEOUT_MS", &v)?);
        }

        let config = Self {
            database_url,
            worker_count,
            worker,
            policy,
            redis_url: get("REDIS_URL"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.max_attempts == 0 {
            return Err(ConfigError::Rejected("max_attempts must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Rejected("worker_count must be at least 1".into()));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(ConfigError::Rejected("poll_interval must be positive".into()));
        }
        if self.worker.heartbeat_interval.is_zero() {
            return Err(ConfigError::Rejected("heartbeat_interval must be positive".into()));
        }
        // A heartbeat slower than the TTL lets live jobs look crashed.
        if self.worker.heartbeat_interval >= self.policy.stale_running_ttl {
            return Err(ConfigError::Rejected(format!(
                "heartbeat_interval ({:?}) must be shorter than stale_running_ttl ({:?})",
                self.worker.heartbeat_interval, self.policy.stale_running_ttl
            )));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(var, value).map(Duration::from_millis)
}
