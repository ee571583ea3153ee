//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::job::DEFAULT_MAX_RETRIES;
use crate::scheduler::RetryPolicy;

/// Job system configuration.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Retry budget for jobs submitted without one.
    pub default_max_retries: u32,
    /// Execution timeout for jobs submitted without one.
    pub job_timeout: Option<Duration>,
    /// Backoff between retries.
    pub retry: RetryPolicy,
    /// A `running` lease older than this is presumed dead.
    pub stale_threshold: Duration,
    /// How often the stale-lease sweep runs.
    pub sweep_interval: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace: Duration,
    /// Database file (daemon only).
    pub db_path: PathBuf,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            default_max_retries: DEFAULT_MAX_RETRIES,
            job_timeout: None,
            retry: RetryPolicy::default(),
            stale_threshold: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(60),   // 1 minute
            shutdown_grace: Duration::from_secs(30),
            db_path: PathBuf::from("./data/jobs.db"),
        }
    }
}

impl JobsConfig {
    /// Build from `JOBS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            worker_count: parse_or(&get, "JOBS_WORKERS", defaults.worker_count)?,
            default_max_retries: parse_or(&get, "JOBS_MAX_RETRIES", defaults.default_max_retries)?,
            job_timeout: match get("JOBS_TIMEOUT_SECS") {
                Some(raw) => Some(Duration::from_secs(parse("JOBS_TIMEOUT_SECS", &raw)?)),
                None => defaults.job_timeout,
            },
            retry: RetryPolicy {
                base_delay: millis_or(&get, "JOBS_BACKOFF_BASE_MS", defaults.retry.base_delay)?,
                max_delay: millis_or(&get, "JOBS_BACKOFF_MAX_MS", defaults.retry.max_delay)?,
                jitter: parse_or(&get, "JOBS_BACKOFF_JITTER", defaults.retry.jitter)?,
            },
            stale_threshold: secs_or(&get, "JOBS_STALE_SECS", defaults.stale_threshold)?,
            sweep_interval: secs_or(&get, "JOBS_SWEEP_SECS", defaults.sweep_interval)?,
            shutdown_grace: secs_or(&get, "JOBS_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            db_path: get("JOBS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the system cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid(
                "retry.max_delay",
                "must not be smaller than retry.base_delay",
            ));
        }
        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid("job_timeout", "must be greater than zero"));
        }
        if self.stale_threshold.is_zero() {
            return Err(invalid("stale_threshold", "must be greater than zero"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("sweep_interval", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| invalid(key, format!("{raw:?}: {e}")))
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}
