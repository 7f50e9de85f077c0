//! Worker configuration.
//!
//! Defaults suit an interview worker: a handful of concurrent sessions, a
//! lease timeout comfortably above the longest session, and a four-step
//! backoff. Every knob can be overridden from `PARLEY_*` environment
//! variables; a value that does not parse is an error, never a silent default.

use std::time::Duration;

use parley_core::{BackoffSchedule, RetryPolicy, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: &'static str },
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

pub const ENV_MAX_CONCURRENT: &str = "PARLEY_MAX_CONCURRENT";
pub const ENV_POLL_INTERVAL_MS: &str = "PARLEY_POLL_INTERVAL_MS";
pub const ENV_LEASE_TIMEOUT_SECS: &str = "PARLEY_LEASE_TIMEOUT_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "PARLEY_SWEEP_INTERVAL_SECS";
pub const ENV_MAX_FAILURES: &str = "PARLEY_MAX_FAILURES";
pub const ENV_BACKOFF_SECS: &str = "PARLEY_BACKOFF_SECS";
pub const ENV_SHUTDOWN_GRACE_SECS: &str = "PARLEY_SHUTDOWN_GRACE_SECS";
pub const ENV_WORKER_ID: &str = "PARLEY_WORKER_ID";

/// Settings for one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Identity recorded in `claimed_by`.
    pub worker_id: WorkerId,
    /// Upper bound on items executing at once (k).
    pub max_concurrent: usize,
    /// Idle wait between claim attempts.
    pub poll_interval: Duration,
    /// Cap on the wait after repeated store errors.
    pub max_poll_backoff: Duration,
    /// Age after which a lease is presumed dead. Must exceed the longest
    /// legitimate execution.
    pub lease_timeout: Duration,
    /// How often this process sweeps expired leases; `None` disables it.
    pub sweep_interval: Option<Duration>,
    pub retry_policy: RetryPolicy,
    /// How long in-flight work may finish after shutdown is requested.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::from_environment(),
            max_concurrent: 3,
            poll_interval: Duration::from_secs(1),
            max_poll_backoff: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(2 * 60 * 60),
            sweep_interval: Some(Duration::from_secs(60)),
            retry_policy: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = worker_id;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup(key)`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get(ENV_WORKER_ID) {
            config.worker_id = v
                .parse()
                .map_err(|e| ConfigError::invalid(ENV_WORKER_ID, &v, format!("{e}")))?;
        }
        if let Some(v) = get(ENV_MAX_CONCURRENT) {
            let max = parse_u64(ENV_MAX_CONCURRENT, &v)?;
            if max == 0 {
                return Err(ConfigError::invalid(ENV_MAX_CONCURRENT, &v, "must be at least 1"));
            }
            config.max_concurrent = usize::try_from(max)
                .map_err(|_| ConfigError::invalid(ENV_MAX_CONCURRENT, &v, "too large"))?;
        }
        if let Some(v) = get(ENV_POLL_INTERVAL_MS) {
            let ms = parse_u64(ENV_POLL_INTERVAL_MS, &v)?;
            if ms == 0 {
                return Err(ConfigError::invalid(ENV_POLL_INTERVAL_MS, &v, "must be positive"));
            }
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = get(ENV_LEASE_TIMEOUT_SECS) {
            let secs = parse_u64(ENV_LEASE_TIMEOUT_SECS, &v)?;
            if secs == 0 {
                return Err(ConfigError::invalid(ENV_LEASE_TIMEOUT_SECS, &v, "must be positive"));
            }
            config.lease_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = get(ENV_SWEEP_INTERVAL_SECS) {
            let secs = parse_u64(ENV_SWEEP_INTERVAL_SECS, &v)?;
            config.sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = get(ENV_SHUTDOWN_GRACE_SECS) {
            config.shutdown_grace = Duration::from_secs(parse_u64(ENV_SHUTDOWN_GRACE_SECS, &v)?);
        }

        let max_failures = match get(ENV_MAX_FAILURES) {
            Some(v) => u32::try_from(parse_u64(ENV_MAX_FAILURES, &v)?)
                .map_err(|_| ConfigError::invalid(ENV_MAX_FAILURES, &v, "too large"))?,
            None => config.retry_policy.max_failures(),
        };
        let schedule = match get(ENV_BACKOFF_SECS) {
            Some(v) => parse_schedule(&v)?,
            None => config.retry_policy.schedule().clone(),
        };
        config.retry_policy = RetryPolicy::new(max_failures, schedule)
            .map_err(|e| ConfigError::invalid(ENV_MAX_FAILURES, &max_failures.to_string(), format!("{e}")))?;

        Ok(config)
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::invalid(key, value, format!("{e}")))
}

/// Comma-separated seconds, e.g. `30,120,600,1800`.
fn parse_schedule(value: &str) -> Result<BackoffSchedule, ConfigError> {
    let secs = value
        .split(',')
        .map(|part| parse_u64(ENV_BACKOFF_SECS, part))
        .collect::<Result<Vec<_>, _>>()?;
    BackoffSchedule::from_secs(&secs)
        .map_err(|e| ConfigError::invalid(ENV_BACKOFF_SECS, value, format!("{e}")))
}
