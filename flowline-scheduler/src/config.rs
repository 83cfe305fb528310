//! Scheduler configuration
//!
//! Defines all configurable parameters of the scheduler service: store and
//! executor endpoints, sweep and polling intervals, timeouts and retry policy.

use std::time::Duration;

/// Scheduler service configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Postgres connection string
    pub database_url: String,

    /// Executor base URL (e.g., "http://localhost:9090")
    pub executor_url: String,

    /// How often every active run is re-evaluated
    pub sweep_interval: Duration,

    /// How often the executor event feed is polled
    pub event_poll_interval: Duration,

    /// Maximum number of scheduler passes running at once
    pub max_concurrent_passes: usize,

    pub policy: SchedulerPolicy,
}

/// Runtime rules shared by the scheduler loop, the reconciler and the sweep
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerPolicy {
    /// A started task without a heartbeat for this long is considered lost
    pub heartbeat_timeout: Duration,

    /// An accepted job that has not started after this long is considered lost
    pub queue_timeout: Duration,

    /// Deadline of a single job submission
    pub submit_timeout: Duration,

    /// Deadline of a single job cancellation
    pub cancel_timeout: Duration,

    /// Default number of automatic retries of a transient failure
    pub max_retries: u32,

    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,

    /// A task waiting for a cluster longer than this fails
    pub cluster_wait_timeout: Duration,
}

impl SchedulerPolicy {
    /// Delay to wait before dispatching attempt `attempt` (1-based)
    ///
    /// Bounded exponential: `min(base * 2^(attempt - 2), max)`, zero for the
    /// first attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.retry_backoff_base
            .checked_mul(factor)
            .unwrap_or(self.retry_backoff_max)
            .min(self.retry_backoff_max)
    }

    /// Retry budget of a node, falling back to the scheduler-wide default
    pub fn max_retries_for(&self, node_override: Option<u32>) -> u32 {
        node_override.unwrap_or(self.max_retries)
    }
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            queue_timeout: Duration::from_secs(600),
            submit_timeout: Duration::from_secs(10),
            cancel_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(2000),
            retry_backoff_max: Duration::from_millis(60_000),
            cluster_wait_timeout: Duration::from_secs(600),
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with defaults
    pub fn new(database_url: String, executor_url: String) -> Self {
        Self {
            database_url,
            executor_url,
            sweep_interval: Duration::from_secs(5),
            event_poll_interval: Duration::from_millis(500),
            max_concurrent_passes: 16,
            policy: SchedulerPolicy::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (required)
    /// - EXECUTOR_URL (required)
    /// - SWEEP_INTERVAL (optional, seconds, default: 5)
    /// - EVENT_POLL_INTERVAL (optional, milliseconds, default: 500)
    /// - HEARTBEAT_TIMEOUT (optional, seconds, default: 60)
    /// - QUEUE_TIMEOUT (optional, seconds, default: 600)
    /// - SUBMIT_TIMEOUT (optional, seconds, default: 10)
    /// - CANCEL_TIMEOUT (optional, seconds, default: 5)
    /// - MAX_RETRIES (optional, default: 3)
    /// - RETRY_BACKOFF_BASE (optional, milliseconds, default: 2000)
    /// - RETRY_BACKOFF_MAX (optional, milliseconds, default: 60000)
    /// - CLUSTER_WAIT_TIMEOUT (optional, seconds, default: 600)
    /// - MAX_CONCURRENT_PASSES (optional, default: 16)
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;

        let executor_url = std::env::var("EXECUTOR_URL")
            .map_err(|_| anyhow::anyhow!("EXECUTOR_URL environment variable not set"))?;

        let defaults = Self::new(database_url, executor_url);
        let policy = SchedulerPolicy {
            heartbeat_timeout: secs("HEARTBEAT_TIMEOUT")
                .unwrap_or(defaults.policy.heartbeat_timeout),
            queue_timeout: secs("QUEUE_TIMEOUT").unwrap_or(defaults.policy.queue_timeout),
            submit_timeout: secs("SUBMIT_TIMEOUT").unwrap_or(defaults.policy.submit_timeout),
            cancel_timeout: secs("CANCEL_TIMEOUT").unwrap_or(defaults.policy.cancel_timeout),
            max_retries: parsed("MAX_RETRIES").unwrap_or(defaults.policy.max_retries),
            retry_backoff_base: millis("RETRY_BACKOFF_BASE")
                .unwrap_or(defaults.policy.retry_backoff_base),
            retry_backoff_max: millis("RETRY_BACKOFF_MAX")
                .unwrap_or(defaults.policy.retry_backoff_max),
            cluster_wait_timeout: secs("CLUSTER_WAIT_TIMEOUT")
                .unwrap_or(defaults.policy.cluster_wait_timeout),
        };

        Ok(Self {
            sweep_interval: secs("SWEEP_INTERVAL").unwrap_or(defaults.sweep_interval),
            event_poll_interval: millis("EVENT_POLL_INTERVAL")
                .unwrap_or(defaults.event_poll_interval),
            max_concurrent_passes: parsed("MAX_CONCURRENT_PASSES")
                .unwrap_or(defaults.max_concurrent_passes),
            policy,
            ..defaults
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("database_url cannot be empty");
        }

        if !self.executor_url.starts_with("http://") && !self.executor_url.starts_with("https://")
        {
            anyhow::bail!("executor_url must start with http:// or https://");
        }

        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval must be greater than 0");
        }

        if self.event_poll_interval.is_zero() {
            anyhow::bail!("event_poll_interval must be greater than 0");
        }

        if self.max_concurrent_passes == 0 {
            anyhow::bail!("max_concurrent_passes must be greater than 0");
        }

        if self.policy.heartbeat_timeout.is_zero() || self.policy.queue_timeout.is_zero() {
            anyhow::bail!("liveness timeouts must be greater than 0");
        }

        if self.policy.submit_timeout.is_zero() || self.policy.cancel_timeout.is_zero() {
            anyhow::bail!("executor call timeouts must be greater than 0");
        }

        if self.policy.retry_backoff_base > self.policy.retry_backoff_max {
            anyhow::bail!("retry_backoff_base cannot exceed retry_backoff_max");
        }

        Ok(())
    }
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn secs(name: &str) -> Option<Duration> {
    parsed::<u64>(name).map(Duration::from_secs)
}

fn millis(name: &str) -> Option<Duration> {
    parsed::<u64>(name).map(Duration::from_millis)
}
