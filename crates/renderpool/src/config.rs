//! Pool configuration

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PoolError;

/// Default dispatch deadline (3 minutes)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(180_000);

/// Environment variable overriding the number of workers
pub const WORKERS_ENV: &str = "RENDERPOOL_WORKERS";

/// Environment variable overriding the dispatch deadline, in milliseconds
pub const TIMEOUT_ENV: &str = "RENDERPOOL_TIMEOUT_MS";

/// Worker pool configuration
///
/// Immutable once the pool is constructed. The worker-launch parameter is not
/// part of this struct: it travels with the worker factory handed to
/// [`WorkerPool::new`](crate::WorkerPool::new), e.g. a
/// [`ProcessWorkerConfig`](crate::ProcessWorkerConfig).
///
/// # Example
///
/// ```
/// use renderpool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new()
///     .with_number_of_workers(4)
///     .with_timeout(Duration::from_secs(30));
/// assert_eq!(config.number_of_workers, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker slots (defaults to the host CPU count)
    #[serde(default = "default_number_of_workers")]
    pub number_of_workers: usize,

    /// Deadline for a single dispatch
    #[serde(rename = "timeout_ms", with = "duration_millis", default = "default_timeout")]
    pub timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            number_of_workers: default_number_of_workers(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker slots (at least one)
    pub fn with_number_of_workers(mut self, workers: usize) -> Self {
        self.number_of_workers = workers.max(1);
        self
    }

    /// Set the dispatch deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check that the configuration can run tasks
    ///
    /// A pool without workers would accept tasks and never dispatch them.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.number_of_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "number_of_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RENDERPOOL_WORKERS`: number of worker slots (default: CPU count)
    /// - `RENDERPOOL_TIMEOUT_MS`: dispatch deadline in milliseconds (default: 180000)
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(WORKERS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(workers) if workers > 0 => config.number_of_workers = workers,
                _ => warn!(value = %raw, "Ignoring invalid {}", WORKERS_ENV),
            }
        }

        if let Some(raw) = lookup(TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(millis) => config.timeout = Duration::from_millis(millis),
                Err(_) => warn!(value = %raw, "Ignoring invalid {}", TIMEOUT_ENV),
            }
        }

        config
    }
}

fn default_number_of_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
