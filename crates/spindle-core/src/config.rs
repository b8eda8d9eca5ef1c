//! Queue configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional file
//! (TOML/YAML/JSON by extension), then `SPINDLE_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::WorkerOptions;
use crate::domain::{Backoff, RetryPolicy};
use crate::error::QueueError;

pub const ENV_PREFIX: &str = "SPINDLE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub database_url: String,
    pub max_connections: u32,

    pub poll_interval_ms: u64,
    pub concurrency: usize,

    /// Overrides the claim size; unset means the largest registered batch size.
    pub claim_limit: Option<usize>,

    pub default_batch_size: usize,
    pub default_max_retries: u32,

    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: f64,

    /// A claim older than this is considered abandoned and may be reclaimed.
    pub claim_timeout_secs: u64,

    pub shutdown_grace_ms: u64,

    pub store_retry_base_ms: u64,
    pub store_retry_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://spindle.db".to_string(),
            max_connections: 5,
            poll_interval_ms: 1_000,
            concurrency: 1,
            claim_limit: None,
            default_batch_size: 1,
            default_max_retries: 5,
            backoff_base_ms: 2_000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 3_600_000,
            backoff_jitter: 0.0,
            claim_timeout_secs: 300,
            shutdown_grace_ms: 30_000,
            store_retry_base_ms: 500,
            store_retry_max_ms: 30_000,
        }
    }
}

impl QueueConfig {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, QueueError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        );

        let config: QueueConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        let invalid = |msg: &str| -> Result<(), QueueError> {
            Err(QueueError::InvalidConfig(msg.to_string()))
        };

        if self.database_url.trim().is_empty() {
            return invalid("database_url must not be empty");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.claim_limit == Some(0) {
            return invalid("claim_limit must be at least 1 when set");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive");
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return invalid("backoff_multiplier must be a finite number >= 1.0");
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return invalid("backoff_max_ms must be >= backoff_base_ms");
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return invalid("backoff_jitter must be within [0, 1]");
        }
        if self.claim_timeout_secs == 0 {
            return invalid("claim_timeout_secs must be positive");
        }
        if self.store_retry_max_ms < self.store_retry_base_ms {
            return invalid("store_retry_max_ms must be >= store_retry_base_ms");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Retry policy applied to tasks that don't set their own.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.default_max_retries,
            Backoff::exponential(
                Duration::from_millis(self.backoff_base_ms),
                self.backoff_multiplier,
                Duration::from_millis(self.backoff_max_ms),
            ),
        )
        .with_jitter(self.backoff_jitter)
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            poll_interval: self.poll_interval(),
            concurrency: self.concurrency,
            claim_limit: self.claim_limit,
            claim_timeout: self.claim_timeout(),
            shutdown_grace: self.shutdown_grace(),
            store_retry_base: Duration::from_millis(self.store_retry_base_ms),
            store_retry_max: Duration::from_millis(self.store_retry_max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = QueueConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.retry_policy().max_retries, 5);
        assert_eq!(config.retry_policy().next_delay(1), Duration::from_secs(2));
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "database_url = \"sqlite::memory:\"\nconcurrency = 4\nclaim_limit = 8\nbackoff_base_ms = 100\nbackoff_max_ms = 1000"
        )
        .unwrap();

        let config = QueueConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.claim_limit, Some(8));
        assert_eq!(config.default_max_retries, 5);

        let options = config.worker_options();
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.claim_limit, Some(8));
        assert_eq!(config.retry_policy().next_delay(1), Duration::from_millis(100));
    }

    #[test]
    fn invalid_file_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "concurrency = 0").unwrap();

        let err = QueueConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig(msg) if msg.contains("concurrency")));
    }

    #[rstest]
    #[case::empty_url(QueueConfig { database_url: " ".into(), ..Default::default() })]
    #[case::zero_claim_limit(QueueConfig { claim_limit: Some(0), ..Default::default() })]
    #[case::shrinking_backoff(QueueConfig { backoff_multiplier: 0.5, ..Default::default() })]
    #[case::cap_below_base(QueueConfig { backoff_max_ms: 10, ..Default::default() })]
    #[case::jitter_out_of_range(QueueConfig { backoff_jitter: 1.5, ..Default::default() })]
    #[case::zero_claim_timeout(QueueConfig { claim_timeout_secs: 0, ..Default::default() })]
    fn validation_rejects(#[case] config: QueueConfig) {
        assert!(matches!(config.validate(), Err(QueueError::InvalidConfig(_))));
    }
}
