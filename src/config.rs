//! # Client Configuration
//!
//! Every tunable lives in a plain struct with a `Default` impl, so the common
//! case is `ClientConfig::default()`. The whole tree also derives serde, so a
//! deployment can keep it in a JSON file:
//!
//! ```json
//! {
//!   "project_id": "my-project",
//!   "stream": { "batch_size": 500, "rss_limit_mb": 2000, "max_wait_seconds": 30 },
//!   "mutation": { "max_items_per_call": 500, "concurrency": 4 }
//! }
//! ```
//!
//! Missing sections and fields fall back to their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::stream::BackpressurePolicy;
use crate::transaction::TransactionConfig;
use crate::writer::MutatorConfig;

/// Environment variable consulted when no project id is configured.
pub const PROJECT_ID_ENV: &str = "CLOUDSTORE_PROJECT_ID";

/// Rows requested per page by a stream.
pub const DEFAULT_STREAM_BATCH_SIZE: usize = 1000;

/// Resident memory above which a stream stops prefetching.
pub const DEFAULT_RSS_LIMIT_MB: u64 = 1000;

/// Smallest accepted safety timer threshold (one millisecond).
pub const MIN_MAX_WAIT_SECONDS: f64 = 0.001;

// =============================================================================
// Stream Options
// =============================================================================

/// Options for one streaming scan.
///
/// Backpressure is chosen from these fields in a fixed order, see
/// [`StreamOptions::backpressure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Rows requested per page.
    pub batch_size: usize,

    /// Soft memory limit in megabytes. `None` or `0` disables the check.
    pub rss_limit_mb: Option<u64>,

    /// Never prefetch: fetch the next page only after the consumer drained
    /// the previous one.
    pub single_batch_buffer: bool,

    /// If the consumer has not pulled for this long, force the next fetch.
    pub max_wait_seconds: Option<f64>,

    /// Log per-page progress at info level instead of debug.
    pub debug: bool,

    /// Read a consistent snapshot as of this unix timestamp (seconds).
    pub read_at: Option<i64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_STREAM_BATCH_SIZE,
            rss_limit_mb: Some(DEFAULT_RSS_LIMIT_MB),
            single_batch_buffer: false,
            max_wait_seconds: None,
            debug: false,
            read_at: None,
        }
    }
}

impl StreamOptions {
    /// Picks the backpressure policy.
    ///
    /// `single_batch_buffer` wins over `rss_limit_mb`; with neither set the
    /// stream prefetches eagerly.
    pub fn backpressure(&self) -> BackpressurePolicy {
        if self.single_batch_buffer {
            return BackpressurePolicy::SingleBatch;
        }
        match self.rss_limit_mb {
            Some(limit_mb) if limit_mb > 0 => BackpressurePolicy::MemoryLimited { limit_mb },
            _ => BackpressurePolicy::Eager,
        }
    }

    /// The safety timer threshold, if enabled.
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Snapshot timestamp in milliseconds.
    pub fn read_time_ms(&self) -> Option<i64> {
        self.read_at.map(|secs| secs.saturating_mul(1000))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "stream.batch_size must be at least 1".into(),
            ));
        }
        if let Some(secs) = self.max_wait_seconds {
            if !secs.is_finite() || secs < MIN_MAX_WAIT_SECONDS {
                return Err(Error::InvalidConfig(format!(
                    "stream.max_wait_seconds must be at least {MIN_MAX_WAIT_SECONDS}"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Top-level configuration for a [`crate::CloudStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Project the store belongs to. Falls back to [`PROJECT_ID_ENV`].
    pub project_id: Option<String>,

    /// Default options for streams that do not pass their own.
    pub stream: StreamOptions,

    /// Retry policy for every page fetch.
    pub page_retry: RetryPolicy,

    /// Chunking, concurrency and retry for saves and deletes.
    pub mutation: MutatorConfig,

    /// Contention retry for transactions.
    pub transaction: TransactionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            stream: StreamOptions::default(),
            page_retry: RetryPolicy::page_fetch(),
            mutation: MutatorConfig::default(),
            transaction: TransactionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Checks that every section is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;
        self.page_retry.validate("page_retry")?;
        self.mutation.validate()?;
        self.transaction.validate()?;
        Ok(())
    }

    /// The configured project id, or the value of [`PROJECT_ID_ENV`].
    pub fn resolve_project_id(&self) -> Option<String> {
        self.project_id
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var(PROJECT_ID_ENV).ok().filter(|p| !p.is_empty()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.stream.batch_size, 1000);
        assert_eq!(cfg.stream.rss_limit_mb, Some(1000));
        assert_eq!(cfg.page_retry.max_attempts, 5);
        assert_eq!(cfg.mutation.max_items_per_call, 500);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_backpressure_precedence() {
        let mut opts = StreamOptions {
            single_batch_buffer: true,
            ..StreamOptions::default()
        };
        assert_eq!(opts.backpressure(), BackpressurePolicy::SingleBatch);

        opts.single_batch_buffer = false;
        assert_eq!(
            opts.backpressure(),
            BackpressurePolicy::MemoryLimited { limit_mb: 1000 }
        );

        opts.rss_limit_mb = Some(0);
        assert_eq!(opts.backpressure(), BackpressurePolicy::Eager);
        opts.rss_limit_mb = None;
        assert_eq!(opts.backpressure(), BackpressurePolicy::Eager);
    }

    #[test]
    fn test_read_at_converted_to_ms() {
        let opts = StreamOptions {
            read_at: Some(1_700_000_000),
            ..StreamOptions::default()
        };
        assert_eq!(opts.read_time_ms(), Some(1_700_000_000_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = ClientConfig::from_json(
            r#"{ "project_id": "p1", "stream": { "batch_size": 50, "max_wait_seconds": 2.5 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.project_id.as_deref(), Some("p1"));
        assert_eq!(cfg.stream.batch_size, 50);
        assert_eq!(cfg.stream.max_wait(), Some(Duration::from_millis(2500)));
        assert_eq!(cfg.stream.rss_limit_mb, Some(1000));
        assert_eq!(cfg.mutation.concurrency, MutatorConfig::default().concurrency);
    }

    #[test]
    fn test_invalid_json_values_rejected() {
        let err = ClientConfig::from_json(r#"{ "stream": { "batch_size": 0 } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = ClientConfig::from_json(r#"{ "mutation": { "max_items_per_call": 501 } }"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = ClientConfig::from_json(r#"{ "stream": { "max_wait_seconds": 1e-10 } }"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = ClientConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "mutation": {{ "concurrency": 2 }} }}"#).unwrap();
        let cfg = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.mutation.concurrency, 2);

        let err = ClientConfig::from_file("/nonexistent/cloudstore.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_explicit_project_id_wins() {
        let cfg = ClientConfig {
            project_id: Some("explicit".into()),
            ..ClientConfig::default()
        };
        assert_eq!(cfg.resolve_project_id().as_deref(), Some("explicit"));
    }
}
