/// Relay configuration
///
/// Values come from the process environment (after loading `.env` if present)
/// and fall back to defaults; `serve` flags override them afterwards.
use anyhow::{ensure, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::BackoffPolicy;
use crate::session::SessionOptions;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub port: u16,
    pub database_path: PathBuf,

    /// Orders delivered to a newly connected observer
    pub snapshot_limit: usize,
    pub snapshot_timeout: Duration,

    /// Per-observer outbound queue bound
    pub session_queue_capacity: usize,

    /// Change-log polling period
    pub feed_poll_interval: Duration,
    pub feed_retry_base: Duration,
    pub feed_retry_max: Duration,

    /// Change-log rows kept by periodic compaction
    pub change_log_retention: usize,
    pub compaction_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_path: PathBuf::from("orderfeed.db"),
            snapshot_limit: 10,
            snapshot_timeout: Duration::from_secs(5),
            session_queue_capacity: 256,
            feed_poll_interval: Duration::from_millis(250),
            feed_retry_base: Duration::from_secs(2),
            feed_retry_max: Duration::from_secs(60),
            change_log_retention: 10_000,
            compaction_interval: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            port: parse_var(&lookup, "PORT")?.unwrap_or(defaults.port),
            database_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            snapshot_limit: parse_var(&lookup, "SNAPSHOT_LIMIT")?
                .unwrap_or(defaults.snapshot_limit),
            snapshot_timeout: millis_var(&lookup, "SNAPSHOT_TIMEOUT_MS")?
                .unwrap_or(defaults.snapshot_timeout),
            session_queue_capacity: parse_var(&lookup, "SESSION_QUEUE_CAPACITY")?
                .unwrap_or(defaults.session_queue_capacity),
            feed_poll_interval: millis_var(&lookup, "FEED_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.feed_poll_interval),
            feed_retry_base: millis_var(&lookup, "FEED_RETRY_BASE_MS")?
                .unwrap_or(defaults.feed_retry_base),
            feed_retry_max: millis_var(&lookup, "FEED_RETRY_MAX_MS")?
                .unwrap_or(defaults.feed_retry_max),
            change_log_retention: parse_var(&lookup, "CHANGE_LOG_RETENTION")?
                .unwrap_or(defaults.change_log_retention),
            compaction_interval: defaults.compaction_interval,
        };

        ensure!(
            config.change_log_retention > 0,
            "invalid CHANGE_LOG_RETENTION: must keep at least one row"
        );
        ensure!(
            !config.feed_retry_base.is_zero(),
            "invalid FEED_RETRY_BASE_MS: must be greater than zero"
        );
        Ok(config)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            snapshot_limit: self.snapshot_limit,
            snapshot_timeout: self.snapshot_timeout,
            queue_capacity: self.session_queue_capacity,
        }
    }

    /// Resubscription policy of the change-feed watcher. Never gives up.
    pub fn feed_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::unbounded(self.feed_retry_base, self.feed_retry_max)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid {key}: '{raw}'"))
        })
        .transpose()
}

fn millis_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(lookup, key)?.map(Duration::from_millis))
}
