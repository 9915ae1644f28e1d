//! # Configuration
//!
//! [`Config`] is an explicit value handed to [`Chronicles::open`]; nothing in
//! the crate reads global state. [`Config::from_env`] is a convenience for
//! binaries that want the usual environment overrides.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `CHRONICLES_DB_PATH` | `db_path` | `chronicles.db` |
//! | `CHRONICLES_DEFAULT_SCAN_LIMIT` | `default_scan_limit` | 500 |
//! | `CHRONICLES_REQUEST_TIMEOUT_MS` | `request_timeout` | 5000 |
//! | `CHRONICLES_READER_THREADS` | `reader_threads` | CPU count, 1..=16 |
//!
//! [`Chronicles::open`]: crate::Chronicles::open

use std::path::PathBuf;
use std::str::FromStr;
use std::thread::available_parallelism;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::schema::DEFAULT_BUSY_TIMEOUT;
use crate::types::DEFAULT_SCAN_LIMIT;

/// Minimum number of reader threads.
pub const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
pub const MAX_READ_THREADS: usize = 16;

/// Default deadline for one append, batch or scan round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for the health check ping.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

/// Default capacity of the write and read request channels.
pub const DEFAULT_CHANNEL_SIZE: usize = 4096;

/// Runtime configuration for a [`Chronicles`](crate::Chronicles) instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// SQLite database file. Created if it doesn't exist.
    pub db_path: PathBuf,

    /// Rows returned by a scan that doesn't set `limit`.
    pub default_scan_limit: usize,

    /// Deadline applied to a request that doesn't carry its own.
    pub request_timeout: Duration,

    /// Deadline for [`Chronicles::health_check`](crate::Chronicles::health_check).
    pub health_timeout: Duration,

    /// How long a connection waits on a locked database.
    pub busy_timeout: Duration,

    /// Reader pool size. Clamped to `MIN_READ_THREADS..=MAX_READ_THREADS`.
    pub reader_threads: usize,

    /// Capacity of the write and read request channels.
    pub channel_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("chronicles.db"),
            default_scan_limit: DEFAULT_SCAN_LIMIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            reader_threads: default_reader_threads(),
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

impl Config {
    /// Default configuration for the given database file.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Default configuration overlaid with `CHRONICLES_*` environment variables.
    ///
    /// # Errors
    ///
    /// `Error::Config` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("CHRONICLES_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "CHRONICLES_DEFAULT_SCAN_LIMIT")? {
            config.default_scan_limit = limit;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHRONICLES_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(threads) = parse_var::<usize>(&lookup, "CHRONICLES_READER_THREADS")? {
            config.reader_threads = threads;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_default_scan_limit(mut self, limit: usize) -> Self {
        self.default_scan_limit = limit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_reader_threads(mut self, threads: usize) -> Self {
        self.reader_threads = threads;
        self
    }

    /// Rejects values that would make the engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.default_scan_limit == 0 {
            return Err(Error::Config("default_scan_limit must be positive".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be positive".to_string()));
        }
        if self.health_timeout.is_zero() {
            return Err(Error::Config("health_timeout must be positive".to_string()));
        }
        if self.channel_size == 0 {
            return Err(Error::Config("channel_size must be positive".to_string()));
        }
        Ok(())
    }

    /// The reader pool size actually used.
    pub fn effective_reader_threads(&self) -> usize {
        self.reader_threads.clamp(MIN_READ_THREADS, MAX_READ_THREADS)
    }
}

fn default_reader_threads() -> usize {
    available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_READ_THREADS)
        .clamp(MIN_READ_THREADS, MAX_READ_THREADS)
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.default_scan_limit, 500);
        assert_eq!(config.health_timeout, Duration::from_secs(1));
        assert!((MIN_READ_THREADS..=MAX_READ_THREADS).contains(&config.reader_threads));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("CHRONICLES_DB_PATH", "/var/lib/chronicles/events.db"),
            ("CHRONICLES_DEFAULT_SCAN_LIMIT", "50"),
            ("CHRONICLES_REQUEST_TIMEOUT_MS", "750"),
            ("CHRONICLES_READER_THREADS", "64"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/var/lib/chronicles/events.db"));
        assert_eq!(config.default_scan_limit, 50);
        assert_eq!(config.request_timeout, Duration::from_millis(750));
        assert_eq!(config.effective_reader_threads(), MAX_READ_THREADS);
    }

    #[test]
    fn test_from_lookup_empty_uses_defaults() {
        let config = Config::from_lookup(lookup_from(&[("CHRONICLES_DB_PATH", "")])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = Config::from_lookup(lookup_from(&[("CHRONICLES_DEFAULT_SCAN_LIMIT", "lots")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_lookup(lookup_from(&[("CHRONICLES_DEFAULT_SCAN_LIMIT", "0")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let err = Config::default().with_health_timeout(Duration::ZERO).validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("health_timeout")));

        let err = Config::default().with_request_timeout(Duration::ZERO).validate().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("request_timeout")));
    }
}
