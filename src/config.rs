//! Configuration for the Periscope daemon.
//!
//! All configuration comes from environment variables; there is no config
//! file. Every tunable has a default, so a bare `periscope` invocation works
//! on a standard setup.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PERISCOPE_HOOK_PORT` | 4451 | Hook ingest + audit log server port |
//! | `PERISCOPE_STREAM_PORT` | 4450 | Snapshot stream (WebSocket) port |
//! | `PERISCOPE_DEBOUNCE_MS` | 200 | Per-file write coalescing delay |
//! | `PERISCOPE_PERMISSION_DELAY_MS` | 3000 | Permission debounce delay |
//! | `PERISCOPE_STALE_CHECK_INTERVAL_MS` | 10000 | Stale check period |
//! | `PERISCOPE_STALE_THRESHOLD_MS` | 60000 | Silence threshold for `working` |
//! | `PERISCOPE_IDLE_DISPLAY_THRESHOLD_MS` | 3600000 | Consumer-side display hint |
//! | `PERISCOPE_LOG_DIR` | `~/.claude/projects` | Watched transcript tree |
//! | `PERISCOPE_DATA_DIR` | `~/.periscope` | Audit logs and repo cache |
//! | `PERISCOPE_SUMMARIZER_URL` | unset | Summarizer endpoint (disabled when unset) |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

/// Default hook ingest port.
const DEFAULT_HOOK_PORT: u16 = 4451;

/// Default snapshot stream port.
const DEFAULT_STREAM_PORT: u16 = 4450;

/// Default per-file write coalescing delay in milliseconds.
const DEFAULT_DEBOUNCE_MS: u64 = 200;

/// Default permission debounce delay in milliseconds.
const DEFAULT_PERMISSION_DELAY_MS: u64 = 3000;

/// Default stale check interval in milliseconds.
const DEFAULT_STALE_CHECK_INTERVAL_MS: u64 = 10_000;

/// Default silence threshold for `working` sessions in milliseconds.
const DEFAULT_STALE_THRESHOLD_MS: u64 = 60_000;

/// Default idle display threshold in milliseconds (one hour).
const DEFAULT_IDLE_DISPLAY_THRESHOLD_MS: u64 = 3_600_000;

/// Default transcript directory relative to home.
const DEFAULT_LOG_DIR: &str = ".claude/projects";

/// Default data directory relative to home.
const DEFAULT_DATA_DIR: &str = ".periscope";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// The environment variable name.
        key: String,
        /// Description of why the value is invalid.
        message: String,
    },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

impl ConfigError {
    /// Creates a new invalid-value error.
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Runtime configuration for the daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for `POST /hook` and `GET /logs/{sessionId}` (loopback only).
    pub hook_port: u16,

    /// Port for the snapshot stream WebSocket (loopback only).
    pub stream_port: u16,

    /// Quiet period before a modified log file is re-read.
    pub coalesce_delay: Duration,

    /// Delay before a permission request is surfaced; auto-approved tools
    /// complete inside this window and never flicker into "needs approval".
    pub permission_delay: Duration,

    /// Period of the global stale check.
    pub stale_check_interval: Duration,

    /// Silence threshold after which a `working` session is stopped.
    pub stale_threshold: Duration,

    /// Hint for consumers about when to hide idle sessions. The daemon does
    /// not act on it; it is surfaced via `/health`.
    pub idle_display_threshold: Duration,

    /// Root of the watched transcript tree.
    pub log_dir: PathBuf,

    /// Directory for audit logs and the persistent repo cache.
    pub data_dir: PathBuf,

    /// Endpoint of the external summarizer, if any.
    pub summarizer_url: Option<String>,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a set variable cannot be parsed, or the
    /// home directory cannot be determined while a path default is needed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let hook_port = parse_port("PERISCOPE_HOOK_PORT", DEFAULT_HOOK_PORT)?;
        let stream_port = parse_port("PERISCOPE_STREAM_PORT", DEFAULT_STREAM_PORT)?;

        let coalesce_delay = parse_millis("PERISCOPE_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?;
        let permission_delay =
            parse_millis("PERISCOPE_PERMISSION_DELAY_MS", DEFAULT_PERMISSION_DELAY_MS)?;
        let stale_check_interval = parse_millis(
            "PERISCOPE_STALE_CHECK_INTERVAL_MS",
            DEFAULT_STALE_CHECK_INTERVAL_MS,
        )?;
        let stale_threshold =
            parse_millis("PERISCOPE_STALE_THRESHOLD_MS", DEFAULT_STALE_THRESHOLD_MS)?;
        let idle_display_threshold = parse_millis(
            "PERISCOPE_IDLE_DISPLAY_THRESHOLD_MS",
            DEFAULT_IDLE_DISPLAY_THRESHOLD_MS,
        )?;

        let log_dir = match env::var("PERISCOPE_LOG_DIR") {
            Ok(val) => PathBuf::from(val),
            Err(_) => home_dir()?.join(DEFAULT_LOG_DIR),
        };
        let data_dir = match env::var("PERISCOPE_DATA_DIR") {
            Ok(val) => PathBuf::from(val),
            Err(_) => home_dir()?.join(DEFAULT_DATA_DIR),
        };

        let summarizer_url = env::var("PERISCOPE_SUMMARIZER_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        Ok(Self {
            hook_port,
            stream_port,
            coalesce_delay,
            permission_delay,
            stale_check_interval,
            stale_threshold,
            idle_display_threshold,
            log_dir,
            data_dir,
            summarizer_url,
        })
    }

    /// Creates a configuration rooted at the given directories with default
    /// timings. Intended for tests and embedding.
    #[must_use]
    pub fn for_dirs(log_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            hook_port: DEFAULT_HOOK_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            coalesce_delay: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            permission_delay: Duration::from_millis(DEFAULT_PERMISSION_DELAY_MS),
            stale_check_interval: Duration::from_millis(DEFAULT_STALE_CHECK_INTERVAL_MS),
            stale_threshold: Duration::from_millis(DEFAULT_STALE_THRESHOLD_MS),
            idle_display_threshold: Duration::from_millis(DEFAULT_IDLE_DISPLAY_THRESHOLD_MS),
            log_dir,
            data_dir,
            summarizer_url: None,
        }
    }

    /// Directory holding the per-session audit logs.
    #[must_use]
    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Path of the persistent repo cache.
    #[must_use]
    pub fn repo_cache_path(&self) -> PathBuf {
        self.data_dir.join("repo-cache.json")
    }
}

/// Resolves the home directory.
fn home_dir() -> Result<PathBuf, ConfigError> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDirectory)
}

/// Parses an optional port environment variable.
fn parse_port(key: &str, default: u16) -> Result<u16, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u16>()
            .map_err(|_| ConfigError::invalid(key, format!("expected port number, got '{val}'"))),
        Err(_) => Ok(default),
    }
}

/// Parses an optional millisecond-duration environment variable.
fn parse_millis(key: &str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::invalid(key, format!("expected milliseconds, got '{val}'"))),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_dirs_uses_defaults() {
        let config = Config::for_dirs(PathBuf::from("/logs"), PathBuf::from("/data"));
        assert_eq!(config.hook_port, 4451);
        assert_eq!(config.stream_port, 4450);
        assert_eq!(config.coalesce_delay, Duration::from_millis(200));
        assert_eq!(config.permission_delay, Duration::from_millis(3000));
        assert_eq!(config.stale_check_interval, Duration::from_secs(10));
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.idle_display_threshold, Duration::from_secs(3600));
        assert!(config.summarizer_url.is_none());
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let config = Config::for_dirs(PathBuf::from("/logs"), PathBuf::from("/data"));
        assert_eq!(config.audit_dir(), PathBuf::from("/data/logs"));
        assert_eq!(
            config.repo_cache_path(),
            PathBuf::from("/data/repo-cache.json")
        );
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::invalid("PERISCOPE_HOOK_PORT", "expected port number, got 'x'");
        assert_eq!(
            err.to_string(),
            "invalid value for PERISCOPE_HOOK_PORT: expected port number, got 'x'"
        );
    }
}
