//! Error types for the Periscope daemon.
//!
//! Per-module errors (config, parser, summarizer) live next to the code
//! that produces them; this module defines the top-level error used on the
//! fatal startup path. Runtime per-session failures are deliberately not
//! represented here — they are swallowed best-effort where they occur and
//! must never take down the daemon or another session.

use thiserror::Error;

use crate::config::ConfigError;

/// Fatal errors that propagate to the process entry point.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The filesystem watcher could not be initialized.
    #[error("failed to start log watcher: {0}")]
    Watcher(#[from] notify::Error),

    /// I/O failure during startup (directory creation, initial scan).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for daemon startup operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts() {
        let err: DaemonError = ConfigError::invalid("PERISCOPE_HOOK_PORT", "not a port").into();
        assert!(matches!(err, DaemonError::Config(_)));
        assert!(err.to_string().starts_with("configuration error"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DaemonError = io.into();
        assert!(matches!(err, DaemonError::Io(_)));
    }
}
