//! Error types for watchdog operations.

use std::net::SocketAddr;

use crate::config::ConfigError;

/// Alias for `Result<T, fwatchdog::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while starting or running the watchdog.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The environment did not describe a valid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A listener could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Address the listener tried to bind.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// The readiness lock file could not be written.
    #[error("cannot write lock file {path}: {source}")]
    LockFile {
        /// Lock file location.
        path: std::path::PathBuf,
        /// Underlying file system error.
        source: std::io::Error,
    },

    /// Metric registration failed.
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The afterburn child could not be started or exited.
    #[error("afterburn: {0}")]
    Afterburn(String),

    /// An I/O error from the server or process plumbing.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
