//! Readiness lock file and the `/_/health` endpoint.
//!
//! The lock file is a zero-byte sentinel whose presence tells exec-style
//! health checks (and `fwatchdog --run-healthcheck`) that the watchdog has
//! finished starting up. It is removed as soon as shutdown begins.

use std::fs::{self, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::{Error, Result};

/// Name of the lock file inside the temporary directory.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Permissions of the lock file.
const LOCK_FILE_MODE: u32 = 0o660;

/// Default lock file location: `<tmpdir>/.lock`.
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join(LOCK_FILE_NAME)
}

/// Returns `true` if a lock file exists at `path`.
pub fn lock_file_present(path: &Path) -> bool {
    path.exists()
}

/// Readiness state shared by the server, the health handler and shutdown.
#[derive(Debug, Clone)]
pub struct Health {
    /// State shared by every clone.
    inner: Arc<Inner>,
}

/// Shared readiness state.
#[derive(Debug)]
struct Inner {
    /// Sentinel location.
    lock_path: PathBuf,
    /// Set between startup and shutdown.
    accepting: AtomicBool,
}

impl Health {
    /// Creates a health tracker using `lock_path` as the sentinel. Nothing
    /// is written until [`mark_ready`](Self::mark_ready).
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                lock_path: lock_path.into(),
                accepting: AtomicBool::new(false),
            }),
        }
    }

    /// Sentinel location.
    pub fn lock_path(&self) -> &Path {
        &self.inner.lock_path
    }

    /// Writes the empty lock file (mode `0660`) and starts accepting work.
    pub fn mark_ready(&self) -> Result<()> {
        let path = self.lock_path();
        tracing::info!(path = %path.display(), "writing lock-file");
        write_lock_file(path).map_err(|source| Error::LockFile {
            path: path.to_owned(),
            source,
        })?;
        self.inner.accepting.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Starts accepting work without a lock file.
    pub fn accept_without_lock(&self) {
        tracing::warn!(
            "\"suppress_lock\" is enabled. No automated health-checks will be in place for your function."
        );
        self.inner.accepting.store(true, Ordering::SeqCst);
    }

    /// Stops accepting work and removes the lock file.
    pub fn mark_unhealthy(&self) -> io::Result<()> {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let path = self.lock_path();
        tracing::info!(path = %path.display(), "removing lock-file");
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Whether startup completed and shutdown has not begun.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Healthy iff accepting and the lock file exists.
    pub fn is_healthy(&self) -> bool {
        self.is_accepting() && lock_file_present(self.lock_path())
    }
}

/// Creates or truncates the sentinel with mode `0660`.
fn write_lock_file(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(LOCK_FILE_MODE)
        .open(path)?;
    // The umask may have narrowed the mode at creation.
    fs::set_permissions(path, Permissions::from_mode(LOCK_FILE_MODE))
}

/// `GET /_/health`: `200 OK` when healthy, `503` otherwise.
pub async fn health(State(health): State<Health>, method: Method) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if health.is_healthy() {
        (StatusCode::OK, "OK").into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}
