//! HTTP-to-process shim that turns any UNIX executable into a function.
//!
//! Every request on the function port starts the configured process, pipes
//! the request body to its stdin and returns its stdout as the response.
//! Request metadata reaches the process as `Http_*` environment variables.
//!
//! ```no_run
//! use fwatchdog::{Config, Health, Watchdog, default_lock_path};
//!
//! # async fn run() -> fwatchdog::Result<()> {
//! let config = Config::for_process("cat")?;
//! let watchdog = Watchdog::new(config, Health::new(default_lock_path())).await?;
//! watchdog.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```
//!
//! With `afterburn` enabled the process is started once and must speak
//! HTTP/1.1 over its stdio instead.

mod afterburn;
pub mod config;
mod error;
pub mod exec;
mod handler;
mod health;
mod limiter;
mod metrics;
mod server;

pub use afterburn::{Afterburn, ExitMonitor};
pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use handler::{DURATION_HEADER, FunctionState, canonical_header_key, handle};
pub use health::{Health, LOCK_FILE_NAME, default_lock_path, lock_file_present};
pub use limiter::{ConcurrencyLimiter, HeldPermit, Permit};
pub use metrics::Metrics;
pub use server::{MAX_HEADER_BYTES, Watchdog};
