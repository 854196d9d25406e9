//! Command-line entry point for the function watchdog.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use anyhow::{Context, Result};
use clap::Parser;
use fwatchdog::{Config, Health, Watchdog, default_lock_path, lock_file_present};
use tracing_subscriber::EnvFilter;

/// Runs the process named by `fprocess` for every HTTP request.
///
/// Configuration is read from the environment: `fprocess`, `port`,
/// `metrics_port`, `read_timeout`, `write_timeout`, `exec_timeout`,
/// `shutdown_timeout`, `max_inflight`, `content_type` and the boolean
/// switches `write_debug`, `combine_output`, `cgi_headers`,
/// `marshal_request`, `suppress_lock`, `debug_headers` and `afterburn`.
#[derive(Parser)]
#[command(name = "fwatchdog", version, about)]
struct Cli {
    /// Exit 0 if the lock file is present, 1 otherwise.
    #[arg(long)]
    run_healthcheck: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.run_healthcheck {
        if lock_file_present(&default_lock_path()) {
            std::process::exit(0);
        }
        eprintln!("unable to find lock file.");
        std::process::exit(1);
    }

    init_tracing();
    if let Err(e) = run().await {
        eprintln!("fwatchdog: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run() -> Result<()> {
    let config = Config::from_process_env().context("invalid configuration")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting fwatchdog");
    tracing::info!(
        read_timeout = ?config.read_timeout,
        write_timeout = ?config.write_timeout,
        exec_timeout = ?config.exec_timeout,
        shutdown_timeout = ?config.shutdown_timeout,
        "timeouts"
    );
    tracing::info!(
        fprocess = %config.process.join(" "),
        afterburn = config.afterburn,
        max_inflight = config.max_inflight,
        "function"
    );

    let watchdog = Watchdog::new(config, Health::new(default_lock_path()))
        .await
        .context("failed to start watchdog")?;
    watchdog.run(shutdown_signal()).await?;
    Ok(())
}

/// Resolves on the first SIGTERM or SIGINT.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGINT handler");
            sigterm.recv().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }
}
