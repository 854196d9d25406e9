//! Listener wiring, accept loop and graceful shutdown.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::middleware;
use axum::routing::any;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tower::ServiceExt;

use crate::afterburn::{Afterburn, ExitMonitor};
use crate::config::Config;
use crate::handler::{self, FunctionState};
use crate::health::{self, Health};
use crate::limiter::{self, ConcurrencyLimiter};
use crate::metrics::{self, Metrics};
use crate::{Error, Result};

/// Largest request head accepted on the function port.
pub const MAX_HEADER_BYTES: usize = 1 << 20;

/// Pause after a failed `accept`, e.g. while out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One watchdog instance and every collaborator it owns.
#[derive(Debug)]
pub struct Watchdog {
    /// Effective configuration, shared with the handlers.
    config: Arc<Config>,
    /// Readiness state and lock file.
    health: Health,
    /// Request metrics.
    metrics: Metrics,
    /// In-flight cap; `None` when unlimited.
    limiter: Option<Arc<ConcurrencyLimiter>>,
    /// Persistent child in afterburn mode.
    afterburn: Option<Arc<Afterburn>>,
    /// Resolves when the afterburn child exits; taken by `serve`.
    afterburn_exit: Option<ExitMonitor>,
}

impl Watchdog {
    /// Builds the collaborators. In afterburn mode the persistent child is
    /// started here.
    pub async fn new(config: Config, health: Health) -> Result<Self> {
        let metrics = Metrics::new()?;
        let limiter = ConcurrencyLimiter::new(config.max_inflight);

        let (afterburn, afterburn_exit) = if config.afterburn {
            let (afterburn, exit) = Afterburn::spawn(&config.process, health.clone()).await?;
            (Some(Arc::new(afterburn)), Some(exit))
        } else {
            (None, None)
        };

        Ok(Self {
            config: Arc::new(config),
            health,
            metrics,
            limiter,
            afterburn,
            afterburn_exit,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Readiness state.
    pub fn health(&self) -> &Health {
        &self.health
    }

    /// Metrics registry.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Function routes plus `/_/health`.
    pub fn router(&self) -> Router {
        let state = FunctionState {
            config: Arc::clone(&self.config),
            afterburn: self.afterburn.clone(),
        };

        let mut function = Router::new()
            .route("/", any(handler::handle))
            .route("/*path", any(handler::handle))
            .with_state(state)
            .layer(middleware::from_fn_with_state(
                self.metrics.clone(),
                metrics::track,
            ));
        if let Some(limiter) = &self.limiter {
            function = function.layer(middleware::from_fn_with_state(
                Arc::clone(limiter),
                limiter::limit,
            ));
        }

        Router::new()
            .route("/_/health", any(health::health))
            .with_state(self.health.clone())
            .merge(function)
    }

    /// `GET /metrics`, served on its own port.
    pub fn metrics_router(&self) -> Router {
        self.metrics.router()
    }

    /// Binds `0.0.0.0:port` and `0.0.0.0:metrics_port`, then serves until
    /// `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let listener = bind(self.config.port).await?;
        let metrics_listener = bind(self.config.metrics_port).await?;
        self.serve(listener, metrics_listener, shutdown).await
    }

    /// Serves on already-bound listeners.
    ///
    /// Once `shutdown` resolves the watchdog is marked unhealthy, stops
    /// accepting and waits up to `shutdown_timeout` for open connections
    /// before dropping them. An exiting afterburn child ends the server with
    /// an error.
    pub async fn serve(
        mut self,
        listener: TcpListener,
        metrics_listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        if self.config.suppress_lock {
            self.health.accept_without_lock();
        } else {
            self.health.mark_ready()?;
        }

        let (stop_metrics, metrics_stopped) = oneshot::channel::<()>();
        let metrics_server = axum::serve(metrics_listener, self.metrics_router())
            .with_graceful_shutdown(async move {
                let _ = metrics_stopped.await;
            });
        let metrics_task = tokio::spawn(async move { metrics_server.await });
        tracing::info!(port = self.config.metrics_port, "metrics listening");

        tracing::info!(addr = %listener.local_addr()?, "listening");

        let router = self.router();
        let write_timeout = self.config.write_timeout;
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.read_timeout)
            .max_buf_size(MAX_HEADER_BYTES);

        let graceful = GracefulShutdown::new();
        let mut connections = JoinSet::new();
        let afterburn_exit = wait_exit(self.afterburn_exit.take());
        tokio::pin!(shutdown, afterburn_exit);

        let outcome = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let router = router.clone();
                    let svc = service_fn(move |req: hyper::Request<Incoming>| {
                        let router = router.clone();
                        async move {
                            match tokio::time::timeout(write_timeout, router.oneshot(req.map(Body::new))).await {
                                Ok(Ok(res)) => Ok(res),
                                Ok(Err(never)) => match never {},
                                Err(_) => Err(io::Error::new(
                                    io::ErrorKind::TimedOut,
                                    format!("response not ready within {write_timeout:?}"),
                                )),
                            }
                        }
                    });
                    let conn = graceful.watch(builder.serve_connection(TokioIo::new(stream), svc));
                    connections.spawn(async move {
                        if let Err(e) = conn.await {
                            tracing::debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                () = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                reason = &mut afterburn_exit => {
                    break Err(Error::Afterburn(reason));
                }
            }
        };

        if let Err(e) = self.health.mark_unhealthy() {
            tracing::warn!(error = %e, "failed to remove lock-file");
        }
        drop(listener);

        let grace = self.config.shutdown_timeout;
        tracing::info!(
            inflight = connections.len(),
            ?grace,
            "waiting for in-flight connections"
        );
        if tokio::time::timeout(grace, graceful.shutdown()).await.is_err() {
            tracing::warn!(remaining = connections.len(), "shutdown timeout expired, closing connections");
            connections.abort_all();
        }
        while connections.join_next().await.is_some() {}

        let _ = stop_metrics.send(());
        match metrics_task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "metrics server failed"),
            Err(e) => tracing::warn!(error = %e, "metrics task failed"),
            Ok(Ok(())) => {}
        }
        tracing::info!("shutdown complete");
        outcome
    }
}

/// Binds `0.0.0.0:port`.
async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })
}

/// Resolves with a description once the afterburn child exits; never
/// resolves in forking mode.
async fn wait_exit(monitor: Option<ExitMonitor>) -> String {
    let Some(monitor) = monitor else {
        return std::future::pending().await;
    };
    match monitor.await {
        Ok(Ok(status)) => format!("process exited: {status}"),
        Ok(Err(e)) => format!("cannot wait on process: {e}"),
        Err(e) => format!("monitor task failed: {e}"),
    }
}
