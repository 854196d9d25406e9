//! Prometheus metrics for function traffic.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `http_requests_total` | Counter | `code`, `method` |
//! | `http_request_duration_seconds` | Histogram | `code`, `method` |
//!
//! Each [`Metrics`] owns its own registry, so several watchdogs (or tests)
//! can run in one process without colliding.

use std::fmt;
use std::time::Instant;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

/// Request counter and latency histogram.
#[derive(Clone)]
pub struct Metrics {
    /// Registry owning both families.
    registry: Registry,
    /// `http_requests_total`.
    requests_total: CounterVec,
    /// `http_request_duration_seconds`.
    request_duration: HistogramVec,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates and registers both metric families in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("requests_total", "total HTTP requests processed").subsystem("http"),
            &["code", "method"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "Seconds spent serving HTTP requests.",
            )
            .subsystem("http")
            .buckets(prometheus::DEFAULT_BUCKETS.to_vec()),
            &["code", "method"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
        })
    }

    /// Records one finished request. `method` is lower-cased.
    pub fn observe(&self, method: &str, code: u16, seconds: f64) {
        let method = method.to_ascii_lowercase();
        let code = code.to_string();
        let labels = [code.as_str(), method.as_str()];
        self.requests_total.with_label_values(&labels).inc();
        self.request_duration
            .with_label_values(&labels)
            .observe(seconds);
    }

    /// Number of requests recorded for a status code and method.
    pub fn request_count(&self, code: u16, method: &str) -> f64 {
        let method = method.to_ascii_lowercase();
        self.requests_total
            .with_label_values(&[code.to_string().as_str(), method.as_str()])
            .get()
    }

    /// Encodes every metric in the Prometheus text exposition format.
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Router serving `GET /metrics`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(scrape))
            .with_state(self.clone())
    }
}

/// `GET /metrics` handler.
async fn scrape(State(metrics): State<Metrics>) -> Response {
    match metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

/// Middleware recording status code, method and duration of each request.
pub async fn track(State(metrics): State<Metrics>, req: Request, next: Next) -> Response {
    let method = req.method().as_str().to_owned();
    let t0 = Instant::now();
    let res = next.run(req).await;
    metrics.observe(&method, res.status().as_u16(), t0.elapsed().as_secs_f64());
    res
}
