//! Function endpoint: turns one HTTP request into one child invocation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use fwatchdog_proto::{Envelope, FormEnvelope, FormField, Headers};

use crate::afterburn::Afterburn;
use crate::config::Config;
use crate::exec::{self, ChildResult, Exit, Invocation};
use crate::limiter::HeldPermit;

/// Response header carrying the invocation wall time.
pub const DURATION_HEADER: &str = "X-Duration-Seconds";

/// Methods routed to the function.
const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

/// Shared state of the function endpoint.
#[derive(Debug, Clone)]
pub struct FunctionState {
    /// Watchdog configuration.
    pub config: Arc<Config>,
    /// Long-lived child, when running in afterburn mode.
    pub afterburn: Option<Arc<Afterburn>>,
}

/// Entry point for every function request.
pub async fn handle(State(state): State<FunctionState>, req: Request) -> Response {
    if !ALLOWED_METHODS.contains(req.method()) {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if state.config.debug_headers {
        debug_headers(req.headers(), "in");
    }

    let res = match &state.afterburn {
        Some(afterburn) => afterburn.forward(req, &state.config).await,
        None => pipe_request(&state.config, req).await,
    };

    if state.config.debug_headers {
        debug_headers(res.headers(), "out");
    }
    res
}

/// Forking mode: one child per request.
async fn pipe_request(config: &Arc<Config>, req: Request) -> Response {
    let started = Instant::now();
    let permit = req.extensions().get::<HeldPermit>().and_then(HeldPermit::take);
    let (parts, body) = req.into_parts();

    let body = match read_body(body, config.read_timeout).await {
        Ok(body) => body,
        Err(e) => return bad_request(&e),
    };
    let input = match build_input(config, &parts, body.clone()).await {
        Ok(input) => input,
        Err(e) => return bad_request(&e),
    };
    let env = if config.cgi_headers {
        cgi_env(&parts, body.len())
    } else {
        Vec::new()
    };

    tracing::debug!(method = %parts.method, uri = %parts.uri, "forking fprocess");
    let inv = Invocation {
        argv: config.process.clone(),
        env,
        body: input,
        timeout: config.exec_timeout,
        combine_output: config.combine_output,
    };

    // Detached so that a client disconnect lets the child run to completion.
    // The concurrency slot stays taken until the child is done.
    let task = tokio::spawn(async move {
        let outcome = exec::run(&inv).await;
        drop(permit);
        outcome
    });
    let result = match task.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "invocation task failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")).into_response();
        }
    };

    respond(config, &parts.headers, result, started)
}

/// Maps a finished invocation onto exactly one response.
fn respond(config: &Config, req_headers: &HeaderMap, result: ChildResult, started: Instant) -> Response {
    if result.timed_out {
        return (StatusCode::REQUEST_TIMEOUT, "Killed process.\n").into_response();
    }

    if !result.exit.success() {
        if config.write_debug {
            tracing::info!(
                exit = %result.exit,
                out = %String::from_utf8_lossy(&result.stdout),
                "function failed"
            );
        }
        let mut body = format!("{}\n", result.exit).into_bytes();
        if !matches!(result.exit, Exit::SpawnError(_)) {
            body.extend_from_slice(&result.stdout);
        }
        return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
    }

    let elapsed = started.elapsed();
    if config.write_debug {
        tracing::info!("{}", String::from_utf8_lossy(&result.stdout));
        tracing::info!(seconds = elapsed.as_secs_f64(), "duration");
    } else {
        tracing::info!(
            bytes = result.stdout.len(),
            seconds = elapsed.as_secs_f64(),
            "wrote {} bytes",
            result.stdout.len()
        );
    }

    let mut headers = HeaderMap::new();
    if let Some(content_type) = response_content_type(config, req_headers) {
        headers.insert(CONTENT_TYPE, content_type);
    }
    headers.insert(
        HeaderName::from_static("x-duration-seconds"),
        duration_value(elapsed),
    );
    (StatusCode::OK, headers, result.stdout).into_response()
}

/// `X-Duration-Seconds` value: decimal seconds with six fractional digits.
pub(crate) fn duration_value(elapsed: Duration) -> HeaderValue {
    HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64()))
        .unwrap_or(HeaderValue::from_static("0.000000"))
}

/// Configured override first, else the caller's own `Content-Type`.
fn response_content_type(config: &Config, req_headers: &HeaderMap) -> Option<HeaderValue> {
    match &config.content_type {
        Some(forced) => match HeaderValue::from_str(forced) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(content_type = %forced, "ignoring invalid content_type override");
                None
            }
        },
        None => req_headers.get(CONTENT_TYPE).cloned(),
    }
}

/// `400` with `message` as the body.
fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, format!("{message}\n")).into_response()
}

/// Buffers the whole request body within `limit`.
pub(crate) async fn read_body(body: Body, limit: Duration) -> Result<Bytes, String> {
    match tokio::time::timeout(limit, axum::body::to_bytes(body, usize::MAX)).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(format!("cannot read request body: {e}")),
        Err(_) => Err(format!("cannot read request body: timed out after {limit:?}")),
    }
}

/// Produces the bytes piped to the child: the raw body, or an envelope.
async fn build_input(config: &Config, parts: &Parts, body: Bytes) -> Result<Bytes, String> {
    if !config.marshal_request {
        return Ok(body);
    }

    let header = envelope_headers(&parts.headers);
    let encoded = if is_multipart(&parts.headers) {
        let form = read_form(&parts.headers, body).await?;
        fwatchdog_proto::encode(&FormEnvelope { header, form })
    } else {
        fwatchdog_proto::encode(&Envelope::new(body.to_vec(), header))
    };
    encoded.map(Bytes::from).map_err(|e| e.to_string())
}

/// Whether the body is `multipart/form-data`.
fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
}

/// Decodes a `multipart/form-data` body into envelope fields.
async fn read_form(
    headers: &HeaderMap,
    body: Bytes,
) -> Result<std::collections::BTreeMap<String, FormField>, String> {
    let mut req = Request::new(Body::from(body));
    *req.headers_mut() = headers.clone();
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| e.body_text())?;

    let mut form = std::collections::BTreeMap::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        let name = field.name().unwrap_or_default().to_owned();
        let filename = field.file_name().map(str::to_owned);
        let data = field.bytes().await.map_err(|e| e.body_text())?;
        let value = match filename {
            Some(_) => FormField::file(filename, &data),
            None => FormField::text(String::from_utf8_lossy(&data)),
        };
        form.insert(name, value);
    }
    Ok(form)
}

/// Header set in canonical form, every value kept.
fn envelope_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        out.entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

/// Builds the `Http_*` environment overlay.
fn cgi_env(parts: &Parts, body_len: usize) -> Vec<String> {
    let mut envs = Vec::with_capacity(parts.headers.keys_len() + 5);

    for name in parts.headers.keys() {
        if *name == HOST {
            continue;
        }
        if let Some(value) = parts.headers.get(name) {
            envs.push(format!(
                "Http_{}={}",
                canonical_header_key(name.as_str()).replace('-', "_"),
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
    }

    envs.push(format!("Http_Method={}", parts.method));

    let content_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(body_len as u64);
    envs.push(format!("Http_ContentLength={content_length}"));

    if let Some(query) = parts.uri.query().filter(|q| !q.is_empty()) {
        envs.push(format!("Http_Query={query}"));
    }
    let path = parts.uri.path();
    if !path.is_empty() {
        envs.push(format!("Http_Path={path}"));
    }
    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| parts.uri.authority().map(ToString::to_string));
    if let Some(host) = host.filter(|h| !h.is_empty()) {
        envs.push(format!("Http_Host={host}"));
    }

    envs
}

/// Canonical MIME header form: `content-type` becomes `Content-Type`.
pub fn canonical_header_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Logs every header, tagged with the direction.
fn debug_headers(headers: &HeaderMap, direction: &str) {
    for (name, value) in headers {
        tracing::info!("[{direction}] {}={:?}", canonical_header_key(name.as_str()), value);
    }
}
