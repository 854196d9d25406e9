//! Afterburn mode: one long-lived child speaking HTTP/1.1 over its stdio.
//!
//! The request is written to the child's stdin in wire format and the
//! response parsed back from its stdout. Exchanges are serialised through a
//! mutex, so at most one request is outstanding at a time.

use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::handler::{duration_value, read_body};
use crate::health::Health;
use crate::{Error, Result};

/// Headers that describe one connection hop and are never relayed.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
];

/// The child's stdin and stdout joined into one duplex stream.
#[derive(Debug)]
struct ChildIo {
    /// Request direction.
    stdin: ChildStdin,
    /// Response direction.
    stdout: ChildStdout,
}

impl AsyncRead for ChildIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// Handle to the persistent child.
#[derive(Debug)]
pub struct Afterburn {
    /// Client half of the connection; one exchange at a time.
    sender: Mutex<SendRequest<Full<Bytes>>>,
}

/// Resolves when the persistent child exits.
pub type ExitMonitor = JoinHandle<io::Result<ExitStatus>>;

impl Afterburn {
    /// Starts the child and the HTTP/1.1 client over its stdio.
    ///
    /// The returned monitor resolves once the child exits, after `health`
    /// has been marked unhealthy.
    pub async fn spawn(argv: &[String], health: Health) -> Result<(Self, ExitMonitor)> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::Afterburn("empty command line".into()));
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Afterburn(format!("cannot start {program}: {e}")))?;
        tracing::info!(pid = child.id(), cmd = %argv.join(" "), "started afterburn process");

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(Error::Afterburn("child stdio not captured".into()));
        };

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "fwatchdog::function", "{line}");
            }
        });

        let (sender, conn) = http1::handshake(TokioIo::new(ChildIo { stdin, stdout }))
            .await
            .map_err(|e| Error::Afterburn(format!("handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::warn!(error = %e, "afterburn connection closed");
            }
        });

        let monitor = tokio::spawn(async move {
            let status = child.wait().await;
            tracing::error!(?status, "afterburn process exited");
            if let Err(e) = health.mark_unhealthy() {
                tracing::warn!(error = %e, "failed to remove lock-file");
            }
            status
        });

        Ok((
            Self {
                sender: Mutex::new(sender),
            },
            monitor,
        ))
    }

    /// Relays one request to the child and its response back.
    pub async fn forward(&self, req: Request, config: &Config) -> Response {
        let started = Instant::now();
        let (mut parts, body) = req.into_parts();

        let body = match read_body(body, config.read_timeout).await {
            Ok(body) => body,
            Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response(),
        };
        strip_hop_by_hop(&mut parts.headers);
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        let req = hyper::Request::from_parts(parts, Full::new(body));

        let relayed = {
            let mut sender = self.sender.lock().await;
            exchange(&mut sender, req).await
        };

        match relayed {
            Ok((mut parts, body)) => {
                strip_hop_by_hop(&mut parts.headers);
                parts.headers.insert(
                    HeaderName::from_static("x-duration-seconds"),
                    duration_value(started.elapsed()),
                );
                if config.write_debug {
                    tracing::info!("response: {}", String::from_utf8_lossy(&body));
                }
                Response::from_parts(parts, Body::from(body))
            }
            Err(e) => {
                tracing::error!(error = %e, "afterburn exchange failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Sends one request and buffers the whole response.
async fn exchange(
    sender: &mut SendRequest<Full<Bytes>>,
    req: hyper::Request<Full<Bytes>>,
) -> hyper::Result<(axum::http::response::Parts, Bytes)> {
    sender.ready().await?;
    let res = sender.send_request(req).await?;
    let (parts, body) = res.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok((parts, body))
}

/// Drops connection-scoped headers.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::health::LOCK_FILE_NAME;

    /// Answers every request (bodies are not read) with `200 ok`.
    const RESPONDER: &str = r#"
        while IFS= read -r line; do
          line=$(printf '%s' "$line" | tr -d '\r')
          if [ -z "$line" ]; then
            printf 'HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Child: yes\r\nConnection: keep-alive\r\n\r\nok'
          fi
        done
    "#;

    fn argv(cmd: &[&str]) -> Vec<String> {
        cmd.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn relays_requests_through_child() {
        let dir = tempfile::tempdir().unwrap();
        let health = Health::new(dir.path().join(LOCK_FILE_NAME));
        let config = Config::for_process("sh").unwrap();
        let (afterburn, _monitor) = Afterburn::spawn(&argv(&["sh", "-c", RESPONDER]), health)
            .await
            .unwrap();

        for _ in 0..2 {
            let req = Request::get("/fn").body(Body::empty()).unwrap();
            let res = afterburn.forward(req, &config).await;
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(res.headers()["x-child"], "yes");
            assert!(res.headers().contains_key("x-duration-seconds"));
            assert!(!res.headers().contains_key("connection"));
            let body = res.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, "ok");
        }
    }

    #[tokio::test]
    async fn child_exit_marks_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let health = Health::new(dir.path().join(LOCK_FILE_NAME));
        health.mark_ready().unwrap();

        let (_afterburn, monitor) = Afterburn::spawn(&argv(&["true"]), health.clone())
            .await
            .unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), monitor)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(status.success());
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn dead_child_yields_500() {
        let dir = tempfile::tempdir().unwrap();
        let health = Health::new(dir.path().join(LOCK_FILE_NAME));
        let config = Config::for_process("true").unwrap();
        let (afterburn, monitor) = Afterburn::spawn(&argv(&["true"]), health).await.unwrap();
        let _ = monitor.await;

        let req = Request::get("/").body(Body::empty()).unwrap();
        let res = afterburn.forward(req, &config).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let health = Health::new("/nonexistent/.lock");
        let err = Afterburn::spawn(&argv(&["/nonexistent/fwatchdog-fn"]), health)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Afterburn(_)));
    }
}
