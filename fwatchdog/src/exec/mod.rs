//! Per-request process invocation with stdio plumbing and timeout kill.

mod pipe;

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// Monotonic counter used to tag invocations in logs.
static EXEC_SEQ: AtomicU64 = AtomicU64::new(1);

/// Everything needed to run the function once.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Command line; `argv[0]` is the executable.
    pub argv: Vec<String>,
    /// Environment overlay in `KEY=VALUE` form, applied over the inherited
    /// environment.
    pub env: Vec<String>,
    /// Bytes written to the child's stdin before it is closed.
    pub body: Bytes,
    /// Kill the child once this much time has passed since spawn.
    pub timeout: Option<Duration>,
    /// Merge stderr into stdout.
    pub combine_output: bool,
}

/// How the child finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Exited normally with this code.
    Code(i32),
    /// Terminated by this signal.
    Signal(i32),
    /// The child never started.
    SpawnError(String),
}

impl Exit {
    /// `true` for a zero exit code.
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit status {code}"),
            Self::Signal(sig) => write!(f, "signal: {sig}"),
            Self::SpawnError(msg) => write!(f, "spawn error: {msg}"),
        }
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone)]
pub struct ChildResult {
    /// Exit outcome.
    pub exit: Exit,
    /// Captured stdout, with stderr interleaved in combined mode.
    pub stdout: Vec<u8>,
    /// Captured stderr; always empty in combined mode.
    pub stderr: Vec<u8>,
    /// Wall time from spawn to the last byte drained.
    pub duration: Duration,
    /// The child was killed because the deadline expired.
    pub timed_out: bool,
}

/// Runs the function once and collects its output.
///
/// Never returns early: the stdin writer and every output drain are awaited
/// before the result is built, on every path.
pub async fn run(inv: &Invocation) -> ChildResult {
    let exec_id = EXEC_SEQ.fetch_add(1, Ordering::Relaxed);
    let spawn_t0 = Instant::now();

    let (mut child, drains) = match spawn(inv) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(exec_id, cmd = %inv.argv.join(" "), error = %e, "spawn failed");
            return ChildResult {
                exit: Exit::SpawnError(e.to_string()),
                stdout: Vec::new(),
                stderr: Vec::new(),
                duration: spawn_t0.elapsed(),
                timed_out: false,
            };
        }
    };
    let pid = child.id();
    tracing::debug!(exec_id, pid, "forked function process");

    let writer = tokio::spawn(write_stdin(child.stdin.take(), inv.body.clone()));
    let killer = inv
        .timeout
        .zip(pid)
        .map(|(limit, pid)| tokio::spawn(kill_after(exec_id, pid, limit)));

    // The deadline covers both the exit and the output drains, so a
    // descendant holding stdout open cannot outlive it.
    let waited = child.wait().await;
    let _ = writer.await;
    let (stdout, stderr) = drains.join().await;

    let timed_out = match killer {
        Some(killer) => {
            killer.abort();
            killer.await.unwrap_or(false)
        }
        None => false,
    };

    let exit = match waited {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => Exit::Code(code),
            (None, Some(sig)) => Exit::Signal(sig),
            (None, None) => Exit::Code(-1),
        },
        Err(e) => Exit::SpawnError(e.to_string()),
    };

    if !stderr.is_empty() {
        tracing::info!(exec_id, "stderr: {}", String::from_utf8_lossy(&stderr));
    }

    ChildResult {
        exit,
        stdout,
        stderr,
        duration: spawn_t0.elapsed(),
        timed_out,
    }
}

/// Output drains for a running child.
#[derive(Debug)]
struct Drains {
    /// Stdout reader, or the shared pipe in combined mode.
    stdout: JoinHandle<Vec<u8>>,
    /// Stderr reader; absent in combined mode.
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl Drains {
    /// Waits for both readers to hit EOF.
    async fn join(self) -> (Vec<u8>, Vec<u8>) {
        let stdout = self.stdout.await.unwrap_or_default();
        let stderr = match self.stderr {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        (stdout, stderr)
    }
}

/// Starts the child in its own process group and attaches the drains.
fn spawn(inv: &Invocation) -> io::Result<(Child, Drains)> {
    let Some((program, args)) = inv.argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command line"));
    };

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::piped()).process_group(0);
    for pair in &inv.env {
        if let Some((k, v)) = pair.split_once('=') {
            cmd.env(k, v);
        }
    }

    if inv.combine_output {
        let pipe = pipe::combined()?;
        cmd.stdout(pipe.stdout).stderr(pipe.stderr);
        let child = cmd.spawn()?;
        // Dropping the command closes the parent's copies of the write end,
        // so the reader sees EOF once the child exits.
        drop(cmd);
        let drains = Drains {
            stdout: tokio::spawn(drain(pipe.reader)),
            stderr: None,
        };
        return Ok((child, drains));
    }

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(io::Error::other("child stdio not captured"));
    };
    let drains = Drains {
        stdout: tokio::spawn(drain(stdout)),
        stderr: Some(tokio::spawn(drain(stderr))),
    };
    Ok((child, drains))
}

/// Writes the whole body, then closes stdin by dropping it.
async fn write_stdin(stdin: Option<ChildStdin>, body: Bytes) {
    let Some(mut stdin) = stdin else {
        return;
    };
    if !body.is_empty() {
        // EPIPE here only means the function did not read its input.
        if let Err(e) = stdin.write_all(&body).await {
            tracing::debug!(error = %e, "stdin write ended early");
        }
    }
    let _ = stdin.shutdown().await;
}

/// Reads a stream to EOF.
async fn drain(mut r: impl AsyncRead + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = r.read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "output drain ended early");
    }
    buf
}

/// Sleeps for `limit`, then SIGKILLs the process group led by `pid`.
/// Resolves to `true` once the signal has been sent.
async fn kill_after(exec_id: u64, pid: u32, limit: Duration) -> bool {
    tokio::time::sleep(limit).await;
    tracing::warn!(exec_id, pid, ?limit, "killing process group after exec timeout");
    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(pid as i32);
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(%pid, error = %e, "killpg failed, killing the child only");
            let _ = kill(pid, Signal::SIGKILL);
        }
    }
    true
}
