//! Shared stdout/stderr pipe for combined-output mode.
//!
//! Both child descriptors point at the write end of a single OS pipe, so the
//! parent reads stdout and stderr interleaved in the order the child wrote
//! them.

use std::io;
use std::process::Stdio;

use nix::fcntl::OFlag;
use tokio::net::unix::pipe::Receiver;

/// Parent read end plus the two child-side handles.
#[derive(Debug)]
pub(super) struct CombinedPipe {
    /// Non-blocking read end, drained by the parent.
    pub reader: Receiver,
    /// Write end installed as the child's stdout.
    pub stdout: Stdio,
    /// Duplicate write end installed as the child's stderr.
    pub stderr: Stdio,
}

/// Creates the pipe. Both ends carry `O_CLOEXEC`; `dup2` in the child clears
/// it on fds 1 and 2 only.
pub(super) fn combined() -> io::Result<CombinedPipe> {
    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let write_dup = write_end.try_clone()?;
    let reader = Receiver::from_owned_fd(read_end)?;

    Ok(CombinedPipe {
        reader,
        stdout: Stdio::from(write_end),
        stderr: Stdio::from(write_dup),
    })
}
