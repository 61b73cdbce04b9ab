//! Process Runner (§4.2): spawns the transcoder binary and wires continuous
//! standard-error drainage so the child is never blocked on a full stderr
//! pipe.

use std::{path::Path, process::Stdio};

use relay_log::log;
use tokio::{
    io::{AsyncBufReadExt as _, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
};

/// Error returned when the transcoder binary failed to spawn.
#[derive(Clone, Debug, thiserror::Error)]
#[error("failed to spawn transcoder: {0}")]
pub struct SpawnError(pub String);

/// Handle to a freshly spawned transcoder child process.
#[derive(Debug)]
pub struct ChildHandle {
    /// OS process id, non-zero by construction.
    pub pid: u32,

    /// The spawned child itself, retained so it can be waited on / killed.
    pub child: Child,

    /// Writable standard input of the child.
    pub stdin: ChildStdin,

    /// Standard-error lines, drained continuously by a background task and
    /// delivered here as they arrive. If nobody reads from this receiver the
    /// lines are simply dropped — the drain task itself never blocks on the
    /// channel since it uses an unbounded sender.
    pub stderr_lines: mpsc::UnboundedReceiver<String>,
}

/// Spawns the transcoder binary located at `binary`, with the given `args`,
/// returning a [`ChildHandle`] once a process id has been assigned.
///
/// Standard input is piped (writable by the caller), standard output is
/// discarded, and standard error is piped and drained by a background task
/// into [`ChildHandle::stderr_lines`] — never allowed to block the child.
///
/// # Errors
///
/// If the binary cannot be spawned, or if the child exposes no stdin/stderr
/// handle (which would indicate a misconfigured [`Command`]).
pub fn run(binary: &Path, args: &[String]) -> Result<ChildHandle, SpawnError> {
    let mut cmd = Command::new(binary);
    let _ = cmd
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| SpawnError(e.to_string()))?;

    let pid = child.id().ok_or_else(|| {
        SpawnError("spawned process exposes no pid".to_owned())
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SpawnError("spawned process exposes no stdin".to_owned()))?;

    let stderr = child.stderr.take().ok_or_else(|| {
        SpawnError("spawned process exposes no stderr".to_owned())
    })?;

    let (tx, rx) = mpsc::unbounded_channel();
    drop(tokio::spawn(drain_stderr(pid, stderr, tx)));

    Ok(ChildHandle {
        pid,
        child,
        stdin,
        stderr_lines: rx,
    })
}

/// Continuously reads lines from the child's standard error and forwards
/// them on `tx`, logging (but not propagating) read errors.
async fn drain_stderr(
    pid: u32,
    stderr: tokio::process::ChildStderr,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    // No one is listening anymore; keep draining so the pipe
                    // never fills, just discard the content.
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("[pid {}] failed to read stderr: {}", pid, e);
                break;
            }
        }
    }
}
