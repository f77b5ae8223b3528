//! External tool sessions with line-streamed stdout.
//!
//! [`ProcessStreamer`] is created once per scan. Every [`ProcessSession`] it
//! starts is owned by a reaper task that holds the child process, so the
//! child is always reaped, and is terminated when
//!
//! - the scan's cancellation token fires, or
//! - the session is dropped before the process exited.
//!
//! Termination sends SIGTERM to the child's process group, waits the grace
//! period, then sends SIGKILL.
//!
//! ```text
//! start() ──► ProcessSession ── next_line() ... None ──► wait() ──► ExitStatus
//!                  │
//!                  └─ reaper task: wait | cancelled → TERM → (grace) → KILL
//! ```

use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::metrics as m;

/// Starts tool sessions for one scan.
#[derive(Debug, Clone)]
pub struct ProcessStreamer {
    cancel: CancellationToken,
    tracker: TaskTracker,
    grace: Duration,
    live: Arc<AtomicUsize>,
}

impl ProcessStreamer {
    /// `cancel` is the scan's token; `grace` is the SIGTERM → SIGKILL delay.
    pub fn new(cancel: CancellationToken, grace: Duration) -> Self {
        Self {
            cancel,
            tracker: TaskTracker::new(),
            grace,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawns `command` with a null stdin and piped stdout.
    ///
    /// # Errors
    ///
    /// - [`LaunchError::EmptyCommand`] for an empty vector
    /// - [`LaunchError::Cancelled`] once the scan is cancelling
    /// - [`LaunchError::NotFound`] / [`LaunchError::Spawn`] if the OS refuses
    pub fn start<S: AsRef<OsStr>>(&self, command: &[S]) -> Result<ProcessSession, LaunchError> {
        let (program, args) = command.split_first().ok_or(LaunchError::EmptyCommand)?;
        let program_name = program.as_ref().to_string_lossy().into_owned();

        if self.cancel.is_cancelled() {
            return Err(LaunchError::Cancelled {
                program: program_name,
            });
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                LaunchError::NotFound {
                    program: program_name.clone(),
                }
            } else {
                LaunchError::Spawn {
                    program: program_name.clone(),
                    source: e,
                }
            }
        })?;

        let stdout = child.stdout.take().ok_or_else(|| LaunchError::Spawn {
            program: program_name.clone(),
            source: io::Error::other("stdout was not captured"),
        })?;

        let session_token = self.cancel.child_token();
        let (exit_tx, exit_rx) = oneshot::channel();

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::counter!(m::PROCESS_SESSIONS_STARTED_TOTAL).increment(1);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(m::PROCESS_SESSIONS_LIVE).set(live as f64);
        debug!(program = %program_name, pid = ?child.id(), "process session started");

        self.tracker.spawn(reap(
            child,
            program_name.clone(),
            session_token.clone(),
            self.grace,
            exit_tx,
            Arc::clone(&self.live),
        ));

        Ok(ProcessSession {
            program: program_name,
            stdout: Some(BufReader::new(stdout)),
            buf: Vec::new(),
            exit_rx,
            token: session_token,
        })
    }

    /// Sessions whose process has not been reaped yet.
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits until every reaper has finished.
    ///
    /// Returns `false` if some session is still alive after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let done = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !done {
            warn!(
                live = self.live_sessions(),
                "process sessions still alive after shutdown timeout"
            );
        }
        done
    }
}

/// One running external process.
///
/// The line sequence is finite and not restartable: once
/// [`next_line`](Self::next_line) returned `None` it always does.
#[derive(Debug)]
pub struct ProcessSession {
    program: String,
    stdout: Option<BufReader<ChildStdout>>,
    buf: Vec<u8>,
    exit_rx: oneshot::Receiver<ExitStatus>,
    token: CancellationToken,
}

impl ProcessSession {
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Next stdout line without its terminator.
    ///
    /// Bytes that are not valid UTF-8 are replaced with U+FFFD, so a bad
    /// line never ends the stream. `None` on end of output, read error or
    /// cancellation. Callers treat all three as "no more output".
    pub async fn next_line(&mut self) -> Option<String> {
        let stdout = self.stdout.as_mut()?;
        let next = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                debug!(program = %self.program, "output stream cut by cancellation");
                None
            }
            // partial reads stay in `buf` across polls
            read = stdout.read_until(b'\n', &mut self.buf) => match read {
                Ok(0) if self.buf.is_empty() => None,
                Ok(_) => Some(decode_line(&std::mem::take(&mut self.buf))),
                Err(e) => {
                    debug!(program = %self.program, error = %e, "stdout read failed");
                    None
                }
            },
        };
        if next.is_none() {
            self.stdout = None;
            self.buf.clear();
        }
        next
    }

    /// Waits for the process to exit. Unread output is discarded.
    pub async fn wait(mut self) -> Result<ExitStatus, LaunchError> {
        self.stdout = None;
        (&mut self.exit_rx).await.map_err(|_| LaunchError::Wait {
            program: self.program.clone(),
            reason: "reaper exited without a status".to_owned(),
        })
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        // Terminates the process if it is still running; no-op after exit.
        self.token.cancel();
    }
}

/// Lossy UTF-8 decode with the `\n` / `\r\n` terminator stripped.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn reap(
    mut child: Child,
    program: String,
    token: CancellationToken,
    grace: Duration,
    exit_tx: oneshot::Sender<ExitStatus>,
    live: Arc<AtomicUsize>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => terminate(&mut child, &program, grace).await,
    };

    let remaining = live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!(m::PROCESS_SESSIONS_LIVE).set(remaining as f64);

    match status {
        Ok(status) => {
            debug!(program = %program, %status, "process session ended");
            let _ = exit_tx.send(status);
        }
        Err(e) => warn!(program = %program, error = %e, "failed to reap process"),
    }
}

async fn terminate(child: &mut Child, program: &str, grace: Duration) -> io::Result<ExitStatus> {
    let pid = child.id();
    if let Some(pid) = pid {
        signal_group(child, pid, Signal::Term);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            info!(
                program = %program,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "process ignored SIGTERM, killing"
            );
            metrics::counter!(m::PROCESS_SESSIONS_KILLED_TOTAL).increment(1);
            if let Some(pid) = pid {
                signal_group(child, pid, Signal::Kill);
            }
            if let Err(e) = child.start_kill() {
                debug!(program = %program, error = %e, "start_kill after SIGKILL failed");
            }
            child.wait().await
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signals the child's whole process group so grandchildren go too.
#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: u32, signal: Signal) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group created by `process_group(0)`.
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: u32, _signal: Signal) {
    let _ = child.start_kill();
}
