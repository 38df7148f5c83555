//! Relay process spawning and signalling.
//!
//! Every spawned relay is owned by a reaper task: it waits for the child,
//! delivers stop signals on request and reports the exit code. The supervisor
//! only ever holds a [`RelayControl`], so losing track of it can never leave
//! an unreaped child behind.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, info, warn};

use super::invocation::RelayInvocation;

/// Longest diagnostic line parsed. Output after an oversized line is
/// discarded unread.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// Buffered diagnostic lines per relay before the reader applies backpressure.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Termination request delivered to a relay process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the process to finish (SIGTERM on unix).
    Graceful,
    /// Kill the process.
    Force,
}

/// Exit code of a relay process; `None` when it was terminated by a signal.
pub type ExitCode = Option<i32>;

/// Handle used to signal a running relay process.
#[derive(Debug, Clone)]
pub struct RelayControl {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<StopSignal>,
}

impl RelayControl {
    pub const fn new(pid: Option<u32>, signals: mpsc::UnboundedSender<StopSignal>) -> Self {
        Self { pid, signals }
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Deliver a stop signal. Returns `false` when the process is already
    /// gone, which callers treat as a completed stop.
    pub fn signal(&self, signal: StopSignal) -> bool {
        self.signals.send(signal).is_ok()
    }
}

/// A freshly spawned relay process.
#[derive(Debug)]
pub struct SpawnedRelay {
    pub control: RelayControl,
    /// Diagnostic output, one entry per line.
    pub output: mpsc::Receiver<String>,
    /// Resolves once the process has exited.
    pub exit: oneshot::Receiver<ExitCode>,
}

/// Launches relay processes.
///
/// Spawning is synchronous: it only covers OS process creation, the process
/// itself runs on background tasks.
pub trait RelaySpawner: Send + Sync {
    fn spawn(&self, invocation: &RelayInvocation) -> Result<SpawnedRelay, ProcessError>;
}

/// Spawns real relay executables with tokio.
#[derive(Debug, Default, Clone)]
pub struct ProcessSpawner;

impl ProcessSpawner {
    pub const fn new() -> Self {
        Self
    }
}

impl RelaySpawner for ProcessSpawner {
    fn spawn(&self, invocation: &RelayInvocation) -> Result<SpawnedRelay, ProcessError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            destination = %invocation.destination_id,
            command = %invocation.redacted,
            "Spawning relay process"
        );
        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            program: invocation.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stderr = child.stderr.take().ok_or_else(|| ProcessError::SpawnFailed {
            program: invocation.program.display().to_string(),
            reason: "Failed to capture stderr".to_string(),
        })?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let destination = invocation.destination_id.clone();
        tokio::spawn(async move {
            // Progress lines are terminated by '\r', everything else by '\n'.
            let codec = AnyDelimiterCodec::new_with_max_length(
                b"\r\n".to_vec(),
                Vec::new(),
                MAX_LINE_BYTES,
            );
            let mut lines = FramedRead::new(stderr, codec);
            while let Some(frame) = lines.next().await {
                match frame {
                    Ok(bytes) => {
                        let line = String::from_utf8_lossy(&bytes).trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if output_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            destination = %destination,
                            error = %e,
                            "Relay output read error"
                        );
                        break;
                    }
                }
            }
            drop(output_tx);
            // Keep the pipe drained so the relay never blocks on stderr.
            let mut stderr = lines.into_inner();
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            debug!(destination = %destination, "Relay output reader finished");
        });

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(reap(
            child,
            invocation.destination_id.clone(),
            signal_rx,
            exit_tx,
        ));

        Ok(SpawnedRelay {
            control: RelayControl::new(pid, signal_tx),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

/// Own the child until it exits, applying stop signals as they arrive.
async fn reap(
    mut child: Child,
    destination: String,
    mut signals: mpsc::UnboundedReceiver<StopSignal>,
    exit_tx: oneshot::Sender<ExitCode>,
) {
    let code = loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => break status.code(),
                    Err(e) => {
                        warn!(
                            destination = %destination,
                            error = %e,
                            "Error waiting for relay process"
                        );
                        break None;
                    }
                }
            }
            Some(signal) = signals.recv() => {
                deliver(&mut child, &destination, signal);
            }
        }
    };
    debug!(destination = %destination, exit_code = ?code, "Relay process reaped");
    let _ = exit_tx.send(code);
}

fn deliver(child: &mut Child, destination: &str, signal: StopSignal) {
    match signal {
        StopSignal::Graceful => {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SAFETY: pid comes from our own, not yet reaped Child handle.
                    // kill(2) with SIGTERM is safe to call on any owned subprocess.
                    #[allow(unsafe_code)]
                    #[allow(clippy::cast_possible_wrap)]
                    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                    if ret != 0 {
                        let err = std::io::Error::last_os_error();
                        debug!(destination, pid, error = %err, "Failed to send SIGTERM");
                    }
                }
            }
            #[cfg(not(unix))]
            {
                if let Err(e) = child.start_kill() {
                    debug!(destination, error = %e, "Failed to stop relay process");
                }
            }
        }
        StopSignal::Force => {
            if let Err(e) = child.start_kill() {
                debug!(destination, error = %e, "Failed to kill relay process");
            }
        }
    }
}

/// Errors from relay process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn relay process {program}: {reason}")]
    SpawnFailed { program: String, reason: String },
}
