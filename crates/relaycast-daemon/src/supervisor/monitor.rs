//! Relay health monitoring.
//!
//! Two background tasks run per session:
//!
//! - the **output pump** reads the relay's diagnostic lines, classifies them
//!   and forwards them to the supervisor, then reports the process exit;
//! - the **health ticker** wakes the supervisor every tick so it can check
//!   the session against the startup and stall timeouts.
//!
//! Neither task touches session state. Every message carries the session id,
//! so messages from a session that has since been replaced are ignored.

use std::sync::Arc;
use std::time::Duration;

use relaycast_core::classifier::Classifier;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::actor::Internal;
use crate::process::ExitCode;

/// Liveness limits for a running relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Longest wait for the first frame.
    pub startup_timeout: Duration,
    /// Longest gap between frames once they have started.
    pub stall_timeout: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(120),
        }
    }
}

/// Result of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// No frame ever arrived within the startup timeout.
    NeverStarted { elapsed: Duration },
    /// Frames stopped for at least the stall timeout.
    Stalled { elapsed: Duration },
}

impl Liveness {
    /// Check a session started at `started_at` whose last frame (if any)
    /// arrived at `last_frame_at`.
    pub fn evaluate(
        now: Instant,
        started_at: Instant,
        last_frame_at: Option<Instant>,
        policy: &LivenessPolicy,
    ) -> Self {
        match last_frame_at {
            None => {
                let elapsed = now.saturating_duration_since(started_at);
                if elapsed >= policy.startup_timeout {
                    Self::NeverStarted { elapsed }
                } else {
                    Self::Healthy
                }
            }
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= policy.stall_timeout {
                    Self::Stalled { elapsed }
                } else {
                    Self::Healthy
                }
            }
        }
    }
}

/// Wake the supervisor every `tick` for `session_id` until aborted.
pub(crate) fn spawn_health_ticker(
    session_id: Uuid,
    tick: Duration,
    events: mpsc::Sender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if events.send(Internal::HealthTick { session_id }).await.is_err() {
                break;
            }
        }
    })
}

/// How long output is still read after the process exit, waiting for its
/// stderr to close. Child processes that inherited stderr can keep it open.
pub(crate) const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Forward classified output of one relay, then its exit code.
///
/// The exit notification can overtake the last lines the relay printed, so
/// after it arrives output is read until stderr closes (bounded by
/// [`OUTPUT_DRAIN_TIMEOUT`]) before the exit is reported.
pub(crate) fn spawn_output_pump(
    session_id: Uuid,
    mut output: mpsc::Receiver<String>,
    mut exit: oneshot::Receiver<ExitCode>,
    classifier: Arc<Classifier>,
    events: mpsc::Sender<Internal>,
) {
    tokio::spawn(async move {
        let forward = |line: String| {
            let tag = classifier.classify(&line);
            events.send(Internal::Output { session_id, line, tag })
        };

        let mut output_open = true;
        let exit_code = loop {
            tokio::select! {
                biased;
                line = output.recv(), if output_open => match line {
                    Some(line) => {
                        if forward(line).await.is_err() {
                            return;
                        }
                    }
                    None => output_open = false,
                },
                code = &mut exit => break code.unwrap_or(None),
            }
        };

        if output_open {
            let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
            loop {
                match tokio::time::timeout_at(deadline, output.recv()).await {
                    Ok(Some(line)) => {
                        if forward(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        debug!(%session_id, "Relay output still open after exit");
                        break;
                    }
                }
            }
        }
        debug!(%session_id, exit_code = ?exit_code, "Relay output pump finished");
        let _ = events.send(Internal::Exited { session_id, exit_code }).await;
    });
}
