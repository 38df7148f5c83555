//! Supervisor module types.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::process::ProcessError;

/// Lifecycle state of one destination's relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    /// Configured and usable, no relay has run yet.
    Idle,
    /// Not started because of its configuration (see the status detail).
    Skipped,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl RelayState {
    /// Whether the destination slot is taken by a live session.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Skipped => "skipped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a destination was not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NoKey,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("skipped: disabled"),
            Self::NoKey => f.write_str("skipped: no key"),
        }
    }
}

/// Why a relay is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit stop request from a caller.
    Requested,
    /// The ingest stream stopped publishing.
    PublishEnded,
    /// The destination rejected the credential.
    AuthRejected,
    /// No frame arrived within the startup timeout.
    NeverStarted { elapsed_secs: u64 },
    /// Frames stopped arriving for longer than the stall timeout.
    Stalled { elapsed_secs: u64 },
    /// The daemon is shutting down.
    Shutdown,
}

impl StopReason {
    /// Whether the stop is a per-destination failure rather than a normal stop.
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::AuthRejected | Self::NeverStarted { .. } | Self::Stalled { .. }
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("stop requested"),
            Self::PublishEnded => f.write_str("ingest stream ended"),
            Self::AuthRejected => f.write_str("destination rejected the stream key"),
            Self::NeverStarted { elapsed_secs } => {
                write!(f, "no frames after {elapsed_secs}s (never started)")
            }
            Self::Stalled { elapsed_secs } => write!(f, "no frames for {elapsed_secs}s (stalled)"),
            Self::Shutdown => f.write_str("daemon shutting down"),
        }
    }
}

/// Queryable status of one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationStatus {
    pub destination_id: String,
    pub name: String,
    pub state: RelayState,
    pub connected_confirmed: bool,
    pub last_frame_age_seconds: Option<u64>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Skip reason, stop reason or error text.
    pub detail: Option<String>,
}

/// Operator-visible report emitted on every state transition and
/// classified error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    StartScheduled { delay_ms: u64 },
    StartCanceled,
    Skipped { destination_id: String, reason: SkipReason },
    Started { destination_id: String, pid: Option<u32> },
    SpawnFailed { destination_id: String, error: String },
    Connected { destination_id: String },
    TransientIssue { destination_id: String, line: String },
    AuthRejected { destination_id: String, line: String },
    LivenessTimeout { destination_id: String, reason: StopReason },
    Stopping { destination_id: String, reason: StopReason },
    /// The grace period ran out and the relay was killed.
    Escalated { destination_id: String },
    Terminated {
        destination_id: String,
        exit_code: Option<i32>,
        /// `false` when the relay exited on its own.
        requested: bool,
    },
    /// A start was attempted but no destination could be started.
    NothingToRelay,
}

/// Result of a publish-start notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Relays start after the stabilization delay.
    Scheduled { delay_ms: u64 },
    /// Relays are already running; nothing to do.
    AlreadyActive,
    /// A start is already pending.
    AlreadyPending,
    /// The stream path does not refer to the target stream.
    Ignored,
}

impl PublishOutcome {
    pub fn scheduled(delay: Duration) -> Self {
        Self::Scheduled {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Unknown destination: {id}")]
    UnknownDestination { id: String },

    #[error("Destination {id} is disabled")]
    Disabled { id: String },

    #[error("No usable stream key for destination {id}")]
    MissingCredential { id: String },

    #[error("Failed to start relay for {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: ProcessError,
    },

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Supervisor is not running")]
    Unavailable,
}
