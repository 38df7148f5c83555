//! Per-destination session bookkeeping owned by the supervisor actor.

use std::collections::VecDeque;

use relaycast_core::credentials::scrub;
use relaycast_core::registry::Destination;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::monitor::{Liveness, LivenessPolicy};
use super::types::{DestinationStatus, RelayState, StopReason};
use crate::process::{ExitCode, RelayControl, StopSignal};

/// A relay that currently holds its destination's slot.
pub(crate) struct RelaySession {
    pub id: Uuid,
    pub destination: Destination,
    /// Stream key, kept only to scrub it from relay output.
    key: String,
    pub state: RelayState,
    control: Option<RelayControl>,
    pub started_at: Instant,
    last_frame_at: Instant,
    has_received_frame: bool,
    connected_confirmed: bool,
    history: VecDeque<String>,
    history_limit: usize,
    monitor: Option<JoinHandle<()>>,
}

impl RelaySession {
    pub fn starting(destination: Destination, key: String, history_limit: usize) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            destination,
            key,
            state: RelayState::Starting,
            control: None,
            started_at: now,
            last_frame_at: now,
            has_received_frame: false,
            connected_confirmed: false,
            history: VecDeque::with_capacity(history_limit.min(64)),
            history_limit,
            monitor: None,
        }
    }

    /// The process is up; liveness is measured from here.
    pub fn mark_running(&mut self, control: RelayControl, monitor: JoinHandle<()>) {
        let now = Instant::now();
        self.control = Some(control);
        self.monitor = Some(monitor);
        self.state = RelayState::Running;
        self.started_at = now;
        self.last_frame_at = now;
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.as_ref().and_then(RelayControl::pid)
    }

    pub fn record_frame(&mut self, now: Instant) {
        self.last_frame_at = now;
        self.has_received_frame = true;
    }

    /// Returns `true` the first time the connection is confirmed.
    pub fn confirm_connected(&mut self) -> bool {
        !std::mem::replace(&mut self.connected_confirmed, true)
    }

    /// `line` with the stream key redacted.
    pub fn scrub(&self, line: &str) -> String {
        scrub(line, &self.key)
    }

    pub fn remember(&mut self, line: &str) {
        if self.history_limit == 0 {
            return;
        }
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(line.to_string());
    }

    pub fn history(&self) -> Vec<String> {
        self.history.iter().cloned().collect()
    }

    pub fn liveness(&self, now: Instant, policy: &LivenessPolicy) -> Liveness {
        let last_frame = self.has_received_frame.then_some(self.last_frame_at);
        Liveness::evaluate(now, self.started_at, last_frame, policy)
    }

    pub fn status(&self, now: Instant) -> DestinationStatus {
        DestinationStatus {
            destination_id: self.destination.id.clone(),
            name: self.destination.name.clone(),
            state: self.state,
            connected_confirmed: self.connected_confirmed,
            last_frame_age_seconds: self
                .has_received_frame
                .then(|| now.saturating_duration_since(self.last_frame_at).as_secs()),
            pid: self.pid(),
            exit_code: None,
            detail: None,
        }
    }

    /// Leave the slot: cancel the health monitor and hand over the process
    /// for draining. Called exactly once per session.
    pub fn retire(mut self, reason: StopReason) -> RetiringRelay {
        self.cancel_monitor();
        RetiringRelay {
            session_id: self.id,
            destination_id: self.destination.id.clone(),
            name: self.destination.name.clone(),
            reason,
            control: self.control.take(),
            grace: None,
            history: self.history(),
        }
    }

    /// Session ended by itself; only the monitor needs cancelling.
    pub fn finish(mut self) -> Vec<String> {
        self.cancel_monitor();
        self.history()
    }

    fn cancel_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// A stopped session whose process has not exited yet.
pub(crate) struct RetiringRelay {
    pub session_id: Uuid,
    pub destination_id: String,
    pub name: String,
    pub reason: StopReason,
    control: Option<RelayControl>,
    grace: Option<JoinHandle<()>>,
    pub history: Vec<String>,
}

impl RetiringRelay {
    /// Send a stop signal. `false` means the process is already gone.
    pub fn signal(&self, signal: StopSignal) -> bool {
        self.control.as_ref().is_some_and(|c| c.signal(signal))
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.as_ref().and_then(RelayControl::pid)
    }

    pub fn set_grace_timer(&mut self, timer: JoinHandle<()>) {
        self.grace = Some(timer);
    }

    pub fn status(&self) -> DestinationStatus {
        DestinationStatus {
            destination_id: self.destination_id.clone(),
            name: self.name.clone(),
            state: RelayState::Stopping,
            connected_confirmed: false,
            last_frame_age_seconds: None,
            pid: self.pid(),
            exit_code: None,
            detail: Some(self.reason.to_string()),
        }
    }

    /// The process exited; drop the grace timer.
    pub fn complete(mut self, exit_code: ExitCode) -> Outcome {
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
        Outcome {
            state: if self.reason.is_failure() {
                RelayState::Failed
            } else {
                RelayState::Terminated
            },
            exit_code,
            detail: Some(self.reason.to_string()),
            history: self.history,
        }
    }
}

/// What became of the last session of a destination.
#[derive(Debug, Clone)]
pub(crate) struct Outcome {
    pub state: RelayState,
    pub exit_code: ExitCode,
    pub detail: Option<String>,
    pub history: Vec<String>,
}

impl Outcome {
    pub fn status(&self, destination: &Destination) -> DestinationStatus {
        DestinationStatus {
            destination_id: destination.id.clone(),
            name: destination.name.clone(),
            state: self.state,
            connected_confirmed: false,
            last_frame_age_seconds: None,
            pid: None,
            exit_code: self.exit_code,
            detail: self.detail.clone(),
        }
    }
}
