//! Scripted relay processes for supervisor tests.
//!
//! Each spawned relay is a small task that records the stop signals it
//! receives and exits when told to, so tests can drive diagnostic output and
//! exits without a real relay executable.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use super::invocation::RelayInvocation;
use super::spawner::{
    ExitCode, ProcessError, RelayControl, RelaySpawner, SpawnedRelay, StopSignal,
};

/// Exit code a scripted relay reports after a graceful stop (ffmpeg's).
pub const GRACEFUL_EXIT_CODE: i32 = 255;

#[derive(Default)]
struct ScriptState {
    ignore_graceful: bool,
    failing: HashSet<String>,
    relays: Vec<ScriptedRelay>,
    next_pid: u32,
}

/// Test double for [`RelaySpawner`].
#[derive(Default)]
pub struct ScriptedSpawner {
    state: Mutex<ScriptState>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relays spawned from now on ignore the graceful stop signal.
    pub fn ignore_graceful(self) -> Self {
        self.state.lock().unwrap().ignore_graceful = true;
        self
    }

    /// Spawning a relay for `destination_id` fails.
    pub fn fail_for(self, destination_id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(destination_id.to_string());
        self
    }

    /// Most recently spawned relay for a destination.
    pub fn latest(&self, destination_id: &str) -> Option<ScriptedRelay> {
        self.state
            .lock()
            .unwrap()
            .relays
            .iter()
            .rev()
            .find(|r| r.invocation.destination_id == destination_id)
            .cloned()
    }

    pub fn spawn_count(&self, destination_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .relays
            .iter()
            .filter(|r| r.invocation.destination_id == destination_id)
            .count()
    }

    pub fn total_spawned(&self) -> usize {
        self.state.lock().unwrap().relays.len()
    }
}

impl RelaySpawner for ScriptedSpawner {
    fn spawn(&self, invocation: &RelayInvocation) -> Result<SpawnedRelay, ProcessError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&invocation.destination_id) {
            return Err(ProcessError::SpawnFailed {
                program: invocation.program.display().to_string(),
                reason: "No such file or directory (os error 2)".to_string(),
            });
        }

        let (output_tx, output_rx) = mpsc::channel(64);
        // Closed by the process task on exit, like stderr of a real process.
        let output = Arc::new(Mutex::new(Some(output_tx)));
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (script_tx, mut script_rx) = mpsc::unbounded_channel::<ExitCode>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let signals = Arc::new(Mutex::new(Vec::new()));

        let ignore_graceful = state.ignore_graceful;
        let seen = Arc::clone(&signals);
        let stderr = Arc::clone(&output);
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    Some(signal) = signal_rx.recv() => {
                        seen.lock().unwrap().push(signal);
                        match signal {
                            StopSignal::Force => break None,
                            StopSignal::Graceful if !ignore_graceful => {
                                break Some(GRACEFUL_EXIT_CODE);
                            }
                            StopSignal::Graceful => {}
                        }
                    }
                    Some(code) = script_rx.recv() => break code,
                    else => break None,
                }
            };
            *stderr.lock().unwrap() = None;
            let _ = exit_tx.send(code);
        });

        state.next_pid += 1;
        let pid = 40_000 + state.next_pid;
        state.relays.push(ScriptedRelay {
            invocation: invocation.clone(),
            output,
            script: script_tx,
            signals,
        });

        Ok(SpawnedRelay {
            control: RelayControl::new(Some(pid), signal_tx),
            output: output_rx,
            exit: exit_rx,
        })
    }
}

/// Test-side handle to one scripted relay.
#[derive(Clone)]
pub struct ScriptedRelay {
    pub invocation: RelayInvocation,
    output: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    script: mpsc::UnboundedSender<ExitCode>,
    signals: Arc<Mutex<Vec<StopSignal>>>,
}

impl ScriptedRelay {
    /// Write one diagnostic line. Ignored once the relay has exited.
    pub async fn emit(&self, line: &str) {
        let output = self.output.lock().unwrap().clone();
        if let Some(output) = output {
            let _ = output.send(line.to_string()).await;
        }
    }

    /// Make the process exit on its own.
    pub fn exit(&self, code: ExitCode) {
        let _ = self.script.send(code);
    }

    /// Stop signals received so far.
    pub fn signals(&self) -> Vec<StopSignal> {
        self.signals.lock().unwrap().clone()
    }
}
