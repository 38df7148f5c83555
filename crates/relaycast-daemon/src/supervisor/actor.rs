//! The relay supervisor actor.
//!
//! One task owns every relay session. Callers talk to it through a
//! [`SupervisorHandle`]; background tasks (output pumps, health tickers,
//! grace and stabilization timers) report back over an internal channel.
//! All session state changes happen on the actor task, one message at a
//! time, so there is at most one session per destination and a stopped
//! session never receives another stop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relaycast_core::classifier::{Classification, Classifier};
use relaycast_core::config::{Config, RelayProfile};
use relaycast_core::credentials::CredentialStore;
use relaycast_core::registry::{Destination, DestinationRegistry};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::monitor::{Liveness, LivenessPolicy, spawn_health_ticker, spawn_output_pump};
use super::session::{Outcome, RelaySession, RetiringRelay};
use super::types::{
    DestinationStatus, PublishOutcome, RelayEvent, RelayState, SkipReason, StopReason,
    SupervisorError,
};
use crate::ingest::{IngestEvent, PathMatch, PathPolicy, PublishDecision};
use crate::process::{ExitCode, RelayInvocation, RelaySpawner, StopSignal};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const INTERNAL_CHANNEL_CAPACITY: usize = 1024;
const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Extra time allowed for relays to exit after the grace period when the
/// supervisor itself goes away.
const DRAIN_MARGIN: Duration = Duration::from_secs(1);

/// Runtime settings of the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Whose stream keys are used.
    pub user_id: String,
    /// URL every relay pulls from.
    pub ingest_url: String,
    pub relay_bin: PathBuf,
    pub profile: RelayProfile,
    pub path_policy: PathPolicy,
    pub health_tick: Duration,
    pub liveness: LivenessPolicy,
    pub grace_period: Duration,
    pub diagnostic_history: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_id: config.daemon.user_id.clone(),
            ingest_url: config.ingest.ingest_url(),
            relay_bin: config.supervisor.relay_bin.clone(),
            profile: config.relay.clone(),
            path_policy: PathPolicy::from_config(&config.ingest),
            health_tick: config.supervisor.health_tick(),
            liveness: LivenessPolicy {
                startup_timeout: config.supervisor.startup_timeout(),
                stall_timeout: config.supervisor.stall_timeout(),
            },
            grace_period: config.supervisor.grace_period(),
            diagnostic_history: config.supervisor.diagnostic_history,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Messages from the supervisor's own background tasks.
#[derive(Debug)]
pub(crate) enum Internal {
    Output {
        session_id: Uuid,
        line: String,
        tag: Option<Classification>,
    },
    Exited {
        session_id: Uuid,
        exit_code: ExitCode,
    },
    HealthTick {
        session_id: Uuid,
    },
    GraceExpired {
        session_id: Uuid,
    },
    StartDue {
        ticket: u64,
    },
}

enum Command {
    StartAll {
        reply: oneshot::Sender<usize>,
    },
    StopAll {
        reply: oneshot::Sender<usize>,
    },
    StartOne {
        destination_id: String,
        reply: oneshot::Sender<Result<bool, SupervisorError>>,
    },
    StopOne {
        destination_id: String,
        reply: oneshot::Sender<bool>,
    },
    PublishStarted {
        stream_path: String,
        reply: oneshot::Sender<PublishOutcome>,
    },
    PublishEnded {
        stream_path: String,
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<Vec<DestinationStatus>>,
    },
    ActiveCount {
        reply: oneshot::Sender<usize>,
    },
    Diagnostics {
        destination_id: String,
        reply: oneshot::Sender<Option<Vec<String>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A stabilization delay in progress.
struct PendingStart {
    ticket: u64,
    timer: JoinHandle<()>,
}

/// Owner of all relay sessions.
pub struct Supervisor {
    settings: SupervisorSettings,
    classifier: Arc<Classifier>,
    registry: Arc<dyn DestinationRegistry>,
    credentials: Arc<dyn CredentialStore>,
    spawner: Arc<dyn RelaySpawner>,
    /// Active sessions by destination id.
    sessions: HashMap<String, RelaySession>,
    /// Stopped sessions waiting for their process to exit.
    retiring: HashMap<Uuid, RetiringRelay>,
    /// How the last session of each destination ended.
    outcomes: HashMap<String, Outcome>,
    pending_start: Option<PendingStart>,
    next_ticket: u64,
    shutting_down: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,
    events: mpsc::Sender<Internal>,
    reports: broadcast::Sender<RelayEvent>,
}

impl Supervisor {
    /// Start the supervisor task.
    ///
    /// The task runs until every [`SupervisorHandle`] is dropped; relays still
    /// running at that point are stopped first.
    pub fn spawn(
        settings: SupervisorSettings,
        classifier: Classifier,
        registry: Arc<dyn DestinationRegistry>,
        credentials: Arc<dyn CredentialStore>,
        spawner: Arc<dyn RelaySpawner>,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        let supervisor = Self {
            settings,
            classifier: Arc::new(classifier),
            registry,
            credentials,
            spawner,
            sessions: HashMap::new(),
            retiring: HashMap::new(),
            outcomes: HashMap::new(),
            pending_start: None,
            next_ticket: 0,
            shutting_down: false,
            drain_waiters: Vec::new(),
            events: events_tx,
            reports: reports.clone(),
        };
        let task = tokio::spawn(supervisor.run(command_rx, events_rx));
        (
            SupervisorHandle {
                commands: command_tx,
                reports,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
    ) {
        info!(
            destinations = self.registry.list_destinations().len(),
            user = %self.settings.user_id,
            ingest = %self.settings.ingest_url,
            "Relay supervisor started"
        );
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_internal(event),
            }
        }

        self.begin_shutdown();
        self.drain(&mut internal).await;
        info!("Relay supervisor stopped");
    }

    /// Process internal events until every retiring relay has exited or the
    /// grace period (plus a margin) has passed, then kill what is left.
    async fn drain(&mut self, internal: &mut mpsc::Receiver<Internal>) {
        let deadline = Instant::now() + self.settings.grace_period + DRAIN_MARGIN;
        while !self.retiring.is_empty() {
            match tokio::time::timeout_at(deadline, internal.recv()).await {
                Ok(Some(event)) => self.handle_internal(event),
                Ok(None) | Err(_) => break,
            }
        }
        for relay in self.retiring.values() {
            warn!(destination = %relay.destination_id, "Relay still running at exit, killing");
            relay.signal(StopSignal::Force);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartAll { reply } => {
                let _ = reply.send(self.start_all());
            }
            Command::StopAll { reply } => {
                self.cancel_pending_start();
                let _ = reply.send(self.stop_all(StopReason::Requested));
            }
            Command::StartOne {
                destination_id,
                reply,
            } => {
                let _ = reply.send(self.start_one(&destination_id));
            }
            Command::StopOne {
                destination_id,
                reply,
            } => {
                let _ = reply.send(self.stop_one(&destination_id, StopReason::Requested));
            }
            Command::PublishStarted { stream_path, reply } => {
                let _ = reply.send(self.on_publish_started(&stream_path));
            }
            Command::PublishEnded { stream_path, reply } => {
                let _ = reply.send(self.on_publish_ended(&stream_path));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::ActiveCount { reply } => {
                let _ = reply.send(self.sessions.len());
            }
            Command::Diagnostics {
                destination_id,
                reply,
            } => {
                let _ = reply.send(self.diagnostics(&destination_id));
            }
            Command::Shutdown { reply } => {
                self.begin_shutdown();
                if self.retiring.is_empty() {
                    let _ = reply.send(());
                } else {
                    self.drain_waiters.push(reply);
                }
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Output {
                session_id,
                line,
                tag,
            } => self.on_output(session_id, &line, tag),
            Internal::HealthTick { session_id } => self.on_health_tick(session_id),
            Internal::Exited {
                session_id,
                exit_code,
            } => self.on_exit(session_id, exit_code),
            Internal::GraceExpired { session_id } => self.on_grace_expired(session_id),
            Internal::StartDue { ticket } => self.on_start_due(ticket),
        }
    }

    // -- Lifecycle --------------------------------------------------------

    fn start_all(&mut self) -> usize {
        if self.shutting_down {
            warn!("Not starting relays, supervisor is shutting down");
            return 0;
        }
        let mut started = 0;
        for destination in self.registry.list_destinations() {
            match self.start_one(&destination.id) {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(destination = %destination.id, error = %e, "Destination not started");
                }
            }
        }
        if self.sessions.is_empty() {
            warn!("No destination could be started; check enabled flags and stream keys");
            self.report(RelayEvent::NothingToRelay);
        } else {
            info!(started, active = self.sessions.len(), "Relays started");
        }
        started
    }

    /// Start a relay for one destination. `Ok(false)` when one is already
    /// active.
    fn start_one(&mut self, destination_id: &str) -> Result<bool, SupervisorError> {
        if self.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.sessions.contains_key(destination_id) {
            debug!(destination = destination_id, "Relay already active");
            return Ok(false);
        }
        let destination =
            self.registry
                .get(destination_id)
                .ok_or_else(|| SupervisorError::UnknownDestination {
                    id: destination_id.to_string(),
                })?;
        let key = self.admit(&destination)?;

        let invocation = RelayInvocation::build(
            &destination,
            &self.settings.relay_bin,
            &self.settings.profile,
            &self.settings.ingest_url,
            &key,
        );
        let mut session =
            RelaySession::starting(destination, key, self.settings.diagnostic_history);
        info!(
            destination = destination_id,
            session_id = %session.id,
            user = %self.user_label(),
            "Starting relay"
        );

        let spawned = match self.spawner.spawn(&invocation) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(destination = destination_id, error = %e, "Failed to start relay");
                self.outcomes.insert(
                    destination_id.to_string(),
                    Outcome {
                        state: RelayState::Failed,
                        exit_code: None,
                        detail: Some(e.to_string()),
                        history: Vec::new(),
                    },
                );
                self.report(RelayEvent::SpawnFailed {
                    destination_id: destination_id.to_string(),
                    error: e.to_string(),
                });
                return Err(SupervisorError::Spawn {
                    id: destination_id.to_string(),
                    source: e,
                });
            }
        };

        spawn_output_pump(
            session.id,
            spawned.output,
            spawned.exit,
            Arc::clone(&self.classifier),
            self.events.clone(),
        );
        let ticker =
            spawn_health_ticker(session.id, self.settings.health_tick, self.events.clone());
        session.mark_running(spawned.control, ticker);

        let pid = session.pid();
        info!(destination = destination_id, pid = ?pid, "Relay running");
        self.outcomes.remove(destination_id);
        self.report(RelayEvent::Started {
            destination_id: destination_id.to_string(),
            pid,
        });
        self.sessions.insert(destination_id.to_string(), session);
        Ok(true)
    }

    /// Display name of the configured user, falling back to the user id.
    fn user_label(&self) -> String {
        self.credentials
            .display_name(&self.settings.user_id)
            .unwrap_or_else(|| self.settings.user_id.clone())
    }

    /// Check that a destination may be started and return its stream key.
    fn admit(&self, destination: &Destination) -> Result<String, SupervisorError> {
        if !destination.enabled {
            info!(destination = %destination.id, "Skipping disabled destination");
            self.report(RelayEvent::Skipped {
                destination_id: destination.id.clone(),
                reason: SkipReason::Disabled,
            });
            return Err(SupervisorError::Disabled {
                id: destination.id.clone(),
            });
        }
        let Some(key) = self
            .credentials
            .usable_credential(&self.settings.user_id, &destination.id)
        else {
            warn!(
                destination = %destination.id,
                user = %self.settings.user_id,
                "No usable stream key, skipping destination"
            );
            self.report(RelayEvent::Skipped {
                destination_id: destination.id.clone(),
                reason: SkipReason::NoKey,
            });
            return Err(SupervisorError::MissingCredential {
                id: destination.id.clone(),
            });
        };
        Ok(key)
    }

    /// Take a session out of the active set and ask its process to exit.
    ///
    /// The destination slot is free as soon as this returns. The session is
    /// finalized when its process exits; if it has not exited after the
    /// grace period it is killed.
    fn stop_one(&mut self, destination_id: &str, reason: StopReason) -> bool {
        let Some(session) = self.sessions.remove(destination_id) else {
            debug!(destination = destination_id, "No active relay to stop");
            return false;
        };
        let mut relay = session.retire(reason);
        info!(
            destination = destination_id,
            session_id = %relay.session_id,
            reason = %reason,
            "Stopping relay"
        );
        self.report(RelayEvent::Stopping {
            destination_id: destination_id.to_string(),
            reason,
        });

        if !relay.signal(StopSignal::Graceful) {
            debug!(destination = destination_id, "Relay process already exited");
        }

        let session_id = relay.session_id;
        let events = self.events.clone();
        let grace = self.settings.grace_period;
        relay.set_grace_timer(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(Internal::GraceExpired { session_id }).await;
        }));
        self.retiring.insert(session_id, relay);
        true
    }

    fn stop_all(&mut self, reason: StopReason) -> usize {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        let mut stopped = 0;
        for id in &ids {
            if self.stop_one(id, reason) {
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(stopped, reason = %reason, "Stopped all relays");
        }
        stopped
    }

    fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            info!(active = self.sessions.len(), "Relay supervisor shutting down");
            self.shutting_down = true;
        }
        self.cancel_pending_start();
        self.stop_all(StopReason::Shutdown);
    }

    // -- Ingest notifications ---------------------------------------------

    fn on_publish_started(&mut self, stream_path: &str) -> PublishOutcome {
        if self.shutting_down {
            return PublishOutcome::Ignored;
        }
        let policy = &self.settings.path_policy;
        let delay = match policy.on_publish(stream_path) {
            PublishDecision::StartAfter(delay) => delay,
            PublishDecision::Ignore => {
                info!(
                    stream_path,
                    target = policy.target(),
                    "Ignoring publish of unrelated stream"
                );
                return PublishOutcome::Ignored;
            }
        };
        match policy.resolve(stream_path) {
            PathMatch::Target => info!(stream_path, "Ingest stream published"),
            PathMatch::Missing => warn!(
                target = policy.target(),
                "Publish notification without a stream path, assuming the target stream"
            ),
            PathMatch::Unrecognized => warn!(
                stream_path,
                target = policy.target(),
                "Publish of unrecognized stream path, starting relays anyway"
            ),
        }

        if !self.sessions.is_empty() {
            info!(active = self.sessions.len(), "Relays already active");
            return PublishOutcome::AlreadyActive;
        }
        if self.pending_start.is_some() {
            debug!("Relay start already pending");
            return PublishOutcome::AlreadyPending;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Internal::StartDue { ticket }).await;
        });
        self.pending_start = Some(PendingStart { ticket, timer });

        let outcome = PublishOutcome::scheduled(delay);
        if let PublishOutcome::Scheduled { delay_ms } = outcome {
            info!(delay_ms, "Starting relays after stabilization delay");
            self.report(RelayEvent::StartScheduled { delay_ms });
        }
        outcome
    }

    /// Any unpublish stops every relay, whatever the path policy: a missed
    /// stop would leave relays pushing a dead stream.
    fn on_publish_ended(&mut self, stream_path: &str) -> usize {
        match self.settings.path_policy.resolve(stream_path) {
            PathMatch::Target => info!(stream_path, "Ingest stream ended"),
            PathMatch::Missing => info!("Ingest stream ended (no stream path reported)"),
            PathMatch::Unrecognized => warn!(
                stream_path,
                target = self.settings.path_policy.target(),
                "Unpublish of unrecognized stream path, stopping relays anyway"
            ),
        }
        self.cancel_pending_start();
        self.stop_all(StopReason::PublishEnded)
    }

    fn cancel_pending_start(&mut self) {
        if let Some(pending) = self.pending_start.take() {
            pending.timer.abort();
            info!("Canceled pending relay start");
            self.report(RelayEvent::StartCanceled);
        }
    }

    fn on_start_due(&mut self, ticket: u64) {
        if !self
            .pending_start
            .as_ref()
            .is_some_and(|pending| pending.ticket == ticket)
        {
            debug!(ticket, "Ignoring stale relay start");
            return;
        }
        self.pending_start = None;
        self.start_all();
    }

    // -- Relay feedback ---------------------------------------------------

    fn active_destination(&self, session_id: Uuid) -> Option<String> {
        self.sessions
            .values()
            .find(|session| session.id == session_id)
            .map(|session| session.destination.id.clone())
    }

    fn on_output(&mut self, session_id: Uuid, line: &str, tag: Option<Classification>) {
        let Some(destination_id) = self.active_destination(session_id) else {
            trace!(%session_id, "Output from retired relay");
            return;
        };
        let Some(session) = self.sessions.get_mut(&destination_id) else {
            return;
        };
        // Relay errors quote the egress URL, stream key included.
        let line = session.scrub(line);
        if tag != Some(Classification::FrameProgress) {
            session.remember(&line);
        }

        match tag {
            Some(Classification::FrameProgress) => session.record_frame(Instant::now()),
            Some(Classification::ConnectedSuccess) => {
                if session.confirm_connected() {
                    info!(destination = %destination_id, "Relay connected to destination");
                    self.report(RelayEvent::Connected {
                        destination_id: destination_id.clone(),
                    });
                }
            }
            Some(Classification::TransientNetworkIssue) => {
                warn!(destination = %destination_id, line = %line, "Transient network issue");
                self.report(RelayEvent::TransientIssue {
                    destination_id: destination_id.clone(),
                    line: line.clone(),
                });
            }
            Some(Classification::AuthError) => {
                error!(
                    destination = %destination_id,
                    line = %line,
                    "Destination rejected the stream"
                );
                self.report(RelayEvent::AuthRejected {
                    destination_id: destination_id.clone(),
                    line: line.clone(),
                });
            }
            None => trace!(destination = %destination_id, line = %line, "Relay output"),
        }
        if tag.is_some_and(Classification::is_fatal) {
            self.stop_one(&destination_id, StopReason::AuthRejected);
        }
    }

    fn on_health_tick(&mut self, session_id: Uuid) {
        let Some(destination_id) = self.active_destination(session_id) else {
            return;
        };
        let Some(session) = self.sessions.get(&destination_id) else {
            return;
        };
        let reason = match session.liveness(Instant::now(), &self.settings.liveness) {
            Liveness::Healthy => {
                trace!(destination = %destination_id, "Relay healthy");
                return;
            }
            Liveness::NeverStarted { elapsed } => {
                error!(
                    destination = %destination_id,
                    elapsed_secs = elapsed.as_secs(),
                    "Relay produced no frames since start"
                );
                StopReason::NeverStarted {
                    elapsed_secs: elapsed.as_secs(),
                }
            }
            Liveness::Stalled { elapsed } => {
                error!(
                    destination = %destination_id,
                    elapsed_secs = elapsed.as_secs(),
                    "Relay stalled"
                );
                StopReason::Stalled {
                    elapsed_secs: elapsed.as_secs(),
                }
            }
        };
        self.report(RelayEvent::LivenessTimeout {
            destination_id: destination_id.clone(),
            reason,
        });
        self.stop_one(&destination_id, reason);
    }

    fn on_exit(&mut self, session_id: Uuid, exit_code: ExitCode) {
        if let Some(relay) = self.retiring.remove(&session_id) {
            let destination_id = relay.destination_id.clone();
            info!(
                destination = %destination_id,
                exit_code = ?exit_code,
                reason = %relay.reason,
                "Relay stopped"
            );
            let outcome = relay.complete(exit_code);
            self.outcomes.insert(destination_id.clone(), outcome);
            self.report(RelayEvent::Terminated {
                destination_id,
                exit_code,
                requested: true,
            });
            if self.retiring.is_empty() {
                for waiter in self.drain_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            return;
        }

        let Some(destination_id) = self.active_destination(session_id) else {
            debug!(%session_id, "Exit of unknown relay session");
            return;
        };
        let Some(session) = self.sessions.remove(&destination_id) else {
            return;
        };
        let history = session.finish();
        let detail = if exit_code == Some(0) {
            info!(destination = %destination_id, "Relay exited");
            "exited".to_string()
        } else {
            warn!(
                destination = %destination_id,
                exit_code = ?exit_code,
                last_output = ?history.last(),
                "Relay exited unexpectedly"
            );
            exit_code.map_or_else(
                || "killed by signal".to_string(),
                |code| format!("exited with code {code}"),
            )
        };
        self.outcomes.insert(
            destination_id.clone(),
            Outcome {
                state: RelayState::Terminated,
                exit_code,
                detail: Some(detail),
                history,
            },
        );
        self.report(RelayEvent::Terminated {
            destination_id,
            exit_code,
            requested: false,
        });
    }

    fn on_grace_expired(&mut self, session_id: Uuid) {
        let Some(relay) = self.retiring.get(&session_id) else {
            return;
        };
        warn!(
            destination = %relay.destination_id,
            pid = ?relay.pid(),
            "Relay did not exit within the grace period, killing"
        );
        relay.signal(StopSignal::Force);
        let destination_id = relay.destination_id.clone();
        self.report(RelayEvent::Escalated { destination_id });
    }

    // -- Queries ----------------------------------------------------------

    fn status(&self) -> Vec<DestinationStatus> {
        let now = Instant::now();
        self.registry
            .list_destinations()
            .iter()
            .map(|destination| self.status_of(destination, now))
            .collect()
    }

    fn status_of(&self, destination: &Destination, now: Instant) -> DestinationStatus {
        if let Some(session) = self.sessions.get(&destination.id) {
            return session.status(now);
        }
        if let Some(relay) = self
            .retiring
            .values()
            .find(|relay| relay.destination_id == destination.id)
        {
            return relay.status();
        }
        if let Some(reason) = self.skip_reason(destination) {
            return DestinationStatus {
                state: RelayState::Skipped,
                detail: Some(reason.to_string()),
                ..idle_status(destination)
            };
        }
        self.outcomes.get(&destination.id).map_or_else(
            || idle_status(destination),
            |outcome| outcome.status(destination),
        )
    }

    fn skip_reason(&self, destination: &Destination) -> Option<SkipReason> {
        if !destination.enabled {
            Some(SkipReason::Disabled)
        } else if self
            .credentials
            .usable_credential(&self.settings.user_id, &destination.id)
            .is_none()
        {
            Some(SkipReason::NoKey)
        } else {
            None
        }
    }

    fn diagnostics(&self, destination_id: &str) -> Option<Vec<String>> {
        if let Some(session) = self.sessions.get(destination_id) {
            return Some(session.history());
        }
        if let Some(relay) = self
            .retiring
            .values()
            .find(|relay| relay.destination_id == destination_id)
        {
            return Some(relay.history.clone());
        }
        self.outcomes
            .get(destination_id)
            .map(|outcome| outcome.history.clone())
    }

    fn report(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.reports.send(event);
    }
}

fn idle_status(destination: &Destination) -> DestinationStatus {
    DestinationStatus {
        destination_id: destination.id.clone(),
        name: destination.name.clone(),
        state: RelayState::Idle,
        connected_confirmed: false,
        last_frame_age_seconds: None,
        pid: None,
        exit_code: None,
        detail: None,
    }
}

/// Cloneable handle to the supervisor task.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    reports: broadcast::Sender<RelayEvent>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SupervisorError::Unavailable)?;
        response.await.map_err(|_| SupervisorError::Unavailable)
    }

    /// Start a relay for every enabled destination with a usable key.
    /// Returns how many were started.
    pub async fn start_all(&self) -> Result<usize, SupervisorError> {
        self.request(|reply| Command::StartAll { reply }).await
    }

    /// Stop every active relay. Returns how many were stopped.
    pub async fn stop_all(&self) -> Result<usize, SupervisorError> {
        self.request(|reply| Command::StopAll { reply }).await
    }

    /// Start one destination. `Ok(false)` when it is already running.
    pub async fn start_one(&self, destination_id: &str) -> Result<bool, SupervisorError> {
        self.request(|reply| Command::StartOne {
            destination_id: destination_id.to_string(),
            reply,
        })
        .await?
    }

    /// Stop one destination. `Ok(false)` when nothing was running.
    pub async fn stop_one(&self, destination_id: &str) -> Result<bool, SupervisorError> {
        self.request(|reply| Command::StopOne {
            destination_id: destination_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn publish_started(
        &self,
        stream_path: &str,
    ) -> Result<PublishOutcome, SupervisorError> {
        self.request(|reply| Command::PublishStarted {
            stream_path: stream_path.to_string(),
            reply,
        })
        .await
    }

    /// Returns how many relays were stopped.
    pub async fn publish_ended(&self, stream_path: &str) -> Result<usize, SupervisorError> {
        self.request(|reply| Command::PublishEnded {
            stream_path: stream_path.to_string(),
            reply,
        })
        .await
    }

    /// Forward an ingest notification.
    pub async fn ingest(&self, event: IngestEvent) -> Result<(), SupervisorError> {
        match event {
            IngestEvent::PublishStarted { stream_path } => {
                self.publish_started(&stream_path).await.map(|_| ())
            }
            IngestEvent::PublishEnded { stream_path } => {
                self.publish_ended(&stream_path).await.map(|_| ())
            }
        }
    }

    /// Status of every registered destination, ordered by id.
    pub async fn status(&self) -> Result<Vec<DestinationStatus>, SupervisorError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn active_count(&self) -> Result<usize, SupervisorError> {
        self.request(|reply| Command::ActiveCount { reply }).await
    }

    /// Recent non-progress output of a destination's current or last relay.
    pub async fn diagnostics(
        &self,
        destination_id: &str,
    ) -> Result<Option<Vec<String>>, SupervisorError> {
        self.request(|reply| Command::Diagnostics {
            destination_id: destination_id.to_string(),
            reply,
        })
        .await
    }

    /// Operator-visible events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.reports.subscribe()
    }

    /// Stop everything and wait until every relay process has exited.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
