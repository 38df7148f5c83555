//! Supervisor scenarios driven by scripted relays on a paused clock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use relaycast_core::classifier::Classifier;
use relaycast_core::config::PathMatchMode;
use relaycast_core::credentials::StaticCredentials;
use relaycast_core::registry::{Destination, StaticRegistry};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::*;
use crate::ingest::PathPolicy;
use crate::process::StopSignal;
use crate::process::scripted::{GRACEFUL_EXIT_CODE, ScriptedRelay, ScriptedSpawner};

const TARGET: &str = "/live/my-stream-key";
const AUTH_FAILURE: &str = "[rtmp @ 0x55d] Server returned 403 Forbidden (access denied)";

fn default_registry() -> StaticRegistry {
    StaticRegistry::new([
        Destination::new("youtube", "YouTube", "rtmp://a.rtmp.youtube.com/live2/", true),
        Destination::new("twitch", "Twitch", "rtmp://live.twitch.tv/app/", true),
        Destination::new("facebook", "Facebook", "rtmps://live-api-s.facebook.com:443/rtmp/", true),
        Destination::new("tiktok", "TikTok", "rtmp://push.tiktok.com/live/", false),
    ])
}

fn default_credentials() -> StaticCredentials {
    StaticCredentials::new()
        .with_key("user1", "youtube", "yt-abcd-efgh-ijkl")
        .with_key("user1", "twitch", "live_123456789_abcdef")
        .with_key("user1", "facebook", "your-facebook-key-here")
        .with_key("user1", "tiktok", "tt-real-key-0000")
}

struct Harness {
    handle: SupervisorHandle,
    spawner: Arc<ScriptedSpawner>,
    events: broadcast::Receiver<RelayEvent>,
}

impl Harness {
    fn new(spawner: ScriptedSpawner) -> Self {
        Self::build(
            spawner,
            SupervisorSettings::default(),
            default_registry(),
            default_credentials(),
        )
    }

    fn with_settings(spawner: ScriptedSpawner, settings: SupervisorSettings) -> Self {
        Self::build(spawner, settings, default_registry(), default_credentials())
    }

    fn build(
        spawner: ScriptedSpawner,
        settings: SupervisorSettings,
        registry: StaticRegistry,
        credentials: StaticCredentials,
    ) -> Self {
        let spawner = Arc::new(spawner);
        let (handle, _task) = Supervisor::spawn(
            settings,
            Classifier::default(),
            Arc::new(registry),
            Arc::new(credentials),
            spawner.clone(),
        );
        let events = handle.subscribe();
        Self {
            handle,
            spawner,
            events,
        }
    }

    fn relay(&self, destination_id: &str) -> ScriptedRelay {
        self.spawner
            .latest(destination_id)
            .unwrap_or_else(|| panic!("no relay spawned for {destination_id}"))
    }

    async fn wait_for(&mut self, mut pred: impl FnMut(&RelayEvent) -> bool) -> RelayEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(3600), self.events.recv())
                .await
                .expect("event within an hour")
                .expect("event channel open");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn wait_terminated(&mut self, destination: &str) -> RelayEvent {
        self.wait_for(|e| {
            matches!(
                e,
                RelayEvent::Terminated { destination_id, .. } if destination_id == destination
            )
        })
        .await
    }

    async fn status_of(&self, destination_id: &str) -> DestinationStatus {
        self.handle
            .status()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.destination_id == destination_id)
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// Start / stop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_all_reports_skipped_destinations() {
    let registry = StaticRegistry::new([
        Destination::new("a", "A", "rtmp://a.example/live/", true),
        Destination::new("b", "B", "rtmp://b.example/live/", true),
        Destination::new("c", "C", "rtmp://c.example/live/", false),
    ]);
    let credentials = StaticCredentials::new()
        .with_key("user1", "a", "real-key-for-a")
        .with_key("user1", "b", "your-b-key-here")
        .with_key("user1", "c", "real-key-for-c");
    let h = Harness::build(
        ScriptedSpawner::new(),
        SupervisorSettings::default(),
        registry,
        credentials,
    );

    assert_eq!(h.handle.start_all().await.unwrap(), 1);
    assert_eq!(h.spawner.total_spawned(), 1);

    let a = h.status_of("a").await;
    assert_eq!(a.state, RelayState::Running);
    assert!(a.pid.is_some());

    let b = h.status_of("b").await;
    assert_eq!(b.state, RelayState::Skipped);
    assert_eq!(b.detail.as_deref(), Some("skipped: no key"));

    let c = h.status_of("c").await;
    assert_eq!(c.state, RelayState::Skipped);
    assert_eq!(c.detail.as_deref(), Some("skipped: disabled"));
}

#[tokio::test(start_paused = true)]
async fn start_one_is_idempotent() {
    let h = Harness::new(ScriptedSpawner::new());

    assert!(h.handle.start_one("youtube").await.unwrap());
    assert!(!h.handle.start_one("youtube").await.unwrap());
    assert_eq!(h.spawner.spawn_count("youtube"), 1);
    assert_eq!(h.handle.active_count().await.unwrap(), 1);

    // start_all does not duplicate the running relay either.
    assert_eq!(h.handle.start_all().await.unwrap(), 1);
    assert_eq!(h.spawner.spawn_count("youtube"), 1);
    assert_eq!(h.handle.active_count().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn unusable_destinations_are_never_spawned() {
    let h = Harness::new(ScriptedSpawner::new());

    let err = h.handle.start_one("facebook").await.unwrap_err();
    assert!(matches!(err, SupervisorError::MissingCredential { ref id } if id == "facebook"));

    let err = h.handle.start_one("tiktok").await.unwrap_err();
    assert!(matches!(err, SupervisorError::Disabled { ref id } if id == "tiktok"));

    let err = h.handle.start_one("myspace").await.unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownDestination { .. }));

    assert_eq!(h.spawner.total_spawned(), 0);
    assert_eq!(h.status_of("youtube").await.state, RelayState::Idle);
}

#[tokio::test(start_paused = true)]
async fn stop_all_empties_the_active_set() {
    let mut h = Harness::new(ScriptedSpawner::new());
    assert_eq!(h.handle.start_all().await.unwrap(), 2);

    assert_eq!(h.handle.stop_all().await.unwrap(), 2);
    assert_eq!(h.handle.active_count().await.unwrap(), 0);

    let mut terminated = Vec::new();
    while terminated.len() < 2 {
        if let RelayEvent::Terminated { destination_id, .. } = h
            .wait_for(|e| matches!(e, RelayEvent::Terminated { .. }))
            .await
        {
            terminated.push(destination_id);
        }
    }
    terminated.sort();
    assert_eq!(terminated, vec!["twitch", "youtube"]);
    assert_eq!(h.relay("youtube").signals(), vec![StopSignal::Graceful]);
    assert_eq!(h.relay("twitch").signals(), vec![StopSignal::Graceful]);

    let youtube = h.status_of("youtube").await;
    assert_eq!(youtube.state, RelayState::Terminated);
    assert_eq!(youtube.exit_code, Some(GRACEFUL_EXIT_CODE));
    assert_eq!(youtube.detail.as_deref(), Some("stop requested"));
}

#[tokio::test(start_paused = true)]
async fn stop_one_signals_once() {
    let mut h = Harness::new(ScriptedSpawner::new().ignore_graceful());
    h.handle.start_one("youtube").await.unwrap();

    assert!(h.handle.stop_one("youtube").await.unwrap());
    assert!(!h.handle.stop_one("youtube").await.unwrap());
    assert_eq!(h.status_of("youtube").await.state, RelayState::Stopping);

    h.wait_terminated("youtube").await;
    assert_eq!(
        h.relay("youtube").signals(),
        vec![StopSignal::Graceful, StopSignal::Force]
    );
}

#[tokio::test(start_paused = true)]
async fn ignored_graceful_stop_is_escalated_after_grace_period() {
    let mut h = Harness::new(ScriptedSpawner::new().ignore_graceful());
    h.handle.start_one("youtube").await.unwrap();

    let stopped_at = Instant::now();
    h.handle.stop_one("youtube").await.unwrap();
    h.wait_for(|e| matches!(e, RelayEvent::Escalated { .. })).await;
    let event = h.wait_terminated("youtube").await;
    let elapsed = stopped_at.elapsed();

    let grace = Duration::from_secs(3);
    assert!(elapsed >= grace, "killed too early: {elapsed:?}");
    assert!(elapsed < grace + Duration::from_secs(1), "killed too late: {elapsed:?}");
    assert!(matches!(
        event,
        RelayEvent::Terminated { exit_code: None, requested: true, .. }
    ));
    assert_eq!(h.status_of("youtube").await.state, RelayState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn stopped_slot_is_free_before_the_process_exits() {
    let mut h = Harness::new(ScriptedSpawner::new().ignore_graceful());
    h.handle.start_one("youtube").await.unwrap();
    h.handle.stop_one("youtube").await.unwrap();

    // The old process is still draining; a new session may start.
    assert!(h.handle.start_one("youtube").await.unwrap());
    assert_eq!(h.spawner.spawn_count("youtube"), 2);

    h.wait_terminated("youtube").await;
    let status = h.status_of("youtube").await;
    assert_eq!(status.state, RelayState::Running);
    assert_eq!(h.handle.active_count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_everything_and_refuses_new_starts() {
    let h = Harness::new(ScriptedSpawner::new());
    h.handle.start_all().await.unwrap();

    h.handle.shutdown().await.unwrap();
    assert_eq!(h.handle.active_count().await.unwrap(), 0);
    assert_eq!(h.status_of("twitch").await.state, RelayState::Terminated);
    assert!(matches!(
        h.handle.start_one("youtube").await,
        Err(SupervisorError::ShuttingDown)
    ));
    assert_eq!(
        h.handle.publish_started(TARGET).await.unwrap(),
        PublishOutcome::Ignored
    );
}

// ---------------------------------------------------------------------------
// Relay feedback
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn startup_timeout_stops_relay_without_frames() {
    let mut h = Harness::new(ScriptedSpawner::new());
    let started_at = Instant::now();
    h.handle.start_one("youtube").await.unwrap();

    let event = h
        .wait_for(|e| matches!(e, RelayEvent::LivenessTimeout { .. }))
        .await;
    let elapsed = started_at.elapsed();
    assert!(matches!(
        event,
        RelayEvent::LivenessTimeout { reason: StopReason::NeverStarted { .. }, .. }
    ));
    assert!(elapsed >= Duration::from_secs(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(320), "{elapsed:?}");

    h.wait_terminated("youtube").await;
    let status = h.status_of("youtube").await;
    assert_eq!(status.state, RelayState::Failed);
    assert_eq!(status.detail.as_deref(), Some("no frames after 300s (never started)"));
    assert_eq!(h.handle.active_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn stall_is_measured_from_the_last_frame() {
    let mut h = Harness::new(ScriptedSpawner::new());
    h.handle.start_one("youtube").await.unwrap();
    let relay = h.relay("youtube");

    tokio::time::sleep(Duration::from_secs(50)).await;
    relay.emit("frame=  1500 fps=30 q=-1.0 size=  4096kB time=00:00:50.00").await;
    let last_frame = Instant::now();
    tokio::time::sleep(Duration::from_millis(1)).await;

    let status = h.status_of("youtube").await;
    assert_eq!(status.last_frame_age_seconds, Some(0));

    let event = h
        .wait_for(|e| matches!(e, RelayEvent::LivenessTimeout { .. }))
        .await;
    let since_frame = last_frame.elapsed();
    assert!(matches!(
        event,
        RelayEvent::LivenessTimeout { reason: StopReason::Stalled { .. }, .. }
    ));
    assert!(since_frame >= Duration::from_secs(120), "{since_frame:?}");
    assert!(since_frame < Duration::from_secs(140), "{since_frame:?}");
}

#[tokio::test(start_paused = true)]
async fn auth_error_stops_only_its_destination() {
    let mut h = Harness::new(ScriptedSpawner::new());
    h.handle.start_all().await.unwrap();

    h.relay("youtube").emit(AUTH_FAILURE).await;
    h.wait_for(|e| matches!(e, RelayEvent::AuthRejected { .. })).await;
    h.wait_terminated("youtube").await;

    assert_eq!(h.handle.active_count().await.unwrap(), 1);
    assert!(h.relay("twitch").signals().is_empty());
    assert_eq!(h.status_of("twitch").await.state, RelayState::Running);

    let youtube = h.status_of("youtube").await;
    assert_eq!(youtube.state, RelayState::Failed);
    assert_eq!(youtube.detail.as_deref(), Some("destination rejected the stream key"));

    let history = h.handle.diagnostics("youtube").await.unwrap().unwrap();
    assert_eq!(history.last().map(String::as_str), Some(AUTH_FAILURE));
}

#[tokio::test(start_paused = true)]
async fn connection_and_transient_issues_are_reported() {
    let mut h = Harness::new(ScriptedSpawner::new());
    h.handle.start_one("youtube").await.unwrap();
    let relay = h.relay("youtube");

    relay.emit("Stream mapping:").await;
    relay.emit("Stream mapping:").await;
    relay.emit("[tcp @ 0x7f] Connection refused").await;
    relay.emit("frame=   10 fps=30").await;

    h.wait_for(|e| matches!(e, RelayEvent::Connected { .. })).await;
    let event = h
        .wait_for(|e| !matches!(e, RelayEvent::Started { .. }))
        .await;
    assert!(
        matches!(
            event,
            RelayEvent::TransientIssue { ref line, .. } if line.contains("Connection refused")
        ),
        "connection is confirmed once: {event:?}"
    );

    let status = h.status_of("youtube").await;
    assert_eq!(status.state, RelayState::Running);
    assert!(status.connected_confirmed);
    assert!(relay.signals().is_empty());

    // Progress lines are not kept in the diagnostic history.
    let history = h.handle.diagnostics("youtube").await.unwrap().unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|line| !line.starts_with("frame=")));
}

#[tokio::test(start_paused = true)]
async fn stream_key_is_redacted_from_output() {
    let mut h = Harness::new(ScriptedSpawner::new());
    h.handle.start_one("youtube").await.unwrap();

    h.relay("youtube")
        .emit("rtmp://a.rtmp.youtube.com/live2/yt-abcd-efgh-ijkl: Connection refused")
        .await;
    let event = h
        .wait_for(|e| matches!(e, RelayEvent::TransientIssue { .. }))
        .await;
    let RelayEvent::TransientIssue { line, .. } = event else {
        unreachable!()
    };
    assert_eq!(line, "rtmp://a.rtmp.youtube.com/live2/yt-a...ijkl: Connection refused");

    h.relay("youtube")
        .emit("rtmp://a.rtmp.youtube.com/live2/yt-abcd-efgh-ijkl: Server returned 403 Forbidden")
        .await;
    let event = h
        .wait_for(|e| matches!(e, RelayEvent::AuthRejected { .. }))
        .await;
    assert!(!format!("{event:?}").contains("yt-abcd-efgh-ijkl"));
    h.wait_terminated("youtube").await;

    let history = h.handle.diagnostics("youtube").await.unwrap().unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|line| !line.contains("yt-abcd-efgh-ijkl")));
    assert!(history.iter().all(|line| line.contains("yt-a...ijkl")));
}

#[tokio::test(start_paused = true)]
async fn unexpected_exit_frees_the_slot_without_restart() {
    let mut h = Harness::new(ScriptedSpawner::new());
    h.handle.start_one("youtube").await.unwrap();

    h.relay("youtube").exit(Some(1));
    let event = h.wait_terminated("youtube").await;
    assert!(matches!(
        event,
        RelayEvent::Terminated { exit_code: Some(1), requested: false, .. }
    ));
    assert_eq!(h.handle.active_count().await.unwrap(), 0);

    let status = h.status_of("youtube").await;
    assert_eq!(status.state, RelayState::Terminated);
    assert_eq!(status.detail.as_deref(), Some("exited with code 1"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.spawner.spawn_count("youtube"), 1);

    assert!(h.handle.start_one("youtube").await.unwrap());
    assert_eq!(h.spawner.spawn_count("youtube"), 2);
}

#[tokio::test(start_paused = true)]
async fn spawn_failure_is_isolated() {
    let h = Harness::new(ScriptedSpawner::new().fail_for("youtube"));

    assert_eq!(h.handle.start_all().await.unwrap(), 1);
    assert_eq!(h.status_of("twitch").await.state, RelayState::Running);

    let youtube = h.status_of("youtube").await;
    assert_eq!(youtube.state, RelayState::Failed);
    assert!(youtube.detail.unwrap().contains("Failed to spawn"));

    assert!(matches!(
        h.handle.start_one("youtube").await,
        Err(SupervisorError::Spawn { .. })
    ));
}

// ---------------------------------------------------------------------------
// Ingest notifications
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn publish_starts_relays_after_stabilization_delay() {
    let mut h = Harness::new(ScriptedSpawner::new());
    let published_at = Instant::now();

    assert_eq!(
        h.handle.publish_started(TARGET).await.unwrap(),
        PublishOutcome::Scheduled { delay_ms: 2000 }
    );
    assert_eq!(
        h.handle.publish_started(TARGET).await.unwrap(),
        PublishOutcome::AlreadyPending
    );
    assert_eq!(h.spawner.total_spawned(), 0);

    h.wait_for(|e| matches!(e, RelayEvent::Started { .. })).await;
    let waited = published_at.elapsed();
    assert!(waited >= Duration::from_secs(2), "{waited:?}");
    assert!(waited < Duration::from_millis(2100), "{waited:?}");
    assert_eq!(h.handle.active_count().await.unwrap(), 2);

    // A repeated publish while relays run starts nothing new.
    assert_eq!(
        h.handle.publish_started(TARGET).await.unwrap(),
        PublishOutcome::AlreadyActive
    );
    assert_eq!(h.spawner.total_spawned(), 2);

    assert_eq!(h.handle.publish_ended(TARGET).await.unwrap(), 2);
    assert_eq!(h.handle.active_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn unpublish_during_stabilization_cancels_start() {
    let mut h = Harness::new(ScriptedSpawner::new());

    h.handle.publish_started(TARGET).await.unwrap();
    assert_eq!(h.handle.publish_ended(TARGET).await.unwrap(), 0);
    h.wait_for(|e| matches!(e, RelayEvent::StartCanceled)).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.spawner.total_spawned(), 0);
    assert_eq!(h.handle.active_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn unrecognized_path_waits_longer_under_permissive_policy() {
    let h = Harness::new(ScriptedSpawner::new());

    assert_eq!(
        h.handle.publish_started("/live/someone-else").await.unwrap(),
        PublishOutcome::Scheduled { delay_ms: 5000 }
    );
    h.handle.publish_ended("").await.unwrap();

    assert_eq!(
        h.handle.publish_started("").await.unwrap(),
        PublishOutcome::Scheduled { delay_ms: 2000 }
    );
}

#[tokio::test(start_paused = true)]
async fn strict_policy_gates_starts_but_not_stops() {
    let settings = SupervisorSettings {
        path_policy: PathPolicy::new(TARGET, PathMatchMode::Strict),
        ..SupervisorSettings::default()
    };
    let h = Harness::with_settings(ScriptedSpawner::new(), settings);

    assert_eq!(
        h.handle.publish_started("/live/other").await.unwrap(),
        PublishOutcome::Ignored
    );
    assert_eq!(h.handle.publish_started("").await.unwrap(), PublishOutcome::Ignored);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.spawner.total_spawned(), 0);

    // Unpublish stops everything whatever path it reports.
    assert_eq!(h.handle.start_all().await.unwrap(), 2);
    assert_eq!(h.handle.publish_ended("").await.unwrap(), 2);
    assert_eq!(h.handle.active_count().await.unwrap(), 0);

    assert_eq!(h.handle.start_all().await.unwrap(), 2);
    assert_eq!(h.handle.publish_ended("/live/other").await.unwrap(), 2);
    assert_eq!(h.handle.active_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn nothing_to_relay_is_reported() {
    let registry = StaticRegistry::new([Destination::new(
        "facebook",
        "Facebook",
        "rtmps://live-api-s.facebook.com:443/rtmp/",
        true,
    )]);
    let mut h = Harness::build(
        ScriptedSpawner::new(),
        SupervisorSettings::default(),
        registry,
        StaticCredentials::new(),
    );

    h.handle.publish_started(TARGET).await.unwrap();
    h.wait_for(|e| matches!(e, RelayEvent::NothingToRelay)).await;
    assert_eq!(h.spawner.total_spawned(), 0);
}
