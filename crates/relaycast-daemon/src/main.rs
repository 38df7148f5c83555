//! `RelayCast` Daemon
//!
//! Receives publish hooks from the ingest server and relays the published
//! stream to every configured destination.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use relaycast_core::Classifier;
use relaycast_core::config::{self, Config};
use relaycast_core::credentials::{CredentialStore, StaticCredentials};
use relaycast_core::registry::{DestinationRegistry, StaticRegistry};
use relaycast_core::tracing_init;
use relaycast_daemon::http::build_router;
use relaycast_daemon::process::ProcessSpawner;
use relaycast_daemon::supervisor::{Supervisor, SupervisorHandle, SupervisorSettings};

/// Extra time given to relays on shutdown beyond the grace period.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "relaycast-daemon")]
#[command(version, about = "RelayCast daemon - multi-destination live stream relay")]
struct Args {
    /// Settings file (JSON), merged over the global settings
    #[arg(long, short, env = "RELAYCAST_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address for ingest hooks and the control API
    #[arg(long, env = "RELAYCAST_ADDR")]
    addr: Option<SocketAddr>,

    /// User whose stream keys are used
    #[arg(long, env = "RELAYCAST_USER_ID")]
    user_id: Option<String>,

    /// Path to the relay executable (ffmpeg-compatible)
    #[arg(long, env = "RELAYCAST_RELAY_BIN")]
    relay_bin: Option<PathBuf>,

    /// Destination registry file
    #[arg(long, env = "RELAYCAST_DESTINATIONS")]
    destinations: Option<PathBuf>,

    /// Credential file
    #[arg(long, env = "RELAYCAST_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "RELAYCAST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RELAYCAST_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// CLI flags take priority over every settings source.
    fn apply(&self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.daemon.listen_addr = addr.to_string();
        }
        if let Some(user_id) = &self.user_id {
            config.daemon.user_id.clone_from(user_id);
        }
        if let Some(relay_bin) = &self.relay_bin {
            config.supervisor.relay_bin.clone_from(relay_bin);
        }
        if self.destinations.is_some() {
            config.daemon.destinations_path.clone_from(&self.destinations);
        }
        if self.credentials.is_some() {
            config.daemon.credentials_path.clone_from(&self.credentials);
        }
        if let Some(level) = &self.log_level {
            config.daemon.log_level.clone_from(level);
        }
        config.daemon.log_json |= self.log_json;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    tracing_init::init_tracing(
        &tracing_init::default_filter(&config.daemon.log_level),
        config.daemon.log_json,
    )?;

    let addr: SocketAddr = config
        .daemon
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.daemon.listen_addr))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        user = %config.daemon.user_id,
        ingest = %config.ingest.ingest_url(),
        relay_bin = %config.supervisor.relay_bin.display(),
        "Starting relaycast-daemon"
    );

    let destinations_path =
        resolve_data_path(config.daemon.destinations_path.clone(), "destinations.json")?;
    let registry = StaticRegistry::load_or_init(&destinations_path)?;
    info!(
        path = %destinations_path.display(),
        destinations = registry.len(),
        "Loaded destinations"
    );

    let credentials_path =
        resolve_data_path(config.daemon.credentials_path.clone(), "credentials.json")?;
    let destination_ids: Vec<String> = registry
        .list_destinations()
        .into_iter()
        .map(|d| d.id)
        .collect();
    let credentials = StaticCredentials::load_or_init(
        &credentials_path,
        &config.daemon.user_id,
        &destination_ids,
    )?;
    if !credentials.has_user(&config.daemon.user_id) {
        warn!(
            user = %config.daemon.user_id,
            known_users = ?credentials.user_ids(),
            path = %credentials_path.display(),
            "No credentials for user, every destination will be skipped"
        );
    }
    log_readiness(&registry, &credentials, &config.daemon.user_id);

    let classifier = Classifier::new(&config.classifier)?;
    let settings = SupervisorSettings::from_config(&config);
    let shutdown_budget = settings.grace_period + SHUTDOWN_MARGIN;
    let (supervisor, mut supervisor_task) = Supervisor::spawn(
        settings,
        classifier,
        Arc::new(registry),
        Arc::new(credentials),
        Arc::new(ProcessSpawner::new()),
    );
    let status_log = spawn_status_log(
        supervisor.clone(),
        Duration::from_secs(config.daemon.status_log_interval_secs),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let app = build_router(supervisor.clone());

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so relay processes don't inherit it.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %addr, "Ready for ingest hooks");

    let mut outcome = Ok(());
    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            outcome = result.context("HTTP server failed");
        }
        _ = &mut supervisor_task => {
            error!("Relay supervisor stopped unexpectedly; ingest events can no longer be handled");
            outcome = Err(anyhow::anyhow!("relay supervisor stopped"));
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    if let Some(handle) = status_log {
        handle.abort();
    }
    match tokio::time::timeout(shutdown_budget, supervisor.shutdown()).await {
        Ok(Ok(())) => info!("All relays stopped"),
        Ok(Err(e)) => warn!(error = %e, "Relay supervisor already gone"),
        Err(_) => warn!("Timed out waiting for relays to exit"),
    }

    info!("Daemon stopped");
    outcome
}

/// Registry and credential files live in the config directory unless set
/// explicitly: `~/.config/relaycast/<file>` (or `~/.relaycast/<file>`).
fn resolve_data_path(explicit: Option<PathBuf>, file: &str) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(dir) = config::config_dir() {
        return Ok(dir.join(file));
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".relaycast").join(file))
}

fn log_readiness(
    registry: &dyn DestinationRegistry,
    credentials: &dyn CredentialStore,
    user_id: &str,
) {
    let mut ready = 0;
    for destination in registry.list_destinations() {
        let readiness = if !destination.enabled {
            "disabled"
        } else if credentials.usable_credential(user_id, &destination.id).is_some() {
            ready += 1;
            "ready"
        } else {
            "no key"
        };
        info!(destination = %destination.id, name = %destination.name, readiness, "Destination");
    }
    if ready == 0 {
        warn!(user = user_id, "No destination is ready; add stream keys to the credential file");
    } else {
        info!(ready, "Destinations ready");
    }
}

/// Log a status summary every `every`; disabled when zero.
fn spawn_status_log(supervisor: SupervisorHandle, every: Duration) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            interval.tick().await;
            let Ok(statuses) = supervisor.status().await else {
                break;
            };
            let active = statuses.iter().filter(|s| s.state.is_active()).count();
            info!(active, destinations = statuses.len(), "Relay status");
            for status in statuses.iter().filter(|s| s.state.is_active()) {
                info!(
                    destination = %status.destination_id,
                    state = %status.state,
                    connected = status.connected_confirmed,
                    last_frame_age_secs = ?status.last_frame_age_seconds,
                    pid = ?status.pid,
                    "Relay status"
                );
            }
        }
    }))
}
