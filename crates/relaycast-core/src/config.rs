//! Configuration resolution for RelayCast.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/relaycast/settings.json)
//! 3. Explicit config file (passed on the command line)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::PatternTable;
use crate::error::{Error, Result};

/// Complete RelayCast configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub relay: RelayProfile,
    #[serde(default)]
    pub classifier: PatternTable,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen_addr: String,
    /// User whose credentials are used for every destination.
    pub user_id: String,
    pub destinations_path: Option<PathBuf>,
    pub credentials_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
    /// Interval of the periodic per-destination status log line. 0 disables it.
    pub status_log_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8090".to_string(),
            user_id: "user1".to_string(),
            destinations_path: None,
            credentials_path: None,
            log_level: "info".to_string(),
            log_json: false,
            status_log_interval_secs: 60,
        }
    }
}

/// How strictly a reported stream path must match the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PathMatchMode {
    /// Missing and unrecognized paths are treated as the target, with a warning.
    #[default]
    Permissive,
    /// Only the target path and its variants start relays.
    Strict,
}

/// Ingest-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Base URL of the ingest server the relays pull from.
    pub base_url: String,
    /// Stream path whose publish lifecycle drives the relays.
    pub target_path: String,
    pub path_policy: PathMatchMode,
    /// Delay between publish-start and starting relays.
    pub stabilization_delay_ms: u64,
    /// Delay used when an unrecognized path is accepted by the permissive policy.
    pub unrecognized_path_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_url: "rtmp://127.0.0.1:1935".to_string(),
            target_path: "/live/my-stream-key".to_string(),
            path_policy: PathMatchMode::default(),
            stabilization_delay_ms: 2_000,
            unrecognized_path_delay_ms: 5_000,
        }
    }
}

impl IngestConfig {
    /// Full URL of the target stream on the ingest server.
    pub fn ingest_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.target_path.starts_with('/') {
            format!("{base}{}", self.target_path)
        } else {
            format!("{base}/{}", self.target_path)
        }
    }

    pub const fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    pub const fn unrecognized_path_delay(&self) -> Duration {
        Duration::from_millis(self.unrecognized_path_delay_ms)
    }
}

/// Relay supervisor timing and executable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Path to the relay executable (ffmpeg-compatible command line).
    pub relay_bin: PathBuf,
    pub health_tick_secs: u64,
    /// Maximum time a relay may run without producing its first frame.
    pub startup_timeout_secs: u64,
    /// Maximum time between frames once frames have been seen.
    pub stall_timeout_secs: u64,
    /// Time between the graceful and the forceful termination signal.
    pub grace_period_secs: u64,
    /// Number of diagnostic lines retained per relay session.
    pub diagnostic_history: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            relay_bin: PathBuf::from("ffmpeg"),
            health_tick_secs: 20,
            startup_timeout_secs: 300,
            stall_timeout_secs: 120,
            grace_period_secs: 3,
            diagnostic_history: 32,
        }
    }
}

impl SupervisorConfig {
    pub const fn health_tick(&self) -> Duration {
        Duration::from_secs(self.health_tick_secs)
    }

    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Encoding profile passed to every relay process.
///
/// Video is always copied; audio is re-encoded to a fixed profile so every
/// destination receives the same audio format regardless of the ingest source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayProfile {
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
    pub container: String,
    /// Ask the relay executable to reconnect to the ingest on its own.
    pub reconnect: bool,
    pub reconnect_delay_max_secs: u32,
    /// Extra arguments inserted before the output URL.
    pub extra_args: Vec<String>,
}

impl Default for RelayProfile {
    fn default() -> Self {
        Self {
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            audio_sample_rate: 44_100,
            audio_channels: 2,
            container: "flv".to_string(),
            reconnect: true,
            reconnect_delay_max_secs: 5,
            extra_args: Vec::new(),
        }
    }
}

impl Config {
    /// Reject configurations the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.target_path.trim().is_empty() {
            return Err(Error::Config("ingest.target_path must not be empty".into()));
        }
        if self.supervisor.relay_bin.as_os_str().is_empty() {
            return Err(Error::Config("supervisor.relay_bin must not be empty".into()));
        }
        let durations = [
            ("supervisor.health_tick_secs", self.supervisor.health_tick_secs),
            ("supervisor.startup_timeout_secs", self.supervisor.startup_timeout_secs),
            ("supervisor.stall_timeout_secs", self.supervisor.stall_timeout_secs),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.daemon.user_id.trim().is_empty() {
            return Err(Error::Config("daemon.user_id must not be empty".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        layers.push(read_layer(&global_path)?);
    }

    // Unlike the global file, an explicit file must exist
    if let Some(path) = explicit {
        layers.push(read_layer(path)?);
    }

    let mut config = resolve_layers(layers)?;
    apply_env_overrides(&mut config);

    config.validate()?;
    Ok(config)
}

/// Get the global config path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Directory holding the global settings and, by default, the destination
/// registry and credential files.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".relaycast"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/relaycast"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("relaycast"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read one settings file as a raw JSON layer.
fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Overlay settings layers onto the defaults, lowest priority first.
///
/// Objects merge key by key, so a layer only replaces the fields it sets.
/// Arrays and scalars replace the lower value outright.
fn resolve_layers(layers: impl IntoIterator<Item = Value>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for layer in layers {
        merge_values(&mut merged, layer);
    }
    serde_json::from_value(merged).map_err(|e| Error::Config(format!("Invalid settings: {e}")))
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_values(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("RELAYCAST_USER_ID") {
        config.daemon.user_id = val;
    }
    if let Ok(val) = std::env::var("RELAYCAST_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("RELAYCAST_TARGET_PATH") {
        config.ingest.target_path = val;
    }
    if let Ok(val) = std::env::var("RELAYCAST_INGEST_URL") {
        config.ingest.base_url = val;
    }
    if let Ok(val) = std::env::var("RELAYCAST_RELAY_BIN") {
        config.supervisor.relay_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("RELAYCAST_GRACE_PERIOD_SECS")
        && let Ok(n) = val.parse()
    {
        config.supervisor.grace_period_secs = n;
    }
}
