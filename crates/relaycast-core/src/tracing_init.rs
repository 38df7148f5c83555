//! Shared tracing/logging initialization.
//!
//! The log level comes from settings (`daemon.log_level`), so a bad value is a
//! configuration error reported at startup rather than a silently ignored
//! directive.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"relaycast_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    let env_filter = build_filter(default_filter, std::env::var("RUST_LOG").ok())?;
    let installed = if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    installed.map_err(|e| Error::Config(format!("Tracing already initialised: {e}")))
}

/// `RUST_LOG` wins over the configured default.
fn build_filter(default_filter: &str, rust_log: Option<String>) -> Result<EnvFilter> {
    let directives = rust_log.unwrap_or_else(|| default_filter.to_string());
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("Invalid log filter {directives:?}: {e}")))
}

/// Build the default filter directive for the daemon and its core library.
pub fn default_filter(level: &str) -> String {
    format!("relaycast_daemon={level},relaycast_core={level}")
}
