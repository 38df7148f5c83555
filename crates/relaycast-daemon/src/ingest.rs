//! Ingest publish notifications and stream path matching.
//!
//! Ingest servers report the published stream path in several shapes
//! (`/live/key`, `live/key`, `key`, `rtmp://host/live/key`) and sometimes not
//! at all. [`PathPolicy`] decides whether a reported path refers to the
//! target stream.

use std::time::Duration;

use relaycast_core::config::{IngestConfig, PathMatchMode};

/// Ingest lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    PublishStarted { stream_path: String },
    PublishEnded { stream_path: String },
}

/// How a reported stream path relates to the target stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMatch {
    /// The path is the target or one of its variants.
    Target,
    /// No path was reported.
    Missing,
    /// A path was reported but it is not the target.
    Unrecognized,
}

/// What to do about a publish-start notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishDecision {
    /// Start relays after the given delay.
    StartAfter(Duration),
    Ignore,
}

/// Stream path matching policy.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    target: String,
    variants: Vec<String>,
    mode: PathMatchMode,
    stabilization_delay: Duration,
    unrecognized_delay: Duration,
}

impl PathPolicy {
    pub fn new(target: &str, mode: PathMatchMode) -> Self {
        Self {
            target: normalize(target),
            variants: variants_of(target),
            mode,
            stabilization_delay: Duration::from_secs(2),
            unrecognized_delay: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            stabilization_delay: config.stabilization_delay(),
            unrecognized_delay: config.unrecognized_path_delay(),
            ..Self::new(&config.target_path, config.path_policy)
        }
    }

    /// Normalized target path (always starts with `/`).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Classify a reported stream path.
    pub fn resolve(&self, stream_path: &str) -> PathMatch {
        let path = stream_path.trim();
        if path.is_empty() || path == "undefined" {
            return PathMatch::Missing;
        }
        let matches = self.variants.iter().any(|variant| {
            path == variant || path.ends_with(&format!("/{}", variant.trim_start_matches('/')))
        });
        if matches {
            PathMatch::Target
        } else {
            PathMatch::Unrecognized
        }
    }

    /// Decide how to react to a publish-start for `stream_path`.
    pub fn on_publish(&self, stream_path: &str) -> PublishDecision {
        match (self.resolve(stream_path), self.mode) {
            (PathMatch::Target, _) | (PathMatch::Missing, PathMatchMode::Permissive) => {
                PublishDecision::StartAfter(self.stabilization_delay)
            }
            (PathMatch::Unrecognized, PathMatchMode::Permissive) => {
                PublishDecision::StartAfter(self.unrecognized_delay)
            }
            (PathMatch::Missing | PathMatch::Unrecognized, PathMatchMode::Strict) => {
                PublishDecision::Ignore
            }
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// `/live/key` -> [`/live/key`, `live/key`, `key`].
fn variants_of(target: &str) -> Vec<String> {
    let normalized = normalize(target);
    let bare = normalized.trim_start_matches('/').to_string();
    let mut variants = vec![normalized.clone(), bare.clone()];
    if let Some((_, last)) = bare.rsplit_once('/')
        && !last.is_empty()
    {
        variants.push(last.to_string());
    }
    variants.dedup();
    variants
}
