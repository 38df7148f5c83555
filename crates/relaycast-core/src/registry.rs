//! Destination registry.
//!
//! A destination is one external streaming endpoint (a broadcast platform
//! ingest) the relay can push to. The registry is read-only for the
//! supervisor; it is loaded once from a JSON document keyed by destination id:
//!
//! ```json
//! { "youtube": { "name": "YouTube", "rtmpUrl": "rtmp://a.rtmp.youtube.com/live2/", "enabled": true } }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// One external streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub name: String,
    /// Egress URL prefix; the credential key is appended to it.
    pub base_url: String,
    pub enabled: bool,
    pub icon: Option<String>,
}

impl Destination {
    pub fn new(id: &str, name: &str, base_url: &str, enabled: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            enabled,
            icon: None,
        }
    }

    /// Egress URL for the given credential key.
    pub fn egress_url(&self, key: &str) -> String {
        format!("{}{}", self.base_url, key)
    }
}

/// Read-only source of destinations.
pub trait DestinationRegistry: Send + Sync {
    /// All destinations, ordered by id.
    fn list_destinations(&self) -> Vec<Destination>;

    fn get(&self, id: &str) -> Option<Destination> {
        self.list_destinations().into_iter().find(|d| d.id == id)
    }
}

/// In-memory registry.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    destinations: BTreeMap<String, Destination>,
}

impl StaticRegistry {
    pub fn new(destinations: impl IntoIterator<Item = Destination>) -> Self {
        Self {
            destinations: destinations
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
        }
    }

    /// Parse a registry document.
    pub fn from_json(content: &str) -> Result<Self> {
        let entries: BTreeMap<String, DestinationEntry> = serde_json::from_str(content)
            .map_err(|e| Error::Registry(format!("Failed to parse destinations: {e}")))?;
        Ok(Self::new(
            entries.into_iter().map(|(id, entry)| entry.into_destination(id)),
        ))
    }

    /// Load a registry file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Registry(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Load a registry file, writing the default registry first if it does
    /// not exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let registry = Self::with_defaults();
        registry.save(path)?;
        info!(path = %path.display(), "Created default destination registry");
        Ok(registry)
    }

    /// Write the registry in its on-disk format.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries: BTreeMap<&str, DestinationEntry> = self
            .destinations
            .values()
            .map(|d| (d.id.as_str(), DestinationEntry::from(d)))
            .collect();
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }

    /// The well-known broadcast platforms; the ones that need extra account
    /// setup ship disabled.
    pub fn with_defaults() -> Self {
        let with_icon = |mut d: Destination, icon: &str| {
            d.icon = Some(icon.to_string());
            d
        };
        Self::new([
            with_icon(
                Destination::new("youtube", "YouTube", "rtmp://a.rtmp.youtube.com/live2/", true),
                "🔴",
            ),
            with_icon(
                Destination::new(
                    "facebook",
                    "Facebook",
                    "rtmp://live-api-s.facebook.com:443/rtmp/",
                    true,
                ),
                "🔵",
            ),
            with_icon(
                Destination::new("twitch", "Twitch", "rtmp://live.twitch.tv/app/", true),
                "🟣",
            ),
            with_icon(
                Destination::new("tiktok", "TikTok", "rtmp://live.tiktok.com/live/", false),
                "⚫",
            ),
            with_icon(
                Destination::new(
                    "instagram",
                    "Instagram",
                    "rtmp://live.instagram.com/rtmp/",
                    false,
                ),
                "🟡",
            ),
        ])
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

impl DestinationRegistry for StaticRegistry {
    fn list_destinations(&self) -> Vec<Destination> {
        self.destinations.values().cloned().collect()
    }

    fn get(&self, id: &str) -> Option<Destination> {
        self.destinations.get(id).cloned()
    }
}

/// On-disk shape of one registry entry.
#[derive(Debug, Serialize, Deserialize)]
struct DestinationEntry {
    name: String,
    #[serde(rename = "rtmpUrl", alias = "base_url")]
    base_url: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

const fn default_enabled() -> bool {
    true
}

impl DestinationEntry {
    fn into_destination(self, id: String) -> Destination {
        Destination {
            id,
            name: self.name,
            base_url: self.base_url,
            enabled: self.enabled,
            icon: self.icon,
        }
    }
}

impl From<&Destination> for DestinationEntry {
    fn from(d: &Destination) -> Self {
        Self {
            name: d.name.clone(),
            base_url: d.base_url.clone(),
            enabled: d.enabled,
            icon: d.icon.clone(),
        }
    }
}
