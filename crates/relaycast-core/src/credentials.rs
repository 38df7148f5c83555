//! Per-user destination credentials (stream keys).
//!
//! The on-disk document is keyed by user id; every entry maps destination ids
//! to stream keys next to optional display metadata:
//!
//! ```json
//! { "user1": { "name": "User 1", "youtube": "xxxx-xxxx-xxxx", "twitch": "" } }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Read-only source of stream keys.
pub trait CredentialStore: Send + Sync {
    /// Raw stored key, which may be empty or a template placeholder.
    fn credential(&self, user_id: &str, destination_id: &str) -> Option<String>;

    /// Human-readable name of the user, if recorded.
    fn display_name(&self, user_id: &str) -> Option<String> {
        let _ = user_id;
        None
    }

    /// Key usable for `destination_id`, or `None` when missing or a placeholder.
    fn usable_credential(&self, user_id: &str, destination_id: &str) -> Option<String> {
        self.credential(user_id, destination_id)
            .filter(|key| is_usable(key, destination_id))
            .map(|key| key.trim().to_string())
    }
}

/// Whether a stored key can be used to push to a destination.
///
/// Empty keys and the `your-<destination>-key-here` template placeholders
/// written by [`StaticCredentials::load_or_init`] are not usable.
pub fn is_usable(key: &str, destination_id: &str) -> bool {
    let key = key.trim();
    if key.is_empty() {
        return false;
    }
    if key == format!("your-{destination_id}-key-here") {
        return false;
    }
    !(key.starts_with("your-") && key.ends_with("-key-here"))
}

/// Redact a key for logging: first and last four characters only.
pub fn redact(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Replace every occurrence of `key` in `text` with its redacted form.
pub fn scrub(text: &str, key: &str) -> String {
    if key.is_empty() {
        return text.to_string();
    }
    text.replace(key, &redact(key))
}

/// Stored data for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Destination id -> stream key.
    #[serde(flatten)]
    pub keys: BTreeMap<String, String>,
}

/// In-memory credential store.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: BTreeMap<String, UserCredentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper to add one key.
    #[must_use]
    pub fn with_key(mut self, user_id: &str, destination_id: &str, key: &str) -> Self {
        self.users
            .entry(user_id.to_string())
            .or_default()
            .keys
            .insert(destination_id.to_string(), key.to_string());
        self
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let users: BTreeMap<String, UserCredentials> = serde_json::from_str(content)
            .map_err(|e| Error::Credentials(format!("Failed to parse credentials: {e}")))?;
        Ok(Self { users })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Credentials(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Load the credential file, writing a template with placeholder keys
    /// for `destination_ids` first if it does not exist yet.
    pub fn load_or_init(path: &Path, user_id: &str, destination_ids: &[String]) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let mut template = UserCredentials {
            name: Some(user_id.to_string()),
            ..UserCredentials::default()
        };
        for id in destination_ids {
            template
                .keys
                .insert(id.clone(), format!("your-{id}-key-here"));
        }
        let mut store = Self::new();
        store.users.insert(user_id.to_string(), template);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&store.users)?)?;
        info!(path = %path.display(), user_id, "Created credential template");
        Ok(store)
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }
}

impl CredentialStore for StaticCredentials {
    fn credential(&self, user_id: &str, destination_id: &str) -> Option<String> {
        self.users
            .get(user_id)
            .and_then(|u| u.keys.get(destination_id))
            .cloned()
    }

    fn display_name(&self, user_id: &str) -> Option<String> {
        self.users.get(user_id).and_then(|u| u.name.clone())
    }
}
