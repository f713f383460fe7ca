//! Layered configuration for the synchronization layer.
//!
//! Compiled defaults, then `~/.parley/settings.json` deep-merged over them,
//! then `PARLEY_*` environment variables.

mod loader;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path, parse_bool,
    parse_u64_range, parse_usize_range, settings_path,
};

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Model used for conversations created without an explicit one.
    pub default_model: String,
    pub database_path: PathBuf,
    pub attachments: AttachmentSettings,
    /// Bump a conversation's `updated_at` on every turn write.
    pub touch_conversation: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            default_model: "gpt-4.1-nano".to_string(),
            database_path: parley_home().join("parley.db"),
            attachments: AttachmentSettings::default(),
            touch_conversation: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentSettings {
    /// Bytes per download chunk; also the in-memory spill threshold of the
    /// temporary download buffer.
    pub chunk_size: usize,
    /// Per-attachment ceiling. Larger sources are skipped.
    pub max_bytes: u64,
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_bytes: 25 * 1024 * 1024,
        }
    }
}

pub(crate) fn parley_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".parley")
}
