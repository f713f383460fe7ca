use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::{parley_home, SettingsError, SyncSettings};

const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// `~/.parley/settings.json`.
pub fn settings_path() -> PathBuf {
    parley_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SyncSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings, SettingsError> {
    let defaults = serde_json::to_value(SyncSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SyncSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Objects merge per key, everything else is replaced, nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut SyncSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply `PARLEY_*` overrides read through `lookup`. Invalid values are
/// ignored with a warning.
pub fn apply_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = read_string(&lookup, "PARLEY_DEFAULT_MODEL") {
        settings.default_model = v;
    }
    if let Some(v) = read_string(&lookup, "PARLEY_DATABASE_PATH") {
        settings.database_path = PathBuf::from(v);
    }
    if let Some(v) = read_parsed(&lookup, "PARLEY_ATTACHMENT_CHUNK_SIZE", |s| {
        parse_usize_range(s, 1, MAX_CHUNK_SIZE)
    }) {
        settings.attachments.chunk_size = v;
    }
    if let Some(v) = read_parsed(&lookup, "PARLEY_ATTACHMENT_MAX_BYTES", |s| parse_u64_range(s, 1, u64::MAX)) {
        settings.attachments.max_bytes = v;
    }
    if let Some(v) = read_parsed(&lookup, "PARLEY_TOUCH_CONVERSATION", parse_bool) {
        settings.touch_conversation = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.is_empty())
}

fn read_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = lookup(name)?;
    let result = parse(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"attachments": {"chunk_size": 10, "max_bytes": 20}});
        let source = serde_json::json!({"attachments": {"chunk_size": 99}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["attachments"]["chunk_size"], 99);
        assert_eq!(merged["attachments"]["max_bytes"], 20);
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null, "b": 2}));
        assert_eq!(merged, serde_json::json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(serde_json::json!({"xs": [1, 2, 3]}), serde_json::json!({"xs": [4]}));
        assert_eq!(merged["xs"], serde_json::json!([4]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.attachments, SyncSettings::default().attachments);
    }

    #[test]
    fn load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"touch_conversation": true, "attachments": {"max_bytes": 2048}}"#).unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert!(settings.touch_conversation);
        assert_eq!(settings.attachments.max_bytes, 2048);
        assert_eq!(settings.attachments.chunk_size, 64 * 1024);
    }

    #[test]
    fn load_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn overrides_apply_valid_values() {
        let mut settings = SyncSettings::default();
        apply_overrides(
            &mut settings,
            lookup(&[
                ("PARLEY_DEFAULT_MODEL", "claude-haiku"),
                ("PARLEY_DATABASE_PATH", "/var/lib/parley.db"),
                ("PARLEY_ATTACHMENT_CHUNK_SIZE", "4096"),
                ("PARLEY_TOUCH_CONVERSATION", "yes"),
            ]),
        );
        assert_eq!(settings.default_model, "claude-haiku");
        assert_eq!(settings.database_path, PathBuf::from("/var/lib/parley.db"));
        assert_eq!(settings.attachments.chunk_size, 4096);
        assert!(settings.touch_conversation);
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut settings = SyncSettings::default();
        apply_overrides(
            &mut settings,
            lookup(&[
                ("PARLEY_DEFAULT_MODEL", ""),
                ("PARLEY_ATTACHMENT_CHUNK_SIZE", "0"),
                ("PARLEY_ATTACHMENT_MAX_BYTES", "lots"),
                ("PARLEY_TOUCH_CONVERSATION", "maybe"),
            ]),
        );
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_usize_range("-1", 0, 10), None);
    }
}
