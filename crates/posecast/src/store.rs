//! Persisted relay connection settings.
//!
//! Settings live as one JSON object under [`CONFIG_KEY`] in a key-value store.
//! Reads merge the stored object over the defaults; a stored value that cannot
//! be parsed is logged and ignored. Writes replace the stored object whole.

use crate::config::{ConnectionConfig, Validation};
use crate::link::ConnectionState;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{info, warn};

/// Key the connection settings are stored under.
pub const CONFIG_KEY: &str = "relayNodeConfig";

/// Field names written by older builds and their current spelling.
const LEGACY_KEYS: [(&str, &str); 3] = [
    ("url", "endpointUrl"),
    ("reconnectInterval", "reconnectIntervalMs"),
    ("dataTransmissionInterval", "sampleIntervalMs"),
];

/// Flat feature switches written by older builds, mapped into `features`.
const LEGACY_FLAGS: [(&str, &str); 6] = [
    ("enableBiometricData", "biometricData"),
    ("enablePoseData", "poseData"),
    ("enableRepDetection", "repDetection"),
    ("enableVideoFrames", "videoFrames"),
    ("compressionEnabled", "compression"),
    ("encryptionEnabled", "encryption"),
];

/// Failures reading, writing or updating the settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The merged settings failed validation; nothing was persisted.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    /// The update was not a JSON object, or a field had the wrong type.
    #[error("invalid update: {0}")]
    Patch(String),
    /// The backing store failed.
    #[error("store error: {0}")]
    Store(String),
    /// Serialization failed.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// String-keyed persistent storage.
pub trait KeyValueStore: Send + Sync {
    /// Read `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Store`] if the backing medium cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError>;

    /// Write `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Store`] if the write does not complete.
    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| ConfigError::Store(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| ConfigError::Store(e.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Store backed by a JSON object file on disk.
///
/// The whole file is rewritten on every `set`: written to a temp file, then
/// renamed over the original.
pub struct FileStore {
    entries: RwLock<HashMap<String, String>>,
    path: PathBuf,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store; an
    /// unreadable one is logged and treated as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let entries = if path.exists() {
            let contents =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Store(e.to_string()))?;
            match serde_json::from_str::<HashMap<String, String>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %path.display(),
                        "store file unreadable, starting empty"
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            entries: RwLock::new(entries),
            path,
        })
    }

    fn save_locked(&self, entries: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Store(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents)
            .map_err(|e| ConfigError::Store(format!("write error: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| ConfigError::Store(format!("rename error: {e}")))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| ConfigError::Store(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| ConfigError::Store(e.to_string()))?;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.save_locked(&entries) {
            match previous {
                Some(v) => entries.insert(key.to_string(), v),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Rewrite legacy field names in a stored or patch object to current ones.
fn canonicalize(obj: &mut Map<String, Value>) {
    for (old, new) in LEGACY_KEYS {
        if let Some(v) = obj.remove(old) {
            obj.entry(new).or_insert(v);
        }
    }
    let mut flags = Map::new();
    for (old, new) in LEGACY_FLAGS {
        if let Some(v) = obj.remove(old) {
            flags.insert(new.to_string(), v);
        }
    }
    if !flags.is_empty() {
        let features = obj
            .entry("features")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(existing) = features {
            for (k, v) in flags {
                existing.entry(k).or_insert(v);
            }
        }
    }
}

/// Overlay `patch` onto `base`, recursing into nested objects.
fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                let nested = v.is_object() && base.get(&k).is_some_and(Value::is_object);
                match base.get_mut(&k) {
                    Some(existing) if nested => merge(existing, v),
                    _ => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Typed access to the connection settings in a [`KeyValueStore`].
pub struct ConfigStore<S> {
    store: S,
}

impl<S: KeyValueStore> ConfigStore<S> {
    /// Wrap `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Defaults merged with the stored overrides. Corrupt stored data is
    /// logged and the defaults are returned.
    pub fn load(&self) -> ConnectionConfig {
        let stored = match self.store.get(CONFIG_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return ConnectionConfig::default(),
            Err(e) => {
                warn!(error = %e, "failed to read stored relay config, using defaults");
                return ConnectionConfig::default();
            }
        };
        match Self::overlay(ConnectionConfig::default(), &stored) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "failed to parse stored relay config, using defaults");
                ConnectionConfig::default()
            }
        }
    }

    fn overlay(base: ConnectionConfig, raw: &str) -> Result<ConnectionConfig, ConfigError> {
        let patch: Value = serde_json::from_str(raw)?;
        Self::apply(base, patch)
    }

    fn apply(base: ConnectionConfig, patch: Value) -> Result<ConnectionConfig, ConfigError> {
        let Value::Object(mut patch) = patch else {
            return Err(ConfigError::Patch("expected a JSON object".to_string()));
        };
        canonicalize(&mut patch);
        let mut merged = serde_json::to_value(base)?;
        merge(&mut merged, Value::Object(patch));
        serde_json::from_value(merged).map_err(|e| ConfigError::Patch(e.to_string()))
    }

    /// Persist `config` whole, replacing what was stored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Store`] if the write fails.
    pub fn save(&self, config: &ConnectionConfig) -> Result<(), ConfigError> {
        let json = serde_json::to_string(config)?;
        self.store.set(CONFIG_KEY, &json)?;
        info!("relay connection settings saved");
        Ok(())
    }

    /// Load, merge `patch`, validate, save. Returns the merged settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] with every validation message, or
    /// [`ConfigError::Patch`] if the patch does not fit the schema. In both
    /// cases the stored settings are left untouched.
    pub fn update(&self, patch: Value) -> Result<ConnectionConfig, ConfigError> {
        let merged = Self::apply(self.load(), patch)?;
        let Validation { valid, errors } = merged.validate();
        if !valid {
            return Err(ConfigError::Invalid(errors));
        }
        self.save(&merged)?;
        Ok(merged)
    }

    /// Persist and return the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Store`] if the write fails.
    pub fn reset(&self) -> Result<ConnectionConfig, ConfigError> {
        let defaults = ConnectionConfig::default();
        self.save(&defaults)?;
        Ok(defaults)
    }

    /// Validate the currently stored settings.
    pub fn validate(&self) -> Validation {
        self.load().validate()
    }

    /// Effective endpoint of the currently stored settings.
    pub fn effective_endpoint(&self) -> String {
        self.load().effective_endpoint().to_string()
    }
}

/// Build a one-field patch from a dotted key path, e.g. `features.poseData`.
/// The value is parsed as JSON when possible, otherwise taken as a string.
#[must_use]
pub fn patch_from_pair(key: &str, value: &str) -> Value {
    let leaf = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.into()));
    key.rsplit('.').fold(leaf, |acc, part| {
        let mut obj = Map::new();
        obj.insert(part.to_string(), acc);
        Value::Object(obj)
    })
}

/// Operator-facing one-line link summary.
#[must_use]
pub fn status_text(state: ConnectionState, attempts: u32, max_attempts: u32) -> String {
    match state {
        ConnectionState::Connected => "Connected to Relay Node".to_string(),
        ConnectionState::Failed => "Connection Failed".to_string(),
        ConnectionState::Reconnecting | ConnectionState::Connecting if attempts > 0 => {
            format!("Reconnecting... ({attempts}/{max_attempts})")
        }
        ConnectionState::Connecting => "Connecting to Relay Node".to_string(),
        ConnectionState::Reconnecting | ConnectionState::Idle => {
            "Disconnected from Relay Node".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        let suffix: u64 = rand::random();
        let dir = std::env::temp_dir().join("posecast_store_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{name}_{suffix}.json"))
    }

    #[test]
    fn test_load_without_stored_value_returns_defaults() {
        let store = ConfigStore::new(MemoryStore::new());
        assert_eq!(store.load(), ConnectionConfig::default());
    }

    #[test]
    fn test_corrupt_stored_value_falls_back_to_defaults() {
        let kv = MemoryStore::new();
        kv.set(CONFIG_KEY, "{not json").unwrap();
        let store = ConfigStore::new(kv);
        assert_eq!(store.load(), ConnectionConfig::default());
    }

    #[test]
    fn test_wrongly_typed_stored_value_falls_back_to_defaults() {
        let kv = MemoryStore::new();
        kv.set(CONFIG_KEY, r#"{"reconnectIntervalMs":"soon"}"#)
            .unwrap();
        assert_eq!(ConfigStore::new(kv).load(), ConnectionConfig::default());
    }

    #[test]
    fn test_partial_stored_value_merges_with_defaults() {
        let kv = MemoryStore::new();
        kv.set(CONFIG_KEY, r#"{"proxyUrl":"https://t.example/","features":{"poseData":false}}"#)
            .unwrap();
        let config = ConfigStore::new(kv).load();
        assert_eq!(config.proxy_url, "https://t.example/");
        assert!(!config.features.pose_data);
        assert!(config.features.biometric_data);
        assert_eq!(config.reconnect_interval_ms, 5000);
    }

    #[test]
    fn test_legacy_keys_are_understood() {
        let kv = MemoryStore::new();
        kv.set(
            CONFIG_KEY,
            &json!({
                "enabled": true,
                "url": "ws://10.0.0.5:8080",
                "reconnectInterval": 2500,
                "maxReconnectAttempts": 4,
                "dataTransmissionInterval": 200,
                "enablePoseData": false,
                "encryptionEnabled": true
            })
            .to_string(),
        )
        .unwrap();
        let config = ConfigStore::new(kv).load();
        assert_eq!(config.endpoint_url, "ws://10.0.0.5:8080");
        assert_eq!(config.reconnect_interval_ms, 2500);
        assert_eq!(config.max_reconnect_attempts, 4);
        assert_eq!(config.sample_interval_ms, 200);
        assert!(!config.features.pose_data);
        assert!(config.features.encryption);
    }

    #[test]
    fn test_update_merges_validates_and_persists() {
        let store = ConfigStore::new(MemoryStore::new());
        let updated = store
            .update(json!({"proxyUrl": "https://tunnel.example/", "maxReconnectAttempts": 3}))
            .unwrap();
        assert_eq!(updated.proxy_url, "https://tunnel.example/");
        assert_eq!(updated.max_reconnect_attempts, 3);
        assert_eq!(store.load(), updated);
        assert_eq!(store.effective_endpoint(), "https://tunnel.example/");
    }

    #[test]
    fn test_invalid_update_is_rejected_and_not_persisted() {
        let store = ConfigStore::new(MemoryStore::new());
        store.update(json!({"reconnectIntervalMs": 3000})).unwrap();

        let err = store
            .update(json!({"reconnectIntervalMs": 10, "sampleIntervalMs": 5}))
            .unwrap_err();
        match err {
            ConfigError::Invalid(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("Reconnect interval"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.load().reconnect_interval_ms, 3000);
    }

    #[test]
    fn test_negative_attempts_rejected_by_update() {
        let store = ConfigStore::new(MemoryStore::new());
        let err = store
            .update(json!({"maxReconnectAttempts": -1}))
            .unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_non_object_patch_is_rejected() {
        let store = ConfigStore::new(MemoryStore::new());
        assert!(matches!(
            store.update(json!([1, 2])),
            Err(ConfigError::Patch(_))
        ));
        assert!(matches!(
            store.update(json!({"enabled": "yes"})),
            Err(ConfigError::Patch(_))
        ));
    }

    #[test]
    fn test_reset_persists_defaults() {
        let store = ConfigStore::new(MemoryStore::new());
        store.update(json!({"endpointUrl": "ws://h:1"})).unwrap();
        assert_eq!(store.reset().unwrap(), ConnectionConfig::default());
        assert_eq!(store.load(), ConnectionConfig::default());
    }

    #[test]
    fn test_file_store_round_trips_across_reopen() {
        let path = temp_path("round_trip");
        {
            let store = ConfigStore::new(FileStore::open(path.clone()).unwrap());
            store.update(json!({"endpointUrl": "wss://relay.example"})).unwrap();
        }
        let reopened = ConfigStore::new(FileStore::open(path.clone()).unwrap());
        assert_eq!(reopened.load().endpoint_url, "wss://relay.example");
        assert!(!path.with_extension("json.tmp").exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_file_store_with_garbage_file_starts_empty() {
        let path = temp_path("garbage");
        std::fs::write(&path, "\u{0}\u{1}garbage").unwrap();
        let store = ConfigStore::new(FileStore::open(path.clone()).unwrap());
        assert_eq!(store.load(), ConnectionConfig::default());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_patch_from_pair_builds_nested_objects() {
        assert_eq!(
            patch_from_pair("features.poseData", "false"),
            json!({"features": {"poseData": false}})
        );
        assert_eq!(
            patch_from_pair("proxyUrl", "https://t.example/"),
            json!({"proxyUrl": "https://t.example/"})
        );
        assert_eq!(
            patch_from_pair("maxReconnectAttempts", "7"),
            json!({"maxReconnectAttempts": 7})
        );
    }

    #[test]
    fn test_status_text() {
        assert_eq!(
            status_text(ConnectionState::Connected, 0, 10),
            "Connected to Relay Node"
        );
        assert_eq!(
            status_text(ConnectionState::Reconnecting, 3, 10),
            "Reconnecting... (3/10)"
        );
        assert_eq!(
            status_text(ConnectionState::Connecting, 3, 10),
            "Reconnecting... (3/10)"
        );
        assert_eq!(
            status_text(ConnectionState::Connecting, 0, 10),
            "Connecting to Relay Node"
        );
        assert_eq!(
            status_text(ConnectionState::Idle, 0, 10),
            "Disconnected from Relay Node"
        );
    }

    #[test]
    fn test_status_text_after_retries_exhausted() {
        assert_eq!(
            status_text(ConnectionState::Failed, 10, 10),
            "Connection Failed"
        );
        assert_eq!(
            status_text(ConnectionState::Failed, 0, 0),
            "Connection Failed"
        );
    }
}
