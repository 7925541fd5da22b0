//! Agent settings: device identity, transport endpoints, and the ordered
//! feature list.
//!
//! Settings load once at boot and persist on every mutation. Mutations go
//! through [`SettingsStore::mutate`], which applies the change under the
//! settings lock and emits a change notification; a background persister
//! owns the actual file write so no caller blocks on disk I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::value::{Value, ValueMap};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Static geographic position for devices without a GPS feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
}

/// Pub/sub broker endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_broker_port(),
            username: None,
            password: None,
        }
    }
}

/// Local admin endpoint switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

fn default_admin_port() -> u16 {
    4005
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_admin_port(),
        }
    }
}

/// One configured feature instance.
///
/// `feature_type` selects the plugin; `id` distinguishes multiple instances
/// of the same type. Property values are free-form and read back through
/// the typed accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default)]
    pub enabled: bool,
    pub id: String,
    #[serde(rename = "type")]
    pub feature_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub properties: ValueMap,
}

impl FeatureConfig {
    pub fn new(id: impl Into<String>, feature_type: impl Into<String>) -> Self {
        Self {
            enabled: false,
            id: id.into(),
            feature_type: feature_type.into(),
            version: String::new(),
            properties: ValueMap::new(),
        }
    }

    pub fn property_int(&self, name: &str, default: i64) -> i64 {
        self.properties
            .get(name)
            .and_then(Value::as_int)
            .unwrap_or(default)
    }

    pub fn property_float(&self, name: &str, default: f64) -> f64 {
        self.properties
            .get(name)
            .and_then(Value::as_float)
            .unwrap_or(default)
    }

    pub fn property_bool(&self, name: &str, default: bool) -> bool {
        self.properties
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Integer accessor for properties conventionally written in hex.
    pub fn property_hex(&self, name: &str, default: i64) -> i64 {
        self.property_int(name, default)
    }

    pub fn property_string(&self, name: &str, default: &str) -> String {
        self.properties
            .get(name)
            .map(Value::to_text)
            .unwrap_or_else(|| default.to_string())
    }

    /// A property as a string list: native arrays element-wise, scalar
    /// strings as a comma-separated list.
    pub fn property_string_array(&self, name: &str) -> Vec<String> {
        match self.properties.get(name) {
            Some(Value::Array(items)) => items.iter().map(Value::to_text).collect(),
            Some(Value::Str(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn property_map(&self, name: &str) -> ValueMap {
        self.properties
            .get(name)
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default()
    }
}

/// Root settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Device identity, used as message source and topic suffix.
    pub id: String,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(default)]
    pub admin: AdminSettings,
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
}

impl Settings {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            broker: BrokerSettings::default(),
            ingest_url: None,
            proxy: None,
            location: None,
            admin: AdminSettings::default(),
            features: Vec::new(),
        }
    }

    pub fn feature(&self, id: &str) -> Option<&FeatureConfig> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn feature_mut(&mut self, id: &str) -> Option<&mut FeatureConfig> {
        self.features.iter_mut().find(|f| f.id == id)
    }

    /// Drop features with duplicate ids, keeping the first occurrence.
    /// Returns true when anything was removed.
    fn dedupe_features(&mut self) -> bool {
        let mut seen = std::collections::HashSet::new();
        let before = self.features.len();
        self.features.retain(|f| seen.insert(f.id.clone()));
        before != self.features.len()
    }

    /// Mutate a named top-level setting from a config request targeting the
    /// agent itself.
    pub fn set_named(&mut self, name: &str, value: &Value) -> bool {
        match name {
            "id" => {
                self.id = value.to_text();
                true
            }
            "ingest_url" => {
                self.ingest_url = Some(value.to_text());
                true
            }
            "proxy" => {
                self.proxy = Some(value.to_text());
                true
            }
            "broker_host" => {
                self.broker.host = value.to_text();
                true
            }
            "broker_port" => {
                if let Some(port) = value.as_int() {
                    self.broker.port = port as u16;
                    true
                } else {
                    false
                }
            }
            "admin_port" => {
                if let Some(port) = value.as_int() {
                    self.admin.port = port as u16;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

/// Shared settings handle with change-triggered persistence.
#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    inner: Arc<RwLock<Settings>>,
    changed: mpsc::UnboundedSender<()>,
}

impl SettingsStore {
    /// Load settings from `path`. Duplicate feature ids are removed and the
    /// cleaned file is written back immediately.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, mpsc::UnboundedReceiver<()>), SettingsError>
    {
        let path = path.as_ref().to_path_buf();
        let text = std::fs::read_to_string(&path)?;
        let mut settings: Settings = serde_json::from_str(&text)?;
        if settings.dedupe_features() {
            warn!(path = %path.display(), "duplicate feature ids removed from settings");
            write_settings(&path, &settings)?;
        }
        info!(id = %settings.id, features = settings.features.len(), "settings loaded");
        let (changed, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                path,
                inner: Arc::new(RwLock::new(settings)),
                changed,
            },
            rx,
        ))
    }

    /// Build a store around in-memory settings (tests, first boot).
    pub fn in_memory(
        path: impl AsRef<Path>,
        settings: Settings,
    ) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (changed, rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.as_ref().to_path_buf(),
                inner: Arc::new(RwLock::new(settings)),
                changed,
            },
            rx,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current settings.
    pub fn get(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn device_id(&self) -> String {
        self.inner.read().id.clone()
    }

    /// Apply `mutate` under the settings lock and notify the persister.
    pub fn mutate<R>(&self, mutate: impl FnOnce(&mut Settings) -> R) -> R {
        let result = {
            let mut guard = self.inner.write();
            mutate(&mut guard)
        };
        // The persister may already be gone during shutdown.
        let _ = self.changed.send(());
        result
    }

    /// Re-read the settings file, replacing the in-memory state.
    pub fn reload(&self) -> Result<(), SettingsError> {
        let text = std::fs::read_to_string(&self.path)?;
        let mut settings: Settings = serde_json::from_str(&text)?;
        settings.dedupe_features();
        *self.inner.write() = settings;
        Ok(())
    }

    /// Write the current settings synchronously. Used by the persister task
    /// and by the final flush on shutdown.
    pub fn save(&self) -> Result<(), SettingsError> {
        let snapshot = self.get();
        write_settings(&self.path, &snapshot)
    }
}

fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let text = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, text)?;
    Ok(())
}
