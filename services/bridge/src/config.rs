//! Bridge configuration loading.
//!
//! Two JSON documents, per paths in `CONFIG_PATH` / `BROKERS_PATH`:
//! - the main config (vendor credentials, default broker, device overrides)
//! - the broker catalog (keyed by broker id, `@`-prefixed fields are
//!   indirect file loads resolved relative to the catalog file's directory)
//!
//! No environment-variable overrides beyond the two path variables
//! themselves; JSON is the sole wire format (unlike `forwarder::config`,
//! which parses TOML — the document shape here is fixed by the vendor's
//! existing config files).

use bridge_protocol::BrokerDefinition;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hame-bridge/config.json";
pub const DEFAULT_BROKERS_PATH: &str = "/etc/hame-bridge/brokers.json";
pub const DEFAULT_HEALTH_BIND: &str = "0.0.0.0:8080";

// ---------------------------------------------------------------------------
// Public config types
// ---------------------------------------------------------------------------

/// Top-level bridge configuration (the "main config" document).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker_url: String,
    pub username: String,
    pub password: String,
    pub default_broker_id: Option<String>,
    pub inverse_forwarding: bool,
    pub inverse_forwarding_device_ids: Vec<String>,
    pub devices: Vec<DeviceOverride>,
    pub health_bind: String,
}

/// A device entry from the config document. Every field besides
/// `device_id`/`mac`/`device_type` is an override applied on top of
/// whatever the vendor API reports (or the sole source of truth if the
/// vendor API is not consulted for this device).
#[derive(Debug, Clone)]
pub struct DeviceOverride {
    pub device_id: String,
    pub mac: String,
    pub device_type: String,
    pub version: Option<f64>,
    pub inverse_forwarding: Option<bool>,
    pub broker_id: Option<String>,
    pub remote_id: Option<String>,
    pub use_remote_topic_id: Option<bool>,
}

/// The broker catalog: broker id -> definition.
pub type BrokerCatalog = HashMap<String, BrokerDefinition>;

// ---------------------------------------------------------------------------
// Raw JSON deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawBridgeConfig {
    broker_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    default_broker_id: Option<String>,
    inverse_forwarding: Option<bool>,
    inverse_forwarding_device_ids: Option<String>,
    devices: Option<Vec<RawDeviceOverride>>,
    health_bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceOverride {
    device_id: Option<String>,
    mac: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    version: Option<f64>,
    inverse_forwarding: Option<bool>,
    broker_id: Option<String>,
    remote_id: Option<String>,
    use_remote_topic_id: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawBrokerDefinition {
    url: Option<String>,
    ca: Option<String>,
    cert: Option<String>,
    key: Option<String>,
    client_id_prefix: Option<String>,
    topic_prefix: Option<String>,
    local_topic_prefix: Option<String>,
    topic_encryption_key: Option<String>,
    #[serde(default)]
    min_versions: HashMap<String, f64>,
    #[serde(default)]
    use_remote_topic_id_versions: HashMap<String, Vec<f64>>,
    #[serde(default)]
    inverse_forwarding: bool,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_bridge_config_from_path(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_bridge_config_from_str(&json)
}

pub fn load_bridge_config() -> Result<BridgeConfig, ConfigError> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
    load_bridge_config_from_path(Path::new(&path))
}

pub fn load_bridge_config_from_str(json: &str) -> Result<BridgeConfig, ConfigError> {
    let raw: RawBridgeConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let broker_url = raw
        .broker_url
        .ok_or_else(|| ConfigError::MissingField("broker_url".to_owned()))?;
    let username = raw
        .username
        .ok_or_else(|| ConfigError::MissingField("username".to_owned()))?;
    let password = raw
        .password
        .ok_or_else(|| ConfigError::MissingField("password".to_owned()))?;

    let inverse_forwarding_device_ids = raw
        .inverse_forwarding_device_ids
        .map(|s| {
            s.split(',')
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut devices = Vec::new();
    for (i, d) in raw.devices.unwrap_or_default().into_iter().enumerate() {
        let device_id = d
            .device_id
            .ok_or_else(|| ConfigError::MissingField(format!("devices[{}].device_id", i)))?;
        let mac = d
            .mac
            .ok_or_else(|| ConfigError::MissingField(format!("devices[{}].mac", i)))?;
        let device_type = d
            .device_type
            .ok_or_else(|| ConfigError::MissingField(format!("devices[{}].type", i)))?;
        devices.push(DeviceOverride {
            device_id,
            mac,
            device_type,
            version: d.version,
            inverse_forwarding: d.inverse_forwarding,
            broker_id: d.broker_id,
            remote_id: d.remote_id,
            use_remote_topic_id: d.use_remote_topic_id,
        });
    }

    Ok(BridgeConfig {
        broker_url,
        username,
        password,
        default_broker_id: raw.default_broker_id,
        inverse_forwarding: raw.inverse_forwarding.unwrap_or(false),
        inverse_forwarding_device_ids,
        devices,
        health_bind: raw.health_bind.unwrap_or_else(|| DEFAULT_HEALTH_BIND.to_owned()),
    })
}

pub fn load_broker_catalog_from_path(path: &Path) -> Result<BrokerCatalog, ConfigError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading brokers file '{}': {}", path.display(), e)))?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    load_broker_catalog_from_str(&json, &base_dir)
}

pub fn load_broker_catalog() -> Result<BrokerCatalog, ConfigError> {
    let path = std::env::var("BROKERS_PATH").unwrap_or_else(|_| DEFAULT_BROKERS_PATH.to_owned());
    load_broker_catalog_from_path(Path::new(&path))
}

/// `base_dir` is where `@`-prefixed indirect file loads are resolved from.
pub fn load_broker_catalog_from_str(
    json: &str,
    base_dir: &Path,
) -> Result<BrokerCatalog, ConfigError> {
    let raw: HashMap<String, RawBrokerDefinition> =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut catalog = BrokerCatalog::new();
    for (broker_id, r) in raw {
        let url = resolve_indirect(r.url, base_dir)?
            .ok_or_else(|| ConfigError::MissingField(format!("brokers.{}.url", broker_id)))?;
        let ca = resolve_indirect(r.ca, base_dir)?;
        let cert = resolve_indirect(r.cert, base_dir)?;
        let key = resolve_indirect(r.key, base_dir)?;
        let client_id_prefix = resolve_indirect(r.client_id_prefix, base_dir)?;
        let topic_prefix = resolve_indirect(r.topic_prefix, base_dir)?
            .unwrap_or_else(|| "hame_energy/".to_owned());
        let local_topic_prefix = resolve_indirect(r.local_topic_prefix, base_dir)?;
        let topic_encryption_key = resolve_indirect(r.topic_encryption_key, base_dir)?;

        catalog.insert(
            broker_id,
            BrokerDefinition {
                url,
                ca,
                cert,
                key,
                client_id_prefix,
                topic_prefix,
                local_topic_prefix,
                topic_encryption_key,
                min_versions: r.min_versions,
                use_remote_topic_id_versions: r.use_remote_topic_id_versions,
                inverse_forwarding: r.inverse_forwarding,
            },
        );
    }

    Ok(catalog)
}

/// If `value` starts with `@`, read the file at `base_dir.join(&value[1..])`
/// and return its contents instead. Otherwise return `value` unchanged.
fn resolve_indirect(value: Option<String>, base_dir: &Path) -> Result<Option<String>, ConfigError> {
    let Some(value) = value else { return Ok(None) };
    match value.strip_prefix('@') {
        Some(rel_path) => {
            let full_path: PathBuf = base_dir.join(rel_path);
            let contents = std::fs::read_to_string(&full_path).map_err(|e| {
                ConfigError::Io(format!(
                    "reading indirect file '{}': {}",
                    full_path.display(),
                    e
                ))
            })?;
            Ok(Some(contents))
        }
        None => Ok(Some(value)),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "missing required field: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
