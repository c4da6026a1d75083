//! Device registry and connector configuration.
//!
//! The device registry is owned by whoever writes the configuration file;
//! command processing only reads it. [`resolve_device`] is the single lookup
//! used by the executor.

use crate::error::{KkmError, KkmResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const DEFAULT_SYNC_WAIT_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Device description
// ---------------------------------------------------------------------------

/// Kind of peripheral a device entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceType {
    FiscalRegistrar,
    Scales,
    BarcodeScanner,
    CustomerDisplay,
    Other,
}

/// Network endpoint (fiscal server, network register).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanConnection {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Serial port settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComPortConnection {
    pub port_name: String,
    pub speed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnection {
    #[serde(default)]
    pub lan: Option<LanConnection>,
    #[serde(default)]
    pub com_port: Option<ComPortConnection>,
}

/// One configured device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default)]
    pub connection: DeviceConnection,
    /// Type-specific settings, decoded lazily by the handler that owns the
    /// device type (see [`KkmConfig`]).
    #[serde(default)]
    pub device_specific_config: Option<serde_json::Value>,
}

impl DeviceConfig {
    /// Decode the device-specific blob. Absence yields `Ok(None)`.
    pub fn specific<T: DeserializeOwned>(&self) -> KkmResult<Option<T>> {
        match &self.device_specific_config {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
                KkmError::Configuration(format!(
                    "Device {}: invalid deviceSpecificConfig: {e}",
                    self.id
                ))
            }),
        }
    }

    /// Fiscal-registrar settings; required for `FiscalRegistrar` devices.
    pub fn kkm_config(&self) -> KkmResult<KkmConfig> {
        self.specific::<KkmConfig>()?.ok_or_else(|| {
            KkmError::Configuration(format!(
                "Device {} has no fiscal registrar configuration",
                self.id
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Fiscal registrar configuration
// ---------------------------------------------------------------------------

/// Fiscal registrar model / backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KkmType {
    Atol8,
    Atol10,
    AtolWebServer,
    ShtrihM,
    VikiPrint,
    Mercury,
    KkmServer,
}

/// Fiscal data format revision the register is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FfdVersion {
    Offline,
    Ffd100,
    Ffd105,
    Ffd110,
    Ffd120,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KkmConfig {
    pub kkm_type: KkmType,
    #[serde(default)]
    pub ffd_version: Option<FfdVersion>,
    /// Register number on a multi-register fiscal server.
    #[serde(default)]
    pub num_device: Option<u32>,
    /// Per-call device timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Connector configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    /// How long a "without queue" submission waits before reading back the
    /// command status.
    #[serde(default = "default_sync_wait_ms")]
    pub sync_wait_ms: u64,
}

fn default_sync_wait_ms() -> u64 {
    DEFAULT_SYNC_WAIT_MS
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            sync_wait_ms: DEFAULT_SYNC_WAIT_MS,
        }
    }
}

impl QueueSettings {
    pub fn sync_wait(&self) -> Duration {
        Duration::from_millis(self.sync_wait_ms)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl ConnectorConfig {
    pub fn from_json_str(raw: &str) -> KkmResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| KkmError::Configuration(format!("Invalid configuration: {e}")))
    }

    pub fn load(path: &Path) -> KkmResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            KkmError::Configuration(format!("Cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_json_str(&raw)?;
        debug!(path = %path.display(), devices = config.devices.len(), "Configuration loaded");
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Source of device descriptions.
pub trait DeviceRegistry: Send + Sync {
    fn devices(&self) -> KkmResult<Vec<DeviceConfig>>;
}

impl DeviceRegistry for ConnectorConfig {
    fn devices(&self) -> KkmResult<Vec<DeviceConfig>> {
        Ok(self.devices.clone())
    }
}

/// Registry that re-reads the configuration file on every lookup, so edits
/// take effect without a restart.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceRegistry for FileRegistry {
    fn devices(&self) -> KkmResult<Vec<DeviceConfig>> {
        Ok(ConnectorConfig::load(&self.path)?.devices)
    }
}

/// Find exactly one device with the given id.
pub fn resolve_device(registry: &dyn DeviceRegistry, id: &str) -> KkmResult<DeviceConfig> {
    let mut matches: Vec<DeviceConfig> = registry
        .devices()?
        .into_iter()
        .filter(|d| d.id == id)
        .collect();

    match matches.len() {
        0 => Err(KkmError::NotFound(format!("Device {id} not found"))),
        1 => Ok(matches.remove(0)),
        n => Err(KkmError::Configuration(format!(
            "Device id {id} is configured {n} times"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
