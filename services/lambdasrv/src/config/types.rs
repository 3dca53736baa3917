//! Typed configuration views.
//!
//! [`ServiceSettings`] configures the service process itself (figment, YAML
//! file plus `LAMBDASRV_` environment overrides). [`BridgeConfig`] is the
//! validating view over the user's YAML document; it deserializes the
//! required sections without closing the document to unknown keys.

use crate::{BridgeError, BridgeResult};
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A display-name override for one register id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NameOverride {
    pub id: String,
    pub override_name: String,
}

/// Modbus section of the user document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSection {
    #[serde(default = "default_byte_order")]
    pub int32_byte_order: String,
}

fn default_byte_order() -> String {
    "big".to_string()
}

impl Default for ModbusSection {
    fn default() -> Self {
        Self {
            int32_byte_order: default_byte_order(),
        }
    }
}

/// Validating view of the required sections of the user document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub disabled_registers: Vec<u32>,
    #[serde(default)]
    pub sensors_names_override: Vec<NameOverride>,
    /// `device_id -> cycling counter key -> offset`
    #[serde(default)]
    pub cycling_offsets: HashMap<String, HashMap<String, u64>>,
    /// `device_id -> { sensor_entity_id }`
    #[serde(default)]
    pub energy_consumption_sensors: HashMap<String, HashMap<String, String>>,
    /// `device_id -> energy counter key -> offset (kWh)`
    #[serde(default)]
    pub energy_consumption_offsets: HashMap<String, HashMap<String, f64>>,
    #[serde(default)]
    pub modbus: ModbusSection,
}

impl BridgeConfig {
    /// Resolve the display name for a register id, if overridden.
    pub fn name_override(&self, id: &str) -> Option<&str> {
        self.sensors_names_override
            .iter()
            .find(|o| o.id == id)
            .map(|o| o.override_name.as_str())
    }

    pub fn is_register_disabled(&self, address: u32) -> bool {
        self.disabled_registers.contains(&address)
    }
}

// ============================================================================
// Service settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusSettings {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_secs: 5,
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// The user-facing YAML document.
    pub config_file: PathBuf,
    /// JSON snapshot of the accounting state.
    pub state_file: PathBuf,
    /// Migration backup directory.
    pub backup_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("lambda_config.yaml"),
            state_file: PathBuf::from("lambda_state.json"),
            backup_dir: PathBuf::from("backups"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: String,
    pub console: bool,
    pub file: Option<String>,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: None,
            json: false,
        }
    }
}

/// Process-level settings for the bridge service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceSettings {
    #[serde(default)]
    pub modbus: ModbusSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl ServiceSettings {
    /// Load settings from an optional YAML file layered under `LAMBDASRV_`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("LAMBDASRV_").split("__"))
            .extract()
            .map_err(|e| BridgeError::config_invalid(format!("Service settings: {e}")))
    }

    pub fn log_config(&self) -> common::logging::LogConfig {
        common::logging::LogConfig {
            level: self.log.level.clone(),
            console: self.log.console,
            file: self.log.file.clone(),
            json: self.log.json,
        }
    }
}
