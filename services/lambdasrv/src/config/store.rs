//! Store for the user-facing YAML document.
//!
//! The document is an open map: required sections are validated through
//! [`BridgeConfig`](crate::config::BridgeConfig), but unknown keys are
//! preserved across every write. Read-then-write sequences are serialized
//! under a coarse async lock shared with the migration engine.

use crate::config::BridgeConfig;
use crate::{BridgeError, BridgeResult};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Document key carrying the stored migration version.
pub const VERSION_KEY: &str = "version";

/// Skeleton written when no document exists yet.
const TEMPLATE: &str = "\
# Lambda bridge configuration

# Register addresses to skip during polling
disabled_registers: []

# Display-name overrides, entries of {id, override_name}
sensors_names_override: []

# Additive cycling-counter offsets per device
cycling_offsets: {}

# External cumulative energy sensor per device
energy_consumption_sensors: {}

# Additive energy-counter offsets per device (kWh)
energy_consumption_offsets: {}

modbus:
  # Word order for 32-bit register pairs: big | little
  int32_byte_order: big
";

/// Required top-level sections of the document.
pub const REQUIRED_SECTIONS: [&str; 6] = [
    "disabled_registers",
    "sensors_names_override",
    "cycling_offsets",
    "energy_consumption_sensors",
    "energy_consumption_offsets",
    "modbus",
];

/// The YAML document store. Cheap to clone; clones share the lock.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Materialize the skeleton document when none exists.
    ///
    /// A fresh document is stamped at `latest_version` so a new install
    /// never runs migrations.
    pub async fn ensure_initialized(&self, latest_version: u32) -> BridgeResult<()> {
        let _guard = self.lock.lock().await;
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = format!("{TEMPLATE}\n{VERSION_KEY}: {latest_version}\n");
        tokio::fs::write(&self.path, content).await?;
        tracing::info!(path = %self.path.display(), "Wrote configuration skeleton");
        Ok(())
    }

    /// Load the open document. Malformed YAML is `CONFIG_INVALID`.
    pub async fn load_document(&self) -> BridgeResult<Mapping> {
        let _guard = self.lock.lock().await;
        self.read_document().await
    }

    /// Serialize and write the document back, preserving every key it holds.
    pub async fn save_document(&self, document: &Mapping) -> BridgeResult<()> {
        let _guard = self.lock.lock().await;
        self.write_document(document).await
    }

    /// Read-modify-write under the lock. The closure's changes are written
    /// back only when it returns `Ok(true)`.
    pub async fn update<F>(&self, mutate: F) -> BridgeResult<bool>
    where
        F: FnOnce(&mut Mapping) -> BridgeResult<bool>,
    {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        let changed = mutate(&mut document)?;
        if changed {
            self.write_document(&document).await?;
        }
        Ok(changed)
    }

    /// The validating typed view of the required sections.
    pub async fn typed(&self) -> BridgeResult<BridgeConfig> {
        let document = self.load_document().await?;
        serde_yaml::from_value(Value::Mapping(document))
            .map_err(|e| BridgeError::config_invalid(format!("Configuration schema: {e}")))
    }

    /// Stored migration version; a document without the key is at version 1.
    pub async fn stored_version(&self) -> BridgeResult<u32> {
        let document = self.load_document().await?;
        Ok(version_of(&document))
    }

    async fn read_document(&self) -> BridgeResult<Mapping> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        match serde_yaml::from_str::<Value>(&raw) {
            Ok(Value::Mapping(map)) => Ok(map),
            Ok(Value::Null) => Ok(Mapping::new()),
            Ok(_) => Err(BridgeError::config_invalid(
                "Configuration root must be a mapping",
            )),
            Err(e) => Err(BridgeError::config_invalid(format!("Malformed YAML: {e}"))),
        }
    }

    async fn write_document(&self, document: &Mapping) -> BridgeResult<()> {
        let serialized = serde_yaml::to_string(&Value::Mapping(document.clone()))?;
        tokio::fs::write(&self.path, serialized).await?;
        Ok(())
    }
}

/// Read the stored version out of an open document.
pub fn version_of(document: &Mapping) -> u32 {
    document
        .get(Value::from(VERSION_KEY))
        .and_then(Value::as_u64)
        .map_or(1, |v| v as u32)
}

/// Stamp a document with a version.
pub fn set_version(document: &mut Mapping, version: u32) {
    document.insert(Value::from(VERSION_KEY), Value::from(version));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("lambda_config.yaml"))
    }

    #[tokio::test]
    async fn test_skeleton_materialization() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_initialized(7).await.unwrap();

        let document = store.load_document().await.unwrap();
        for section in REQUIRED_SECTIONS {
            assert!(
                document.contains_key(Value::from(section)),
                "missing {section}"
            );
        }
        assert_eq!(version_of(&document), 7);

        let typed = store.typed().await.unwrap();
        assert_eq!(typed.modbus.int32_byte_order, "big");
    }

    #[tokio::test]
    async fn test_ensure_initialized_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.ensure_initialized(3).await.unwrap();

        store
            .update(|doc| {
                doc.insert(Value::from("user_key"), Value::from("kept"));
                Ok(true)
            })
            .await
            .unwrap();

        store.ensure_initialized(3).await.unwrap();
        let document = store.load_document().await.unwrap();
        assert_eq!(
            document.get(Value::from("user_key")),
            Some(&Value::from("kept"))
        );
    }

    #[tokio::test]
    async fn test_unknown_keys_survive_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lambda_config.yaml");
        tokio::fs::write(&path, "disabled_registers: [5]\nextra: {nested: true}\n")
            .await
            .unwrap();

        let store = ConfigStore::new(&path);
        store
            .update(|doc| {
                doc.insert(Value::from("cycling_offsets"), Value::Mapping(Mapping::new()));
                Ok(true)
            })
            .await
            .unwrap();

        let document = store.load_document().await.unwrap();
        let extra = document.get(Value::from("extra")).unwrap();
        assert_eq!(
            extra.get("nested"),
            Some(&Value::from(true))
        );
        assert!(document.contains_key(Value::from("cycling_offsets")));
    }

    #[tokio::test]
    async fn test_malformed_yaml_is_config_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        tokio::fs::write(&path, "modbus: [unclosed\n").await.unwrap();

        let store = ConfigStore::new(&path);
        let err = store.load_document().await.unwrap_err();
        assert!(matches!(err, BridgeError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn test_missing_version_defaults_to_initial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.yaml");
        tokio::fs::write(&path, "disabled_registers: []\n").await.unwrap();

        let store = ConfigStore::new(&path);
        assert_eq!(store.stored_version().await.unwrap(), 1);
    }
}
