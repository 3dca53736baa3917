//! JSON-file backed persistence for the accounting state.

use crate::core::accounting::{AccountingState, PersistentStore};
use crate::BridgeResult;
use std::path::PathBuf;

/// Stores the accounting snapshot as pretty-printed JSON. Writes go
/// through a temp file and rename so a crash mid-write never leaves a
/// truncated snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PersistentStore for JsonFileStore {
    fn load(&self) -> BridgeResult<Option<AccountingState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let state = serde_json::from_str(&raw)?;
        Ok(Some(state))
    }

    fn save(&self, state: &AccountingState) -> BridgeResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
