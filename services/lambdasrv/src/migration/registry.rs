//! Host entity-registry abstraction.
//!
//! Some migration steps edit the host's persisted entity registry (renames,
//! duplicate collapse). The engine snapshots the registry before each step
//! so a failed step can be rolled back together with the document.

use crate::{BridgeError, BridgeResult};
use std::collections::BTreeMap;

/// Mutable view of the host's persisted entity registry.
pub trait EntityRegistry: Send + Sync {
    /// All entity ids, in a stable order.
    fn entity_ids(&self) -> Vec<String>;

    /// Rename an entity; returns whether it existed.
    fn rename(&mut self, old_id: &str, new_id: &str) -> BridgeResult<bool>;

    /// Remove an entity; returns whether it existed.
    fn remove(&mut self, id: &str) -> BridgeResult<bool>;

    /// Snapshot for rollback.
    fn export(&self) -> serde_json::Value;

    /// Restore a snapshot taken by [`export`](EntityRegistry::export).
    fn import(&mut self, snapshot: serde_json::Value) -> BridgeResult<()>;
}

/// Registry backed by an in-process map: `entity_id -> unique_id`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    entities: BTreeMap<String, String>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity_id: impl Into<String>, unique_id: impl Into<String>) {
        self.entities.insert(entity_id.into(), unique_id.into());
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityRegistry for InMemoryRegistry {
    fn entity_ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    fn rename(&mut self, old_id: &str, new_id: &str) -> BridgeResult<bool> {
        match self.entities.remove(old_id) {
            Some(unique_id) => {
                self.entities.insert(new_id.to_string(), unique_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&mut self, id: &str) -> BridgeResult<bool> {
        Ok(self.entities.remove(id).is_some())
    }

    fn export(&self) -> serde_json::Value {
        serde_json::to_value(&self.entities).unwrap_or(serde_json::Value::Null)
    }

    fn import(&mut self, snapshot: serde_json::Value) -> BridgeResult<()> {
        self.entities = serde_json::from_value(snapshot)
            .map_err(|e| BridgeError::Internal(format!("Registry snapshot: {e}")))?;
        Ok(())
    }
}
