//! End-to-end migration runs against real files.

use async_trait::async_trait;
use lambdasrv::config::store::ConfigStore;
use lambdasrv::core::status::StatusSurface;
use lambdasrv::migration::steps::{catalog, MigrationContext, MigrationStep};
use lambdasrv::migration::{BackupManager, EntityRegistry, InMemoryRegistry, MigrationEngine, MigrationVersion};
use lambdasrv::{BridgeError, BridgeResult};
use serde_yaml::{Mapping, Value};
use std::time::Duration;
use tempfile::TempDir;

fn engine_for(dir: &TempDir, config_path: &std::path::Path) -> (MigrationEngine, ConfigStore, StatusSurface) {
    let store = ConfigStore::new(config_path);
    let status = StatusSurface::new();
    let engine = MigrationEngine::new(
        store.clone(),
        BackupManager::new(dir.path().join("backups")),
        status.clone(),
        MigrationContext::default(),
    )
    .with_retry(1, Duration::ZERO);
    (engine, store, status)
}

#[tokio::test]
async fn migrates_version_1_document_to_latest() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("lambda_config.yaml");
    std::fs::write(
        &config_path,
        "disabled_registers: [1050]\nmodbus:\n  byte_order: little\n",
    )
    .unwrap();

    let (engine, store, _status) = engine_for(&dir, &config_path);
    let mut registry = InMemoryRegistry::new();
    let audit = engine
        .migrate_to(&mut registry, MigrationVersion::latest())
        .await
        .unwrap();

    assert_eq!(audit.from_version, 1);
    assert_eq!(audit.steps.len(), 6);
    assert_eq!(store.stored_version().await.unwrap(), 7);

    let document = store.load_document().await.unwrap();
    for section in [
        "cycling_offsets",
        "energy_consumption_sensors",
        "energy_consumption_offsets",
        "sensors_names_override",
    ] {
        assert!(document.contains_key(Value::from(section)), "missing {section}");
    }
    // The old byte-order key was renamed, value preserved.
    let modbus = document.get(Value::from("modbus")).unwrap();
    assert_eq!(modbus["int32_byte_order"], Value::from("little"));
    assert!(modbus.get("byte_order").is_none());
    // User data untouched.
    assert_eq!(
        document.get(Value::from("disabled_registers")).unwrap()[0],
        Value::from(1050)
    );

    // Document and registry-export backups landed in the backup directory.
    // Steps inside the same second share a timestamped name, so presence is
    // asserted rather than a per-step count.
    let backups: Vec<String> = std::fs::read_dir(dir.path().join("backups"))
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .collect();
    assert!(backups.iter().any(|n| n.starts_with("lambda_config.yaml.") && n.ends_with(".bak")));
    assert!(backups.iter().any(|n| n.starts_with("entity_registry.json.") && n.ends_with(".bak")));
}

#[tokio::test]
async fn rerun_at_latest_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("lambda_config.yaml");
    std::fs::write(&config_path, "disabled_registers: []\n").unwrap();

    let (engine, _store, _status) = engine_for(&dir, &config_path);
    let mut registry = InMemoryRegistry::new();
    engine
        .migrate_to(&mut registry, MigrationVersion::latest())
        .await
        .unwrap();

    let bytes_before = std::fs::read(&config_path).unwrap();
    let audit = engine
        .migrate_to(&mut registry, MigrationVersion::latest())
        .await
        .unwrap();
    assert!(audit.steps.is_empty());
    assert_eq!(std::fs::read(&config_path).unwrap(), bytes_before);
}

struct ExplodingStep;

#[async_trait]
impl MigrationStep for ExplodingStep {
    fn target(&self) -> MigrationVersion {
        MigrationVersion::EnergyConsumption
    }

    fn name(&self) -> &'static str {
        "energy_consumption"
    }

    async fn apply(
        &self,
        document: &mut Mapping,
        _registry: &mut dyn EntityRegistry,
        _ctx: &MigrationContext,
    ) -> BridgeResult<()> {
        document.insert(Value::from("half_written"), Value::from(true));
        Err(BridgeError::Internal("injected failure".into()))
    }
}

#[tokio::test]
async fn forced_failure_mid_chain_rolls_back_the_step() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("lambda_config.yaml");
    std::fs::write(&config_path, "disabled_registers: []\n").unwrap();

    let (engine, store, status) = engine_for(&dir, &config_path);
    let mut registry = InMemoryRegistry::new();

    // Real steps up to version 3, then an injected failure at version 4.
    let mut steps: Vec<Box<dyn MigrationStep>> = catalog()
        .into_iter()
        .filter(|s| s.target() < MigrationVersion::EnergyConsumption)
        .collect();
    steps.push(Box::new(ExplodingStep));

    let err = engine
        .run(&mut registry, &steps, MigrationVersion::EnergyConsumption)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::MigrationFailed(_)));

    // Versions 2 and 3 committed; version 4 rolled back cleanly.
    assert_eq!(store.stored_version().await.unwrap(), 3);
    let document = store.load_document().await.unwrap();
    assert!(document.contains_key(Value::from("cycling_offsets")));
    assert!(!document.contains_key(Value::from("half_written")));
    assert!(!document.contains_key(Value::from("energy_consumption_sensors")));

    let audit = status.migration_audit();
    let failed = audit.steps.iter().find(|s| !s.success).unwrap();
    assert_eq!(failed.version, 4);
    assert_eq!(failed.error_kind.as_deref(), Some("INTERNAL"));
}

#[tokio::test]
async fn fresh_skeleton_needs_no_migration() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("lambda_config.yaml");

    let store = ConfigStore::new(&config_path);
    store
        .ensure_initialized(MigrationVersion::latest().as_u32())
        .await
        .unwrap();

    let (engine, store, _status) = engine_for(&dir, &config_path);
    let mut registry = InMemoryRegistry::new();
    let audit = engine
        .migrate_to(&mut registry, MigrationVersion::latest())
        .await
        .unwrap();
    assert!(audit.steps.is_empty());
    assert_eq!(store.stored_version().await.unwrap(), 7);
}
