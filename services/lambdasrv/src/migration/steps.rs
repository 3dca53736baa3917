//! The ordered migration step catalog.
//!
//! Each step is an additive transformation of the open configuration
//! document, optionally with entity-registry edits. Steps never delete
//! user keys from the document.

use crate::migration::registry::EntityRegistry;
use crate::migration::version::MigrationVersion;
use crate::BridgeResult;
use async_trait::async_trait;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::sync::OnceLock;

/// Cycling counter keys seeded with zero offsets.
const CYCLING_OFFSET_KEYS: [&str; 4] = [
    "heating_cycling_total",
    "hot_water_cycling_total",
    "cooling_cycling_total",
    "defrost_cycling_total",
];

/// Energy counter keys seeded with zero offsets.
const ENERGY_OFFSET_KEYS: [&str; 5] = [
    "heating_energy_total",
    "hot_water_energy_total",
    "cooling_energy_total",
    "defrost_energy_total",
    "stby_energy_total",
];

/// Host-side inputs the steps need beyond the document itself.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    /// Device ids the installation exposes, e.g. `hp1`.
    pub device_ids: Vec<String>,
    /// Installation name prefix used in entity ids, e.g. `eu08l`.
    pub name_prefix: String,
    /// Entity ids the current naming scheme produces. Empty means the
    /// legacy-names step has nothing to compare against and skips.
    pub expected_entity_ids: Vec<String>,
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self {
            device_ids: vec!["hp1".to_string()],
            name_prefix: "eu08l".to_string(),
            expected_entity_ids: Vec::new(),
        }
    }
}

impl MigrationContext {
    /// Prefix identifying entities owned by this bridge.
    fn owned_prefix(&self) -> String {
        format!("sensor.{}_", self.name_prefix)
    }
}

/// One versioned schema transformation.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// Version the document is at after this step commits.
    fn target(&self) -> MigrationVersion;

    fn name(&self) -> &'static str;

    async fn apply(
        &self,
        document: &mut Mapping,
        registry: &mut dyn EntityRegistry,
        ctx: &MigrationContext,
    ) -> BridgeResult<()>;
}

/// All steps in application order.
pub fn catalog() -> Vec<Box<dyn MigrationStep>> {
    vec![
        Box::new(LegacyNamesStep),
        Box::new(CyclingOffsetsStep),
        Box::new(EnergyConsumptionStep),
        Box::new(EntityOptimizationStep),
        Box::new(ConfigRestructureStep),
        Box::new(RegisterOrderStep),
    ]
}

fn section_missing(document: &Mapping, key: &str) -> bool {
    !document.contains_key(Value::from(key))
}

fn zero_offsets(ctx: &MigrationContext, keys: &[&str]) -> Value {
    let mut devices = Mapping::new();
    for device in &ctx.device_ids {
        let mut offsets = Mapping::new();
        for key in keys {
            offsets.insert(Value::from(*key), Value::from(0));
        }
        devices.insert(Value::from(device.as_str()), Value::Mapping(offsets));
    }
    Value::Mapping(devices)
}

/// Version 2: drop registry entries left behind by the pre-2 naming scheme.
///
/// Only entities owned by this bridge are touched; user renames without the
/// owned prefix stay untouched.
struct LegacyNamesStep;

#[async_trait]
impl MigrationStep for LegacyNamesStep {
    fn target(&self) -> MigrationVersion {
        MigrationVersion::LegacyNames
    }

    fn name(&self) -> &'static str {
        "legacy_names"
    }

    async fn apply(
        &self,
        _document: &mut Mapping,
        registry: &mut dyn EntityRegistry,
        ctx: &MigrationContext,
    ) -> BridgeResult<()> {
        if ctx.expected_entity_ids.is_empty() {
            tracing::debug!("No expected entity ids supplied, skipping legacy cleanup");
            return Ok(());
        }
        let prefix = ctx.owned_prefix();
        let mut removed = 0;
        for entity_id in registry.entity_ids() {
            if entity_id.starts_with(&prefix)
                && !ctx.expected_entity_ids.contains(&entity_id)
                && registry.remove(&entity_id)?
            {
                tracing::info!(entity_id, "Removed legacy entity");
                removed += 1;
            }
        }
        tracing::info!(removed, "Legacy name cleanup complete");
        Ok(())
    }
}

/// Version 3: seed the `cycling_offsets` section with zero defaults.
struct CyclingOffsetsStep;

#[async_trait]
impl MigrationStep for CyclingOffsetsStep {
    fn target(&self) -> MigrationVersion {
        MigrationVersion::CyclingOffsets
    }

    fn name(&self) -> &'static str {
        "cycling_offsets"
    }

    async fn apply(
        &self,
        document: &mut Mapping,
        _registry: &mut dyn EntityRegistry,
        ctx: &MigrationContext,
    ) -> BridgeResult<()> {
        if section_missing(document, "cycling_offsets") {
            document.insert(
                Value::from("cycling_offsets"),
                zero_offsets(ctx, &CYCLING_OFFSET_KEYS),
            );
            tracing::info!("Added cycling_offsets section");
        }
        Ok(())
    }
}

/// Version 4: seed the energy-consumption sections.
struct EnergyConsumptionStep;

#[async_trait]
impl MigrationStep for EnergyConsumptionStep {
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
        ctx: &MigrationContext,
    ) -> BridgeResult<()> {
        if section_missing(document, "energy_consumption_sensors") {
            let mut devices = Mapping::new();
            for device in &ctx.device_ids {
                let mut entry = Mapping::new();
                entry.insert(
                    Value::from("sensor_entity_id"),
                    Value::from(format!(
                        "sensor.{}_{device}_compressor_power_consumption_accumulated",
                        ctx.name_prefix
                    )),
                );
                devices.insert(Value::from(device.as_str()), Value::Mapping(entry));
            }
            document.insert(
                Value::from("energy_consumption_sensors"),
                Value::Mapping(devices),
            );
            tracing::info!("Added energy_consumption_sensors section");
        }
        if section_missing(document, "energy_consumption_offsets") {
            document.insert(
                Value::from("energy_consumption_offsets"),
                zero_offsets(ctx, &ENERGY_OFFSET_KEYS),
            );
            tracing::info!("Added energy_consumption_offsets section");
        }
        Ok(())
    }
}

/// Version 5: collapse duplicate registry entries carrying a `_2`, `_3`, …
/// suffix that the host appends on id collisions.
struct EntityOptimizationStep;

fn duplicate_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_\d+$").unwrap())
}

#[async_trait]
impl MigrationStep for EntityOptimizationStep {
    fn target(&self) -> MigrationVersion {
        MigrationVersion::EntityOptimization
    }

    fn name(&self) -> &'static str {
        "entity_optimization"
    }

    async fn apply(
        &self,
        _document: &mut Mapping,
        registry: &mut dyn EntityRegistry,
        ctx: &MigrationContext,
    ) -> BridgeResult<()> {
        let prefix = ctx.owned_prefix();
        let re = duplicate_suffix_re();
        let mut removed = 0;
        for entity_id in registry.entity_ids() {
            if entity_id.starts_with(&prefix)
                && re.is_match(&entity_id)
                && registry.remove(&entity_id)?
            {
                tracing::info!(entity_id, "Removed duplicate entity");
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Duplicate entity cleanup complete");
        }
        Ok(())
    }
}

/// Version 6: reshape stray top-level keys into their sections and make
/// sure every required section exists. No key is dropped.
struct ConfigRestructureStep;

#[async_trait]
impl MigrationStep for ConfigRestructureStep {
    fn target(&self) -> MigrationVersion {
        MigrationVersion::ConfigRestructure
    }

    fn name(&self) -> &'static str {
        "config_restructure"
    }

    async fn apply(
        &self,
        document: &mut Mapping,
        _registry: &mut dyn EntityRegistry,
        _ctx: &MigrationContext,
    ) -> BridgeResult<()> {
        // Byte order configured at the top level in very old documents
        // belongs under modbus.
        for legacy_key in ["byte_order", "int32_byte_order"] {
            if let Some(value) = document.remove(Value::from(legacy_key)) {
                let modbus = document
                    .entry(Value::from("modbus"))
                    .or_insert_with(|| Value::Mapping(Mapping::new()));
                if let Value::Mapping(modbus) = modbus {
                    modbus.entry(Value::from(legacy_key)).or_insert(value);
                    tracing::info!(key = legacy_key, "Moved top-level key under modbus");
                }
            }
        }

        for (section, default) in [
            ("disabled_registers", Value::Sequence(Vec::new())),
            ("sensors_names_override", Value::Sequence(Vec::new())),
            ("cycling_offsets", Value::Mapping(Mapping::new())),
            ("energy_consumption_sensors", Value::Mapping(Mapping::new())),
            ("energy_consumption_offsets", Value::Mapping(Mapping::new())),
            ("modbus", Value::Mapping(Mapping::new())),
        ] {
            if section_missing(document, section) {
                document.insert(Value::from(section), default);
                tracing::info!(section, "Materialized missing section");
            }
        }
        Ok(())
    }
}

/// Version 7: rename `modbus.byte_order` to `modbus.int32_byte_order`,
/// preserving the configured value.
struct RegisterOrderStep;

#[async_trait]
impl MigrationStep for RegisterOrderStep {
    fn target(&self) -> MigrationVersion {
        MigrationVersion::RegisterOrderTerminology
    }

    fn name(&self) -> &'static str {
        "register_order_terminology"
    }

    async fn apply(
        &self,
        document: &mut Mapping,
        _registry: &mut dyn EntityRegistry,
        _ctx: &MigrationContext,
    ) -> BridgeResult<()> {
        let Some(Value::Mapping(modbus)) = document.get_mut(Value::from("modbus")) else {
            return Ok(());
        };
        if let Some(value) = modbus.remove(Value::from("byte_order")) {
            modbus
                .entry(Value::from("int32_byte_order"))
                .or_insert(value);
            tracing::info!("Renamed modbus.byte_order to modbus.int32_byte_order");
        }
        if section_missing(modbus, "int32_byte_order") {
            modbus.insert(Value::from("int32_byte_order"), Value::from("big"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::registry::InMemoryRegistry;

    fn apply(
        step: &dyn MigrationStep,
        document: &mut Mapping,
        registry: &mut InMemoryRegistry,
        ctx: &MigrationContext,
    ) {
        futures::executor::block_on(step.apply(document, registry, ctx)).unwrap();
    }

    #[test]
    fn test_catalog_order_matches_versions() {
        let steps = catalog();
        let targets: Vec<u32> = steps.iter().map(|s| s.target().as_u32()).collect();
        assert_eq!(targets, vec![2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_cycling_offsets_seeded_once() {
        let ctx = MigrationContext::default();
        let mut document = Mapping::new();
        let mut registry = InMemoryRegistry::new();

        apply(&CyclingOffsetsStep, &mut document, &mut registry, &ctx);
        let offsets = document.get(Value::from("cycling_offsets")).unwrap();
        assert_eq!(offsets["hp1"]["heating_cycling_total"], Value::from(0));

        // An existing user value is never overwritten.
        let mut existing = Mapping::new();
        existing.insert(Value::from("user"), Value::from(5));
        document.insert(Value::from("cycling_offsets"), Value::Mapping(existing));
        apply(&CyclingOffsetsStep, &mut document, &mut registry, &ctx);
        let offsets = document.get(Value::from("cycling_offsets")).unwrap();
        assert_eq!(offsets["user"], Value::from(5));
    }

    #[test]
    fn test_energy_consumption_defaults() {
        let ctx = MigrationContext::default();
        let mut document = Mapping::new();
        let mut registry = InMemoryRegistry::new();

        apply(&EnergyConsumptionStep, &mut document, &mut registry, &ctx);
        let sensors = document.get(Value::from("energy_consumption_sensors")).unwrap();
        assert_eq!(
            sensors["hp1"]["sensor_entity_id"],
            Value::from("sensor.eu08l_hp1_compressor_power_consumption_accumulated")
        );
        let offsets = document.get(Value::from("energy_consumption_offsets")).unwrap();
        assert_eq!(offsets["hp1"]["stby_energy_total"], Value::from(0));
    }

    #[test]
    fn test_entity_optimization_removes_suffixed_duplicates() {
        let ctx = MigrationContext::default();
        let mut document = Mapping::new();
        let mut registry = InMemoryRegistry::new();
        registry.insert("sensor.eu08l_hp1_cop", "uid-1");
        registry.insert("sensor.eu08l_hp1_cop_2", "uid-2");
        registry.insert("sensor.eu08l_hp1_cop_3", "uid-3");
        registry.insert("sensor.other_vendor_4", "uid-4");

        apply(&EntityOptimizationStep, &mut document, &mut registry, &ctx);
        assert!(registry.contains("sensor.eu08l_hp1_cop"));
        assert!(!registry.contains("sensor.eu08l_hp1_cop_2"));
        assert!(!registry.contains("sensor.eu08l_hp1_cop_3"));
        // Entities outside the owned prefix are never touched.
        assert!(registry.contains("sensor.other_vendor_4"));
    }

    #[test]
    fn test_legacy_names_respects_expected_set() {
        let ctx = MigrationContext {
            expected_entity_ids: vec!["sensor.eu08l_hp1_cop".to_string()],
            ..Default::default()
        };
        let mut document = Mapping::new();
        let mut registry = InMemoryRegistry::new();
        registry.insert("sensor.eu08l_hp1_cop", "uid-1");
        registry.insert("sensor.eu08l_hp1_old_style", "uid-2");
        registry.insert("sensor.unrelated", "uid-3");

        apply(&LegacyNamesStep, &mut document, &mut registry, &ctx);
        assert!(registry.contains("sensor.eu08l_hp1_cop"));
        assert!(!registry.contains("sensor.eu08l_hp1_old_style"));
        assert!(registry.contains("sensor.unrelated"));
    }

    #[test]
    fn test_restructure_moves_top_level_byte_order() {
        let ctx = MigrationContext::default();
        let mut document = Mapping::new();
        document.insert(Value::from("byte_order"), Value::from("little"));
        let mut registry = InMemoryRegistry::new();

        apply(&ConfigRestructureStep, &mut document, &mut registry, &ctx);
        assert!(!document.contains_key(Value::from("byte_order")));
        let modbus = document.get(Value::from("modbus")).unwrap();
        assert_eq!(modbus["byte_order"], Value::from("little"));
        assert!(document.contains_key(Value::from("disabled_registers")));
    }

    #[test]
    fn test_register_order_rename_preserves_value() {
        let ctx = MigrationContext::default();
        let mut modbus = Mapping::new();
        modbus.insert(Value::from("byte_order"), Value::from("little"));
        let mut document = Mapping::new();
        document.insert(Value::from("modbus"), Value::Mapping(modbus));
        let mut registry = InMemoryRegistry::new();

        apply(&RegisterOrderStep, &mut document, &mut registry, &ctx);
        let modbus = document.get(Value::from("modbus")).unwrap();
        assert_eq!(modbus["int32_byte_order"], Value::from("little"));
        assert!(modbus.get("byte_order").is_none());
    }
}
