//! lambdasrv - Lambda heat-pump Modbus/TCP bridge service

use anyhow::Context;
use clap::Parser;
use common::SystemClock;
use lambdasrv::config::store::ConfigStore;
use lambdasrv::config::ServiceSettings;
use lambdasrv::core::accounting::AccountingEngine;
use lambdasrv::core::breaker::BreakerConfig;
use lambdasrv::core::codec::ByteOrder;
use lambdasrv::core::reset::ResetRegistry;
use lambdasrv::core::scheduler::ResetScheduler;
use lambdasrv::core::status::StatusSurface;
use lambdasrv::migration::backup::BackupManager;
use lambdasrv::migration::engine::MigrationEngine;
use lambdasrv::migration::registry::InMemoryRegistry;
use lambdasrv::migration::steps::MigrationContext;
use lambdasrv::migration::version::MigrationVersion;
use lambdasrv::protocols::{GuardedClient, TcpTransport};
use lambdasrv::runtime::{JsonFileStore, Poller, RegisterMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lambdasrv", about = "Lambda heat-pump Modbus/TCP bridge", version)]
struct Args {
    /// Service settings file (YAML)
    #[arg(short, long, env = "LAMBDASRV_CONFIG")]
    config: Option<PathBuf>,

    /// Run pending configuration migrations and exit
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = ServiceSettings::load(args.config.as_deref())
        .context("Failed to load service settings")?;

    let _log_guard = common::init_logging(&settings.log_config())
        .context("Failed to initialize logging")?;
    info!("Starting lambdasrv");

    let store = ConfigStore::new(&settings.paths.config_file);
    store
        .ensure_initialized(MigrationVersion::latest().as_u32())
        .await
        .context("Failed to initialize configuration document")?;

    let status = StatusSurface::new();
    let migration_engine = MigrationEngine::new(
        store.clone(),
        BackupManager::new(&settings.paths.backup_dir),
        status.clone(),
        MigrationContext::default(),
    );
    let mut entity_registry = InMemoryRegistry::new();
    let audit = migration_engine
        .migrate_to(&mut entity_registry, MigrationVersion::latest())
        .await
        .context("Configuration migration failed")?;
    if !audit.steps.is_empty() {
        info!(
            from = audit.from_version,
            to = audit.to_version,
            steps = audit.steps.len(),
            "Configuration migrated"
        );
    }
    if args.migrate_only {
        info!("Migration-only run complete");
        return Ok(());
    }

    let bridge_config = store
        .typed()
        .await
        .context("Configuration document failed validation")?;
    // Resolved once per connection bind.
    let byte_order = ByteOrder::from_config(&bridge_config.modbus.int32_byte_order);

    let clock = Arc::new(SystemClock);
    let transport = TcpTransport::new(
        &settings.modbus.host,
        settings.modbus.port,
        settings.modbus.unit_id,
    );
    let client = Arc::new(GuardedClient::new(
        Box::new(transport),
        BreakerConfig {
            failure_threshold: settings.breaker.failure_threshold,
            recovery_timeout: Duration::from_secs(settings.breaker.recovery_timeout_secs),
        },
        clock.clone(),
        status.clone(),
        Duration::from_secs(settings.modbus.timeout_secs),
        byte_order,
    ));

    let accounting = AccountingEngine::new(Arc::new(JsonFileStore::new(
        &settings.paths.state_file,
    )))
    .context("Failed to restore accounting state")?;

    let devices: Vec<u32> = (0..bridge_config.energy_consumption_sensors.len().max(1) as u32).collect();
    for (device_key, offsets) in &bridge_config.energy_consumption_offsets {
        if let Some(device) = parse_device_index(device_key) {
            for (counter_key, offset) in offsets {
                if let Some(mode) = mode_from_counter_key(counter_key) {
                    accounting.set_energy_offset(device, mode, *offset);
                }
            }
        }
    }
    for (device_key, offsets) in &bridge_config.cycling_offsets {
        if let Some(device) = parse_device_index(device_key) {
            for (counter_key, offset) in offsets {
                if let Some(mode) = mode_from_counter_key(counter_key) {
                    accounting.set_cycling_offset(device, mode, *offset);
                }
            }
        }
    }

    let registry = ResetRegistry::new();
    for device in &devices {
        accounting.attach(&registry, *device);
    }

    let scheduler = ResetScheduler::new(registry, clock);
    let scheduler_handle = tokio::spawn(scheduler.run());

    let poller = Poller::new(
        client,
        accounting,
        bridge_config,
        RegisterMap::default(),
        devices,
        Duration::from_secs(settings.modbus.poll_interval_secs),
    );
    let poller_handle = tokio::spawn(poller.run());

    info!("lambdasrv running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    scheduler_handle.abort();
    poller_handle.abort();
    Ok(())
}

/// `hp1` -> device index 0.
fn parse_device_index(device_key: &str) -> Option<u32> {
    device_key
        .strip_prefix("hp")
        .and_then(|n| n.parse::<u32>().ok())
        .map(|n| n.saturating_sub(1))
}

/// `heating_energy_total` / `heating_cycling_total` -> `Mode::Heating`.
fn mode_from_counter_key(key: &str) -> Option<lambdasrv::core::accounting::Mode> {
    use lambdasrv::core::accounting::Mode;
    let mode = key
        .strip_suffix("_energy_total")
        .or_else(|| key.strip_suffix("_cycling_total"))?;
    match mode {
        "heating" => Some(Mode::Heating),
        "hot_water" => Some(Mode::HotWater),
        "cooling" => Some(Mode::Cooling),
        "defrost" => Some(Mode::Defrost),
        "stby" => Some(Mode::Standby),
        _ => None,
    }
}
