//! End-to-end flows across accounting, scheduling and the guarded client.

use async_trait::async_trait;
use chrono::{Local, TimeZone};
use common::ManualClock;
use lambdasrv::core::accounting::{AccountingEngine, Mode, NullStore};
use lambdasrv::core::breaker::BreakerConfig;
use lambdasrv::core::codec::ByteOrder;
use lambdasrv::core::reset::{Period, ResetRegistry};
use lambdasrv::core::scheduler::ResetScheduler;
use lambdasrv::core::status::StatusSurface;
use lambdasrv::protocols::{GuardedClient, ModbusTransport};
use lambdasrv::runtime::JsonFileStore;
use lambdasrv::{BridgeError, BridgeResult};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn wall(clock: &ManualClock, y: i32, mo: u32, d: u32, h: u32, mi: u32) {
    clock.set_wall(Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap());
}

#[test]
fn midnight_crossing_resets_daily_counters() {
    let clock = ManualClock::new();
    wall(&clock, 2026, 3, 10, 23, 50);

    let engine = AccountingEngine::new(Arc::new(NullStore)).unwrap();
    let registry = ResetRegistry::new();
    engine.attach(&registry, 0);
    let mut scheduler = ResetScheduler::new(registry, Arc::new(clock.clone()));
    scheduler.tick();

    engine.observe(0, 100.0, Mode::Heating).unwrap();
    engine.observe(0, 101.5, Mode::Heating).unwrap();
    assert!((engine.energy(0, Mode::Heating, Period::Daily) - 1.5).abs() < 1e-9);

    wall(&clock, 2026, 3, 11, 0, 0);
    let fired = scheduler.tick();
    assert!(fired.contains(&Period::Daily));

    assert_eq!(engine.energy(0, Mode::Heating, Period::Daily), 0.0);
    assert!((engine.energy_yesterday(0, Mode::Heating) - 1.5).abs() < 1e-9);
    assert!((engine.energy(0, Mode::Heating, Period::Total) - 1.5).abs() < 1e-9);

    // Consumption after the reset lands in the fresh day.
    engine.observe(0, 102.0, Mode::Heating).unwrap();
    assert!((engine.energy(0, Mode::Heating, Period::Daily) - 0.5).abs() < 1e-9);
}

#[test]
fn month_boundary_anchors_monthly_counters() {
    let clock = ManualClock::new();
    wall(&clock, 2026, 5, 31, 23, 55);

    let engine = AccountingEngine::new(Arc::new(NullStore)).unwrap();
    let registry = ResetRegistry::new();
    engine.attach(&registry, 0);
    let mut scheduler = ResetScheduler::new(registry, Arc::new(clock.clone()));
    scheduler.tick();

    engine.observe(0, 0.5, Mode::Heating).unwrap();
    engine.observe(0, 1000.5, Mode::Heating).unwrap();
    assert!((engine.energy(0, Mode::Heating, Period::Monthly) - 1000.0).abs() < 1e-9);

    wall(&clock, 2026, 6, 1, 0, 0);
    let fired = scheduler.tick();
    assert!(fired.contains(&Period::Monthly));
    assert_eq!(engine.energy(0, Mode::Heating, Period::Monthly), 0.0);

    engine.observe(0, 1025.5, Mode::Heating).unwrap();
    assert!((engine.energy(0, Mode::Heating, Period::Monthly) - 25.0).abs() < 1e-9);
    assert!((engine.energy(0, Mode::Heating, Period::Total) - 1025.0).abs() < 1e-9);
}

#[test]
fn counters_survive_restart_through_file_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");

    {
        let engine = AccountingEngine::new(Arc::new(JsonFileStore::new(&path))).unwrap();
        engine.observe(0, 10.0, Mode::HotWater).unwrap();
        engine.observe(0, 12.5, Mode::HotWater).unwrap();
        engine.observe(0, 12.5, Mode::Heating).unwrap();
    }

    let engine = AccountingEngine::new(Arc::new(JsonFileStore::new(&path))).unwrap();
    assert!((engine.energy(0, Mode::HotWater, Period::Total) - 2.5).abs() < 1e-9);
    assert_eq!(engine.cycles(0, Mode::Heating, Period::Total), 1);
}

/// Transport that fails until told to recover.
struct FlakyTransport {
    healthy: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl ModbusTransport for FlakyTransport {
    async fn read_holding_registers(&mut self, _address: u16, count: u16) -> BridgeResult<Vec<u16>> {
        if self.healthy.load(std::sync::atomic::Ordering::SeqCst) {
            Ok(vec![0x0001; count as usize])
        } else {
            Err(BridgeError::network("connection refused"))
        }
    }

    async fn write_register(&mut self, _address: u16, _value: u16) -> BridgeResult<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_drives_the_connectivity_surface() {
    let clock = ManualClock::new();
    let status = StatusSurface::new();
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let client = GuardedClient::new(
        Box::new(FlakyTransport {
            healthy: healthy.clone(),
        }),
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        },
        Arc::new(clock.clone()),
        status.clone(),
        Duration::from_secs(1),
        ByteOrder::Big,
    );
    assert!(status.connectivity_on());

    assert!(client.read_registers(1003, 1).await.is_err());
    assert!(!status.connectivity_on());
    let snapshot = status.breaker().unwrap();
    assert!(snapshot.is_open);
    assert_eq!(snapshot.state, "open");
    assert_eq!(snapshot.failure_count, 1);

    // Device comes back; after the cooldown one good read closes the gate.
    healthy.store(true, std::sync::atomic::Ordering::SeqCst);
    clock.advance(Duration::from_secs(31));
    let words = client.read_registers(1003, 1).await.unwrap();
    assert_eq!(words, vec![1]);
    assert!(status.connectivity_on());
    assert_eq!(status.breaker().unwrap().failure_count, 0);
}
