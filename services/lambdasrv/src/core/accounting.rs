//! Energy and cycle accounting.
//!
//! Derives per-mode, per-period counters from an external cumulative power
//! sensor and the sampled operating mode. Totals are preserved across resets;
//! period values follow their period's reset discipline. State survives a
//! process restart through an injected [`PersistentStore`].

use crate::core::reset::{Period, ResetRegistry, SensorKind};
use crate::BridgeResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Deltas below this are noise from register quantization and are ignored.
const EPSILON_KWH: f64 = 0.001;

/// Operating mode of the heat pump, sampled each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Heating,
    HotWater,
    Cooling,
    Defrost,
    /// Catch-all: standby proper, circulation, and any unrecognized state.
    Standby,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::Heating,
        Mode::HotWater,
        Mode::Cooling,
        Mode::Defrost,
        Mode::Standby,
    ];

    /// Map the raw operating-state register to a mode.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Mode::Heating,
            2 => Mode::HotWater,
            3 => Mode::Cooling,
            5 => Mode::Defrost,
            // 0 = standby, 4 = circulation; everything else folds into the
            // standby catch-all rather than being dropped.
            _ => Mode::Standby,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Heating => "heating",
            Mode::HotWater => "hot_water",
            Mode::Cooling => "cooling",
            Mode::Defrost => "defrost",
            Mode::Standby => "stby",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub device: u32,
    pub mode: Mode,
    pub period: Period,
}

/// Persisted form of one energy counter.
///
/// `period_value` is optional so older snapshots that only carried totals
/// still restore; the missing field re-initializes to zero and is flagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEnergyCounter {
    pub key: CounterKey,
    pub total: f64,
    #[serde(default)]
    pub period_value: Option<f64>,
    #[serde(default)]
    pub anchor: Option<f64>,
    #[serde(default)]
    pub yesterday: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCycleCounter {
    pub key: CounterKey,
    pub total: u64,
    #[serde(default)]
    pub period_value: Option<u64>,
    #[serde(default)]
    pub anchor: Option<u64>,
    #[serde(default)]
    pub yesterday: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedDevice {
    pub device: u32,
    pub last_accumulator: Option<f64>,
    pub last_mode: Option<Mode>,
    pub prior_mode: Option<Mode>,
}

/// Full accounting snapshot, serialized as JSON by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountingState {
    pub devices: Vec<PersistedDevice>,
    pub energy: Vec<PersistedEnergyCounter>,
    pub cycles: Vec<PersistedCycleCounter>,
}

/// Durable storage for accounting state.
pub trait PersistentStore: Send + Sync {
    fn load(&self) -> BridgeResult<Option<AccountingState>>;
    fn save(&self, state: &AccountingState) -> BridgeResult<()>;
}

/// A store that keeps nothing; counters start from zero every run.
#[derive(Debug, Default)]
pub struct NullStore;

impl PersistentStore for NullStore {
    fn load(&self) -> BridgeResult<Option<AccountingState>> {
        Ok(None)
    }

    fn save(&self, _state: &AccountingState) -> BridgeResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct EnergyCounter {
    total: f64,
    period_value: f64,
    anchor: f64,
    yesterday: f64,
    restored_partial: bool,
}

#[derive(Debug, Clone, Default)]
struct CycleCounter {
    total: u64,
    period_value: u64,
    anchor: u64,
    yesterday: u64,
}

#[derive(Debug, Clone, Default)]
struct DeviceTrack {
    last_accumulator: Option<f64>,
    last_mode: Option<Mode>,
    prior_mode: Option<Mode>,
}

#[derive(Default)]
struct EngineState {
    devices: HashMap<u32, DeviceTrack>,
    energy: HashMap<CounterKey, EnergyCounter>,
    cycles: HashMap<CounterKey, CycleCounter>,
    energy_offsets: HashMap<(u32, Mode), f64>,
    cycling_offsets: HashMap<(u32, Mode), u64>,
}

/// Outcome of one observation tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    /// Delta attributed this tick, zero when below the guard.
    pub delta_kwh: f64,
    /// Whether a mode-transition cycle was counted.
    pub cycle_counted: bool,
}

/// The accounting engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AccountingEngine {
    state: Arc<Mutex<EngineState>>,
    store: Arc<dyn PersistentStore>,
}

impl AccountingEngine {
    /// Create the engine, restoring any persisted state.
    pub fn new(store: Arc<dyn PersistentStore>) -> BridgeResult<Self> {
        let mut state = EngineState::default();
        if let Some(snapshot) = store.load()? {
            restore(&mut state, snapshot);
        }
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            store,
        })
    }

    /// Additive offset applied to the exposed `Total` energy value.
    /// Offsets are fixed for the lifetime of a run.
    pub fn set_energy_offset(&self, device: u32, mode: Mode, offset_kwh: f64) {
        self.state.lock().energy_offsets.insert((device, mode), offset_kwh);
    }

    /// Additive offset applied to the exposed `Total` cycle count.
    pub fn set_cycling_offset(&self, device: u32, mode: Mode, offset: u64) {
        self.state.lock().cycling_offsets.insert((device, mode), offset);
    }

    /// Process one polling tick: the accumulator reading and the mode
    /// sampled at the same cadence.
    pub fn observe(&self, device: u32, accumulator_kwh: f64, mode: Mode) -> BridgeResult<TickOutcome> {
        let outcome = {
            let mut state = self.state.lock();
            let delta = derive_delta(&mut state, device, accumulator_kwh);
            let cycle_counted = track_cycles(&mut state, device, mode);

            let mut attributed = 0.0;
            if delta >= EPSILON_KWH {
                attributed = delta;
                apply_energy_delta(&mut state, device, mode, delta);
            }

            TickOutcome {
                delta_kwh: attributed,
                cycle_counted,
            }
        };

        if outcome.delta_kwh > 0.0 || outcome.cycle_counted {
            self.persist()?;
        }
        Ok(outcome)
    }

    /// Exposed energy value for a counter, in kWh.
    pub fn energy(&self, device: u32, mode: Mode, period: Period) -> f64 {
        let state = self.state.lock();
        let key = CounterKey { device, mode, period };
        let counter = match state.energy.get(&key) {
            Some(c) => c,
            None => return 0.0,
        };
        match period {
            Period::Total => {
                let offset = state.energy_offsets.get(&(device, mode)).copied().unwrap_or(0.0);
                counter.total + offset
            }
            p if p.anchors_total() => (counter.total - counter.anchor).max(0.0),
            _ => counter.period_value,
        }
    }

    /// Yesterday's daily energy value, captured at the midnight reset.
    pub fn energy_yesterday(&self, device: u32, mode: Mode) -> f64 {
        let key = CounterKey { device, mode, period: Period::Daily };
        self.state.lock().energy.get(&key).map_or(0.0, |c| c.yesterday)
    }

    /// Exposed cycle count for a counter.
    pub fn cycles(&self, device: u32, mode: Mode, period: Period) -> u64 {
        let state = self.state.lock();
        let key = CounterKey { device, mode, period };
        let counter = match state.cycles.get(&key) {
            Some(c) => c,
            None => return 0,
        };
        match period {
            Period::Total => {
                let offset = state.cycling_offsets.get(&(device, mode)).copied().unwrap_or(0);
                counter.total + offset
            }
            p if p.anchors_total() => counter.total.saturating_sub(counter.anchor),
            _ => counter.period_value,
        }
    }

    /// Yesterday's daily cycle count.
    pub fn cycles_yesterday(&self, device: u32, mode: Mode) -> u64 {
        let key = CounterKey { device, mode, period: Period::Daily };
        self.state.lock().cycles.get(&key).map_or(0, |c| c.yesterday)
    }

    /// Whether a restored counter came back without its period value.
    pub fn restored_partial(&self, device: u32, mode: Mode, period: Period) -> bool {
        let key = CounterKey { device, mode, period };
        self.state.lock().energy.get(&key).is_some_and(|c| c.restored_partial)
    }

    /// Apply the reset discipline for one `(kind, period)` on one device.
    pub fn reset_period(&self, device: u32, kind: SensorKind, period: Period) -> BridgeResult<()> {
        if period == Period::Total {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            for mode in Mode::ALL {
                let key = CounterKey { device, mode, period };
                match kind {
                    SensorKind::Energy => {
                        let counter = state.energy.entry(key).or_default();
                        if period.anchors_total() {
                            counter.anchor = counter.total;
                        } else {
                            if period == Period::Daily {
                                counter.yesterday = counter.period_value;
                            }
                            counter.period_value = 0.0;
                        }
                    }
                    SensorKind::Cycling => {
                        let counter = state.cycles.entry(key).or_default();
                        if period.anchors_total() {
                            counter.anchor = counter.total;
                        } else {
                            if period == Period::Daily {
                                counter.yesterday = counter.period_value;
                            }
                            counter.period_value = 0;
                        }
                    }
                }
            }
        }
        tracing::info!(device, %kind, %period, "Counters reset");
        self.persist()
    }

    /// Register this engine's reset callbacks for a device on the registry.
    pub fn attach(&self, registry: &ResetRegistry, device: u32) {
        for kind in SensorKind::ALL {
            for period in Period::RESETTABLE {
                let engine = self.clone();
                registry.register(
                    kind,
                    device,
                    period,
                    Arc::new(move || engine.reset_period(device, kind, period)),
                );
            }
        }
    }

    /// Snapshot the full state for persistence.
    pub fn snapshot(&self) -> AccountingState {
        let state = self.state.lock();
        AccountingState {
            devices: state
                .devices
                .iter()
                .map(|(device, track)| PersistedDevice {
                    device: *device,
                    last_accumulator: track.last_accumulator,
                    last_mode: track.last_mode,
                    prior_mode: track.prior_mode,
                })
                .collect(),
            energy: state
                .energy
                .iter()
                .map(|(key, c)| PersistedEnergyCounter {
                    key: *key,
                    total: c.total,
                    period_value: Some(c.period_value),
                    anchor: Some(c.anchor),
                    yesterday: Some(c.yesterday),
                })
                .collect(),
            cycles: state
                .cycles
                .iter()
                .map(|(key, c)| PersistedCycleCounter {
                    key: *key,
                    total: c.total,
                    period_value: Some(c.period_value),
                    anchor: Some(c.anchor),
                    yesterday: Some(c.yesterday),
                })
                .collect(),
        }
    }

    fn persist(&self) -> BridgeResult<()> {
        self.store.save(&self.snapshot())
    }
}

/// Delta between consecutive accumulator observations.
///
/// A reading of exactly zero means the source restarted; the baseline is
/// dropped so the next reading seeds fresh. A backwards jump reseeds the
/// baseline at the new value and contributes nothing. Sub-epsilon deltas
/// leave the baseline in place so trickle consumption is not lost.
fn derive_delta(state: &mut EngineState, device: u32, accumulator: f64) -> f64 {
    let track = state.devices.entry(device).or_default();

    if accumulator == 0.0 {
        track.last_accumulator = None;
        return 0.0;
    }

    match track.last_accumulator {
        None => {
            track.last_accumulator = Some(accumulator);
            0.0
        }
        Some(previous) => {
            let delta = accumulator - previous;
            if delta < 0.0 {
                tracing::warn!(
                    device,
                    previous,
                    current = accumulator,
                    "Accumulator moved backwards, reseeding baseline"
                );
                track.last_accumulator = Some(accumulator);
                0.0
            } else if delta < EPSILON_KWH {
                0.0
            } else {
                track.last_accumulator = Some(accumulator);
                delta
            }
        }
    }
}

/// Edge-triggered cycle detection with a one-tick debounce: a transition
/// into a mode counts only if the device was not in that mode one tick
/// earlier, so a single-tick flap does not double-count.
fn track_cycles(state: &mut EngineState, device: u32, mode: Mode) -> bool {
    let track = state.devices.entry(device).or_default();
    let last = track.last_mode;
    let prior = track.prior_mode;
    track.prior_mode = last;
    track.last_mode = Some(mode);

    let is_edge = match last {
        None => false,
        Some(previous) => previous != mode && prior != Some(mode),
    };
    if !is_edge {
        return false;
    }

    for period in [
        Period::TwoHourly,
        Period::FourHourly,
        Period::Daily,
        Period::Monthly,
        Period::Yearly,
        Period::Total,
    ] {
        let key = CounterKey { device, mode, period };
        let counter = state.cycles.entry(key).or_default();
        counter.total += 1;
        if !period.anchors_total() && period != Period::Total {
            counter.period_value += 1;
        }
    }
    tracing::debug!(device, %mode, "Mode cycle counted");
    true
}

fn apply_energy_delta(state: &mut EngineState, device: u32, mode: Mode, delta: f64) {
    let mut old_total = 0.0;
    for period in [
        Period::TwoHourly,
        Period::FourHourly,
        Period::Daily,
        Period::Monthly,
        Period::Yearly,
        Period::Total,
    ] {
        let key = CounterKey { device, mode, period };
        let counter = state.energy.entry(key).or_default();
        if period == Period::Total {
            old_total = counter.total;
        }
        counter.total += delta;
        if !period.anchors_total() && period != Period::Total {
            counter.period_value += delta;
        }
    }
    tracing::info!(
        device,
        %mode,
        delta_kwh = delta,
        old_total_kwh = old_total,
        new_total_kwh = old_total + delta,
        "Energy attributed"
    );
}

fn restore(state: &mut EngineState, snapshot: AccountingState) {
    for device in snapshot.devices {
        state.devices.insert(
            device.device,
            DeviceTrack {
                last_accumulator: device.last_accumulator,
                last_mode: device.last_mode,
                prior_mode: device.prior_mode,
            },
        );
    }
    for entry in snapshot.energy {
        let restored_partial = entry.period_value.is_none();
        if restored_partial {
            tracing::warn!(
                device = entry.key.device,
                mode = %entry.key.mode,
                period = %entry.key.period,
                "Restored total without period value, re-initializing to zero"
            );
        }
        state.energy.insert(
            entry.key,
            EnergyCounter {
                total: entry.total,
                period_value: entry.period_value.unwrap_or(0.0),
                anchor: entry.anchor.unwrap_or(0.0),
                yesterday: entry.yesterday.unwrap_or(0.0),
                restored_partial,
            },
        );
    }
    for entry in snapshot.cycles {
        state.cycles.insert(
            entry.key,
            CycleCounter {
                total: entry.total,
                period_value: entry.period_value.unwrap_or(0),
                anchor: entry.anchor.unwrap_or(0),
                yesterday: entry.yesterday.unwrap_or(0),
            },
        );
    }
}
