//! Reset dispatch registry.
//!
//! Maps `(sensor kind, device instance, period)` to a callback and fans out
//! periodic reset events. The registry is an explicit service handed to its
//! users at construction, not a global.

use crate::BridgeResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What family of counters a callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Energy,
    Cycling,
}

impl SensorKind {
    pub const ALL: [SensorKind; 2] = [SensorKind::Energy, SensorKind::Cycling];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Energy => "energy",
            SensorKind::Cycling => "cycling",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reset cadence of a counter. `Total` counters never reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    #[serde(rename = "2h")]
    TwoHourly,
    #[serde(rename = "4h")]
    FourHourly,
    Daily,
    Monthly,
    Yearly,
    Total,
}

impl Period {
    /// Periods that receive reset events.
    pub const RESETTABLE: [Period; 5] = [
        Period::TwoHourly,
        Period::FourHourly,
        Period::Daily,
        Period::Monthly,
        Period::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::TwoHourly => "2h",
            Period::FourHourly => "4h",
            Period::Daily => "daily",
            Period::Monthly => "monthly",
            Period::Yearly => "yearly",
            Period::Total => "total",
        }
    }

    /// Whether the period anchors against the running total instead of
    /// keeping its own accumulated value.
    pub fn anchors_total(&self) -> bool {
        matches!(self, Period::Monthly | Period::Yearly)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable dispatcher signal name for a `(kind, period)` pair.
///
/// External subscribers rely on this exact form.
pub fn signal_name(kind: SensorKind, period: Period) -> String {
    format!("reset_{}_{}", period.as_str(), kind.as_str())
}

/// Outbound dispatcher interop: reset events are mirrored onto the host
/// bus under their stable [`signal_name`].
pub trait SignalBus: Send + Sync {
    fn emit(&self, signal: &str);
}

/// Bus that only logs; the default when no host dispatcher is attached.
#[derive(Debug, Default)]
pub struct LogSignalBus;

impl SignalBus for LogSignalBus {
    fn emit(&self, signal: &str) {
        tracing::debug!(signal, "Signal emitted");
    }
}

/// Callback invoked on a reset event. Errors are logged and do not halt
/// the fan-out.
pub type ResetCallback = Arc<dyn Fn() -> BridgeResult<()> + Send + Sync>;

type Key = (SensorKind, u32, Period);

/// Process-wide reset dispatch registry.
#[derive(Clone, Default)]
pub struct ResetRegistry {
    callbacks: Arc<Mutex<HashMap<Key, ResetCallback>>>,
}

impl ResetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; replaces any prior binding for the same triple.
    pub fn register(&self, kind: SensorKind, instance: u32, period: Period, callback: ResetCallback) {
        self.callbacks.lock().insert((kind, instance, period), callback);
        tracing::debug!(%kind, instance, %period, "Registered reset callback");
    }

    /// Remove one binding, or every period for the instance when `period`
    /// is `None`.
    pub fn unregister(&self, kind: SensorKind, instance: u32, period: Option<Period>) {
        let mut callbacks = self.callbacks.lock();
        match period {
            Some(p) => {
                callbacks.remove(&(kind, instance, p));
            }
            None => {
                callbacks.retain(|(k, i, _), _| !(*k == kind && *i == instance));
            }
        }
    }

    /// Fire every callback matching `(kind, period)`, optionally narrowed to
    /// one instance. Returns the number of callbacks invoked.
    pub fn send(&self, kind: SensorKind, period: Period, instance: Option<u32>) -> usize {
        // Snapshot under the lock, invoke outside it; registrations during
        // a fan-out take effect on the next event.
        let matching: Vec<(Key, ResetCallback)> = self
            .callbacks
            .lock()
            .iter()
            .filter(|((k, i, p), _)| {
                *k == kind && *p == period && instance.map_or(true, |want| *i == want)
            })
            .map(|(key, cb)| (*key, Arc::clone(cb)))
            .collect();

        let mut invoked = 0;
        for ((k, i, p), callback) in matching {
            if let Err(e) = callback() {
                tracing::error!(kind = %k, instance = i, period = %p, error = %e,
                    "Reset callback failed");
            }
            invoked += 1;
        }
        if invoked > 0 {
            tracing::debug!(%kind, %period, invoked, "Reset fan-out complete");
        }
        invoked
    }

    /// Fan a reset event out across all sensor kinds.
    pub fn send_all(&self, period: Period) -> usize {
        SensorKind::ALL
            .iter()
            .map(|kind| self.send(*kind, period, None))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> ResetCallback {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(
            signal_name(SensorKind::Energy, Period::Daily),
            "reset_daily_energy"
        );
        assert_eq!(
            signal_name(SensorKind::Cycling, Period::TwoHourly),
            "reset_2h_cycling"
        );
        assert_eq!(
            signal_name(SensorKind::Energy, Period::Monthly),
            "reset_monthly_energy"
        );
    }

    #[test]
    fn test_send_invokes_matching_callbacks_once() {
        let registry = ResetRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(SensorKind::Energy, 0, Period::Daily, counting_callback(hits.clone()));
        registry.register(SensorKind::Energy, 1, Period::Daily, counting_callback(hits.clone()));
        registry.register(SensorKind::Energy, 0, Period::Monthly, counting_callback(hits.clone()));
        registry.register(SensorKind::Cycling, 0, Period::Daily, counting_callback(hits.clone()));

        let invoked = registry.send(SensorKind::Energy, Period::Daily, None);
        assert_eq!(invoked, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_send_narrowed_to_instance() {
        let registry = ResetRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(SensorKind::Energy, 0, Period::Daily, counting_callback(hits.clone()));
        registry.register(SensorKind::Energy, 1, Period::Daily, counting_callback(hits.clone()));

        assert_eq!(registry.send(SensorKind::Energy, Period::Daily, Some(1)), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_is_idempotent_replace() {
        let registry = ResetRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.register(SensorKind::Energy, 0, Period::Daily, counting_callback(first.clone()));
        registry.register(SensorKind::Energy, 0, Period::Daily, counting_callback(second.clone()));

        registry.send(SensorKind::Energy, Period::Daily, None);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_all_periods() {
        let registry = ResetRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for period in Period::RESETTABLE {
            registry.register(SensorKind::Cycling, 2, period, counting_callback(hits.clone()));
        }
        assert_eq!(registry.len(), 5);

        registry.unregister(SensorKind::Cycling, 2, None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_callback_error_does_not_halt_fanout() {
        let registry = ResetRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(
            SensorKind::Energy,
            0,
            Period::Daily,
            Arc::new(|| Err(crate::BridgeError::Internal("boom".into()))),
        );
        registry.register(SensorKind::Energy, 1, Period::Daily, counting_callback(hits.clone()));

        let invoked = registry.send(SensorKind::Energy, Period::Daily, None);
        assert_eq!(invoked, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_all_spans_kinds() {
        let registry = ResetRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(SensorKind::Energy, 0, Period::Yearly, counting_callback(hits.clone()));
        registry.register(SensorKind::Cycling, 0, Period::Yearly, counting_callback(hits.clone()));

        assert_eq!(registry.send_all(Period::Yearly), 2);
    }
}
