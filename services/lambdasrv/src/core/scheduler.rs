//! Scheduler adapter firing period reset events on wall-clock boundaries.
//!
//! Boundary detection is bucket-based: each period maps the current wall
//! time to a bucket id, and a tick that lands in a new bucket fires exactly
//! one reset for that period. A missed tick therefore produces a one-cycle
//! gap, never a double reset.

use crate::core::reset::{signal_name, Period, ResetRegistry, SensorKind, SignalBus};
use chrono::{DateTime, Datelike, Local, Timelike};
use common::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Bucket ids for every resettable period at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Buckets {
    two_hourly: (i32, u32, u32, u32),
    four_hourly: (i32, u32, u32, u32),
    daily: (i32, u32, u32),
    monthly: (i32, u32),
    yearly: i32,
}

impl Buckets {
    fn at(now: DateTime<Local>) -> Self {
        let date = (now.year(), now.month(), now.day());
        Self {
            two_hourly: (date.0, date.1, date.2, now.hour() / 2),
            four_hourly: (date.0, date.1, date.2, now.hour() / 4),
            daily: date,
            monthly: (now.year(), now.month()),
            yearly: now.year(),
        }
    }
}

/// Drives the reset registry from the wall clock.
pub struct ResetScheduler {
    registry: ResetRegistry,
    clock: Arc<dyn Clock>,
    bus: Option<Arc<dyn SignalBus>>,
    last: Option<Buckets>,
}

impl ResetScheduler {
    pub fn new(registry: ResetRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            bus: None,
            last: None,
        }
    }

    /// Mirror fired resets onto a host dispatcher bus.
    pub fn with_bus(mut self, bus: Arc<dyn SignalBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Check the wall clock and fire resets for every period whose bucket
    /// changed since the previous tick. Returns the periods fired.
    ///
    /// The first tick only seeds the buckets.
    pub fn tick(&mut self) -> Vec<Period> {
        let now = self.clock.wall();
        let current = Buckets::at(now);
        let fired = match self.last {
            None => Vec::new(),
            Some(last) => {
                let mut fired = Vec::new();
                if current.two_hourly != last.two_hourly {
                    fired.push(Period::TwoHourly);
                }
                if current.four_hourly != last.four_hourly {
                    fired.push(Period::FourHourly);
                }
                if current.daily != last.daily {
                    fired.push(Period::Daily);
                }
                if current.monthly != last.monthly {
                    fired.push(Period::Monthly);
                }
                if current.yearly != last.yearly {
                    fired.push(Period::Yearly);
                }
                fired
            }
        };
        self.last = Some(current);

        for period in &fired {
            let invoked = self.registry.send_all(*period);
            tracing::info!(period = %period, invoked, "Period boundary reset fired");
            if let Some(bus) = &self.bus {
                for kind in SensorKind::ALL {
                    bus.emit(&signal_name(kind, *period));
                }
            }
        }
        fired
    }

    /// Run the scheduler loop, checking the clock once a minute.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::ManualClock;

    fn scheduler_at(clock: &ManualClock, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> ResetScheduler {
        clock.set_wall(Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap());
        ResetScheduler::new(ResetRegistry::new(), Arc::new(clock.clone()))
    }

    #[test]
    fn test_first_tick_seeds_without_firing() {
        let clock = ManualClock::new();
        let mut sched = scheduler_at(&clock, 2026, 6, 15, 10, 30);
        assert!(sched.tick().is_empty());
    }

    #[test]
    fn test_two_hour_boundary() {
        let clock = ManualClock::new();
        let mut sched = scheduler_at(&clock, 2026, 6, 15, 11, 59);
        sched.tick();

        clock.set_wall(Local.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap());
        let fired = sched.tick();
        assert!(fired.contains(&Period::TwoHourly));
        assert!(fired.contains(&Period::FourHourly));
        assert!(!fired.contains(&Period::Daily));
    }

    #[test]
    fn test_midnight_fires_daily_and_hourlies() {
        let clock = ManualClock::new();
        let mut sched = scheduler_at(&clock, 2026, 6, 15, 23, 59);
        sched.tick();

        clock.set_wall(Local.with_ymd_and_hms(2026, 6, 16, 0, 0, 0).unwrap());
        let fired = sched.tick();
        assert!(fired.contains(&Period::Daily));
        assert!(fired.contains(&Period::TwoHourly));
        assert!(fired.contains(&Period::FourHourly));
        assert!(!fired.contains(&Period::Monthly));
    }

    #[test]
    fn test_new_year_fires_everything() {
        let clock = ManualClock::new();
        let mut sched = scheduler_at(&clock, 2026, 12, 31, 23, 59);
        sched.tick();

        clock.set_wall(Local.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
        let fired = sched.tick();
        assert_eq!(fired.len(), 5);
        assert!(fired.contains(&Period::Monthly));
        assert!(fired.contains(&Period::Yearly));
    }

    #[test]
    fn test_missed_ticks_fire_once_not_per_boundary() {
        let clock = ManualClock::new();
        let mut sched = scheduler_at(&clock, 2026, 6, 15, 1, 0);
        sched.tick();

        // Scheduler was silent for eight hours; four 2h boundaries passed
        // but the period fires once.
        clock.set_wall(Local.with_ymd_and_hms(2026, 6, 15, 9, 0, 0).unwrap());
        let fired = sched.tick();
        assert_eq!(
            fired.iter().filter(|p| **p == Period::TwoHourly).count(),
            1
        );
    }

    #[test]
    fn test_no_fire_within_same_bucket() {
        let clock = ManualClock::new();
        let mut sched = scheduler_at(&clock, 2026, 6, 15, 10, 0);
        sched.tick();

        clock.set_wall(Local.with_ymd_and_hms(2026, 6, 15, 11, 59, 0).unwrap());
        assert!(sched.tick().is_empty());
    }
}
