//! Injectable clock abstraction.
//!
//! The core components never read the system time directly; they take a
//! [`Clock`] so cooldowns and period boundaries are testable without sleeping.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic instant, used for cooldowns and elapsed-time checks.
    fn now(&self) -> Instant;

    /// Local wall-clock time, used for period boundaries and timestamps.
    fn wall(&self) -> DateTime<Local>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A manually advanced clock for tests.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

struct ManualState {
    base: Instant,
    offset: Duration,
    wall: DateTime<Local>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                base: Instant::now(),
                offset: Duration::ZERO,
                wall: Local::now(),
            })),
        }
    }

    /// Advance both monotonic and wall time.
    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock();
        state.offset += by;
        state.wall += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    /// Pin the wall clock to a specific time.
    pub fn set_wall(&self, wall: DateTime<Local>) {
        self.inner.lock().wall = wall;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.base + state.offset
    }

    fn wall(&self) -> DateTime<Local> {
        self.inner.lock().wall
    }
}
