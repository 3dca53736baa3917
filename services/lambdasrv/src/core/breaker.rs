//! Circuit breaker guarding the Modbus connection.
//!
//! Failure handling is asymmetric on purpose: network faults open the breaker
//! immediately so the polling loop backs off and recovers fast, while protocol
//! exceptions mean the device is confused and further traffic makes it worse,
//! so those force the breaker open until an operator resets it or a call
//! succeeds after a manual reset.

use crate::FailureKind;
use chrono::{DateTime, Local};
use common::Clock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sentinel failure count recorded for protocol-class failures.
const FORCED_FAILURE_COUNT: u32 = 999;

/// Breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive "other" failures before the breaker opens.
    pub failure_threshold: u32,
    /// Cooldown before an open breaker permits another attempt.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Read-only view of the breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub is_open: bool,
    pub force_open: bool,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Local>>,
    pub state: &'static str,
    pub failure_threshold: u32,
    pub recovery_timeout: u64,
}

/// Per-connection circuit breaker.
///
/// Owned by its connection and mutated only through `can_execute`,
/// `record_success`, `record_failure` and `reset`; none of these can fail.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<DateTime<Local>>,
    open: bool,
    forced: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            failure_count: 0,
            last_failure: None,
            last_failure_wall: None,
            open: false,
            forced: false,
        }
    }

    /// Whether an outbound call may proceed.
    ///
    /// An open breaker auto-closes once the recovery timeout has elapsed,
    /// unless a protocol failure forced it open.
    pub fn can_execute(&mut self) -> bool {
        if !self.open {
            return true;
        }
        if self.forced {
            return false;
        }
        if let Some(last) = self.last_failure {
            if self.clock.now().duration_since(last) > self.config.recovery_timeout {
                tracing::info!("Circuit breaker recovery timeout elapsed, closing");
                self.open = false;
                self.failure_count = 0;
                return true;
            }
        }
        false
    }

    /// Record a successful call; unconditionally closes the breaker.
    pub fn record_success(&mut self) {
        if self.open || self.failure_count > 0 {
            tracing::info!("Circuit breaker closed after successful call");
        }
        self.failure_count = 0;
        self.open = false;
        self.forced = false;
    }

    /// Record a failed call, classified by [`FailureKind`].
    pub fn record_failure(&mut self, kind: FailureKind) {
        self.last_failure = Some(self.clock.now());
        self.last_failure_wall = Some(self.clock.wall());

        match kind {
            FailureKind::Network => {
                // Fail fast: one network fault is enough to stop hammering
                // an unreachable device.
                self.failure_count = 1;
                self.open = true;
                tracing::warn!("Network failure, circuit breaker opened");
            }
            FailureKind::Protocol => {
                self.failure_count = FORCED_FAILURE_COUNT;
                self.open = true;
                self.forced = true;
                tracing::error!("Protocol exception, circuit breaker forced open");
            }
            FailureKind::Other => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.open = true;
                    tracing::warn!(
                        failures = self.failure_count,
                        "Failure threshold reached, circuit breaker opened"
                    );
                }
            }
        }
    }

    /// Manual return to the closed state.
    pub fn reset(&mut self) {
        tracing::info!("Circuit breaker manually reset");
        self.failure_count = 0;
        self.last_failure = None;
        self.last_failure_wall = None;
        self.open = false;
        self.forced = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            is_open: self.open,
            force_open: self.forced,
            failure_count: self.failure_count,
            last_failure_time: self.last_failure_wall,
            state: if self.open { "open" } else { "closed" },
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout.as_secs(),
        }
    }
}
