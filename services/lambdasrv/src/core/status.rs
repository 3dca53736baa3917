//! Status and telemetry surface.
//!
//! Read-only views over the breaker state and the migration audit trail.

use crate::core::breaker::BreakerSnapshot;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Outcome of a single migration step.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// Version the step migrated to.
    pub version: u32,
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub backup_paths: Vec<String>,
    /// Error kind tag when the step failed.
    pub error_kind: Option<String>,
}

/// Audit trail of the most recent migration run.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MigrationAudit {
    pub from_version: u32,
    pub to_version: u32,
    pub steps: Vec<StepOutcome>,
}

impl MigrationAudit {
    /// Error kind of the last failed step, if any.
    pub fn last_error_kind(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|s| !s.success)
            .and_then(|s| s.error_kind.as_deref())
    }
}

/// Shared status surface; cheap to clone.
#[derive(Clone, Default)]
pub struct StatusSurface {
    breaker: Arc<Mutex<Option<BreakerSnapshot>>>,
    audit: Arc<Mutex<MigrationAudit>>,
}

impl StatusSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_breaker(&self, snapshot: BreakerSnapshot) {
        *self.breaker.lock() = Some(snapshot);
    }

    pub fn breaker(&self) -> Option<BreakerSnapshot> {
        self.breaker.lock().clone()
    }

    /// Binary connectivity view: on when the breaker is closed.
    ///
    /// A connection with no snapshot yet reports off.
    pub fn connectivity_on(&self) -> bool {
        self.breaker.lock().as_ref().is_some_and(|s| !s.is_open)
    }

    pub fn record_migration(&self, audit: MigrationAudit) {
        *self.audit.lock() = audit;
    }

    pub fn migration_audit(&self) -> MigrationAudit {
        self.audit.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breaker::{BreakerConfig, CircuitBreaker};
    use crate::FailureKind;
    use common::SystemClock;

    #[test]
    fn test_connectivity_tracks_breaker() {
        let surface = StatusSurface::new();
        assert!(!surface.connectivity_on());

        let mut breaker = CircuitBreaker::new(BreakerConfig::default(), Arc::new(SystemClock));
        surface.update_breaker(breaker.snapshot());
        assert!(surface.connectivity_on());

        breaker.record_failure(FailureKind::Network);
        surface.update_breaker(breaker.snapshot());
        assert!(!surface.connectivity_on());
    }

    #[test]
    fn test_audit_last_error_kind() {
        let surface = StatusSurface::new();
        surface.record_migration(MigrationAudit {
            from_version: 2,
            to_version: 4,
            steps: vec![
                StepOutcome {
                    version: 3,
                    name: "cycling_offsets".into(),
                    success: true,
                    duration_ms: 12,
                    backup_paths: vec!["/tmp/a.bak".into()],
                    error_kind: None,
                },
                StepOutcome {
                    version: 4,
                    name: "energy_consumption".into(),
                    success: false,
                    duration_ms: 5,
                    backup_paths: vec![],
                    error_kind: Some("MIGRATION_FAILED".into()),
                },
            ],
        });

        let audit = surface.migration_audit();
        assert_eq!(audit.last_error_kind(), Some("MIGRATION_FAILED"));
        assert_eq!(audit.steps.len(), 2);
    }
}
