//! Totally ordered migration version tags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema versions of the configuration document, in application order.
///
/// A document's stored version tells the engine which steps are pending:
/// every tag in `(current, latest]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MigrationVersion {
    Initial = 1,
    LegacyNames = 2,
    CyclingOffsets = 3,
    EnergyConsumption = 4,
    EntityOptimization = 5,
    ConfigRestructure = 6,
    RegisterOrderTerminology = 7,
}

impl MigrationVersion {
    pub const ALL: [MigrationVersion; 7] = [
        MigrationVersion::Initial,
        MigrationVersion::LegacyNames,
        MigrationVersion::CyclingOffsets,
        MigrationVersion::EnergyConsumption,
        MigrationVersion::EntityOptimization,
        MigrationVersion::ConfigRestructure,
        MigrationVersion::RegisterOrderTerminology,
    ];

    pub const fn latest() -> Self {
        MigrationVersion::RegisterOrderTerminology
    }

    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_u32() == value)
    }

    /// Versions with a pending step when the document is at `current`:
    /// every tag in `(current, latest]`.
    pub fn pending(current: u32, latest: Self) -> Vec<Self> {
        Self::ALL
            .iter()
            .copied()
            .filter(|v| v.as_u32() > current && *v <= latest)
            .collect()
    }
}

impl fmt::Display for MigrationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}
