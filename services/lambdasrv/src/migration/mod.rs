//! Versioned configuration migrations with backup and rollback.

pub mod backup;
pub mod engine;
pub mod registry;
pub mod steps;
pub mod version;

pub use backup::{BackupManager, FileClass};
pub use engine::MigrationEngine;
pub use registry::{EntityRegistry, InMemoryRegistry};
pub use steps::{MigrationContext, MigrationStep};
pub use version::MigrationVersion;
