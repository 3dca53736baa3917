//! Lambda heat-pump Modbus/TCP bridge service
//!
//! Device-integration core: a resilient Modbus client guarded by a circuit
//! breaker, a pure register codec, per-period energy and cycle accounting
//! driven by an external cumulative power sensor, and a versioned migration
//! engine that carries the user's YAML configuration across schema revisions
//! with backups and rollback.

pub mod config;
pub mod core;
pub mod error;
pub mod migration;
pub mod protocols;
pub mod runtime;

pub use error::{BridgeError, BridgeResult, FailureKind};
