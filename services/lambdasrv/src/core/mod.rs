//! Core device-integration components.

pub mod accounting;
pub mod breaker;
pub mod codec;
pub mod reset;
pub mod scheduler;
pub mod status;

pub use accounting::{AccountingEngine, CounterKey, Mode, PersistentStore};
pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
pub use codec::{combine_int32, to_signed_32, ByteOrder};
pub use reset::{signal_name, LogSignalBus, Period, ResetRegistry, SensorKind, SignalBus};
pub use scheduler::ResetScheduler;
pub use status::{MigrationAudit, StatusSurface, StepOutcome};
