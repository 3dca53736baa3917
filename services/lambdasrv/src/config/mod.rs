//! Configuration: service settings and the user-facing YAML document.

pub mod store;
pub mod types;

pub use store::ConfigStore;
pub use types::{BridgeConfig, ServiceSettings};
