//! Runtime wiring: the polling loop and durable counter state.

pub mod poller;
pub mod store;

pub use poller::{Poller, RegisterMap};
pub use store::JsonFileStore;
