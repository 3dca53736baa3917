//! lambda-bridge common library
//!
//! Shared utilities used by the bridge services: the common error type,
//! logging initialization, and the injectable clock abstraction.

pub mod error;
pub mod logging;
pub mod time;

// Re-exports for convenience
pub use error::{Error, Result};
pub use logging::init_logging;
pub use time::{Clock, ManualClock, SystemClock};

/// Common prelude for bridge services
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use crate::time::{Clock, SystemClock};
    pub use tracing::{debug, error, info, trace, warn};
}
