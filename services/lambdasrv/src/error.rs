//! Bridge error taxonomy.
//!
//! Every fault the core can surface is one of these variants; the circuit
//! breaker consumes the [`FailureKind`] classification rather than matching
//! on error types itself.

use std::io::ErrorKind;
use thiserror::Error;

/// Failure classes the circuit breaker distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused/reset, unreachable peer, timeout.
    Network,
    /// The device answered with a Modbus protocol exception.
    Protocol,
    /// Anything else.
    Other,
}

/// Error type for the bridge service
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Transient network fault (connect/read/write failure, reset by peer)
    #[error("Network error: {0}")]
    Network(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Peer returned a Modbus protocol exception
    #[error("Modbus exception: {0}")]
    Protocol(String),

    /// Invalid codec input or schema violation
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    /// Unparseable or structurally broken configuration document
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A migration step failed and rollback has run
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Insufficient disk, permissions, or other resource precondition
    #[error("Resource error: {0}")]
    Resource(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse/serialize errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse/serialize errors (persisted counter state)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the bridge service
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn network(msg: impl Into<String>) -> Self {
        BridgeError::Network(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        BridgeError::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BridgeError::Protocol(msg.into())
    }

    pub fn input_invalid(msg: impl Into<String>) -> Self {
        BridgeError::InputInvalid(msg.into())
    }

    pub fn config_invalid(msg: impl Into<String>) -> Self {
        BridgeError::ConfigInvalid(msg.into())
    }

    pub fn migration_failed(msg: impl Into<String>) -> Self {
        BridgeError::MigrationFailed(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        BridgeError::Resource(msg.into())
    }

    /// Classify this error for the circuit breaker.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BridgeError::Network(_) | BridgeError::Timeout(_) => FailureKind::Network,
            BridgeError::Protocol(_) => FailureKind::Protocol,
            BridgeError::Io(err) => match err.kind() {
                ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut => FailureKind::Network,
                _ => FailureKind::Other,
            },
            _ => FailureKind::Other,
        }
    }

    /// Stable error-kind tag for the status surface and logs.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            BridgeError::Network(_) | BridgeError::Timeout(_) => "TRANSIENT_NETWORK",
            BridgeError::Protocol(_) => "PROTOCOL",
            BridgeError::InputInvalid(_) => "INPUT_INVALID",
            BridgeError::ConfigInvalid(_) => "CONFIG_INVALID",
            BridgeError::MigrationFailed(_) => "MIGRATION_FAILED",
            BridgeError::Resource(_) => "RESOURCE",
            BridgeError::Io(_) => "IO",
            BridgeError::Yaml(_) => "CONFIG_INVALID",
            BridgeError::Json(_) => "SERIALIZATION",
            BridgeError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<common::Error> for BridgeError {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::Network(msg) => BridgeError::Network(msg),
            common::Error::Timeout(msg) => BridgeError::Timeout(msg),
            common::Error::Protocol(msg) => BridgeError::Protocol(msg),
            common::Error::InvalidInput(msg) => BridgeError::InputInvalid(msg),
            common::Error::Config(msg) => BridgeError::ConfigInvalid(msg),
            common::Error::Io(err) => BridgeError::Io(err),
            other => BridgeError::Internal(other.to_string()),
        }
    }
}
