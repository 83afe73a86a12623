//! Error types and result definitions for the rustgovee crate.
//! Covers codec failures, catalog lookups, and transport hand-off errors.

use thiserror::Error;

/// Represents all possible errors that can occur inside the protocol engine.
#[derive(Error, Debug, Clone)]
pub enum GoveeError {
    /// Standard IO error (reading catalog data, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// An assembled frame would not fit the fixed frame size
    #[error("Frame payload of {got} bytes exceeds {max} data bytes")]
    FrameTooLarge { got: usize, max: usize },

    /// Failed to decode hex or base64 data
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// An opcode string or integer could not be normalized
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(String),

    /// The transport collaborator rejected or dropped an outbound envelope
    #[error("Transport error: {0}")]
    Transport(String),

    /// The coordinator task has been stopped
    #[error("Coordinator is not running")]
    NotRunning,

    /// No state with the given name is registered on the device
    #[error("State '{0}' not found")]
    StateNotFound(String),

    /// The state catalog has no entry with the given name
    #[error("Catalog entry '{0}' not found")]
    CatalogMiss(String),
}

/// A specialized Result type for protocol engine operations.
pub type Result<T> = std::result::Result<T, GoveeError>;

impl From<std::io::Error> for GoveeError {
    fn from(err: std::io::Error) -> Self {
        GoveeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GoveeError {
    fn from(err: serde_json::Error) -> Self {
        GoveeError::Json(err.to_string())
    }
}

impl From<hex::FromHexError> for GoveeError {
    fn from(err: hex::FromHexError) -> Self {
        GoveeError::DecodeError(err.to_string())
    }
}

impl From<base64::DecodeError> for GoveeError {
    fn from(err: base64::DecodeError) -> Self {
        GoveeError::DecodeError(err.to_string())
    }
}
