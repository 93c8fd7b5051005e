//! Error types for the hotspot core library.

use thiserror::Error;

/// Result type alias using the core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value could not be parsed into a domain type
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid phone number
    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    /// Invalid MAC address
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    /// Order id does not match any known format
    #[error("Invalid order id: {0}")]
    InvalidOrderId(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
