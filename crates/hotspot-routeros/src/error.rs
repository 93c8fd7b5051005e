//! RouterOS client errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors from router operations.
///
/// `NotFound` is kept apart from `Command` so callers can treat an idempotent
/// delete of something already gone differently from a real failure.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Pool acquire, health check or transport timed out or failed.
    #[error("Router unreachable: {0}")]
    Unreachable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The router answered with an error.
    #[error("Router command failed ({status}): {message}")]
    Command { status: u16, message: String },

    /// The router answered with something we could not interpret.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RouterError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<reqwest::Error> for RouterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::Unreachable(e.to_string())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Command {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}
