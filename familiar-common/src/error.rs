//! Error types for Familiar services.

use thiserror::Error;

/// Result type alias using the Familiar error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Familiar services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A lifecycle transition that is not allowed from the current status
    #[error("Cannot {action} hand '{hand}' while it is {from}")]
    InvalidTransition {
        hand: String,
        from: String,
        action: String,
    },

    /// One or more validation failures
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Timeout error
    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a not-found hand.
    pub fn hand_not_found(name: &str) -> Self {
        Self::NotFound(format!("hand '{name}'"))
    }

    /// Check if this is a lifecycle transition error.
    pub const fn is_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }

    /// Get HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Auth(_) => 401,
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) | Self::Validation(_) => 400,
            Self::InvalidTransition { .. } => 409,
            Self::Timeout(_) => 408,
            _ => 500,
        }
    }
}
