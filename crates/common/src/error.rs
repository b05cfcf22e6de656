//! Common error types for CharityFund

use thiserror::Error;

/// Common error type used across CharityFund crates
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input was provided (unknown kind, unknown role, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Caller lacks the role required for an action
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using the common Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }
}
