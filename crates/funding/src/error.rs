//! Funding error types

use thiserror::Error;

use common::types::FundableKind;

use crate::store::traits::StoreError;

/// Errors reported to callers of the funding service
///
/// Everything except [`FundingError::Transient`] is a precondition failure
/// surfaced before the matching engine runs.
#[derive(Error, Debug)]
pub enum FundingError {
    /// Project name already taken
    #[error("Project name already exists: {0}")]
    DuplicateName(String),

    /// Referenced entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: FundableKind, id: i64 },

    /// Requested full amount is below what was already invested
    #[error("Invalid amount: full_amount {requested} is less than invested amount {invested}")]
    InvalidAmount { requested: u64, invested: u64 },

    /// Entity is already fully invested
    #[error("{kind} {id} is closed")]
    EntityClosed { kind: FundableKind, id: i64 },

    /// Project already received funds and cannot be deleted
    #[error("Project {id} has invested amount {invested} and cannot be deleted")]
    NonZeroInvestment { id: i64, invested: u64 },

    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller lacks the required role
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Commit-time conflict; the caller may retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl FundingError {
    /// Only commit conflicts are eligible for caller-level retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, FundingError::Transient(_))
    }
}

impl From<StoreError> for FundingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => FundingError::Transient(msg),
            StoreError::Duplicate(name) => FundingError::DuplicateName(name),
            StoreError::NotFound { kind, id } => FundingError::NotFound { kind, id },
            StoreError::Backend(msg) => FundingError::Storage(msg),
        }
    }
}

impl From<common::Error> for FundingError {
    fn from(err: common::Error) -> Self {
        match err {
            common::Error::Forbidden(msg) => FundingError::Forbidden(msg),
            common::Error::InvalidInput(msg) => FundingError::Validation(msg),
            common::Error::Other(e) => FundingError::Storage(e.to_string()),
        }
    }
}

/// Result type for funding operations
pub type Result<T> = std::result::Result<T, FundingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let err: FundingError = StoreError::Conflict("stale balance".to_string()).into();
        assert!(err.is_retryable());

        let err: FundingError = StoreError::Duplicate("Shelter".to_string()).into();
        assert!(matches!(err, FundingError::DuplicateName(ref n) if n == "Shelter"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_forbidden_mapping() {
        let err: FundingError = common::Error::forbidden("admin only").into();
        assert!(matches!(err, FundingError::Forbidden(_)));
    }
}
