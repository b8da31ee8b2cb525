//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including path validation failures and invalid state transitions.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path is not within the local root directory
    #[error("Path not within local root: {0}")]
    PathNotInRoot(String),

    /// The remote directory could not be parsed as a URI or path
    #[error("Invalid remote URI: {0}")]
    InvalidRemoteUri(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("../escape".to_string());
        assert_eq!(err.to_string(), "Invalid path: ../escape");

        let err = DomainError::InvalidState {
            from: "stopped".to_string(),
            to: "syncing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from stopped to syncing"
        );
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidRemoteUri("mailto:x".to_string());
        let err2 = DomainError::InvalidRemoteUri("mailto:x".to_string());
        let err3 = DomainError::InvalidRemoteUri("other".to_string());

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
