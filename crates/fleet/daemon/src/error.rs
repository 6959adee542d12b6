//! Error types for fleet-daemon

use fleet_types::{ParsePhaseError, TransitionError};
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Engine error
    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage-specific errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency rejection or duplicate key
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query error
    #[error("Query error: {0}")]
    Query(String),
}

impl From<ParsePhaseError> for StorageError {
    fn from(err: ParsePhaseError) -> Self {
        StorageError::InvalidData(err.to_string())
    }
}

/// Errors raised by services, reconcilers and the signal bus
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stale version or concurrent modification
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Authorization-class failure, e.g. no evaluation capacity
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Catalog read or parse failure; aborts the whole startup batch
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Vault error: {0}")]
    Vault(String),

    #[error("Signal bus error: {0}")]
    SignalBus(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Storage(StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for FleetError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => FleetError::NotFound(msg),
            StorageError::Conflict(msg) => FleetError::Conflict(msg),
            other => FleetError::Storage(other),
        }
    }
}

impl FleetError {
    /// Transient failures that leave state untouched and are retried next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Storage(StorageError::Connection(_)) | FleetError::SignalBus(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, FleetError::Conflict(_))
    }

    /// Prefix the message with the failing operation, keeping the variant
    pub fn context(self, what: impl std::fmt::Display) -> Self {
        match self {
            FleetError::NotFound(msg) => FleetError::NotFound(format!("{what}: {msg}")),
            FleetError::Conflict(msg) => FleetError::Conflict(format!("{what}: {msg}")),
            FleetError::Validation(msg) => FleetError::Validation(format!("{what}: {msg}")),
            FleetError::Unauthorized(msg) => FleetError::Unauthorized(format!("{what}: {msg}")),
            FleetError::Catalog(msg) => FleetError::Catalog(format!("{what}: {msg}")),
            FleetError::Vault(msg) => FleetError::Vault(format!("{what}: {msg}")),
            FleetError::SignalBus(msg) => FleetError::SignalBus(format!("{what}: {msg}")),
            FleetError::Internal(msg) => FleetError::Internal(format!("{what}: {msg}")),
            other => FleetError::Internal(format!("{what}: {other}")),
        }
    }
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Result type for engine operations
pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_conflict_maps_to_fleet_conflict() {
        let err: FleetError = StorageError::Conflict("stale version".into()).into();
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        let err: FleetError = StorageError::Connection("refused".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = FleetError::NotFound("deployment".into()).context("connector c1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: connector c1: deployment");
    }
}
