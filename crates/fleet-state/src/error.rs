//! Error types for fleet-state

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem error while reading or writing state
    #[error("State I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// State could not be serialized
    #[error("State serialization failed: {0}")]
    Serialization(String),

    /// The persisted document exists but cannot be understood.
    ///
    /// Deleting the state file is the recovery path: the next run
    /// re-applies every item, which is safe because executors are idempotent.
    #[error("State at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// Blocking persistence task did not complete
    #[error("State task failed: {0}")]
    Task(String),

    /// Failure injected by a test fake
    #[error("Injected store failure: {0}")]
    Injected(String),
}

impl StoreError {
    /// Whether the error means local storage can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}
