/// Error types for the Astrotask core engine.
use crate::lock::LockHolder;
use thiserror::Error;

/// Core error type shared by the store, overlays, scheduler and facade.
///
/// Validation, NotFound and Conflict are user-facing and never retried by the
/// core. Busy carries the identity of the process holding the advisory lock.
/// Reconciliation indicates that applying a flush plan failed partway; the
/// originating tracking overlay keeps its pending operations so the caller
/// can retry.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database locked by {holder}")]
    Busy { holder: LockHolder },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Reconciliation failed at operation {index}: {message}")]
    Reconciliation { index: usize, message: String },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Wrap any non-reconciliation error as a reconciliation failure at the
    /// given operation index. Reconciliation errors pass through unchanged.
    pub fn into_reconciliation(self, index: usize) -> TaskError {
        match self {
            TaskError::Reconciliation { .. } => self,
            other => TaskError::Reconciliation {
                index,
                message: other.to_string(),
            },
        }
    }
}

/// Result type for core engine operations.
pub type TaskResult<T> = Result<T, TaskError>;
