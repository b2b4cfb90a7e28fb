//! Error types for branchforge.

use thiserror::Error;

use crate::models::JobStatus;

/// Result type alias using branchforge's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for branchforge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger operation failed (wraps sqlx::Error). Transient; callers on
    /// the terminal-write path retry with bounded backoff.
    #[error("Ledger error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job not found in the ledger.
    #[error("Job not found: {0}")]
    NotFound(uuid::Uuid),

    /// A non-terminal job already exists for the branch. Flow control for
    /// the scheduler, not a fault.
    #[error("Duplicate active job for branch: {0}")]
    DuplicateActiveJob(String),

    /// Requested status change violates the job state machine. Always a
    /// programming bug, never expected in normal operation.
    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Dataset snapshot export failed; the eligibility check retries on
    /// the next tick.
    #[error("Dataset unavailable for branch {branch}: {message}")]
    DatasetUnavailable { branch: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether this error is worth retrying at the persistence boundary.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_display_not_found() {
        let id = Uuid::nil();
        let err = Error::NotFound(id);
        assert_eq!(err.to_string(), format!("Job not found: {}", id));
    }

    #[test]
    fn test_error_display_duplicate_active_job() {
        let err = Error::DuplicateActiveJob("math".to_string());
        assert_eq!(err.to_string(), "Duplicate active job for branch: math");
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert!(err.to_string().contains("Completed"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_error_display_dataset_unavailable() {
        let err = Error::DatasetUnavailable {
            branch: "math".to_string(),
            message: "no data file".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Dataset unavailable for branch math: no data file"
        );
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing trainer command".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: missing trainer command"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::Database(sqlx::Error::PoolClosed).is_transient());
        assert!(!Error::NotFound(Uuid::nil()).is_transient());
        assert!(!Error::InvalidTransition {
            from: JobStatus::Pending,
            to: JobStatus::Completed,
        }
        .is_transient());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
