//! Error types for bookforge-storage

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// What went wrong in a storage adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// SQLite failure, or the blocking SQLite task died
    Database,
    /// A stored record could not be encoded or decoded
    Serialization,
    JobNotFound,
    /// The job is not in the state the caller assumed (lease lost, not dead)
    JobConflict,
    /// Run ids become file names and must stay inside the store directory
    InvalidRunId,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::JobNotFound => "job_not_found",
            ErrorKind::JobConflict => "job_conflict",
            ErrorKind::InvalidRunId => "invalid_run_id",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn job_not_found(job_id: Uuid) -> Self {
        Self::new(ErrorKind::JobNotFound, format!("Job not found: {}", job_id))
    }

    pub fn job_conflict(job_id: Uuid, detail: impl fmt::Display) -> Self {
        Self::new(ErrorKind::JobConflict, format!("Job {}: {}", job_id, detail))
    }

    pub fn invalid_run_id(run_id: &str) -> Self {
        Self::new(ErrorKind::InvalidRunId, format!("Invalid run id: {:?}", run_id))
    }

    /// A `spawn_blocking` storage task panicked or was cancelled
    pub fn task_failed(err: tokio::task::JoinError) -> Self {
        Self::new(ErrorKind::Database, format!("Storage task failed: {}", err)).with_source(err)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::new(ErrorKind::Io, format!("IO error: {}", err)).with_source(err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_job_conflict_names_the_job() {
        let id = Uuid::new_v4();
        let err = StorageError::job_conflict(id, "not leased by worker-1");
        assert_eq!(err.kind, ErrorKind::JobConflict);
        assert_eq!(
            err.to_string(),
            format!("[job_conflict] Job {}: not leased by worker-1", id)
        );
    }

    #[test]
    fn test_invalid_run_id_is_quoted() {
        let err = StorageError::invalid_run_id("../etc");
        assert_eq!(err.kind, ErrorKind::InvalidRunId);
        assert!(err.message.contains("\"../etc\""));
    }

    #[tokio::test]
    async fn test_panicked_task_maps_to_database() {
        let join_err = tokio::task::spawn_blocking(|| panic!("boom"))
            .await
            .unwrap_err();
        let err = StorageError::task_failed(join_err);
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.source().is_some());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_from_rusqlite_error() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_io_error_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err: StorageError = io_err.into();
        assert_eq!(err.kind, ErrorKind::Io);
        assert!(err.source().unwrap().to_string().contains("read-only"));
    }
}
