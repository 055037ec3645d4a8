//! Error types for the backup and restore pipeline.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::lock::OperationKind;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to compute checksum of {path}: {source}")]
    ChecksumCompute {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Snapshot produced an empty file: {0}")]
    EmptySnapshot(PathBuf),

    #[error("Snapshot truncated: expected {expected} bytes, found {actual}")]
    TruncatedSnapshot { expected: u64, actual: u64 },

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Snapshot failed validation: {0}")]
    SnapshotInvalid(String),

    #[error("Another operation is in progress: {0}")]
    OperationInProgress(OperationKind),

    #[error("A restore of backup {backup_id} is already pending")]
    RestoreAlreadyPending { backup_id: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backup record already exists: {0}")]
    DuplicateRecord(String),

    #[error("Restore intent descriptor {path} is unreadable: {reason}")]
    IntentCorrupt { path: PathBuf, reason: String },

    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("Catalog pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl BackupError {
    /// Transient I/O failures are worth a bounded retry; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            BackupError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

pub fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let timed_out = BackupError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow disk"));
        assert!(timed_out.is_transient());

        let denied = BackupError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!denied.is_transient());

        let mismatch = BackupError::ChecksumMismatch {
            path: PathBuf::from("a.db"),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(!mismatch.is_transient());
    }
}
