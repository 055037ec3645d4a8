//! Process-local single-writer lock for backup and restore operations.
//!
//! Backup creation and restore staging both copy large files into managed
//! directories. Only one of them may be in flight at a time; a second caller
//! is turned away with [`BackupError::OperationInProgress`] instead of waiting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::utils::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateBackup,
    StageRestore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::CreateBackup => write!(f, "backup creation"),
            OperationKind::StageRestore => write!(f, "restore staging"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningOperation {
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct OperationLock {
    current: Arc<Mutex<Option<RunningOperation>>>,
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lock for `kind`, or fail immediately if anything holds it.
    pub fn try_acquire(&self, kind: OperationKind) -> Result<OperationGuard> {
        let mut current = self.slot();
        if let Some(running) = current.as_ref() {
            return Err(BackupError::OperationInProgress(running.kind));
        }
        *current = Some(RunningOperation {
            kind,
            started_at: Utc::now(),
        });
        Ok(OperationGuard {
            current: Arc::clone(&self.current),
        })
    }

    /// The operation holding the lock, if any.
    pub fn running(&self) -> Option<RunningOperation> {
        self.slot().as_ref().cloned()
    }

    fn slot(&self) -> MutexGuard<'_, Option<RunningOperation>> {
        // A poisoned slot only means a holder panicked; the guard still reset it.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the lock when dropped, including when the owning task is cancelled.
pub struct OperationGuard {
    current: Arc<Mutex<Option<RunningOperation>>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = None;
    }
}
