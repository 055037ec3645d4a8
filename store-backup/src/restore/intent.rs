//! The pending-restore descriptor ("command file").
//!
//! One canonical JSON file, replaced only by [`fsutil::atomic_write`]. A
//! half-written descriptor can exist only under the `.tmp` name, which
//! readers never consult.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::utils::fsutil;
use crate::utils::{BackupError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Applied,
    Aborted,
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentStatus::Pending => write!(f, "pending"),
            IntentStatus::Applied => write!(f, "applied"),
            IntentStatus::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreIntent {
    pub target_backup_id: String,
    pub staged_file_path: PathBuf,
    pub staged_checksum: String,
    pub requested_at: DateTime<Utc>,
    pub status: IntentStatus,
}

/// Handle on the descriptor's canonical path.
#[derive(Debug, Clone)]
pub struct IntentFile {
    path: PathBuf,
}

impl IntentFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> PathBuf {
        fsutil::temp_path_for(&self.path)
    }

    /// Read the descriptor. `Ok(None)` when absent; `IntentCorrupt` when the
    /// file exists but cannot be parsed.
    pub fn load(&self) -> Result<Option<RestoreIntent>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BackupError::IntentCorrupt {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| BackupError::IntentCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// The descriptor if it exists and is still pending.
    pub fn pending(&self) -> Result<Option<RestoreIntent>> {
        Ok(self
            .load()?
            .filter(|intent| intent.status == IntentStatus::Pending))
    }

    /// Durably replace the descriptor (temp file + fsync + rename).
    pub fn write(&self, intent: &RestoreIntent) -> Result<()> {
        let json = serde_json::to_vec_pretty(intent)?;
        fsutil::atomic_write(&self.path, &json)?;
        Ok(())
    }

    /// Delete the descriptor and any leftover temp file. Idempotent.
    pub fn remove(&self) -> Result<bool> {
        fsutil::remove_if_exists(&self.temp_path())?;
        let removed = fsutil::remove_if_exists(&self.path)?;
        if removed {
            fsutil::sync_parent(&self.path);
        }
        Ok(removed)
    }

    /// Drop a temp descriptor left by a crash mid-write.
    pub fn sweep_temp(&self) -> Result<bool> {
        Ok(fsutil::remove_if_exists(&self.temp_path())?)
    }
}
