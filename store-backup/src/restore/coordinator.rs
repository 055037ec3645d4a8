use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::intent::{IntentFile, IntentStatus, RestoreIntent};
use crate::catalog::{BackupRecord, BackupStore};
use crate::checksum::ChecksumEngine;
use crate::events::{BackupEvent, EventBus};
use crate::lock::{OperationKind, OperationLock};
use crate::transport::RemoteTransport;
use crate::utils::{blocking, fsutil, BackupError, Result};

const STAGED_SUFFIX: &str = ".staged";
const DOWNLOAD_SUFFIX: &str = ".download";

/// Verifies a backup, copies it into the staging area and records the
/// pending-restore intent. Never touches the live data file.
#[derive(Clone)]
pub struct RestoreCoordinator {
    store: Arc<BackupStore>,
    intent: IntentFile,
    staging_dir: PathBuf,
    transport: Option<Arc<dyn RemoteTransport>>,
    lock: OperationLock,
    events: EventBus,
    max_io_retries: u32,
}

impl RestoreCoordinator {
    pub fn new(
        store: Arc<BackupStore>,
        intent: IntentFile,
        staging_dir: PathBuf,
        lock: OperationLock,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            intent,
            staging_dir,
            transport: None,
            lock,
            events,
            max_io_retries: 3,
        }
    }

    pub fn with_transport(mut self, transport: Option<Arc<dyn RemoteTransport>>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_io_retries(mut self, max_io_retries: u32) -> Self {
        self.max_io_retries = max_io_retries;
        self
    }

    /// Stage backup `backup_id` for application at the next startup.
    ///
    /// Runs on its own task holding the lock, so a dropped caller neither
    /// frees the lock early nor leaves a half-built staging area behind.
    pub async fn stage_restore(&self, backup_id: &str) -> Result<RestoreIntent> {
        let guard = self.lock.try_acquire(OperationKind::StageRestore)?;
        let this = self.clone();
        let id = backup_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            this.stage(&id).await
        })
        .await?
    }

    async fn stage(&self, backup_id: &str) -> Result<RestoreIntent> {
        let intent = self.intent.clone();
        let staging = self.staging_dir.clone();
        let store = Arc::clone(&self.store);
        let id = backup_id.to_string();
        let record = blocking(move || {
            if let Some(existing) = intent.pending()? {
                return Err(BackupError::RestoreAlreadyPending {
                    backup_id: existing.target_backup_id,
                });
            }
            let record = store.get(&id)?;
            // No pending intent, so anything in staging is an orphan.
            fs::create_dir_all(&staging)?;
            let orphans = super::clear_dir(&staging)?;
            if orphans > 0 {
                warn!(count = orphans, "[Restore] Removed orphaned staging entries");
            }
            Ok(record)
        })
        .await?;

        info!(backup_id = %record.id, "[Restore] Staging backup");
        let staged_path = self.staging_dir.join(format!("{}{STAGED_SUFFIX}", record.id));

        let staged = if record.local_path.exists() {
            self.stage_local(&record, &staged_path).await
        } else {
            self.stage_remote(&record, &staged_path).await
        };
        let staged_checksum = match staged {
            Ok(checksum) => checksum,
            Err(e) => {
                let _ = fsutil::remove_if_exists(&staged_path);
                warn!(backup_id = %record.id, error = %e, "[Restore] Staging failed, nothing changed");
                return Err(e);
            }
        };

        let intent = RestoreIntent {
            target_backup_id: record.id.clone(),
            staged_file_path: staged_path.clone(),
            staged_checksum,
            requested_at: Utc::now(),
            status: IntentStatus::Pending,
        };
        let written = {
            let file = self.intent.clone();
            let intent = intent.clone();
            blocking(move || file.write(&intent)).await
        };
        if let Err(e) = written {
            let _ = fsutil::remove_if_exists(&staged_path);
            return Err(e);
        }

        info!(
            backup_id = %intent.target_backup_id,
            staged = %staged_path.display(),
            "[Restore] Restore staged, will apply at next startup"
        );
        self.events.emit(BackupEvent::RestoreStaged {
            backup_id: intent.target_backup_id.clone(),
        });
        Ok(intent)
    }

    /// Verify the archived artifact, copy it into staging and re-hash the copy.
    async fn stage_local(&self, record: &BackupRecord, staged_path: &Path) -> Result<String> {
        let source = record.local_path.clone();
        let expected = record.checksum.clone();
        let dest = staged_path.to_path_buf();
        let retries = self.max_io_retries;
        blocking(move || {
            let engine = ChecksumEngine::new();
            engine.ensure(&source, &expected)?;

            let partial = fsutil::with_suffix(&dest, ".partial");
            let copied = fsutil::retry_io("copy to staging", retries, || {
                fsutil::copy_durable(&source, &partial)
            });
            if let Err(e) = copied {
                let _ = fsutil::remove_if_exists(&partial);
                return Err(e.into());
            }
            fs::rename(&partial, &dest)?;
            fsutil::sync_parent(&dest);

            // The copy itself could have been damaged in flight.
            let staged = engine.compute(&dest)?;
            if !staged.eq_ignore_ascii_case(&expected) {
                return Err(BackupError::ChecksumMismatch {
                    path: dest,
                    expected,
                    actual: staged,
                });
            }
            Ok(staged)
        })
        .await
    }

    /// Local artifact is gone: fetch it from the remote copy and verify that.
    async fn stage_remote(&self, record: &BackupRecord, staged_path: &Path) -> Result<String> {
        let (Some(transport), Some(remote_ref)) = (&self.transport, &record.remote_ref) else {
            return Err(BackupError::NotFound(format!(
                "artifact for backup {} ({})",
                record.id,
                record.local_path.display()
            )));
        };

        info!(backup_id = %record.id, remote = %remote_ref, "[Restore] Local artifact missing, downloading");
        let download = fsutil::with_suffix(staged_path, DOWNLOAD_SUFFIX);
        if let Err(e) = transport.download(remote_ref, &download).await {
            let _ = fsutil::remove_if_exists(&download);
            return Err(e);
        }

        let expected = record.checksum.clone();
        let dest = staged_path.to_path_buf();
        blocking(move || {
            let verified = ChecksumEngine::new().ensure(&download, &expected);
            if let Err(e) = verified {
                let _ = fsutil::remove_if_exists(&download);
                return Err(e);
            }
            fs::rename(&download, &dest)?;
            fsutil::sync_parent(&dest);
            Ok(expected.to_ascii_lowercase())
        })
        .await
    }
}
