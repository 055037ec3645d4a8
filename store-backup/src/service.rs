//! Backup creation: quiesce, copy, verify, record, optionally ship.

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{BackupRecord, BackupStatus, BackupStore, BackupTrigger};
use crate::checksum::ChecksumEngine;
use crate::events::{BackupEvent, EventBus};
use crate::lock::{OperationKind, OperationLock};
use crate::source::DataSource;
use crate::transport::RemoteTransport;
use crate::utils::{blocking, fsutil, BackupError, Result};

pub const PARTIAL_SUFFIX: &str = ".partial";

/// Upload state of a record that has not been shipped yet.
const AWAITING_UPLOAD: &str = "awaiting upload";

/// Timestamp-derived unique id, e.g. `20240611T020000123Z-9f3a61c2`.
pub fn new_backup_id(created_at: &DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", created_at.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

fn artifact_name(id: &str, live_path: &Path) -> String {
    match live_path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{id}.{ext}"),
        None => format!("{id}.bak"),
    }
}

struct LocalSnapshot {
    path: PathBuf,
    size: u64,
    checksum: String,
}

#[derive(Clone)]
pub struct BackupService {
    source: Arc<dyn DataSource>,
    store: Arc<BackupStore>,
    transport: Option<Arc<dyn RemoteTransport>>,
    lock: OperationLock,
    events: EventBus,
    backup_dir: PathBuf,
    max_io_retries: u32,
}

impl BackupService {
    pub fn new(
        source: Arc<dyn DataSource>,
        store: Arc<BackupStore>,
        lock: OperationLock,
        events: EventBus,
        backup_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            store,
            transport: None,
            lock,
            events,
            backup_dir,
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

    /// Take a new snapshot of the live data. Every call is a new backup.
    ///
    /// Fails with `OperationInProgress` if a backup or restore staging is
    /// already running in this process. On failure no record is created and
    /// the partial artifact is removed; the attempt is logged for health.
    ///
    /// The work runs on its own task, which owns the lock until the artifact
    /// is recorded. Dropping the returned future does not cut a backup short.
    /// The remote upload runs after the lock is released.
    pub async fn create_backup(&self, trigger: BackupTrigger) -> Result<BackupRecord> {
        let guard = self.lock.try_acquire(OperationKind::CreateBackup)?;
        let this = self.clone();
        tokio::spawn(async move {
            let record = {
                let _guard = guard;
                this.create_local(trigger).await?
            };
            Ok::<_, BackupError>(this.ship(record).await)
        })
        .await?
    }

    async fn create_local(&self, trigger: BackupTrigger) -> Result<BackupRecord> {
        // The catalog keeps millisecond timestamps.
        let created_at = Utc::now().trunc_subsecs(3);
        let id = new_backup_id(&created_at);
        let attempt_id = format!("attempt-{id}");

        {
            let store = Arc::clone(&self.store);
            let attempt_id = attempt_id.clone();
            blocking(move || store.begin_attempt(&attempt_id, trigger)).await?;
        }
        self.events.emit(BackupEvent::BackupStarted {
            attempt_id: attempt_id.clone(),
            trigger,
        });
        info!(backup_id = %id, trigger = %trigger, "[Backup] Starting");

        // Publishing the artifact and recording it happen in one blocking
        // unit, so an artifact on disk always has a record.
        let recorded = {
            let source = Arc::clone(&self.source);
            let store = Arc::clone(&self.store);
            let dir = self.backup_dir.clone();
            let retries = self.max_io_retries;
            let attempt_id = attempt_id.clone();
            let awaiting_upload = self.transport.is_some();
            blocking(move || {
                let snapshot = take_snapshot(source.as_ref(), &dir, &id, retries)?;
                let record = BackupRecord {
                    id,
                    created_at,
                    size_bytes: snapshot.size,
                    checksum: snapshot.checksum,
                    local_path: snapshot.path,
                    remote_ref: None,
                    trigger,
                    status: BackupStatus::Complete,
                    upload_error: awaiting_upload.then(|| AWAITING_UPLOAD.to_string()),
                    upload_attempts: 0,
                };
                if let Err(e) = store.record_created(&record) {
                    let _ = fsutil::remove_if_exists(&record.local_path);
                    return Err(e);
                }
                if let Err(e) = store.complete_attempt(&attempt_id, &record.id) {
                    warn!(attempt_id = %attempt_id, error = %e, "[Backup] Could not close attempt");
                }
                Ok(record)
            })
            .await
        };
        let record = match recorded {
            Ok(record) => record,
            Err(e) => {
                self.record_failure(&attempt_id, &e).await;
                return Err(e);
            }
        };

        info!(
            backup_id = %record.id,
            bytes = record.size_bytes,
            checksum = %record.checksum,
            "[Backup] Completed"
        );
        self.events.emit(BackupEvent::BackupCompleted {
            backup_id: record.id.clone(),
            size_bytes: record.size_bytes,
        });
        Ok(record)
    }

    /// Hand a recorded artifact to the remote transport. The outcome is kept
    /// on the record; an upload failure never fails the backup.
    async fn ship(&self, record: BackupRecord) -> BackupRecord {
        let Some(transport) = &self.transport else {
            return record;
        };
        if let Err(e) = self.upload_record(transport.as_ref(), &record).await {
            warn!(backup_id = %record.id, error = %e, "[Backup] Could not record upload result");
        }
        let store = Arc::clone(&self.store);
        let id = record.id.clone();
        blocking(move || store.get(&id)).await.unwrap_or(record)
    }

    /// Upload one artifact and store the result. `Ok(false)` means the upload
    /// itself failed and was recorded for a later retry.
    async fn upload_record(&self, transport: &dyn RemoteTransport, rec: &BackupRecord) -> Result<bool> {
        let name = artifact_name(&rec.id, self.source.live_path());
        let outcome = if rec.local_path.exists() {
            transport.upload(&rec.local_path, &name).await
        } else {
            Err(BackupError::NotFound(format!(
                "local artifact {}",
                rec.local_path.display()
            )))
        };

        let store = Arc::clone(&self.store);
        let id = rec.id.clone();
        match outcome {
            Ok(remote_ref) => {
                let r = remote_ref.clone();
                blocking(move || store.mark_uploaded(&id, &r)).await?;
                info!(backup_id = %rec.id, remote = %remote_ref, "[Backup] Uploaded");
                self.events.emit(BackupEvent::BackupUploaded {
                    backup_id: rec.id.clone(),
                    remote_ref,
                });
                Ok(true)
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let message = message.clone();
                    blocking(move || store.mark_upload_failed(&id, &message)).await?;
                }
                warn!(backup_id = %rec.id, error = %e, "[Backup] Remote upload failed, keeping local backup");
                self.events.emit(BackupEvent::BackupUploadFailed {
                    backup_id: rec.id.clone(),
                    error: message,
                });
                Ok(false)
            }
        }
    }

    async fn record_failure(&self, attempt_id: &str, err: &BackupError) {
        error!(attempt_id, error = %err, "[Backup] Failed");
        let message = err.to_string();
        let store = Arc::clone(&self.store);
        let id = attempt_id.to_string();
        let logged = blocking({
            let message = message.clone();
            move || store.fail_attempt(&id, &message)
        })
        .await;
        if let Err(e) = logged {
            warn!(attempt_id, error = %e, "[Backup] Could not log failed attempt");
        }
        self.events.emit(BackupEvent::BackupFailed {
            attempt_id: attempt_id.to_string(),
            error: message,
        });
    }

    /// Re-ship artifacts whose upload failed or never ran. Returns how many succeeded.
    pub async fn retry_pending_uploads(&self) -> Result<usize> {
        let Some(transport) = &self.transport else {
            return Ok(0);
        };
        let store = Arc::clone(&self.store);
        let pending = blocking(move || store.pending_uploads()).await?;

        let mut uploaded = 0;
        for rec in pending {
            if self.upload_record(transport.as_ref(), &rec).await? {
                uploaded += 1;
            }
        }
        Ok(uploaded)
    }

    /// Clean up after runs that were killed part-way: delete `.partial` files
    /// and published artifacts that never got a record, and close out
    /// attempts still marked running. Skipped while an operation holds the
    /// lock. Returns how many files were removed.
    pub fn sweep_interrupted(&self) -> Result<usize> {
        let _guard = match self.lock.try_acquire(OperationKind::CreateBackup) {
            Ok(guard) => guard,
            Err(BackupError::OperationInProgress(_)) => return Ok(0),
            Err(e) => return Err(e),
        };

        let closed = self.store.fail_running_attempts("interrupted before completion")?;
        if closed > 0 {
            warn!(count = closed, "[Backup] Closed attempts left running by an earlier process");
        }
        if !self.backup_dir.exists() {
            return Ok(0);
        }

        let recorded: HashSet<OsString> = self
            .store
            .list(None)?
            .into_iter()
            .filter_map(|r| r.local_path.file_name().map(OsStr::to_os_string))
            .collect();

        let mut removed = 0;
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let text = name.to_string_lossy();
            let stem = text.split('.').next().unwrap_or_default();
            if !is_backup_id(stem) || !entry.path().is_file() {
                continue;
            }
            if text.ends_with(PARTIAL_SUFFIX) || !recorded.contains(&name) {
                fs::remove_file(entry.path())?;
                info!(file = %text, "[Backup] Removed interrupted artifact");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn is_backup_id(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 28
        && b[..8].iter().all(u8::is_ascii_digit)
        && b[8] == b'T'
        && b[9..18].iter().all(u8::is_ascii_digit)
        && b[18] == b'Z'
        && b[19] == b'-'
        && b[20..].iter().all(u8::is_ascii_hexdigit)
}

fn take_snapshot(
    source: &dyn DataSource,
    dir: &Path,
    id: &str,
    max_io_retries: u32,
) -> Result<LocalSnapshot> {
    fs::create_dir_all(dir)?;
    let final_path = dir.join(artifact_name(id, source.live_path()));
    let partial = fsutil::with_suffix(&final_path, PARTIAL_SUFFIX);

    let result = write_snapshot(source, &partial, &final_path, max_io_retries);
    if result.is_err() {
        let _ = fsutil::remove_if_exists(&partial);
    }
    result
}

fn write_snapshot(
    source: &dyn DataSource,
    partial: &Path,
    final_path: &Path,
    max_io_retries: u32,
) -> Result<LocalSnapshot> {
    let reported = fsutil::retry_when("snapshot", max_io_retries, BackupError::is_transient, || {
        fsutil::remove_if_exists(partial)?;
        source.snapshot_to(partial)
    })?;

    let size = fs::metadata(partial)?.len();
    if size == 0 {
        return Err(BackupError::EmptySnapshot(final_path.to_path_buf()));
    }
    if size != reported {
        return Err(BackupError::TruncatedSnapshot {
            expected: reported,
            actual: size,
        });
    }
    source.validate_snapshot(partial)?;

    let checksum = ChecksumEngine::new().compute(partial)?;

    fsutil::retry_io("publish artifact", max_io_retries, || fs::rename(partial, final_path))?;
    fsutil::sync_parent(final_path);

    Ok(LocalSnapshot {
        path: final_path.to_path_buf(),
        size,
        checksum,
    })
}
