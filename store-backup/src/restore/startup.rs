//! Applies a pending restore at process start, before the live data file is
//! opened by anything else.
//!
//! The only write to the live path is a `rename` of a verified file over it,
//! so the live path always holds either the old or the new data in full. A
//! crash before the rename leaves the intent pending and the old data live;
//! a crash after it leaves a stale descriptor that the next run recognises
//! as already applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::intent::{IntentFile, IntentStatus, RestoreIntent};
use super::LAST_RESTORE_FILE;
use crate::checksum::ChecksumEngine;
use crate::config::{Config, DataEngine};
use crate::events::{BackupEvent, EventBus};
use crate::utils::{fsutil, BackupError, Result};

const PRE_RESTORE_SUFFIX: &str = ".pre-restore";
const RESTORE_TMP_SUFFIX: &str = ".restore-tmp";
const SQLITE_SIDECARS: [&str; 2] = ["-wal", "-shm"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StartupOutcome {
    NoIntent,
    #[serde(rename_all = "camelCase")]
    Applied { backup_id: String },
    /// A previous run swapped the data in but crashed before cleanup.
    #[serde(rename_all = "camelCase")]
    AlreadyApplied { backup_id: String },
    Aborted { reason: String },
}

impl StartupOutcome {
    /// Whether the live data now holds the restored backup.
    pub fn applied(&self) -> bool {
        matches!(
            self,
            StartupOutcome::Applied { .. } | StartupOutcome::AlreadyApplied { .. }
        )
    }
}

/// Persisted result of the last applied or aborted restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub status: IntentStatus,
    pub backup_id: Option<String>,
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

impl RestoreOutcome {
    pub fn path_for(intent_path: &Path) -> PathBuf {
        intent_path.with_file_name(LAST_RESTORE_FILE)
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct StartupRestoreProcessor {
    intent: IntentFile,
    live_path: PathBuf,
    staging_dir: PathBuf,
    engine: DataEngine,
    keep_pre_restore_copy: bool,
    events: Option<EventBus>,
}

impl StartupRestoreProcessor {
    pub fn new(config: &Config) -> Self {
        Self {
            intent: IntentFile::new(&config.restore.intent_path),
            live_path: config.data.live_path.clone(),
            staging_dir: config.restore.staging_dir.clone(),
            engine: config.data.engine,
            keep_pre_restore_copy: config.restore.keep_pre_restore_copy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn outcome_path(&self) -> PathBuf {
        RestoreOutcome::path_for(self.intent.path())
    }

    /// Run once, synchronously, before the live data file is opened.
    ///
    /// Returns an error only when the restore can neither be applied nor
    /// safely discarded (staged file unreadable); the intent then stays
    /// pending and the live file is untouched.
    pub fn process_pending_restore(&self) -> Result<StartupOutcome> {
        if self.intent.sweep_temp()? {
            warn!("[Startup] Removed half-written restore descriptor");
        }
        self.sweep_restore_tmp();

        let intent = match self.intent.load() {
            Ok(None) => return Ok(StartupOutcome::NoIntent),
            Ok(Some(intent)) => intent,
            Err(BackupError::IntentCorrupt { path, reason }) => {
                error!(path = %path.display(), reason = %reason, "[Startup] Restore descriptor unreadable, discarding");
                return self.abort(None, format!("descriptor unreadable: {reason}"), None);
            }
            Err(e) => return Err(e),
        };

        // Only a file directly inside staging may be renamed or deleted on
        // the descriptor's say-so.
        if !self.is_staged_path(&intent.staged_file_path) {
            error!(
                staged = %intent.staged_file_path.display(),
                "[Startup] Restore descriptor points outside the staging area, discarding"
            );
            return self.abort(
                Some(&intent),
                format!(
                    "descriptor unreadable: staged file {} is not in {}",
                    intent.staged_file_path.display(),
                    self.staging_dir.display()
                ),
                None,
            );
        }

        if intent.status != IntentStatus::Pending {
            info!(status = %intent.status, "[Startup] Removing stale restore descriptor");
            self.discard(Some(&intent.staged_file_path))?;
            return Ok(StartupOutcome::NoIntent);
        }

        info!(backup_id = %intent.target_backup_id, "[Startup] Pending restore found, verifying");
        let engine = ChecksumEngine::new();

        if !intent.staged_file_path.exists() {
            let live_matches = self.live_path.exists()
                && engine
                    .verify(&self.live_path, &intent.staged_checksum)
                    .unwrap_or(false);
            if live_matches {
                info!(backup_id = %intent.target_backup_id, "[Startup] Restore was already applied, clearing descriptor");
                self.remove_sidecars();
                self.discard(None)?;
                return Ok(StartupOutcome::AlreadyApplied {
                    backup_id: intent.target_backup_id,
                });
            }
            return self.abort(
                Some(&intent),
                "staged file is missing".to_string(),
                None,
            );
        }

        // An unreadable staged file cannot be judged either way: keep the intent.
        let actual = engine.compute(&intent.staged_file_path)?;
        if !actual.eq_ignore_ascii_case(&intent.staged_checksum) {
            return self.abort(
                Some(&intent),
                format!(
                    "staged file checksum mismatch: expected {}, found {actual}",
                    intent.staged_checksum
                ),
                Some(&intent.staged_file_path),
            );
        }

        self.apply(&intent)?;

        self.discard(Some(&intent.staged_file_path))?;
        info!(backup_id = %intent.target_backup_id, "[Startup] Restore applied");
        self.record_outcome(
            IntentStatus::Applied,
            Some(&intent.target_backup_id),
            "restore applied".to_string(),
        );
        if let Some(events) = &self.events {
            events.emit(BackupEvent::RestoreApplied {
                backup_id: intent.target_backup_id.clone(),
            });
        }
        Ok(StartupOutcome::Applied {
            backup_id: intent.target_backup_id,
        })
    }

    fn apply(&self, intent: &RestoreIntent) -> Result<()> {
        let live = &self.live_path;
        if let Some(parent) = live.parent() {
            fs::create_dir_all(parent)?;
        }

        if self.engine == DataEngine::Sqlite && live.exists() {
            fold_wal(live);
        }
        if self.keep_pre_restore_copy && live.exists() {
            let safety = fsutil::with_suffix(live, PRE_RESTORE_SUFFIX);
            fsutil::copy_durable(live, &safety)?;
            info!(path = %safety.display(), "[Startup] Kept copy of replaced data");
        }

        match fs::rename(&intent.staged_file_path, live) {
            Ok(()) => {}
            Err(e) if fsutil::is_cross_device(&e) => {
                self.swap_by_copy(&intent.staged_file_path, &intent.staged_checksum)?
            }
            Err(e) => return Err(e.into()),
        }
        fsutil::sync_parent(live);

        self.remove_sidecars();
        Ok(())
    }

    fn is_staged_path(&self, path: &Path) -> bool {
        path.parent() == Some(self.staging_dir.as_path())
            && path.file_name().is_some()
            && path != self.live_path
    }

    /// WAL and shared-memory files of the replaced database must not be
    /// replayed onto the restored one.
    fn remove_sidecars(&self) {
        if self.engine != DataEngine::Sqlite {
            return;
        }
        for sidecar in SQLITE_SIDECARS {
            let path = fsutil::with_suffix(&self.live_path, sidecar);
            if let Err(e) = fsutil::remove_if_exists(&path) {
                warn!(path = %path.display(), error = %e, "[Startup] Failed to remove stale sidecar");
            }
        }
    }

    /// Staging is on another filesystem: copy beside the live file, verify,
    /// then rename over it.
    fn swap_by_copy(&self, staged: &Path, expected: &str) -> Result<()> {
        let temp = self.restore_tmp_path();
        let result = fsutil::copy_durable(staged, &temp)
            .map_err(BackupError::from)
            .and_then(|_| ChecksumEngine::new().ensure(&temp, expected))
            .and_then(|_| fs::rename(&temp, &self.live_path).map_err(BackupError::from));
        if result.is_err() {
            let _ = fsutil::remove_if_exists(&temp);
        }
        result
    }

    fn restore_tmp_path(&self) -> PathBuf {
        let name = self
            .live_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.live_path
            .with_file_name(format!(".{name}{RESTORE_TMP_SUFFIX}"))
    }

    fn sweep_restore_tmp(&self) {
        match fsutil::remove_if_exists(&self.restore_tmp_path()) {
            Ok(true) => warn!("[Startup] Removed interrupted restore copy"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "[Startup] Could not remove interrupted restore copy"),
        }
    }

    /// Give up on the restore: live data untouched, descriptor and staged data removed.
    fn abort(
        &self,
        intent: Option<&RestoreIntent>,
        reason: String,
        staged: Option<&Path>,
    ) -> Result<StartupOutcome> {
        error!(
            reason = %reason,
            "[Startup] Restore aborted; the original data is intact and unchanged"
        );
        match staged {
            Some(path) => self.discard(Some(path))?,
            None => {
                self.intent.remove()?;
                let orphans = super::clear_dir(&self.staging_dir)?;
                if orphans > 0 {
                    info!(count = orphans, "[Startup] Cleared staging area");
                }
            }
        }
        self.record_outcome(
            IntentStatus::Aborted,
            intent.map(|i| i.target_backup_id.as_str()),
            reason.clone(),
        );
        if let Some(events) = &self.events {
            events.emit(BackupEvent::RestoreAborted {
                reason: reason.clone(),
            });
        }
        Ok(StartupOutcome::Aborted { reason })
    }

    /// Remove the staged file (if given) and then the descriptor. Idempotent.
    fn discard(&self, staged: Option<&Path>) -> Result<()> {
        if let Some(path) = staged {
            fsutil::remove_if_exists(path)?;
        }
        self.intent.remove()?;
        Ok(())
    }

    fn record_outcome(&self, status: IntentStatus, backup_id: Option<&str>, message: String) {
        let outcome = RestoreOutcome {
            status,
            backup_id: backup_id.map(str::to_string),
            message,
            finished_at: Utc::now(),
        };
        let written = serde_json::to_vec_pretty(&outcome)
            .map_err(BackupError::from)
            .and_then(|json| {
                fsutil::atomic_write(&self.outcome_path(), &json).map_err(BackupError::from)
            });
        if let Err(e) = written {
            warn!(error = %e, "[Startup] Failed to persist restore outcome");
        }
    }
}

/// Fold committed WAL frames into the old live file so the safety copy is
/// complete. Sidecars are deleted after the swap either way.
fn fold_wal(live: &Path) {
    let wal = fsutil::with_suffix(live, "-wal");
    let has_frames = fs::metadata(&wal).map(|m| m.len() > 0).unwrap_or(false);
    if !has_frames {
        return;
    }
    let folded = rusqlite::Connection::open(live)
        .and_then(|conn| conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())));
    if let Err(e) = folded {
        warn!(error = %e, "[Startup] WAL checkpoint before restore failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn config(dir: &TempDir, engine: DataEngine) -> Config {
        let mut config = Config::for_data_dir(dir.path());
        config.data.engine = engine;
        config.ensure_dirs().unwrap();
        config
    }

    fn stage(config: &Config, content: &[u8]) -> RestoreIntent {
        let staged = config.restore.staging_dir.join("b1.staged");
        fs::write(&staged, content).unwrap();
        let intent = RestoreIntent {
            target_backup_id: "b1".into(),
            staged_checksum: ChecksumEngine::new().compute(&staged).unwrap(),
            staged_file_path: staged,
            requested_at: Utc::now(),
            status: IntentStatus::Pending,
        };
        IntentFile::new(&config.restore.intent_path).write(&intent).unwrap();
        intent
    }

    #[test]
    fn test_no_intent_is_a_no_op() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        fs::write(&config.data.live_path, b"live").unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();
        assert_eq!(outcome, StartupOutcome::NoIntent);
        assert!(!outcome.applied());
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"live");
    }

    #[test]
    fn test_verified_intent_is_applied() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        fs::write(&config.data.live_path, b"old data").unwrap();
        let intent = stage(&config, b"restored data");

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();

        assert!(outcome.applied());
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"restored data");
        assert!(!intent.staged_file_path.exists());
        assert!(!config.restore.intent_path.exists());
        let safety = fsutil::with_suffix(&config.data.live_path, PRE_RESTORE_SUFFIX);
        assert_eq!(fs::read(safety).unwrap(), b"old data");

        let last = RestoreOutcome::load(&RestoreOutcome::path_for(&config.restore.intent_path))
            .unwrap()
            .unwrap();
        assert_eq!(last.status, IntentStatus::Applied);
        assert_eq!(last.backup_id.as_deref(), Some("b1"));
    }

    #[test]
    fn test_tampered_staged_file_aborts() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        fs::write(&config.data.live_path, b"original").unwrap();
        let intent = stage(&config, b"restored data");
        fs::write(&intent.staged_file_path, b"restored dat4").unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();

        assert!(matches!(outcome, StartupOutcome::Aborted { .. }));
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"original");
        assert!(!intent.staged_file_path.exists());
        assert!(!config.restore.intent_path.exists());
    }

    #[test]
    fn test_corrupt_descriptor_is_discarded() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        fs::write(&config.data.live_path, b"original").unwrap();
        fs::write(&config.restore.intent_path, b"{\"targetBack").unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();

        assert!(matches!(outcome, StartupOutcome::Aborted { .. }));
        assert!(!config.restore.intent_path.exists());
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"original");
    }

    #[test]
    fn test_crash_after_swap_is_recognised() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        let intent = stage(&config, b"restored data");
        // Simulate a crash right after the rename.
        fs::rename(&intent.staged_file_path, &config.data.live_path).unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();

        assert_eq!(
            outcome,
            StartupOutcome::AlreadyApplied {
                backup_id: "b1".into()
            }
        );
        assert!(outcome.applied());
        assert!(!config.restore.intent_path.exists());
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"restored data");
    }

    #[test]
    fn test_missing_staged_file_aborts_when_live_differs() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        fs::write(&config.data.live_path, b"original").unwrap();
        let intent = stage(&config, b"restored data");
        fs::remove_file(&intent.staged_file_path).unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();
        assert!(matches!(outcome, StartupOutcome::Aborted { .. }));
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"original");
    }

    #[test]
    fn test_half_written_descriptor_is_ignored() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        fs::write(&config.data.live_path, b"original").unwrap();
        let file = IntentFile::new(&config.restore.intent_path);
        fs::write(file.temp_path(), b"{\"targ").unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();
        assert_eq!(outcome, StartupOutcome::NoIntent);
        assert!(!file.temp_path().exists());
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"original");
    }

    #[test]
    fn test_sqlite_sidecars_removed_after_swap() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::Sqlite);
        {
            let conn = rusqlite::Connection::open(&config.data.live_path).unwrap();
            conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('old');")
                .unwrap();
        }
        let replacement = dir.path().join("replacement.db");
        {
            let conn = rusqlite::Connection::open(&replacement).unwrap();
            conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('new');")
                .unwrap();
        }
        stage(&config, &fs::read(&replacement).unwrap());
        let shm = fsutil::with_suffix(&config.data.live_path, "-shm");
        fs::write(&shm, b"stale").unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();
        assert!(outcome.applied());
        assert!(!shm.exists());

        let conn = rusqlite::Connection::open(&config.data.live_path).unwrap();
        let v: String = conn.query_row("SELECT v FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(v, "new");
    }

    #[test]
    fn test_descriptor_naming_live_file_is_refused() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        fs::write(&config.data.live_path, b"original").unwrap();
        let intent = RestoreIntent {
            target_backup_id: "b1".into(),
            staged_file_path: config.data.live_path.clone(),
            staged_checksum: ChecksumEngine::new().compute(&config.data.live_path).unwrap(),
            requested_at: Utc::now(),
            status: IntentStatus::Pending,
        };
        IntentFile::new(&config.restore.intent_path).write(&intent).unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();

        assert!(matches!(outcome, StartupOutcome::Aborted { .. }));
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"original");
        assert!(!config.restore.intent_path.exists());
    }

    #[test]
    fn test_stale_descriptor_never_deletes_outside_staging() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::File);
        let elsewhere = dir.path().join("keep-me.db");
        fs::write(&elsewhere, b"unrelated").unwrap();
        for status in [IntentStatus::Applied, IntentStatus::Pending] {
            let intent = RestoreIntent {
                target_backup_id: "b1".into(),
                staged_file_path: config.restore.staging_dir.join("..").join("keep-me.db"),
                staged_checksum: "00".repeat(32),
                requested_at: Utc::now(),
                status,
            };
            IntentFile::new(&config.restore.intent_path).write(&intent).unwrap();

            let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();

            assert!(matches!(outcome, StartupOutcome::Aborted { .. }));
            assert_eq!(fs::read(&elsewhere).unwrap(), b"unrelated");
            assert!(!config.restore.intent_path.exists());
        }
    }

    #[test]
    fn test_already_applied_clears_sqlite_sidecars() {
        let dir = tempdir().unwrap();
        let config = config(&dir, DataEngine::Sqlite);
        let intent = stage(&config, b"restored pages");
        fs::rename(&intent.staged_file_path, &config.data.live_path).unwrap();
        let wal = fsutil::with_suffix(&config.data.live_path, "-wal");
        let shm = fsutil::with_suffix(&config.data.live_path, "-shm");
        fs::write(&wal, b"frames of the replaced database").unwrap();
        fs::write(&shm, b"stale").unwrap();

        let outcome = StartupRestoreProcessor::new(&config).process_pending_restore().unwrap();

        assert!(matches!(outcome, StartupOutcome::AlreadyApplied { .. }));
        assert!(!wal.exists());
        assert!(!shm.exists());
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"restored pages");
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(StartupOutcome::Applied {
            backup_id: "b1".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "applied");
        assert_eq!(json["backupId"], "b1");
    }
}
