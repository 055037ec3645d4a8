//! Backup catalog: artifact records, attempt log, retention and health.
//!
//! Records live in a SQLite catalog inside the backup directory. The catalog
//! is never part of a backup and never touched by a restore.

pub mod attempts;
pub mod connection;
pub mod migrate;
pub mod record;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::restore::intent::IntentFile;
use crate::utils::{fsutil, BackupError, Result};

pub use attempts::{AttemptStatus, BackupAttempt};
pub use connection::DbPool;
pub use record::{BackupRecord, BackupStatus, BackupTrigger};

pub const CATALOG_FILE: &str = "catalog.db";

/// How many finished attempts are inspected when counting a failure streak.
const ATTEMPT_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHealth {
    pub status: HealthStatus,
    pub last_backup_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub pending_uploads: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Expected time between backups; overdue after twice this
    pub expected_interval: Duration,
    /// Consecutive failed attempts that make health `failing`
    pub failure_threshold: u32,
    pub max_upload_attempts: u32,
}

impl HealthPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            expected_interval: config.schedule.interval(),
            failure_threshold: config.backup.failure_threshold,
            max_upload_attempts: config.backup.max_upload_attempts,
        }
    }
}

pub struct BackupStore {
    pool: DbPool,
    intent: IntentFile,
    policy: HealthPolicy,
}

impl BackupStore {
    pub fn open(catalog_path: &Path, intent: IntentFile, policy: HealthPolicy) -> Result<Self> {
        if let Some(parent) = catalog_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = connection::create_pool(catalog_path, 4)?;
        migrate::migrate(&pool)?;
        Ok(Self {
            pool,
            intent,
            policy,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            &Self::catalog_path(&config.backup.dir),
            IntentFile::new(&config.restore.intent_path),
            HealthPolicy::from_config(config),
        )
    }

    pub fn catalog_path(backup_dir: &Path) -> PathBuf {
        backup_dir.join(CATALOG_FILE)
    }

    /// Append a record. Ids are unique; a second insert of the same id fails.
    pub fn record_created(&self, rec: &BackupRecord) -> Result<()> {
        let conn = self.pool.get()?;
        if record::find_by_id(&conn, &rec.id)?.is_some() {
            return Err(BackupError::DuplicateRecord(rec.id.clone()));
        }
        record::insert(&conn, rec)?;
        tracing::debug!(backup_id = %rec.id, "[Catalog] Record created");
        Ok(())
    }

    /// Records, most recent first.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<BackupRecord>> {
        let conn = self.pool.get()?;
        Ok(record::find_all(&conn, limit)?)
    }

    pub fn get(&self, id: &str) -> Result<BackupRecord> {
        let conn = self.pool.get()?;
        record::find_by_id(&conn, id)?
            .ok_or_else(|| BackupError::NotFound(format!("backup {id}")))
    }

    pub fn latest_complete(&self) -> Result<Option<BackupRecord>> {
        let conn = self.pool.get()?;
        Ok(record::find_latest_complete(&conn)?)
    }

    /// Delete complete records (and their artifacts) beyond the newest
    /// `retention_count`. A record targeted by a pending restore is kept.
    /// Returns the ids removed.
    pub fn prune(&self, retention_count: usize) -> Result<Vec<String>> {
        // Without a readable descriptor we cannot tell what is protected.
        let protected = self.intent.pending()?.map(|i| i.target_backup_id);

        let conn = self.pool.get()?;
        let records = record::find_complete(&conn)?;
        let mut removed = Vec::new();

        for old in records.into_iter().skip(retention_count) {
            if protected.as_deref() == Some(old.id.as_str()) {
                tracing::info!(backup_id = %old.id, "[Retention] Keeping backup referenced by pending restore");
                continue;
            }
            record::delete(&conn, &old.id)?;
            match fsutil::remove_if_exists(&old.local_path) {
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    backup_id = %old.id,
                    path = %old.local_path.display(),
                    error = %e,
                    "[Retention] Failed to remove artifact"
                ),
            }
            tracing::info!(backup_id = %old.id, "[Retention] Removed old backup");
            removed.push(old.id);
        }

        // The attempt log only needs to reach back as far as the oldest kept backup.
        if let Some(oldest) = record::find_complete(&conn)?.last() {
            let trimmed = attempts::delete_finished_before(&conn, &oldest.created_at)?;
            if trimmed > 0 {
                tracing::debug!(count = trimmed, "[Retention] Trimmed attempt log");
            }
        }

        Ok(removed)
    }

    pub fn health(&self) -> Result<BackupHealth> {
        self.health_at(Utc::now())
    }

    pub fn health_at(&self, now: DateTime<Utc>) -> Result<BackupHealth> {
        let conn = self.pool.get()?;
        let recent = attempts::find_recent_finished(&conn, ATTEMPT_WINDOW)?;
        let latest = record::find_latest_complete(&conn)?;
        let pending_uploads =
            record::find_pending_uploads(&conn, self.policy.max_upload_attempts)?.len();

        let consecutive_failures = recent
            .iter()
            .take_while(|a| a.status == AttemptStatus::Failed)
            .count() as u32;
        let last_error = recent
            .first()
            .filter(|a| a.status == AttemptStatus::Failed)
            .and_then(|a| a.error.clone());

        let threshold = self.policy.failure_threshold;
        let overdue_after = chrono::Duration::from_std(self.policy.expected_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));

        let status = if threshold > 0 && consecutive_failures >= threshold {
            HealthStatus::Failing
        } else {
            match &latest {
                Some(rec) if now.signed_duration_since(rec.created_at) <= overdue_after => {
                    HealthStatus::Healthy
                }
                _ => HealthStatus::Degraded,
            }
        };

        Ok(BackupHealth {
            status,
            last_backup_at: latest.map(|r| r.created_at),
            last_error,
            consecutive_failures,
            pending_uploads,
        })
    }

    pub fn begin_attempt(&self, id: &str, trigger: BackupTrigger) -> Result<()> {
        let conn = self.pool.get()?;
        Ok(attempts::begin(&conn, id, trigger)?)
    }

    pub fn complete_attempt(&self, id: &str, record_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        Ok(attempts::complete(&conn, id, record_id)?)
    }

    pub fn fail_attempt(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.pool.get()?;
        Ok(attempts::fail(&conn, id, error)?)
    }

    /// Mark attempts left `running` by a process that died as failed.
    pub fn fail_running_attempts(&self, error: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        Ok(attempts::fail_running(&conn, error)?)
    }

    pub fn pending_uploads(&self) -> Result<Vec<BackupRecord>> {
        let conn = self.pool.get()?;
        Ok(record::find_pending_uploads(&conn, self.policy.max_upload_attempts)?)
    }

    pub fn mark_uploaded(&self, id: &str, remote_ref: &str) -> Result<()> {
        let conn = self.pool.get()?;
        Ok(record::update_uploaded(&conn, id, remote_ref)?)
    }

    pub fn mark_upload_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.pool.get()?;
        Ok(record::update_upload_failed(&conn, id, error)?)
    }

    pub fn close(&self) {
        connection::close_pool(&self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::intent::{IntentStatus, RestoreIntent};
    use tempfile::{tempdir, TempDir};

    fn policy() -> HealthPolicy {
        HealthPolicy {
            expected_interval: Duration::from_secs(3600),
            failure_threshold: 3,
            max_upload_attempts: 5,
        }
    }

    fn open_store(dir: &TempDir) -> BackupStore {
        BackupStore::open(
            &dir.path().join("backups").join(CATALOG_FILE),
            IntentFile::new(dir.path().join("restore-intent.json")),
            policy(),
        )
        .unwrap()
    }

    fn record(dir: &TempDir, id: &str, minutes_ago: i64) -> BackupRecord {
        let path = dir.path().join("backups").join(format!("{id}.db"));
        std::fs::write(&path, id.as_bytes()).unwrap();
        BackupRecord {
            id: id.to_string(),
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
            size_bytes: id.len() as u64,
            checksum: "00".repeat(32),
            local_path: path,
            remote_ref: None,
            trigger: BackupTrigger::Manual,
            status: BackupStatus::Complete,
            upload_error: None,
            upload_attempts: 0,
        }
    }

    #[test]
    fn test_list_most_recent_first() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.record_created(&record(&dir, "old", 30)).unwrap();
        store.record_created(&record(&dir, "new", 1)).unwrap();
        store.record_created(&record(&dir, "mid", 10)).unwrap();

        let ids: Vec<_> = store.list(None).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        assert_eq!(store.list(Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let rec = record(&dir, "dup", 1);
        store.record_created(&rec).unwrap();
        assert!(matches!(
            store.record_created(&rec),
            Err(BackupError::DuplicateRecord(_))
        ));
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(matches!(store.get("nope"), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn test_prune_keeps_newest_and_deletes_files() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let mut paths = Vec::new();
        for (i, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let rec = record(&dir, id, 50 - i as i64 * 10);
            paths.push(rec.local_path.clone());
            store.record_created(&rec).unwrap();
        }

        let mut removed = store.prune(2).unwrap();
        removed.sort();
        assert_eq!(removed, vec!["a", "b", "c"]);

        let ids: Vec<_> = store.list(None).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["e", "d"]);
        assert!(!paths[0].exists());
        assert!(paths[4].exists());
    }

    #[test]
    fn test_prune_trims_attempt_log() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            store.record_created(&record(&dir, id, 30 - i as i64 * 10)).unwrap();
        }
        let conn = store.pool.get().unwrap();
        let attempt_at = |id: &str, minutes_ago: i64, status: &str| {
            conn.execute(
                "INSERT INTO backup_attempts (id, trigger, started_at, status) VALUES (?1, 'scheduled', ?2, ?3)",
                rusqlite::params![
                    id,
                    record::format_ts(&(Utc::now() - chrono::Duration::minutes(minutes_ago))),
                    status
                ],
            )
            .unwrap();
        };
        attempt_at("before-a", 40, "failed");
        attempt_at("for-a", 30, "complete");
        attempt_at("for-b", 20, "complete");
        attempt_at("for-c", 10, "complete");
        attempt_at("stuck", 45, "running");

        store.prune(2).unwrap();

        let mut left: Vec<String> = conn
            .prepare("SELECT id FROM backup_attempts")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        left.sort();
        assert_eq!(left, vec!["for-b", "for-c", "stuck"]);
    }

    #[test]
    fn test_fail_running_attempts() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.begin_attempt("killed", BackupTrigger::Scheduled).unwrap();

        assert_eq!(store.fail_running_attempts("interrupted").unwrap(), 1);
        assert_eq!(store.fail_running_attempts("interrupted").unwrap(), 0);
        let health = store.health().unwrap();
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.last_error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_prune_spares_pending_restore_target() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            store.record_created(&record(&dir, id, 30 - i as i64 * 10)).unwrap();
        }
        IntentFile::new(dir.path().join("restore-intent.json"))
            .write(&RestoreIntent {
                target_backup_id: "a".into(),
                staged_file_path: dir.path().join("staged"),
                staged_checksum: "00".repeat(32),
                requested_at: Utc::now(),
                status: IntentStatus::Pending,
            })
            .unwrap();

        let removed = store.prune(1).unwrap();
        assert_eq!(removed, vec!["b"]);
        assert!(store.get("a").is_ok());
    }

    #[test]
    fn test_health_transitions() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        assert_eq!(store.health().unwrap().status, HealthStatus::Degraded);

        store.record_created(&record(&dir, "fresh", 5)).unwrap();
        let health = store.health().unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.last_backup_at.is_some());

        let later = Utc::now() + chrono::Duration::hours(3);
        assert_eq!(store.health_at(later).unwrap().status, HealthStatus::Degraded);

        for i in 0..3 {
            let id = format!("attempt-{i}");
            store.begin_attempt(&id, BackupTrigger::Scheduled).unwrap();
            store.fail_attempt(&id, "disk full").unwrap();
        }
        let health = store.health().unwrap();
        assert_eq!(health.status, HealthStatus::Failing);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.last_error.as_deref(), Some("disk full"));

        store.begin_attempt("ok", BackupTrigger::Manual).unwrap();
        store.complete_attempt("ok", "fresh").unwrap();
        let health = store.health().unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.last_error.is_none());
    }

    #[test]
    fn test_upload_bookkeeping() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let mut rec = record(&dir, "up", 1);
        rec.upload_error = Some("offline".into());
        store.record_created(&rec).unwrap();

        assert_eq!(store.pending_uploads().unwrap().len(), 1);
        assert_eq!(store.health().unwrap().pending_uploads, 1);

        store.mark_uploaded("up", "remote://up").unwrap();
        assert!(store.pending_uploads().unwrap().is_empty());
        assert_eq!(store.get("up").unwrap().remote_ref.as_deref(), Some("remote://up"));
    }
}
