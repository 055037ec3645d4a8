//! Read-only report on backup and restore state, for debugging stuck restores.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use walkdir::WalkDir;

use super::intent::{IntentFile, IntentStatus};
use super::startup::RestoreOutcome;
use crate::catalog::{BackupHealth, BackupStore, HealthStatus};
use crate::checksum::ChecksumEngine;
use crate::config::Config;
use crate::utils::BackupError;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum IntentState {
    Absent,
    #[serde(rename_all = "camelCase")]
    Present {
        target_backup_id: String,
        status: IntentStatus,
        requested_at: DateTime<Utc>,
        age_secs: i64,
        staged_file_path: PathBuf,
        staged_file_exists: bool,
        /// `None` when the staged file is missing or unreadable
        staged_checksum_matches: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        staged_read_error: Option<String>,
    },
    Corrupt { reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Utc>,
    pub intent_path: PathBuf,
    pub intent: IntentState,
    pub temp_descriptor_present: bool,
    pub staging_dir: PathBuf,
    pub staging_entries: Vec<StagingEntry>,
    pub live_path: PathBuf,
    pub live_file_exists: bool,
    pub health: Option<BackupHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_error: Option<String>,
    pub last_restore: Option<RestoreOutcome>,
    pub recommendation: String,
}

/// Inspects restore state without changing anything. The catalog is
/// optional so a report can be produced even when it cannot be opened.
pub struct DiagnosticsReporter {
    intent: IntentFile,
    staging_dir: PathBuf,
    live_path: PathBuf,
    store: Option<Arc<BackupStore>>,
}

impl DiagnosticsReporter {
    pub fn new(config: &Config, store: Option<Arc<BackupStore>>) -> Self {
        Self {
            intent: IntentFile::new(&config.restore.intent_path),
            staging_dir: config.restore.staging_dir.clone(),
            live_path: config.data.live_path.clone(),
            store,
        }
    }

    pub fn report(&self) -> DiagnosticReport {
        let now = Utc::now();
        let intent = self.inspect_intent(now);

        let staging_entries = WalkDir::new(&self.staging_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| StagingEntry {
                size_bytes: e.metadata().map(|m| m.len()).unwrap_or(0),
                path: e.into_path(),
            })
            .collect();

        let (health, health_error) = match &self.store {
            Some(store) => match store.health() {
                Ok(h) => (Some(h), None),
                Err(e) => (None, Some(e.to_string())),
            },
            None => (None, Some("backup catalog unavailable".to_string())),
        };

        let last_restore = RestoreOutcome::load(&RestoreOutcome::path_for(self.intent.path()))
            .ok()
            .flatten();

        let mut report = DiagnosticReport {
            generated_at: now,
            intent_path: self.intent.path().to_path_buf(),
            intent,
            temp_descriptor_present: self.intent.temp_path().exists(),
            staging_dir: self.staging_dir.clone(),
            staging_entries,
            live_path: self.live_path.clone(),
            live_file_exists: self.live_path.exists(),
            health,
            health_error,
            last_restore,
            recommendation: String::new(),
        };
        report.recommendation = recommend(&report);
        report
    }

    fn inspect_intent(&self, now: DateTime<Utc>) -> IntentState {
        let intent = match self.intent.load() {
            Ok(None) => return IntentState::Absent,
            Ok(Some(intent)) => intent,
            Err(BackupError::IntentCorrupt { reason, .. }) => return IntentState::Corrupt { reason },
            Err(e) => return IntentState::Corrupt { reason: e.to_string() },
        };

        let staged_file_exists = intent.staged_file_path.exists();
        let (staged_checksum_matches, staged_read_error) = if staged_file_exists {
            match ChecksumEngine::new().verify(&intent.staged_file_path, &intent.staged_checksum) {
                Ok(matches) => (Some(matches), None),
                Err(e) => (None, Some(e.to_string())),
            }
        } else {
            (None, None)
        };

        IntentState::Present {
            age_secs: now.signed_duration_since(intent.requested_at).num_seconds(),
            target_backup_id: intent.target_backup_id,
            status: intent.status,
            requested_at: intent.requested_at,
            staged_file_path: intent.staged_file_path,
            staged_file_exists,
            staged_checksum_matches,
            staged_read_error,
        }
    }
}

fn recommend(report: &DiagnosticReport) -> String {
    match &report.intent {
        IntentState::Corrupt { .. } => {
            "Restore descriptor is unreadable. It will be discarded at next startup; \
             run `restore emergency-clear` to remove it now."
                .into()
        }
        IntentState::Present {
            status: IntentStatus::Pending,
            staged_file_exists: true,
            staged_checksum_matches: Some(true),
            ..
        } => "A verified restore is pending and will be applied at next startup.".into(),
        IntentState::Present {
            staged_read_error: Some(_),
            ..
        } => "Staged file cannot be read, so startup cannot resolve this restore. \
              Run `restore emergency-clear`."
            .into(),
        IntentState::Present {
            staged_checksum_matches: Some(false),
            ..
        } => "Staged file is corrupt. The restore will be aborted at next startup and \
              live data kept."
            .into(),
        IntentState::Present {
            staged_file_exists: false,
            ..
        } => "Staged file is missing. Startup will abort the restore unless the live data \
              already matches it."
            .into(),
        IntentState::Present { .. } => {
            "A stale restore descriptor remains; it will be removed at next startup.".into()
        }
        IntentState::Absent if !report.staging_entries.is_empty() => {
            "Orphaned files in the staging area; run `restore emergency-clear`.".into()
        }
        IntentState::Absent => match &report.health {
            Some(h) if h.status == HealthStatus::Failing => format!(
                "Backups are failing: {}",
                h.last_error.as_deref().unwrap_or("unknown error")
            ),
            Some(h) if h.status == HealthStatus::Degraded => {
                "No recent backup. Run `backup create`.".into()
            }
            Some(_) => "No action needed.".into(),
            None => "Backup catalog could not be read.".into(),
        },
    }
}

fn fmt_opt<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Restore diagnostics ({})", self.generated_at.to_rfc3339())?;
        writeln!(f, "  descriptor:   {}", self.intent_path.display())?;
        match &self.intent {
            IntentState::Absent => writeln!(f, "    none")?,
            IntentState::Corrupt { reason } => writeln!(f, "    CORRUPT: {reason}")?,
            IntentState::Present {
                target_backup_id,
                status,
                age_secs,
                staged_file_path,
                staged_file_exists,
                staged_checksum_matches,
                staged_read_error,
                ..
            } => {
                writeln!(f, "    backup:     {target_backup_id} ({status}, {age_secs}s old)")?;
                writeln!(f, "    staged:     {}", staged_file_path.display())?;
                writeln!(f, "    exists:     {staged_file_exists}")?;
                writeln!(f, "    checksum:   {}", match staged_checksum_matches {
                    Some(true) => "ok",
                    Some(false) => "MISMATCH",
                    None => "-",
                })?;
                if let Some(err) = staged_read_error {
                    writeln!(f, "    read error: {err}")?;
                }
            }
        }
        if self.temp_descriptor_present {
            writeln!(f, "    (half-written temp descriptor present)")?;
        }
        writeln!(
            f,
            "  staging:      {} ({} files)",
            self.staging_dir.display(),
            self.staging_entries.len()
        )?;
        for entry in &self.staging_entries {
            writeln!(f, "    {} ({} bytes)", entry.path.display(), entry.size_bytes)?;
        }
        writeln!(
            f,
            "  live data:    {} ({})",
            self.live_path.display(),
            if self.live_file_exists { "present" } else { "missing" }
        )?;
        match &self.health {
            Some(h) => writeln!(
                f,
                "  health:       {:?}, last backup {}, {} consecutive failures",
                h.status,
                fmt_opt(&h.last_backup_at.map(|t| t.to_rfc3339())),
                h.consecutive_failures
            )?,
            None => writeln!(f, "  health:       {}", fmt_opt(&self.health_error))?,
        }
        if let Some(last) = &self.last_restore {
            writeln!(
                f,
                "  last restore: {} at {} ({})",
                last.status,
                last.finished_at.to_rfc3339(),
                last.message
            )?;
        }
        write!(f, "  => {}", self.recommendation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::intent::RestoreIntent;
    use tempfile::tempdir;

    #[test]
    fn test_clean_state_report() {
        let dir = tempdir().unwrap();
        let config = Config::for_data_dir(dir.path());
        config.ensure_dirs().unwrap();
        let store = Arc::new(BackupStore::from_config(&config).unwrap());

        let report = DiagnosticsReporter::new(&config, Some(store)).report();

        assert!(matches!(report.intent, IntentState::Absent));
        assert!(report.staging_entries.is_empty());
        assert_eq!(report.health.unwrap().status, HealthStatus::Degraded);
        assert!(report.recommendation.contains("backup create"));
    }

    #[test]
    fn test_report_flags_tampered_staged_file_without_mutating() {
        let dir = tempdir().unwrap();
        let config = Config::for_data_dir(dir.path());
        config.ensure_dirs().unwrap();
        let staged = config.restore.staging_dir.join("b1.staged");
        std::fs::write(&staged, b"tampered").unwrap();
        let intent = RestoreIntent {
            target_backup_id: "b1".into(),
            staged_file_path: staged.clone(),
            staged_checksum: "00".repeat(32),
            requested_at: Utc::now(),
            status: IntentStatus::Pending,
        };
        IntentFile::new(&config.restore.intent_path).write(&intent).unwrap();

        let report = DiagnosticsReporter::new(&config, None).report();

        match &report.intent {
            IntentState::Present {
                staged_checksum_matches,
                staged_file_exists,
                ..
            } => {
                assert!(staged_file_exists);
                assert_eq!(*staged_checksum_matches, Some(false));
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(report.staging_entries.len(), 1);
        assert!(report.recommendation.contains("corrupt"));
        assert!(staged.exists());
        assert!(config.restore.intent_path.exists());

        let text = report.to_string();
        assert!(text.contains("MISMATCH"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["intent"]["state"], "present");
        assert_eq!(json["intent"]["targetBackupId"], "b1");
    }

    #[test]
    fn test_corrupt_descriptor_reported() {
        let dir = tempdir().unwrap();
        let config = Config::for_data_dir(dir.path());
        config.ensure_dirs().unwrap();
        std::fs::write(&config.restore.intent_path, b"not json").unwrap();

        let report = DiagnosticsReporter::new(&config, None).report();
        assert!(matches!(report.intent, IntentState::Corrupt { .. }));
        assert!(report.recommendation.contains("emergency-clear"));
    }
}
