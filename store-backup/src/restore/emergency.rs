//! Operator escape hatch: drop all restore state unconditionally.

use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use super::intent::IntentFile;
use crate::config::Config;
use crate::events::{BackupEvent, EventBus};
use crate::utils::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub descriptor_removed: bool,
    pub temp_descriptor_removed: bool,
    pub staging_entries_removed: usize,
}

impl ClearReport {
    pub fn is_noop(&self) -> bool {
        !self.descriptor_removed && !self.temp_descriptor_removed && self.staging_entries_removed == 0
    }
}

/// Removes the intent descriptor and staging contents without validating
/// them. Never touches the live data file or the backup archive.
pub struct EmergencyCleanup {
    intent: IntentFile,
    staging_dir: PathBuf,
    events: Option<EventBus>,
}

impl EmergencyCleanup {
    pub fn new(config: &Config) -> Self {
        Self {
            intent: IntentFile::new(&config.restore.intent_path),
            staging_dir: config.restore.staging_dir.clone(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Idempotent: on a clean state this removes nothing and succeeds.
    pub fn force_clear(&self) -> Result<ClearReport> {
        warn!(path = %self.intent.path().display(), "[Emergency] Force-clearing restore state");

        let temp_descriptor_removed = self.intent.sweep_temp()?;
        let descriptor_removed = self.intent.remove()?;
        let staging_entries_removed = super::clear_dir(&self.staging_dir)?;

        let report = ClearReport {
            descriptor_removed,
            temp_descriptor_removed,
            staging_entries_removed,
        };
        info!(
            descriptor_removed,
            staging_entries_removed,
            "[Emergency] Restore state cleared"
        );
        if let Some(events) = &self.events {
            events.emit(BackupEvent::RestoreCleared {
                descriptor_removed,
                staging_entries_removed,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_force_clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let config = Config::for_data_dir(dir.path());
        config.ensure_dirs().unwrap();
        fs::write(&config.data.live_path, b"live").unwrap();
        fs::write(&config.restore.intent_path, b"garbage").unwrap();
        fs::write(config.restore.staging_dir.join("x.staged"), b"x").unwrap();
        fs::create_dir_all(config.restore.staging_dir.join("nested")).unwrap();

        let cleanup = EmergencyCleanup::new(&config);
        let first = cleanup.force_clear().unwrap();
        assert!(first.descriptor_removed);
        assert_eq!(first.staging_entries_removed, 2);

        let second = cleanup.force_clear().unwrap();
        assert!(second.is_noop());

        assert!(config.restore.staging_dir.exists());
        assert_eq!(fs::read(&config.data.live_path).unwrap(), b"live");
    }

    #[test]
    fn test_force_clear_without_any_state() {
        let dir = tempdir().unwrap();
        let config = Config::for_data_dir(dir.path());
        let report = EmergencyCleanup::new(&config).force_clear().unwrap();
        assert!(report.is_noop());
    }
}
