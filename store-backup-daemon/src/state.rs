use chrono::{DateTime, Utc};
use store_backup::{BackupSystem, StartupOutcome};

pub struct AppState {
    pub system: BackupSystem,
    /// What the restore check did when this process started
    pub startup: StartupOutcome,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(system: BackupSystem, startup: StartupOutcome) -> Self {
        Self {
            system,
            startup,
            started_at: Utc::now(),
        }
    }
}
