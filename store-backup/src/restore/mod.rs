//! Staged restores: prepare now, apply at the next startup.
//!
//! The live data file is only ever replaced by [`StartupRestoreProcessor`],
//! before anything opens it. Everything else reads or clears restore state.

pub mod coordinator;
pub mod diagnostics;
pub mod emergency;
pub mod intent;
pub mod startup;

use std::fs;
use std::io;
use std::path::Path;

pub use coordinator::RestoreCoordinator;
pub use diagnostics::{DiagnosticReport, DiagnosticsReporter, IntentState};
pub use emergency::{ClearReport, EmergencyCleanup};
pub use intent::{IntentFile, IntentStatus, RestoreIntent};
pub use startup::{RestoreOutcome, StartupOutcome, StartupRestoreProcessor};

/// Outcome file kept beside the intent descriptor.
pub const LAST_RESTORE_FILE: &str = "last-restore.json";

/// Remove every entry inside `dir`, keeping the directory. Missing dir is empty.
pub(crate) fn clear_dir(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}
