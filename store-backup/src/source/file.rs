use std::path::{Path, PathBuf};

use super::DataSource;
use crate::utils::{fsutil, BackupError, Result};

/// Plain file copy. Consistent only while nothing writes to the file.
pub struct FileSource {
    live_path: PathBuf,
}

impl FileSource {
    pub fn new(live_path: impl Into<PathBuf>) -> Self {
        Self {
            live_path: live_path.into(),
        }
    }
}

impl DataSource for FileSource {
    fn live_path(&self) -> &Path {
        &self.live_path
    }

    fn snapshot_to(&self, dest: &Path) -> Result<u64> {
        if !self.live_path.exists() {
            return Err(BackupError::NotFound(format!(
                "live data file {}",
                self.live_path.display()
            )));
        }
        Ok(fsutil::copy_durable(&self.live_path, dest)?)
    }
}
