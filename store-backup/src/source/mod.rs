//! The data engine collaborator: where consistent copies of live data come from.

pub mod file;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, DataEngine};
use crate::utils::Result;

pub use file::FileSource;
pub use sqlite::SqliteSource;

/// A source of byte-for-byte consistent copies of the live data file.
pub trait DataSource: Send + Sync {
    /// Path of the live data file.
    fn live_path(&self) -> &Path;

    /// Write a point-in-time consistent copy of the live data to `dest`
    /// (which does not exist yet). Returns the number of bytes the engine
    /// reports having written.
    fn snapshot_to(&self, dest: &Path) -> Result<u64>;

    /// Engine-level sanity check of a finished copy.
    fn validate_snapshot(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    /// Release engine handles before shutdown.
    fn close(&self) {}
}

/// Open the configured engine on the live data path.
pub fn open(config: &Config) -> Result<Arc<dyn DataSource>> {
    let live = config.data.live_path.clone();
    Ok(match config.data.engine {
        DataEngine::Sqlite => Arc::new(SqliteSource::open(live)?),
        DataEngine::File => Arc::new(FileSource::new(live)),
    })
}
