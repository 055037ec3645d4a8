//! SQLite engine. Copies go through the online backup API, so the
//! application may keep its connections open while a snapshot is taken.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::DataSource;
use crate::utils::{BackupError, Result};

const PAGES_PER_STEP: i32 = 100;
const STEP_PAUSE: Duration = Duration::from_millis(10);

pub struct SqliteSource {
    live_path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
}

fn engine_err(e: rusqlite::Error) -> BackupError {
    BackupError::DataSource(e.to_string())
}

impl SqliteSource {
    /// Open a small pool on an existing live database.
    pub fn open(live_path: PathBuf) -> Result<Self> {
        if !live_path.exists() {
            return Err(BackupError::NotFound(format!(
                "live database {}",
                live_path.display()
            )));
        }
        let manager = SqliteConnectionManager::file(&live_path)
            .with_init(|c| c.execute_batch("PRAGMA busy_timeout = 10000;"));
        let pool = Pool::builder().max_size(2).build(manager)?;
        Ok(Self { live_path, pool })
    }
}

impl DataSource for SqliteSource {
    fn live_path(&self) -> &Path {
        &self.live_path
    }

    fn snapshot_to(&self, dest: &Path) -> Result<u64> {
        let conn = self.pool.get()?;

        // Fold committed WAL frames first; the backup API is consistent either way.
        if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(())) {
            tracing::warn!(error = %e, "[Snapshot] WAL checkpoint failed, continuing");
        }

        let mut dst = Connection::open(dest).map_err(engine_err)?;
        {
            let backup = Backup::new(&conn, &mut dst).map_err(engine_err)?;
            backup
                .run_to_completion(PAGES_PER_STEP, STEP_PAUSE, None)
                .map_err(engine_err)?;
        }
        // Artifacts must be self-contained single files.
        dst.query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))
            .map_err(engine_err)?;

        let page_size: i64 = dst
            .query_row("PRAGMA page_size", [], |r| r.get(0))
            .map_err(engine_err)?;
        let page_count: i64 = dst
            .query_row("PRAGMA page_count", [], |r| r.get(0))
            .map_err(engine_err)?;
        dst.close().map_err(|(_, e)| engine_err(e))?;

        Ok((page_size * page_count) as u64)
    }

    fn validate_snapshot(&self, path: &Path) -> Result<()> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(engine_err)?;
        let verdict: String = conn
            .query_row("PRAGMA quick_check", [], |r| r.get(0))
            .map_err(|e| BackupError::SnapshotInvalid(e.to_string()))?;
        if verdict != "ok" {
            return Err(BackupError::SnapshotInvalid(verdict));
        }
        Ok(())
    }

    fn close(&self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed(path: &Path, rows: i64) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        )
        .unwrap();
        for i in 0..rows {
            conn.execute("INSERT INTO items (name) VALUES (?1)", [format!("item-{i}")])
                .unwrap();
        }
    }

    #[test]
    fn test_snapshot_contains_committed_rows() -> Result<()> {
        let dir = tempdir()?;
        let live = dir.path().join("store.db");
        seed(&live, 50);

        let source = SqliteSource::open(live)?;
        let dest = dir.path().join("snap.db");
        let reported = source.snapshot_to(&dest)?;

        assert_eq!(reported, std::fs::metadata(&dest)?.len());
        source.validate_snapshot(&dest)?;

        let copy = Connection::open(&dest).unwrap();
        let count: i64 = copy
            .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 50);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_garbage() -> Result<()> {
        let dir = tempdir()?;
        let live = dir.path().join("store.db");
        seed(&live, 1);
        let source = SqliteSource::open(live)?;

        let junk = dir.path().join("junk.db");
        std::fs::write(&junk, vec![0xAB; 8192])?;
        assert!(source.validate_snapshot(&junk).is_err());
        Ok(())
    }

    #[test]
    fn test_open_requires_existing_database() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            SqliteSource::open(dir.path().join("missing.db")),
            Err(BackupError::NotFound(_))
        ));
    }
}
