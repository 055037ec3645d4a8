use super::connection::DbPool;
use crate::utils::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
  id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  size_bytes INTEGER NOT NULL,
  checksum TEXT NOT NULL,
  local_path TEXT NOT NULL,
  remote_ref TEXT,
  trigger TEXT NOT NULL CHECK(trigger IN ('manual','scheduled')),
  status TEXT NOT NULL DEFAULT 'complete' CHECK(status IN ('complete','failed')),
  upload_error TEXT,
  upload_attempts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS backup_attempts (
  id TEXT PRIMARY KEY,
  trigger TEXT NOT NULL CHECK(trigger IN ('manual','scheduled')),
  started_at TEXT NOT NULL,
  finished_at TEXT,
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running','complete','failed')),
  error TEXT,
  record_id TEXT REFERENCES backup_records(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_records_created ON backup_records(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_backup_attempts_started ON backup_attempts(started_at DESC);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::debug!("[Catalog] Applying schema");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for catalogs created before upload tracking
    let has_column = |table: &str, column: &str| -> rusqlite::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns.iter().any(|c| c == column))
    };

    if !has_column("backup_records", "upload_error")? {
        conn.execute_batch("ALTER TABLE backup_records ADD COLUMN upload_error TEXT")?;
    }
    if !has_column("backup_records", "upload_attempts")? {
        conn.execute_batch(
            "ALTER TABLE backup_records ADD COLUMN upload_attempts INTEGER NOT NULL DEFAULT 0",
        )?;
    }

    Ok(())
}
