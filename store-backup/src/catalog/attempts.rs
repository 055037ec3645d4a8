//! Log of backup attempts. Every `create_backup` call writes one row; only
//! successful ones also produce a [`BackupRecord`](super::BackupRecord).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::str::FromStr;

use super::record::{format_ts, parse_enum, parse_ts, BackupTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Running,
    Complete,
    Failed,
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(AttemptStatus::Running),
            "complete" => Ok(AttemptStatus::Complete),
            "failed" => Ok(AttemptStatus::Failed),
            other => Err(format!("unknown attempt status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAttempt {
    pub id: String,
    pub trigger: BackupTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub record_id: Option<String>,
}

fn row_to_attempt(row: &Row) -> rusqlite::Result<BackupAttempt> {
    let trigger: String = row.get("trigger")?;
    let started_at: String = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;
    let status: String = row.get("status")?;
    Ok(BackupAttempt {
        id: row.get("id")?,
        trigger: parse_enum(1, &trigger)?,
        started_at: parse_ts(2, &started_at)?,
        finished_at: finished_at.as_deref().map(|raw| parse_ts(3, raw)).transpose()?,
        status: parse_enum(4, &status)?,
        error: row.get("error")?,
        record_id: row.get("record_id")?,
    })
}

pub fn begin(conn: &Connection, id: &str, trigger: BackupTrigger) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO backup_attempts (id, trigger, started_at) VALUES (?1, ?2, ?3)",
        params![id, trigger.as_str(), format_ts(&Utc::now())],
    )?;
    Ok(())
}

pub fn complete(conn: &Connection, id: &str, record_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE backup_attempts SET status = 'complete', finished_at = ?1, record_id = ?2 WHERE id = ?3",
        params![format_ts(&Utc::now()), record_id, id],
    )?;
    Ok(())
}

pub fn fail(conn: &Connection, id: &str, error: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE backup_attempts SET status = 'failed', finished_at = ?1, error = ?2 WHERE id = ?3",
        params![format_ts(&Utc::now()), error, id],
    )?;
    Ok(())
}

/// Close out every attempt still marked running. Only valid when no backup
/// can be in flight, i.e. at startup.
pub fn fail_running(conn: &Connection, error: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE backup_attempts SET status = 'failed', finished_at = ?1, error = ?2 WHERE status = 'running'",
        params![format_ts(&Utc::now()), error],
    )
}

/// Drop finished attempts that started before `cutoff`.
pub fn delete_finished_before(conn: &Connection, cutoff: &DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM backup_attempts WHERE status != 'running' AND started_at < ?1",
        params![format_ts(cutoff)],
    )
}

/// Finished attempts, most recent first. Running rows are ignored.
pub fn find_recent_finished(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<BackupAttempt>> {
    let mut stmt = conn.prepare(
        "SELECT id, trigger, started_at, finished_at, status, error, record_id FROM backup_attempts
         WHERE status != 'running' ORDER BY started_at DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], row_to_attempt)?;
    rows.collect()
}
