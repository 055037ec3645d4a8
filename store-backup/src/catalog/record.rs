use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTrigger {
    Manual,
    Scheduled,
}

impl BackupTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupTrigger::Manual => "manual",
            BackupTrigger::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for BackupTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(BackupTrigger::Manual),
            "scheduled" => Ok(BackupTrigger::Scheduled),
            other => Err(format!("unknown trigger '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Complete,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Complete => "complete",
            BackupStatus::Failed => "failed",
        }
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(BackupStatus::Complete),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Metadata of one backup artifact. Content fields never change once the
/// record is `complete`; only upload bookkeeping is updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: String,
    pub local_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<String>,
    pub trigger: BackupTrigger,
    pub status: BackupStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_error: Option<String>,
    #[serde(default)]
    pub upload_attempts: u32,
}

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_enum<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    let created_at: String = row.get("created_at")?;
    let trigger: String = row.get("trigger")?;
    let status: String = row.get("status")?;
    let local_path: String = row.get("local_path")?;
    Ok(BackupRecord {
        id: row.get("id")?,
        created_at: parse_ts(1, &created_at)?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        checksum: row.get("checksum")?,
        local_path: PathBuf::from(local_path),
        remote_ref: row.get("remote_ref")?,
        trigger: parse_enum(6, &trigger)?,
        status: parse_enum(7, &status)?,
        upload_error: row.get("upload_error")?,
        upload_attempts: row.get::<_, i64>("upload_attempts")? as u32,
    })
}

const SELECT: &str = "SELECT id, created_at, size_bytes, checksum, local_path, remote_ref, trigger, status, upload_error, upload_attempts FROM backup_records";

pub fn insert(conn: &Connection, record: &BackupRecord) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO backup_records (id, created_at, size_bytes, checksum, local_path, remote_ref, trigger, status, upload_error, upload_attempts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id,
            format_ts(&record.created_at),
            record.size_bytes as i64,
            record.checksum,
            record.local_path.to_string_lossy(),
            record.remote_ref,
            record.trigger.as_str(),
            record.status.as_str(),
            record.upload_error,
            record.upload_attempts as i64,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<BackupRecord>> {
    conn.query_row(&format!("{SELECT} WHERE id = ?1"), params![id], row_to_record)
        .optional()
}

/// Most recent first; rowid breaks ties between records sharing a timestamp.
pub fn find_all(conn: &Connection, limit: Option<usize>) -> rusqlite::Result<Vec<BackupRecord>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&format!(
        "{SELECT} ORDER BY created_at DESC, rowid DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit], row_to_record)?;
    rows.collect()
}

pub fn find_complete(conn: &Connection) -> rusqlite::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT} WHERE status = 'complete' ORDER BY created_at DESC, rowid DESC"
    ))?;
    let rows = stmt.query_map([], row_to_record)?;
    rows.collect()
}

pub fn find_latest_complete(conn: &Connection) -> rusqlite::Result<Option<BackupRecord>> {
    conn.query_row(
        &format!("{SELECT} WHERE status = 'complete' ORDER BY created_at DESC, rowid DESC LIMIT 1"),
        [],
        row_to_record,
    )
    .optional()
}

/// Records whose upload failed and may still be retried.
pub fn find_pending_uploads(conn: &Connection, max_attempts: u32) -> rusqlite::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT} WHERE status = 'complete' AND remote_ref IS NULL AND upload_error IS NOT NULL AND upload_attempts < ?1
         ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map(params![max_attempts as i64], row_to_record)?;
    rows.collect()
}

pub fn update_uploaded(conn: &Connection, id: &str, remote_ref: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE backup_records SET remote_ref = ?1, upload_error = NULL, upload_attempts = upload_attempts + 1 WHERE id = ?2",
        params![remote_ref, id],
    )?;
    Ok(())
}

pub fn update_upload_failed(conn: &Connection, id: &str, error: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE backup_records SET upload_error = ?1, upload_attempts = upload_attempts + 1 WHERE id = ?2",
        params![error, id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_records WHERE id = ?1", params![id])?;
    Ok(changes > 0)
}
