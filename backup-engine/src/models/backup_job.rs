use super::{format_ts, json_column};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub name: String,
    pub source_paths: Vec<String>,
    /// Root directory for archives; runs land in `<destination>/<job_id>/<backup_id>`
    pub destination: String,
    /// Stored for the scheduler that drives the engine; never interpreted here
    pub schedule: Option<String>,
    pub compression: bool,
    pub encryption: bool,
    pub dedup: bool,
    pub incremental: bool,
    pub verify_integrity: bool,
    pub replication_destinations: Vec<String>,
    pub retention_days: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBackupJob {
    pub name: String,
    pub source_paths: Vec<String>,
    pub destination: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_flag")]
    pub compression: bool,
    #[serde(default = "default_flag")]
    pub encryption: bool,
    #[serde(default = "default_flag")]
    pub dedup: bool,
    #[serde(default = "default_flag")]
    pub incremental: bool,
    #[serde(default = "default_flag")]
    pub verify_integrity: bool,
    #[serde(default)]
    pub replication_destinations: Vec<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_flag() -> bool { true }
fn default_retention_days() -> i64 { 30 }

impl NewBackupJob {
    /// All pipeline stages enabled, no replication, 30 day retention
    pub fn new(name: impl Into<String>, source_paths: Vec<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_paths,
            destination: destination.into(),
            schedule: None,
            compression: true,
            encryption: true,
            dedup: true,
            incremental: true,
            verify_integrity: true,
            replication_destinations: Vec::new(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBackupJob {
    pub name: Option<String>,
    pub source_paths: Option<Vec<String>>,
    pub destination: Option<String>,
    pub schedule: Option<Option<String>>,
    pub compression: Option<bool>,
    pub encryption: Option<bool>,
    pub dedup: Option<bool>,
    pub incremental: Option<bool>,
    pub verify_integrity: Option<bool>,
    pub replication_destinations: Option<Vec<String>>,
    pub retention_days: Option<i64>,
}

fn row_to_job(row: &Row) -> rusqlite::Result<BackupJob> {
    let source_paths: String = row.get("source_paths")?;
    let replication: String = row.get("replication_destinations")?;
    Ok(BackupJob {
        id: row.get("id")?,
        name: row.get("name")?,
        source_paths: json_column(&source_paths)?,
        destination: row.get("destination")?,
        schedule: row.get("schedule")?,
        compression: row.get("compression")?,
        encryption: row.get("encryption")?,
        dedup: row.get("dedup")?,
        incremental: row.get("incremental")?,
        verify_integrity: row.get("verify_integrity")?,
        replication_destinations: json_column(&replication)?,
        retention_days: row.get("retention_days")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn validate(name: &str, source_paths: &[String], destination: &str, retention_days: i64) -> Result<()> {
    if name.trim().is_empty() {
        return Err(EngineError::config("job name must not be empty"));
    }
    if source_paths.is_empty() {
        return Err(EngineError::config("job needs at least one source path"));
    }
    if destination.trim().is_empty() {
        return Err(EngineError::config("job destination must not be empty"));
    }
    if retention_days < 0 {
        return Err(EngineError::config("retention_days must not be negative"));
    }
    Ok(())
}

pub fn find_all(conn: &Connection) -> Result<Vec<BackupJob>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_jobs ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<BackupJob>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_jobs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_job)?;
    Ok(rows.next().transpose()?)
}

pub fn create(conn: &Connection, data: &NewBackupJob) -> Result<BackupJob> {
    validate(&data.name, &data.source_paths, &data.destination, data.retention_days)?;

    let id = Uuid::new_v4().to_string();
    let now = format_ts(&Utc::now());
    conn.execute(
        "INSERT INTO backup_jobs (id, name, source_paths, destination, schedule, compression, encryption, dedup, incremental, verify_integrity, replication_destinations, retention_days, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id,
            data.name,
            serde_json::to_string(&data.source_paths)?,
            data.destination,
            data.schedule,
            data.compression,
            data.encryption,
            data.dedup,
            data.incremental,
            data.verify_integrity,
            serde_json::to_string(&data.replication_destinations)?,
            data.retention_days,
            now,
            now,
        ],
    )?;
    find_by_id(conn, &id)?
        .ok_or_else(|| EngineError::config("failed to retrieve created job"))
}

pub fn update(conn: &Connection, id: &str, data: &UpdateBackupJob) -> Result<Option<BackupJob>> {
    let Some(existing) = find_by_id(conn, id)? else {
        return Ok(None);
    };

    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref name) = data.name {
        sets.push("name = ?");
        values.push(Box::new(name.clone()));
    }
    if let Some(ref source_paths) = data.source_paths {
        sets.push("source_paths = ?");
        values.push(Box::new(serde_json::to_string(source_paths)?));
    }
    if let Some(ref destination) = data.destination {
        sets.push("destination = ?");
        values.push(Box::new(destination.clone()));
    }
    if let Some(ref schedule) = data.schedule {
        sets.push("schedule = ?");
        values.push(Box::new(schedule.clone()));
    }
    for (column, flag) in [
        ("compression = ?", data.compression),
        ("encryption = ?", data.encryption),
        ("dedup = ?", data.dedup),
        ("incremental = ?", data.incremental),
        ("verify_integrity = ?", data.verify_integrity),
    ] {
        if let Some(flag) = flag {
            sets.push(column);
            values.push(Box::new(flag));
        }
    }
    if let Some(ref replication) = data.replication_destinations {
        sets.push("replication_destinations = ?");
        values.push(Box::new(serde_json::to_string(replication)?));
    }
    if let Some(retention_days) = data.retention_days {
        sets.push("retention_days = ?");
        values.push(Box::new(retention_days));
    }

    if sets.is_empty() {
        return Ok(Some(existing));
    }

    validate(
        data.name.as_deref().unwrap_or(&existing.name),
        data.source_paths.as_deref().unwrap_or(&existing.source_paths),
        data.destination.as_deref().unwrap_or(&existing.destination),
        data.retention_days.unwrap_or(existing.retention_days),
    )?;

    sets.push("updated_at = ?");
    values.push(Box::new(format_ts(&Utc::now())));
    values.push(Box::new(id.to_string()));

    let sql = format!("UPDATE backup_jobs SET {} WHERE id = ?", sets.join(", "));
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    conn.execute(&sql, params.as_slice())?;
    find_by_id(conn, id)
}

pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let changes = conn.execute("DELETE FROM backup_jobs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
