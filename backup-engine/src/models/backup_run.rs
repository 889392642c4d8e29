use crate::utils::errors::Result;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_SKIPPED: &str = "skipped";
pub const STATUS_FAILED: &str = "failed";

pub const TYPE_FULL: &str = "full";
pub const TYPE_INCREMENTAL: &str = "incremental";

/// One execution of a job; its id is the backup id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: String,
    pub job_id: String,
    pub status: String,
    pub backup_type: String,
    pub output_dir: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub total_files: i64,
    pub total_size: i64,
    pub compressed_size: i64,
    pub compression_type: String,
    pub encryption_type: String,
    pub error: Option<String>,
}

impl BackupRun {
    pub fn is_full(&self) -> bool {
        self.backup_type == TYPE_FULL
    }
}

/// Final figures written when a run leaves the `running` state
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub status: &'static str,
    pub finished_at: String,
    pub total_files: i64,
    pub total_size: i64,
    pub compressed_size: i64,
    pub compression_type: String,
    pub encryption_type: String,
    pub error: Option<String>,
}

fn row_to_run(row: &Row) -> rusqlite::Result<BackupRun> {
    Ok(BackupRun {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        status: row.get("status")?,
        backup_type: row.get("backup_type")?,
        output_dir: row.get("output_dir")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        total_files: row.get("total_files")?,
        total_size: row.get("total_size")?,
        compressed_size: row.get("compressed_size")?,
        compression_type: row.get("compression_type")?,
        encryption_type: row.get("encryption_type")?,
        error: row.get("error")?,
    })
}

pub fn create(
    conn: &Connection,
    id: &str,
    job_id: &str,
    backup_type: &str,
    output_dir: &str,
    started_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO backup_runs (id, job_id, status, backup_type, output_dir, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, job_id, STATUS_RUNNING, backup_type, output_dir, started_at],
    )?;
    Ok(())
}

pub fn finish(conn: &Connection, id: &str, outcome: &RunOutcome) -> Result<()> {
    conn.execute(
        "UPDATE backup_runs SET status = ?1, finished_at = ?2, total_files = ?3, total_size = ?4,
             compressed_size = ?5, compression_type = ?6, encryption_type = ?7, error = ?8
         WHERE id = ?9",
        params![
            outcome.status,
            outcome.finished_at,
            outcome.total_files,
            outcome.total_size,
            outcome.compressed_size,
            outcome.compression_type,
            outcome.encryption_type,
            outcome.error,
            id,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<BackupRun>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_runs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_run)?;
    Ok(rows.next().transpose()?)
}

/// Newest first
pub fn find_by_job_id(conn: &Connection, job_id: &str, limit: i64) -> Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_runs WHERE job_id = ? ORDER BY started_at DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![job_id, limit], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_recent(conn: &Connection, limit: i64) -> Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_runs ORDER BY started_at DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Completed runs of a job, oldest first
pub fn find_completed(conn: &Connection, job_id: &str) -> Result<Vec<BackupRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_runs WHERE job_id = ? AND status = 'completed' ORDER BY started_at ASC",
    )?;
    let rows = stmt.query_map(params![job_id], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_latest_completed(conn: &Connection, job_id: &str) -> Result<Option<BackupRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_runs WHERE job_id = ? AND status = 'completed' ORDER BY started_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![job_id], row_to_run)?;
    Ok(rows.next().transpose()?)
}

/// Archives needed to rebuild `backup_id`: that run and every earlier
/// completed run of the job back to the nearest full one. Newest first;
/// empty when `backup_id` is not a completed run.
pub fn restore_chain(conn: &Connection, job_id: &str, backup_id: &str) -> Result<Vec<BackupRun>> {
    let completed = find_completed(conn, job_id)?;
    let Some(end) = completed.iter().position(|run| run.id == backup_id) else {
        return Ok(Vec::new());
    };

    let mut chain = Vec::new();
    for run in completed[..=end].iter().rev() {
        chain.push(run.clone());
        if run.is_full() {
            break;
        }
    }
    Ok(chain)
}

/// Runs left in `running` by a crashed process
pub fn mark_interrupted(conn: &Connection, finished_at: &str) -> Result<usize> {
    let changes = conn.execute(
        "UPDATE backup_runs SET status = 'failed', finished_at = ?1, error = 'interrupted'
         WHERE status = 'running'",
        params![finished_at],
    )?;
    Ok(changes)
}

pub fn count_by_status(conn: &Connection, job_id: Option<&str>) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM backup_runs WHERE ?1 IS NULL OR job_id = ?1 GROUP BY status",
    )?;
    let rows = stmt.query_map(params![job_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let changes = conn.execute("DELETE FROM backup_runs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

// ── BackupFile ──

/// Record which archive keys a backup's archive contains
pub fn insert_files(conn: &Connection, backup_id: &str, files: &[(String, u64)]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO backup_files (backup_id, path, size) VALUES (?1, ?2, ?3)",
    )?;
    for (path, size) in files {
        stmt.execute(params![backup_id, path, *size as i64])?;
    }
    Ok(())
}

pub fn file_paths(conn: &Connection, backup_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT path FROM backup_files WHERE backup_id = ? ORDER BY path")?;
    let rows = stmt.query_map(params![backup_id], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
