use crate::utils::errors::Result;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRun {
    pub id: String,
    pub backup_id: String,
    pub verified_at: String,
    pub success: bool,
    pub manifest_trusted: bool,
    pub total_files: i64,
    pub valid_files: i64,
    pub corrupted_files: i64,
    pub missing_files: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationFile {
    pub path: String,
    pub status: String,
    pub expected_hash: String,
    pub actual_hash: Option<String>,
}

fn row_to_run(row: &Row) -> rusqlite::Result<VerificationRun> {
    Ok(VerificationRun {
        id: row.get("id")?,
        backup_id: row.get("backup_id")?,
        verified_at: row.get("verified_at")?,
        success: row.get("success")?,
        manifest_trusted: row.get("manifest_trusted")?,
        total_files: row.get("total_files")?,
        valid_files: row.get("valid_files")?,
        corrupted_files: row.get("corrupted_files")?,
        missing_files: row.get("missing_files")?,
        error: row.get("error")?,
    })
}

pub fn insert(conn: &Connection, run: &VerificationRun, files: &[VerificationFile]) -> Result<()> {
    conn.execute(
        "INSERT INTO verification_runs (id, backup_id, verified_at, success, manifest_trusted, total_files, valid_files, corrupted_files, missing_files, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            run.id,
            run.backup_id,
            run.verified_at,
            run.success,
            run.manifest_trusted,
            run.total_files,
            run.valid_files,
            run.corrupted_files,
            run.missing_files,
            run.error,
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO verification_files (run_id, path, status, expected_hash, actual_hash)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for file in files {
        stmt.execute(params![run.id, file.path, file.status, file.expected_hash, file.actual_hash])?;
    }
    Ok(())
}

/// Newest first
pub fn recent_runs(conn: &Connection, backup_id: &str, limit: i64) -> Result<Vec<VerificationRun>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM verification_runs WHERE backup_id = ? ORDER BY verified_at DESC, rowid DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![backup_id, limit], row_to_run)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn files(conn: &Connection, run_id: &str) -> Result<Vec<VerificationFile>> {
    let mut stmt = conn.prepare(
        "SELECT path, status, expected_hash, actual_hash FROM verification_files WHERE run_id = ? ORDER BY path",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok(VerificationFile {
            path: row.get(0)?,
            status: row.get(1)?,
            expected_hash: row.get(2)?,
            actual_hash: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Failed runs across all backups since `since`
pub fn count_failed_since(conn: &Connection, since: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM verification_runs WHERE success = 0 AND verified_at >= ?",
        params![since],
        |row| row.get(0),
    )?)
}

pub fn delete_for_backup(conn: &Connection, backup_id: &str) -> Result<usize> {
    Ok(conn.execute("DELETE FROM verification_runs WHERE backup_id = ?", params![backup_id])?)
}
