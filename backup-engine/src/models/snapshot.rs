use crate::fs::metadata::FileMetadata;
use crate::utils::errors::Result;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    /// Set for baselines written by engine runs
    pub job_id: Option<String>,
    pub source_root: String,
    pub timestamp: String,
    pub total_files: i64,
    pub total_size: i64,
    pub description: String,
}

/// Stat and content hash of one file at snapshot time.
/// `path` is the archive key, not an absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    #[serde(default)]
    pub mtime_nsec: u32,
    pub ctime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub content_hash: String,
    pub inode: u64,
}

impl FileRecord {
    /// Stat fields to reapply when this file is restored
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            size: self.size,
            mtime: self.mtime,
            mtime_nsec: self.mtime_nsec,
            ctime: self.ctime,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            inode: self.inode,
        }
    }
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: row.get("id")?,
        name: row.get("name")?,
        job_id: row.get("job_id")?,
        source_root: row.get("source_root")?,
        timestamp: row.get("timestamp")?,
        total_files: row.get("total_files")?,
        total_size: row.get("total_size")?,
        description: row.get("description")?,
    })
}

fn row_to_record(row: &Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        path: row.get("path")?,
        size: row.get::<_, i64>("size")? as u64,
        mtime: row.get("mtime")?,
        mtime_nsec: row.get::<_, i64>("mtime_nsec")? as u32,
        ctime: row.get("ctime")?,
        mode: row.get("mode")?,
        uid: row.get("uid")?,
        gid: row.get("gid")?,
        content_hash: row.get("content_hash")?,
        inode: row.get::<_, i64>("inode")? as u64,
    })
}

/// Insert a snapshot and all of its records. Callers wrap this in a transaction.
pub fn insert(conn: &Connection, snapshot: &Snapshot, records: &[FileRecord]) -> Result<()> {
    conn.execute(
        "INSERT INTO snapshots (id, name, job_id, source_root, timestamp, total_files, total_size, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            snapshot.id,
            snapshot.name,
            snapshot.job_id,
            snapshot.source_root,
            snapshot.timestamp,
            snapshot.total_files,
            snapshot.total_size,
            snapshot.description,
        ],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO file_records (snapshot_id, path, size, mtime, mtime_nsec, ctime, mode, uid, gid, content_hash, inode)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for record in records {
        stmt.execute(params![
            snapshot.id,
            record.path,
            record.size as i64,
            record.mtime,
            record.mtime_nsec,
            record.ctime,
            record.mode,
            record.uid,
            record.gid,
            record.content_hash,
            record.inode as i64,
        ])?;
    }
    Ok(())
}

pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Snapshot>> {
    let mut stmt = conn.prepare("SELECT * FROM snapshots WHERE name = ?")?;
    let mut rows = stmt.query_map(params![name], row_to_snapshot)?;
    Ok(rows.next().transpose()?)
}

pub fn find_latest_for_job(conn: &Connection, job_id: &str) -> Result<Option<Snapshot>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM snapshots WHERE job_id = ? ORDER BY timestamp DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![job_id], row_to_snapshot)?;
    Ok(rows.next().transpose()?)
}

pub fn find_all(conn: &Connection) -> Result<Vec<Snapshot>> {
    let mut stmt = conn.prepare("SELECT * FROM snapshots ORDER BY timestamp DESC")?;
    let rows = stmt.query_map([], row_to_snapshot)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_older_than(conn: &Connection, cutoff: &str) -> Result<Vec<Snapshot>> {
    let mut stmt = conn.prepare("SELECT * FROM snapshots WHERE timestamp < ? ORDER BY timestamp")?;
    let rows = stmt.query_map(params![cutoff], row_to_snapshot)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Records ordered by path
pub fn records(conn: &Connection, snapshot_id: &str) -> Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM file_records WHERE snapshot_id = ? ORDER BY path")?;
    let rows = stmt.query_map(params![snapshot_id], row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Deletes the snapshot; its records go with it through the cascade
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let changes = conn.execute("DELETE FROM snapshots WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
