use crate::utils::errors::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Remember where a backup's output (and its manifest) lives
pub fn upsert(conn: &Connection, backup_id: &str, output_dir: &str, created_at: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO manifests (backup_id, output_dir, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(backup_id) DO UPDATE SET output_dir = excluded.output_dir, created_at = excluded.created_at",
        params![backup_id, output_dir, created_at],
    )?;
    Ok(())
}

pub fn find_output_dir(conn: &Connection, backup_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT output_dir FROM manifests WHERE backup_id = ?",
            params![backup_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn delete(conn: &Connection, backup_id: &str) -> Result<bool> {
    let changes = conn.execute("DELETE FROM manifests WHERE backup_id = ?", params![backup_id])?;
    Ok(changes > 0)
}
