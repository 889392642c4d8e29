use crate::db::connection::DbPool;
use crate::utils::errors::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_jobs (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  source_paths TEXT NOT NULL DEFAULT '[]',
  destination TEXT NOT NULL,
  schedule TEXT,
  compression INTEGER NOT NULL DEFAULT 1,
  encryption INTEGER NOT NULL DEFAULT 1,
  dedup INTEGER NOT NULL DEFAULT 1,
  incremental INTEGER NOT NULL DEFAULT 1,
  verify_integrity INTEGER NOT NULL DEFAULT 1,
  replication_destinations TEXT NOT NULL DEFAULT '[]',
  retention_days INTEGER NOT NULL DEFAULT 30,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_runs (
  id TEXT PRIMARY KEY,
  job_id TEXT NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running','completed','skipped','failed')),
  backup_type TEXT NOT NULL DEFAULT 'full',
  output_dir TEXT NOT NULL,
  started_at TEXT NOT NULL,
  finished_at TEXT,
  total_files INTEGER NOT NULL DEFAULT 0,
  total_size INTEGER NOT NULL DEFAULT 0,
  compressed_size INTEGER NOT NULL DEFAULT 0,
  compression_type TEXT NOT NULL DEFAULT 'none',
  encryption_type TEXT NOT NULL DEFAULT 'none',
  error TEXT
);

CREATE TABLE IF NOT EXISTS backup_files (
  backup_id TEXT NOT NULL REFERENCES backup_runs(id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  size INTEGER NOT NULL,
  PRIMARY KEY (backup_id, path)
);

CREATE TABLE IF NOT EXISTS snapshots (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  job_id TEXT,
  source_root TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  total_files INTEGER NOT NULL DEFAULT 0,
  total_size INTEGER NOT NULL DEFAULT 0,
  description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS file_records (
  snapshot_id TEXT NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  size INTEGER NOT NULL,
  mtime INTEGER NOT NULL,
  mtime_nsec INTEGER NOT NULL DEFAULT 0,
  ctime INTEGER NOT NULL,
  mode INTEGER NOT NULL,
  uid INTEGER NOT NULL,
  gid INTEGER NOT NULL,
  content_hash TEXT NOT NULL,
  inode INTEGER NOT NULL,
  PRIMARY KEY (snapshot_id, path)
);

CREATE TABLE IF NOT EXISTS blocks (
  hash TEXT PRIMARY KEY,
  size INTEGER NOT NULL,
  first_seen TEXT NOT NULL,
  reference_count INTEGER NOT NULL DEFAULT 1 CHECK(reference_count >= 0)
);

CREATE TABLE IF NOT EXISTS file_blocks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner TEXT NOT NULL,
  file_path TEXT NOT NULL,
  block_index INTEGER NOT NULL,
  hash TEXT NOT NULL REFERENCES blocks(hash),
  offset INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS manifests (
  backup_id TEXT PRIMARY KEY,
  output_dir TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verification_runs (
  id TEXT PRIMARY KEY,
  backup_id TEXT NOT NULL,
  verified_at TEXT NOT NULL,
  success INTEGER NOT NULL,
  manifest_trusted INTEGER NOT NULL,
  total_files INTEGER NOT NULL,
  valid_files INTEGER NOT NULL,
  corrupted_files INTEGER NOT NULL,
  missing_files INTEGER NOT NULL,
  error TEXT
);

CREATE TABLE IF NOT EXISTS verification_files (
  run_id TEXT NOT NULL REFERENCES verification_runs(id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  status TEXT NOT NULL CHECK(status IN ('valid','corrupted','missing')),
  expected_hash TEXT NOT NULL,
  actual_hash TEXT
);

CREATE INDEX IF NOT EXISTS idx_backup_runs_job_id ON backup_runs(job_id, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_snapshots_job_id ON snapshots(job_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_file_blocks_owner ON file_blocks(owner);
CREATE INDEX IF NOT EXISTS idx_file_blocks_hash ON file_blocks(hash);
CREATE INDEX IF NOT EXISTS idx_verification_runs_backup ON verification_runs(backup_id, verified_at DESC);
"#;

/// Columns added to tables that older databases already have
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[("file_records", "mtime_nsec", "INTEGER NOT NULL DEFAULT 0")];

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    for (table, column, definition) in ADDED_COLUMNS {
        let present = conn
            .prepare("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")?
            .exists([table, column])?;
        if !present {
            tracing::info!("[DB] Adding column {}.{}", table, column);
            conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition))?;
        }
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use tempfile::TempDir;

    #[test]
    fn test_migrate_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let pool = create_pool(&temp_dir.path().join("engine.db"))?;
        migrate(&pool)?;
        migrate(&pool)?;

        let conn = pool.get()?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('blocks','file_blocks','snapshots','file_records')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(tables, 4);
        Ok(())
    }

    #[test]
    fn test_older_file_records_gain_nanosecond_column() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let pool = create_pool(&temp_dir.path().join("engine.db"))?;
        pool.get()?.execute_batch(
            "CREATE TABLE file_records (
               snapshot_id TEXT NOT NULL, path TEXT NOT NULL, size INTEGER NOT NULL,
               mtime INTEGER NOT NULL, ctime INTEGER NOT NULL, mode INTEGER NOT NULL,
               uid INTEGER NOT NULL, gid INTEGER NOT NULL, content_hash TEXT NOT NULL,
               inode INTEGER NOT NULL, PRIMARY KEY (snapshot_id, path))",
        )?;
        migrate(&pool)?;
        migrate(&pool)?;

        let conn = pool.get()?;
        let columns: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('file_records') WHERE name = 'mtime_nsec'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(columns, 1);
        Ok(())
    }

    #[test]
    fn test_negative_reference_count_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let pool = create_pool(&temp_dir.path().join("engine.db"))?;
        migrate(&pool)?;

        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO blocks (hash, size, first_seen, reference_count) VALUES ('aa', 1, 'now', 0)",
            [],
        )?;
        let result = conn.execute(
            "UPDATE blocks SET reference_count = reference_count - 1 WHERE hash = 'aa'",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }
}
