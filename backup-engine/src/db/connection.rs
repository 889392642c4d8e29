use crate::utils::errors::Result;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub type DbPool = Pool<SqliteConnectionManager>;

fn init_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_secs(10))
}

pub fn create_pool(db_path: &Path) -> Result<DbPool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(db_path)
        .with_init(init_connection);
    let pool = Pool::builder()
        .max_size(8)
        .connection_timeout(Duration::from_secs(30))
        .build(manager)?;

    // Fail fast if the store cannot be opened at all
    let conn = pool.get()?;
    conn.query_row("SELECT 1", [], |_| Ok(()))?;

    Ok(pool)
}

/// Single-connection shared in-memory pool, for tests.
pub fn open_in_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|conn| conn.pragma_update(None, "foreign_keys", "ON"));
    let pool = Pool::builder().max_size(1).build(manager)?;
    Ok(pool)
}
