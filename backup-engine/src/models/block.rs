//! Content-addressed block index and per-owner file→block maps.
//!
//! `blocks.reference_count` always equals the number of `file_blocks` rows
//! pointing at the hash. Every mutation that touches one touches the other
//! inside the same transaction.

use crate::utils::errors::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub size: u64,
    pub first_seen: String,
    pub reference_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    pub owner: String,
    pub file_path: String,
    pub block_index: u64,
    pub hash: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub blocks: u64,
    pub references: u64,
    pub unreferenced: u64,
    pub stored_bytes: u64,
}

fn row_to_block(row: &Row) -> rusqlite::Result<Block> {
    Ok(Block {
        hash: row.get("hash")?,
        size: row.get::<_, i64>("size")? as u64,
        first_seen: row.get("first_seen")?,
        reference_count: row.get("reference_count")?,
    })
}

pub fn find(conn: &Connection, hash: &str) -> Result<Option<Block>> {
    Ok(conn
        .query_row("SELECT * FROM blocks WHERE hash = ?", params![hash], row_to_block)
        .optional()?)
}

pub fn exists(conn: &Connection, hash: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM blocks WHERE hash = ?", params![hash], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Most recently seen hashes, used to warm the in-memory cache
pub fn recent_hashes(conn: &Connection, limit: u64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT hash FROM blocks ORDER BY first_seen DESC LIMIT ?")?;
    let rows = stmt.query_map(params![limit as i64], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert(conn: &Connection, hash: &str, size: u64, first_seen: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO blocks (hash, size, first_seen, reference_count) VALUES (?1, ?2, ?3, 1)",
        params![hash, size as i64, first_seen],
    )?;
    Ok(())
}

pub fn increment(conn: &Connection, hash: &str) -> Result<()> {
    conn.execute(
        "UPDATE blocks SET reference_count = reference_count + 1 WHERE hash = ?",
        params![hash],
    )?;
    Ok(())
}

pub fn insert_file_block(conn: &Connection, entry: &FileBlock) -> Result<()> {
    conn.execute(
        "INSERT INTO file_blocks (owner, file_path, block_index, hash, offset) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.owner,
            entry.file_path,
            entry.block_index as i64,
            entry.hash,
            entry.offset as i64,
        ],
    )?;
    Ok(())
}

/// Drop every map row of `owner` and decrement the blocks they referenced.
/// Returns the number of references released.
pub fn release_owner(conn: &Connection, owner: &str) -> Result<u64> {
    conn.execute(
        "UPDATE blocks SET reference_count = MAX(0, reference_count - (
             SELECT COUNT(*) FROM file_blocks fb WHERE fb.owner = ?1 AND fb.hash = blocks.hash))
         WHERE hash IN (SELECT hash FROM file_blocks WHERE owner = ?1)",
        params![owner],
    )?;
    let removed = conn.execute("DELETE FROM file_blocks WHERE owner = ?", params![owner])?;
    Ok(removed as u64)
}

pub fn file_blocks(conn: &Connection, owner: &str, file_path: &str) -> Result<Vec<FileBlock>> {
    let mut stmt = conn.prepare(
        "SELECT owner, file_path, block_index, hash, offset FROM file_blocks
         WHERE owner = ? AND file_path = ? ORDER BY block_index",
    )?;
    let rows = stmt.query_map(params![owner, file_path], |row| {
        Ok(FileBlock {
            owner: row.get(0)?,
            file_path: row.get(1)?,
            block_index: row.get::<_, i64>(2)? as u64,
            hash: row.get(3)?,
            offset: row.get::<_, i64>(4)? as u64,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Hashes of blocks nobody references any more
pub fn unused_hashes(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT hash FROM blocks WHERE reference_count = 0")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_unused(conn: &Connection) -> Result<u64> {
    let removed = conn.execute("DELETE FROM blocks WHERE reference_count = 0", [])?;
    Ok(removed as u64)
}

pub fn stats(conn: &Connection) -> Result<IndexStats> {
    let (blocks, unreferenced, stored_bytes): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(reference_count = 0), 0), COALESCE(SUM(size), 0) FROM blocks",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let references: i64 = conn.query_row("SELECT COUNT(*) FROM file_blocks", [], |row| row.get(0))?;
    Ok(IndexStats {
        blocks: blocks as u64,
        references: references as u64,
        unreferenced: unreferenced as u64,
        stored_bytes: stored_bytes as u64,
    })
}
