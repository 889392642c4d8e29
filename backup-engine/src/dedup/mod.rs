//! Fixed-size block deduplication over a persistent content-addressed index.
//!
//! Files are cut into `block_size` chunks and each chunk is identified by its
//! SHA-256. Boundaries are fixed offsets, so inserting or removing a byte in
//! the middle of a file shifts every later boundary and the rest of the file
//! stops matching. Append-only and whole-file rewrites dedup well; in-place
//! edits do not.
//!
//! Hashing runs in parallel. Index writes go through one mutex and one SQLite
//! transaction per file, which keeps `reference_count` equal to the number of
//! `file_blocks` rows.

use crate::config::DedupConfig;
use crate::db::DbPool;
use crate::fs::walker::{walk_files, WalkOptions};
use crate::models::block::{self, FileBlock, IndexStats};
use crate::models::format_ts;
use crate::utils::errors::Result;
use crate::utils::pool::map_blocking;
use chrono::Utc;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub index: u64,
    pub offset: u64,
    pub size: usize,
    pub hash: String,
    /// The index already held this hash when the block was seen
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_blocks: u64,
    /// Distinct hashes in the input
    pub unique_blocks: u64,
    /// Rows added to the index
    pub new_blocks: u64,
    pub duplicated_blocks: u64,
    pub space_saved: u64,
    #[serde(with = "crate::utils::duration_ms")]
    pub processing_time: Duration,
}

impl DedupStats {
    fn absorb(&mut self, other: &DedupStats) {
        self.total_blocks += other.total_blocks;
        self.unique_blocks += other.unique_blocks;
        self.new_blocks += other.new_blocks;
        self.duplicated_blocks += other.duplicated_blocks;
        self.space_saved += other.space_saved;
    }

    pub fn dedup_ratio(&self) -> f64 {
        if self.total_blocks == 0 {
            0.0
        } else {
            self.duplicated_blocks as f64 / self.total_blocks as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileDedup {
    pub key: String,
    pub blocks: Vec<BlockRecord>,
    pub stats: DedupStats,
}

#[derive(Debug, Clone, Default)]
pub struct BatchDedup {
    pub files: Vec<FileDedup>,
    /// (key, reason) for files that could not be read
    pub failed: Vec<(String, String)>,
    pub stats: DedupStats,
}

pub struct BlockStore {
    pool: DbPool,
    block_size: usize,
    workers: usize,
    /// hash → block size; only holds hashes already committed to the index
    cache: Cache<String, u64>,
    writer: Mutex<()>,
}

impl BlockStore {
    /// Open the store and warm the cache from the persistent index
    pub fn open(pool: DbPool, config: &DedupConfig, workers: usize) -> Result<Arc<Self>> {
        let cache = Cache::new(config.cache_capacity);
        let seeded = {
            let conn = pool.get()?;
            block::recent_hashes(&conn, config.cache_capacity)?
        };
        let seeded_count = seeded.len();
        for hash in seeded {
            cache.insert(hash, config.block_size as u64);
        }
        info!(
            block_size = config.block_size,
            seeded = seeded_count,
            "Block store opened"
        );

        Ok(Arc::new(Self {
            pool,
            block_size: config.block_size,
            workers,
            cache,
            writer: Mutex::new(()),
        }))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Hash `path` in fixed blocks and record every block under `owner`.
    /// Blocking; call from a worker thread.
    pub fn deduplicate(&self, path: &Path, key: &str, owner: &str) -> Result<FileDedup> {
        let started = Instant::now();
        let chunks = self.hash_blocks(path)?;

        let mut blocks = Vec::with_capacity(chunks.len());
        let mut fresh = Vec::new();
        {
            let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            let mut conn = self.pool.get()?;
            let tx = conn.transaction()?;
            let now = format_ts(&Utc::now());
            let mut inserted: HashSet<&str> = HashSet::new();

            for (index, (offset, size, hash)) in chunks.iter().enumerate() {
                let known = inserted.contains(hash.as_str())
                    || self.cache.contains_key(hash)
                    || block::exists(&tx, hash)?;
                if known {
                    block::increment(&tx, hash)?;
                } else {
                    block::insert(&tx, hash, *size as u64, &now)?;
                    inserted.insert(hash.as_str());
                    fresh.push((hash.clone(), *size as u64));
                }
                block::insert_file_block(
                    &tx,
                    &FileBlock {
                        owner: owner.to_string(),
                        file_path: key.to_string(),
                        block_index: index as u64,
                        hash: hash.clone(),
                        offset: *offset,
                    },
                )?;
                blocks.push(BlockRecord {
                    index: index as u64,
                    offset: *offset,
                    size: *size,
                    hash: hash.clone(),
                    duplicate: known,
                });
            }
            tx.commit()?;
        }
        for (hash, size) in fresh.iter().cloned() {
            self.cache.insert(hash, size);
        }

        let total_blocks = blocks.len() as u64;
        let unique_blocks = blocks.iter().map(|b| b.hash.as_str()).collect::<HashSet<_>>().len() as u64;
        let new_blocks = fresh.len() as u64;
        let duplicated_blocks = total_blocks - new_blocks;
        Ok(FileDedup {
            key: key.to_string(),
            blocks,
            stats: DedupStats {
                total_blocks,
                unique_blocks,
                new_blocks,
                duplicated_blocks,
                space_saved: duplicated_blocks * self.block_size as u64,
                processing_time: started.elapsed(),
            },
        })
    }

    fn hash_blocks(&self, path: &Path) -> Result<Vec<(u64, usize, String)>> {
        let mut file = File::open(path)?;
        let mut buffer = vec![0u8; self.block_size];
        let mut chunks = Vec::new();
        let mut offset = 0u64;

        loop {
            let filled = read_block(&mut file, &mut buffer)?;
            if filled == 0 {
                break;
            }
            let hash = hex::encode(Sha256::digest(&buffer[..filled]));
            chunks.push((offset, filled, hash));
            offset += filled as u64;
            if filled < self.block_size {
                break;
            }
        }
        Ok(chunks)
    }

    /// Deduplicate `(key, path)` pairs on the worker pool.
    /// A file that cannot be read lands in `failed` without stopping the others.
    pub async fn deduplicate_files(
        self: &Arc<Self>,
        files: Vec<(String, PathBuf)>,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchDedup> {
        let started = Instant::now();
        let store = Arc::clone(self);
        let owner = owner.to_string();

        let results = map_blocking(self.workers, files, cancel, move |(key, path)| {
            let outcome = store.deduplicate(&path, &key, &owner);
            (key, outcome)
        })
        .await?;

        let mut batch = BatchDedup::default();
        for (key, outcome) in results {
            match outcome {
                Ok(file) => {
                    batch.stats.absorb(&file.stats);
                    batch.files.push(file);
                }
                Err(e) => {
                    warn!(file = %key, error = %e, "Dedup skipped file");
                    batch.failed.push((key, e.to_string()));
                }
            }
        }
        batch.stats.processing_time = started.elapsed();
        Ok(batch)
    }

    /// Deduplicate every regular file below `dir`
    pub async fn deduplicate_directory(
        self: &Arc<Self>,
        dir: &Path,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchDedup> {
        let root = dir.to_path_buf();
        let walk = tokio::task::spawn_blocking(move || walk_files(&root, &WalkOptions::default()))
            .await??;
        for (path, reason) in &walk.skipped {
            warn!(path = %path.display(), error = %reason, "Entry left out of dedup analysis");
        }
        let pairs = walk.files.into_iter().map(|f| (f.key, f.path)).collect();
        self.deduplicate_files(pairs, owner, cancel).await
    }

    /// Release every reference held by `owner`
    pub fn release_owner(&self, owner: &str) -> Result<u64> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let released = block::release_owner(&tx, owner)?;
        tx.commit()?;
        Ok(released)
    }

    /// Delete blocks whose reference count reached zero
    pub fn cleanup_unused_blocks(&self) -> Result<u64> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let unused = block::unused_hashes(&tx)?;
        let removed = block::delete_unused(&tx)?;
        tx.commit()?;

        for hash in &unused {
            self.cache.invalidate(hash);
        }
        if removed > 0 {
            info!(removed, "Collected unreferenced blocks");
        }
        Ok(removed)
    }

    pub fn index_stats(&self) -> Result<IndexStats> {
        let conn = self.pool.get()?;
        block::stats(&conn)
    }

    pub fn reference_count(&self, hash: &str) -> Result<Option<i64>> {
        let conn = self.pool.get()?;
        Ok(block::find(&conn, hash)?.map(|b| b.reference_count))
    }
}

/// Fill `buffer` from `reader`; short only at end of input
fn read_block(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, migrate};
    use std::fs;
    use tempfile::TempDir;

    fn store(temp_dir: &TempDir) -> Result<Arc<BlockStore>> {
        let pool = create_pool(&temp_dir.path().join("engine.db"))?;
        migrate(&pool)?;
        BlockStore::open(pool, &DedupConfig::default(), 4)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 4096 * 31 + i % 251) as u8).collect()
    }

    #[test]
    fn test_second_pass_increments_references() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = store(&temp_dir)?;
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, patterned(3 * 4096 + 100))?;

        let first = store.deduplicate(&path, "data.bin", "run-1")?;
        assert_eq!(first.stats.total_blocks, 4);
        assert_eq!(first.stats.new_blocks, first.stats.unique_blocks);
        let blocks_after_first = store.index_stats()?.blocks;

        let second = store.deduplicate(&path, "data.bin", "run-2")?;
        let first_hashes: Vec<_> = first.blocks.iter().map(|b| b.hash.clone()).collect();
        let second_hashes: Vec<_> = second.blocks.iter().map(|b| b.hash.clone()).collect();
        assert_eq!(first_hashes, second_hashes);
        assert_eq!(second.stats.unique_blocks, first.stats.unique_blocks);
        assert_eq!(second.stats.new_blocks, 0);
        assert_eq!(second.stats.space_saved, 4 * 4096);
        assert_eq!(store.index_stats()?.blocks, blocks_after_first);
        assert_eq!(store.reference_count(&first_hashes[0])?, Some(2));
        assert_eq!(store.index_stats()?.references, 8);
        Ok(())
    }

    #[test]
    fn test_repeated_blocks_within_one_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = store(&temp_dir)?;
        let path = temp_dir.path().join("zeros.bin");
        fs::write(&path, vec![0u8; 4 * 4096])?;

        let result = store.deduplicate(&path, "zeros.bin", "run-1")?;
        assert_eq!(result.stats.total_blocks, 4);
        assert_eq!(result.stats.unique_blocks, 1);
        assert_eq!(result.stats.new_blocks, 1);
        assert_eq!(result.stats.duplicated_blocks, 3);
        assert_eq!(store.reference_count(&result.blocks[0].hash)?, Some(4));
        Ok(())
    }

    #[test]
    fn test_empty_file_has_no_blocks() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = store(&temp_dir)?;
        let path = temp_dir.path().join("empty");
        fs::write(&path, b"")?;

        let result = store.deduplicate(&path, "empty", "run-1")?;
        assert_eq!(result.stats.total_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_release_and_cleanup() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = store(&temp_dir)?;
        let shared = temp_dir.path().join("shared.bin");
        fs::write(&shared, patterned(2 * 4096))?;
        let only_old = temp_dir.path().join("old.bin");
        fs::write(&only_old, vec![9u8; 4096])?;

        store.deduplicate(&shared, "shared.bin", "old")?;
        store.deduplicate(&only_old, "old.bin", "old")?;
        store.deduplicate(&shared, "shared.bin", "new")?;

        assert_eq!(store.release_owner("old")?, 3);
        let stats = store.index_stats()?;
        assert_eq!(stats.unreferenced, 1);
        assert_eq!(stats.references, 2);

        assert_eq!(store.cleanup_unused_blocks()?, 1);
        assert_eq!(store.index_stats()?.blocks, 2);

        // the collected hash must not be served from the cache
        let again = store.deduplicate(&only_old, "old.bin", "newer")?;
        assert_eq!(again.stats.new_blocks, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_dedup_parallel() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = store(&temp_dir)?;
        let source = temp_dir.path().join("src");
        fs::create_dir_all(source.join("nested"))?;
        for i in 0..6 {
            fs::write(source.join(format!("copy{i}.bin")), patterned(2 * 4096))?;
        }
        fs::write(source.join("nested/other.bin"), vec![1u8; 4096])?;

        let cancel = CancellationToken::new();
        let batch = store.deduplicate_directory(&source, "run-1", &cancel).await?;
        assert_eq!(batch.files.len(), 7);
        assert!(batch.failed.is_empty());
        assert_eq!(batch.stats.total_blocks, 13);
        assert_eq!(batch.stats.new_blocks, 3);
        assert_eq!(batch.stats.duplicated_blocks, 10);

        let stats = store.index_stats()?;
        assert_eq!(stats.blocks, 3);
        assert_eq!(stats.references, 13);
        Ok(())
    }
}
