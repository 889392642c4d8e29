//! Directory snapshots and incremental change detection.
//!
//! A snapshot is a full scan: stat plus whole-file SHA-256 for every regular
//! file. Classification compares content hashes, so touching a file without
//! changing its bytes is not a change.

pub mod changes;

pub use changes::{ChangeKind, ChangeSet, ChangeSummary, FileChange};

use crate::clock::Clock;
use crate::db::DbPool;
use crate::fs::metadata::FileMetadata;
use crate::fs::walker::{walk_files, WalkOptions};
use crate::models::snapshot::{self as rows, FileRecord, Snapshot};
use crate::models::format_ts;
use crate::utils::errors::{EngineError, Result};
use crate::utils::hashing::sha256_file;
use crate::utils::pool::map_blocking;
use chrono::Duration;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct SnapshotStore {
    pool: DbPool,
    workers: usize,
    clock: Arc<dyn Clock>,
    writer: Mutex<()>,
}

struct Scan {
    records: Vec<FileRecord>,
    locations: BTreeMap<String, PathBuf>,
    unreadable: Vec<(String, String)>,
}

impl SnapshotStore {
    pub fn new(pool: DbPool, workers: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            workers,
            clock,
            writer: Mutex::new(()),
        }
    }

    /// Scan `dir` and persist the result as snapshot `name`
    pub async fn create_snapshot(&self, name: &str, dir: &Path) -> Result<Snapshot> {
        let cancel = CancellationToken::new();
        let changes = self.scan_changes(None, &[dir.to_path_buf()], &cancel).await?;
        self.save_as_snapshot(&changes, name, None, "full scan")
    }

    /// Compare snapshot `baseline_name` with the current contents of `dir`
    pub async fn diff(&self, baseline_name: &str, dir: &Path) -> Result<ChangeSet> {
        let baseline = self
            .get(baseline_name)?
            .ok_or_else(|| EngineError::config(format!("snapshot '{}' not found", baseline_name)))?;
        let cancel = CancellationToken::new();
        self.scan_changes(Some(baseline), &[dir.to_path_buf()], &cancel).await
    }

    /// Scan `roots` and classify against `baseline`; with no baseline every file is `Created`
    pub async fn scan_changes(
        &self,
        baseline: Option<Snapshot>,
        roots: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<ChangeSet> {
        let scan = self.scan(roots, cancel).await?;
        let previous = match &baseline {
            Some(snapshot) => self.records(&snapshot.id)?,
            None => Vec::new(),
        };

        let changes = changes::classify(&previous, &scan.records);
        Ok(ChangeSet {
            baseline,
            source_root: describe_roots(roots),
            changes,
            current: scan.records,
            locations: scan.locations,
            unreadable: scan.unreadable,
        })
    }

    async fn scan(&self, roots: &[PathBuf], cancel: &CancellationToken) -> Result<Scan> {
        let labelled = label_roots(roots);
        let (listing, skipped) = tokio::task::spawn_blocking(move || list_files(&labelled)).await??;

        let hashed = map_blocking(self.workers, listing, cancel, |(key, path)| {
            let outcome = FileMetadata::from_path(&path).and_then(|meta| {
                let content_hash = sha256_file(&path)?;
                Ok(FileRecord {
                    path: key.clone(),
                    size: meta.size,
                    mtime: meta.mtime,
                    mtime_nsec: meta.mtime_nsec,
                    ctime: meta.ctime,
                    mode: meta.mode,
                    uid: meta.uid,
                    gid: meta.gid,
                    content_hash,
                    inode: meta.inode,
                })
            });
            (path, outcome)
        })
        .await?;

        let mut scan = Scan {
            records: Vec::with_capacity(hashed.len()),
            locations: BTreeMap::new(),
            unreadable: Vec::new(),
        };
        for (path, reason) in skipped {
            warn!(path = %path.display(), error = %reason, "Entry skipped during scan");
            scan.unreadable.push((path.display().to_string(), reason));
        }
        for (path, outcome) in hashed {
            match outcome {
                Ok(record) => {
                    scan.locations.insert(record.path.clone(), path);
                    scan.records.push(record);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "File skipped during scan");
                    scan.unreadable.push((path.display().to_string(), e.to_string()));
                }
            }
        }
        scan.records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(scan)
    }

    /// Persist the scanned side of `changes` as a new named baseline
    pub fn save_as_snapshot(
        &self,
        changes: &ChangeSet,
        name: &str,
        job_id: Option<&str>,
        description: &str,
    ) -> Result<Snapshot> {
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            job_id: job_id.map(str::to_string),
            source_root: changes.source_root.clone(),
            timestamp: format_ts(&self.clock.now()),
            total_files: changes.current.len() as i64,
            total_size: changes.total_size() as i64,
            description: description.to_string(),
        };

        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut conn = self.pool.get()?;
        if rows::find_by_name(&conn, name)?.is_some() {
            return Err(EngineError::config(format!("snapshot '{}' already exists", name)));
        }
        let tx = conn.transaction()?;
        rows::insert(&tx, &snapshot, &changes.current)?;
        tx.commit()?;

        info!(
            snapshot = %snapshot.name,
            files = snapshot.total_files,
            bytes = snapshot.total_size,
            "Snapshot saved"
        );
        Ok(snapshot)
    }

    /// Delete snapshots older than `keep_days`, returning how many went
    pub fn cleanup_old(&self, keep_days: i64) -> Result<usize> {
        let cutoff = format_ts(&(self.clock.now() - Duration::days(keep_days)));
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let expired = rows::find_older_than(&tx, &cutoff)?;
        for snapshot in &expired {
            rows::delete(&tx, &snapshot.id)?;
        }
        tx.commit()?;

        if !expired.is_empty() {
            info!(removed = expired.len(), keep_days, "Old snapshots removed");
        }
        Ok(expired.len())
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let conn = self.pool.get()?;
        match rows::find_by_name(&conn, name)? {
            Some(snapshot) => rows::delete(&conn, &snapshot.id),
            None => Ok(false),
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<Snapshot>> {
        let conn = self.pool.get()?;
        rows::find_by_name(&conn, name)
    }

    pub fn latest_for_job(&self, job_id: &str) -> Result<Option<Snapshot>> {
        let conn = self.pool.get()?;
        rows::find_latest_for_job(&conn, job_id)
    }

    pub fn records(&self, snapshot_id: &str) -> Result<Vec<FileRecord>> {
        let conn = self.pool.get()?;
        rows::records(&conn, snapshot_id)
    }

    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let conn = self.pool.get()?;
        rows::find_all(&conn)
    }
}

/// Key prefix per root. A single root gets no prefix; several roots are
/// prefixed with their directory name, suffixed `-2`, `-3`, … on collision.
pub fn label_roots(roots: &[PathBuf]) -> Vec<(String, PathBuf)> {
    if roots.len() == 1 {
        return vec![(String::new(), roots[0].clone())];
    }

    let mut seen: HashSet<String> = HashSet::new();
    roots
        .iter()
        .map(|root| {
            let base = root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "root".to_string());
            let mut label = base.clone();
            let mut n = 2;
            while !seen.insert(label.clone()) {
                label = format!("{}-{}", base, n);
                n += 1;
            }
            (label, root.clone())
        })
        .collect()
}

type Listing = (Vec<(String, PathBuf)>, Vec<(PathBuf, String)>);

/// Keyed files under every root, plus the entries that could not be listed
fn list_files(labelled: &[(String, PathBuf)]) -> Result<Listing> {
    let mut listing = Vec::new();
    let mut skipped = Vec::new();
    for (label, root) in labelled {
        if !root.exists() {
            return Err(EngineError::config(format!(
                "source path {} does not exist",
                root.display()
            )));
        }

        if root.is_file() {
            match root.file_name().and_then(|n| n.to_str()) {
                Some(name) => listing.push((join_key(label, name), root.clone())),
                None => skipped.push((root.clone(), "file name is not valid UTF-8".to_string())),
            }
            continue;
        }

        match walk_files(root, &WalkOptions::default()) {
            Ok(walk) => {
                for file in walk.files {
                    listing.push((join_key(label, &file.key), file.path));
                }
                skipped.extend(walk.skipped);
            }
            Err(e) => skipped.push((root.clone(), e.to_string())),
        }
    }
    Ok((listing, skipped))
}

fn join_key(label: &str, relative: &str) -> String {
    if label.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", label, relative)
    }
}

fn describe_roots(roots: &[PathBuf]) -> String {
    roots
        .iter()
        .map(|r| r.display().to_string())
        .collect::<Vec<_>>()
        .join(";")
}
