//! Selective restore from a backup chain.
//!
//! A target names a snapshot (the backup id for engine runs), a key prefix
//! inside it and a directory to restore into. Every selected file is pulled
//! from the newest archive in the chain that holds it. An encrypted archive
//! is authenticated and unsealed into an anonymous scratch file first. The
//! tar stream is then decompressed on the fly, and each member is staged
//! and only renamed into place once its bytes hash to the value recorded in
//! the snapshot.

use crate::archive;
use crate::crypto::Cipher;
use crate::db::DbPool;
use crate::models::backup_run::{self, BackupRun};
use crate::models::snapshot::{self as snapshot_rows, FileRecord, Snapshot};
use crate::compress;
use crate::utils::errors::{EngineError, Result};
use crate::utils::hashing::HashingReader;
use crate::utils::pool::map_blocking;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const ARCHIVE_FILE: &str = "archive.dat";

/// Paths listed by [`Restorer::preview`]
const PREVIEW_SAMPLE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreTarget {
    pub snapshot_name: String,
    /// Archive key, or a key prefix; empty selects everything
    pub source_path: String,
    pub target_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePreview {
    pub snapshot_name: String,
    pub file_count: usize,
    pub total_size: u64,
    pub sample: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreResult {
    pub success: bool,
    pub restored_files: u64,
    pub restored_bytes: u64,
    /// (key, reason) for every file not restored
    pub failed_files: Vec<(String, String)>,
    /// Target-level problems
    pub errors: Vec<String>,
    #[serde(with = "crate::utils::duration_ms")]
    pub duration: Duration,
}

pub struct Restorer {
    pool: DbPool,
    cipher: Arc<Cipher>,
    workers: usize,
}

/// Files of one target grouped by the archive that holds them
struct Plan {
    sources: Vec<(BackupRun, Vec<FileRecord>)>,
    unresolved: Vec<FileRecord>,
}

impl Restorer {
    pub fn new(pool: DbPool, cipher: Arc<Cipher>, workers: usize) -> Self {
        Self {
            pool,
            cipher,
            workers,
        }
    }

    /// Check that `target` can be restored without touching anything
    pub fn validate(&self, target: &RestoreTarget) -> Result<RestoreValidation> {
        let mut errors = Vec::new();

        match self.selection(target)? {
            None => errors.push(format!("snapshot '{}' not found", target.snapshot_name)),
            Some((snapshot, records)) => {
                if records.is_empty() {
                    errors.push(format!(
                        "nothing under '{}' in snapshot '{}'",
                        target.source_path, snapshot.name
                    ));
                }
                if self.chain_for(&snapshot)?.is_empty() {
                    errors.push(format!(
                        "snapshot '{}' is not backed by a completed backup",
                        snapshot.name
                    ));
                }
            }
        }

        if let Err(reason) = check_writable(&target.target_path) {
            errors.push(reason);
        }

        Ok(RestoreValidation {
            valid: errors.is_empty(),
            errors,
        })
    }

    pub fn preview(&self, target: &RestoreTarget) -> Result<RestorePreview> {
        let (_, records) = self.selection(target)?.ok_or_else(|| {
            EngineError::config(format!("snapshot '{}' not found", target.snapshot_name))
        })?;
        Ok(RestorePreview {
            snapshot_name: target.snapshot_name.clone(),
            file_count: records.len(),
            total_size: records.iter().map(|r| r.size).sum(),
            sample: records.iter().take(PREVIEW_SAMPLE).map(|r| r.path.clone()).collect(),
        })
    }

    /// Restore every target. Per-file and per-target failures are reported
    /// in the result; only store errors and cancellation return `Err`.
    pub async fn restore(
        &self,
        targets: &[RestoreTarget],
        cancel: &CancellationToken,
    ) -> Result<RestoreResult> {
        let started = Instant::now();
        let mut result = RestoreResult::default();

        for target in targets {
            let validation = self.validate(target)?;
            if !validation.valid {
                warn!(snapshot = %target.snapshot_name, errors = ?validation.errors, "Restore target rejected");
                result.errors.extend(validation.errors);
                continue;
            }
            self.restore_target(target, &mut result, cancel).await?;
        }

        result.success = result.errors.is_empty() && result.failed_files.is_empty();
        result.duration = started.elapsed();
        info!(
            restored = result.restored_files,
            failed = result.failed_files.len(),
            bytes = result.restored_bytes,
            "Restore finished"
        );
        Ok(result)
    }

    async fn restore_target(
        &self,
        target: &RestoreTarget,
        result: &mut RestoreResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let plan = self.plan(target)?;
        for record in plan.unresolved {
            result
                .failed_files
                .push((record.path, "not present in any archive of the backup chain".into()));
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let cipher = Arc::clone(&self.cipher);
        let jobs: Vec<_> = plan
            .sources
            .into_iter()
            .map(|(run, records)| (run, records, target.target_path.clone(), cancel.clone()))
            .collect();
        let restored = map_blocking(self.workers, jobs, cancel, move |(run, records, root, cancel)| {
            restore_from_archive(&cipher, &run, records, &root, &cancel)
        })
        .await?;

        for outcomes in restored {
            for (key, outcome) in outcomes? {
                match outcome {
                    Ok(bytes) => {
                        result.restored_files += 1;
                        result.restored_bytes += bytes;
                    }
                    Err(reason) => {
                        warn!(key = %key, error = %reason, "File not restored");
                        result.failed_files.push((key, reason));
                    }
                }
            }
        }
        Ok(())
    }

    /// The snapshot and its records under the target's prefix
    fn selection(&self, target: &RestoreTarget) -> Result<Option<(Snapshot, Vec<FileRecord>)>> {
        let conn = self.pool.get()?;
        let Some(snapshot) = snapshot_rows::find_by_name(&conn, &target.snapshot_name)? else {
            return Ok(None);
        };
        let prefix = target.source_path.trim_matches('/');
        let records = snapshot_rows::records(&conn, &snapshot.id)?
            .into_iter()
            .filter(|r| under_prefix(&r.path, prefix))
            .collect();
        Ok(Some((snapshot, records)))
    }

    fn chain_for(&self, snapshot: &Snapshot) -> Result<Vec<BackupRun>> {
        let Some(job_id) = &snapshot.job_id else {
            return Ok(Vec::new());
        };
        let conn = self.pool.get()?;
        backup_run::restore_chain(&conn, job_id, &snapshot.name)
    }

    fn plan(&self, target: &RestoreTarget) -> Result<Plan> {
        let (snapshot, records) = self.selection(target)?.ok_or_else(|| {
            EngineError::config(format!("snapshot '{}' not found", target.snapshot_name))
        })?;
        let chain = self.chain_for(&snapshot)?;

        let mut remaining: BTreeMap<String, FileRecord> =
            records.into_iter().map(|r| (r.path.clone(), r)).collect();
        let mut sources = Vec::new();
        {
            let conn = self.pool.get()?;
            for run in chain {
                if remaining.is_empty() {
                    break;
                }
                let held: Vec<FileRecord> = backup_run::file_paths(&conn, &run.id)?
                    .into_iter()
                    .filter_map(|path| remaining.remove(&path))
                    .collect();
                if !held.is_empty() {
                    sources.push((run, held));
                }
            }
        }

        Ok(Plan {
            sources,
            unresolved: remaining.into_values().collect(),
        })
    }
}

fn under_prefix(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Restore `records` from one archive of the chain. Blocking. Per-file
/// failures are returned as reasons; only cancellation is an `Err`.
fn restore_from_archive(
    cipher: &Cipher,
    run: &BackupRun,
    records: Vec<FileRecord>,
    root: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<(String, std::result::Result<u64, String>)>> {
    let mut pending: BTreeMap<String, FileRecord> =
        records.into_iter().map(|r| (r.path.clone(), r)).collect();
    let wanted: HashSet<String> = pending.keys().cloned().collect();
    let mut outcomes = Vec::with_capacity(wanted.len());

    let walked = open_archive(cipher, run, root).and_then(|members| {
        archive::visit_members(members, &wanted, |key, data| {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if let Some(record) = pending.remove(key) {
                let written = write_member(&record, data, root).map_err(|e| e.to_string());
                outcomes.push((record.path, written));
            }
            Ok(())
        })
    });

    let reason = match walked {
        Ok(_) => "listed for the archive but not in it".to_string(),
        Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
        Err(e) => {
            warn!(backup_id = %run.id, error = %e, "Archive could not be read");
            e.to_string()
        }
    };
    outcomes.extend(pending.into_keys().map(|key| (key, Err(reason.clone()))));
    Ok(outcomes)
}

/// Authenticate the archive of `run` and return a reader over its tar
/// stream. Blocking.
fn open_archive(cipher: &Cipher, run: &BackupRun, scratch_dir: &Path) -> Result<Box<dyn Read>> {
    let path = Path::new(&run.output_dir).join(ARCHIVE_FILE);
    let mut stored = BufReader::new(File::open(&path)?);

    // The run's recorded encryption decides; a sealed-looking archive from
    // an unencrypted run, or the reverse, fails rather than guessing.
    let payload: Box<dyn Read> = if run.encryption_type == "none" {
        Box::new(stored)
    } else {
        fs::create_dir_all(scratch_dir)?;
        let mut plain = tempfile::tempfile_in(scratch_dir)?;
        {
            let mut writer = BufWriter::new(&mut plain);
            cipher.unseal_stream(&mut stored, &mut writer, None)?;
            writer.flush()?;
        }
        plain.rewind()?;
        Box::new(BufReader::new(plain))
    };
    let (_, members) = compress::decompressing_reader(payload)?;
    Ok(members)
}

fn write_member(record: &FileRecord, data: &mut dyn Read, root: &Path) -> Result<u64> {
    let destination = safe_join(root, &record.path)?;
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = destination.with_file_name(format!(".{}.restore-tmp", file_name));

    let staged = stage_member(&staging, data, &record.content_hash)
        .and_then(|size| fs::rename(&staging, &destination).map(|_| size).map_err(EngineError::from));
    if staged.is_err() {
        let _ = fs::remove_file(&staging);
    }
    let size = staged?;

    record.metadata().apply_to_path(&destination)?;
    Ok(size)
}

fn stage_member(staging: &Path, data: &mut dyn Read, expected_hash: &str) -> Result<u64> {
    let mut reader = HashingReader::new(data);
    let mut writer = BufWriter::new(File::create(staging)?);
    let size = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    if reader.finish() != expected_hash {
        return Err(EngineError::integrity("content hash does not match the snapshot"));
    }
    Ok(size)
}

fn safe_join(root: &Path, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key);
    if key.is_empty() || relative.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(EngineError::integrity(format!("unsafe archive key: {}", key)));
    }
    Ok(root.join(relative))
}

/// The nearest existing ancestor of `target` must be a writable directory
fn check_writable(target: &Path) -> std::result::Result<(), String> {
    let mut ancestor = target;
    loop {
        match fs::metadata(ancestor) {
            Ok(meta) if meta.is_dir() => break,
            Ok(_) => return Err(format!("{} is not a directory", ancestor.display())),
            Err(_) => match ancestor.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => ancestor = parent,
                _ => return Err(format!("no existing parent for {}", target.display())),
            },
        }
    }

    #[cfg(unix)]
    {
        use nix::unistd::{access, AccessFlags};
        access(ancestor, AccessFlags::W_OK)
            .map_err(|e| format!("{} is not writable: {}", ancestor.display(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveInput;
    use crate::clock::SystemClock;
    use crate::compress::{Algorithm, Compressor};
    use crate::crypto::{keys::SecretKey, ENCRYPTION_TYPE};
    use crate::db::{create_pool, migrate};
    use crate::models::backup_job::{self, NewBackupJob};
    use crate::models::backup_run::{RunOutcome, STATUS_COMPLETED, TYPE_FULL};
    use crate::models::format_ts;
    use crate::snapshot::SnapshotStore;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        pool: DbPool,
        cipher: Arc<Cipher>,
    }

    fn fixture() -> Result<Fixture> {
        let temp_dir = TempDir::new()?;
        let pool = create_pool(&temp_dir.path().join("engine.db"))?;
        migrate(&pool)?;
        let cipher = Arc::new(Cipher::new(SecretKey::generate(), 1_000));
        Ok(Fixture {
            temp_dir,
            pool,
            cipher,
        })
    }

    /// Snapshot `source` and store one full archive of it under `backup_id`
    async fn back_up(fx: &Fixture, source: &Path, backup_id: &str, encrypted: bool) -> Result<()> {
        let store = SnapshotStore::new(fx.pool.clone(), 2, Arc::new(SystemClock));
        let changes = store
            .scan_changes(None, &[source.to_path_buf()], &CancellationToken::new())
            .await?;

        let inputs: Vec<ArchiveInput> = changes
            .current
            .iter()
            .map(|r| ArchiveInput {
                key: r.path.clone(),
                path: changes.locations[&r.path].clone(),
                expected: Some((r.size, r.content_hash.clone())),
                mtime: r.mtime,
            })
            .collect();
        let output_dir = fx.temp_dir.path().join("out").join(backup_id);
        fs::create_dir_all(&output_dir)?;
        let tar_path = output_dir.join("archive.tar");
        let compressed_path = output_dir.join("archive.tar.zst");
        let mut tar = File::create(&tar_path)?;
        let built = archive::build(&inputs, &mut tar)?;
        drop(tar);
        Compressor::default().compress_file_with(&tar_path, &compressed_path, Algorithm::Zstd)?;
        if encrypted {
            fx.cipher.encrypt_file(&compressed_path, &output_dir.join(ARCHIVE_FILE), None)?;
        } else {
            fs::rename(&compressed_path, output_dir.join(ARCHIVE_FILE))?;
        }
        let _ = fs::remove_file(&tar_path);
        let _ = fs::remove_file(&compressed_path);

        let conn = fx.pool.get()?;
        let job = backup_job::create(&conn, &NewBackupJob::new(backup_id, vec![source.display().to_string()], "/b"))?;
        let now = format_ts(&Utc::now());
        backup_run::create(&conn, backup_id, &job.id, TYPE_FULL, &output_dir.to_string_lossy(), &now)?;
        backup_run::finish(
            &conn,
            backup_id,
            &RunOutcome {
                status: STATUS_COMPLETED,
                finished_at: now,
                encryption_type: if encrypted { ENCRYPTION_TYPE.into() } else { "none".into() },
                ..Default::default()
            },
        )?;
        backup_run::insert_files(&conn, backup_id, &built.members)?;
        drop(conn);

        store.save_as_snapshot(&changes, backup_id, Some(&job.id), "test")?;
        Ok(())
    }

    fn source_tree(fx: &Fixture) -> Result<PathBuf> {
        let source = fx.temp_dir.path().join("site");
        fs::create_dir_all(source.join("conf"))?;
        fs::write(source.join("index.html"), b"<h1>hello</h1>")?;
        fs::write(source.join("conf/app.ini"), b"[app]\nname=demo\n")?;
        fs::write(source.join("conf/big.bin"), vec![3u8; 50_000])?;
        Ok(source)
    }

    fn target(fx: &Fixture, name: &str, prefix: &str) -> RestoreTarget {
        RestoreTarget {
            snapshot_name: name.to_string(),
            source_path: prefix.to_string(),
            target_path: fx.temp_dir.path().join("restored"),
        }
    }

    #[tokio::test]
    async fn test_encrypted_restore_is_byte_identical() -> Result<()> {
        let fx = fixture()?;
        let source = source_tree(&fx)?;
        back_up(&fx, &source, "b1", true).await?;

        let restorer = Restorer::new(fx.pool.clone(), Arc::clone(&fx.cipher), 2);
        let result = restorer.restore(&[target(&fx, "b1", "")], &CancellationToken::new()).await?;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.restored_files, 3);

        let restored = fx.temp_dir.path().join("restored");
        for key in ["index.html", "conf/app.ini", "conf/big.bin"] {
            assert_eq!(fs::read(restored.join(key))?, fs::read(source.join(key))?);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let original = fs::metadata(source.join("conf/app.ini"))?;
            let copy = fs::metadata(restored.join("conf/app.ini"))?;
            assert_eq!(copy.mtime(), original.mtime());
            assert_eq!(copy.mtime_nsec(), original.mtime_nsec());
            assert_eq!(copy.mode() & 0o7777, original.mode() & 0o7777);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_prefix_selects_subtree() -> Result<()> {
        let fx = fixture()?;
        let source = source_tree(&fx)?;
        back_up(&fx, &source, "b1", false).await?;

        let restorer = Restorer::new(fx.pool.clone(), Arc::clone(&fx.cipher), 2);
        let preview = restorer.preview(&target(&fx, "b1", "conf"))?;
        assert_eq!(preview.file_count, 2);
        assert_eq!(preview.total_size, 16 + 50_000);
        assert!(!fx.temp_dir.path().join("restored").exists());

        let result = restorer.restore(&[target(&fx, "b1", "conf/")], &CancellationToken::new()).await?;
        assert_eq!(result.restored_files, 2);
        assert!(!fx.temp_dir.path().join("restored/index.html").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_archive_writes_nothing() -> Result<()> {
        let fx = fixture()?;
        let source = source_tree(&fx)?;
        back_up(&fx, &source, "b1", true).await?;

        let archive_path = fx.temp_dir.path().join("out/b1").join(ARCHIVE_FILE);
        let mut bytes = fs::read(&archive_path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&archive_path, bytes)?;

        let restorer = Restorer::new(fx.pool.clone(), Arc::clone(&fx.cipher), 2);
        let result = restorer.restore(&[target(&fx, "b1", "")], &CancellationToken::new()).await?;
        assert!(!result.success);
        assert_eq!(result.restored_files, 0);
        assert_eq!(result.failed_files.len(), 3);
        assert!(!fx.temp_dir.path().join("restored/index.html").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_validation() -> Result<()> {
        let fx = fixture()?;
        let source = source_tree(&fx)?;
        back_up(&fx, &source, "b1", false).await?;
        let restorer = Restorer::new(fx.pool.clone(), Arc::clone(&fx.cipher), 2);

        assert!(restorer.validate(&target(&fx, "b1", ""))?.valid);
        assert!(!restorer.validate(&target(&fx, "missing", ""))?.valid);
        assert!(!restorer.validate(&target(&fx, "b1", "no/such/dir"))?.valid);

        let mut onto_file = target(&fx, "b1", "");
        onto_file.target_path = source.join("index.html").join("sub");
        assert!(!restorer.validate(&onto_file)?.valid);

        let result = restorer.restore(&[onto_file], &CancellationToken::new()).await?;
        assert!(!result.success);
        assert!(!result.errors.is_empty());
        Ok(())
    }

    #[test]
    fn test_prefix_and_key_safety() {
        assert!(under_prefix("conf/app.ini", "conf"));
        assert!(under_prefix("conf", "conf"));
        assert!(!under_prefix("config/x", "conf"));
        assert!(under_prefix("anything", ""));
        assert!(safe_join(Path::new("/r"), "../etc/passwd").is_err());
        assert!(safe_join(Path::new("/r"), "/etc/passwd").is_err());
        assert!(safe_join(Path::new("/r"), "a/b").is_ok());
    }
}
