//! One backup run, stage by stage.

use super::Engine;
use crate::archive::{self, ArchiveInput, BuiltArchive};
use crate::compress::Algorithm;
use crate::crypto::ENCRYPTION_TYPE;
use crate::dedup::DedupStats;
use crate::models::backup_job::BackupJob;
use crate::models::backup_run::{self, RunOutcome, STATUS_COMPLETED, STATUS_FAILED, STATUS_SKIPPED, TYPE_FULL, TYPE_INCREMENTAL};
use crate::models::snapshot::Snapshot;
use crate::models::{format_ts, manifest as manifest_rows};
use crate::replicate::ReplicationResult;
use crate::restore::ARCHIVE_FILE;
use crate::snapshot::{ChangeKind, ChangeSet, ChangeSummary};
use crate::utils::errors::{EngineError, Result};
use crate::verify::VerificationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    IncrementalDiff,
    FullScan,
    NoChanges,
    ArchiveBuild,
    Compress,
    Encrypt,
    Replicate,
    ManifestVerify,
    SnapshotCommit,
    RetentionCleanup,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::IncrementalDiff => "incremental_diff",
            Stage::FullScan => "full_scan",
            Stage::NoChanges => "no_changes",
            Stage::ArchiveBuild => "archive_build",
            Stage::Compress => "compress",
            Stage::Encrypt => "encrypt",
            Stage::Replicate => "replicate",
            Stage::ManifestVerify => "manifest_verify",
            Stage::SnapshotCommit => "snapshot_commit",
            Stage::RetentionCleanup => "retention_cleanup",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    /// `None` when the run was refused before an id was allocated
    pub backup_id: Option<String>,
    pub job_id: String,
    pub status: BackupStatus,
    pub success: bool,
    pub backup_type: Option<String>,
    pub final_stage: Stage,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Files written to this backup's archive
    pub total_files: u64,
    pub total_size: u64,
    /// Size of `archive.dat` after compression and encryption
    pub compressed_size: u64,
    pub dedup_stats: Option<DedupStats>,
    pub change_summary: Option<ChangeSummary>,
    pub replication_results: Vec<ReplicationResult>,
    pub verification_result: Option<VerificationResult>,
    /// (path, reason) for entries that could not be read or were left out
    /// of the archive; they are picked up again by the next run
    #[serde(default)]
    pub skipped_files: Vec<(String, String)>,
    pub error: Option<String>,
}

impl BackupResult {
    fn new(job_id: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            backup_id: None,
            job_id: job_id.to_string(),
            status: BackupStatus::Failed,
            success: false,
            backup_type: None,
            final_stage: Stage::Start,
            start_time,
            end_time: start_time,
            total_files: 0,
            total_size: 0,
            compressed_size: 0,
            dedup_stats: None,
            change_summary: None,
            replication_results: Vec::new(),
            verification_result: None,
            skipped_files: Vec::new(),
            error: None,
        }
    }

    fn refused(job_id: &str, start_time: DateTime<Utc>, reason: impl Into<String>) -> Self {
        let mut result = Self::new(job_id, start_time);
        result.final_stage = Stage::Failed;
        result.error = Some(reason.into());
        result
    }
}

/// State carried from stage to stage
struct Run {
    job: BackupJob,
    backup_id: String,
    output_dir: PathBuf,
    cancel: CancellationToken,
    stage: Stage,
    compression_type: String,
    encryption_type: String,
    result: BackupResult,
}

impl Run {
    /// Stage boundary: stop here when cancelled
    fn enter(&mut self, stage: Stage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        debug!(job_id = %self.job.id, backup_id = %self.backup_id, stage = %stage, "Stage started");
        self.stage = stage;
        Ok(())
    }
}

impl Engine {
    /// Run `job_id` once. Every outcome, including refusals, is reported in
    /// the returned result.
    pub async fn run(&self, job_id: &str) -> BackupResult {
        self.run_with_cancel(job_id, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(&self, job_id: &str, cancel: CancellationToken) -> BackupResult {
        let start_time = self.clock.now();

        let job = match self.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                return BackupResult::refused(job_id, start_time, format!("job {} not found", job_id))
            }
            Err(e) => return BackupResult::refused(job_id, start_time, e.to_string()),
        };

        let Some(_guard) = self.tracker.try_register(job_id, cancel.clone()) else {
            warn!(job_id = %job_id, "Run refused, job already running");
            return BackupResult::refused(job_id, start_time, "job already running");
        };

        let backup_id = self.clock.new_backup_id();
        let output_dir = Path::new(&job.destination).join(&job.id).join(&backup_id);
        let mut result = BackupResult::new(job_id, start_time);
        result.backup_id = Some(backup_id.clone());

        let mut run = Run {
            job,
            backup_id,
            output_dir,
            cancel,
            stage: Stage::Start,
            compression_type: Algorithm::None.name().to_string(),
            encryption_type: "none".to_string(),
            result,
        };

        info!(job_id = %run.job.id, backup_id = %run.backup_id, "Starting backup run");
        let outcome = self.execute(&mut run).await;
        run.result.end_time = self.clock.now();

        match outcome {
            Ok(BackupStatus::Completed) => {
                run.result.status = BackupStatus::Completed;
                run.result.success = true;
                run.result.final_stage = Stage::Done;
                info!(
                    job_id = %run.job.id,
                    backup_id = %run.backup_id,
                    files = run.result.total_files,
                    bytes = run.result.total_size,
                    stored = run.result.compressed_size,
                    "Backup run completed"
                );
            }
            Ok(_) => {
                run.result.status = BackupStatus::Skipped;
                run.result.success = true;
                run.result.final_stage = Stage::NoChanges;
                info!(job_id = %run.job.id, backup_id = %run.backup_id, "No changes since last backup, run skipped");
                self.abandon(&run, STATUS_SKIPPED, None).await;
            }
            Err(e) => {
                let reason = format!("{}: {}", run.stage, e);
                error!(job_id = %run.job.id, backup_id = %run.backup_id, error = %reason, "Backup run failed");
                run.result.status = BackupStatus::Failed;
                run.result.success = false;
                run.result.final_stage = Stage::Failed;
                self.abandon(&run, STATUS_FAILED, Some(reason.clone())).await;
                run.result.error = Some(reason);
            }
        }

        run.result
    }

    async fn execute(&self, run: &mut Run) -> Result<BackupStatus> {
        run.enter(Stage::Start)?;
        let baseline = if run.job.incremental { self.usable_baseline(&run.job)? } else { None };
        let backup_type = if baseline.is_some() { TYPE_INCREMENTAL } else { TYPE_FULL };
        run.result.backup_type = Some(backup_type.to_string());
        {
            let conn = self.pool.get()?;
            backup_run::create(
                &conn,
                &run.backup_id,
                &run.job.id,
                backup_type,
                &run.output_dir.display().to_string(),
                &format_ts(&run.result.start_time),
            )?;
        }

        // Scan
        run.enter(if baseline.is_some() { Stage::IncrementalDiff } else { Stage::FullScan })?;
        let is_full = baseline.is_none();
        let roots: Vec<PathBuf> = run.job.source_paths.iter().map(PathBuf::from).collect();
        let mut changes = self.snapshots.scan_changes(baseline, &roots, &run.cancel).await?;
        let summary = changes.summary();
        run.result.change_summary = Some(summary);
        info!(
            job_id = %run.job.id,
            created = summary.created,
            modified = summary.modified,
            deleted = summary.deleted,
            renamed = summary.renamed,
            unchanged = summary.unchanged,
            "Change scan finished"
        );

        if is_full && changes.current.is_empty() {
            return Err(EngineError::config("no files found in source paths"));
        }
        if !is_full && !changes.has_changes() {
            run.enter(Stage::NoChanges)?;
            return Ok(BackupStatus::Skipped);
        }

        let changed = changes.get_changed_paths();
        if run.job.dedup {
            let files: Vec<(String, PathBuf)> = changed
                .iter()
                .filter_map(|key| changes.locations.get(key).map(|path| (key.clone(), path.clone())))
                .collect();
            let batch = self
                .blocks
                .deduplicate_files(files, &run.backup_id, &run.cancel)
                .await?;
            info!(
                job_id = %run.job.id,
                blocks = batch.stats.total_blocks,
                duplicated = batch.stats.duplicated_blocks,
                saved = batch.stats.space_saved,
                "Dedup analysis finished"
            );
            run.result.dedup_stats = Some(batch.stats);
        }

        run.enter(Stage::ArchiveBuild)?;
        tokio::fs::create_dir_all(&run.output_dir).await?;
        let inputs = archive_inputs(&changes, &changed);
        let output_dir = run.output_dir.clone();
        let (tar, built) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut tar = staging_file(&output_dir, ".archive-")?;
            let built = archive::build(&inputs, tar.as_file_mut())?;
            Ok((tar, built))
        })
        .await??;
        leave_for_next_run(&mut changes, &built);
        run.result.skipped_files = changes.unreadable.iter().chain(&built.skipped).cloned().collect();
        if !run.result.skipped_files.is_empty() {
            warn!(
                job_id = %run.job.id,
                count = run.result.skipped_files.len(),
                "Some files were not backed up and are left for the next run"
            );
        }
        run.result.total_files = built.members.len() as u64;
        run.result.total_size = built.content_size();
        debug!(backup_id = %run.backup_id, tar_bytes = built.archive_size, "Archive built");
        let BuiltArchive { members, .. } = built;

        run.enter(Stage::Compress)?;
        let compressor = Arc::clone(&self.compressor);
        let enabled = run.job.compression;
        let output_dir = run.output_dir.clone();
        let (compressed, algorithm) = tokio::task::spawn_blocking(move || -> Result<_> {
            let compressed = staging_file(&output_dir, ".compressed-")?;
            let algorithm = if enabled {
                compressor.compress_file(tar.path(), compressed.path())?.algorithm
            } else {
                compressor.compress_file_with(tar.path(), compressed.path(), Algorithm::None)?;
                Algorithm::None
            };
            Ok((compressed, algorithm))
        })
        .await??;
        run.compression_type = algorithm.name().to_string();

        run.enter(Stage::Encrypt)?;
        let archive_path = run.output_dir.join(ARCHIVE_FILE);
        let encrypted = run.job.encryption;
        let cipher = Arc::clone(&self.cipher);
        let target = archive_path.clone();
        run.result.compressed_size = tokio::task::spawn_blocking(move || -> Result<u64> {
            if encrypted {
                let staging = target.with_extension("partial");
                cipher.encrypt_file(compressed.path(), &staging, None)?;
                std::fs::rename(&staging, &target)?;
            } else {
                compressed.persist(&target).map_err(|e| e.error)?;
            }
            Ok(std::fs::metadata(&target)?.len())
        })
        .await??;
        if encrypted {
            run.encryption_type = ENCRYPTION_TYPE.to_string();
        }

        run.enter(Stage::Replicate)?;
        run.result.replication_results = self.replicate(run, &archive_path).await;
        for failed in run.result.replication_results.iter().filter(|r| !r.success) {
            warn!(
                job_id = %run.job.id,
                destination = %failed.destination,
                error = failed.error.as_deref().unwrap_or("unknown"),
                "Replication failed, local copy kept"
            );
        }

        run.enter(Stage::ManifestVerify)?;
        self.verifier
            .build_manifest(
                &run.backup_id,
                &run.output_dir,
                &run.compression_type,
                &run.encryption_type,
                &run.cancel,
            )
            .await?;
        if run.job.verify_integrity {
            let verification = self.verifier.verify(&run.backup_id, &run.cancel).await?;
            let passed = verification.success;
            let reason = verification.error.clone();
            run.result.verification_result = Some(verification);
            if !passed {
                return Err(EngineError::integrity(
                    reason.unwrap_or_else(|| "backup output does not match its manifest".into()),
                ));
            }
        }

        run.enter(Stage::SnapshotCommit)?;
        self.snapshots.save_as_snapshot(
            &changes,
            &run.backup_id,
            Some(&run.job.id),
            &format!("{} backup of job {}", backup_type, run.job.name),
        )?;
        {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction()?;
            backup_run::insert_files(&tx, &run.backup_id, &members)?;
            backup_run::finish(
                &tx,
                &run.backup_id,
                &RunOutcome {
                    status: STATUS_COMPLETED,
                    finished_at: format_ts(&self.clock.now()),
                    total_files: run.result.total_files as i64,
                    total_size: run.result.total_size as i64,
                    compressed_size: run.result.compressed_size as i64,
                    compression_type: run.compression_type.clone(),
                    encryption_type: run.encryption_type.clone(),
                    error: None,
                },
            )?;
            tx.commit()?;
        }

        run.stage = Stage::RetentionCleanup;
        if let Err(e) = self.apply_retention(&run.job) {
            warn!(job_id = %run.job.id, error = %e, "Retention cleanup failed");
        }

        run.stage = Stage::Done;
        Ok(BackupStatus::Completed)
    }

    /// Latest snapshot of the job, if its backup chain is still intact
    fn usable_baseline(&self, job: &BackupJob) -> Result<Option<Snapshot>> {
        let Some(snapshot) = self.snapshots.latest_for_job(&job.id)? else {
            return Ok(None);
        };
        let conn = self.pool.get()?;
        if backup_run::restore_chain(&conn, &job.id, &snapshot.name)?.is_empty() {
            info!(job_id = %job.id, snapshot = %snapshot.name, "Baseline has no restorable chain, running full backup");
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// One result per configured name, in job order
    async fn replicate(&self, run: &Run, archive_path: &Path) -> Vec<ReplicationResult> {
        let names = &run.job.replication_destinations;
        if names.is_empty() {
            return Vec::new();
        }
        let resolved: Vec<_> = names.iter().map(|n| self.destinations.destination(n)).collect();
        let known: Vec<_> = resolved.iter().flatten().cloned().collect();
        let remote_path = remote_path(run);

        let mut uploaded = self
            .replicator
            .replicate(archive_path, &known, &remote_path, &run.cancel)
            .await
            .into_iter();

        names
            .iter()
            .zip(resolved)
            .map(|(name, destination)| match destination {
                Some(_) => uploaded.next().unwrap_or_else(|| {
                    ReplicationResult::failed(name, "no result from replicator", Instant::now())
                }),
                None => ReplicationResult::failed(name, "unknown destination", Instant::now()),
            })
            .collect()
    }

    /// Undo a run that did not complete and record how it ended
    async fn abandon(&self, run: &Run, status: &'static str, error: Option<String>) {
        self.take_back_replicas(run).await;
        if let Err(e) = self.blocks.release_owner(&run.backup_id) {
            warn!(backup_id = %run.backup_id, error = %e, "Failed to release dedup references");
        }
        if let Err(e) = self.snapshots.delete(&run.backup_id) {
            warn!(backup_id = %run.backup_id, error = %e, "Failed to remove snapshot");
        }
        match std::fs::remove_dir_all(&run.output_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %run.output_dir.display(), error = %e, "Failed to remove partial output"),
        }

        let recorded = self.pool.get().map_err(EngineError::from).and_then(|conn| {
            manifest_rows::delete(&conn, &run.backup_id)?;
            backup_run::finish(
                &conn,
                &run.backup_id,
                &RunOutcome {
                    status,
                    finished_at: format_ts(&self.clock.now()),
                    compression_type: run.compression_type.clone(),
                    encryption_type: run.encryption_type.clone(),
                    error,
                    ..Default::default()
                },
            )
        });
        if let Err(e) = recorded {
            warn!(backup_id = %run.backup_id, error = %e, "Failed to record run outcome");
        }
    }

    /// Delete this run's archive from every destination it reached
    async fn take_back_replicas(&self, run: &Run) {
        let reached: Vec<_> = run
            .result
            .replication_results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| self.destinations.destination(&r.destination))
            .collect();
        if reached.is_empty() {
            return;
        }
        let left = self.replicator.remove(&reached, &remote_path(run)).await;
        if !left.is_empty() {
            warn!(backup_id = %run.backup_id, destinations = ?left, "Abandoned archive left on destinations");
        }
    }
}

fn remote_path(run: &Run) -> String {
    format!("{}/{}/{}", run.job.id, run.backup_id, ARCHIVE_FILE)
}

fn staging_file(dir: &Path, prefix: &str) -> Result<tempfile::NamedTempFile> {
    Ok(tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?)
}

fn archive_inputs(changes: &ChangeSet, keys: &[String]) -> Vec<ArchiveInput> {
    keys.iter()
        .filter_map(|key| {
            let record = changes.record(key)?;
            let path = changes.locations.get(key)?;
            Some(ArchiveInput {
                key: key.clone(),
                path: path.clone(),
                expected: Some((record.size, record.content_hash.clone())),
                mtime: record.mtime,
            })
        })
        .collect()
}

/// Files left out of the archive must not enter the new baseline as if
/// they were stored. A modified file keeps its previous record (its old
/// bytes live in an earlier archive); a new or renamed file is dropped so
/// the next run sees it again.
fn leave_for_next_run(changes: &mut ChangeSet, built: &BuiltArchive) {
    if built.skipped.is_empty() {
        return;
    }
    let previous: HashMap<&str, _> = changes
        .changes
        .iter()
        .filter(|c| c.kind == ChangeKind::Modified)
        .filter_map(|c| c.old_record.as_ref().map(|old| (c.path.as_str(), old.clone())))
        .collect();

    let mut current = Vec::with_capacity(changes.current.len());
    for record in std::mem::take(&mut changes.current) {
        if !built.skipped.iter().any(|(key, _)| *key == record.path) {
            current.push(record);
        } else if let Some(old) = previous.get(record.path.as_str()) {
            current.push(old.clone());
        }
    }

    for (key, _) in &built.skipped {
        changes.locations.remove(key);
    }
    changes.current = current;
}

#[cfg(test)]
mod tests {
    use super::super::tests::{job_for, test_engine, write_tree};
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::models::backup_job::UpdateBackupJob;
    use crate::models::snapshot::FileRecord;
    use crate::snapshot::FileChange;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn assert_restored(root: &Path, files: &[(String, Vec<u8>)]) {
        for (key, data) in files {
            let restored = fs::read(root.join(key)).unwrap_or_default();
            assert_eq!(&restored, data, "restored bytes differ for {}", key);
        }
    }

    #[tokio::test]
    async fn test_full_run_then_restore_is_byte_identical() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        let files = write_tree(&source, 10)?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let job = job_for(&engine, &temp_dir, &source)?;

        let result = engine.run(&job.id).await;
        assert!(result.success, "run failed: {:?}", result.error);
        assert_eq!(result.status, BackupStatus::Completed);
        assert_eq!(result.final_stage, Stage::Done);
        assert_eq!(result.backup_type.as_deref(), Some(TYPE_FULL));
        assert_eq!(result.total_files, 10);
        assert!(result.dedup_stats.is_some());
        assert!(result.verification_result.as_ref().map_or(false, |v| v.success));

        let backup_id = result.backup_id.clone().unwrap_or_default();
        assert_eq!(result.replication_results.len(), 1);
        assert!(result.replication_results[0].success);
        assert!(temp_dir
            .path()
            .join("mirror")
            .join(&job.id)
            .join(&backup_id)
            .join(ARCHIVE_FILE)
            .exists());

        // Stored archive is sealed, not a plain tar
        let stored = fs::read(
            temp_dir.path().join("backups").join(&job.id).join(&backup_id).join(ARCHIVE_FILE),
        )?;
        assert!(crate::crypto::is_sealed(&stored));

        let restore_dir = temp_dir.path().join("restore");
        let restored = engine.restore(&backup_id, &restore_dir, None).await?;
        assert!(restored.success, "restore failed: {:?}", restored.errors);
        assert_eq!(restored.restored_files, 10);
        assert_restored(&restore_dir, &files);
        Ok(())
    }

    #[tokio::test]
    async fn test_incremental_run_then_skip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        let mut files = write_tree(&source, 10)?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let job = job_for(&engine, &temp_dir, &source)?;

        let first = engine.run(&job.id).await;
        assert!(first.success, "first run failed: {:?}", first.error);

        files[1].1 = b"rewritten content".to_vec();
        fs::write(source.join(&files[1].0), &files[1].1)?;
        files.push(("added.txt".to_string(), b"new file".to_vec()));
        fs::write(source.join("added.txt"), b"new file")?;

        let second = engine.run(&job.id).await;
        assert!(second.success, "second run failed: {:?}", second.error);
        assert_eq!(second.backup_type.as_deref(), Some(TYPE_INCREMENTAL));
        assert_eq!(second.total_files, 2);
        let summary = second.change_summary.unwrap_or_default();
        assert_eq!((summary.created, summary.modified, summary.unchanged), (1, 1, 9));

        let third = engine.run(&job.id).await;
        assert!(third.success);
        assert_eq!(third.status, BackupStatus::Skipped);
        assert_eq!(third.final_stage, Stage::NoChanges);
        let skipped_dir = temp_dir
            .path()
            .join("backups")
            .join(&job.id)
            .join(third.backup_id.clone().unwrap_or_default());
        assert!(!skipped_dir.exists());

        // The incremental backup restores the whole tree through its chain
        let second_id = second.backup_id.clone().unwrap_or_default();
        let restore_dir = temp_dir.path().join("restore");
        let restored = engine.restore(&second_id, &restore_dir, None).await?;
        assert!(restored.success, "restore failed: {:?}", restored.failed_files);
        assert_eq!(restored.restored_files, 11);
        assert_restored(&restore_dir, &files);

        let status = engine.status(Some(&job.id))?;
        assert_eq!(status.runs_by_status.get("completed"), Some(&2));
        assert_eq!(status.runs_by_status.get("skipped"), Some(&1));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_of_same_job_refused() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        write_tree(&source, 2)?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let job = job_for(&engine, &temp_dir, &source)?;

        let _guard = engine.tracker.try_register(&job.id, CancellationToken::new());
        let result = engine.run(&job.id).await;
        assert_eq!(result.status, BackupStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("job already running"));
        assert!(result.backup_id.is_none());
        assert!(engine.list_runs(&job.id, 10)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_job_and_missing_source() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;

        let result = engine.run("no-such-job").await;
        assert!(!result.success);
        assert_eq!(result.final_stage, Stage::Failed);

        let job = job_for(&engine, &temp_dir, &temp_dir.path().join("absent"))?;
        let result = engine.run(&job.id).await;
        assert!(!result.success);
        assert!(result.error.unwrap_or_default().starts_with("full_scan:"));
        let runs = engine.list_runs(&job.id, 10)?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, STATUS_FAILED);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_nothing_behind() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        write_tree(&source, 5)?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let job = job_for(&engine, &temp_dir, &source)?;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.run_with_cancel(&job.id, cancel).await;
        assert_eq!(result.status, BackupStatus::Failed);
        assert!(result.error.unwrap_or_default().contains("cancelled"));
        assert!(!engine.tracker.is_running(&job.id));
        assert!(engine.snapshots.latest_for_job(&job.id)?.is_none());
        assert_eq!(engine.blocks.index_stats()?.references, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_keeps_restore_chain() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        let files = write_tree(&source, 4)?;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = test_engine(&temp_dir, clock.clone())?;
        let job = job_for(&engine, &temp_dir, &source)?;
        engine.update_job(
            &job.id,
            &UpdateBackupJob {
                retention_days: Some(1),
                ..Default::default()
            },
        )?;

        let mut ids = Vec::new();
        for (i, days) in [0, 1, 5].into_iter().enumerate() {
            clock.advance(chrono::Duration::days(days));
            fs::write(source.join(&files[0].0), format!("revision {}", i))?;
            let result = engine.run(&job.id).await;
            assert!(result.success, "run {} failed: {:?}", i, result.error);
            ids.push(result.backup_id.unwrap_or_default());
        }

        // The first two are past retention but the newest backup needs them
        assert_eq!(engine.list_runs(&job.id, 10)?.len(), 3);

        engine.update_job(
            &job.id,
            &UpdateBackupJob {
                incremental: Some(false),
                ..Default::default()
            },
        )?;
        clock.advance(chrono::Duration::days(6));
        fs::write(source.join(&files[0].0), "final revision")?;
        let full = engine.run(&job.id).await;
        assert!(full.success, "full run failed: {:?}", full.error);
        assert_eq!(full.backup_type.as_deref(), Some(TYPE_FULL));

        let runs = engine.list_runs(&job.id, 10)?;
        assert_eq!(runs.len(), 1);
        for id in &ids {
            assert!(!temp_dir.path().join("backups").join(&job.id).join(id).exists());
            assert!(engine.snapshots.get(id)?.is_none());
        }
        assert_eq!(engine.blocks.index_stats()?.unreferenced, 0);

        let restore_dir = temp_dir.path().join("restore");
        let restored = engine
            .restore(&full.backup_id.unwrap_or_default(), &restore_dir, None)
            .await?;
        assert_eq!(restored.restored_files, 4);
        assert_eq!(fs::read(restore_dir.join(&files[0].0))?, b"final revision");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_entry_reported_and_run_succeeds() -> Result<()> {
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        let files = write_tree(&source, 3)?;
        fs::write(source.join(std::ffi::OsStr::from_bytes(b"bad-\xff.txt")), b"odd name")?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let job = job_for(&engine, &temp_dir, &source)?;

        let result = engine.run(&job.id).await;
        assert!(result.success, "run failed: {:?}", result.error);
        assert_eq!(result.total_files, 3);
        assert_eq!(result.skipped_files.len(), 1);
        let (path, reason) = &result.skipped_files[0];
        assert!(path.contains("bad-"), "{}", path);
        assert!(reason.contains("UTF-8"), "{}", reason);

        let restore_dir = temp_dir.path().join("restore");
        let restored = engine
            .restore(&result.backup_id.unwrap_or_default(), &restore_dir, None)
            .await?;
        assert_eq!(restored.restored_files, 3);
        assert_restored(&restore_dir, &files);
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_run_takes_back_replicated_archive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let job = job_for(&engine, &temp_dir, &temp_dir.path().join("source"))?;
        let backup_id = "abandoned-after-upload".to_string();
        let output_dir = temp_dir.path().join("backups").join(&job.id).join(&backup_id);
        let archive_path = output_dir.join(ARCHIVE_FILE);
        fs::create_dir_all(&output_dir)?;
        fs::write(&archive_path, b"sealed archive bytes")?;
        {
            let conn = engine.pool.get()?;
            backup_run::create(
                &conn,
                &backup_id,
                &job.id,
                TYPE_FULL,
                &output_dir.display().to_string(),
                &format_ts(&Utc::now()),
            )?;
        }

        let mut run = Run {
            result: BackupResult::new(&job.id, Utc::now()),
            job,
            backup_id,
            output_dir: output_dir.clone(),
            cancel: CancellationToken::new(),
            stage: Stage::ManifestVerify,
            compression_type: Algorithm::Zstd.name().to_string(),
            encryption_type: ENCRYPTION_TYPE.to_string(),
        };
        run.result.replication_results = engine.replicate(&run, &archive_path).await;
        assert!(run.result.replication_results[0].success);
        let replica = temp_dir
            .path()
            .join("mirror")
            .join(&run.job.id)
            .join(&run.backup_id)
            .join(ARCHIVE_FILE);
        assert!(replica.exists());

        engine
            .abandon(&run, STATUS_FAILED, Some("manifest_verify: mismatch".into()))
            .await;
        assert!(!replica.exists());
        assert!(!output_dir.exists());
        let runs = engine.list_runs(&run.job.id, 10)?;
        assert_eq!(runs[0].status, STATUS_FAILED);
        Ok(())
    }

    fn record(path: &str, hash: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size: 1,
            mtime: 0,
            mtime_nsec: 0,
            ctime: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            content_hash: hash.to_string(),
            inode: 1,
        }
    }

    #[test]
    fn test_skipped_files_left_for_next_run() {
        let mut changes = ChangeSet {
            baseline: None,
            source_root: "/src".to_string(),
            changes: vec![
                FileChange {
                    path: "a.txt".into(),
                    kind: ChangeKind::Modified,
                    old_record: Some(record("a.txt", "old")),
                    new_record: Some(record("a.txt", "new")),
                    similarity_score: 0.0,
                    old_path: None,
                },
                FileChange {
                    path: "b.txt".into(),
                    kind: ChangeKind::Created,
                    old_record: None,
                    new_record: Some(record("b.txt", "b")),
                    similarity_score: 0.0,
                    old_path: None,
                },
            ],
            current: vec![record("a.txt", "new"), record("b.txt", "b"), record("c.txt", "c")],
            locations: BTreeMap::new(),
            unreadable: Vec::new(),
        };
        let built = BuiltArchive {
            skipped: vec![
                ("a.txt".to_string(), "changed during backup".to_string()),
                ("b.txt".to_string(), "changed during backup".to_string()),
            ],
            ..Default::default()
        };

        leave_for_next_run(&mut changes, &built);
        let kept: Vec<_> = changes
            .current
            .iter()
            .map(|r| (r.path.as_str(), r.content_hash.as_str()))
            .collect();
        assert_eq!(kept, vec![("a.txt", "old"), ("c.txt", "c")]);
    }
}
