//! Backup engine - owns the components and runs jobs through the pipeline.
//!
//! A run moves through these stages:
//!
//! ```text
//! Start -> IncrementalDiff | FullScan -> [NoChanges: skipped]
//!       -> ArchiveBuild -> Compress -> Encrypt -> Replicate
//!       -> ManifestVerify -> SnapshotCommit -> RetentionCleanup -> Done
//! ```
//!
//! Any stage can end the run in `Failed`. Only one run per job executes at a
//! time, and every run carries a cancellation token that is checked at each
//! stage boundary.

pub mod pipeline;
pub mod retention;
pub mod tracker;

pub use pipeline::{BackupResult, BackupStatus, Stage};
pub use retention::RetentionReport;

use crate::clock::{Clock, SystemClock};
use crate::compress::Compressor;
use crate::config::EngineConfig;
use crate::crypto::Cipher;
use crate::db::{create_pool, migrate, DbPool};
use crate::dedup::BlockStore;
use crate::models::backup_job::{self, BackupJob, NewBackupJob, UpdateBackupJob};
use crate::models::backup_run::{self, BackupRun};
use crate::models::block::IndexStats;
use crate::models::{format_ts, verification};
use crate::replicate::{DestinationProvider, Replicator};
use crate::restore::{RestorePreview, RestoreResult, RestoreTarget, Restorer};
use crate::snapshot::SnapshotStore;
use crate::utils::errors::{EngineError, Result};
use crate::verify::signer::ManifestSigner;
use crate::verify::{RepairResult, VerificationResult, Verifier};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use tracker::JobTracker;
use tracing::{info, warn};

/// Latest backups scoring below this count as unhealthy
const HEALTHY_SCORE: f64 = 0.9;

/// Runs listed by [`Engine::status`]
const RECENT_RUNS: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub jobs: usize,
    pub running: Vec<String>,
    pub runs_by_status: BTreeMap<String, i64>,
    pub recent_runs: Vec<BackupRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupHealth {
    pub job_id: String,
    pub backup_id: String,
    /// `None` until the backup has been verified
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub hostname: String,
    pub checked_at: DateTime<Utc>,
    pub healthy: bool,
    pub jobs: usize,
    pub running: Vec<String>,
    pub failed_verifications_24h: i64,
    pub index: IndexStats,
    /// Latest completed backup of every job
    pub backups: Vec<BackupHealth>,
}

pub struct Engine {
    config: EngineConfig,
    pool: DbPool,
    clock: Arc<dyn Clock>,
    destinations: Arc<dyn DestinationProvider>,
    blocks: Arc<BlockStore>,
    snapshots: SnapshotStore,
    compressor: Arc<Compressor>,
    cipher: Arc<Cipher>,
    verifier: Verifier,
    replicator: Replicator,
    restorer: Restorer,
    tracker: JobTracker,
}

impl Engine {
    /// Open the engine with the system clock and destinations from `config`
    pub fn open(config: EngineConfig) -> Result<Self> {
        let destinations = Arc::new(config.clone());
        Self::open_with(config, Arc::new(SystemClock), destinations)
    }

    pub fn open_with(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        destinations: Arc<dyn DestinationProvider>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.engine.data_dir)?;

        let pool = create_pool(&config.db_path())?;
        migrate(&pool)?;
        let interrupted = {
            let conn = pool.get()?;
            backup_run::mark_interrupted(&conn, &format_ts(&clock.now()))?
        };
        if interrupted > 0 {
            warn!(interrupted, "Runs left over from a previous process marked failed");
        }

        let workers = config.engine.workers;
        let keys_dir = config.keys_dir();
        let cipher = Arc::new(Cipher::open(&keys_dir, config.crypto.pbkdf2_iterations)?);
        let signer = Arc::new(ManifestSigner::load_or_create(&keys_dir)?);

        let engine = Self {
            blocks: BlockStore::open(pool.clone(), &config.dedup, workers)?,
            snapshots: SnapshotStore::new(pool.clone(), workers, Arc::clone(&clock)),
            compressor: Arc::new(Compressor::new(config.compression.clone())),
            verifier: Verifier::new(pool.clone(), signer, workers, Arc::clone(&clock)),
            replicator: Replicator::new(workers)
                .with_timeout(StdDuration::from_secs(config.engine.replication_timeout_secs)),
            restorer: Restorer::new(pool.clone(), Arc::clone(&cipher), workers),
            tracker: JobTracker::new(),
            cipher,
            config,
            pool,
            clock,
            destinations,
        };

        info!(
            data_dir = %engine.config.engine.data_dir.display(),
            workers,
            "Backup engine opened"
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Jobs ──

    pub fn create_job(&self, data: &NewBackupJob) -> Result<BackupJob> {
        self.check_destinations(&data.replication_destinations)?;
        let conn = self.pool.get()?;
        let job = backup_job::create(&conn, data)?;
        info!(job_id = %job.id, name = %job.name, "Backup job created");
        Ok(job)
    }

    pub fn update_job(&self, id: &str, data: &UpdateBackupJob) -> Result<Option<BackupJob>> {
        if let Some(names) = &data.replication_destinations {
            self.check_destinations(names)?;
        }
        let conn = self.pool.get()?;
        backup_job::update(&conn, id, data)
    }

    /// Delete a job together with every backup it produced
    pub fn delete_job(&self, id: &str) -> Result<bool> {
        if self.tracker.is_running(id) {
            return Err(EngineError::config(format!("job {} is running", id)));
        }
        let runs = {
            let conn = self.pool.get()?;
            if backup_job::find_by_id(&conn, id)?.is_none() {
                return Ok(false);
            }
            backup_run::find_by_job_id(&conn, id, i64::MAX)?
        };

        for run in &runs {
            self.remove_backup(run)?;
        }
        self.blocks.cleanup_unused_blocks()?;

        let conn = self.pool.get()?;
        let deleted = backup_job::delete(&conn, id)?;
        info!(job_id = %id, backups = runs.len(), "Backup job deleted");
        Ok(deleted)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<BackupJob>> {
        let conn = self.pool.get()?;
        backup_job::find_by_id(&conn, id)
    }

    pub fn list_jobs(&self) -> Result<Vec<BackupJob>> {
        let conn = self.pool.get()?;
        backup_job::find_all(&conn)
    }

    /// Newest first
    pub fn list_runs(&self, job_id: &str, limit: i64) -> Result<Vec<BackupRun>> {
        let conn = self.pool.get()?;
        backup_run::find_by_job_id(&conn, job_id, limit)
    }

    fn check_destinations(&self, names: &[String]) -> Result<()> {
        for name in names {
            if self.destinations.destination(name).is_none() {
                return Err(EngineError::config(format!(
                    "replication destination '{}' is not configured",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Check that a configured destination is reachable and writable
    pub async fn test_destination(&self, name: &str) -> Result<()> {
        let destination = self.destinations.destination(name).ok_or_else(|| {
            EngineError::config(format!("replication destination '{}' is not configured", name))
        })?;
        self.replicator.test_destination(&destination).await?;
        info!(destination = %name, kind = ?destination.kind(), "Destination reachable");
        Ok(())
    }

    /// Cancel the running job, if any
    pub fn cancel(&self, job_id: &str) -> bool {
        let cancelled = self.tracker.cancel(job_id);
        if cancelled {
            info!(job_id = %job_id, "Cancellation requested");
        }
        cancelled
    }

    // ── Restore and verification ──

    /// Restore `backup_id` into `target_path`. `files` selects keys or key
    /// prefixes; `None` restores everything.
    pub async fn restore(
        &self,
        backup_id: &str,
        target_path: &Path,
        files: Option<Vec<String>>,
    ) -> Result<RestoreResult> {
        self.restore_with_cancel(backup_id, target_path, files, &CancellationToken::new())
            .await
    }

    pub async fn restore_with_cancel(
        &self,
        backup_id: &str,
        target_path: &Path,
        files: Option<Vec<String>>,
        cancel: &CancellationToken,
    ) -> Result<RestoreResult> {
        let targets = restore_targets(backup_id, target_path, files);
        self.restorer.restore(&targets, cancel).await
    }

    pub fn preview_restore(&self, backup_id: &str, source_path: &str) -> Result<RestorePreview> {
        self.restorer.preview(&RestoreTarget {
            snapshot_name: backup_id.to_string(),
            source_path: source_path.to_string(),
            target_path: PathBuf::new(),
        })
    }

    pub async fn verify(&self, backup_id: &str) -> Result<VerificationResult> {
        self.verifier.verify(backup_id, &CancellationToken::new()).await
    }

    pub async fn repair(&self, backup_id: &str, source_dir: &Path) -> Result<RepairResult> {
        self.verifier
            .repair(backup_id, source_dir, &CancellationToken::new())
            .await
    }

    // ── Reporting ──

    pub fn status(&self, job_id: Option<&str>) -> Result<StatusSummary> {
        let conn = self.pool.get()?;
        let jobs = match job_id {
            Some(id) => usize::from(backup_job::find_by_id(&conn, id)?.is_some()),
            None => backup_job::find_all(&conn)?.len(),
        };
        let recent_runs = match job_id {
            Some(id) => backup_run::find_by_job_id(&conn, id, RECENT_RUNS)?,
            None => backup_run::find_recent(&conn, RECENT_RUNS)?,
        };
        let running = match job_id {
            Some(id) => self.tracker.running().into_iter().filter(|r| r == id).collect(),
            None => self.tracker.running(),
        };

        Ok(StatusSummary {
            jobs,
            running,
            runs_by_status: backup_run::count_by_status(&conn, job_id)?.into_iter().collect(),
            recent_runs,
        })
    }

    pub fn health(&self) -> Result<HealthSummary> {
        let checked_at = self.clock.now();
        let (jobs, failed_verifications_24h, latest) = {
            let conn = self.pool.get()?;
            let jobs = backup_job::find_all(&conn)?;
            let since = format_ts(&(checked_at - Duration::hours(24)));
            let failed = verification::count_failed_since(&conn, &since)?;
            let mut latest = Vec::new();
            for job in &jobs {
                if let Some(run) = backup_run::find_latest_completed(&conn, &job.id)? {
                    latest.push(run);
                }
            }
            (jobs.len(), failed, latest)
        };

        let mut backups = Vec::with_capacity(latest.len());
        for run in latest {
            backups.push(BackupHealth {
                score: self.verifier.health_score(&run.id)?,
                job_id: run.job_id,
                backup_id: run.id,
            });
        }

        let healthy = failed_verifications_24h == 0
            && backups
                .iter()
                .all(|b| b.score.map_or(true, |score| score >= HEALTHY_SCORE));

        Ok(HealthSummary {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            checked_at,
            healthy,
            jobs,
            running: self.tracker.running(),
            failed_verifications_24h,
            index: self.blocks.index_stats()?,
            backups,
        })
    }
}

fn restore_targets(backup_id: &str, target_path: &Path, files: Option<Vec<String>>) -> Vec<RestoreTarget> {
    let selections = match files {
        Some(files) if !files.is_empty() => files,
        _ => vec![String::new()],
    };
    selections
        .into_iter()
        .map(|source_path| RestoreTarget {
            snapshot_name: backup_id.to_string(),
            source_path,
            target_path: target_path.to_path_buf(),
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DestinationConfig;
    use crate::replicate::BackendConfig;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) fn test_config(temp_dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::with_data_dir(temp_dir.path().join("data"));
        config.engine.workers = 2;
        config.destinations.insert(
            "mirror".to_string(),
            DestinationConfig {
                enabled: true,
                backend: BackendConfig::Local {
                    path: temp_dir.path().join("mirror"),
                },
            },
        );
        config
    }

    pub(crate) fn test_engine(temp_dir: &TempDir, clock: Arc<dyn Clock>) -> Result<Engine> {
        let config = test_config(temp_dir);
        let destinations = Arc::new(config.clone());
        Engine::open_with(config, clock, destinations)
    }

    pub(crate) fn write_tree(root: &Path, count: usize) -> Result<Vec<(String, Vec<u8>)>> {
        let mut files = Vec::new();
        for i in 0..count {
            let key = if i % 3 == 0 {
                format!("nested/dir-{}/file-{}.txt", i % 2, i)
            } else {
                format!("file-{}.log", i)
            };
            let data = format!("line {} of a backup test file\n", i).repeat(50 + i * 20).into_bytes();
            let path = root.join(&key);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, &data)?;
            files.push((key, data));
        }
        Ok(files)
    }

    pub(crate) fn job_for(engine: &Engine, temp_dir: &TempDir, source: &Path) -> Result<BackupJob> {
        let mut job = NewBackupJob::new(
            "site",
            vec![source.display().to_string()],
            temp_dir.path().join("backups").display().to_string(),
        );
        job.replication_destinations = vec!["mirror".to_string()];
        engine.create_job(&job)
    }

    #[tokio::test]
    async fn test_destination_check_by_name() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;

        engine.test_destination("mirror").await?;
        assert!(temp_dir.path().join("mirror").is_dir());
        assert!(matches!(
            engine.test_destination("nowhere").await,
            Err(EngineError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_destination_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let mut job = NewBackupJob::new("site", vec!["/srv".into()], "/backups");
        job.replication_destinations = vec!["nowhere".to_string()];
        assert!(matches!(engine.create_job(&job), Err(EngineError::Configuration(_))));
        assert!(engine.list_jobs()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_restore_targets_default_to_everything() {
        let targets = restore_targets("b1", Path::new("/restore"), None);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].source_path, "");

        let targets = restore_targets("b1", Path::new("/restore"), Some(vec!["a".into(), "b/c".into()]));
        let selected: Vec<_> = targets.iter().map(|t| t.source_path.as_str()).collect();
        assert_eq!(selected, vec!["a", "b/c"]);
    }

    #[tokio::test]
    async fn test_status_and_health_after_run() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        write_tree(&source, 4)?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let job = job_for(&engine, &temp_dir, &source)?;

        let result = engine.run(&job.id).await;
        assert!(result.success, "run failed: {:?}", result.error);

        let status = engine.status(None)?;
        assert_eq!(status.jobs, 1);
        assert!(status.running.is_empty());
        assert_eq!(status.runs_by_status.get("completed"), Some(&1));
        assert_eq!(status.recent_runs.len(), 1);
        assert_eq!(engine.status(Some("other"))?.jobs, 0);

        let health = engine.health()?;
        assert!(health.healthy);
        assert_eq!(health.failed_verifications_24h, 0);
        assert_eq!(health.backups.len(), 1);
        assert_eq!(health.backups[0].score, Some(1.0));
        assert!(health.index.blocks > 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_job_removes_backups() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        write_tree(&source, 3)?;
        let engine = test_engine(&temp_dir, Arc::new(ManualClock::new(Utc::now())))?;
        let job = job_for(&engine, &temp_dir, &source)?;

        let result = engine.run(&job.id).await;
        assert!(result.success, "run failed: {:?}", result.error);
        let backup_id = result.backup_id.clone().unwrap_or_default();
        let output_dir = temp_dir.path().join("backups").join(&job.id).join(&backup_id);
        assert!(output_dir.exists());

        assert!(engine.delete_job(&job.id)?);
        assert!(!output_dir.exists());
        assert!(engine.get_job(&job.id)?.is_none());
        assert!(engine.snapshots.get(&backup_id)?.is_none());
        assert_eq!(engine.blocks.index_stats()?.blocks, 0);
        assert!(!engine.delete_job(&job.id)?);
        Ok(())
    }

    #[test]
    fn test_delete_refused_while_running() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let engine = test_engine(&temp_dir, Arc::new(SystemClock))?;
        let job = engine.create_job(&NewBackupJob::new("site", vec!["/srv".into()], "/backups"))?;

        let _guard = engine.tracker.try_register(&job.id, CancellationToken::new());
        assert!(matches!(engine.delete_job(&job.id), Err(EngineError::Configuration(_))));
        assert!(engine.cancel(&job.id));
        Ok(())
    }
}
