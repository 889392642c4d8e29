//! Backup retention.
//!
//! A backup is kept while it is younger than the job's `retention_days`, or
//! while a kept backup (or the newest completed one) still needs its archive
//! to restore. Everything else is removed: output directory, snapshot, dedup
//! references, manifest, verification history and run row.

use super::Engine;
use crate::models::backup_job::BackupJob;
use crate::models::backup_run::{self, BackupRun, STATUS_COMPLETED, STATUS_RUNNING};
use crate::models::{format_ts, manifest as manifest_rows, verification};
use crate::utils::errors::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    pub removed_backups: Vec<String>,
    pub collected_blocks: u64,
}

impl Engine {
    pub fn apply_retention(&self, job: &BackupJob) -> Result<RetentionReport> {
        let cutoff = format_ts(&(self.clock.now() - Duration::days(job.retention_days)));
        let (runs, keep) = {
            let conn = self.pool.get()?;
            let runs = backup_run::find_by_job_id(&conn, &job.id, i64::MAX)?;

            let mut keep: HashSet<String> = HashSet::new();
            let newest_completed = runs.iter().find(|r| r.status == STATUS_COMPLETED);
            let anchors = runs
                .iter()
                .filter(|r| r.started_at >= cutoff || r.status == STATUS_RUNNING)
                .chain(newest_completed);
            for run in anchors {
                keep.insert(run.id.clone());
                if run.status == STATUS_COMPLETED {
                    for needed in backup_run::restore_chain(&conn, &job.id, &run.id)? {
                        keep.insert(needed.id);
                    }
                }
            }
            (runs, keep)
        };

        let mut report = RetentionReport::default();
        for run in runs.iter().filter(|r| !keep.contains(&r.id)) {
            self.remove_backup(run)?;
            report.removed_backups.push(run.id.clone());
        }
        if !report.removed_backups.is_empty() {
            report.collected_blocks = self.blocks.cleanup_unused_blocks()?;
            info!(
                job_id = %job.id,
                removed = report.removed_backups.len(),
                kept = keep.len(),
                collected_blocks = report.collected_blocks,
                "Retention cleanup finished"
            );
        }
        Ok(report)
    }

    /// Delete one backup and everything recorded about it
    pub(crate) fn remove_backup(&self, run: &BackupRun) -> Result<()> {
        match std::fs::remove_dir_all(Path::new(&run.output_dir)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(backup_id = %run.id, path = %run.output_dir, error = %e, "Backup output could not be removed");
                return Err(e.into());
            }
        }
        self.snapshots.delete(&run.id)?;
        self.blocks.release_owner(&run.id)?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        manifest_rows::delete(&tx, &run.id)?;
        verification::delete_for_backup(&tx, &run.id)?;
        backup_run::delete(&tx, &run.id)?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{job_for, test_engine, write_tree};
    use crate::clock::ManualClock;
    use crate::models::backup_job::UpdateBackupJob;
    use crate::utils::errors::Result;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failed_runs_expire_but_latest_backup_stays() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        write_tree(&source, 3)?;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = test_engine(&temp_dir, clock.clone())?;
        let job = job_for(&engine, &temp_dir, &source)?;
        let job = engine
            .update_job(
                &job.id,
                &UpdateBackupJob {
                    retention_days: Some(2),
                    ..Default::default()
                },
            )?
            .unwrap_or(job);

        let good = engine.run(&job.id).await;
        assert!(good.success, "run failed: {:?}", good.error);

        // An unchanged tree produces a skipped run row
        clock.advance(Duration::hours(1));
        let skipped = engine.run(&job.id).await;
        assert!(skipped.success);
        assert_eq!(engine.list_runs(&job.id, 10)?.len(), 2);

        clock.advance(Duration::days(30));
        let report = engine.apply_retention(&job)?;
        assert_eq!(report.removed_backups, vec![skipped.backup_id.unwrap_or_default()]);

        let runs = engine.list_runs(&job.id, 10)?;
        assert_eq!(runs.len(), 1);
        assert_eq!(Some(runs[0].id.clone()), good.backup_id);
        Ok(())
    }
}
