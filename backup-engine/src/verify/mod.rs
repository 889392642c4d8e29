//! Manifest construction and re-verification of backup outputs.
//!
//! A manifest lists the SHA-256 of every file in a backup's output
//! directory and is signed with the installation's Ed25519 key. Verification
//! refuses to classify any file when the manifest itself does not check out:
//! a tampered manifest could otherwise bless tampered data.

pub mod manifest;
pub mod signer;

pub use manifest::{BackupManifest, TrustFailure, MANIFEST_FILE};
pub use signer::ManifestSigner;

use crate::clock::Clock;
use crate::db::DbPool;
use crate::fs::walker::{walk_files, WalkOptions};
use crate::models::verification::{self, VerificationFile, VerificationRun};
use crate::models::{self, format_ts};
use crate::utils::errors::{EngineError, Result};
use crate::utils::hashing::sha256_file;
use crate::utils::pool::map_blocking;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Newest-first weights for the health score
const HEALTH_WEIGHTS: [f64; 5] = [0.5, 0.2, 0.15, 0.1, 0.05];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Valid,
    Corrupted,
    Missing,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Valid => "valid",
            FileStatus::Corrupted => "corrupted",
            FileStatus::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVerification {
    pub path: String,
    pub status: FileStatus,
    pub expected_hash: String,
    pub actual_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub backup_id: String,
    pub verified_at: DateTime<Utc>,
    pub success: bool,
    pub manifest_trusted: bool,
    pub total_files: u64,
    pub valid_files: u64,
    pub corrupted_files: u64,
    pub missing_files: u64,
    pub files: Vec<FileVerification>,
    pub error: Option<String>,
}

impl VerificationResult {
    fn untrusted(backup_id: &str, verified_at: DateTime<Utc>, total_files: u64, reason: String) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            verified_at,
            success: false,
            manifest_trusted: false,
            total_files,
            valid_files: 0,
            corrupted_files: 0,
            missing_files: 0,
            files: Vec::new(),
            error: Some(reason),
        }
    }

    /// Files that need repair
    pub fn damaged(&self) -> impl Iterator<Item = &FileVerification> {
        self.files.iter().filter(|f| f.status != FileStatus::Valid)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairResult {
    pub backup_id: String,
    pub repaired: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

pub struct Verifier {
    pool: DbPool,
    signer: Arc<ManifestSigner>,
    workers: usize,
    clock: Arc<dyn Clock>,
}

impl Verifier {
    pub fn new(pool: DbPool, signer: Arc<ManifestSigner>, workers: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            signer,
            workers,
            clock,
        }
    }

    /// Hash everything in `output_dir`, write a signed `manifest.json` and
    /// remember where it lives
    pub async fn build_manifest(
        &self,
        backup_id: &str,
        output_dir: &Path,
        compression_type: &str,
        encryption_type: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupManifest> {
        let root = output_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || walk_files(&root, &WalkOptions::default()))
            .await??
            .into_complete()?
            .into_iter()
            .filter(|info| info.key != MANIFEST_FILE)
            .collect::<Vec<_>>();

        let hashed = map_blocking(self.workers, files, cancel, |info| {
            sha256_file(&info.path).map(|hash| (info.key, hash, info.size))
        })
        .await?;

        let mut file_hashes = BTreeMap::new();
        let mut total_size = 0u64;
        for entry in hashed {
            let (key, hash, size) = entry?;
            total_size += size;
            file_hashes.insert(key, hash);
        }

        let timestamp = format_ts(&self.clock.now());
        let manifest = BackupManifest::new(
            backup_id,
            timestamp.clone(),
            compression_type,
            encryption_type,
            file_hashes,
            total_size,
            &self.signer,
        );
        manifest.save(output_dir)?;

        let conn = self.pool.get()?;
        models::manifest::upsert(&conn, backup_id, &output_dir.to_string_lossy(), &timestamp)?;

        info!(
            backup_id = %backup_id,
            files = manifest.total_files,
            bytes = manifest.total_size,
            "Manifest written"
        );
        Ok(manifest)
    }

    /// Recheck every file a backup's manifest lists. The outcome is
    /// persisted; only store or cancellation errors are returned as `Err`.
    pub async fn verify(&self, backup_id: &str, cancel: &CancellationToken) -> Result<VerificationResult> {
        let verified_at = self.clock.now();

        let output_dir = {
            let conn = self.pool.get()?;
            models::manifest::find_output_dir(&conn, backup_id)?
        };
        let Some(output_dir) = output_dir.map(PathBuf::from) else {
            let result = VerificationResult::untrusted(
                backup_id,
                verified_at,
                0,
                format!("no manifest recorded for backup {}", backup_id),
            );
            return self.record(result);
        };

        let manifest = match BackupManifest::load(&output_dir) {
            Ok(manifest) => manifest,
            Err(e) => {
                let reason = format!("manifest unreadable: {}", e);
                return self.record(VerificationResult::untrusted(backup_id, verified_at, 0, reason));
            }
        };

        let trust = if manifest.backup_id != backup_id {
            Err(format!("manifest belongs to backup {}", manifest.backup_id))
        } else {
            manifest.check_trust(&self.signer).map_err(|f| f.to_string())
        };
        if let Err(reason) = trust {
            warn!(backup_id = %backup_id, reason = %reason, "Manifest is not trusted");
            let result = VerificationResult::untrusted(backup_id, verified_at, manifest.total_files, reason);
            return self.record(result);
        }

        let entries: Vec<(String, String, PathBuf)> = manifest
            .file_hashes
            .iter()
            .map(|(path, hash)| (path.clone(), hash.clone(), output_dir.join(path)))
            .collect();
        let files = map_blocking(self.workers, entries, cancel, |(path, expected, location)| {
            check_file(path, expected, &location)
        })
        .await?;

        let count = |status| files.iter().filter(|f| f.status == status).count() as u64;
        let (valid, corrupted, missing) = (
            count(FileStatus::Valid),
            count(FileStatus::Corrupted),
            count(FileStatus::Missing),
        );

        let result = VerificationResult {
            backup_id: backup_id.to_string(),
            verified_at,
            success: corrupted == 0 && missing == 0,
            manifest_trusted: true,
            total_files: files.len() as u64,
            valid_files: valid,
            corrupted_files: corrupted,
            missing_files: missing,
            error: (corrupted + missing > 0)
                .then(|| format!("{} corrupted, {} missing", corrupted, missing)),
            files,
        };

        if result.success {
            info!(backup_id = %backup_id, files = result.total_files, "Backup verified");
        } else {
            warn!(
                backup_id = %backup_id,
                corrupted = corrupted,
                missing = missing,
                "Backup verification found damage"
            );
        }
        self.record(result)
    }

    fn record(&self, result: VerificationResult) -> Result<VerificationResult> {
        let run = VerificationRun {
            id: Uuid::new_v4().to_string(),
            backup_id: result.backup_id.clone(),
            verified_at: format_ts(&result.verified_at),
            success: result.success,
            manifest_trusted: result.manifest_trusted,
            total_files: result.total_files as i64,
            valid_files: result.valid_files as i64,
            corrupted_files: result.corrupted_files as i64,
            missing_files: result.missing_files as i64,
            error: result.error.clone(),
        };
        let files: Vec<VerificationFile> = result
            .files
            .iter()
            .map(|f| VerificationFile {
                path: f.path.clone(),
                status: f.status.as_str().to_string(),
                expected_hash: f.expected_hash.clone(),
                actual_hash: f.actual_hash.clone(),
            })
            .collect();

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        verification::insert(&tx, &run, &files)?;
        tx.commit()?;
        Ok(result)
    }

    /// Recency-weighted share of valid files over the last five runs.
    /// `None` when the backup was never verified.
    pub fn health_score(&self, backup_id: &str) -> Result<Option<f64>> {
        let conn = self.pool.get()?;
        let runs = verification::recent_runs(&conn, backup_id, HEALTH_WEIGHTS.len() as i64)?;
        Ok(weighted_health(&runs))
    }

    pub fn history(&self, backup_id: &str, limit: i64) -> Result<Vec<VerificationRun>> {
        let conn = self.pool.get()?;
        verification::recent_runs(&conn, backup_id, limit)
    }

    /// Copy corrupted or missing files back from `source_dir`. A source
    /// file is only used when its hash equals the manifest's.
    pub async fn repair(
        &self,
        backup_id: &str,
        source_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<RepairResult> {
        let verification = self.verify(backup_id, cancel).await?;
        let mut result = RepairResult {
            backup_id: backup_id.to_string(),
            ..Default::default()
        };
        if !verification.manifest_trusted {
            result
                .errors
                .push(verification.error.unwrap_or_else(|| "manifest not trusted".into()));
            return Ok(result);
        }

        let output_dir = {
            let conn = self.pool.get()?;
            models::manifest::find_output_dir(&conn, backup_id)?
        }
        .map(PathBuf::from)
        .ok_or_else(|| EngineError::config(format!("no manifest recorded for backup {}", backup_id)))?;

        let jobs: Vec<(FileVerification, PathBuf, PathBuf)> = verification
            .damaged()
            .map(|f| (f.clone(), source_dir.join(&f.path), output_dir.join(&f.path)))
            .collect();
        let outcomes = map_blocking(self.workers, jobs, cancel, |(file, source, target)| {
            repair_file(&file, &source, &target).map_err(|e| format!("{}: {}", file.path, e))
        })
        .await?;

        for outcome in outcomes {
            match outcome {
                Ok(()) => result.repaired += 1,
                Err(reason) => {
                    result.failed += 1;
                    result.errors.push(reason);
                }
            }
        }

        info!(
            backup_id = %backup_id,
            repaired = result.repaired,
            failed = result.failed,
            "Repair finished"
        );
        Ok(result)
    }
}

fn check_file(path: String, expected_hash: String, location: &Path) -> FileVerification {
    let (status, actual_hash) = match sha256_file(location) {
        Ok(actual) if actual == expected_hash => (FileStatus::Valid, Some(actual)),
        Ok(actual) => (FileStatus::Corrupted, Some(actual)),
        Err(e) if e.kind() == ErrorKind::NotFound => (FileStatus::Missing, None),
        Err(e) => {
            warn!(path = %path, error = %e, "Could not read file for verification");
            (FileStatus::Corrupted, None)
        }
    };
    FileVerification {
        path,
        status,
        expected_hash,
        actual_hash,
    }
}

fn repair_file(file: &FileVerification, source: &Path, target: &Path) -> Result<()> {
    let source_hash = sha256_file(source)?;
    if source_hash != file.expected_hash {
        return Err(EngineError::integrity("source does not match the manifest"));
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = target.with_extension("repair-tmp");
    fs::copy(source, &staging)?;
    if sha256_file(&staging)? != file.expected_hash {
        let _ = fs::remove_file(&staging);
        return Err(EngineError::integrity("source changed while copying"));
    }
    fs::rename(&staging, target)?;
    Ok(())
}

fn weighted_health(runs: &[VerificationRun]) -> Option<f64> {
    if runs.is_empty() {
        return None;
    }
    let (score, weight) = runs
        .iter()
        .zip(HEALTH_WEIGHTS)
        .fold((0.0, 0.0), |(score, weight), (run, w)| {
            let ratio = if run.total_files > 0 {
                run.valid_files as f64 / run.total_files as f64
            } else if run.success {
                1.0
            } else {
                0.0
            };
            (score + ratio * w, weight + w)
        });
    Some(score / weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{migrate, open_in_memory};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        output: PathBuf,
        clock: Arc<ManualClock>,
        verifier: Verifier,
    }

    fn fixture() -> Result<Fixture> {
        let temp_dir = TempDir::new()?;
        let pool = open_in_memory()?;
        migrate(&pool)?;
        let signer = Arc::new(ManifestSigner::load_or_create(&temp_dir.path().join("keys"))?);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let verifier = Verifier::new(pool, signer, 2, clock.clone());

        let output = temp_dir.path().join("out");
        fs::create_dir_all(output.join("nested"))?;
        fs::write(output.join("archive.dat"), vec![1u8; 5000])?;
        fs::write(output.join("index.txt"), b"index")?;
        fs::write(output.join("nested/part.bin"), b"part")?;

        Ok(Fixture {
            _temp_dir: temp_dir,
            output,
            clock,
            verifier,
        })
    }

    #[tokio::test]
    async fn test_clean_backup_verifies() -> Result<()> {
        let fx = fixture()?;
        let cancel = CancellationToken::new();
        let manifest = fx.verifier.build_manifest("b1", &fx.output, "zstd", "none", &cancel).await?;
        assert_eq!(manifest.total_files, 3);
        assert_eq!(manifest.total_size, 5000 + 5 + 4);
        assert!(manifest.file_hashes.contains_key("nested/part.bin"));
        assert!(!manifest.file_hashes.contains_key(MANIFEST_FILE));

        let result = fx.verifier.verify("b1", &cancel).await?;
        assert!(result.success && result.manifest_trusted);
        assert_eq!(result.valid_files, 3);
        assert_eq!(fx.verifier.health_score("b1")?, Some(1.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_flipped_byte_and_deleted_file() -> Result<()> {
        let fx = fixture()?;
        let cancel = CancellationToken::new();
        fx.verifier.build_manifest("b1", &fx.output, "zstd", "none", &cancel).await?;

        let archive = fx.output.join("archive.dat");
        let mut bytes = fs::read(&archive)?;
        bytes[1234] ^= 0x01;
        fs::write(&archive, bytes)?;

        let result = fx.verifier.verify("b1", &cancel).await?;
        assert!(!result.success);
        assert_eq!(result.corrupted_files, 1);
        assert_eq!(result.valid_files, result.total_files - 1);
        let damaged: Vec<_> = result.damaged().map(|f| f.path.as_str()).collect();
        assert_eq!(damaged, vec!["archive.dat"]);

        fs::remove_file(fx.output.join("index.txt"))?;
        let result = fx.verifier.verify("b1", &cancel).await?;
        assert_eq!(result.missing_files, 1);
        assert_eq!(result.corrupted_files, 1);
        assert_eq!(result.valid_files, 1);

        let history = fx.verifier.history("b1", 10)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].missing_files, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_tampered_manifest_fails_closed() -> Result<()> {
        let fx = fixture()?;
        let cancel = CancellationToken::new();
        fx.verifier.build_manifest("b1", &fx.output, "zstd", "none", &cancel).await?;

        // Attacker swaps a file and updates its hash in the manifest
        fs::write(fx.output.join("index.txt"), b"evil")?;
        let mut manifest = BackupManifest::load(&fx.output)?;
        manifest
            .file_hashes
            .insert("index.txt".into(), crate::utils::hashing::sha256_hex(b"evil"));
        manifest.save(&fx.output)?;

        let result = fx.verifier.verify("b1", &cancel).await?;
        assert!(!result.manifest_trusted);
        assert!(!result.success);
        assert!(result.files.is_empty());
        assert_eq!(fx.verifier.health_score("b1")?, Some(0.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_backup_is_untrusted() -> Result<()> {
        let fx = fixture()?;
        let result = fx.verifier.verify("nope", &CancellationToken::new()).await?;
        assert!(!result.manifest_trusted);
        assert!(result.error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_health_score_weighting() -> Result<()> {
        let fx = fixture()?;
        let cancel = CancellationToken::new();
        assert_eq!(fx.verifier.health_score("b1")?, None);

        fx.verifier.build_manifest("b1", &fx.output, "zstd", "none", &cancel).await?;
        fx.verifier.verify("b1", &cancel).await?;

        fx.clock.advance(chrono::Duration::minutes(1));
        fs::remove_file(fx.output.join("index.txt"))?;
        fx.verifier.verify("b1", &cancel).await?;

        // newest 2/3 at 0.5, older 1.0 at 0.2
        let expected = (2.0 / 3.0 * 0.5 + 0.2) / 0.7;
        let score = fx.verifier.health_score("b1")?.unwrap_or_default();
        assert!((score - expected).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn test_repair_only_from_matching_source() -> Result<()> {
        let fx = fixture()?;
        let cancel = CancellationToken::new();
        fx.verifier.build_manifest("b1", &fx.output, "zstd", "none", &cancel).await?;

        let source = fx.output.parent().map(|p| p.join("replica")).unwrap_or_default();
        fs::create_dir_all(source.join("nested"))?;
        fs::copy(fx.output.join("archive.dat"), source.join("archive.dat"))?;
        fs::write(source.join("nested/part.bin"), b"not the part")?;

        fs::write(fx.output.join("archive.dat"), b"garbage")?;
        fs::remove_file(fx.output.join("nested/part.bin"))?;

        let repair = fx.verifier.repair("b1", &source, &cancel).await?;
        assert_eq!(repair.repaired, 1);
        assert_eq!(repair.failed, 1);
        assert!(!fx.output.join("nested/part.bin").exists());

        let result = fx.verifier.verify("b1", &cancel).await?;
        assert_eq!(result.valid_files, 2);
        assert_eq!(result.missing_files, 1);
        Ok(())
    }
}
