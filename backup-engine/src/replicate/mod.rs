//! Fan-out replication of finished archives to storage destinations.
//!
//! Replication is best-effort: every destination gets its own upload task and
//! its own [`ReplicationResult`], and one unreachable destination never stops
//! the others.

pub mod ftp;
pub mod local;
pub mod s3;
pub mod sftp;

use crate::utils::errors::{EngineError, Result};
use crate::utils::pool::map_async;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connection settings for one destination, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        path: PathBuf,
    },
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
        #[serde(default)]
        base_dir: String,
    },
    Sftp {
        host: String,
        #[serde(default = "default_sftp_port")]
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        private_key: Option<PathBuf>,
        #[serde(default)]
        base_dir: String,
    },
    S3 {
        /// Custom endpoint for S3-compatible stores
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default = "default_region")]
        region: String,
        bucket: String,
        #[serde(default)]
        access_key_id: String,
        #[serde(default)]
        secret_access_key: String,
        #[serde(default)]
        prefix: String,
    },
}

fn default_ftp_port() -> u16 {
    21
}

fn default_sftp_port() -> u16 {
    22
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationKind {
    Local,
    Ftp,
    Sftp,
    S3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDestination {
    pub name: String,
    pub enabled: bool,
    pub backend: BackendConfig,
}

impl StorageDestination {
    pub fn kind(&self) -> DestinationKind {
        match self.backend {
            BackendConfig::Local { .. } => DestinationKind::Local,
            BackendConfig::Ftp { .. } => DestinationKind::Ftp,
            BackendConfig::Sftp { .. } => DestinationKind::Sftp,
            BackendConfig::S3 { .. } => DestinationKind::S3,
        }
    }
}

/// Resolves destination names used by jobs to their configuration
pub trait DestinationProvider: Send + Sync {
    fn destination(&self, name: &str) -> Option<StorageDestination>;
}

/// One object stored at a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Path relative to the destination's base
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn test_connection(&self) -> Result<()>;

    /// Store `file` under `remote_path`, returning the bytes sent
    async fn upload(&self, file: &Path, remote_path: &str) -> Result<u64>;

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>>;

    async fn delete(&self, remote_path: &str) -> Result<()>;

    /// Delete everything last modified more than `days` ago
    async fn cleanup_older_than(&self, days: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let mut removed = 0;
        for entry in self.list("").await? {
            if entry.modified.is_some_and(|m| m < cutoff) {
                self.delete(&entry.path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Build the backend for a destination. No connection is made yet.
pub fn open_backend(config: &BackendConfig) -> Result<Arc<dyn StorageBackend>> {
    Ok(match config {
        BackendConfig::Local { path } => Arc::new(local::LocalBackend::new(path.clone())),
        BackendConfig::Ftp { .. } => Arc::new(ftp::FtpBackend::new(config)?),
        BackendConfig::Sftp { .. } => Arc::new(sftp::SftpBackend::new(config)?),
        BackendConfig::S3 { .. } => Arc::new(s3::S3Backend::new(config)?),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationResult {
    pub destination: String,
    pub success: bool,
    pub bytes_transferred: u64,
    #[serde(with = "crate::utils::duration_ms")]
    pub transfer_time: Duration,
    pub error: Option<String>,
}

impl ReplicationResult {
    pub(crate) fn failed(destination: &str, reason: impl Into<String>, started: Instant) -> Self {
        Self {
            destination: destination.to_string(),
            success: false,
            bytes_transferred: 0,
            transfer_time: started.elapsed(),
            error: Some(reason.into()),
        }
    }
}

/// Upload deadline per destination unless configured otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct Replicator {
    workers: usize,
    timeout: Duration,
}

impl Replicator {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Give up on a destination whose upload has not finished after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upload `file` to every destination. Always returns exactly one result
    /// per destination, in input order.
    pub async fn replicate(
        &self,
        file: &Path,
        destinations: &[StorageDestination],
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> Vec<ReplicationResult> {
        let items: Vec<StorageDestination> = destinations.to_vec();
        let file = file.to_path_buf();
        let remote = remote_path.to_string();
        let timeout = self.timeout;

        let outcome = map_async(self.workers, items, cancel, move |destination| {
            replicate_one(destination, file.clone(), remote.clone(), timeout)
        })
        .await;

        match outcome {
            Ok(results) => results,
            Err(e) => {
                let started = Instant::now();
                destinations
                    .iter()
                    .map(|d| ReplicationResult::failed(&d.name, e.to_string(), started))
                    .collect()
            }
        }
    }

    pub async fn test_destination(&self, destination: &StorageDestination) -> Result<()> {
        let backend = open_backend(&destination.backend)?;
        tokio::time::timeout(self.timeout, backend.test_connection())
            .await
            .map_err(|_| EngineError::replication(&destination.name, "connection test timed out"))?
    }

    /// Delete `remote_path` from every destination, returning the names
    /// where removal failed. Used to take back uploads of a run that did
    /// not complete.
    pub async fn remove(&self, destinations: &[StorageDestination], remote_path: &str) -> Vec<String> {
        let mut failed = Vec::new();
        for destination in destinations {
            let removed = match open_backend(&destination.backend) {
                Ok(backend) => tokio::time::timeout(self.timeout, backend.delete(remote_path))
                    .await
                    .unwrap_or_else(|_| Err(EngineError::replication(&destination.name, "delete timed out"))),
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => info!(destination = %destination.name, path = %remote_path, "Removed replicated archive"),
                Err(e) => {
                    warn!(destination = %destination.name, path = %remote_path, error = %e, "Replicated archive could not be removed");
                    failed.push(destination.name.clone());
                }
            }
        }
        failed
    }
}

async fn replicate_one(
    destination: StorageDestination,
    file: PathBuf,
    remote_path: String,
    timeout: Duration,
) -> ReplicationResult {
    let started = Instant::now();
    if !destination.enabled {
        return ReplicationResult::failed(&destination.name, "destination disabled", started);
    }

    let uploaded = match open_backend(&destination.backend) {
        Ok(backend) => match tokio::time::timeout(timeout, backend.upload(&file, &remote_path)).await {
            Ok(uploaded) => uploaded,
            Err(_) => Err(EngineError::replication(
                &destination.name,
                format!("upload timed out after {}s", timeout.as_secs()),
            )),
        },
        Err(e) => Err(e),
    };

    match uploaded {
        Ok(bytes) => {
            info!(
                destination = %destination.name,
                bytes = bytes,
                millis = started.elapsed().as_millis() as u64,
                "Replicated archive"
            );
            ReplicationResult {
                destination: destination.name,
                success: true,
                bytes_transferred: bytes,
                transfer_time: started.elapsed(),
                error: None,
            }
        }
        Err(e) => {
            warn!(destination = %destination.name, error = %e, "Replication failed");
            ReplicationResult::failed(&destination.name, e.to_string(), started)
        }
    }
}

/// Join a base directory and a relative remote path with `/`
pub(crate) fn remote_join(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn local(name: &str, path: PathBuf) -> StorageDestination {
        StorageDestination {
            name: name.to_string(),
            enabled: true,
            backend: BackendConfig::Local { path },
        }
    }

    #[tokio::test]
    async fn test_partial_success_reports_every_destination() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("archive.dat");
        fs::write(&archive, vec![9u8; 3000])?;

        // A regular file where a directory is needed makes d2 unreachable
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"x")?;

        let destinations = vec![
            local("d1", temp_dir.path().join("d1")),
            local("d2", blocker.join("d2")),
            local("d3", temp_dir.path().join("d3")),
        ];

        let results = Replicator::new(2)
            .replicate(&archive, &destinations, "job/b1/archive.dat", &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 3);
        let names: Vec<_> = results.iter().map(|r| r.destination.as_str()).collect();
        assert_eq!(names, vec!["d1", "d2", "d3"]);
        assert!(results[0].success && results[2].success);
        assert!(!results[1].success);
        assert!(results[1].error.is_some());
        assert_eq!(results[0].bytes_transferred, 3000);
        assert_eq!(fs::read(temp_dir.path().join("d3/job/b1/archive.dat"))?.len(), 3000);
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_destination_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("archive.dat");
        fs::write(&archive, b"data")?;

        let mut disabled = local("off", temp_dir.path().join("off"));
        disabled.enabled = false;

        let results = Replicator::new(1)
            .replicate(&archive, &[disabled], "a.dat", &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error.as_deref(), Some("destination disabled"));
        assert!(!temp_dir.path().join("off").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_replication_still_reports() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("archive.dat");
        fs::write(&archive, b"data")?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = Replicator::new(1)
            .replicate(&archive, &[local("d1", temp_dir.path().join("d1"))], "a.dat", &cancel)
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        Ok(())
    }

    #[tokio::test]
    async fn test_stalled_destination_times_out() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("archive.dat");
        fs::write(&archive, b"data")?;

        // Accepts the connection but never sends the FTP greeting
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                std::thread::sleep(std::time::Duration::from_secs(2));
                drop(stream);
            }
        });

        let stalled = StorageDestination {
            name: "stalled".to_string(),
            enabled: true,
            backend: BackendConfig::Ftp {
                host: "127.0.0.1".to_string(),
                port,
                username: String::new(),
                password: String::new(),
                base_dir: String::new(),
            },
        };
        let destinations = vec![stalled, local("d1", temp_dir.path().join("d1"))];

        let started = Instant::now();
        let results = Replicator::new(2)
            .with_timeout(Duration::from_millis(300))
            .replicate(&archive, &destinations, "a.dat", &CancellationToken::new())
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap_or_default().contains("timed out"));
        assert!(results[1].success);
        let _ = server.join();
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_takes_back_uploads() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("archive.dat");
        fs::write(&archive, b"data")?;
        let destinations = vec![local("d1", temp_dir.path().join("d1"))];
        let replicator = Replicator::new(1);

        replicator
            .replicate(&archive, &destinations, "job/b1/archive.dat", &CancellationToken::new())
            .await;
        assert!(temp_dir.path().join("d1/job/b1/archive.dat").exists());

        let failed = replicator.remove(&destinations, "job/b1/archive.dat").await;
        assert!(failed.is_empty());
        assert!(!temp_dir.path().join("d1/job/b1/archive.dat").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_destination_connection_check() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let replicator = Replicator::new(1);
        replicator
            .test_destination(&local("d1", temp_dir.path().join("d1")))
            .await?;

        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, b"x")?;
        let unreachable = local("d2", blocker.join("d2"));
        assert!(replicator.test_destination(&unreachable).await.is_err());
        Ok(())
    }

    #[test]
    fn test_backend_config_from_toml() {
        let config: BackendConfig = toml::from_str(
            r#"
kind = "s3"
bucket = "backups"
endpoint = "http://minio:9000"
"#,
        )
        .expect("valid s3 config");
        assert_eq!(
            config,
            BackendConfig::S3 {
                endpoint: Some("http://minio:9000".into()),
                region: "us-east-1".into(),
                bucket: "backups".into(),
                access_key_id: String::new(),
                secret_access_key: String::new(),
                prefix: String::new(),
            }
        );
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("", "a/b"), "a/b");
        assert_eq!(remote_join("/srv/", "/a"), "/srv/a");
    }
}
