use super::{RemoteEntry, StorageBackend};
use crate::fs::walker::{walk_files, WalkOptions};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Destination on a mounted filesystem (NAS, second disk)
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, remote_path: &str) -> Result<PathBuf> {
        let relative = Path::new(remote_path.trim_start_matches('/'));
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(EngineError::config(format!("invalid remote path: {}", remote_path)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn test_connection(&self) -> Result<()> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            fs::create_dir_all(&root)?;
            let marker = root.join(".write-test");
            fs::write(&marker, b"ok")?;
            fs::remove_file(&marker)?;
            Ok(())
        })
        .await?
    }

    async fn upload(&self, file: &Path, remote_path: &str) -> Result<u64> {
        let target = self.resolve(remote_path)?;
        let source = file.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let staging = target.with_extension("partial");
            let copied = fs::copy(&source, &staging)?;
            fs::rename(&staging, &target)?;
            Ok(copied)
        })
        .await?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<RemoteEntry>> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut entries = Vec::new();
            let walk = walk_files(&root, &WalkOptions::default())?;
            for (path, reason) in &walk.skipped {
                warn!(path = %path.display(), error = %reason, "Entry left out of listing");
            }
            for info in walk.files {
                let path = info.key;
                if !path.starts_with(&prefix) {
                    continue;
                }
                let modified = fs::metadata(&info.path)?
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from);
                entries.push(RemoteEntry {
                    path,
                    size: info.size,
                    modified,
                });
            }
            Ok(entries)
        })
        .await?
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let target = self.resolve(remote_path)?;
        tokio::task::spawn_blocking(move || fs::remove_file(target)).await??;
        Ok(())
    }
}
