//! File metadata captured at scan time and reapplied on restore.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stat fields recorded for every file in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,

    /// Seconds since the Unix epoch
    pub mtime: i64,
    /// Sub-second part of `mtime`
    #[serde(default)]
    pub mtime_nsec: u32,
    pub ctime: i64,

    /// Unix mode bits (type bits included)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
}

impl FileMetadata {
    #[cfg(unix)]
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let metadata = fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec() as u32,
            ctime: metadata.ctime(),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            inode: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let since_epoch = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mtime = since_epoch.as_secs() as i64;
        Ok(Self {
            size: metadata.len(),
            mtime,
            mtime_nsec: since_epoch.subsec_nanos(),
            ctime: mtime,
            mode: if metadata.permissions().readonly() { 0o444 } else { 0o644 },
            uid: 0,
            gid: 0,
            inode: 0,
        })
    }

    /// Reapply ownership, timestamps and mode to `path`.
    ///
    /// Ownership is best-effort: without privilege `chown` fails and the
    /// file keeps the restoring user's ids. Access and modification time
    /// are both set to the recorded mtime. Mode goes last so a read-only
    /// mode cannot block the earlier steps.
    #[cfg(unix)]
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        use nix::unistd::{chown, Gid, Uid};
        use std::os::unix::fs::PermissionsExt;

        if let Err(e) = chown(path, Some(Uid::from_raw(self.uid)), Some(Gid::from_raw(self.gid))) {
            tracing::debug!(path = %path.display(), error = %e, "chown skipped");
        }

        let file = fs::File::open(path)?;
        let time = self.mtime_as_system_time();
        file.set_times(fs::FileTimes::new().set_modified(time).set_accessed(time))?;
        drop(file);

        fs::set_permissions(path, fs::Permissions::from_mode(self.mode & 0o7777))?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(path)?;
        let time = self.mtime_as_system_time();
        file.set_times(fs::FileTimes::new().set_modified(time).set_accessed(time))
    }

    fn mtime_as_system_time(&self) -> SystemTime {
        let seconds = if self.mtime >= 0 {
            UNIX_EPOCH + Duration::from_secs(self.mtime as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.mtime.unsigned_abs())
        };
        seconds + Duration::from_nanos(u64::from(self.mtime_nsec))
    }
}
