//! Directory traversal for snapshot scans.
//!
//! Only regular files are reported. Symbolic links are never followed so a
//! scan cannot escape its root or loop.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File or directory names to skip (exact match)
    pub exclude_names: Vec<String>,
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// Relative path with `/` separators, used as the archive key
    pub key: String,

    /// File size in bytes
    pub size: u64,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let key = archive_key(&relative_path).ok_or_else(|| {
            std::io::Error::new(ErrorKind::InvalidData, "file name is not valid UTF-8")
        })?;
        Ok(Self {
            size: entry.metadata()?.len(),
            path,
            relative_path,
            key,
        })
    }
}

/// Result of a walk: the files found plus every entry that could not be used
#[derive(Debug, Default)]
pub struct Walk {
    pub files: Vec<FileInfo>,

    /// Path and reason for entries that vanished, could not be read or
    /// have no exact UTF-8 key
    pub skipped: Vec<(PathBuf, String)>,
}

impl Walk {
    /// All files, or an error naming the first skipped entry
    pub fn into_complete(self) -> std::io::Result<Vec<FileInfo>> {
        match self.skipped.into_iter().next() {
            None => Ok(self.files),
            Some((path, reason)) => Err(std::io::Error::other(format!(
                "{}: {}",
                path.display(),
                reason
            ))),
        }
    }
}

/// `/`-joined relative path, `None` when a component is not valid UTF-8
pub fn archive_key(relative: &Path) -> Option<String> {
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Walk a directory tree and collect all regular files, sorted by path.
///
/// Only an unreadable `root` is an error. Problems below it are recorded in
/// [`Walk::skipped`] and the walk carries on.
pub fn walk_files(root: &Path, options: &WalkOptions) -> std::io::Result<Walk> {
    std::fs::read_dir(root)?;

    let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut walk = Walk::default();
    let entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e, &options.exclude_names));
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(root).to_path_buf();
                walk.skipped.push((path, e.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match FileInfo::from_entry(&entry, root) {
            Ok(info) => walk.files.push(info),
            Err(e) => walk.skipped.push((entry.path().to_path_buf(), e.to_string())),
        }
    }

    Ok(walk)
}

fn is_excluded(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|n| *n == file_name)
}
