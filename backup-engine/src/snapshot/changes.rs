//! Change classification between a baseline snapshot and a fresh scan.

use crate::models::snapshot::{FileRecord, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Unchanged,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    /// Current key; for `Deleted` the key the file had in the baseline
    pub path: String,
    pub kind: ChangeKind,
    pub old_record: Option<FileRecord>,
    pub new_record: Option<FileRecord>,
    pub similarity_score: f64,
    /// Baseline key of a renamed file
    pub old_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    pub renamed: usize,
    pub unchanged: usize,
    pub total_changed: usize,
}

/// Result of comparing a scan against a baseline (or against nothing, for a full scan)
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub baseline: Option<Snapshot>,
    pub source_root: String,
    pub changes: Vec<FileChange>,
    /// Every file present in the scan, sorted by key
    pub current: Vec<FileRecord>,
    /// Archive key → absolute path on disk
    pub locations: BTreeMap<String, PathBuf>,
    /// (absolute path, reason) for files that vanished or could not be read mid-scan
    pub unreadable: Vec<(String, String)>,
}

impl ChangeSet {
    /// Keys whose content must be archived: created, modified and the new side of renames
    pub fn get_changed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .changes
            .iter()
            .filter(|c| {
                matches!(c.kind, ChangeKind::Created | ChangeKind::Modified | ChangeKind::Renamed)
            })
            .map(|c| c.path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for change in &self.changes {
            match change.kind {
                ChangeKind::Created => summary.created += 1,
                ChangeKind::Modified => summary.modified += 1,
                ChangeKind::Deleted => summary.deleted += 1,
                ChangeKind::Renamed => summary.renamed += 1,
                ChangeKind::Unchanged => summary.unchanged += 1,
            }
        }
        summary.total_changed =
            summary.created + summary.modified + summary.deleted + summary.renamed;
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.summary().total_changed > 0
    }

    pub fn total_size(&self) -> u64 {
        self.current.iter().map(|r| r.size).sum()
    }

    pub fn record(&self, key: &str) -> Option<&FileRecord> {
        self.current
            .binary_search_by(|r| r.path.as_str().cmp(key))
            .ok()
            .map(|idx| &self.current[idx])
    }
}

/// Heuristic closeness of two versions of a file whose hashes differ.
/// Equal hashes always score 1.0.
pub fn similarity(old: &FileRecord, new: &FileRecord) -> f64 {
    if old.content_hash == new.content_hash {
        return 1.0;
    }
    let size_ratio = match old.size.max(new.size) {
        0 => 1.0,
        largest => old.size.min(new.size) as f64 / largest as f64,
    };
    let age_days = (new.mtime - old.mtime).unsigned_abs() as f64 / 86_400.0;
    let recency = 1.0 / (1.0 + age_days);
    0.7 * size_ratio + 0.3 * recency
}

/// Classify every key of `baseline` and `current`, then fold unambiguous
/// deleted/created pairs with identical content into renames.
pub fn classify(baseline: &[FileRecord], current: &[FileRecord]) -> Vec<FileChange> {
    let old: BTreeMap<&str, &FileRecord> = baseline.iter().map(|r| (r.path.as_str(), r)).collect();
    let new: BTreeMap<&str, &FileRecord> = current.iter().map(|r| (r.path.as_str(), r)).collect();

    let mut changes = Vec::with_capacity(old.len().max(new.len()));
    for (path, record) in &new {
        let change = match old.get(path) {
            Some(before) if before.content_hash == record.content_hash => FileChange {
                path: path.to_string(),
                kind: ChangeKind::Unchanged,
                old_record: Some((*before).clone()),
                new_record: Some((*record).clone()),
                similarity_score: 1.0,
                old_path: None,
            },
            Some(before) => FileChange {
                path: path.to_string(),
                kind: ChangeKind::Modified,
                old_record: Some((*before).clone()),
                new_record: Some((*record).clone()),
                similarity_score: similarity(before, record),
                old_path: None,
            },
            None => FileChange {
                path: path.to_string(),
                kind: ChangeKind::Created,
                old_record: None,
                new_record: Some((*record).clone()),
                similarity_score: 0.0,
                old_path: None,
            },
        };
        changes.push(change);
    }
    for (path, record) in &old {
        if !new.contains_key(path) {
            changes.push(FileChange {
                path: path.to_string(),
                kind: ChangeKind::Deleted,
                old_record: Some((*record).clone()),
                new_record: None,
                similarity_score: 0.0,
                old_path: None,
            });
        }
    }

    detect_renames(changes)
}

fn detect_renames(changes: Vec<FileChange>) -> Vec<FileChange> {
    let created: Vec<usize> = (0..changes.len())
        .filter(|&i| changes[i].kind == ChangeKind::Created)
        .collect();
    let mut deleted: Vec<usize> = (0..changes.len())
        .filter(|&i| changes[i].kind == ChangeKind::Deleted)
        .collect();
    deleted.sort_by(|&a, &b| changes[a].path.cmp(&changes[b].path));

    let content = |c: &FileChange| {
        c.new_record
            .as_ref()
            .or(c.old_record.as_ref())
            .map(|r| (r.content_hash.clone(), r.size))
    };

    let mut paired_created: HashSet<usize> = HashSet::new();
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for &d in &deleted {
        let key = content(&changes[d]);
        let candidates: Vec<usize> = created
            .iter()
            .copied()
            .filter(|c| !paired_created.contains(c) && content(&changes[*c]) == key)
            .collect();
        if let [only] = candidates.as_slice() {
            paired_created.insert(*only);
            pairs.push((d, *only));
        }
    }

    if pairs.is_empty() {
        return changes;
    }

    let consumed_deleted: HashSet<usize> = pairs.iter().map(|(d, _)| *d).collect();
    let renamed_from: BTreeMap<usize, usize> = pairs.iter().map(|(d, c)| (*c, *d)).collect();

    let mut out = Vec::with_capacity(changes.len() - pairs.len());
    for (idx, change) in changes.iter().enumerate() {
        if consumed_deleted.contains(&idx) {
            continue;
        }
        match renamed_from.get(&idx) {
            Some(&d) => {
                let old = &changes[d];
                out.push(FileChange {
                    path: change.path.clone(),
                    kind: ChangeKind::Renamed,
                    old_record: old.old_record.clone(),
                    new_record: change.new_record.clone(),
                    similarity_score: 1.0,
                    old_path: Some(old.path.clone()),
                });
            }
            None => out.push(change.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, hash: &str, size: u64, mtime: i64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size,
            mtime,
            mtime_nsec: 0,
            ctime: mtime,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            content_hash: hash.to_string(),
            inode: 1,
        }
    }

    fn kinds(changes: &[FileChange]) -> Vec<(String, ChangeKind)> {
        changes.iter().map(|c| (c.path.clone(), c.kind)).collect()
    }

    #[test]
    fn test_classification() {
        let baseline = vec![record("a", "h1", 10, 100), record("b", "h2", 20, 100), record("c", "h3", 30, 100)];
        let current = vec![record("a", "h1x", 12, 200), record("b", "h2", 20, 999), record("d", "h4", 40, 300)];

        let changes = classify(&baseline, &current);
        let mut got = kinds(&changes);
        got.sort();
        assert_eq!(
            got,
            vec![
                ("a".to_string(), ChangeKind::Modified),
                ("b".to_string(), ChangeKind::Unchanged),
                ("c".to_string(), ChangeKind::Deleted),
                ("d".to_string(), ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn test_similarity_blend() {
        let old = record("a", "h1", 100, 0);
        assert_eq!(similarity(&old, &record("a", "h1", 5, 999_999)), 1.0);

        let same_time_half_size = similarity(&old, &record("a", "h2", 50, 0));
        assert!((same_time_half_size - (0.7 * 0.5 + 0.3)).abs() < 1e-9);

        let one_day_later = similarity(&old, &record("a", "h2", 100, 86_400));
        assert!((one_day_later - (0.7 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn test_rename_detected_once() {
        let baseline = vec![record("old/name.txt", "h1", 10, 100), record("keep", "h2", 5, 100)];
        let current = vec![record("new/name.txt", "h1", 10, 100), record("keep", "h2", 5, 100)];

        let changes = classify(&baseline, &current);
        let renamed: Vec<_> = changes.iter().filter(|c| c.kind == ChangeKind::Renamed).collect();
        assert_eq!(renamed.len(), 1);
        assert_eq!(renamed[0].path, "new/name.txt");
        assert_eq!(renamed[0].old_path.as_deref(), Some("old/name.txt"));
        assert!(!changes.iter().any(|c| matches!(c.kind, ChangeKind::Created | ChangeKind::Deleted)));
    }

    #[test]
    fn test_ambiguous_rename_left_alone() {
        let baseline = vec![record("gone", "h1", 10, 100)];
        let current = vec![record("copy1", "h1", 10, 100), record("copy2", "h1", 10, 100)];

        let changes = classify(&baseline, &current);
        let mut got = kinds(&changes);
        got.sort();
        assert_eq!(
            got,
            vec![
                ("copy1".to_string(), ChangeKind::Created),
                ("copy2".to_string(), ChangeKind::Created),
                ("gone".to_string(), ChangeKind::Deleted),
            ]
        );
    }
}
