//! Merge batches and their commit handoff records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::diff::ChangeKind;
use super::types::{BatchId, DiffId};

// ---------------------------------------------------------------------------
// FileChangeSet
// ---------------------------------------------------------------------------

/// The final effect of a batch on one path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Net action once every contributor is applied.
    pub action: ChangeKind,
    /// Contributing diffs, in application order.
    pub contributors: Vec<DiffId>,
}

/// Combined per-path change set of a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileChangeSet {
    files: BTreeMap<String, FileChange>,
}

impl FileChangeSet {
    /// Empty change set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    /// Record that `diff` applies `kind` to `path`, after every diff recorded
    /// so far.
    ///
    /// An add followed by edits stays an add; a later delete wins.
    pub fn record(&mut self, path: &str, kind: ChangeKind, diff: &DiffId) {
        match self.files.get_mut(path) {
            Some(change) => {
                change.action = match (change.action, kind) {
                    (ChangeKind::Added, ChangeKind::Modified) => ChangeKind::Added,
                    (ChangeKind::Deleted, ChangeKind::Added) => ChangeKind::Modified,
                    (_, next) => next,
                };
                change.contributors.push(diff.clone());
            }
            None => {
                self.files.insert(
                    path.to_owned(),
                    FileChange {
                        action: kind,
                        contributors: vec![diff.clone()],
                    },
                );
            }
        }
    }

    /// Look up one path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileChange> {
        self.files.get(path)
    }

    /// Iterate paths in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileChange)> {
        self.files.iter()
    }

    /// Number of paths touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if no path is touched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths whose net action is `kind`.
    #[must_use]
    pub fn paths_with(&self, kind: ChangeKind) -> Vec<&str> {
        self.files
            .iter()
            .filter(|(_, c)| c.action == kind)
            .map(|(p, _)| p.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MergeBatch
// ---------------------------------------------------------------------------

/// A set of diffs folded into one atomic commit. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeBatch {
    /// `batch-<hash>` over the ordered diff ids.
    pub id: BatchId,
    /// Constituents in application order.
    pub diff_ids: Vec<DiffId>,
    /// Net per-path effect.
    pub changes: FileChangeSet,
    /// Concatenated raw patches, in application order.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub combined_patch: String,
    /// Generated commit message.
    pub message: String,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

impl MergeBatch {
    /// Check the record's internal consistency.
    ///
    /// # Errors
    /// Returns a description of the first inconsistency found.
    pub fn check_integrity(&self) -> Result<(), String> {
        if self.diff_ids.is_empty() {
            return Err(format!("{} has no diffs", self.id));
        }
        for (path, change) in self.changes.iter() {
            if let Some(stray) = change
                .contributors
                .iter()
                .find(|d| !self.diff_ids.contains(d))
            {
                return Err(format!(
                    "{}: {path} credits {stray}, which is not in the batch",
                    self.id
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommitRecord
// ---------------------------------------------------------------------------

/// Marks a batch as handed to the commit step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// The released batch (also the record's key).
    pub batch_id: BatchId,
    /// Where the commit step put the handoff (directory, ref, URL, ...).
    pub location: String,
    /// Unix timestamp (seconds).
    pub released_at: u64,
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    #[test]
    fn add_then_modify_stays_added() {
        let mut set = FileChangeSet::new();
        let d1 = DiffId::from_sequence(1);
        let d2 = DiffId::from_sequence(2);
        set.record("new.py", ChangeKind::Added, &d1);
        set.record("new.py", ChangeKind::Modified, &d2);
        let change = set.get("new.py").unwrap();
        assert_eq!(change.action, ChangeKind::Added);
        assert_eq!(change.contributors, vec![d1, d2]);
    }

    #[test]
    fn later_delete_wins() {
        let mut set = FileChangeSet::new();
        set.record("old.py", ChangeKind::Modified, &DiffId::from_sequence(1));
        set.record("old.py", ChangeKind::Deleted, &DiffId::from_sequence(2));
        assert_eq!(set.paths_with(ChangeKind::Deleted), vec!["old.py"]);
    }

    #[test]
    fn stray_contributor_is_inconsistent() {
        let mut changes = FileChangeSet::new();
        changes.record("a.py", ChangeKind::Modified, &DiffId::from_sequence(7));
        let batch = MergeBatch {
            id: BatchId::new("batch-abc").unwrap(),
            diff_ids: vec![DiffId::from_sequence(1)],
            changes,
            combined_patch: String::new(),
            message: "m".to_owned(),
            created_at: 0,
        };
        assert!(batch.check_integrity().is_err());
    }
}
