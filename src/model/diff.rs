//! Diffs: the unit of change a worker submits instead of committing.
//!
//! A [`Diff`] is write-once at ingestion except for its status and the
//! verification fields (`verification`, `verification_attempts`,
//! `verifying_since`, `rejection`) and the claiming `merge_batch`. The
//! status follows a strict state machine:
//!
//! ```text
//! Submitted → Pending → Verifying → Verified → MergeCandidate → Merged
//!                 ↑          │           │  ↑          │
//!                 └──────────┘           │  └──────────┘
//!                 ↑   (timeout)          │   (batch aborted)
//!                 └──────────────────────┘ (re-queued by conflict resolution)
//!
//! Verifying → Rejected      (checks failed or retries exhausted)
//! Verified  → Rejected      (lost a conflict resolution)
//! ```
//!
//! `Merged` and `Rejected` are terminal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::types::{BatchId, DiffId, InstanceId, WorkId};

// ---------------------------------------------------------------------------
// DiffStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    /// Built from a worker payload, not yet admitted.
    Submitted,
    /// Admitted and waiting for verification.
    Pending,
    /// Claimed by a verifier; checks are running.
    Verifying,
    /// Scoped checks passed.
    Verified,
    /// Selected into a batch that is being finalised.
    MergeCandidate,
    /// Part of a produced merge batch.
    Merged,
    /// Permanently refused (failed checks, exhausted retries, or lost a
    /// conflict resolution).
    Rejected,
}

impl DiffStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Submitted,
        Self::Pending,
        Self::Verifying,
        Self::Verified,
        Self::MergeCandidate,
        Self::Merged,
        Self::Rejected,
    ];

    /// Returns `true` for `Merged` and `Rejected`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Rejected)
    }

    /// Statuses in which a diff can be party to a live conflict.
    #[must_use]
    pub const fn in_conflict_window(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Verifying | Self::Verified | Self::MergeCandidate
        )
    }

    /// Statuses whose file claims must be disjoint unless a conflict is
    /// recorded between the claimants.
    #[must_use]
    pub const fn claims_files(self) -> bool {
        matches!(self, Self::Verifying | Self::Verified | Self::MergeCandidate)
    }

    /// The set of valid next statuses.
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Submitted => &[Self::Pending],
            Self::Pending => &[Self::Verifying],
            Self::Verifying => &[Self::Verified, Self::Rejected, Self::Pending],
            Self::Verified => &[Self::MergeCandidate, Self::Pending, Self::Rejected],
            Self::MergeCandidate => &[Self::Merged, Self::Verified],
            Self::Merged | Self::Rejected => &[],
        }
    }

    /// Check whether moving to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Pending => write!(f, "pending"),
            Self::Verifying => write!(f, "verifying"),
            Self::Verified => write!(f, "verified"),
            Self::MergeCandidate => write!(f, "merge_candidate"),
            Self::Merged => write!(f, "merged"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

// ---------------------------------------------------------------------------
// LineRange
// ---------------------------------------------------------------------------

/// An inclusive, 1-based range of lines touched in one file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineRange {
    /// First touched line (1-based).
    pub start: u32,
    /// Last touched line (inclusive).
    pub end: u32,
}

impl LineRange {
    /// Create a range. Callers validate with [`LineRange::is_well_formed`].
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// `start >= 1 && start <= end`.
    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        self.start >= 1 && self.start <= self.end
    }

    /// Number of lines covered.
    #[must_use]
    pub fn line_count(&self) -> u64 {
        u64::from(self.end.saturating_sub(self.start)) + 1
    }

    /// Returns `true` if the two ranges share at least one line.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// The shared lines of two overlapping ranges.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        self.overlaps(other).then(|| Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// Returns `true` if `other` lies entirely inside `self`.
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// ChangeKind
// ---------------------------------------------------------------------------

/// How a diff touches a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The file is created.
    Added,
    /// The file exists and is edited.
    Modified,
    /// The file is removed.
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

// ---------------------------------------------------------------------------
// CausalChain
// ---------------------------------------------------------------------------

/// The files and symbols transitively affected by a diff's changes, as
/// reported by the causal analysis provider at submission time.
///
/// The verifier trusts this chain as recorded; it never re-derives depth.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalChain {
    /// Affected files (callers and callees of the changed symbols).
    #[serde(default)]
    pub files: BTreeSet<String>,
    /// Affected symbols, `module:function` style.
    #[serde(default)]
    pub symbols: BTreeSet<String>,
    /// Caller depth the chain was captured with.
    #[serde(default)]
    pub backward_depth: u32,
    /// Callee depth the chain was captured with.
    #[serde(default)]
    pub forward_depth: u32,
}

impl CausalChain {
    /// Returns `true` if the chain names no files and no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.symbols.is_empty()
    }

    /// Fold another chain into this one. Depths keep the maximum.
    pub fn absorb(&mut self, other: Self) {
        self.files.extend(other.files);
        self.symbols.extend(other.symbols);
        self.backward_depth = self.backward_depth.max(other.backward_depth);
        self.forward_depth = self.forward_depth.max(other.forward_depth);
    }

    /// Returns `true` if the chains share a file or a symbol.
    #[must_use]
    pub fn overlaps_with(&self, other: &Self) -> bool {
        !self.files.is_disjoint(&other.files) || !self.symbols.is_disjoint(&other.symbols)
    }

    /// The files and symbols both chains name.
    #[must_use]
    pub fn overlap(&self, other: &Self) -> CausalOverlap {
        CausalOverlap {
            files: self.files.intersection(&other.files).cloned().collect(),
            symbols: self.symbols.intersection(&other.symbols).cloned().collect(),
        }
    }
}

/// What two causal chains have in common.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalOverlap {
    /// Files on both chains.
    pub files: BTreeSet<String>,
    /// Symbols on both chains.
    pub symbols: BTreeSet<String>,
}

impl CausalOverlap {
    /// Returns `true` if nothing is shared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.symbols.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Verification records
// ---------------------------------------------------------------------------

/// The outcome of one check (type-check, lint, tests, ...) over a scope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Check name from the configuration.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Process exit code (`None` if killed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Files from the scope the check blamed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing_files: Vec<String>,
    /// Captured output, possibly truncated.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// The result of scoped verification, attached to a diff when it leaves
/// `verifying` for `verified` or `rejected`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Whether every check passed.
    pub passed: bool,
    /// The scoped file set the checks ran over.
    pub scope: Vec<String>,
    /// Per-check outcomes.
    #[serde(default)]
    pub checks: Vec<CheckOutcome>,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Unix timestamp (seconds) of completion.
    pub completed_at: u64,
}

impl VerificationResult {
    /// Files blamed by any failing check, deduplicated and sorted.
    #[must_use]
    pub fn failing_files(&self) -> Vec<String> {
        let files: BTreeSet<&String> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .flat_map(|c| c.failing_files.iter())
            .collect();
        files.into_iter().cloned().collect()
    }

    /// One-line failure summary, e.g. `typecheck failed (src/auth.py)`.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        let parts: Vec<String> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| {
                if c.failing_files.is_empty() {
                    format!("{} failed", c.name)
                } else {
                    format!("{} failed ({})", c.name, c.failing_files.join(", "))
                }
            })
            .collect();
        if parts.is_empty() {
            "all checks passed".to_owned()
        } else {
            parts.join("; ")
        }
    }
}

/// Why a diff was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// A scoped check failed.
    VerificationFailed,
    /// The check runner timed out on every allowed attempt.
    VerificationTimeout,
    /// The diff lost an externally resolved conflict.
    LostConflict,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationFailed => write!(f, "VerificationFailed"),
            Self::VerificationTimeout => write!(f, "VerificationTimeout"),
            Self::LostConflict => write!(f, "LostConflict"),
        }
    }
}

/// Rejection detail recorded on a rejected diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Category.
    pub reason: RejectionReason,
    /// Human-readable detail (failing checks and files, conflict id, ...).
    pub detail: String,
    /// Unix timestamp (seconds).
    pub at: u64,
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// A self-contained change produced by one worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    /// Bus-assigned identifier.
    pub id: DiffId,
    /// Ingestion sequence number; defines submission order.
    pub seq: u64,
    /// Originating work package.
    pub work_id: WorkId,
    /// Originating worker instance.
    pub instance_id: InstanceId,
    /// What the change does.
    pub description: String,
    /// Lifecycle status.
    pub status: DiffStatus,

    /// Files created by this diff.
    #[serde(default)]
    pub files_added: BTreeSet<String>,
    /// Files edited by this diff.
    #[serde(default)]
    pub files_modified: BTreeSet<String>,
    /// Files removed by this diff.
    #[serde(default)]
    pub files_deleted: BTreeSet<String>,
    /// Touched line ranges per file.
    #[serde(default)]
    pub line_changes: BTreeMap<String, Vec<LineRange>>,
    /// Causal chain captured by the worker before submission.
    #[serde(default)]
    pub causal_chain: CausalChain,
    /// Raw unified diff text, when the worker supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,

    /// Result of the last completed verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    /// Number of verification attempts that ended in a timeout or crash.
    #[serde(default)]
    pub verification_attempts: u32,
    /// Unix timestamp at which the current verification claim was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifying_since: Option<u64>,
    /// Rejection detail (set only when `status == Rejected`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    /// Batch that claimed this diff (set from `merge_candidate` on).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_batch: Option<BatchId>,

    /// Unix timestamp (seconds) of admission.
    pub submitted_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl Diff {
    /// Every path this diff touches, sorted.
    #[must_use]
    pub fn all_files(&self) -> BTreeSet<&str> {
        self.files_added
            .iter()
            .chain(&self.files_modified)
            .chain(&self.files_deleted)
            .map(String::as_str)
            .collect()
    }

    /// How this diff touches `path`, if at all.
    #[must_use]
    pub fn change_kind(&self, path: &str) -> Option<ChangeKind> {
        if self.files_deleted.contains(path) {
            Some(ChangeKind::Deleted)
        } else if self.files_modified.contains(path) {
            Some(ChangeKind::Modified)
        } else if self.files_added.contains(path) {
            Some(ChangeKind::Added)
        } else {
            None
        }
    }

    /// Line ranges touched in `path` (empty if none were reported).
    #[must_use]
    pub fn ranges(&self, path: &str) -> &[LineRange] {
        self.line_changes.get(path).map_or(&[], Vec::as_slice)
    }

    /// Check that the recorded status is backed by the fields it implies.
    ///
    /// # Errors
    /// Returns a description of the first inconsistency found.
    pub fn check_integrity(&self) -> Result<(), String> {
        match self.status {
            DiffStatus::Verified | DiffStatus::MergeCandidate | DiffStatus::Merged => {
                match &self.verification {
                    Some(v) if v.passed => {}
                    Some(_) => {
                        return Err(format!(
                            "{} is {} but its verification result did not pass",
                            self.id, self.status
                        ));
                    }
                    None => {
                        return Err(format!(
                            "{} is {} without a verification result",
                            self.id, self.status
                        ));
                    }
                }
            }
            DiffStatus::Rejected => {
                if self.rejection.is_none() {
                    return Err(format!("{} is rejected without rejection detail", self.id));
                }
            }
            DiffStatus::Verifying => {
                if self.verifying_since.is_none() {
                    return Err(format!("{} is verifying without a claim timestamp", self.id));
                }
            }
            DiffStatus::Submitted | DiffStatus::Pending => {}
        }
        if self.status != DiffStatus::Verifying && self.verifying_since.is_some() {
            return Err(format!(
                "{} is {} but still holds a verification claim",
                self.id, self.status
            ));
        }
        match (self.status, &self.merge_batch) {
            (DiffStatus::MergeCandidate, None) => {
                return Err(format!("{} is merge_candidate without a claiming batch", self.id));
            }
            (DiffStatus::MergeCandidate | DiffStatus::Merged, _) | (_, None) => {}
            (status, Some(batch)) => {
                return Err(format!("{} is {status} but still claimed by {batch}", self.id));
            }
        }
        if self.status != DiffStatus::Rejected && self.rejection.is_some() {
            return Err(format!(
                "{} carries rejection detail while {}",
                self.id, self.status
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    fn sample() -> Diff {
        Diff {
            id: DiffId::from_sequence(1),
            seq: 1,
            work_id: WorkId::new("wp-1").unwrap(),
            instance_id: InstanceId::new("icarus-1").unwrap(),
            description: "tighten session handling".to_owned(),
            status: DiffStatus::Pending,
            files_added: BTreeSet::new(),
            files_modified: ["session.py".to_owned()].into(),
            files_deleted: ["legacy.py".to_owned()].into(),
            line_changes: [("session.py".to_owned(), vec![LineRange::new(10, 20)])].into(),
            causal_chain: CausalChain::default(),
            patch: None,
            verification: None,
            verification_attempts: 0,
            verifying_since: None,
            merge_batch: None,
            rejection: None,
            submitted_at: 100,
            updated_at: 100,
        }
    }

    #[test]
    fn happy_path_transitions() {
        use DiffStatus::*;
        assert!(Submitted.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Verified));
        assert!(Verified.can_transition_to(MergeCandidate));
        assert!(MergeCandidate.can_transition_to(Merged));
    }

    #[test]
    fn verification_cannot_be_skipped() {
        use DiffStatus::*;
        assert!(!Pending.can_transition_to(Verified));
        assert!(!Pending.can_transition_to(Rejected));
        assert!(!Submitted.can_transition_to(Verifying));
    }

    #[test]
    fn terminal_statuses_go_nowhere() {
        for next in DiffStatus::ALL {
            assert!(!DiffStatus::Merged.can_transition_to(next));
            assert!(!DiffStatus::Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn line_range_overlap_is_inclusive() {
        let a = LineRange::new(10, 20);
        assert!(a.overlaps(&LineRange::new(20, 25)));
        assert!(!a.overlaps(&LineRange::new(21, 25)));
        assert_eq!(
            a.intersection(&LineRange::new(15, 25)),
            Some(LineRange::new(15, 20))
        );
        assert!(a.contains(&LineRange::new(12, 18)));
        assert!(!LineRange::new(0, 3).is_well_formed());
        assert!(!LineRange::new(5, 3).is_well_formed());
    }

    #[test]
    fn change_kind_lookup() {
        let d = sample();
        assert_eq!(d.change_kind("session.py"), Some(ChangeKind::Modified));
        assert_eq!(d.change_kind("legacy.py"), Some(ChangeKind::Deleted));
        assert_eq!(d.change_kind("other.py"), None);
        assert_eq!(d.all_files().len(), 2);
        assert_eq!(d.ranges("legacy.py"), &[] as &[LineRange]);
    }

    #[test]
    fn verified_without_result_fails_integrity() {
        let mut d = sample();
        d.status = DiffStatus::Verified;
        assert!(d.check_integrity().is_err());
        d.verification = Some(VerificationResult {
            passed: true,
            scope: vec!["session.py".to_owned()],
            checks: Vec::new(),
            duration_ms: 5,
            completed_at: 101,
        });
        assert!(d.check_integrity().is_ok());
    }

    #[test]
    fn rejected_requires_detail() {
        let mut d = sample();
        d.status = DiffStatus::Rejected;
        assert!(d.check_integrity().is_err());
        d.rejection = Some(Rejection {
            reason: RejectionReason::VerificationFailed,
            detail: "lint failed".to_owned(),
            at: 5,
        });
        assert!(d.check_integrity().is_ok());
    }

    #[test]
    fn failure_summary_names_files() {
        let result = VerificationResult {
            passed: false,
            scope: vec!["a.py".into(), "b.py".into(), "c.py".into()],
            checks: vec![
                CheckOutcome {
                    name: "lint".into(),
                    passed: true,
                    exit_code: Some(0),
                    failing_files: vec![],
                    output: String::new(),
                    duration_ms: 1,
                },
                CheckOutcome {
                    name: "tests".into(),
                    passed: false,
                    exit_code: Some(1),
                    failing_files: vec!["b.py".into()],
                    output: "FAILED b.py::test_x".into(),
                    duration_ms: 1,
                },
            ],
            duration_ms: 2,
            completed_at: 0,
        };
        assert_eq!(result.failure_summary(), "tests failed (b.py)");
        assert_eq!(result.failing_files(), vec!["b.py".to_owned()]);
    }

    #[test]
    fn status_serde_snake_case() {
        let json = serde_json::to_string(&DiffStatus::MergeCandidate).unwrap();
        assert_eq!(json, "\"merge_candidate\"");
    }

    #[test]
    fn causal_overlap_counts_files_and_symbols() {
        let a = CausalChain {
            files: ["auth.py".into(), "session.py".into()].into(),
            symbols: ["auth:login".into()].into(),
            ..CausalChain::default()
        };
        let b = CausalChain {
            files: ["session.py".into()].into(),
            symbols: ["auth:login".into(), "api:get".into()].into(),
            ..CausalChain::default()
        };
        assert!(a.overlaps_with(&b) && b.overlaps_with(&a));
        let shared = a.overlap(&b);
        assert_eq!(shared.files, ["session.py".to_owned()].into());
        assert_eq!(shared.symbols, ["auth:login".to_owned()].into());

        let far = CausalChain {
            files: ["billing.py".into()].into(),
            ..CausalChain::default()
        };
        assert!(!a.overlaps_with(&far));
        assert!(a.overlap(&far).is_empty());
    }
}
