//! Conflict records between pairs of diffs.
//!
//! A [`Conflict`] is created by the detector when two diffs in the conflict
//! window touch the same files. It is never deleted: once either diff is
//! merged or rejected the record is marked stale and kept for audit.
//!
//! | Type | Trigger | Suggested strategy |
//! |------|---------|--------------------|
//! | [`ConflictType::FileOverlap`] | shared files, disjoint line ranges | [`MergeStrategy::Sequential`] |
//! | [`ConflictType::LineOverlap`] | overlapping line ranges | [`MergeStrategy::Escalate`], or [`MergeStrategy::Reject`] of the subset diff |
//! | [`ConflictType::Semantic`] | one side deletes a file the other touches, or both create it | [`MergeStrategy::Escalate`] |
//!
//! Each record also carries a [`ConflictSeverity`] and a
//! [`ConflictAnalysis`] (risk factors and suggested resolution steps) for
//! whoever has to decide it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::diff::LineRange;
use super::types::{ConflictId, DiffId};

// ---------------------------------------------------------------------------
// ConflictType / MergeStrategy
// ---------------------------------------------------------------------------

/// What kind of overlap two diffs have.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Both diffs touch a file, but never the same lines.
    FileOverlap,
    /// Both diffs touch at least one common line.
    LineOverlap,
    /// The diffs disagree on whether a file exists.
    Semantic,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileOverlap => write!(f, "FILE_OVERLAP"),
            Self::LineOverlap => write!(f, "LINE_OVERLAP"),
            Self::Semantic => write!(f, "SEMANTIC"),
        }
    }
}

/// How the detector suggests a conflict be handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    /// Apply one diff after the other.
    Sequential,
    /// Changes can be interleaved hunk by hunk.
    Interleave,
    /// Needs an external decision.
    Escalate,
    /// Drop the subset diff; the superset already covers it.
    Reject,
}

impl MergeStrategy {
    /// Config spelling (`sequential`, `escalate`, ...).
    #[must_use]
    pub const fn as_config_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Interleave => "interleave",
            Self::Escalate => "escalate",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "SEQUENTIAL"),
            Self::Interleave => write!(f, "INTERLEAVE"),
            Self::Escalate => write!(f, "ESCALATE"),
            Self::Reject => write!(f, "REJECT"),
        }
    }
}

/// How urgently a conflict needs a decision. Orders `Low < Critical`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    /// Independent edits to one file; ordering is enough.
    #[default]
    Low,
    /// A small line overlap.
    Medium,
    /// A wide line overlap, or one spanning several files.
    High,
    /// The diffs disagree on whether a file exists.
    Critical,
}

impl fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Guidance attached to a conflict at detection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    /// What makes the overlap risky.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_factors: Vec<String>,
    /// Suggested steps for whoever resolves it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolution_steps: Vec<String>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// An external decision on a conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// Keep `diff`; the other party is rejected.
    Survivor {
        /// The diff that survives.
        diff: DiffId,
    },
    /// Keep both, with `first` applied ahead of the other.
    Sequential {
        /// The diff ordered first.
        first: DiffId,
    },
    /// Send `diff` back through verification once the other merges.
    Requeue {
        /// The diff that is re-verified.
        diff: DiffId,
    },
}

impl Resolution {
    /// The diff the resolution names.
    #[must_use]
    pub const fn named(&self) -> &DiffId {
        match self {
            Self::Survivor { diff } | Self::Requeue { diff } => diff,
            Self::Sequential { first } => first,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Survivor { diff } => write!(f, "survivor {diff}"),
            Self::Sequential { first } => write!(f, "sequential, {first} first"),
            Self::Requeue { diff } => write!(f, "requeue {diff}"),
        }
    }
}

/// A resolution together with who/when metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    /// The decision.
    pub resolution: Resolution,
    /// Free-form note (`"auto: default policy"`, operator comment, ...).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
    /// Unix timestamp (seconds).
    pub resolved_at: u64,
    /// Set once the decision's side effects (rejecting the loser,
    /// re-queueing a diff) have been carried out.
    #[serde(default)]
    pub applied: bool,
}

// ---------------------------------------------------------------------------
// Conflict
// ---------------------------------------------------------------------------

/// A detected overlap between two diffs.
///
/// `diff_a` is always the smaller id, so the pair is stored canonically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Derived from the pair, see [`ConflictId::for_pair`].
    pub id: ConflictId,
    /// Lower diff id of the pair.
    pub diff_a: DiffId,
    /// Higher diff id of the pair.
    pub diff_b: DiffId,
    /// Kind of overlap.
    pub conflict_type: ConflictType,
    /// Files both diffs touch.
    pub files: BTreeSet<String>,
    /// Per file, the shared line ranges (only for line overlaps).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub line_ranges: BTreeMap<String, Vec<LineRange>>,
    /// Suggested handling.
    pub strategy: MergeStrategy,
    /// How urgently it needs a decision.
    #[serde(default)]
    pub severity: ConflictSeverity,
    /// Risk factors and suggested steps.
    #[serde(default)]
    pub analysis: ConflictAnalysis,
    /// For [`MergeStrategy::Reject`], the diff whose change is a subset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_candidate: Option<DiffId>,
    /// Human-readable summary.
    pub description: String,
    /// Unix timestamp (seconds) of detection.
    pub detected_at: u64,
    /// Set once the conflict has been decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionRecord>,
    /// Set once either diff is merged or rejected.
    #[serde(default)]
    pub stale: bool,
    /// Unix timestamp (seconds) at which the record went stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_at: Option<u64>,
}

impl Conflict {
    /// Returns `true` if the conflict still blocks its diffs.
    #[must_use]
    pub const fn is_unresolved(&self) -> bool {
        self.resolution.is_none() && !self.stale
    }

    /// Returns `true` if `diff` is one of the two parties.
    #[must_use]
    pub fn involves(&self, diff: &DiffId) -> bool {
        &self.diff_a == diff || &self.diff_b == diff
    }

    /// The party that is not `diff`, if `diff` is a party.
    #[must_use]
    pub fn other(&self, diff: &DiffId) -> Option<&DiffId> {
        if &self.diff_a == diff {
            Some(&self.diff_b)
        } else if &self.diff_b == diff {
            Some(&self.diff_a)
        } else {
            None
        }
    }

    /// Diffs allowed to proceed under the recorded resolution, in the
    /// order they should be applied. Empty while unresolved.
    #[must_use]
    pub fn survivors(&self) -> Vec<DiffId> {
        let Some(record) = &self.resolution else {
            return Vec::new();
        };
        match &record.resolution {
            Resolution::Survivor { diff } => vec![diff.clone()],
            Resolution::Sequential { first } | Resolution::Requeue { diff: first } => {
                let mut order = vec![first.clone()];
                order.extend(self.other(first).cloned());
                if matches!(record.resolution, Resolution::Requeue { .. }) {
                    order.reverse();
                }
                order
            }
        }
    }

    /// The party the resolution drops, if any.
    #[must_use]
    pub fn loser(&self) -> Option<&DiffId> {
        match self.resolution.as_ref().map(|r| &r.resolution) {
            Some(Resolution::Survivor { diff }) => self.other(diff),
            _ => None,
        }
    }

    /// Check the record's internal consistency.
    ///
    /// # Errors
    /// Returns a description of the first inconsistency found.
    pub fn check_integrity(&self) -> Result<(), String> {
        if self.diff_a >= self.diff_b {
            return Err(format!(
                "{}: parties must be distinct and ordered ({} / {})",
                self.id, self.diff_a, self.diff_b
            ));
        }
        if self.id != ConflictId::for_pair(&self.diff_a, &self.diff_b) {
            return Err(format!("{}: id does not match its pair", self.id));
        }
        if self.files.is_empty() {
            return Err(format!("{}: no affected files", self.id));
        }
        if let Some(candidate) = &self.reject_candidate
            && !self.involves(candidate)
        {
            return Err(format!(
                "{}: reject candidate {candidate} is not a party",
                self.id
            ));
        }
        if let Some(record) = &self.resolution
            && !self.involves(record.resolution.named())
        {
            return Err(format!(
                "{}: resolution names {} which is not a party",
                self.id,
                record.resolution.named()
            ));
        }
        if self.stale != self.stale_at.is_some() {
            return Err(format!("{}: stale flag and timestamp disagree", self.id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
