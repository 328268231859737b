//! Conflict detection and resolution.
//!
//! The detector compares every unordered pair of diffs in the conflict
//! window (pending, verifying, verified, merge candidate) that has no
//! conflict record yet:
//!
//! - no shared file: no conflict
//! - one side deletes a file the other touches at all, or both create the
//!   same file: `SEMANTIC`, suggest `ESCALATE`
//! - shared files, some touched line ranges overlap: `LINE_OVERLAP`,
//!   suggest `REJECT` of the subset diff when one footprint strictly
//!   contains the other, otherwise `ESCALATE`
//! - shared files, disjoint (or unreported) line ranges: `FILE_OVERLAP`,
//!   suggest `SEQUENTIAL`
//!
//! Each conflict is graded: `SEMANTIC` is critical, a line overlap is high
//! when it spans more than [`WIDE_OVERLAP_LINES`] lines or several files and
//! medium otherwise, a file overlap is low. The analysis lists risk factors
//! (including shared causal paths) and steps for the suggested strategy.
//!
//! Classification is a pure function of the two diffs with the pair put in
//! canonical order first, so it is symmetric. Conflict ids are derived from
//! the pair, so re-running detection never creates a duplicate. A new
//! conflict blocks merge eligibility of both diffs; it never touches their
//! verification status.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::config::AutoResolve;
use crate::dispatch::return_to_ready;
use crate::error::BusError;
use crate::causal::check_causal_conflict;
use crate::model::conflict::{
    Conflict, ConflictAnalysis, ConflictSeverity, ConflictType, MergeStrategy, Resolution, ResolutionRecord,
};
use crate::model::diff::{ChangeKind, Diff, DiffStatus, LineRange, Rejection, RejectionReason};
use crate::model::types::{ConflictId, DiffId, unix_now};
use crate::store::{BusStore, Collection, StoreError};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Overlapping lines above which a line overlap is graded high.
pub const WIDE_OVERLAP_LINES: u64 = 10;

/// Classify the overlap between two diffs, or `None` if they touch no
/// common file. `classify(a, b) == classify(b, a)`.
#[must_use]
pub fn classify(a: &Diff, b: &Diff, now: u64) -> Option<Conflict> {
    let (a, b) = if a.id <= b.id { (a, b) } else { (b, a) };
    if a.id == b.id {
        return None;
    }
    let files_a = a.all_files();
    let files_b = b.all_files();
    let shared: BTreeSet<String> = files_a
        .intersection(&files_b)
        .map(|p| (*p).to_owned())
        .collect();
    if shared.is_empty() {
        return None;
    }

    // Both sides must agree a file exists to edit it independently.
    let semantic: Vec<String> = shared
        .iter()
        .filter_map(|path| match (a.change_kind(path), b.change_kind(path)) {
            (Some(ChangeKind::Deleted), Some(ChangeKind::Deleted)) => Some(format!("both delete {path}")),
            (Some(ChangeKind::Added), Some(ChangeKind::Added)) => Some(format!("both create {path}")),
            (Some(ChangeKind::Deleted), Some(_)) | (Some(_), Some(ChangeKind::Deleted)) => {
                Some(format!("disagree on whether {path} should exist"))
            }
            _ => None,
        })
        .collect();

    let mut overlaps: BTreeMap<String, Vec<LineRange>> = BTreeMap::new();
    for path in &shared {
        let mut hits: Vec<LineRange> = a
            .ranges(path)
            .iter()
            .flat_map(|ra| b.ranges(path).iter().filter_map(|rb| ra.intersection(rb)))
            .collect();
        if !hits.is_empty() {
            hits.sort_unstable();
            hits.dedup();
            overlaps.insert(path.clone(), hits);
        }
    }

    let files_list = shared.iter().cloned().collect::<Vec<_>>().join(", ");
    let (conflict_type, strategy, reject_candidate, description) = if !semantic.is_empty() {
        (
            ConflictType::Semantic,
            MergeStrategy::Escalate,
            None,
            format!("{} and {} {}", a.id, b.id, semantic.join("; ")),
        )
    } else if !overlaps.is_empty() {
        let subset = if footprint_contains(a, b) {
            Some(b.id.clone())
        } else if footprint_contains(b, a) {
            Some(a.id.clone())
        } else {
            None
        };
        let spans: Vec<String> = overlaps
            .iter()
            .map(|(path, ranges)| {
                let r: Vec<String> = ranges.iter().map(ToString::to_string).collect();
                format!("{path}:{}", r.join(","))
            })
            .collect();
        match subset {
            Some(candidate) => (
                ConflictType::LineOverlap,
                MergeStrategy::Reject,
                Some(candidate.clone()),
                format!(
                    "{} and {} edit the same lines ({}); {candidate} is fully covered by the other",
                    a.id,
                    b.id,
                    spans.join("; ")
                ),
            ),
            None => (
                ConflictType::LineOverlap,
                MergeStrategy::Escalate,
                None,
                format!("{} and {} edit the same lines ({})", a.id, b.id, spans.join("; ")),
            ),
        }
    } else {
        (
            ConflictType::FileOverlap,
            MergeStrategy::Sequential,
            None,
            format!(
                "{} and {} both touch {files_list} on disjoint lines",
                a.id, b.id
            ),
        )
    };

    let severity = severity(conflict_type, &overlaps);
    let analysis = analyse(a, b, conflict_type, strategy, &semantic, &overlaps, &files_list);

    Some(Conflict {
        id: ConflictId::for_pair(&a.id, &b.id),
        diff_a: a.id.clone(),
        diff_b: b.id.clone(),
        conflict_type,
        files: shared,
        line_ranges: overlaps,
        strategy,
        severity,
        analysis,
        reject_candidate,
        description,
        detected_at: now,
        resolution: None,
        stale: false,
        stale_at: None,
    })
}

/// Grade a conflict by kind and overlap size.
#[must_use]
pub fn severity(kind: ConflictType, overlaps: &BTreeMap<String, Vec<LineRange>>) -> ConflictSeverity {
    match kind {
        ConflictType::Semantic => ConflictSeverity::Critical,
        ConflictType::FileOverlap => ConflictSeverity::Low,
        ConflictType::LineOverlap => {
            let lines: u64 = overlaps.values().flatten().map(LineRange::line_count).sum();
            if lines > WIDE_OVERLAP_LINES || overlaps.len() > 1 {
                ConflictSeverity::High
            } else {
                ConflictSeverity::Medium
            }
        }
    }
}

fn analyse(
    a: &Diff,
    b: &Diff,
    kind: ConflictType,
    strategy: MergeStrategy,
    semantic: &[String],
    overlaps: &BTreeMap<String, Vec<LineRange>>,
    files_list: &str,
) -> ConflictAnalysis {
    let mut risk_factors: Vec<String> = match kind {
        ConflictType::Semantic => semantic.iter().map(|r| format!("The diffs {r}")).collect(),
        ConflictType::LineOverlap => {
            let files: Vec<&str> = overlaps.keys().map(String::as_str).collect();
            vec![format!("Same lines modified in: {}", files.join(", "))]
        }
        ConflictType::FileOverlap => vec![format!("Same files, different sections: {files_list}")],
    };
    if let Some(shared) = check_causal_conflict(&a.causal_chain, &b.causal_chain) {
        let mut paths: Vec<&str> = shared.files.iter().map(String::as_str).collect();
        paths.extend(shared.symbols.iter().map(String::as_str));
        risk_factors.push(format!(
            "Changes reach the same code paths ({}); verification must cover both",
            paths.join(", ")
        ));
    }

    let resolution_steps = match strategy {
        MergeStrategy::Sequential => vec![
            format!("Merge {} first", a.id),
            format!("Re-verify {} against the result", b.id),
            format!("Merge {}", b.id),
        ],
        MergeStrategy::Interleave => vec![
            "Combine both changes into one tree".to_owned(),
            "Verify the combination as a whole".to_owned(),
        ],
        MergeStrategy::Reject => vec![
            "Keep the diff whose change covers the other".to_owned(),
            "Return the covered diff's work package for replanning".to_owned(),
        ],
        MergeStrategy::Escalate if kind == ConflictType::Semantic => vec![
            format!("Decide whether {files_list} should exist after both changes"),
            "Pick a survivor or requeue one side".to_owned(),
            "Re-verify whatever depends on the file".to_owned(),
        ],
        MergeStrategy::Escalate => vec![
            "Compare both edits to the overlapping lines".to_owned(),
            "Pick a survivor, sequence them, or requeue one side".to_owned(),
        ],
    };

    ConflictAnalysis {
        risk_factors,
        resolution_steps,
    }
}

/// Whether `big`'s change strictly contains `small`'s: every file `small`
/// touches is touched the same way by `big`, every range of `small` lies in
/// a range of `big`, and the two footprints differ.
fn footprint_contains(big: &Diff, small: &Diff) -> bool {
    let small_files = small.all_files();
    let big_files = big.all_files();
    if !small_files.is_subset(&big_files) {
        return false;
    }
    for path in &small_files {
        if small.change_kind(path) != big.change_kind(path) {
            return false;
        }
        let big_ranges = big.ranges(path);
        let covered = small
            .ranges(path)
            .iter()
            .all(|r| big_ranges.iter().any(|b| b.contains(r)));
        if !covered {
            return false;
        }
    }
    let identical = small_files == big_files
        && small_files
            .iter()
            .all(|path| normalized(small.ranges(path)) == normalized(big.ranges(path)));
    !identical
}

fn normalized(ranges: &[LineRange]) -> Vec<LineRange> {
    let mut v = ranges.to_vec();
    v.sort_unstable();
    v.dedup();
    v
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Decides which conflicts can be resolved without a human.
pub trait ConflictPolicy {
    /// A resolution for `conflict`, or `None` to leave it escalated.
    fn decide(&self, conflict: &Conflict, a: &Diff, b: &Diff) -> Option<Resolution>;

    /// Short name recorded in resolution notes.
    fn name(&self) -> &str {
        "policy"
    }
}

/// Resolves the configured suggestion kinds and escalates the rest.
///
/// `SEQUENTIAL` suggestions are ordered by submission; `REJECT` suggestions
/// keep the superset diff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultPolicy {
    auto: BTreeSet<AutoResolve>,
}

impl DefaultPolicy {
    /// Policy acting on the given suggestion kinds.
    #[must_use]
    pub const fn new(auto: BTreeSet<AutoResolve>) -> Self {
        Self { auto }
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self::new([AutoResolve::Sequential].into())
    }
}

impl ConflictPolicy for DefaultPolicy {
    fn decide(&self, conflict: &Conflict, a: &Diff, b: &Diff) -> Option<Resolution> {
        match conflict.strategy {
            MergeStrategy::Sequential if self.auto.contains(&AutoResolve::Sequential) => {
                let first = if a.seq <= b.seq { &a.id } else { &b.id };
                Some(Resolution::Sequential {
                    first: first.clone(),
                })
            }
            MergeStrategy::Reject if self.auto.contains(&AutoResolve::Reject) => {
                let loser = conflict.reject_candidate.as_ref()?;
                conflict.other(loser).map(|keep| Resolution::Survivor {
                    diff: keep.clone(),
                })
            }
            _ => None,
        }
    }

    fn name(&self) -> &str {
        "default"
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Finds, resolves and retires conflicts.
pub struct ConflictDetector<'a, S> {
    store: &'a S,
}

impl<'a, S: BusStore> ConflictDetector<'a, S> {
    /// Detector over `store`.
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Record conflicts for every overlapping pair in the window that has
    /// none yet. Returns the newly created records.
    ///
    /// # Errors
    /// Store failures.
    pub fn detect(&self) -> Result<Vec<Conflict>, BusError> {
        let window = self.store.list(|d: &Diff| d.status.in_conflict_window())?;
        let known: BTreeSet<String> = self.store.ids(Collection::Conflicts)?.into_iter().collect();
        let now = unix_now();

        // Only pairs sharing a file can conflict.
        let mut by_file: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, diff) in window.iter().enumerate() {
            for path in diff.all_files() {
                by_file.entry(path).or_default().push(i);
            }
        }
        let mut pairs: BTreeSet<(usize, usize)> = BTreeSet::new();
        for members in by_file.values() {
            for (n, &i) in members.iter().enumerate() {
                for &j in &members[n + 1..] {
                    pairs.insert((i.min(j), i.max(j)));
                }
            }
        }

        let mut created = Vec::new();
        for (i, j) in pairs {
            let (a, b) = (&window[i], &window[j]);
            if known.contains(ConflictId::for_pair(&a.id, &b.id).as_str()) {
                continue;
            }
            let Some(conflict) = classify(a, b, now) else {
                continue;
            };
            match self.store.insert(&conflict) {
                Ok(()) => {
                    info!(
                        conflict = %conflict.id,
                        kind = %conflict.conflict_type,
                        strategy = %conflict.strategy,
                        "conflict detected"
                    );
                    created.push(conflict);
                }
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created)
    }

    /// Mark conflicts stale once either diff has merged, been rejected, or
    /// vanished. Returns how many were marked.
    ///
    /// # Errors
    /// Store failures.
    pub fn mark_stale(&self) -> Result<usize, BusError> {
        let live = self.store.list(|c: &Conflict| !c.stale)?;
        let now = unix_now();
        let mut marked = 0;
        for conflict in live {
            if self.party_retired(&conflict.diff_a)? || self.party_retired(&conflict.diff_b)? {
                self.store.update::<Conflict>(conflict.id.as_str(), |c| {
                    c.stale = true;
                    c.stale_at = Some(now);
                    Ok(())
                })?;
                debug!(conflict = %conflict.id, "conflict went stale");
                marked += 1;
            }
        }
        Ok(marked)
    }

    fn party_retired(&self, id: &DiffId) -> Result<bool, BusError> {
        Ok(self
            .store
            .get::<Diff>(id.as_str())?
            .is_none_or(|d| d.status.is_terminal()))
    }

    /// Unresolved conflicts involving `diff`.
    ///
    /// # Errors
    /// Store failures.
    pub fn unresolved_for(&self, diff: &DiffId) -> Result<Vec<Conflict>, BusError> {
        Ok(self
            .store
            .list(|c: &Conflict| c.is_unresolved() && c.involves(diff))?)
    }

    /// Fail with [`BusError::ConflictUnresolved`] if `diff` is blocked.
    ///
    /// # Errors
    /// `ConflictUnresolved`, or store failures.
    pub fn ensure_unblocked(&self, diff: &DiffId) -> Result<(), BusError> {
        let blocking = self.unresolved_for(diff)?;
        if blocking.is_empty() {
            Ok(())
        } else {
            Err(BusError::ConflictUnresolved {
                diff: diff.clone(),
                conflicts: blocking.into_iter().map(|c| c.id).collect(),
            })
        }
    }

    /// Record a decision on a conflict and carry out what it can right away.
    ///
    /// # Errors
    /// `NotFound`, [`BusError::InvalidResolution`] if the conflict is already
    /// decided, stale, or the resolution names a diff outside the pair; or
    /// store failures.
    pub fn resolve(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        note: impl Into<String>,
    ) -> Result<Conflict, BusError> {
        let note = note.into();
        let now = unix_now();
        let mut refusal: Option<String> = None;
        let updated = self.store.update::<Conflict>(id.as_str(), |c| {
            if c.stale {
                refusal = Some("conflict is stale; one of its diffs already left the bus".to_owned());
            } else if let Some(existing) = &c.resolution {
                refusal = Some(format!("already resolved ({})", existing.resolution));
            } else if !c.involves(resolution.named()) {
                refusal = Some(format!(
                    "{} is not a party (parties: {}, {})",
                    resolution.named(),
                    c.diff_a,
                    c.diff_b
                ));
            } else {
                c.resolution = Some(ResolutionRecord {
                    resolution: resolution.clone(),
                    note: note.clone(),
                    resolved_at: now,
                    applied: false,
                });
            }
            Ok(())
        })?;
        if let Some(reason) = refusal {
            return Err(BusError::InvalidResolution {
                conflict: id.clone(),
                reason,
            });
        }
        info!(conflict = %id, %resolution, "conflict resolved");
        self.apply_one(&updated)?;
        self.store.require::<Conflict>(id.as_str()).map_err(Into::into)
    }

    /// Resolve every unresolved conflict the policy has an answer for.
    /// Returns the conflicts it resolved.
    ///
    /// # Errors
    /// Store failures.
    pub fn apply_policy(&self, policy: &dyn ConflictPolicy) -> Result<Vec<ConflictId>, BusError> {
        let mut resolved = Vec::new();
        for conflict in self.store.list(Conflict::is_unresolved)? {
            let a = self.store.get::<Diff>(conflict.diff_a.as_str())?;
            let b = self.store.get::<Diff>(conflict.diff_b.as_str())?;
            let (Some(a), Some(b)) = (a, b) else {
                continue;
            };
            match policy.decide(&conflict, &a, &b) {
                Some(resolution) => {
                    let note = format!("auto: {} policy", policy.name());
                    match self.resolve(&conflict.id, resolution, note) {
                        Ok(_) => resolved.push(conflict.id),
                        Err(BusError::InvalidResolution { reason, .. }) => {
                            debug!(conflict = %conflict.id, %reason, "policy resolution skipped");
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    warn!(
                        conflict = %conflict.id,
                        strategy = %conflict.strategy,
                        "conflict escalated; waiting for a resolution"
                    );
                }
            }
        }
        Ok(resolved)
    }

    /// Carry out pending resolution side effects. Returns how many
    /// resolutions were completed.
    ///
    /// # Errors
    /// Store failures.
    pub fn apply_resolutions(&self) -> Result<usize, BusError> {
        let pending = self.store.list(|c: &Conflict| {
            !c.stale && c.resolution.as_ref().is_some_and(|r| !r.applied)
        })?;
        let mut done = 0;
        for conflict in pending {
            if self.apply_one(&conflict)? {
                done += 1;
            }
        }
        Ok(done)
    }

    /// Apply one resolution if its target is in a state that allows it.
    /// Returns `true` once the resolution is fully applied.
    fn apply_one(&self, conflict: &Conflict) -> Result<bool, BusError> {
        let Some(record) = &conflict.resolution else {
            return Ok(false);
        };
        if record.applied {
            return Ok(true);
        }
        let complete = match &record.resolution {
            Resolution::Sequential { .. } => true,
            Resolution::Survivor { diff } => {
                let Some(loser) = conflict.other(diff) else {
                    return Ok(false);
                };
                self.reject_loser(conflict, loser, diff)?
            }
            Resolution::Requeue { diff } => self.requeue(conflict, diff)?,
        };
        if complete {
            self.store.update::<Conflict>(conflict.id.as_str(), |c| {
                if let Some(r) = c.resolution.as_mut() {
                    r.applied = true;
                }
                Ok(())
            })?;
        }
        Ok(complete)
    }

    /// Reject a losing diff once it has finished verification. A loser
    /// still pending or verifying is left alone (it is excluded from
    /// batches meanwhile) and retried on the next pass.
    fn reject_loser(&self, conflict: &Conflict, loser: &DiffId, winner: &DiffId) -> Result<bool, BusError> {
        let Some(diff) = self.store.get::<Diff>(loser.as_str())? else {
            return Ok(true);
        };
        match diff.status {
            DiffStatus::Verified => {
                let now = unix_now();
                let detail = format!("lost {} to {winner}", conflict.id);
                match self.store.transition::<Diff>(
                    loser.as_str(),
                    DiffStatus::Verified,
                    DiffStatus::Rejected,
                    |d| {
                        d.rejection = Some(Rejection {
                            reason: RejectionReason::LostConflict,
                            detail: detail.clone(),
                            at: now,
                        });
                        d.updated_at = now;
                    },
                ) {
                    Ok(rejected) => {
                        info!(diff = %loser, conflict = %conflict.id, "diff rejected by conflict resolution");
                        return_to_ready(self.store, &rejected.work_id, &detail)?;
                        Ok(true)
                    }
                    Err(StoreError::StaleStatus { .. }) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            DiffStatus::Merged | DiffStatus::Rejected => Ok(true),
            DiffStatus::Submitted
            | DiffStatus::Pending
            | DiffStatus::Verifying
            | DiffStatus::MergeCandidate => Ok(false),
        }
    }

    /// Send a verified diff back to `pending`.
    fn requeue(&self, conflict: &Conflict, target: &DiffId) -> Result<bool, BusError> {
        let Some(diff) = self.store.get::<Diff>(target.as_str())? else {
            return Ok(true);
        };
        match diff.status {
            DiffStatus::Verified => {
                let now = unix_now();
                match self.store.transition::<Diff>(
                    target.as_str(),
                    DiffStatus::Verified,
                    DiffStatus::Pending,
                    |d| {
                        d.verification = None;
                        d.updated_at = now;
                    },
                ) {
                    Ok(_) => {
                        info!(diff = %target, conflict = %conflict.id, "diff re-queued for verification");
                        Ok(true)
                    }
                    Err(StoreError::StaleStatus { .. }) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            // Not yet verified: the upcoming verification is the re-check.
            DiffStatus::Submitted
            | DiffStatus::Pending
            | DiffStatus::Verifying
            | DiffStatus::Merged
            | DiffStatus::Rejected => Ok(true),
            DiffStatus::MergeCandidate => Ok(false),
        }
    }

    /// Diffs that lost a decided, still-live conflict and must not merge.
    ///
    /// # Errors
    /// Store failures.
    pub fn losers(&self) -> Result<BTreeSet<DiffId>, BusError> {
        Ok(self
            .store
            .list(|c: &Conflict| !c.stale)?
            .iter()
            .filter_map(|c| c.loser().cloned())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
