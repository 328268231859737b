//! Merge coordination.
//!
//! Folds `verified` diffs into one [`MergeBatch`]:
//!
//! 1. **Select**: verified diffs with no unresolved conflict that did not
//!    lose a decided one.
//! 2. **Order**: dependency order, then resolved sequential order, then
//!    submission order.
//! 3. **Accept** greedily, deferring any diff whose work depends on
//!    unmerged work outside the batch, that is ordered after a diff which
//!    has not merged yet, or that collides (overlapping lines, a delete, or
//!    a double add) with a diff already accepted. Deferred diffs stay
//!    `verified`.
//! 4. **Re-verify** the whole batch scope, if configured. A failure
//!    discards the batch without touching any status.
//! 5. **Finalise**: CAS every constituent `verified -> merge_candidate`
//!    claimed by the batch id (rolling back on any mismatch), write the
//!    batch, check the claims still hold, then move the constituents to
//!    `merged` and their work packages to `done`. A claim lost before
//!    anything merged retracts the batch record and fails with
//!    [`BusError::ConcurrentMutation`].
//!
//! A crash between writing the batch and finishing step 5 leaves diffs in
//! `merge_candidate`; [`Coordinator::recover`] completes or undoes them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::conflict::ConflictDetector;
use crate::dispatch::mark_done;
use crate::error::BusError;
use crate::model::batch::{FileChangeSet, MergeBatch};
use crate::model::conflict::{Conflict, Resolution};
use crate::model::diff::{ChangeKind, Diff, DiffStatus};
use crate::model::types::{BatchId, DiffId, WorkId, unix_now};
use crate::model::work::{WorkPackage, WorkStatus};
use crate::store::{BusStore, Collection, StoreError};
use crate::verify::{CheckRunner, CheckStatus, scope_for};

/// Hex digits of the content hash kept in a batch id.
const BATCH_HASH_LEN: usize = 12;

/// Which diffs a batch would take, without writing anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    /// Accepted diffs in application order.
    pub accepted: Vec<DiffId>,
    /// Verified diffs left out, with the reason.
    pub deferred: Vec<(DiffId, String)>,
}

/// Seconds a `merge_candidate` with no written batch is left alone by a
/// coordinator that does not hold the leader lock. Another process may be
/// between promoting it and writing its batch.
pub const ORPHAN_GRACE_SECS: u64 = 60;

/// Merge stage.
pub struct Coordinator<'a, S> {
    store: &'a S,
    runner: &'a dyn CheckRunner,
    verify_batch: bool,
    exclusive: bool,
}

impl<'a, S: BusStore> Coordinator<'a, S> {
    /// Coordinator over `store`. `runner` re-verifies batches when
    /// `verify_batch` is set.
    #[must_use]
    pub const fn new(store: &'a S, runner: &'a dyn CheckRunner, verify_batch: bool) -> Self {
        Self {
            store,
            runner,
            verify_batch,
            exclusive: false,
        }
    }

    /// Mark the caller as the only merging process (it holds the leader
    /// lock). Recovery then releases unbatched candidates immediately
    /// instead of waiting out [`ORPHAN_GRACE_SECS`].
    #[must_use]
    pub const fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Decide the next batch.
    ///
    /// # Errors
    /// Store failures.
    pub fn plan(&self) -> Result<BatchPlan, BusError> {
        let detector = ConflictDetector::new(self.store);
        let losers = detector.losers()?;
        let conflicts = self.store.list(|c: &Conflict| !c.stale)?;
        let blocked: BTreeSet<&DiffId> = conflicts
            .iter()
            .filter(|c| c.is_unresolved())
            .flat_map(|c| [&c.diff_a, &c.diff_b])
            .collect();

        let mut plan = BatchPlan::default();
        let mut candidates: Vec<Diff> = Vec::new();
        for diff in self.store.list(|d: &Diff| d.status == DiffStatus::Verified)? {
            if losers.contains(&diff.id) {
                plan.deferred.push((diff.id.clone(), "lost a conflict resolution".to_owned()));
            } else if blocked.contains(&diff.id) {
                plan.deferred.push((diff.id.clone(), "unresolved conflict".to_owned()));
            } else {
                candidates.push(diff);
            }
        }
        if candidates.is_empty() {
            return Ok(plan);
        }

        let work: BTreeMap<WorkId, WorkPackage> = self
            .store
            .all::<WorkPackage>()?
            .into_iter()
            .map(|w| (w.id.clone(), w))
            .collect();
        // Ordered pairs from sequential and requeue decisions. The second
        // party waits until the first has merged or joins the same batch.
        let sequenced: BTreeSet<(DiffId, DiffId)> = conflicts
            .iter()
            .filter(|c| {
                matches!(
                    c.resolution.as_ref().map(|r| &r.resolution),
                    Some(Resolution::Sequential { .. } | Resolution::Requeue { .. })
                )
            })
            .filter_map(|c| match c.survivors().as_slice() {
                [first, second] => Some((first.clone(), second.clone())),
                _ => None,
            })
            .collect();
        let mut settled: BTreeSet<DiffId> = BTreeSet::new();
        for (first, _) in &sequenced {
            let terminal = self
                .store
                .get::<Diff>(first.as_str())?
                .is_none_or(|d| d.status.is_terminal());
            if terminal {
                settled.insert(first.clone());
            }
        }

        let (order, cyclic) = order_candidates(&candidates, &work, &sequenced);
        for id in cyclic {
            plan.deferred.push((id, "ordering cycle between dependencies and resolutions".to_owned()));
        }

        let by_id: BTreeMap<&DiffId, &Diff> = candidates.iter().map(|d| (&d.id, d)).collect();
        let mut accepted: Vec<&Diff> = Vec::new();
        for id in order {
            let Some(diff) = by_id.get(&id).copied() else {
                continue;
            };
            if let Some(reason) = unmet_dependency(diff, &work, &accepted) {
                plan.deferred.push((id, reason));
                continue;
            }
            if let Some(reason) = unmet_sequence(diff, &sequenced, &settled, &accepted) {
                plan.deferred.push((id, reason));
                continue;
            }
            if let Some(reason) = accepted.iter().find_map(|other| collision(diff, other)) {
                plan.deferred.push((id, reason));
                continue;
            }
            accepted.push(diff);
        }
        plan.accepted = accepted.iter().map(|d| d.id.clone()).collect();
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Assembly
    // -----------------------------------------------------------------------

    /// Assemble and finalise the next batch. `None` if nothing is eligible.
    ///
    /// # Errors
    /// [`BusError::BatchVerificationFailed`] (nothing changed),
    /// [`BusError::ConcurrentMutation`] (rolled back, or left for
    /// [`Coordinator::recover`] once part of the batch has merged), or store
    /// and runner failures.
    pub fn merge(&self) -> Result<Option<MergeBatch>, BusError> {
        self.recover()?;
        let plan = self.plan()?;
        for (id, reason) in &plan.deferred {
            debug!(diff = %id, %reason, "diff deferred");
        }
        if plan.accepted.is_empty() {
            return Ok(None);
        }

        let mut diffs = Vec::with_capacity(plan.accepted.len());
        for id in &plan.accepted {
            diffs.push(self.store.require::<Diff>(id.as_str())?);
        }

        if self.verify_batch {
            self.verify_whole(&diffs)?;
        }

        let batch = assemble(&diffs, unix_now());
        self.promote(&plan.accepted, &batch.id)?;
        if let Err(e) = self.store.insert(&batch) {
            for id in &plan.accepted {
                self.release(id, Some(&batch.id))?;
            }
            return Err(e.into());
        }
        if let Err(e) = self.secure(&batch) {
            warn!(batch = %batch.id, error = %e, "batch lost a constituent before merging; retracting");
            self.retract(&batch)?;
            return Err(e);
        }
        self.finalise(&batch)?;
        info!(batch = %batch.id, diffs = batch.diff_ids.len(), files = batch.changes.len(), "batch merged");
        Ok(Some(batch))
    }

    /// Finish or undo merges another pass left half done. A written batch
    /// whose constituents are all still claimed is finalised; one that lost
    /// a constituent before anything merged is retracted. Candidates with
    /// no written batch go back to `verified` (immediately when exclusive,
    /// otherwise after [`ORPHAN_GRACE_SECS`]). Returns how many diffs were
    /// touched.
    ///
    /// # Errors
    /// Store failures.
    pub fn recover(&self) -> Result<usize, BusError> {
        let diffs = self.store.all::<Diff>()?;
        let status: BTreeMap<&DiffId, DiffStatus> = diffs.iter().map(|d| (&d.id, d.status)).collect();
        let batches = self.store.all::<MergeBatch>()?;
        let mut touched = 0;
        for batch in &batches {
            let unfinished = batch
                .diff_ids
                .iter()
                .any(|id| status.get(id).is_some_and(|s| *s != DiffStatus::Merged));
            if !unfinished {
                continue;
            }
            match self.secure(batch) {
                Ok(()) => {
                    warn!(batch = %batch.id, "finishing interrupted merge");
                    touched += self.finalise(batch)?;
                }
                Err(e) => {
                    warn!(batch = %batch.id, error = %e, "interrupted merge cannot complete; retracting");
                    touched += self.retract(batch)?;
                }
            }
        }

        let now = unix_now();
        let written: BTreeSet<&BatchId> = batches.iter().map(|b| &b.id).collect();
        let orphans: Vec<&Diff> = diffs
            .iter()
            .filter(|d| d.status == DiffStatus::MergeCandidate)
            .filter(|d| d.merge_batch.as_ref().is_none_or(|b| !written.contains(b)))
            .filter(|d| self.exclusive || now.saturating_sub(d.updated_at) >= ORPHAN_GRACE_SECS)
            .collect();
        if !orphans.is_empty() {
            warn!(diffs = orphans.len(), "rolling back merge candidates with no batch");
        }
        for diff in orphans {
            if self.release(&diff.id, diff.merge_batch.as_ref())? {
                touched += 1;
            }
        }
        Ok(touched)
    }

    fn verify_whole(&self, diffs: &[Diff]) -> Result<(), BusError> {
        let scope: BTreeSet<String> = diffs.iter().flat_map(scope_for).collect();
        let scope: Vec<String> = scope.into_iter().collect();
        let ids = || diffs.iter().map(|d| d.id.clone()).collect::<Vec<_>>();
        let report = self.runner.run(&scope)?;
        let detail = match report.status {
            CheckStatus::Passed => return Ok(()),
            CheckStatus::TimedOut => "batch verification timed out".to_owned(),
            CheckStatus::Failed => {
                let failing: Vec<String> = report
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
                failing.join("; ")
            }
        };
        warn!(diffs = diffs.len(), %detail, "batch verification failed; batch discarded");
        Err(BusError::BatchVerificationFailed { diffs: ids(), detail })
    }

    /// CAS every accepted diff into `merge_candidate` claimed by `batch`,
    /// undoing on mismatch.
    fn promote(&self, ids: &[DiffId], batch: &BatchId) -> Result<(), BusError> {
        let now = unix_now();
        let mut moved: Vec<&DiffId> = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.transition::<Diff>(
                id.as_str(),
                DiffStatus::Verified,
                DiffStatus::MergeCandidate,
                |d| {
                    d.merge_batch = Some(batch.clone());
                    d.updated_at = now;
                },
            ) {
                Ok(_) => moved.push(id),
                Err(e) => {
                    for done in moved {
                        self.release(done, Some(batch))?;
                    }
                    let err = concurrent(id, e);
                    warn!(diff = %id, error = %err, "batch assembly aborted");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// `merge_candidate -> verified` for `id`, if `claim` still holds it.
    /// Returns whether the diff moved.
    fn release(&self, id: &DiffId, claim: Option<&BatchId>) -> Result<bool, BusError> {
        let now = unix_now();
        let outcome = self.store.update::<Diff>(id.as_str(), |d| {
            if d.status != DiffStatus::MergeCandidate || d.merge_batch.as_ref() != claim {
                return Err(claim_mismatch(d, claim));
            }
            d.status = DiffStatus::Verified;
            d.merge_batch = None;
            d.updated_at = now;
            Ok(())
        });
        match outcome {
            Ok(_) => Ok(true),
            Err(StoreError::StaleStatus { .. } | StoreError::NotFound { .. }) => {
                debug!(diff = %id, "claim already released");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check that every constituent of a written batch is still claimed by
    /// it. Once part of the batch has merged the batch is committed, and a
    /// constituent released back to `verified` meanwhile is claimed again.
    fn secure(&self, batch: &MergeBatch) -> Result<(), BusError> {
        let committed = self.committed(batch)?;
        let now = unix_now();
        for id in &batch.diff_ids {
            self.store
                .update::<Diff>(id.as_str(), |d| {
                    let claimed = d.merge_batch.as_ref() == Some(&batch.id);
                    match d.status {
                        DiffStatus::MergeCandidate | DiffStatus::Merged if claimed => Ok(()),
                        DiffStatus::Verified if committed => {
                            d.status = DiffStatus::MergeCandidate;
                            d.merge_batch = Some(batch.id.clone());
                            d.updated_at = now;
                            Ok(())
                        }
                        _ => Err(claim_mismatch(d, Some(&batch.id))),
                    }
                })
                .map_err(|e| concurrent(id, e))?;
        }
        Ok(())
    }

    /// Whether any constituent has already merged under `batch`.
    fn committed(&self, batch: &MergeBatch) -> Result<bool, BusError> {
        for id in &batch.diff_ids {
            if let Some(d) = self.store.get::<Diff>(id.as_str())? {
                if d.status == DiffStatus::Merged && d.merge_batch.as_ref() == Some(&batch.id) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Drop a written batch that can no longer complete and release its
    /// claims. A batch with merged constituents is left in place. Returns
    /// how many diffs were released.
    fn retract(&self, batch: &MergeBatch) -> Result<usize, BusError> {
        if self.committed(batch)? {
            warn!(batch = %batch.id, "partially merged batch left in place");
            return Ok(0);
        }
        self.store.remove(Collection::Batches, batch.id.as_str())?;
        let mut released = 0;
        for id in &batch.diff_ids {
            if self.release(id, Some(&batch.id))? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Move a secured batch's constituents to `merged`, their packages to
    /// `done`, and retire their conflicts. Returns how many diffs moved.
    fn finalise(&self, batch: &MergeBatch) -> Result<usize, BusError> {
        let now = unix_now();
        let mut moved = 0;
        for id in &batch.diff_ids {
            let mut fresh = false;
            let diff = self
                .store
                .update::<Diff>(id.as_str(), |d| {
                    let claimed = d.merge_batch.as_ref() == Some(&batch.id);
                    match d.status {
                        DiffStatus::Merged if claimed => Ok(()),
                        DiffStatus::MergeCandidate if claimed => {
                            d.status = DiffStatus::Merged;
                            d.updated_at = now;
                            fresh = true;
                            Ok(())
                        }
                        _ => Err(claim_mismatch(d, Some(&batch.id))),
                    }
                })
                .map_err(|e| concurrent(id, e))?;
            if fresh {
                moved += 1;
            }
            mark_done(self.store, &diff.work_id)?;
        }
        ConflictDetector::new(self.store).mark_stale()?;
        Ok(moved)
    }
}

/// A stale-status error describing what holds `diff` instead of `claim`.
fn claim_mismatch(diff: &Diff, claim: Option<&BatchId>) -> StoreError {
    StoreError::StaleStatus {
        collection: Collection::Diffs,
        id: diff.id.to_string(),
        expected: held_by(DiffStatus::MergeCandidate, claim),
        actual: held_by(diff.status, diff.merge_batch.as_ref()),
    }
}

fn held_by(status: DiffStatus, claim: Option<&BatchId>) -> String {
    match claim {
        Some(batch) => format!("{status} for {batch}"),
        None => status.to_string(),
    }
}

/// Map a lost compare-and-set to [`BusError::ConcurrentMutation`].
fn concurrent(id: &DiffId, err: StoreError) -> BusError {
    match err {
        StoreError::StaleStatus { actual, .. } => BusError::ConcurrentMutation {
            id: id.to_string(),
            detail: format!("status changed to {actual} during batch assembly"),
        },
        other => other.into(),
    }
}

// ---------------------------------------------------------------------------
// Ordering and collisions
// ---------------------------------------------------------------------------

/// Topological order over dependency and resolution edges, lowest
/// submission sequence first among the ready. Returns the order and the
/// diffs left on a cycle.
fn order_candidates(
    candidates: &[Diff],
    work: &BTreeMap<WorkId, WorkPackage>,
    sequenced: &BTreeSet<(DiffId, DiffId)>,
) -> (Vec<DiffId>, Vec<DiffId>) {
    let seq: BTreeMap<&DiffId, u64> = candidates.iter().map(|d| (&d.id, d.seq)).collect();
    let seq_of = |id: &DiffId| seq.get(id).copied().unwrap_or(u64::MAX);
    let mut edges: BTreeSet<(&DiffId, &DiffId)> = BTreeSet::new();

    for later in candidates {
        let Some(package) = work.get(&later.work_id) else {
            continue;
        };
        for earlier in candidates {
            if earlier.id != later.id && package.depends_on.contains(&earlier.work_id) {
                edges.insert((&earlier.id, &later.id));
            }
        }
    }
    for (first, second) in sequenced {
        if seq.contains_key(first) && seq.contains_key(second) {
            edges.insert((first, second));
        }
    }

    let mut indegree: BTreeMap<&DiffId, usize> = seq.keys().map(|id| (*id, 0)).collect();
    for (_, to) in &edges {
        if let Some(n) = indegree.get_mut(to) {
            *n += 1;
        }
    }
    let mut ready: BTreeSet<(u64, &DiffId)> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| (seq_of(id), *id))
        .collect();
    let mut order = Vec::with_capacity(candidates.len());
    while let Some((_, id)) = ready.pop_first() {
        order.push(id.clone());
        for (_, to) in edges.iter().filter(|(from, _)| *from == id) {
            if let Some(n) = indegree.get_mut(to) {
                *n -= 1;
                if *n == 0 {
                    ready.insert((seq_of(to), *to));
                }
            }
        }
    }
    let placed: BTreeSet<&DiffId> = order.iter().collect();
    let mut cyclic: Vec<&Diff> = candidates.iter().filter(|d| !placed.contains(&d.id)).collect();
    cyclic.sort_by_key(|d| d.seq);
    let cyclic = cyclic.into_iter().map(|d| d.id.clone()).collect();
    (order, cyclic)
}

/// Why `diff` cannot merge yet: a dependency that is neither done nor
/// accepted earlier in this batch.
fn unmet_dependency(diff: &Diff, work: &BTreeMap<WorkId, WorkPackage>, accepted: &[&Diff]) -> Option<String> {
    let package = work.get(&diff.work_id)?;
    package
        .depends_on
        .iter()
        .find(|dep| {
            let done = work.get(*dep).is_some_and(|w| w.status == WorkStatus::Done);
            !done && !accepted.iter().any(|d| &d.work_id == *dep)
        })
        .map(|dep| format!("depends on {dep}, which has not merged"))
}

/// Why `diff` must wait for the other party of a sequential or requeue
/// decision: it is ordered second and the first has neither settled nor
/// been accepted into this batch.
fn unmet_sequence(
    diff: &Diff,
    sequenced: &BTreeSet<(DiffId, DiffId)>,
    settled: &BTreeSet<DiffId>,
    accepted: &[&Diff],
) -> Option<String> {
    sequenced
        .iter()
        .filter(|(_, second)| second == &diff.id)
        .map(|(first, _)| first)
        .find(|first| !settled.contains(*first) && !accepted.iter().any(|d| &d.id == *first))
        .map(|first| format!("waits for {first} to merge first"))
}

/// Why `diff` cannot join a batch already holding `other`. Applies to
/// sequenced pairs too: both patches are cut against the same base.
fn collision(diff: &Diff, other: &Diff) -> Option<String> {
    let mine = diff.all_files();
    let theirs = other.all_files();
    for path in mine.intersection(&theirs) {
        let kinds = (diff.change_kind(path), other.change_kind(path));
        match kinds {
            (Some(ChangeKind::Deleted), _) | (_, Some(ChangeKind::Deleted)) => {
                return Some(format!("{path} is deleted by {} or {}", diff.id, other.id));
            }
            (Some(ChangeKind::Added), Some(ChangeKind::Added)) => {
                return Some(format!("{path} is added by both {} and {}", diff.id, other.id));
            }
            _ => {}
        }
        let overlap = diff
            .ranges(path)
            .iter()
            .any(|r| other.ranges(path).iter().any(|o| r.overlaps(o)));
        if overlap {
            return Some(format!("{path} lines overlap with {}", other.id));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Batch construction
// ---------------------------------------------------------------------------

/// `batch-` plus the leading hex of `sha256(ids joined by newlines)`.
#[must_use]
pub fn batch_id_for(ids: &[DiffId]) -> BatchId {
    let joined: Vec<&str> = ids.iter().map(DiffId::as_str).collect();
    let digest = Sha256::digest(joined.join("\n").as_bytes());
    let mut hex = String::with_capacity(BATCH_HASH_LEN);
    for byte in digest.iter().take(BATCH_HASH_LEN / 2) {
        let _ = write!(hex, "{byte:02x}");
    }
    BatchId::from_hash(&hex)
}

fn assemble(diffs: &[Diff], now: u64) -> MergeBatch {
    let ids: Vec<DiffId> = diffs.iter().map(|d| d.id.clone()).collect();
    let mut changes = FileChangeSet::new();
    let mut combined_patch = String::new();
    for diff in diffs {
        for path in diff.all_files() {
            if let Some(kind) = diff.change_kind(path) {
                changes.record(path, kind, &diff.id);
            }
        }
        if let Some(patch) = &diff.patch {
            combined_patch.push_str(patch);
            if !patch.ends_with('\n') {
                combined_patch.push('\n');
            }
        }
    }
    MergeBatch {
        id: batch_id_for(&ids),
        message: commit_message(diffs, &changes),
        diff_ids: ids,
        changes,
        combined_patch,
        created_at: now,
    }
}

fn commit_message(diffs: &[Diff], changes: &FileChangeSet) -> String {
    let mut msg = match diffs {
        [only] => only.description.lines().next().unwrap_or_default().to_owned(),
        _ => format!("Merge {} changes", diffs.len()),
    };
    msg.push_str("\n\n");
    for diff in diffs {
        let _ = writeln!(
            msg,
            "- {} ({}, {}): {}",
            diff.id,
            diff.work_id,
            diff.instance_id,
            diff.description.lines().next().unwrap_or_default()
        );
    }
    let _ = write!(
        msg,
        "\nFiles: {} added, {} modified, {} deleted\n",
        changes.paths_with(ChangeKind::Added).len(),
        changes.paths_with(ChangeKind::Modified).len(),
        changes.paths_with(ChangeKind::Deleted).len()
    );
    msg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::model::diff::{CausalChain, LineRange, VerificationResult};
    use crate::model::types::InstanceId;
    use crate::store::MemoryStore;
    use crate::verify::{CheckError, CheckReport};

    struct Always(CheckStatus);

    impl CheckRunner for Always {
        fn run(&self, _: &[String]) -> Result<CheckReport, CheckError> {
            Ok(CheckReport {
                status: self.0,
                checks: Vec::new(),
                duration_ms: 0,
            })
        }
    }

    fn package(store: &MemoryStore, id: &str, deps: &[&str]) {
        let mut wp = WorkPackage::new(
            WorkId::new(id).unwrap(),
            id,
            deps.iter().map(|d| WorkId::new(d).unwrap()).collect(),
            0,
        );
        wp.status = WorkStatus::Dispatched;
        wp.assigned_to = Some(InstanceId::new("icarus-1").unwrap());
        store.put(&wp).unwrap();
    }

    fn verified(store: &MemoryStore, seq: u64, work: &str, file: &str, lines: (u32, u32)) -> DiffId {
        let id = DiffId::from_sequence(seq);
        let diff = Diff {
            id: id.clone(),
            seq,
            work_id: WorkId::new(work).unwrap(),
            instance_id: InstanceId::new("icarus-1").unwrap(),
            description: format!("change {seq}"),
            status: DiffStatus::Verified,
            files_added: BTreeSet::new(),
            files_modified: [file.to_owned()].into(),
            files_deleted: BTreeSet::new(),
            line_changes: [(file.to_owned(), vec![LineRange::new(lines.0, lines.1)])].into(),
            causal_chain: CausalChain {
                files: [file.to_owned()].into(),
                ..CausalChain::default()
            },
            patch: Some(format!("--- a/{file}\n+++ b/{file}\n")),
            verification: Some(VerificationResult {
                passed: true,
                scope: vec![file.to_owned()],
                checks: Vec::new(),
                duration_ms: 0,
                completed_at: 0,
            }),
            verification_attempts: 1,
            verifying_since: None,
            merge_batch: None,
            rejection: None,
            submitted_at: 0,
            updated_at: 0,
        };
        store.put(&diff).unwrap();
        id
    }

    #[test]
    fn dependency_order_beats_submission_order() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        package(&store, "wp-2", &["wp-1"]);
        let later_dep = verified(&store, 2, "wp-1", "a.py", (1, 2));
        let dependent = verified(&store, 1, "wp-2", "b.py", (1, 2));
        let runner = Always(CheckStatus::Passed);
        let plan = Coordinator::new(&store, &runner, false).plan().unwrap();
        assert_eq!(plan.accepted, vec![later_dep, dependent]);
    }

    #[test]
    fn dependency_outside_batch_defers() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        package(&store, "wp-2", &["wp-1"]);
        let dependent = verified(&store, 1, "wp-2", "b.py", (1, 2));
        let runner = Always(CheckStatus::Passed);
        let plan = Coordinator::new(&store, &runner, false).plan().unwrap();
        assert!(plan.accepted.is_empty());
        assert_eq!(plan.deferred[0].0, dependent);
    }

    #[test]
    fn overlapping_lines_collide() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        package(&store, "wp-2", &[]);
        let first = verified(&store, 1, "wp-1", "a.py", (1, 10));
        let second = verified(&store, 2, "wp-2", "a.py", (5, 6));
        let runner = Always(CheckStatus::Passed);
        let plan = Coordinator::new(&store, &runner, false).plan().unwrap();
        assert_eq!(plan.accepted, vec![first]);
        assert_eq!(plan.deferred[0].0, second);
    }

    #[test]
    fn merge_finalises_everything() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        package(&store, "wp-2", &[]);
        let a = verified(&store, 1, "wp-1", "a.py", (1, 2));
        let b = verified(&store, 2, "wp-2", "b.py", (1, 2));
        let runner = Always(CheckStatus::Passed);
        let batch = Coordinator::new(&store, &runner, true).merge().unwrap().unwrap();
        assert_eq!(batch.diff_ids, vec![a.clone(), b.clone()]);
        assert_eq!(batch.id, batch_id_for(&[a.clone(), b]));
        assert!(batch.combined_patch.contains("+++ b/a.py"));
        assert!(batch.message.starts_with("Merge 2 changes"));
        let d: Diff = store.require(a.as_str()).unwrap();
        assert_eq!(d.status, DiffStatus::Merged);
        let w: WorkPackage = store.require("wp-1").unwrap();
        assert_eq!(w.status, WorkStatus::Done);
    }

    #[test]
    fn failed_batch_verification_changes_nothing() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        let a = verified(&store, 1, "wp-1", "a.py", (1, 2));
        let runner = Always(CheckStatus::Failed);
        let err = Coordinator::new(&store, &runner, true).merge().unwrap_err();
        assert!(matches!(err, BusError::BatchVerificationFailed { .. }));
        let d: Diff = store.require(a.as_str()).unwrap();
        assert_eq!(d.status, DiffStatus::Verified);
        assert!(store.all::<MergeBatch>().unwrap().is_empty());
    }

    fn claim(store: &MemoryStore, id: &DiffId, batch: &str, at: u64) {
        store
            .transition::<Diff>(id.as_str(), DiffStatus::Verified, DiffStatus::MergeCandidate, |d| {
                d.merge_batch = Some(BatchId::from_hash(batch));
                d.updated_at = at;
            })
            .unwrap();
    }

    #[test]
    fn recover_rolls_back_orphan_candidates() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        let a = verified(&store, 1, "wp-1", "a.py", (1, 2));
        claim(&store, &a, "0badc0ffee00", 0);
        let runner = Always(CheckStatus::Passed);
        let coordinator = Coordinator::new(&store, &runner, false);
        assert_eq!(coordinator.recover().unwrap(), 1);
        let d: Diff = store.require(a.as_str()).unwrap();
        assert_eq!(d.status, DiffStatus::Verified);
        assert!(d.merge_batch.is_none());
    }

    #[test]
    fn fresh_candidates_are_left_to_their_owner() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        let a = verified(&store, 1, "wp-1", "a.py", (1, 2));
        claim(&store, &a, "0badc0ffee00", unix_now());
        let runner = Always(CheckStatus::Passed);

        assert_eq!(Coordinator::new(&store, &runner, false).recover().unwrap(), 0);
        assert_eq!(store.require::<Diff>(a.as_str()).unwrap().status, DiffStatus::MergeCandidate);

        // The lock holder does not wait.
        let leader = Coordinator::new(&store, &runner, false).exclusive(true);
        assert_eq!(leader.recover().unwrap(), 1);
        assert_eq!(store.require::<Diff>(a.as_str()).unwrap().status, DiffStatus::Verified);
    }

    #[test]
    fn released_constituent_retracts_the_written_batch() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        package(&store, "wp-2", &[]);
        let a = verified(&store, 1, "wp-1", "a.py", (1, 2));
        let b = verified(&store, 2, "wp-2", "b.py", (1, 2));
        let runner = Always(CheckStatus::Passed);
        let owner = Coordinator::new(&store, &runner, false);

        let diffs = vec![
            store.require::<Diff>(a.as_str()).unwrap(),
            store.require::<Diff>(b.as_str()).unwrap(),
        ];
        let batch = assemble(&diffs, 0);
        owner.promote(&batch.diff_ids, &batch.id).unwrap();
        // The leader rolls both back before the owner writes its batch.
        assert_eq!(Coordinator::new(&store, &runner, false).exclusive(true).recover().unwrap(), 2);
        store.insert(&batch).unwrap();

        let err = owner.secure(&batch).unwrap_err();
        assert!(matches!(err, BusError::ConcurrentMutation { .. }), "{err}");
        assert_eq!(owner.retract(&batch).unwrap(), 0);
        assert!(store.all::<MergeBatch>().unwrap().is_empty());

        // Same constituents, same batch id: the next pass is not wedged.
        let merged = owner.merge().unwrap().expect("batch");
        assert_eq!(merged.id, batch.id);
        for id in [&a, &b] {
            let d: Diff = store.require(id.as_str()).unwrap();
            assert_eq!(d.status, DiffStatus::Merged);
            assert_eq!(d.merge_batch.as_ref(), Some(&batch.id));
        }
    }

    #[test]
    fn partly_merged_batch_reclaims_released_constituent() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        package(&store, "wp-2", &[]);
        let a = verified(&store, 1, "wp-1", "a.py", (1, 2));
        let b = verified(&store, 2, "wp-2", "b.py", (1, 2));
        let runner = Always(CheckStatus::Passed);
        let coordinator = Coordinator::new(&store, &runner, false);

        let diffs = vec![
            store.require::<Diff>(a.as_str()).unwrap(),
            store.require::<Diff>(b.as_str()).unwrap(),
        ];
        let batch = assemble(&diffs, 0);
        coordinator.promote(&batch.diff_ids, &batch.id).unwrap();
        store.insert(&batch).unwrap();
        store
            .transition::<Diff>(a.as_str(), DiffStatus::MergeCandidate, DiffStatus::Merged, |_| {})
            .unwrap();
        assert!(coordinator.release(&b, Some(&batch.id)).unwrap());

        assert_eq!(coordinator.recover().unwrap(), 1);
        let d: Diff = store.require(b.as_str()).unwrap();
        assert_eq!(d.status, DiffStatus::Merged);
        assert_eq!(store.all::<MergeBatch>().unwrap().len(), 1);
        assert_eq!(store.require::<WorkPackage>("wp-2").unwrap().status, WorkStatus::Done);
    }

    #[test]
    fn finalise_refuses_a_batch_that_lost_its_claim() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        let a = verified(&store, 1, "wp-1", "a.py", (1, 2));
        let runner = Always(CheckStatus::Passed);
        let coordinator = Coordinator::new(&store, &runner, false);

        let batch = assemble(&[store.require::<Diff>(a.as_str()).unwrap()], 0);
        store.insert(&batch).unwrap();
        let err = coordinator.finalise(&batch).unwrap_err();
        assert!(matches!(err, BusError::ConcurrentMutation { .. }), "{err}");
        assert_eq!(store.require::<Diff>(a.as_str()).unwrap().status, DiffStatus::Verified);
    }

    #[test]
    fn structural_collisions_hold_for_sequenced_pairs() {
        let store = MemoryStore::new();
        package(&store, "wp-1", &[]);
        package(&store, "wp-2", &[]);
        let a = verified(&store, 1, "wp-1", "a.py", (1, 2));
        let b = verified(&store, 2, "wp-2", "a.py", (8, 9));
        let mut first: Diff = store.require(a.as_str()).unwrap();
        let mut second: Diff = store.require(b.as_str()).unwrap();
        for d in [&mut first, &mut second] {
            d.files_modified.clear();
            d.line_changes.clear();
            d.files_deleted.insert("legacy.py".to_owned());
        }
        let reason = collision(&second, &first).expect("double delete collides");
        assert!(reason.contains("legacy.py"), "{reason}");

        first.files_deleted.clear();
        second.files_deleted.clear();
        first.files_added.insert("new.py".to_owned());
        second.files_added.insert("new.py".to_owned());
        assert!(collision(&second, &first).unwrap().contains("added by both"));
    }

    #[test]
    fn batch_ids_are_stable_and_order_sensitive() {
        let a = DiffId::from_sequence(1);
        let b = DiffId::from_sequence(2);
        assert_eq!(batch_id_for(&[a.clone(), b.clone()]), batch_id_for(&[a.clone(), b.clone()]));
        assert_ne!(batch_id_for(&[a.clone(), b.clone()]), batch_id_for(&[b, a]));
        assert_eq!(batch_id_for(&[DiffId::from_sequence(3)]).as_str().len(), "batch-".len() + 12);
    }
}
