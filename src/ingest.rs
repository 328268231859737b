//! Diff ingestion: validate worker submissions and admit them as diffs.
//!
//! A [`Submission`] is what a worker hands over instead of committing. The
//! [`Ingestor`] validates it against the bus (the work package must be out
//! with this worker), assigns a fresh [`DiffId`] from the store's sequence,
//! and stores the diff as `pending`. A refused submission leaves no state
//! behind.
//!
//! Workers in other processes can drop submissions into the inbox
//! collection instead; the orchestration loop admits them at the start of
//! every pass and keeps refused items with their reason.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::BusError;
use crate::model::diff::{CausalChain, Diff, DiffStatus, LineRange};
use crate::model::types::{DiffId, InstanceId, SubmissionId, WorkId, unix_now};
use crate::model::work::{WorkPackage, WorkStatus};
use crate::store::{BusStore, Collection, Entity};

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// A worker's change, as submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Submission {
    /// The work package the change implements.
    pub work_id: WorkId,
    /// The worker that produced it.
    pub instance_id: InstanceId,
    /// What the change does.
    pub description: String,
    /// Files created.
    #[serde(default)]
    pub files_added: BTreeSet<String>,
    /// Files edited.
    #[serde(default)]
    pub files_modified: BTreeSet<String>,
    /// Files removed.
    #[serde(default)]
    pub files_deleted: BTreeSet<String>,
    /// Touched line ranges per file.
    #[serde(default)]
    pub line_changes: BTreeMap<String, Vec<LineRange>>,
    /// Causal chain captured before submission.
    #[serde(default)]
    pub causal_chain: CausalChain,
    /// Raw unified diff, if the worker has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl Submission {
    /// Derive file sets and line ranges from `git diff` output, keeping the
    /// patch text.
    ///
    /// Understands `diff --git` headers, `new file` / `deleted file` /
    /// `rename from` / `rename to` markers, `---` / `+++` headers (including
    /// `/dev/null`), and `@@ -a,b +c,d @@` hunk headers. Line ranges are
    /// taken from the new side of each hunk.
    ///
    /// # Errors
    /// [`BusError::InvalidDiff`] if the text names no files or has a
    /// malformed hunk header.
    pub fn from_unified_diff(
        work_id: WorkId,
        instance_id: InstanceId,
        description: impl Into<String>,
        patch: &str,
    ) -> Result<Self, BusError> {
        let parsed = parse_unified_diff(patch)?;
        Ok(Self {
            work_id,
            instance_id,
            description: description.into(),
            files_added: parsed.added,
            files_modified: parsed.modified,
            files_deleted: parsed.deleted,
            line_changes: parsed.ranges,
            causal_chain: CausalChain::default(),
            patch: Some(patch.to_owned()),
        })
    }

    /// Every path named by the submission.
    #[must_use]
    pub fn all_files(&self) -> BTreeSet<&str> {
        self.files_added
            .iter()
            .chain(&self.files_modified)
            .chain(&self.files_deleted)
            .map(String::as_str)
            .collect()
    }

    /// Check the submission on its own, without looking at the bus.
    ///
    /// # Errors
    /// [`BusError::InvalidDiff`] naming the first problem found.
    pub fn validate_shape(&self) -> Result<(), BusError> {
        if self.description.trim().is_empty() {
            return Err(invalid("description is empty"));
        }
        let sets = [
            ("added", &self.files_added),
            ("modified", &self.files_modified),
            ("deleted", &self.files_deleted),
        ];
        if sets.iter().all(|(_, s)| s.is_empty()) {
            return Err(invalid("diff touches no files"));
        }
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (kind, set) in sets {
            for path in set {
                check_path(path)?;
                if let Some(other) = seen.insert(path.as_str(), kind) {
                    return Err(invalid(format!(
                        "{path} is listed as both {other} and {kind}"
                    )));
                }
            }
        }
        if !self.files_modified.is_empty() && self.causal_chain.is_empty() {
            return Err(invalid(
                "causal chain is empty but the diff modifies existing files; capture it with the causal provider before submitting",
            ));
        }
        for (path, ranges) in &self.line_changes {
            if !seen.contains_key(path.as_str()) {
                return Err(invalid(format!(
                    "line ranges given for {path}, which the diff does not touch"
                )));
            }
            if let Some(bad) = ranges.iter().find(|r| !r.is_well_formed()) {
                return Err(invalid(format!(
                    "malformed line range {bad} in {path} (ranges are 1-based, start <= end)"
                )));
            }
        }
        for path in &self.causal_chain.files {
            check_path(path)?;
        }
        Ok(())
    }
}

fn in_flight(work: &WorkId, live: &Diff) -> BusError {
    invalid(format!(
        "work package {work} already has {} in flight ({}); wait for it to merge or be rejected",
        live.id, live.status
    ))
}

fn invalid(reason: impl Into<String>) -> BusError {
    BusError::InvalidDiff {
        reason: reason.into(),
    }
}

fn check_path(path: &str) -> Result<(), BusError> {
    if path.trim().is_empty() {
        return Err(invalid("empty file path"));
    }
    let p = Path::new(path);
    if p.is_absolute()
        || p
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
    {
        return Err(invalid(format!(
            "{path:?} must be relative to the project root"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unified diff parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ParsedPatch {
    added: BTreeSet<String>,
    modified: BTreeSet<String>,
    deleted: BTreeSet<String>,
    ranges: BTreeMap<String, Vec<LineRange>>,
}

#[derive(Debug, Default)]
struct FileHeader {
    old: Option<String>,
    new: Option<String>,
    created: bool,
    removed: bool,
    renamed_from: Option<String>,
    renamed_to: Option<String>,
}

impl FileHeader {
    fn target(&self) -> Option<&str> {
        self.renamed_to
            .as_deref()
            .or(self.new.as_deref())
            .or(self.old.as_deref())
    }

    fn flush(self, out: &mut ParsedPatch) {
        if let (Some(from), Some(to)) = (&self.renamed_from, &self.renamed_to) {
            out.deleted.insert(from.clone());
            out.added.insert(to.clone());
            return;
        }
        let Some(path) = self.target().map(str::to_owned) else {
            return;
        };
        if self.created {
            out.added.insert(path);
        } else if self.removed {
            out.ranges.remove(&path);
            out.deleted.insert(path);
        } else {
            out.modified.insert(path);
        }
    }
}

fn strip_side(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return None;
    }
    let path = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(path.to_owned())
}

/// A parsed `@@ -a,b +c,d @@` header: lines left on each side, plus the
/// touched range on the new side.
#[derive(Debug, Clone, Copy)]
struct Hunk {
    old_left: u32,
    new_left: u32,
    range: LineRange,
}

fn parse_hunk_header(line: &str) -> Result<Hunk, BusError> {
    let bad = || invalid(format!("malformed hunk header: {line}"));
    let side = |prefix: char| -> Result<(u32, u32), BusError> {
        let tok = line
            .split_whitespace()
            .skip(1)
            .find(|tok| tok.starts_with(prefix))
            .ok_or_else(bad)?;
        let spec = &tok[1..];
        let (start, count) = spec.split_once(',').unwrap_or((spec, "1"));
        Ok((
            start.parse().map_err(|_| bad())?,
            count.parse().map_err(|_| bad())?,
        ))
    };
    let (_, old_count) = side('-')?;
    let (new_start, new_count) = side('+')?;
    // A pure deletion hunk (`+c,0`) touches the boundary after line c.
    let start = new_start.max(1);
    let end = start.checked_add(new_count.saturating_sub(1)).ok_or_else(|| {
        invalid(format!("hunk header runs past the last representable line: {line}"))
    })?;
    Ok(Hunk {
        old_left: old_count,
        new_left: new_count,
        range: LineRange::new(start, end),
    })
}

fn parse_unified_diff(patch: &str) -> Result<ParsedPatch, BusError> {
    let mut out = ParsedPatch::default();
    let mut current: Option<FileHeader> = None;
    let mut hunk: Option<Hunk> = None;

    for line in patch.lines() {
        // Hunk bodies are consumed by line count so that content such as
        // `--- x` inside a hunk is never mistaken for a header.
        if let Some(h) = hunk.as_mut() {
            let consumed = match line.chars().next() {
                Some(' ') | None => {
                    h.old_left = h.old_left.saturating_sub(1);
                    h.new_left = h.new_left.saturating_sub(1);
                    true
                }
                Some('-') => {
                    h.old_left = h.old_left.saturating_sub(1);
                    true
                }
                Some('+') => {
                    h.new_left = h.new_left.saturating_sub(1);
                    true
                }
                Some('\\') => true,
                Some(_) => false,
            };
            if h.old_left == 0 && h.new_left == 0 {
                hunk = None;
            }
            if consumed {
                continue;
            }
            hunk = None;
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                done.flush(&mut out);
            }
            let mut header = FileHeader::default();
            if let Some((a, b)) = rest.split_once(" b/") {
                header.old = strip_side(a);
                header.new = Some(b.trim().to_owned());
            }
            current = Some(header);
        } else if line.starts_with("new file mode") {
            current.get_or_insert_with(FileHeader::default).created = true;
        } else if line.starts_with("deleted file mode") {
            current.get_or_insert_with(FileHeader::default).removed = true;
        } else if let Some(from) = line.strip_prefix("rename from ") {
            current.get_or_insert_with(FileHeader::default).renamed_from = Some(from.to_owned());
        } else if let Some(to) = line.strip_prefix("rename to ") {
            current.get_or_insert_with(FileHeader::default).renamed_to = Some(to.to_owned());
        } else if let Some(old) = line.strip_prefix("--- ") {
            // A bare unified diff (no `diff --git`) starts a file here.
            let continues = current
                .as_ref()
                .is_some_and(|h| h.old.is_some() || h.new.is_some() || h.created || h.removed)
                && !out_has_hunks_for(&out, current.as_ref());
            if !continues
                && let Some(done) = current.take()
            {
                done.flush(&mut out);
            }
            let header = current.get_or_insert_with(FileHeader::default);
            match strip_side(old) {
                Some(path) => header.old = Some(path),
                None => header.created = true,
            }
        } else if let Some(new) = line.strip_prefix("+++ ") {
            let header = current.get_or_insert_with(FileHeader::default);
            match strip_side(new) {
                Some(path) => header.new = Some(path),
                None => {
                    header.removed = true;
                    header.new = None;
                }
            }
        } else if line.starts_with("@@") {
            let parsed = parse_hunk_header(line)?;
            let Some(header) = current.as_ref() else {
                return Err(invalid("hunk header before any file header"));
            };
            if parsed.old_left > 0 || parsed.new_left > 0 {
                hunk = Some(parsed);
            }
            if header.removed {
                continue;
            }
            if let Some(path) = header.target() {
                out.ranges
                    .entry(path.to_owned())
                    .or_default()
                    .push(parsed.range);
            }
        }
    }
    if let Some(done) = current.take() {
        done.flush(&mut out);
    }

    if out.added.is_empty() && out.modified.is_empty() && out.deleted.is_empty() {
        return Err(invalid("patch names no files"));
    }
    Ok(out)
}

/// Whether the open file header already had hunks, meaning a following
/// `---` line starts the next file of a bare unified diff.
fn out_has_hunks_for(out: &ParsedPatch, header: Option<&FileHeader>) -> bool {
    header
        .and_then(FileHeader::target)
        .is_some_and(|path| out.ranges.contains_key(path))
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// A submission waiting in the bus inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxItem {
    /// Inbox key.
    pub id: SubmissionId,
    /// The submission itself.
    pub submission: Submission,
    /// Unix timestamp (seconds) it was dropped in.
    pub received_at: u64,
    /// Why admission refused it, once it has been tried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
}

impl Entity for InboxItem {
    const COLLECTION: Collection = Collection::Inbox;

    fn key(&self) -> &str {
        self.id.as_str()
    }
}

/// Result of one inbox sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InboxReport {
    /// Items turned into diffs.
    pub admitted: Vec<(SubmissionId, DiffId)>,
    /// Items refused, with the reason.
    pub refused: Vec<(SubmissionId, String)>,
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

/// Admits submissions as `pending` diffs.
pub struct Ingestor<'a, S> {
    store: &'a S,
}

impl<'a, S: BusStore> Ingestor<'a, S> {
    /// Ingestor over `store`.
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Validate and admit a submission.
    ///
    /// # Errors
    /// [`BusError::InvalidDiff`] or [`BusError::UnknownWorkPackage`] when
    /// refused (nothing is stored), or store failures.
    pub fn submit(&self, submission: Submission) -> Result<DiffId, BusError> {
        submission.validate_shape()?;
        self.check_work_package(&submission)?;

        let seq = self.store.next_sequence(Collection::Diffs.name())?;
        let now = unix_now();
        let mut diff = Diff {
            id: DiffId::from_sequence(seq),
            seq,
            work_id: submission.work_id,
            instance_id: submission.instance_id,
            description: submission.description,
            status: DiffStatus::Submitted,
            files_added: submission.files_added,
            files_modified: submission.files_modified,
            files_deleted: submission.files_deleted,
            line_changes: submission.line_changes,
            causal_chain: submission.causal_chain,
            patch: submission.patch,
            verification: None,
            verification_attempts: 0,
            verifying_since: None,
            merge_batch: None,
            rejection: None,
            submitted_at: now,
            updated_at: now,
        };
        debug_assert!(diff.status.can_transition_to(DiffStatus::Pending));
        diff.status = DiffStatus::Pending;
        self.store.insert(&diff)?;
        // Two admissions for one package can race past the check above; the
        // lower sequence keeps its place.
        if let Some(rival) = self.live_diff(&diff.work_id, Some(diff.seq))? {
            self.store.remove(Collection::Diffs, diff.id.as_str())?;
            return Err(in_flight(&diff.work_id, &rival));
        }
        info!(diff = %diff.id, work = %diff.work_id, worker = %diff.instance_id, files = diff.all_files().len(), "diff admitted");
        Ok(diff.id)
    }

    fn check_work_package(&self, submission: &Submission) -> Result<WorkPackage, BusError> {
        let work: WorkPackage = self
            .store
            .get(submission.work_id.as_str())?
            .ok_or_else(|| BusError::UnknownWorkPackage {
                id: submission.work_id.clone(),
            })?;
        if work.status != WorkStatus::Dispatched {
            return Err(invalid(format!(
                "work package {} is {}, not dispatched",
                work.id, work.status
            )));
        }
        if let Some(assignee) = &work.assigned_to
            && assignee != &submission.instance_id
        {
            return Err(invalid(format!(
                "work package {} is assigned to {assignee}, not {}",
                work.id, submission.instance_id
            )));
        }
        if let Some(live) = self.live_diff(&work.id, None)? {
            return Err(in_flight(&work.id, &live));
        }
        Ok(work)
    }

    /// A non-terminal diff of `work`, lowest sequence first, optionally
    /// only among those admitted before `before`.
    fn live_diff(&self, work: &WorkId, before: Option<u64>) -> Result<Option<Diff>, BusError> {
        let mut live = self.store.list(|d: &Diff| {
            &d.work_id == work && !d.status.is_terminal() && before.is_none_or(|seq| d.seq < seq)
        })?;
        live.sort_by_key(|d| d.seq);
        Ok(live.into_iter().next())
    }

    /// Drop a submission into the inbox for the next pass to admit.
    ///
    /// Only the shape is checked here; bus-dependent checks happen at
    /// admission.
    ///
    /// # Errors
    /// [`BusError::InvalidDiff`] for a malformed submission, or store
    /// failures.
    pub fn enqueue(&self, submission: Submission) -> Result<SubmissionId, BusError> {
        submission.validate_shape()?;
        let seq = self.store.next_sequence(Collection::Inbox.name())?;
        let item = InboxItem {
            id: SubmissionId::from_sequence(seq),
            submission,
            received_at: unix_now(),
            refusal: None,
        };
        self.store.insert(&item)?;
        debug!(item = %item.id, "submission queued in inbox");
        Ok(item.id)
    }

    /// Admit every untried inbox item, oldest first.
    ///
    /// Admitted items are removed; refused items stay with the reason.
    /// Store failures leave the item untouched for the next sweep.
    ///
    /// # Errors
    /// Store failures while listing the inbox.
    pub fn admit_inbox(&self) -> Result<InboxReport, BusError> {
        let mut report = InboxReport::default();
        let pending = self.store.list(|item: &InboxItem| item.refusal.is_none())?;
        for item in pending {
            match self.submit(item.submission.clone()) {
                Ok(diff_id) => {
                    self.store.remove(Collection::Inbox, item.id.as_str())?;
                    report.admitted.push((item.id, diff_id));
                }
                Err(err @ (BusError::InvalidDiff { .. } | BusError::UnknownWorkPackage { .. })) => {
                    let reason = err.to_string();
                    warn!(item = %item.id, %reason, "inbox submission refused");
                    self.store.update::<InboxItem>(item.id.as_str(), |stored| {
                        stored.refusal = Some(reason.clone());
                        Ok(())
                    })?;
                    report.refused.push((item.id, reason));
                }
                Err(err) => {
                    warn!(item = %item.id, error = %err, "inbox admission failed; will retry");
                }
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
