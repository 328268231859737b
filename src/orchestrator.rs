//! The orchestration loop.
//!
//! The orchestrator is the only component that advances diffs across stage
//! boundaries. One pass runs, in order:
//!
//! 1. admit inbox submissions
//! 2. mark stale conflicts
//! 3. detect new conflicts
//! 4. apply the conflict policy and any recorded resolutions
//! 5. reconcile expired verification claims
//! 6. verify pending diffs
//! 7. assemble a merge batch
//! 8. hand batches to the commit step (with `merge.auto_commit`)
//!
//! Daemon mode repeats passes on a fixed interval. A bus-level leader marker
//! (`orchestrator.lock`) keeps a second orchestrator off the same bus. An
//! orchestrator holding the marker refreshes it from a side thread while a
//! pass runs, so long verification never lets it go stale.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::commit::{self, CommitDirectory, CommitStep};
use crate::config::AriadneConfig;
use crate::conflict::{ConflictDetector, ConflictPolicy, DefaultPolicy};
use crate::coordinator::Coordinator;
use crate::error::BusError;
use crate::ingest::{InboxItem, InboxReport, Ingestor, Submission};
use crate::model::batch::{CommitRecord, MergeBatch};
use crate::model::conflict::{Conflict, Resolution};
use crate::model::diff::{Diff, DiffStatus};
use crate::model::types::{BatchId, ConflictId, DiffId, unix_now};
use crate::model::work::{WorkPackage, WorkStatus};
use crate::store::BusStore;
use crate::store::fs::write_atomic;
use crate::verify::{CheckRunner, ShellCheckRunner, Verifier, VerifyReport};

/// Leader marker file name under the bus root.
pub const LEADER_LOCK_FILE: &str = "orchestrator.lock";

/// Granularity of the daemon's interruptible sleep.
const STOP_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Inbox admissions and refusals.
    pub inbox: InboxReport,
    /// Conflicts marked stale.
    pub stale_conflicts: usize,
    /// Conflicts newly recorded.
    pub detected: Vec<ConflictId>,
    /// Conflicts the policy resolved.
    pub auto_resolved: Vec<ConflictId>,
    /// Resolutions whose side effects completed.
    pub resolutions_applied: usize,
    /// Diffs whose expired claims were reverted.
    pub reconciled: Vec<DiffId>,
    /// Verification outcomes.
    pub verification: VerifyReport,
    /// The batch produced, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchId>,
    /// Why batch assembly was abandoned, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_error: Option<String>,
    /// Batches handed to the commit step.
    pub released: Vec<BatchId>,
}

impl PassReport {
    /// Returns `true` if the pass changed nothing.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inbox.admitted.is_empty()
            && self.inbox.refused.is_empty()
            && self.stale_conflicts == 0
            && self.detected.is_empty()
            && self.auto_resolved.is_empty()
            && self.resolutions_applied == 0
            && self.reconciled.is_empty()
            && self.verification.settled() == 0
            && self.batch.is_none()
            && self.released.is_empty()
    }
}

/// Flat counts over the bus.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Diffs per status (every status listed, zeros included).
    pub diffs: BTreeMap<String, usize>,
    /// Work packages per status.
    pub work: BTreeMap<String, usize>,
    /// Conflict records, stale ones included.
    pub conflicts_total: usize,
    /// Conflicts still blocking their diffs.
    pub conflicts_unresolved: usize,
    /// Merge batches produced.
    pub batches: usize,
    /// Batches not yet handed to the commit step.
    pub commits_ready: usize,
    /// Inbox submissions not yet admitted or refused.
    pub inbox_waiting: usize,
}

/// Totals for a daemon run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DaemonSummary {
    /// Passes completed.
    pub passes: u64,
    /// Batches produced.
    pub batches: u64,
    /// Passes that failed.
    pub errors: u64,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives the stages over one bus.
pub struct Orchestrator<S> {
    store: S,
    config: AriadneConfig,
    runner: Box<dyn CheckRunner>,
    policy: Box<dyn ConflictPolicy>,
    commit_step: Box<dyn CommitStep>,
    leader: Option<LeaderLock>,
}

impl<S: BusStore> Orchestrator<S> {
    /// Orchestrator with the stock runner, policy and commit step.
    ///
    /// # Errors
    /// [`BusError::Check`] if the verification config is malformed.
    pub fn new(store: S, config: AriadneConfig) -> Result<Self, BusError> {
        let runner = ShellCheckRunner::from_config(&config.verification)?;
        let policy = DefaultPolicy::new(config.merge.auto_resolve.clone());
        let handoff = config
            .merge
            .handoff_dir
            .clone()
            .unwrap_or_else(|| config.bus.root.join("handoff"));
        Ok(Self {
            store,
            runner: Box::new(runner),
            policy: Box::new(policy),
            commit_step: Box::new(CommitDirectory::new(handoff)),
            config,
            leader: None,
        })
    }

    /// Replace the check runner.
    #[must_use]
    pub fn with_runner(mut self, runner: impl CheckRunner + 'static) -> Self {
        self.runner = Box::new(runner);
        self
    }

    /// Replace the conflict policy.
    #[must_use]
    pub fn with_policy(mut self, policy: impl ConflictPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Replace the commit step.
    #[must_use]
    pub fn with_commit_step(mut self, step: impl CommitStep + 'static) -> Self {
        self.commit_step = Box::new(step);
        self
    }

    /// Run every pass as the holder of `lock`. The marker is refreshed
    /// before each pass and every third of `daemon.leader_stale_seconds`
    /// while one runs, and merge recovery may roll back unbatched
    /// candidates without waiting.
    #[must_use]
    pub fn with_leader(mut self, lock: LeaderLock) -> Self {
        self.leader = Some(lock);
        self
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The active configuration.
    pub const fn config(&self) -> &AriadneConfig {
        &self.config
    }

    fn verifier(&self) -> Verifier<'_, S> {
        Verifier::new(&self.store, self.runner.as_ref(), &self.config.verification)
    }

    // -----------------------------------------------------------------------
    // External operations
    // -----------------------------------------------------------------------

    /// Admit one submission directly.
    ///
    /// # Errors
    /// `InvalidDiff`, `UnknownWorkPackage`, or store failures.
    pub fn submit(&self, submission: Submission) -> Result<DiffId, BusError> {
        Ingestor::new(&self.store).submit(submission)
    }

    /// Record a conflict decision.
    ///
    /// # Errors
    /// `NotFound`, `InvalidResolution`, or store failures.
    pub fn resolve(
        &self,
        conflict: &ConflictId,
        resolution: Resolution,
        note: impl Into<String>,
    ) -> Result<Conflict, BusError> {
        ConflictDetector::new(&self.store).resolve(conflict, resolution, note)
    }

    /// Hand every unreleased batch to the commit step.
    ///
    /// # Errors
    /// The first step or store failure.
    pub fn release(&self) -> Result<Vec<CommitRecord>, BusError> {
        commit::release_all(&self.store, self.commit_step.as_ref())
    }

    /// Revert expired verification claims now.
    ///
    /// # Errors
    /// Store failures.
    pub fn reconcile(&self) -> Result<Vec<DiffId>, BusError> {
        self.verifier().reconcile(unix_now())
    }

    /// Delete every record on the bus. Sequence counters survive, so ids
    /// are never reused.
    ///
    /// # Errors
    /// Store failures.
    pub fn reset(&self) -> Result<(), BusError> {
        self.store.clear()?;
        warn!("bus reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    /// Run one pass.
    ///
    /// # Errors
    /// Store failures, or a lost leader marker. A failed batch verification
    /// or a concurrent mutation during assembly is reported in
    /// [`PassReport::batch_error`] instead.
    pub fn process_once(&self) -> Result<PassReport, BusError> {
        let Some(lock) = &self.leader else {
            return self.pass(&Mutex::new(None));
        };
        lock.heartbeat()?;
        let every = heartbeat_interval(self.config.daemon.leader_stale_seconds);
        let done = AtomicBool::new(false);
        let lost = Mutex::new(None);
        thread::scope(|scope| {
            scope.spawn(|| keep_alive(lock, every, &done, &lost));
            let result = self.pass(&lost);
            done.store(true, Ordering::Relaxed);
            result
        })
    }

    fn pass(&self, lost: &Mutex<Option<BusError>>) -> Result<PassReport, BusError> {
        let started = Instant::now();
        let detector = ConflictDetector::new(&self.store);
        let verifier = self.verifier();
        let mut report = PassReport {
            inbox: Ingestor::new(&self.store).admit_inbox()?,
            stale_conflicts: detector.mark_stale()?,
            ..PassReport::default()
        };
        report.detected = detector.detect()?.into_iter().map(|c| c.id).collect();
        report.auto_resolved = detector.apply_policy(self.policy.as_ref())?;
        report.resolutions_applied = detector.apply_resolutions()?;
        report.reconciled = verifier.reconcile(unix_now())?;
        report.verification = verifier.verify_pending()?;
        // Losers that just verified can be rejected now.
        report.resolutions_applied += detector.apply_resolutions()?;

        if let Some(e) = lost.lock().ok().and_then(|mut slot| slot.take()) {
            error!(error = %e, "leader marker lost; skipping batch assembly");
            return Err(e);
        }
        let coordinator = Coordinator::new(&self.store, self.runner.as_ref(), self.config.merge.verify_batch)
            .exclusive(self.leader.is_some());
        match coordinator.merge() {
            Ok(batch) => report.batch = batch.map(|b| b.id),
            Err(e @ (BusError::BatchVerificationFailed { .. } | BusError::ConcurrentMutation { .. })) => {
                warn!(error = %e, "batch abandoned");
                report.batch_error = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        if self.config.merge.auto_commit {
            report.released = self.release()?.into_iter().map(|r| r.batch_id).collect();
        }

        if report.is_idle() {
            debug!("pass idle");
        } else {
            info!(
                admitted = report.inbox.admitted.len(),
                detected = report.detected.len(),
                verified = report.verification.verified.len(),
                rejected = report.verification.rejected.len(),
                batch = ?report.batch.as_ref().map(BatchId::as_str),
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "pass complete"
            );
        }
        Ok(report)
    }

    /// Repeat passes every `daemon.interval_seconds` until `stop` is set,
    /// or until `daemon.max_idle_cycles` consecutive passes did nothing.
    ///
    /// # Errors
    /// [`BusError::LeaderLockHeld`] (or the marker's removal) if another
    /// orchestrator took the bus over. Other pass failures are logged and
    /// the loop continues.
    pub fn run_daemon(&self, stop: &AtomicBool) -> Result<DaemonSummary, BusError> {
        let interval = self.config.daemon.interval();
        let max_idle = self.config.daemon.max_idle_cycles;
        let mut summary = DaemonSummary::default();
        let mut idle_streak = 0u32;
        info!(interval_s = interval.as_secs(), leader = self.leader.is_some(), "daemon started");

        while !stop.load(Ordering::Relaxed) {
            match self.process_once() {
                Ok(report) => {
                    summary.passes += 1;
                    if report.batch.is_some() {
                        summary.batches += 1;
                    }
                    if report.is_idle() {
                        idle_streak += 1;
                    } else {
                        idle_streak = 0;
                    }
                }
                Err(e) if self.leader.is_some() && lost_leadership(&e) => return Err(e),
                Err(e) => {
                    summary.errors += 1;
                    error!(error = %e, "pass failed");
                }
            }
            if max_idle > 0 && idle_streak >= max_idle {
                info!(idle_streak, "daemon idle; stopping");
                break;
            }
            sleep_unless_stopped(interval, stop);
        }
        info!(passes = summary.passes, batches = summary.batches, "daemon stopped");
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Counts per stage.
    ///
    /// # Errors
    /// Store failures.
    pub fn status(&self) -> Result<StatusSnapshot, BusError> {
        let mut snapshot = StatusSnapshot::default();
        for status in DiffStatus::ALL {
            snapshot.diffs.insert(status.to_string(), 0);
        }
        for diff in self.store.all::<Diff>()? {
            *snapshot.diffs.entry(diff.status.to_string()).or_default() += 1;
        }
        for status in [WorkStatus::Ready, WorkStatus::Dispatched, WorkStatus::Done] {
            snapshot.work.insert(status.to_string(), 0);
        }
        for work in self.store.all::<WorkPackage>()? {
            *snapshot.work.entry(work.status.to_string()).or_default() += 1;
        }
        let conflicts = self.store.all::<Conflict>()?;
        snapshot.conflicts_total = conflicts.len();
        snapshot.conflicts_unresolved = conflicts.iter().filter(|c| c.is_unresolved()).count();
        snapshot.batches = self.store.all::<MergeBatch>()?.len();
        snapshot.commits_ready = commit::unreleased(&self.store)?.len();
        snapshot.inbox_waiting = self
            .store
            .list(|i: &InboxItem| i.refusal.is_none())?
            .len();
        Ok(snapshot)
    }

    /// Cross-record invariants the stages are meant to keep. Returns one
    /// line per violation; empty means healthy.
    ///
    /// - Diffs holding files (`verifying`, `verified`, `merge_candidate`)
    ///   that share a path are covered by a live conflict record.
    /// - Every merged diff appears in exactly one batch.
    /// - No work package is `done` while one of its dependencies is not.
    ///
    /// # Errors
    /// Store failures.
    pub fn check_invariants(&self) -> Result<Vec<String>, BusError> {
        let mut violations = Vec::new();
        let diffs = self.store.all::<Diff>()?;
        let conflicts = self.store.list(|c: &Conflict| !c.stale)?;

        let holding: Vec<&Diff> = diffs.iter().filter(|d| d.status.claims_files()).collect();
        for (i, a) in holding.iter().enumerate() {
            for b in &holding[i + 1..] {
                let shared: Vec<&str> = a.all_files().intersection(&b.all_files()).copied().collect();
                if shared.is_empty() {
                    continue;
                }
                let covered = conflicts.iter().any(|c| c.involves(&a.id) && c.involves(&b.id));
                if !covered {
                    violations.push(format!(
                        "{} and {} both hold {} with no conflict record",
                        a.id,
                        b.id,
                        shared.join(", ")
                    ));
                }
            }
        }

        let batches = self.store.all::<MergeBatch>()?;
        for diff in diffs.iter().filter(|d| d.status == DiffStatus::Merged) {
            let count = batches.iter().filter(|b| b.diff_ids.contains(&diff.id)).count();
            if count != 1 {
                violations.push(format!("{} is merged but appears in {count} batches", diff.id));
            }
        }

        let work: BTreeMap<_, _> = self
            .store
            .all::<WorkPackage>()?
            .into_iter()
            .map(|w| (w.id.clone(), w))
            .collect();
        for package in work.values().filter(|w| w.status == WorkStatus::Done) {
            for dep in &package.depends_on {
                if work.get(dep).is_some_and(|d| d.status != WorkStatus::Done) {
                    violations.push(format!("{} is done before its dependency {dep}", package.id));
                }
            }
        }
        Ok(violations)
    }
}

/// A third of the stale window, at least one second.
fn heartbeat_interval(stale_seconds: u64) -> Duration {
    Duration::from_secs((stale_seconds / 3).max(1))
}

/// Refresh `lock` every `every` until `done`. The first failure is parked
/// in `lost` for the pass to pick up.
fn keep_alive(lock: &LeaderLock, every: Duration, done: &AtomicBool, lost: &Mutex<Option<BusError>>) {
    loop {
        sleep_unless_stopped(every, done);
        if done.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = lock.heartbeat() {
            warn!(error = %e, "leader heartbeat failed");
            if let Ok(mut slot) = lost.lock() {
                *slot = Some(e);
            }
            return;
        }
    }
}

fn lost_leadership(e: &BusError) -> bool {
    match e {
        BusError::LeaderLockHeld { .. } => true,
        BusError::ConcurrentMutation { id, .. } => id == LEADER_LOCK_FILE,
        _ => false,
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

// ---------------------------------------------------------------------------
// Leader marker
// ---------------------------------------------------------------------------

/// Contents of `orchestrator.lock`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    /// Holder's process id.
    pub pid: u32,
    /// Distinguishes holders within one process.
    pub token: String,
    /// Unix timestamp (seconds) of acquisition.
    pub acquired_at: u64,
    /// Unix timestamp (seconds) of the last heartbeat.
    pub heartbeat_at: u64,
}

/// Exclusive orchestrator marker for one bus. Removed on drop.
#[derive(Debug)]
pub struct LeaderLock {
    path: PathBuf,
    token: String,
}

impl LeaderLock {
    /// Take the marker under `bus_root`. A marker whose heartbeat is older
    /// than `stale_seconds` (or that cannot be read) is taken over.
    ///
    /// # Errors
    /// [`BusError::LeaderLockHeld`] if a live orchestrator holds it, or
    /// I/O failures.
    pub fn acquire(bus_root: &Path, stale_seconds: u64) -> Result<Self, BusError> {
        let path = bus_root.join(LEADER_LOCK_FILE);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let token = format!("{}-{nanos}", std::process::id());
        let now = unix_now();
        let record = LeaderRecord {
            pid: std::process::id(),
            token: token.clone(),
            acquired_at: now,
            heartbeat_at: now,
        };
        let json = encode_record(&record)?;

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                info!(pid = record.pid, "leader marker acquired");
                return Ok(Self { path, token });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(held) = read_record(&path)? {
            let age = now.saturating_sub(held.heartbeat_at);
            if age < stale_seconds {
                return Err(BusError::LeaderLockHeld {
                    pid: held.pid,
                    heartbeat_age: age,
                });
            }
            warn!(pid = held.pid, age_s = age, "taking over stale leader marker");
        } else {
            warn!("taking over unreadable leader marker");
        }
        write_atomic(&path, &json)?;
        // Two takeovers can race; the last write wins and the loser sees it.
        match read_record(&path)? {
            Some(current) if current.token == token => Ok(Self { path, token }),
            Some(current) => Err(BusError::LeaderLockHeld {
                pid: current.pid,
                heartbeat_age: 0,
            }),
            None => Err(BusError::ConcurrentMutation {
                id: LEADER_LOCK_FILE.to_owned(),
                detail: "leader marker vanished during takeover".to_owned(),
            }),
        }
    }

    /// Refresh the heartbeat.
    ///
    /// # Errors
    /// [`BusError::LeaderLockHeld`] if another orchestrator took the marker
    /// over, or I/O failures.
    pub fn heartbeat(&self) -> Result<(), BusError> {
        let Some(mut record) = read_record(&self.path)? else {
            return Err(BusError::ConcurrentMutation {
                id: LEADER_LOCK_FILE.to_owned(),
                detail: "leader marker was removed".to_owned(),
            });
        };
        if record.token != self.token {
            return Err(BusError::LeaderLockHeld {
                pid: record.pid,
                heartbeat_age: unix_now().saturating_sub(record.heartbeat_at),
            });
        }
        record.heartbeat_at = unix_now();
        write_atomic(&self.path, &encode_record(&record)?)?;
        Ok(())
    }

    /// The marker path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        if let Ok(Some(record)) = read_record(&self.path)
            && record.token == self.token
            && let Err(e) = fs::remove_file(&self.path)
        {
            warn!(error = %e, "failed to remove leader marker");
        }
    }
}

fn encode_record(record: &LeaderRecord) -> Result<String, BusError> {
    serde_json::to_string_pretty(record).map_err(|e| BusError::Serialize {
        detail: e.to_string(),
    })
}

/// `None` if the marker is missing or unreadable.
fn read_record(path: &Path) -> Result<Option<LeaderRecord>, BusError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
