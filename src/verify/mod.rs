//! Scoped verification.
//!
//! The verifier claims `pending` diffs by compare-and-set, runs the checks
//! over the diff's scope (its own files plus the recorded causal chain) and
//! settles the claim:
//!
//! - pass: `verifying -> verified` with the result attached
//! - fail: `verifying -> rejected`, work package back to `ready`
//! - timeout or runner failure: `verifying -> pending` with the attempt
//!   counter bumped, or `rejected` once `max_attempts` is reached
//!
//! A claim carries its `verifying_since` timestamp. Settling re-checks both
//! the status and that timestamp, so a claim that reconciliation already
//! reverted (and someone else re-claimed) is never settled by the stale
//! holder.

pub mod runner;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::VerificationConfig;
use crate::dispatch::return_to_ready;
use crate::error::BusError;
use crate::model::diff::{Diff, DiffStatus, Rejection, RejectionReason, VerificationResult};
use crate::model::types::{DiffId, unix_now};
use crate::store::{BusStore, Collection, StoreError};

pub use runner::{CheckError, CheckReport, CheckRunner, CheckStatus, ShellCheckRunner};

/// What happened to one diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Checks passed.
    Verified,
    /// A check failed.
    Rejected {
        /// Failure summary.
        detail: String,
    },
    /// Timed out or the runner failed; back to `pending`.
    Retry {
        /// Attempts used so far.
        attempts: u32,
    },
    /// Out of attempts; rejected with `VerificationTimeout`.
    GaveUp {
        /// Attempts used.
        attempts: u32,
    },
    /// Someone else holds or already settled the claim.
    Skipped,
}

/// Summary of a verification sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Diffs now `verified`.
    pub verified: Vec<DiffId>,
    /// Diffs rejected by a failing check or the retry cap.
    pub rejected: Vec<DiffId>,
    /// Diffs returned to `pending` for another attempt.
    pub retried: Vec<DiffId>,
    /// Diffs another verifier claimed first.
    pub skipped: Vec<DiffId>,
}

impl VerifyReport {
    fn record(&mut self, id: DiffId, outcome: &VerifyOutcome) {
        match outcome {
            VerifyOutcome::Verified => self.verified.push(id),
            VerifyOutcome::Rejected { .. } | VerifyOutcome::GaveUp { .. } => self.rejected.push(id),
            VerifyOutcome::Retry { .. } => self.retried.push(id),
            VerifyOutcome::Skipped => self.skipped.push(id),
        }
    }

    /// Number of diffs that changed status.
    #[must_use]
    pub fn settled(&self) -> usize {
        self.verified.len() + self.rejected.len() + self.retried.len()
    }
}

/// The files checks run over: the diff's own files plus its causal chain.
#[must_use]
pub fn scope_for(diff: &Diff) -> Vec<String> {
    let mut scope: BTreeSet<&str> = diff.all_files();
    scope.extend(diff.causal_chain.files.iter().map(String::as_str));
    scope.into_iter().map(str::to_owned).collect()
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Verification stage.
pub struct Verifier<'a, S> {
    store: &'a S,
    runner: &'a dyn CheckRunner,
    max_attempts: u32,
    max_parallel: usize,
    lease_seconds: u64,
}

impl<'a, S: BusStore> Verifier<'a, S> {
    /// Verifier over `store` using `runner`, limited by `config`.
    #[must_use]
    pub fn new(store: &'a S, runner: &'a dyn CheckRunner, config: &VerificationConfig) -> Self {
        Self {
            store,
            runner,
            max_attempts: config.max_attempts.max(1),
            max_parallel: config.max_parallel.max(1),
            lease_seconds: config.lease_seconds(),
        }
    }

    /// Claim a `pending` diff. `None` if it is no longer pending.
    ///
    /// # Errors
    /// Store failures.
    pub fn claim(&self, id: &DiffId) -> Result<Option<Diff>, BusError> {
        let now = unix_now();
        match self
            .store
            .transition::<Diff>(id.as_str(), DiffStatus::Pending, DiffStatus::Verifying, |d| {
                d.verifying_since = Some(now);
                d.updated_at = now;
            }) {
            Ok(diff) => {
                debug!(diff = %id, "verification claimed");
                Ok(Some(diff))
            }
            Err(StoreError::StaleStatus { actual, .. }) => {
                debug!(diff = %id, %actual, "claim lost; skipping");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim, check and settle one diff.
    ///
    /// # Errors
    /// Store failures. Runner failures are retried, not returned.
    pub fn verify_one(&self, id: &DiffId) -> Result<VerifyOutcome, BusError> {
        let Some(claimed) = self.claim(id)? else {
            return Ok(VerifyOutcome::Skipped);
        };
        let scope = scope_for(&claimed);
        match self.runner.run(&scope) {
            Ok(report) => match report.status {
                CheckStatus::Passed | CheckStatus::Failed => self.finish(&claimed, scope, report),
                CheckStatus::TimedOut => {
                    warn!(diff = %id, "verification timed out");
                    self.retry_or_give_up(&claimed, "verification timed out")
                }
            },
            Err(e) => {
                warn!(diff = %id, error = %e, "check runner failed");
                self.retry_or_give_up(&claimed, &e.to_string())
            }
        }
    }

    /// Verify every `pending` diff, at most `max_parallel` at a time, in
    /// submission order.
    ///
    /// # Errors
    /// The first store failure any worker hit.
    pub fn verify_pending(&self) -> Result<VerifyReport, BusError> {
        let mut pending = self.store.list(|d: &Diff| d.status == DiffStatus::Pending)?;
        pending.sort_by_key(|d| d.seq);
        let ids: Vec<DiffId> = pending.into_iter().map(|d| d.id).collect();
        if ids.is_empty() {
            return Ok(VerifyReport::default());
        }

        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<(usize, DiffId, Result<VerifyOutcome, BusError>)>> =
            Mutex::new(Vec::with_capacity(ids.len()));
        thread::scope(|s| {
            for _ in 0..self.max_parallel.min(ids.len()) {
                s.spawn(|| {
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(id) = ids.get(i) else {
                            break;
                        };
                        let outcome = self.verify_one(id);
                        results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((i, id.clone(), outcome));
                    }
                });
            }
        });

        let mut results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
        results.sort_by_key(|(i, _, _)| *i);
        let mut report = VerifyReport::default();
        for (_, id, outcome) in results {
            report.record(id, &outcome?);
        }
        if report.settled() > 0 {
            info!(
                verified = report.verified.len(),
                rejected = report.rejected.len(),
                retried = report.retried.len(),
                "verification pass"
            );
        }
        Ok(report)
    }

    /// Revert claims held longer than the lease. Reverted diffs count an
    /// attempt, so a diff that keeps crashing its verifier is eventually
    /// rejected.
    ///
    /// # Errors
    /// Store failures.
    pub fn reconcile(&self, now: u64) -> Result<Vec<DiffId>, BusError> {
        let stuck = self.store.list(|d: &Diff| {
            d.status == DiffStatus::Verifying
                && d
                    .verifying_since
                    .is_some_and(|since| now >= since.saturating_add(self.lease_seconds))
        })?;
        let mut reverted = Vec::new();
        for diff in stuck {
            let age = diff.verifying_since.map_or(0, |s| now.saturating_sub(s));
            warn!(diff = %diff.id, age_s = age, "verification lease expired");
            match self.retry_or_give_up(&diff, "verification lease expired")? {
                VerifyOutcome::Skipped => {}
                _ => reverted.push(diff.id.clone()),
            }
        }
        Ok(reverted)
    }

    fn finish(&self, claimed: &Diff, scope: Vec<String>, report: CheckReport) -> Result<VerifyOutcome, BusError> {
        let now = unix_now();
        let result = VerificationResult {
            passed: report.status == CheckStatus::Passed,
            scope,
            checks: report.checks,
            duration_ms: report.duration_ms,
            completed_at: now,
        };
        if result.passed {
            let settled = self.settle(claimed, DiffStatus::Verified, |d| {
                d.verification = Some(result);
                d.verification_attempts += 1;
            })?;
            if settled.is_some() {
                info!(diff = %claimed.id, "diff verified");
                return Ok(VerifyOutcome::Verified);
            }
            return Ok(VerifyOutcome::Skipped);
        }

        let detail = result.failure_summary();
        let settled = self.settle(claimed, DiffStatus::Rejected, |d| {
            d.rejection = Some(Rejection {
                reason: RejectionReason::VerificationFailed,
                detail: detail.clone(),
                at: now,
            });
            d.verification = Some(result);
            d.verification_attempts += 1;
        })?;
        let Some(rejected) = settled else {
            return Ok(VerifyOutcome::Skipped);
        };
        info!(diff = %claimed.id, %detail, "diff rejected by verification");
        return_to_ready(self.store, &rejected.work_id, &detail)?;
        Ok(VerifyOutcome::Rejected { detail })
    }

    fn retry_or_give_up(&self, claimed: &Diff, why: &str) -> Result<VerifyOutcome, BusError> {
        let attempts = claimed.verification_attempts + 1;
        if attempts < self.max_attempts {
            let settled = self.settle(claimed, DiffStatus::Pending, |d| {
                d.verification_attempts = attempts;
            })?;
            return Ok(settled.map_or(VerifyOutcome::Skipped, |_| VerifyOutcome::Retry { attempts }));
        }

        let now = unix_now();
        let detail = format!("{why}; gave up after {attempts} attempts");
        let settled = self.settle(claimed, DiffStatus::Rejected, |d| {
            d.verification_attempts = attempts;
            d.rejection = Some(Rejection {
                reason: RejectionReason::VerificationTimeout,
                detail: detail.clone(),
                at: now,
            });
        })?;
        let Some(rejected) = settled else {
            return Ok(VerifyOutcome::Skipped);
        };
        warn!(diff = %claimed.id, attempts, "diff rejected after repeated timeouts");
        return_to_ready(self.store, &rejected.work_id, &detail)?;
        Ok(VerifyOutcome::GaveUp { attempts })
    }

    /// Move a claimed diff out of `verifying` if the claim is still the one
    /// we hold. `None` when it is not.
    fn settle(
        &self,
        claimed: &Diff,
        to: DiffStatus,
        edit: impl FnOnce(&mut Diff),
    ) -> Result<Option<Diff>, BusError> {
        let now = unix_now();
        let result = self.store.update::<Diff>(claimed.id.as_str(), |d| {
            if d.status != DiffStatus::Verifying || d.verifying_since != claimed.verifying_since {
                return Err(StoreError::StaleStatus {
                    collection: Collection::Diffs,
                    id: claimed.id.to_string(),
                    expected: DiffStatus::Verifying.to_string(),
                    actual: d.status.to_string(),
                });
            }
            d.status = to;
            d.verifying_since = None;
            d.updated_at = now;
            edit(d);
            Ok(())
        });
        match result {
            Ok(diff) => {
                debug!(diff = %claimed.id, status = %to, "verification settled");
                Ok(Some(diff))
            }
            Err(StoreError::StaleStatus { actual, .. }) => {
                warn!(diff = %claimed.id, %actual, "verification claim was taken over; result dropped");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::model::diff::{CausalChain, CheckOutcome};
    use crate::model::types::{InstanceId, WorkId};
    use crate::model::work::{WorkPackage, WorkStatus};
    use crate::store::MemoryStore;

    /// Fails any scope containing `bad`; times out on `slow`.
    struct Scripted;

    impl CheckRunner for Scripted {
        fn run(&self, scope: &[String]) -> Result<CheckReport, CheckError> {
            if scope.iter().any(|f| f.contains("slow")) {
                return Ok(CheckReport {
                    status: CheckStatus::TimedOut,
                    checks: Vec::new(),
                    duration_ms: 0,
                });
            }
            let bad: Vec<String> = scope.iter().filter(|f| f.contains("bad")).cloned().collect();
            if bad.is_empty() {
                return Ok(CheckReport::empty());
            }
            Ok(CheckReport {
                status: CheckStatus::Failed,
                checks: vec![CheckOutcome {
                    name: "tests".into(),
                    passed: false,
                    exit_code: Some(1),
                    failing_files: bad,
                    output: String::new(),
                    duration_ms: 1,
                }],
                duration_ms: 1,
            })
        }
    }

    fn setup(store: &MemoryStore, seq: u64, file: &str) -> DiffId {
        let work = WorkId::new(&format!("wp-{seq}")).unwrap();
        let mut wp = WorkPackage::new(work.clone(), "x", vec![], 0);
        wp.status = WorkStatus::Dispatched;
        wp.assigned_to = Some(InstanceId::new("icarus-1").unwrap());
        store.put(&wp).unwrap();
        let id = DiffId::from_sequence(seq);
        let diff = Diff {
            id: id.clone(),
            seq,
            work_id: work,
            instance_id: InstanceId::new("icarus-1").unwrap(),
            description: "change".into(),
            status: DiffStatus::Pending,
            files_added: [file.to_owned()].into(),
            files_modified: BTreeSet::new(),
            files_deleted: BTreeSet::new(),
            line_changes: Default::default(),
            causal_chain: CausalChain {
                files: ["lib/caller.py".to_owned()].into(),
                ..CausalChain::default()
            },
            patch: None,
            verification: None,
            verification_attempts: 0,
            verifying_since: None,
            merge_batch: None,
            rejection: None,
            submitted_at: 0,
            updated_at: 0,
        };
        store.put(&diff).unwrap();
        id
    }

    fn config(max_attempts: u32) -> VerificationConfig {
        VerificationConfig {
            max_attempts,
            ..VerificationConfig::default()
        }
    }

    #[test]
    fn scope_includes_causal_chain() {
        let store = MemoryStore::new();
        let id = setup(&store, 1, "src/a.py");
        let diff: Diff = store.require(id.as_str()).unwrap();
        assert_eq!(scope_for(&diff), vec!["lib/caller.py".to_owned(), "src/a.py".to_owned()]);
    }

    #[test]
    fn pass_and_fail_settle_claims() {
        let store = MemoryStore::new();
        let good = setup(&store, 1, "src/good.py");
        let bad = setup(&store, 2, "src/bad.py");
        let cfg = config(3);
        let verifier = Verifier::new(&store, &Scripted, &cfg);
        let report = verifier.verify_pending().unwrap();
        assert_eq!(report.verified, vec![good.clone()]);
        assert_eq!(report.rejected, vec![bad.clone()]);

        let d: Diff = store.require(bad.as_str()).unwrap();
        assert_eq!(d.status, DiffStatus::Rejected);
        let rejection = d.rejection.unwrap();
        assert_eq!(rejection.reason, RejectionReason::VerificationFailed);
        assert!(rejection.detail.contains("src/bad.py"));
        let wp: WorkPackage = store.require("wp-2").unwrap();
        assert_eq!(wp.status, WorkStatus::Ready);
        assert_eq!(wp.requeue_count, 1);

        let d: Diff = store.require(good.as_str()).unwrap();
        assert!(d.verification.unwrap().passed);
        assert!(d.verifying_since.is_none());
    }

    #[test]
    fn timeouts_retry_until_cap() {
        let store = MemoryStore::new();
        let id = setup(&store, 1, "src/slow.py");
        let cfg = config(2);
        let verifier = Verifier::new(&store, &Scripted, &cfg);
        assert_eq!(verifier.verify_one(&id).unwrap(), VerifyOutcome::Retry { attempts: 1 });
        assert_eq!(verifier.verify_one(&id).unwrap(), VerifyOutcome::GaveUp { attempts: 2 });
        let d: Diff = store.require(id.as_str()).unwrap();
        assert_eq!(d.rejection.unwrap().reason, RejectionReason::VerificationTimeout);
    }

    #[test]
    fn claim_is_exclusive() {
        let store = MemoryStore::new();
        let id = setup(&store, 1, "src/a.py");
        let cfg = config(3);
        let verifier = Verifier::new(&store, &Scripted, &cfg);
        assert!(verifier.claim(&id).unwrap().is_some());
        assert!(verifier.claim(&id).unwrap().is_none());
        assert_eq!(verifier.verify_one(&id).unwrap(), VerifyOutcome::Skipped);
    }

    #[test]
    fn reconcile_reverts_expired_claims_only() {
        let store = MemoryStore::new();
        let id = setup(&store, 1, "src/a.py");
        let cfg = config(3);
        let verifier = Verifier::new(&store, &Scripted, &cfg);
        let claimed = verifier.claim(&id).unwrap().unwrap();
        let since = claimed.verifying_since.unwrap();
        assert!(verifier.reconcile(since).unwrap().is_empty());
        let later = since + cfg.lease_seconds();
        assert_eq!(verifier.reconcile(later).unwrap(), vec![id.clone()]);
        let d: Diff = store.require(id.as_str()).unwrap();
        assert_eq!(d.status, DiffStatus::Pending);
        assert_eq!(d.verification_attempts, 1);
    }

    #[test]
    fn stale_claim_holder_cannot_settle() {
        let store = MemoryStore::new();
        let id = setup(&store, 1, "src/a.py");
        let cfg = config(3);
        let verifier = Verifier::new(&store, &Scripted, &cfg);
        let mut old = verifier.claim(&id).unwrap().unwrap();
        old.verifying_since = old.verifying_since.map(|s| s - 1);
        let outcome = verifier
            .finish(&old, vec!["src/a.py".into()], CheckReport::empty())
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Skipped);
        let d: Diff = store.require(id.as_str()).unwrap();
        assert_eq!(d.status, DiffStatus::Verifying);
    }
}
