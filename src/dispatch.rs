//! Work-package dispatch.
//!
//! The bus tracks packages handed out by the planner. A package is
//! dispatchable once it is `ready` and every dependency has at least been
//! dispatched; the merge coordinator enforces dependency order when the
//! resulting diffs are batched. How much may be dispatched without a human
//! is decided by a pluggable [`DispatchPolicy`].

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Autonomy, DispatchConfig};
use crate::error::BusError;
use crate::model::types::{InstanceId, WorkId, unix_now};
use crate::model::work::{WorkPackage, WorkStatus};
use crate::store::{BusStore, StoreError};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Whether a package may go out without approval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Approval {
    /// Dispatch automatically.
    Auto,
    /// Hold for a human; the string says why.
    Required(String),
}

/// Decides which packages need approval before dispatch.
pub trait DispatchPolicy {
    /// Approval decision for one package.
    fn approval(&self, work: &WorkPackage) -> Approval;
}

/// Autonomy-level policy: `supervised` holds everything, `full` holds
/// nothing, `hybrid` holds packages carrying a sensitive tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutonomyPolicy {
    autonomy: Autonomy,
    sensitive: std::collections::BTreeSet<String>,
}

impl AutonomyPolicy {
    /// Policy from the `[dispatch]` config section.
    #[must_use]
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            autonomy: config.autonomy,
            sensitive: config.require_approval_for.clone(),
        }
    }
}

impl DispatchPolicy for AutonomyPolicy {
    fn approval(&self, work: &WorkPackage) -> Approval {
        match self.autonomy {
            Autonomy::Full => Approval::Auto,
            Autonomy::Supervised => Approval::Required("supervised autonomy".to_owned()),
            Autonomy::Hybrid => {
                let hits: Vec<&str> = work
                    .tags
                    .intersection(&self.sensitive)
                    .map(String::as_str)
                    .collect();
                if hits.is_empty() {
                    Approval::Auto
                } else {
                    Approval::Required(format!("tagged {}", hits.join(", ")))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Outcome of an automatic dispatch sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Packages handed out, with their worker.
    pub dispatched: Vec<(WorkId, InstanceId)>,
    /// Packages held for approval, with the reason.
    pub awaiting_approval: Vec<(WorkId, String)>,
    /// Ready packages whose dependencies have not gone out yet.
    pub blocked: Vec<WorkId>,
}

/// Registers and hands out work packages.
pub struct Dispatcher<'a, S> {
    store: &'a S,
    max_parallel: usize,
}

impl<'a, S: BusStore> Dispatcher<'a, S> {
    /// Dispatcher over `store` allowing `max_parallel` packages out at once.
    pub const fn new(store: &'a S, max_parallel: usize) -> Self {
        Self {
            store,
            max_parallel,
        }
    }

    /// Register a planned package. Its dependencies must already be known.
    ///
    /// # Errors
    /// [`BusError::UnknownWorkPackage`] for an unknown dependency,
    /// `AlreadyExists` for a duplicate id, or store failures.
    pub fn plan(&self, work: &WorkPackage) -> Result<(), BusError> {
        for dep in &work.depends_on {
            if self.store.get::<WorkPackage>(dep.as_str())?.is_none() {
                return Err(BusError::UnknownWorkPackage { id: dep.clone() });
            }
        }
        self.store.insert(work)?;
        info!(work = %work.id, deps = work.depends_on.len(), "work package planned");
        Ok(())
    }

    /// Hand one `ready` package to `worker`, regardless of policy.
    ///
    /// # Errors
    /// `StaleStatus` if the package is not ready, `NotFound`, or store
    /// failures.
    pub fn dispatch(&self, work_id: &WorkId, worker: &InstanceId) -> Result<WorkPackage, BusError> {
        let now = unix_now();
        let work = self.store.transition::<WorkPackage>(
            work_id.as_str(),
            WorkStatus::Ready,
            WorkStatus::Dispatched,
            |w| {
                w.assigned_to = Some(worker.clone());
                w.updated_at = now;
            },
        )?;
        info!(work = %work_id, %worker, "work package dispatched");
        Ok(work)
    }

    /// Dispatch every eligible package the policy allows, up to capacity.
    /// `assign` names the worker for each package; returning `None` stops
    /// the sweep (no worker available).
    ///
    /// # Errors
    /// Store failures.
    pub fn dispatch_ready(
        &self,
        policy: &dyn DispatchPolicy,
        assign: &mut dyn FnMut(&WorkPackage) -> Option<InstanceId>,
    ) -> Result<DispatchReport, BusError> {
        let all = self.store.all::<WorkPackage>()?;
        let status: BTreeMap<&WorkId, WorkStatus> = all.iter().map(|w| (&w.id, w.status)).collect();
        let mut out_now = all
            .iter()
            .filter(|w| w.status == WorkStatus::Dispatched)
            .count();
        let mut report = DispatchReport::default();

        for work in all.iter().filter(|w| w.status == WorkStatus::Ready) {
            let deps_out = work
                .depends_on
                .iter()
                .all(|d| matches!(status.get(d), Some(WorkStatus::Dispatched | WorkStatus::Done)));
            if !deps_out {
                report.blocked.push(work.id.clone());
                continue;
            }
            if let Approval::Required(reason) = policy.approval(work) {
                report.awaiting_approval.push((work.id.clone(), reason));
                continue;
            }
            if out_now >= self.max_parallel {
                debug!(work = %work.id, "dispatch capacity reached");
                break;
            }
            let Some(worker) = assign(work) else {
                break;
            };
            match self.dispatch(&work.id, &worker) {
                Ok(_) => {
                    out_now += 1;
                    report.dispatched.push((work.id.clone(), worker));
                }
                Err(e) if e.is_stale() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

/// Return a dispatched package to `ready` after its diff was rejected.
///
/// The compare-and-set makes this exactly-once per dispatch: a second
/// rejection for the same package finds it already `ready` and does
/// nothing. Returns `true` if this call moved the package.
///
/// # Errors
/// Store failures.
pub fn return_to_ready<S: BusStore>(store: &S, work_id: &WorkId, reason: &str) -> Result<bool, BusError> {
    let now = unix_now();
    match store.transition::<WorkPackage>(
        work_id.as_str(),
        WorkStatus::Dispatched,
        WorkStatus::Ready,
        |w| {
            w.assigned_to = None;
            w.requeue_count += 1;
            w.updated_at = now;
        },
    ) {
        Ok(work) => {
            info!(work = %work_id, requeues = work.requeue_count, %reason, "work package returned to ready");
            Ok(true)
        }
        Err(StoreError::StaleStatus { actual, .. }) => {
            debug!(work = %work_id, %actual, "work package not dispatched; requeue skipped");
            Ok(false)
        }
        Err(StoreError::NotFound { .. }) => {
            warn!(work = %work_id, "rejected diff names an unknown work package");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Mark a dispatched package done once its diff merged. Returns `true` if
/// this call moved the package.
///
/// # Errors
/// Store failures.
pub fn mark_done<S: BusStore>(store: &S, work_id: &WorkId) -> Result<bool, BusError> {
    let now = unix_now();
    match store.transition::<WorkPackage>(
        work_id.as_str(),
        WorkStatus::Dispatched,
        WorkStatus::Done,
        |w| w.updated_at = now,
    ) {
        Ok(_) => Ok(true),
        Err(StoreError::StaleStatus { .. } | StoreError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
