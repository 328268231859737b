//! Work packages handed out by the planner.
//!
//! The bus never plans; it only tracks which packages are ready, which are
//! out with a worker, and which have landed in a merge batch.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{InstanceId, WorkId};

/// Lifecycle of a work package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting for dispatch (initially, or after a rejection re-queued it).
    Ready,
    /// Out with a worker; a diff is expected.
    Dispatched,
    /// Its diff was merged.
    Done,
}

impl WorkStatus {
    /// The set of valid next statuses.
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Ready => &[Self::Dispatched],
            Self::Dispatched => &[Self::Ready, Self::Done],
            Self::Done => &[],
        }
    }

    /// Check whether moving to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A unit of planned work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPackage {
    /// Planner-supplied identifier.
    pub id: WorkId,
    /// What the worker should do.
    pub description: String,
    /// Packages that must be merged before this one, in planner order.
    #[serde(default)]
    pub depends_on: Vec<WorkId>,
    /// The worker holding the package while dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<InstanceId>,
    /// Lifecycle status.
    pub status: WorkStatus,
    /// Free-form labels (`security`, `database`, ...) read by the dispatch
    /// policy.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// How many times a rejection returned the package to `ready`.
    #[serde(default)]
    pub requeue_count: u32,
    /// Unix timestamp (seconds).
    pub created_at: u64,
    /// Unix timestamp (seconds).
    pub updated_at: u64,
}

impl WorkPackage {
    /// A fresh `ready` package.
    #[must_use]
    pub fn new(id: WorkId, description: impl Into<String>, depends_on: Vec<WorkId>, now: u64) -> Self {
        Self {
            id,
            description: description.into(),
            depends_on,
            assigned_to: None,
            status: WorkStatus::Ready,
            tags: BTreeSet::new(),
            requeue_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the record's internal consistency.
    ///
    /// # Errors
    /// Returns a description of the first inconsistency found.
    pub fn check_integrity(&self) -> Result<(), String> {
        if self.depends_on.contains(&self.id) {
            return Err(format!("{} depends on itself", self.id));
        }
        if self.status == WorkStatus::Dispatched && self.assigned_to.is_none() {
            return Err(format!("{} is dispatched without an assigned worker", self.id));
        }
        Ok(())
    }
}
