//! Commit handoff.
//!
//! The bus never touches version control. A finished [`MergeBatch`] is handed
//! to a [`CommitStep`]; once the step reports where it put the batch, a
//! [`CommitRecord`] marks the batch released. The stock step writes each
//! batch into its own directory:
//!
//! ```text
//! <handoff>/<batch-id>/
//!   combined.diff   patches in application order
//!   message.md      generated commit message
//!   batch.json      the batch record
//! ```

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::BusError;
use crate::model::batch::{CommitRecord, MergeBatch};
use crate::model::types::unix_now;
use crate::store::fs::write_atomic;
use crate::store::{BusStore, StoreError};

/// Receives finished batches.
pub trait CommitStep {
    /// Hand `batch` over. Returns where it went (path, ref, URL, ...).
    ///
    /// # Errors
    /// Whatever prevented the handoff; the batch stays unreleased.
    fn commit(&self, batch: &MergeBatch) -> Result<String, BusError>;
}

/// Writes each batch into `<root>/<batch-id>/`.
#[derive(Clone, Debug)]
pub struct CommitDirectory {
    root: PathBuf,
}

impl CommitDirectory {
    /// Handoff directory rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CommitStep for CommitDirectory {
    fn commit(&self, batch: &MergeBatch) -> Result<String, BusError> {
        let dir = self.root.join(batch.id.as_str());
        fs::create_dir_all(&dir)?;
        write_atomic(&dir.join("combined.diff"), &batch.combined_patch)?;
        write_atomic(&dir.join("message.md"), &batch.message)?;
        let json = serde_json::to_string_pretty(batch).map_err(|e| BusError::Serialize {
            detail: e.to_string(),
        })?;
        write_atomic(&dir.join("batch.json"), &json)?;
        debug!(batch = %batch.id, dir = %dir.display(), "handoff written");
        Ok(dir.display().to_string())
    }
}

/// Batches with no commit record, oldest first.
///
/// # Errors
/// Store failures.
pub fn unreleased<S: BusStore>(store: &S) -> Result<Vec<MergeBatch>, BusError> {
    let mut batches = store.all::<MergeBatch>()?;
    let mut pending = Vec::with_capacity(batches.len());
    batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    for batch in batches {
        if store.get::<CommitRecord>(batch.id.as_str())?.is_none() {
            pending.push(batch);
        }
    }
    Ok(pending)
}

/// Hand one batch to `step` and record it. `None` if it was already
/// released.
///
/// # Errors
/// Step or store failures.
pub fn release_batch<S: BusStore>(
    store: &S,
    step: &dyn CommitStep,
    batch: &MergeBatch,
) -> Result<Option<CommitRecord>, BusError> {
    if store.get::<CommitRecord>(batch.id.as_str())?.is_some() {
        return Ok(None);
    }
    let location = step.commit(batch)?;
    let record = CommitRecord {
        batch_id: batch.id.clone(),
        location,
        released_at: unix_now(),
    };
    match store.insert(&record) {
        Ok(()) => {
            info!(batch = %batch.id, location = %record.location, "batch released");
            Ok(Some(record))
        }
        Err(StoreError::AlreadyExists { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Release every unreleased batch, oldest first.
///
/// # Errors
/// The first step or store failure; batches before it stay released.
pub fn release_all<S: BusStore>(store: &S, step: &dyn CommitStep) -> Result<Vec<CommitRecord>, BusError> {
    let mut released = Vec::new();
    for batch in unreleased(store)? {
        if let Some(record) = release_batch(store, step, &batch)? {
            released.push(record);
        }
    }
    Ok(released)
}
