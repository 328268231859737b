//! Diff bus data model: diffs, conflicts, work packages and batches.

pub mod batch;
pub mod conflict;
pub mod diff;
pub mod types;
pub mod work;
