//! Bus error types.
//!
//! Defines [`BusError`], the unified error type for bus operations. Error
//! messages are agent-friendly: each variant says what went wrong and, where
//! there is something to do about it, how to fix it.

use std::fmt;

use crate::config::ConfigError;
use crate::model::types::{ConflictId, DiffId, ValidationError, WorkId};
use crate::store::StoreError;
use crate::verify::runner::CheckError;

// ---------------------------------------------------------------------------
// BusError
// ---------------------------------------------------------------------------

/// Unified error type for bus operations.
#[derive(Debug)]
pub enum BusError {
    /// A submission failed validation. Nothing was stored.
    InvalidDiff {
        /// Why the submission was refused.
        reason: String,
    },

    /// A submission named a work package the bus does not know.
    UnknownWorkPackage {
        /// The unknown package.
        id: WorkId,
    },

    /// An entity does not exist.
    NotFound {
        /// Collection name (`diffs`, `conflicts`, ...).
        collection: String,
        /// The missing id.
        id: String,
    },

    /// An entity with this id already exists.
    AlreadyExists {
        /// Collection name.
        collection: String,
        /// The duplicate id.
        id: String,
    },

    /// A compare-and-set transition found a different status than expected.
    StaleStatus {
        /// The entity id.
        id: String,
        /// Status the caller expected.
        expected: String,
        /// Status actually recorded.
        actual: String,
    },

    /// The requested status change is not an edge of the state machine.
    InvalidTransition {
        /// The entity id.
        id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Scoped checks failed for a diff.
    VerificationFailed {
        /// The rejected diff.
        diff: DiffId,
        /// Failing checks and the files they name.
        detail: String,
    },

    /// The check runner timed out on every allowed attempt.
    VerificationTimeout {
        /// The rejected diff.
        diff: DiffId,
        /// Attempts made.
        attempts: u32,
    },

    /// Re-verifying an assembled batch failed; the batch was discarded.
    BatchVerificationFailed {
        /// The diffs that would have formed the batch.
        diffs: Vec<DiffId>,
        /// Failing checks and the files they name.
        detail: String,
    },

    /// A diff is blocked by conflicts that have not been resolved.
    ConflictUnresolved {
        /// The blocked diff.
        diff: DiffId,
        /// The blocking conflicts.
        conflicts: Vec<ConflictId>,
    },

    /// A resolution cannot be applied to a conflict.
    InvalidResolution {
        /// The conflict.
        conflict: ConflictId,
        /// Why the resolution was refused.
        reason: String,
    },

    /// Another writer changed an entity mid-operation; the operation was
    /// rolled back.
    ConcurrentMutation {
        /// The entity id.
        id: String,
        /// What changed.
        detail: String,
    },

    /// Another orchestrator holds the bus leader marker.
    LeaderLockHeld {
        /// Process id recorded in the marker.
        pid: u32,
        /// Seconds since the holder's last heartbeat.
        heartbeat_age: u64,
    },

    /// A record would be written without the fields its status requires.
    IntegrityViolation {
        /// The entity id.
        id: String,
        /// What is missing or inconsistent.
        detail: String,
    },

    /// An identifier failed validation.
    Validation(ValidationError),

    /// The check runner could not run.
    Check(CheckError),

    /// The causal analysis provider failed.
    Causal {
        /// File or symbol the chain was requested for.
        target: String,
        /// Provider message.
        detail: String,
    },

    /// The configuration file could not be loaded.
    Config(ConfigError),

    /// A record could not be encoded or decoded.
    Serialize {
        /// Parser / encoder message.
        detail: String,
    },

    /// An I/O error.
    Io(std::io::Error),
}

impl BusError {
    /// Returns `true` for the compare-and-set mismatch that callers treat as
    /// "someone else got there first".
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::StaleStatus { .. })
    }
}

// ---------------------------------------------------------------------------
// Display: agent-friendly error messages
// ---------------------------------------------------------------------------

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDiff { reason } => {
                write!(
                    f,
                    "invalid diff: {reason}\n  To fix: correct the submission and submit again."
                )
            }
            Self::UnknownWorkPackage { id } => {
                write!(
                    f,
                    "unknown work package '{id}'.\n  To fix: register it first:\n    ariadne plan {id} --description \"...\""
                )
            }
            Self::NotFound { collection, id } => {
                write!(f, "{collection}/{id} not found.")
            }
            Self::AlreadyExists { collection, id } => {
                write!(f, "{collection}/{id} already exists.")
            }
            Self::StaleStatus {
                id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "stale status on {id}: expected {expected}, found {actual}"
                )
            }
            Self::InvalidTransition { id, from, to } => {
                write!(f, "invalid transition for {id}: {from} -> {to}")
            }
            Self::VerificationFailed { diff, detail } => {
                write!(f, "verification failed for {diff}: {detail}")
            }
            Self::VerificationTimeout { diff, attempts } => {
                write!(
                    f,
                    "verification of {diff} timed out {attempts} time(s); giving up.\n  To fix: raise verification.timeout_seconds or narrow the check commands."
                )
            }
            Self::BatchVerificationFailed { diffs, detail } => {
                let ids: Vec<&str> = diffs.iter().map(DiffId::as_str).collect();
                write!(
                    f,
                    "batch verification failed for [{}]: {detail}\n  No diff changed status; the batch was discarded.",
                    ids.join(", ")
                )
            }
            Self::ConflictUnresolved { diff, conflicts } => {
                let ids: Vec<&str> = conflicts.iter().map(ConflictId::as_str).collect();
                write!(
                    f,
                    "{diff} is blocked by unresolved conflict(s): {}\n  To fix: resolve each one:\n    ariadne resolve <conflict-id> --survivor <diff-id>",
                    ids.join(", ")
                )
            }
            Self::InvalidResolution { conflict, reason } => {
                write!(f, "cannot resolve {conflict}: {reason}")
            }
            Self::ConcurrentMutation { id, detail } => {
                write!(
                    f,
                    "{id} changed concurrently: {detail}\n  The operation was rolled back; the next pass retries it."
                )
            }
            Self::LeaderLockHeld { pid, heartbeat_age } => {
                write!(
                    f,
                    "another orchestrator (pid {pid}) holds this bus; last heartbeat {heartbeat_age}s ago.\n  To fix: stop it, or wait for its marker to go stale."
                )
            }
            Self::IntegrityViolation { id, detail } => {
                write!(f, "integrity violation on {id}: {detail}")
            }
            Self::Validation(err) => write!(f, "{err}"),
            Self::Check(err) => write!(f, "{err}"),
            Self::Causal { target, detail } => {
                write!(
                    f,
                    "causal analysis failed for {target}: {detail}\n  To fix: check [causal].command, or pass the chain with the submission."
                )
            }
            Self::Config(err) => {
                write!(
                    f,
                    "configuration error: {err}\n  To fix: edit the config file and correct the issue."
                )
            }
            Self::Serialize { detail } => write!(f, "serialization error: {detail}"),
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions and disk space."
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Check(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ValidationError> for BusError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<CheckError> for BusError {
    fn from(err: CheckError) -> Self {
        Self::Check(err)
    }
}

impl From<ConfigError> for BusError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<StoreError> for BusError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => Self::NotFound {
                collection: collection.to_string(),
                id,
            },
            StoreError::AlreadyExists { collection, id } => Self::AlreadyExists {
                collection: collection.to_string(),
                id,
            },
            StoreError::StaleStatus {
                id,
                expected,
                actual,
                ..
            } => Self::StaleStatus {
                id,
                expected,
                actual,
            },
            StoreError::InvalidTransition { id, from, to, .. } => {
                Self::InvalidTransition { id, from, to }
            }
            StoreError::Integrity { id, detail, .. } => Self::IntegrityViolation { id, detail },
            StoreError::Serialize { path, detail } => Self::Serialize {
                detail: match path {
                    Some(p) => format!("{}: {detail}", p.display()),
                    None => detail,
                },
            },
            StoreError::Io { source, .. } => Self::Io(source),
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
    use crate::store::Collection;

    #[test]
    fn stale_status_maps_through() {
        let err: BusError = StoreError::StaleStatus {
            collection: Collection::Diffs,
            id: "diff-000001".to_owned(),
            expected: "pending".to_owned(),
            actual: "verifying".to_owned(),
        }
        .into();
        assert!(err.is_stale());
        assert!(err.to_string().contains("expected pending, found verifying"));
    }

    #[test]
    fn integrity_maps_to_violation() {
        let err: BusError = StoreError::Integrity {
            collection: Collection::Diffs,
            id: "diff-000001".to_owned(),
            detail: "no result".to_owned(),
        }
        .into();
        assert!(matches!(err, BusError::IntegrityViolation { .. }));
    }

    #[test]
    fn unresolved_message_suggests_resolve() {
        let err = BusError::ConflictUnresolved {
            diff: DiffId::from_sequence(1),
            conflicts: vec![ConflictId::for_pair(
                &DiffId::from_sequence(1),
                &DiffId::from_sequence(2),
            )],
        };
        let msg = err.to_string();
        assert!(msg.contains("conflict-diff-000001-diff-000002"));
        assert!(msg.contains("ariadne resolve"));
    }

    #[test]
    fn io_error_has_source() {
        use std::error::Error as _;
        let err = BusError::from(std::io::Error::other("disk"));
        assert!(err.source().is_some());
    }
}
