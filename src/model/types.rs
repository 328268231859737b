//! Core identifier types for the diff bus.
//!
//! Every entity on the bus is addressed by a validated identifier newtype:
//! diffs, work packages, worker instances, conflicts, merge batches and
//! inbox submissions.
//! Identifiers are plain strings on the wire (`serde(try_from = "String")`)
//! so the JSON records stay human-readable.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifier newtypes
// ---------------------------------------------------------------------------

/// Maximum length of any bus identifier.
pub const MAX_ID_LEN: usize = 128;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier, validating its format.
            ///
            /// # Errors
            /// Returns an error if the identifier is empty, too long, or
            /// contains characters outside `[A-Za-z0-9._:-]`.
            pub fn new(s: &str) -> Result<Self, ValidationError> {
                validate_id($kind, s)?;
                Ok(Self(s.to_owned()))
            }

            /// Return the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                validate_id($kind, &s)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Identifier of an admitted diff, assigned by the ingestor
    /// (`diff-000042`). Never reused, even after rejection.
    DiffId,
    ErrorKind::DiffId
);

define_id!(
    /// Identifier of a planned work package, supplied by the planner.
    WorkId,
    ErrorKind::WorkId
);

define_id!(
    /// Identifier of the worker instance that produced a diff.
    InstanceId,
    ErrorKind::InstanceId
);

define_id!(
    /// Identifier of a recorded conflict. Derived from the ordered pair of
    /// diff ids, so the same pair always maps to the same conflict.
    ConflictId,
    ErrorKind::ConflictId
);

define_id!(
    /// Identifier of a merge batch.
    BatchId,
    ErrorKind::BatchId
);

define_id!(
    /// Identifier of a submission waiting in the bus inbox.
    SubmissionId,
    ErrorKind::SubmissionId
);

impl DiffId {
    /// Build the canonical diff id for an ingestion sequence number.
    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("diff-{seq:06}"))
    }
}

impl SubmissionId {
    /// Build the canonical inbox id for a sequence number.
    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("sub-{seq:06}"))
    }
}

impl BatchId {
    /// Build a batch id from a content hash (hex).
    #[must_use]
    pub fn from_hash(hex: &str) -> Self {
        Self(format!("batch-{hex}"))
    }
}

impl ConflictId {
    /// The conflict id for an unordered pair of diffs.
    ///
    /// The pair is sorted first, so `for_pair(a, b) == for_pair(b, a)`.
    #[must_use]
    pub fn for_pair(a: &DiffId, b: &DiffId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("conflict-{lo}-{hi}"))
    }
}

fn validate_id(kind: ErrorKind, s: &str) -> Result<(), ValidationError> {
    if s.is_empty() {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "identifier must not be empty".to_owned(),
        });
    }
    if s.len() > MAX_ID_LEN {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: format!(
                "identifier must be at most {MAX_ID_LEN} characters, got {}",
                s.len()
            ),
        });
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "identifier may only contain ASCII letters, digits, '-', '_', '.' and ':'"
                .to_owned(),
        });
    }
    if s.starts_with('.') {
        return Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: "identifier must not start with '.'".to_owned(),
        });
    }
    Ok(())
}

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// The kind of value that failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A [`DiffId`] validation error.
    DiffId,
    /// A [`WorkId`] validation error.
    WorkId,
    /// An [`InstanceId`] validation error.
    InstanceId,
    /// A [`ConflictId`] validation error.
    ConflictId,
    /// A [`BatchId`] validation error.
    BatchId,
    /// A [`SubmissionId`] validation error.
    SubmissionId,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DiffId => write!(f, "DiffId"),
            Self::WorkId => write!(f, "WorkId"),
            Self::InstanceId => write!(f, "InstanceId"),
            Self::ConflictId => write!(f, "ConflictId"),
            Self::BatchId => write!(f, "BatchId"),
            Self::SubmissionId => write!(f, "SubmissionId"),
        }
    }
}

/// A validation error for bus identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// What kind of value was being validated.
    pub kind: ErrorKind,
    /// The invalid value.
    pub value: String,
    /// Human-readable explanation.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}: {}", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        assert!(WorkId::new("wp-1").is_ok());
        assert!(WorkId::new("feature.auth:step_2").is_ok());
        assert!(InstanceId::new("icarus-03").is_ok());
    }

    #[test]
    fn rejects_empty_and_path_like_ids() {
        let err = WorkId::new("").unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkId);
        assert!(WorkId::new("../etc/passwd").is_err());
        assert!(WorkId::new("a/b").is_err());
        assert!(WorkId::new(".hidden").is_err());
        assert!(DiffId::new(&"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn diff_id_from_sequence_is_zero_padded() {
        assert_eq!(DiffId::from_sequence(42).as_str(), "diff-000042");
        assert_eq!(DiffId::from_sequence(1_234_567).as_str(), "diff-1234567");
    }

    #[test]
    fn conflict_id_is_order_independent() {
        let a = DiffId::from_sequence(1);
        let b = DiffId::from_sequence(2);
        assert_eq!(ConflictId::for_pair(&a, &b), ConflictId::for_pair(&b, &a));
        assert_eq!(
            ConflictId::for_pair(&a, &b).as_str(),
            "conflict-diff-000001-diff-000002"
        );
    }

    #[test]
    fn serde_rejects_invalid_id() {
        let ok: Result<DiffId, _> = serde_json::from_str("\"diff-000001\"");
        assert!(ok.is_ok());
        let bad: Result<DiffId, _> = serde_json::from_str("\"has space\"");
        assert!(bad.is_err());
    }

    #[test]
    fn validation_error_display_names_kind() {
        let err = BatchId::new("").unwrap_err();
        assert!(err.to_string().contains("BatchId"));
    }
}
