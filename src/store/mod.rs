//! The bus store: shared state for every stage.
//!
//! Entities live in named [`Collection`]s, one JSON document per entity.
//! Backends implement a small set of raw primitives (load, list, modify
//! under lock, remove, sequence counters); the typed API (`get`, `put`,
//! `update`, `transition`, ...) is provided on top of them, so every
//! backend shares the same compare-and-set and integrity semantics.
//!
//! Per-entity compare-and-set is the only synchronisation primitive the bus
//! relies on: a stage claims work by moving an entity from the status it
//! observed to the next one, and loses cleanly with
//! [`StoreError::StaleStatus`] if another writer got there first.

pub mod fs;
pub mod memory;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::batch::{CommitRecord, MergeBatch};
use crate::model::conflict::Conflict;
use crate::model::diff::{Diff, DiffStatus};
use crate::model::work::{WorkPackage, WorkStatus};

pub use fs::FsStore;
pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// A named set of entities of one type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    /// [`Diff`] records.
    Diffs,
    /// [`Conflict`] records.
    Conflicts,
    /// [`MergeBatch`] records.
    Batches,
    /// [`CommitRecord`] markers.
    Commits,
    /// [`WorkPackage`] records.
    Work,
    /// Submissions waiting for admission.
    Inbox,
}

impl Collection {
    /// Every collection.
    pub const ALL: [Self; 6] = [
        Self::Diffs,
        Self::Conflicts,
        Self::Batches,
        Self::Commits,
        Self::Work,
        Self::Inbox,
    ];

    /// Directory / key prefix of the collection.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Diffs => "diffs",
            Self::Conflicts => "conflicts",
            Self::Batches => "batches",
            Self::Commits => "commits",
            Self::Work => "work",
            Self::Inbox => "inbox",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors from a store backend.
#[derive(Debug)]
pub enum StoreError {
    /// The entity does not exist.
    NotFound {
        /// Collection searched.
        collection: Collection,
        /// Missing id.
        id: String,
    },
    /// A create-only write found an existing entity.
    AlreadyExists {
        /// Collection written.
        collection: Collection,
        /// Duplicate id.
        id: String,
    },
    /// A compare-and-set found a different status.
    StaleStatus {
        /// Collection written.
        collection: Collection,
        /// Entity id.
        id: String,
        /// Status the caller expected.
        expected: String,
        /// Status on record.
        actual: String,
    },
    /// The state machine has no such edge.
    InvalidTransition {
        /// Collection written.
        collection: Collection,
        /// Entity id.
        id: String,
        /// Source status.
        from: String,
        /// Target status.
        to: String,
    },
    /// The record failed its integrity check and was not written.
    Integrity {
        /// Collection written.
        collection: Collection,
        /// Entity id.
        id: String,
        /// What is inconsistent.
        detail: String,
    },
    /// A document could not be encoded or decoded.
    Serialize {
        /// File involved, if any.
        path: Option<PathBuf>,
        /// Parser / encoder message.
        detail: String,
    },
    /// Filesystem failure.
    Io {
        /// File involved, if any.
        path: Option<PathBuf>,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: Some(path.into()),
            source,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { collection, id } => write!(f, "{collection}/{id} not found"),
            Self::AlreadyExists { collection, id } => {
                write!(f, "{collection}/{id} already exists")
            }
            Self::StaleStatus {
                collection,
                id,
                expected,
                actual,
            } => write!(
                f,
                "{collection}/{id}: expected status {expected}, found {actual}"
            ),
            Self::InvalidTransition {
                collection,
                id,
                from,
                to,
            } => write!(f, "{collection}/{id}: {from} -> {to} is not a valid transition"),
            Self::Integrity {
                collection,
                id,
                detail,
            } => write!(f, "{collection}/{id}: refusing inconsistent record: {detail}"),
            Self::Serialize { path, detail } => match path {
                Some(p) => write!(f, "{}: {detail}", p.display()),
                None => write!(f, "{detail}"),
            },
            Self::Io { path, source } => match path {
                Some(p) => write!(f, "{}: {source}", p.display()),
                None => write!(f, "{source}"),
            },
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity / Staged
// ---------------------------------------------------------------------------

/// A record stored in a collection.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send {
    /// The collection the entity lives in.
    const COLLECTION: Collection;

    /// The entity's key within its collection.
    fn key(&self) -> &str;

    /// Check that the record is internally consistent. Backends refuse to
    /// write records that fail.
    ///
    /// # Errors
    /// Returns a description of the inconsistency.
    fn check_integrity(&self) -> Result<(), String> {
        Ok(())
    }
}

/// An entity with a status state machine.
pub trait Staged: Entity {
    /// Status type.
    type Status: Copy + Eq + fmt::Display;

    /// Current status.
    fn status(&self) -> Self::Status;

    /// Overwrite the status. Only [`BusStore::transition`] calls this.
    fn set_status(&mut self, status: Self::Status);

    /// Whether `from -> to` is an edge of the state machine.
    fn can_transition(from: Self::Status, to: Self::Status) -> bool;
}

impl Entity for Diff {
    const COLLECTION: Collection = Collection::Diffs;

    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn check_integrity(&self) -> Result<(), String> {
        Self::check_integrity(self)
    }
}

impl Staged for Diff {
    type Status = DiffStatus;

    fn status(&self) -> DiffStatus {
        self.status
    }

    fn set_status(&mut self, status: DiffStatus) {
        self.status = status;
    }

    fn can_transition(from: DiffStatus, to: DiffStatus) -> bool {
        from.can_transition_to(to)
    }
}

impl Entity for WorkPackage {
    const COLLECTION: Collection = Collection::Work;

    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn check_integrity(&self) -> Result<(), String> {
        Self::check_integrity(self)
    }
}

impl Staged for WorkPackage {
    type Status = WorkStatus;

    fn status(&self) -> WorkStatus {
        self.status
    }

    fn set_status(&mut self, status: WorkStatus) {
        self.status = status;
    }

    fn can_transition(from: WorkStatus, to: WorkStatus) -> bool {
        from.can_transition_to(to)
    }
}

impl Entity for Conflict {
    const COLLECTION: Collection = Collection::Conflicts;

    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn check_integrity(&self) -> Result<(), String> {
        Self::check_integrity(self)
    }
}

impl Entity for MergeBatch {
    const COLLECTION: Collection = Collection::Batches;

    fn key(&self) -> &str {
        self.id.as_str()
    }

    fn check_integrity(&self) -> Result<(), String> {
        Self::check_integrity(self)
    }
}

impl Entity for CommitRecord {
    const COLLECTION: Collection = Collection::Commits;

    fn key(&self) -> &str {
        self.batch_id.as_str()
    }
}

// ---------------------------------------------------------------------------
// BusStore
// ---------------------------------------------------------------------------

/// Outcome of a [`BusStore::modify`] callback.
#[derive(Debug)]
pub enum Write {
    /// Leave the stored document untouched.
    Keep,
    /// Replace (or create) the document.
    Put(String),
}

/// A durable home for bus entities.
///
/// Implementors supply the raw primitives; everything else is provided.
pub trait BusStore: Send + Sync {
    /// Read one raw document.
    ///
    /// # Errors
    /// Backend I/O failures.
    fn load(&self, collection: Collection, id: &str) -> Result<Option<String>, StoreError>;

    /// Every id in a collection, sorted.
    ///
    /// # Errors
    /// Backend I/O failures.
    fn ids(&self, collection: Collection) -> Result<Vec<String>, StoreError>;

    /// Read-modify-write one document while holding its exclusive lock.
    ///
    /// The callback sees the current document (or `None`) and decides what
    /// to write. No other writer can touch the document in between.
    ///
    /// # Errors
    /// Backend I/O failures, or whatever the callback returns.
    fn modify(
        &self,
        collection: Collection,
        id: &str,
        f: &mut dyn FnMut(Option<&str>) -> Result<Write, StoreError>,
    ) -> Result<(), StoreError>;

    /// Delete one document. Returns `true` if it existed.
    ///
    /// # Errors
    /// Backend I/O failures.
    fn remove(&self, collection: Collection, id: &str) -> Result<bool, StoreError>;

    /// Next value of a named, persisted, monotonic counter (starts at 1).
    ///
    /// # Errors
    /// Backend I/O failures.
    fn next_sequence(&self, name: &str) -> Result<u64, StoreError>;

    /// Delete every entity in every collection. Sequence counters survive so
    /// identifiers are never reused.
    ///
    /// # Errors
    /// Backend I/O failures.
    fn clear(&self) -> Result<(), StoreError>;

    // -- typed API ----------------------------------------------------------

    /// Fetch one entity.
    ///
    /// # Errors
    /// Backend failures or an undecodable document.
    fn get<E: Entity>(&self, id: &str) -> Result<Option<E>, StoreError>
    where
        Self: Sized,
    {
        self.load(E::COLLECTION, id)?
            .map(|raw| decode::<E>(E::COLLECTION, id, &raw))
            .transpose()
    }

    /// Fetch one entity, failing with [`StoreError::NotFound`].
    ///
    /// # Errors
    /// `NotFound`, backend failures or an undecodable document.
    fn require<E: Entity>(&self, id: &str) -> Result<E, StoreError>
    where
        Self: Sized,
    {
        self.get(id)?.ok_or_else(|| StoreError::NotFound {
            collection: E::COLLECTION,
            id: id.to_owned(),
        })
    }

    /// Every entity of a collection matching `filter`, in id order.
    ///
    /// Entities deleted between listing and reading are skipped.
    ///
    /// # Errors
    /// Backend failures or an undecodable document.
    fn list<E: Entity>(&self, filter: impl Fn(&E) -> bool) -> Result<Vec<E>, StoreError>
    where
        Self: Sized,
    {
        let mut out = Vec::new();
        for id in self.ids(E::COLLECTION)? {
            if let Some(entity) = self.get::<E>(&id)?
                && filter(&entity)
            {
                out.push(entity);
            }
        }
        Ok(out)
    }

    /// Every entity of a collection.
    ///
    /// # Errors
    /// Backend failures or an undecodable document.
    fn all<E: Entity>(&self) -> Result<Vec<E>, StoreError>
    where
        Self: Sized,
    {
        self.list(|_: &E| true)
    }

    /// Create or replace an entity.
    ///
    /// # Errors
    /// `Integrity` if the record is inconsistent, or backend failures.
    fn put<E: Entity>(&self, entity: &E) -> Result<(), StoreError>
    where
        Self: Sized,
    {
        let raw = encode(entity)?;
        self.modify(E::COLLECTION, entity.key(), &mut |_| Ok(Write::Put(raw.clone())))
    }

    /// Create an entity, failing if the id is taken.
    ///
    /// # Errors
    /// `AlreadyExists`, `Integrity`, or backend failures.
    fn insert<E: Entity>(&self, entity: &E) -> Result<(), StoreError>
    where
        Self: Sized,
    {
        let raw = encode(entity)?;
        self.modify(E::COLLECTION, entity.key(), &mut |current| match current {
            Some(_) => Err(StoreError::AlreadyExists {
                collection: E::COLLECTION,
                id: entity.key().to_owned(),
            }),
            None => Ok(Write::Put(raw.clone())),
        })
    }

    /// Read-modify-write an entity under its lock and return the stored
    /// result.
    ///
    /// # Errors
    /// `NotFound`, `Integrity`, whatever `f` returns, or backend failures.
    fn update<E: Entity>(
        &self,
        id: &str,
        f: impl FnOnce(&mut E) -> Result<(), StoreError>,
    ) -> Result<E, StoreError>
    where
        Self: Sized,
    {
        let mut f = Some(f);
        let mut result: Option<E> = None;
        self.modify(E::COLLECTION, id, &mut |current| {
            let raw = current.ok_or_else(|| StoreError::NotFound {
                collection: E::COLLECTION,
                id: id.to_owned(),
            })?;
            let mut entity = decode::<E>(E::COLLECTION, id, raw)?;
            if let Some(apply) = f.take() {
                apply(&mut entity)?;
            }
            let encoded = encode(&entity)?;
            result = Some(entity);
            Ok(Write::Put(encoded))
        })?;
        result.ok_or_else(|| StoreError::NotFound {
            collection: E::COLLECTION,
            id: id.to_owned(),
        })
    }

    /// Compare-and-set a status: move `id` from `from` to `to` and apply
    /// `edit` in the same write.
    ///
    /// # Errors
    /// `InvalidTransition` if `from -> to` is not an edge, `StaleStatus` if
    /// the recorded status is not `from`, `Integrity` if the edited record
    /// is inconsistent; nothing is written in any of these cases.
    fn transition<E: Staged>(
        &self,
        id: &str,
        from: E::Status,
        to: E::Status,
        edit: impl FnOnce(&mut E),
    ) -> Result<E, StoreError>
    where
        Self: Sized,
    {
        if !E::can_transition(from, to) {
            return Err(StoreError::InvalidTransition {
                collection: E::COLLECTION,
                id: id.to_owned(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.update::<E>(id, |entity| {
            let actual = entity.status();
            if actual != from {
                return Err(StoreError::StaleStatus {
                    collection: E::COLLECTION,
                    id: id.to_owned(),
                    expected: from.to_string(),
                    actual: actual.to_string(),
                });
            }
            entity.set_status(to);
            edit(entity);
            Ok(())
        })
    }
}

/// Serialize an entity after checking its integrity.
fn encode<E: Entity>(entity: &E) -> Result<String, StoreError> {
    entity
        .check_integrity()
        .map_err(|detail| StoreError::Integrity {
            collection: E::COLLECTION,
            id: entity.key().to_owned(),
            detail,
        })?;
    serde_json::to_string_pretty(entity).map_err(|e| StoreError::Serialize {
        path: None,
        detail: format!("{}/{}: {e}", E::COLLECTION, entity.key()),
    })
}

/// One store shared by several in-process stages (or orchestrators).
impl<S: BusStore> BusStore for Arc<S> {
    fn load(&self, collection: Collection, id: &str) -> Result<Option<String>, StoreError> {
        (**self).load(collection, id)
    }

    fn ids(&self, collection: Collection) -> Result<Vec<String>, StoreError> {
        (**self).ids(collection)
    }

    fn modify(
        &self,
        collection: Collection,
        id: &str,
        f: &mut dyn FnMut(Option<&str>) -> Result<Write, StoreError>,
    ) -> Result<(), StoreError> {
        (**self).modify(collection, id, f)
    }

    fn remove(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        (**self).remove(collection, id)
    }

    fn next_sequence(&self, name: &str) -> Result<u64, StoreError> {
        (**self).next_sequence(name)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}

fn decode<E: Entity>(collection: Collection, id: &str, raw: &str) -> Result<E, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialize {
        path: None,
        detail: format!("{collection}/{id}: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
