//! In-process bus store.
//!
//! Holds serialized documents in a map behind a mutex, so it goes through
//! the same encode / integrity / decode path as the file store. Used by
//! tests and by callers embedding the bus in a single process.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{BusStore, Collection, StoreError, Write};

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<(Collection, String), String>,
    sequences: BTreeMap<String, u64>,
}

/// Mutex-guarded in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BusStore for MemoryStore {
    fn load(&self, collection: Collection, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner().docs.get(&(collection, id.to_owned())).cloned())
    }

    fn ids(&self, collection: Collection) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner()
            .docs
            .keys()
            .filter(|(c, _)| *c == collection)
            .map(|(_, id)| id.clone())
            .collect())
    }

    fn modify(
        &self,
        collection: Collection,
        id: &str,
        f: &mut dyn FnMut(Option<&str>) -> Result<Write, StoreError>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner();
        let key = (collection, id.to_owned());
        let decision = f(inner.docs.get(&key).map(String::as_str))?;
        if let Write::Put(raw) = decision {
            inner.docs.insert(key, raw);
        }
        Ok(())
    }

    fn remove(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner()
            .docs
            .remove(&(collection, id.to_owned()))
            .is_some())
    }

    fn next_sequence(&self, name: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner();
        let counter = inner.sequences.entry(name.to_owned()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.inner().docs.clear();
        Ok(())
    }
}
