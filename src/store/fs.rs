//! File-backed bus store.
//!
//! Layout under the bus root:
//!
//! ```text
//! <root>/
//!   bus.json                 manifest written by `init`
//!   diffs/<id>.json          one pretty-printed document per entity
//!   conflicts/ batches/ commits/ work/ inbox/
//!   sequences/<name>         monotonic counters
//!   locks/<collection>/<id>.lock
//! ```
//!
//! Every write goes to a temp file in the target directory, is fsynced and
//! renamed over the target, so readers never observe a torn document.
//! Read-compare-write sequences hold an exclusive `fs4` lock on the entity's
//! lock file for their whole duration; the lock is released when the file
//! handle drops.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BusStore, Collection, StoreError, Write};
use crate::model::types::unix_now;

const MANIFEST_FILE: &str = "bus.json";
const MANIFEST_VERSION: u32 = 1;

/// Contents of `bus.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusManifest {
    /// Layout version.
    pub version: u32,
    /// Unix timestamp (seconds) of `init`.
    pub created_at: u64,
}

/// Durable store rooted at a directory.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating directories as needed) a store at `root`.
    ///
    /// # Errors
    /// Returns an error if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for collection in Collection::ALL {
            let dir = root.join(collection.name());
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
            let locks = root.join("locks").join(collection.name());
            fs::create_dir_all(&locks).map_err(|e| StoreError::io(&locks, e))?;
        }
        let seq = root.join("sequences");
        fs::create_dir_all(&seq).map_err(|e| StoreError::io(&seq, e))?;
        Ok(Self { root })
    }

    /// Open a store and write its manifest if it has none yet.
    ///
    /// Returns the manifest on disk and whether this call created it.
    ///
    /// # Errors
    /// I/O or serialization failures.
    pub fn init(root: impl Into<PathBuf>) -> Result<(Self, BusManifest, bool), StoreError> {
        let store = Self::open(root)?;
        if let Some(existing) = store.manifest()? {
            return Ok((store, existing, false));
        }
        let manifest = BusManifest {
            version: MANIFEST_VERSION,
            created_at: unix_now(),
        };
        let json = serde_json::to_string_pretty(&manifest).map_err(|e| StoreError::Serialize {
            path: None,
            detail: e.to_string(),
        })?;
        write_atomic(&store.root.join(MANIFEST_FILE), &json)?;
        Ok((store, manifest, true))
    }

    /// Read `bus.json`, if present.
    ///
    /// # Errors
    /// I/O failures or a malformed manifest.
    pub fn manifest(&self) -> Result<Option<BusManifest>, StoreError> {
        let path = self.root.join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialize {
                    path: Some(path),
                    detail: e.to_string(),
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// The bus root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, collection: Collection, id: &str) -> PathBuf {
        self.root.join(collection.name()).join(format!("{id}.json"))
    }

    fn lock_path(&self, collection: Collection, id: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(collection.name())
            .join(format!("{id}.lock"))
    }

    fn lock(&self, path: &Path) -> Result<File, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| StoreError::io(path, e))?;
        Ok(file)
    }
}

impl BusStore for FsStore {
    fn load(&self, collection: Collection, id: &str) -> Result<Option<String>, StoreError> {
        let path = self.doc_path(collection, id);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn ids(&self, collection: Collection) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(collection.name());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn modify(
        &self,
        collection: Collection,
        id: &str,
        f: &mut dyn FnMut(Option<&str>) -> Result<Write, StoreError>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock(&self.lock_path(collection, id))?;
        let current = self.load(collection, id)?;
        match f(current.as_deref())? {
            Write::Keep => Ok(()),
            Write::Put(raw) => {
                debug!(%collection, id, "write");
                write_atomic(&self.doc_path(collection, id), &raw)
            }
        }
    }

    fn remove(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock(&self.lock_path(collection, id))?;
        let path = self.doc_path(collection, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn next_sequence(&self, name: &str) -> Result<u64, StoreError> {
        let _guard = self.lock(&self.root.join("locks").join(format!("seq-{name}.lock")))?;
        let path = self.root.join("sequences").join(name);
        let current = match fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|e| StoreError::Serialize {
                path: Some(path.clone()),
                detail: format!("corrupt sequence counter: {e}"),
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let next = current + 1;
        write_atomic(&path, &next.to_string())?;
        Ok(next)
    }

    fn clear(&self) -> Result<(), StoreError> {
        for collection in Collection::ALL {
            for id in self.ids(collection)? {
                self.remove(collection, &id)?;
            }
        }
        Ok(())
    }
}

/// Write `contents` to `path` atomically: temp file, fsync, rename.
///
/// # Errors
/// Returns an error on any I/O failure; the target is left untouched.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    let dir = path.parent().ok_or_else(|| StoreError::Io {
        path: Some(path.to_owned()),
        source: std::io::Error::new(ErrorKind::InvalidInput, "no parent directory"),
    })?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("doc");
    let tmp_path = dir.join(format!(".{file_name}.{}.tmp", std::process::id()));

    let mut file = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| StoreError::io(&tmp_path, e))?;
    file.sync_all().map_err(|e| StoreError::io(&tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
