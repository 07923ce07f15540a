//! persistent cache of file identity -> content hash

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::hash::HashInfo;
use crate::persist::{load_cbor, save_cbor};

/// what a file looked like when its hash was recorded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub hash: HashInfo,
}

impl StateEntry {
    fn new(meta: &fs::Metadata, hash: &HashInfo) -> Self {
        Self {
            size: meta.len(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            hash: hash.clone(),
        }
    }

    fn matches(&self, meta: &fs::Metadata) -> bool {
        self.size == meta.len() && self.mtime == meta.mtime() && self.mtime_nsec == meta.mtime_nsec()
    }
}

/// maps (path, size, mtime) to the hash last seen for that file
///
/// an entry is only trusted while size and mtime on disk match exactly;
/// a stale entry is dropped the moment it is looked up.
#[derive(Debug)]
pub struct State {
    path: Option<PathBuf>,
    inner: Mutex<StateData>,
}

#[derive(Debug, Default)]
struct StateData {
    entries: HashMap<PathBuf, StateEntry>,
    dirty: bool,
}

impl State {
    /// open a persisted state file, starting empty if it doesn't exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = load_cbor(&path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(StateData {
                entries,
                dirty: false,
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(StateData::default()),
        }
    }

    /// hash recorded for `path`, if the file is unchanged since
    pub fn get(&self, path: &Path) -> Option<HashInfo> {
        let meta = fs::metadata(path).ok();

        let mut inner = self.inner.lock();
        let entry = inner.entries.get(path)?;
        match meta {
            Some(meta) if entry.matches(&meta) => Some(entry.hash.clone()),
            _ => {
                tracing::trace!(path = %path.display(), "stale state entry purged");
                inner.entries.remove(path);
                inner.dirty = true;
                None
            }
        }
    }

    /// record the hash of `path` as it is on disk right now
    pub fn save(&self, path: &Path, hash: &HashInfo) -> Result<()> {
        let meta = fs::metadata(path).with_path(path)?;
        self.insert(path, StateEntry::new(&meta, hash));
        Ok(())
    }

    /// record `hash` for `path` only if the file still looks like `before`
    ///
    /// `before` is the metadata taken ahead of hashing. returns false, and
    /// records nothing, when the file changed in between.
    pub fn save_if_unchanged(&self, path: &Path, hash: &HashInfo, before: &fs::Metadata) -> Result<bool> {
        let entry = StateEntry::new(before, hash);
        let now = fs::metadata(path).with_path(path)?;
        if !entry.matches(&now) {
            return Ok(false);
        }
        self.insert(path, entry);
        Ok(true)
    }

    fn insert(&self, path: &Path, entry: StateEntry) {
        let mut inner = self.inner.lock();
        inner.entries.insert(path.to_path_buf(), entry);
        inner.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// drop every entry, on disk as well
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.dirty = true;
        self.write(&mut inner)
    }

    /// persist pending changes
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write(&mut inner)
    }

    fn write(&self, inner: &mut StateData) -> Result<()> {
        if !inner.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            save_cbor(path, &inner.entries)?;
        }
        inner.dirty = false;
        Ok(())
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("failed to persist state: {}", e);
        }
    }
}
