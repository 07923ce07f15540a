//! persistent cache of fully transferred directories

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;
use crate::hash::HashInfo;
use crate::persist::{load_cbor, save_cbor};

type Entries = BTreeMap<String, BTreeSet<String>>;

/// maps a directory hash to the file hashes it contains
///
/// an entry only exists once a directory and every file under it were
/// transferred. it is a cache: a missing entry means "load the tree".
///
/// writes made during a transfer are staged and only become part of the
/// index on [`Index::commit_staged`].
#[derive(Debug)]
pub struct Index {
    path: Option<PathBuf>,
    inner: Mutex<IndexData>,
}

#[derive(Debug, Default)]
struct IndexData {
    committed: Entries,
    staged: Entries,
}

impl Index {
    /// open a persisted index, starting empty if the file doesn't exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let committed = load_cbor::<Entries>(&path)?.unwrap_or_default();
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(IndexData {
                committed,
                staged: Entries::new(),
            }),
        })
    }

    /// index that lives only as long as this value
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(IndexData::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// file hashes recorded for a directory
    pub fn get(&self, dir: &HashInfo) -> Option<BTreeSet<String>> {
        self.inner.lock().committed.get(&dir.value).cloned()
    }

    pub fn contains(&self, dir: &HashInfo) -> bool {
        self.inner.lock().committed.contains_key(&dir.value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().committed.is_empty()
    }

    /// record a directory as pending until the transfer finishes
    pub fn stage<'a>(&self, dir: &HashInfo, files: impl IntoIterator<Item = &'a HashInfo>) {
        let files = files.into_iter().map(|h| h.value.clone()).collect();
        self.inner.lock().staged.insert(dir.value.clone(), files);
    }

    /// number of staged directories
    pub fn staged(&self) -> usize {
        self.inner.lock().staged.len()
    }

    /// fold staged entries into the index and persist it
    pub fn commit_staged(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut inner.staged);
        inner.committed.extend(staged);
        self.persist(&inner.committed)
    }

    /// drop staged entries
    pub fn discard_staged(&self) {
        let dropped = std::mem::take(&mut self.inner.lock().staged);
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "discarded staged index entries");
        }
    }

    /// point upsert, persisted immediately
    pub fn update<'a>(&self, dir: &HashInfo, files: impl IntoIterator<Item = &'a HashInfo>) -> Result<()> {
        let files = files.into_iter().map(|h| h.value.clone()).collect();
        let mut inner = self.inner.lock();
        inner.committed.insert(dir.value.clone(), files);
        self.persist(&inner.committed)
    }

    /// forget everything, staged and committed
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.committed.clear();
        inner.staged.clear();
        self.persist(&inner.committed)
    }

    fn persist(&self, entries: &Entries) -> Result<()> {
        match &self.path {
            Some(path) => save_cbor(path, entries),
            None => Ok(()),
        }
    }
}
