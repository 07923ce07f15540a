#![allow(dead_code)]

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use hoard::{Backend, Error, HashAlgorithm, HashInfo, MemoryBackend, ObjectDb, Result, WriteStream};

/// backend that refuses writes to chosen locations
pub struct FaultyBackend {
    inner: MemoryBackend,
    failing: Mutex<HashSet<String>>,
    exhausted: Mutex<HashSet<String>>,
    writes: Mutex<Vec<String>>,
}

impl FaultyBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            exhausted: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_writes_to(&self, location: impl Into<String>) {
        self.failing.lock().insert(location.into());
    }

    /// writes to `location` fail as if the process ran out of descriptors
    pub fn exhaust_at(&self, location: impl Into<String>) {
        self.exhausted.lock().insert(location.into());
    }

    /// locations a write was opened for, in order
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }
}

impl Backend for FaultyBackend {
    fn open_read(&self, location: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.open_read(location)
    }

    fn open_write(&self, location: &str) -> Result<Box<dyn WriteStream>> {
        self.writes.lock().push(location.to_string());
        if self.exhausted.lock().contains(location) {
            return Err(Error::io(location, std::io::Error::from_raw_os_error(nix::libc::EMFILE)));
        }
        if self.failing.lock().contains(location) {
            return Err(Error::Io {
                path: PathBuf::from(location),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"),
            });
        }
        self.inner.open_write(location)
    }

    fn exists(&self, location: &str) -> bool {
        self.inner.exists(location)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn remove(&self, location: &str) -> Result<()> {
        self.inner.remove(location)
    }

    fn local_path(&self, location: &str) -> Option<PathBuf> {
        self.inner.local_path(location)
    }

    fn link_from(&self, source: &Path, location: &str) -> Result<()> {
        self.inner.link_from(source, location)
    }

    fn describe(&self) -> String {
        format!("faulty({})", self.inner.describe())
    }
}

pub fn memory_odb() -> (MemoryBackend, ObjectDb) {
    let backend = MemoryBackend::new();
    let odb = ObjectDb::new(Arc::new(backend.clone()), HashAlgorithm::Sha256);
    (backend, odb)
}

pub fn faulty_odb() -> (Arc<FaultyBackend>, ObjectDb) {
    let backend = Arc::new(FaultyBackend::new(MemoryBackend::new()));
    let odb = ObjectDb::new(backend.clone(), HashAlgorithm::Sha256);
    (backend, odb)
}

pub fn sha256(content: &[u8]) -> HashInfo {
    HashInfo::file(HashAlgorithm::Sha256, HashAlgorithm::Sha256.digest(content))
}
