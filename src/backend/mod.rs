//! byte-stream storage backends underneath an object database

mod local;
mod memory;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::link::LinkType;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

/// minimal storage contract an object database is built on
///
/// locations are `/`-separated relative keys chosen by the object database.
/// implementations must be safe to share between worker threads.
pub trait Backend: Send + Sync {
    /// open a location for reading
    fn open_read(&self, location: &str) -> Result<Box<dyn Read + Send>>;

    /// open a location for writing
    ///
    /// nothing becomes visible at `location` until the stream is committed.
    fn open_write(&self, location: &str) -> Result<Box<dyn WriteStream>>;

    fn exists(&self, location: &str) -> bool;

    /// every stored location starting with `prefix`
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn remove(&self, location: &str) -> Result<()>;

    /// on-disk path of a location, for backends that have one
    fn local_path(&self, _location: &str) -> Option<PathBuf> {
        None
    }

    /// store `source` at `location` by hardlinking it instead of copying bytes
    fn link_from(&self, _source: &Path, _location: &str) -> Result<()> {
        Err(Error::UnsupportedLinkType(LinkType::Hardlink))
    }

    /// short human readable description for logs
    fn describe(&self) -> String;
}

/// write side of a backend location
pub trait WriteStream: Write + Send {
    /// make the written bytes visible at the target location
    fn commit(self: Box<Self>) -> Result<()>;
}
