use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Backend, WriteStream};
use crate::error::{Error, Result};

type Locations = Arc<RwLock<BTreeMap<String, Arc<Vec<u8>>>>>;

/// in-memory storage
///
/// intended for tests and embedding. values are shared on read, never copied.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    locations: Locations,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of stored locations
    pub fn len(&self) -> usize {
        self.locations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.read().is_empty()
    }

    /// overwrite a location in place, bypassing the write stream
    ///
    /// only useful to simulate corruption.
    pub fn put_raw(&self, location: &str, bytes: Vec<u8>) {
        self.locations
            .write()
            .insert(location.to_string(), Arc::new(bytes));
    }
}

impl Backend for MemoryBackend {
    fn open_read(&self, location: &str) -> Result<Box<dyn Read + Send>> {
        let bytes = self.locations.read().get(location).cloned().ok_or_else(|| {
            Error::io(location, io::Error::from(io::ErrorKind::NotFound))
        })?;
        Ok(Box::new(Cursor::new(SharedBytes(bytes))))
    }

    fn open_write(&self, location: &str) -> Result<Box<dyn WriteStream>> {
        Ok(Box::new(MemoryWriteStream {
            locations: Arc::clone(&self.locations),
            location: location.to_string(),
            buf: Vec::new(),
        }))
    }

    fn exists(&self, location: &str) -> bool {
        self.locations.read().contains_key(location)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .locations
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn remove(&self, location: &str) -> Result<()> {
        self.locations.write().remove(location);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

struct MemoryWriteStream {
    locations: Locations,
    location: String,
    buf: Vec<u8>,
}

impl Write for MemoryWriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteStream for MemoryWriteStream {
    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryWriteStream {
            locations,
            location,
            buf,
        } = *self;
        locations.write().insert(location, Arc::new(buf));
        Ok(())
    }
}
