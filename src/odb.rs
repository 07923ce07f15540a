//! content-addressed object database over a byte-stream backend

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::{Backend, LocalBackend};
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashAlgorithm, HashInfo};
use crate::tree::Tree;

/// ingest options for [`ObjectDb::add_path`]
#[derive(Clone, Copy, Debug, Default)]
pub struct AddOptions {
    /// re-hash the written bytes and reject mismatches
    pub verify: bool,
    /// link the source into the store instead of copying when possible
    pub hardlink: bool,
}

/// a content-addressed store
///
/// objects live at `<hash[..2]>/<hash[2..]>` whether they hold file bytes or
/// a tree, so identical bytes are one object. objects are write-once: adding
/// an existing hash is a no-op.
#[derive(Clone)]
pub struct ObjectDb {
    backend: Arc<dyn Backend>,
    algorithm: HashAlgorithm,
}

impl ObjectDb {
    pub fn new(backend: Arc<dyn Backend>, algorithm: HashAlgorithm) -> Self {
        Self { backend, algorithm }
    }

    /// object database in a local directory
    pub fn local(root: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Result<Self> {
        Ok(Self::new(Arc::new(LocalBackend::open(root)?), algorithm))
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// backend location for a hash
    pub fn location(&self, hash: &HashInfo) -> String {
        let (dir, file) = hash.to_path_components();
        format!("{}/{}", dir, file)
    }

    /// on-disk path of an object, if the backend is local
    pub fn local_path(&self, hash: &HashInfo) -> Option<PathBuf> {
        self.backend.local_path(&self.location(hash))
    }

    pub fn exists(&self, hash: &HashInfo) -> bool {
        self.backend.exists(&self.location(hash))
    }

    /// readable handle to an object
    ///
    /// tree objects are parsed before the handle is returned, so a handle to
    /// a directory always refers to a well-formed tree.
    pub fn get(&self, hash: &HashInfo) -> Result<ObjectHandle> {
        if !self.exists(hash) {
            return Err(Error::ObjectNotFound(hash.clone()));
        }
        let handle = ObjectHandle {
            hash: hash.clone(),
            location: self.location(hash),
            backend: Arc::clone(&self.backend),
        };
        if hash.is_dir {
            Tree::from_bytes(hash, &handle.read()?)?;
        }
        Ok(handle)
    }

    /// read a whole object into memory
    pub fn read(&self, hash: &HashInfo) -> Result<Vec<u8>> {
        let mut reader = self.open(hash)?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| Error::io(self.location(hash), e))?;
        Ok(buf)
    }

    fn open(&self, hash: &HashInfo) -> Result<Box<dyn Read + Send>> {
        self.backend.open_read(&self.location(hash)).map_err(|e| {
            if e.is_not_found() {
                Error::ObjectNotFound(hash.clone())
            } else {
                e
            }
        })
    }

    /// ingest a stream under a pre-computed hash
    pub fn add_reader(&self, reader: &mut dyn Read, hash: &HashInfo, verify: bool) -> Result<()> {
        let location = self.location(hash);
        if self.backend.exists(&location) {
            tracing::trace!(hash = %hash, "object already stored");
            return Ok(());
        }

        let mut stream = self.backend.open_write(&location)?;
        let mut digester = verify.then(|| hash.algorithm.digester());
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(|e| Error::io(&location, e))?;
            if n == 0 {
                break;
            }
            if let Some(d) = digester.as_mut() {
                d.update(&buf[..n]);
            }
            stream
                .write_all(&buf[..n])
                .map_err(|e| Error::io(&location, e))?;
        }

        if let Some(d) = digester {
            let actual = d.finalize();
            if actual != hash.value {
                // stream is dropped uncommitted, nothing becomes visible
                return Err(Error::Integrity {
                    expected: hash.clone(),
                    actual,
                });
            }
        }

        stream.commit()?;
        tracing::debug!(hash = %hash, backend = %self.backend.describe(), "object added");
        Ok(())
    }

    /// ingest a file under a pre-computed hash
    pub fn add_path(&self, path: &Path, hash: &HashInfo, opts: AddOptions) -> Result<()> {
        if self.exists(hash) {
            return Ok(());
        }

        if opts.hardlink {
            if opts.verify {
                let mut file = File::open(path).with_path(path)?;
                let actual = hash
                    .algorithm
                    .digest_reader(&mut file)
                    .with_path(path)?;
                if actual != hash.value {
                    return Err(Error::Integrity {
                        expected: hash.clone(),
                        actual,
                    });
                }
            }

            match self.backend.link_from(path, &self.location(hash)) {
                Ok(()) => return Ok(()),
                Err(Error::UnsupportedLinkType(_)) => {
                    tracing::trace!(path = %path.display(), "hardlink ingest unavailable, copying");
                }
                Err(e) => return Err(e),
            }
        }

        let mut file = File::open(path).with_path(path)?;
        self.add_reader(&mut file, hash, opts.verify)
    }

    /// ingest an in-memory buffer under a pre-computed hash
    pub fn add_bytes(&self, bytes: &[u8], hash: &HashInfo) -> Result<()> {
        self.add_reader(&mut Cursor::new(bytes), hash, false)
    }

    /// hash a buffer with this store's algorithm and ingest it
    pub fn add_content(&self, bytes: &[u8]) -> Result<HashInfo> {
        let hash = HashInfo::file(self.algorithm, self.algorithm.digest(bytes));
        self.add_bytes(bytes, &hash)?;
        Ok(hash)
    }

    /// hash a file on disk with this store's algorithm
    pub fn hash_file(&self, path: &Path) -> Result<HashInfo> {
        let mut file = File::open(path).with_path(path)?;
        let value = self.algorithm.digest_reader(&mut file).with_path(path)?;
        Ok(HashInfo::file(self.algorithm, value))
    }

    /// copy one object out of another store
    pub fn copy_from(&self, src: &ObjectDb, hash: &HashInfo, opts: AddOptions) -> Result<()> {
        if self.exists(hash) {
            return Ok(());
        }
        match src.local_path(hash) {
            Some(path) if opts.hardlink => {
                if !path.exists() {
                    return Err(Error::ObjectNotFound(hash.clone()));
                }
                self.add_path(&path, hash, opts)
            }
            _ => {
                let mut reader = src.open(hash)?;
                self.add_reader(&mut reader, hash, opts.verify)
            }
        }
    }

    /// every object in the store
    ///
    /// the layout does not record which objects are trees, so all of them
    /// come back as file hashes.
    pub fn hashes(&self) -> Result<Vec<HashInfo>> {
        let mut hashes = Vec::new();
        for location in self.backend.list("")? {
            let Some((dir, rest)) = location.split_once('/') else {
                continue;
            };
            match HashInfo::parse(self.algorithm, &format!("{}{}", dir, rest), false) {
                Ok(h) => hashes.push(h),
                Err(_) => tracing::debug!(%location, "ignoring non-object location"),
            }
        }
        Ok(hashes)
    }
}

impl fmt::Debug for ObjectDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDb")
            .field("backend", &self.backend.describe())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// readable reference to a stored object
pub struct ObjectHandle {
    hash: HashInfo,
    location: String,
    backend: Arc<dyn Backend>,
}

impl ObjectHandle {
    pub fn hash(&self) -> &HashInfo {
        &self.hash
    }

    /// on-disk path, when the backend has one
    pub fn path(&self) -> Option<PathBuf> {
        self.backend.local_path(&self.location)
    }

    /// stream the object's bytes
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        self.backend.open_read(&self.location)
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open()?
            .read_to_end(&mut buf)
            .map_err(|e| Error::io(&self.location, e))?;
        Ok(buf)
    }

    /// copy the object's bytes into a writer, returning the byte count
    pub fn read_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<u64> {
        let mut reader = self.open()?;
        io::copy(&mut reader, writer).map_err(|e| Error::io(&self.location, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::tree::TreeEntry;
    use tempfile::tempdir;

    fn memory_odb() -> (MemoryBackend, ObjectDb) {
        let backend = MemoryBackend::new();
        let odb = ObjectDb::new(Arc::new(backend.clone()), HashAlgorithm::Sha256);
        (backend, odb)
    }

    #[test]
    fn test_add_and_get() {
        let (_backend, odb) = memory_odb();
        let hash = odb.add_content(b"hello").unwrap();

        assert!(odb.exists(&hash));
        let handle = odb.get(&hash).unwrap();
        assert_eq!(handle.read().unwrap(), b"hello");
        // content addressing
        assert_eq!(HashAlgorithm::Sha256.digest(&handle.read().unwrap()), hash.value);
    }

    #[test]
    fn test_add_is_idempotent() {
        let (backend, odb) = memory_odb();
        let h1 = odb.add_content(b"same").unwrap();
        let h2 = odb.add_content(b"same").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(backend.len(), 1);
        assert_eq!(odb.read(&h1).unwrap(), b"same");
    }

    #[test]
    fn test_get_missing() {
        let (_backend, odb) = memory_odb();
        let hash = HashInfo::file(HashAlgorithm::Sha256, "00".repeat(32));
        assert!(matches!(odb.get(&hash), Err(Error::ObjectNotFound(_))));
        assert!(matches!(odb.read(&hash), Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_verify_rejects_mismatch() {
        let (backend, odb) = memory_odb();
        let wrong = HashInfo::file(HashAlgorithm::Sha256, HashAlgorithm::Sha256.digest(b"other"));
        let result = odb.add_reader(&mut Cursor::new(b"hello".to_vec()), &wrong, true);

        assert!(matches!(result, Err(Error::Integrity { .. })));
        assert!(!odb.exists(&wrong));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_get_rejects_malformed_tree() {
        let (backend, odb) = memory_odb();
        let hash = HashInfo::dir(HashAlgorithm::Sha256, "ab".repeat(32));
        backend.put_raw(&odb.location(&hash), b"not cbor at all".to_vec());

        assert!(matches!(odb.get(&hash), Err(Error::ObjectFormat { .. })));
    }

    #[test]
    fn test_location_layout() {
        let (_backend, odb) = memory_odb();
        let file = HashInfo::file(HashAlgorithm::Sha256, "ab".repeat(32));
        let dir = HashInfo::dir(HashAlgorithm::Sha256, "ab".repeat(32));
        assert_eq!(odb.location(&file), format!("ab/{}", "ab".repeat(31)));
        assert_eq!(odb.location(&dir), odb.location(&file));
    }

    #[test]
    fn test_file_with_tree_bytes_is_the_tree_object() {
        let (backend, odb) = memory_odb();
        let leaf = odb.add_content(b"leaf").unwrap();
        let tree = Tree::new(vec![TreeEntry::new("leaf", leaf, None)]).unwrap();
        let tree_hash = tree.save(&odb).unwrap();

        let as_file = odb.add_content(&tree.to_bytes().unwrap()).unwrap();
        assert_eq!(as_file, tree_hash);
        assert!(!as_file.is_dir);
        assert_eq!(backend.len(), 2);
        assert_eq!(odb.read(&as_file).unwrap(), tree.to_bytes().unwrap());
        assert!(odb.get(&tree_hash).is_ok());
    }

    #[test]
    fn test_hashes_lists_files_and_trees() {
        let (_backend, odb) = memory_odb();
        let file = odb.add_content(b"leaf").unwrap();
        let tree = Tree::new(vec![TreeEntry::new("leaf.txt", file.clone(), None)]).unwrap();
        let tree_hash = tree.save(&odb).unwrap();

        let mut hashes = odb.hashes().unwrap();
        hashes.sort();
        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains(&tree_hash));
        assert!(hashes.contains(&file));
        assert!(hashes.iter().all(|h| !h.is_dir));
    }

    #[test]
    fn test_add_path_local() {
        let dir = tempdir().unwrap();
        let odb = ObjectDb::local(dir.path().join("odb"), HashAlgorithm::Sha256).unwrap();
        let source = dir.path().join("data.bin");
        std::fs::write(&source, b"file content").unwrap();

        let hash = odb.hash_file(&source).unwrap();
        odb.add_path(&source, &hash, AddOptions { verify: true, hardlink: false }).unwrap();

        let path = odb.local_path(&hash).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"file content");
        // source stays writable when copied
        assert!(!std::fs::metadata(&source).unwrap().permissions().readonly());
    }

    #[test]
    fn test_add_path_hardlink() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempdir().unwrap();
        let odb = ObjectDb::local(dir.path().join("odb"), HashAlgorithm::Sha256).unwrap();
        let source = dir.path().join("data.bin");
        std::fs::write(&source, b"linked content").unwrap();

        let hash = odb.hash_file(&source).unwrap();
        odb.add_path(&source, &hash, AddOptions { verify: true, hardlink: true }).unwrap();

        let stored = odb.local_path(&hash).unwrap();
        assert_eq!(
            std::fs::metadata(&source).unwrap().ino(),
            std::fs::metadata(&stored).unwrap().ino()
        );
        assert!(std::fs::metadata(&source).unwrap().permissions().readonly());
    }

    #[test]
    fn test_copy_from_between_backends() {
        let dir = tempdir().unwrap();
        let local = ObjectDb::local(dir.path().join("odb"), HashAlgorithm::Sha256).unwrap();
        let (_backend, memory) = memory_odb();

        let hash = local.add_content(b"moving").unwrap();
        memory.copy_from(&local, &hash, AddOptions { verify: true, hardlink: false }).unwrap();
        assert_eq!(memory.read(&hash).unwrap(), b"moving");

        let absent = HashInfo::file(HashAlgorithm::Sha256, "11".repeat(32));
        let err = memory.copy_from(&local, &absent, AddOptions::default()).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }
}
