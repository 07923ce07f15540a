//! materializing a tree into a working directory

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::HashInfo;
use crate::link::{self, device_of, LinkCache, LinkType};
use crate::odb::{ObjectDb, ObjectHandle};
use crate::pool::{default_jobs, WorkerPool};
use crate::state::State;
use crate::tree::{FlatEntry, TreeArena};

/// options for checkout
#[derive(Clone, Debug)]
pub struct CheckoutOptions {
    /// strategies to try, in order
    pub link_types: Vec<LinkType>,
    pub jobs: usize,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        Self {
            link_types: LinkType::PREFERENCE.to_vec(),
            jobs: default_jobs(),
        }
    }
}

/// what a checkout did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckoutStats {
    pub reflinked: usize,
    pub hardlinked: usize,
    pub symlinked: usize,
    pub copied: usize,
    /// already up to date according to state
    pub skipped: usize,
}

impl CheckoutStats {
    /// paths written
    pub fn written(&self) -> usize {
        self.reflinked + self.hardlinked + self.symlinked + self.copied
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Skipped => self.skipped += 1,
            Outcome::Linked(LinkType::Reflink) => self.reflinked += 1,
            Outcome::Linked(LinkType::Hardlink) => self.hardlinked += 1,
            Outcome::Linked(LinkType::Symlink) => self.symlinked += 1,
            Outcome::Linked(LinkType::Copy) => self.copied += 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Outcome {
    Skipped,
    Linked(LinkType),
}

/// writes the files of a tree out of an object database
pub struct Checkout<'a> {
    odb: &'a ObjectDb,
    state: &'a State,
    options: CheckoutOptions,
    links: LinkCache,
}

impl<'a> Checkout<'a> {
    pub fn new(odb: &'a ObjectDb, state: &'a State, options: CheckoutOptions) -> Self {
        Self {
            odb,
            state,
            options,
            links: LinkCache::new(),
        }
    }

    /// start from an existing set of known link capabilities
    pub fn with_link_cache(mut self, links: LinkCache) -> Self {
        self.links = links;
        self
    }

    pub fn link_cache(&self) -> &LinkCache {
        &self.links
    }

    /// make `dest` contain every file of `tree`
    ///
    /// files that state says already hold the right content are left alone.
    /// paths that could not be written are collected into
    /// [`Error::Checkout`] after every other path was attempted.
    pub fn checkout(&self, dest: &Path, tree: &HashInfo) -> Result<CheckoutStats> {
        let mut arena = TreeArena::new();
        let entries = arena.flatten(&[self.odb], tree)?;

        fs::create_dir_all(dest).with_path(dest)?;
        let pool = WorkerPool::new(self.options.jobs)?;

        let results = pool.install(|| {
            entries
                .par_iter()
                .map(|entry| {
                    let path = dest.join(&entry.path);
                    match self.entry(&path, entry) {
                        Ok(outcome) => Ok(Ok(outcome)),
                        Err(e) if e.is_fatal() => Err(e),
                        Err(e) => {
                            tracing::warn!(path = %path.display(), "checkout failed: {}", e);
                            Ok(Err(path))
                        }
                    }
                })
                .collect::<Result<Vec<_>>>()
        });
        // persist what was written before giving up on a fatal error
        let flushed = self.state.flush();
        let results = results?;
        flushed?;

        let mut stats = CheckoutStats::default();
        let mut failed: Vec<PathBuf> = Vec::new();
        for result in results {
            match result {
                Ok(outcome) => stats.record(outcome),
                Err(path) => failed.push(path),
            }
        }

        if !failed.is_empty() {
            return Err(Error::Checkout {
                failed: failed.len(),
                paths: failed,
            });
        }

        tracing::info!(
            tree = %tree,
            written = stats.written(),
            skipped = stats.skipped,
            "checkout complete"
        );
        Ok(stats)
    }

    fn entry(&self, path: &Path, entry: &FlatEntry) -> Result<Outcome> {
        if self.state.get(path).as_ref() == Some(&entry.hash) {
            return Ok(Outcome::Skipped);
        }

        let object = self.odb.get(&entry.hash)?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).with_path(parent)?;
        remove_existing(path)?;

        let link = self.materialize(&object, path, parent, entry.mode)?;
        self.state.save(path, &entry.hash)?;
        tracing::debug!(path = %path.display(), %link, "checked out");
        Ok(Outcome::Linked(link))
    }

    /// first strategy that works, in preference order
    fn materialize(&self, object: &ObjectHandle, path: &Path, parent: &Path, mode: Option<u32>) -> Result<LinkType> {
        let src = object.path();
        let devices = match &src {
            Some(src) => Some((device_of(src)?, device_of(parent)?)),
            None => None,
        };

        for &link in &self.options.link_types {
            let attempt = if !link.needs_local_object() {
                match src.as_deref() {
                    Some(src) => link::copy(src, path),
                    None => stream_copy(object, path),
                }
            } else if let (Some(src), Some((src_dev, dst_dev))) = (src.as_deref(), devices) {
                if self.links.lookup(src_dev, dst_dev, link) == Some(false) {
                    continue;
                }
                let attempt = match link {
                    LinkType::Reflink => link::reflink(src, path),
                    LinkType::Hardlink => link::hardlink(src, path),
                    _ => link::symlink_to(src, path),
                };
                match &attempt {
                    Ok(()) => self.links.record(src_dev, dst_dev, link, true),
                    Err(Error::UnsupportedLinkType(_)) => self.links.record(src_dev, dst_dev, link, false),
                    Err(_) => {}
                }
                attempt
            } else {
                continue;
            };

            match attempt {
                Ok(()) => {
                    // links share the object's inode, only private copies get a mode
                    if matches!(link, LinkType::Reflink | LinkType::Copy) {
                        link::set_mode(path, mode)?;
                    }
                    return Ok(link);
                }
                Err(Error::UnsupportedLinkType(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::UnsupportedLinkType(
            self.options.link_types.last().copied().unwrap_or(LinkType::Copy),
        ))
    }
}

/// check out `tree` into `dest` with a fresh capability cache
pub fn checkout(
    odb: &ObjectDb,
    state: &State,
    dest: &Path,
    tree: &HashInfo,
    options: CheckoutOptions,
) -> Result<CheckoutStats> {
    Checkout::new(odb, state, options).checkout(dest, tree)
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).with_path(path),
        Ok(_) => fs::remove_file(path).with_path(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn stream_copy(object: &ObjectHandle, path: &Path) -> Result<()> {
    let file = File::create(path).with_path(path)?;
    let mut writer = BufWriter::new(file);
    object.read_to(&mut writer)?;
    writer.flush().with_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::hash::HashAlgorithm;
    use crate::tree::{Tree, TreeEntry};
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample(odb: &ObjectDb) -> (HashInfo, HashInfo, HashInfo) {
        let a = odb.add_content(b"alpha").unwrap();
        let b = odb.add_content(b"beta").unwrap();
        let sub = Tree::new(vec![TreeEntry::new("b.txt", b.clone(), Some(0o600))])
            .unwrap()
            .save(odb)
            .unwrap();
        let root = Tree::new(vec![
            TreeEntry::new("a.txt", a.clone(), None),
            TreeEntry::new("sub", sub, None),
        ])
        .unwrap()
        .save(odb)
        .unwrap();
        (root, a, b)
    }

    fn options(link_types: &[LinkType]) -> CheckoutOptions {
        CheckoutOptions {
            link_types: link_types.to_vec(),
            jobs: 2,
        }
    }

    #[test]
    fn test_copy_checkout_and_modes() {
        let dir = tempdir().unwrap();
        let odb = ObjectDb::local(dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
        let (root, _, _) = sample(&odb);
        let state = State::in_memory();
        let dest = dir.path().join("work");

        let stats = checkout(&odb, &state, &dest, &root, options(&[LinkType::Copy])).unwrap();
        assert_eq!(stats.copied, 2);

        assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dest.join("sub/b.txt")).unwrap(), b"beta");
        let mode = |p: &str| fs::metadata(dest.join(p)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("a.txt"), 0o644);
        assert_eq!(mode("sub/b.txt"), 0o600);
    }

    #[test]
    fn test_second_checkout_skips_everything() {
        let dir = tempdir().unwrap();
        let odb = ObjectDb::local(dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
        let (root, _, _) = sample(&odb);
        let state = State::in_memory();
        let dest = dir.path().join("work");

        checkout(&odb, &state, &dest, &root, options(&[LinkType::Copy])).unwrap();
        let stats = checkout(&odb, &state, &dest, &root, options(&[LinkType::Copy])).unwrap();
        assert_eq!(stats, CheckoutStats { skipped: 2, ..Default::default() });
    }

    #[test]
    fn test_changed_file_is_rewritten() {
        let dir = tempdir().unwrap();
        let odb = ObjectDb::local(dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
        let (root, _, _) = sample(&odb);
        let state = State::in_memory();
        let dest = dir.path().join("work");

        checkout(&odb, &state, &dest, &root, options(&[LinkType::Copy])).unwrap();
        fs::write(dest.join("a.txt"), b"edited by hand").unwrap();

        let stats = checkout(&odb, &state, &dest, &root, options(&[LinkType::Copy])).unwrap();
        assert_eq!(stats.copied, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"alpha");
    }

    #[test]
    fn test_disabled_reflink_falls_back_to_hardlink() {
        let dir = tempdir().unwrap();
        let odb = ObjectDb::local(dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
        let (root, a, _) = sample(&odb);
        let state = State::in_memory();
        let dest = dir.path().join("work");

        let mut links = LinkCache::new();
        links.disable(LinkType::Reflink);
        let stats = Checkout::new(&odb, &state, CheckoutOptions::default())
            .with_link_cache(links)
            .checkout(&dest, &root)
            .unwrap();

        assert_eq!(stats.hardlinked, 2);
        let object = odb.local_path(&a).unwrap();
        assert_eq!(
            fs::metadata(&object).unwrap().ino(),
            fs::metadata(dest.join("a.txt")).unwrap().ino()
        );
    }

    #[test]
    fn test_symlink_strategy() {
        let dir = tempdir().unwrap();
        let odb = ObjectDb::local(dir.path().join("cache"), HashAlgorithm::Sha256).unwrap();
        let (root, a, _) = sample(&odb);
        let state = State::in_memory();
        let dest = dir.path().join("work");

        let stats = checkout(&odb, &state, &dest, &root, options(&[LinkType::Symlink])).unwrap();
        assert_eq!(stats.symlinked, 2);
        assert_eq!(fs::read_link(dest.join("a.txt")).unwrap(), odb.local_path(&a).unwrap());
    }

    #[test]
    fn test_memory_store_only_copies() {
        let dir = tempdir().unwrap();
        let odb = ObjectDb::new(Arc::new(MemoryBackend::new()), HashAlgorithm::Sha256);
        let (root, _, _) = sample(&odb);
        let state = State::in_memory();

        let stats = checkout(&odb, &state, dir.path(), &root, CheckoutOptions::default()).unwrap();
        assert_eq!(stats.copied, 2);
        assert_eq!(fs::read(dir.path().join("sub/b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn test_no_usable_strategy() {
        let dir = tempdir().unwrap();
        let odb = ObjectDb::new(Arc::new(MemoryBackend::new()), HashAlgorithm::Sha256);
        let (root, _, _) = sample(&odb);
        let state = State::in_memory();

        let err = checkout(&odb, &state, dir.path(), &root, options(&[LinkType::Hardlink])).unwrap_err();
        assert!(matches!(err, Error::Checkout { failed: 2, .. }));
    }

    #[test]
    fn test_missing_object_is_per_path() {
        let (backend, odb) = {
            let backend = MemoryBackend::new();
            let odb = ObjectDb::new(Arc::new(backend.clone()), HashAlgorithm::Sha256);
            (backend, odb)
        };
        let present = odb.add_content(b"present").unwrap();
        let absent = HashInfo::file(HashAlgorithm::Sha256, HashAlgorithm::Sha256.digest(b"absent"));
        let root = Tree::new(vec![
            TreeEntry::new("absent", absent, None),
            TreeEntry::new("present", present, None),
        ])
        .unwrap()
        .save(&odb)
        .unwrap();
        assert_eq!(backend.len(), 2);

        let dir = tempdir().unwrap();
        let state = State::in_memory();
        let err = checkout(&odb, &state, dir.path(), &root, CheckoutOptions::default()).unwrap_err();
        match err {
            Error::Checkout { failed, paths } => {
                assert_eq!(failed, 1);
                assert_eq!(paths, vec![dir.path().join("absent")]);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(fs::read(dir.path().join("present")).unwrap(), b"present");
    }
}
