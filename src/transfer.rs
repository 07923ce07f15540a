//! copying objects between stores without ever publishing a partial directory
//!
//! the rule enforced here: a directory's tree object only reaches the
//! destination, and only gets an index entry, once every file it reaches is
//! already there. files are copied in parallel, directories one at a time.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::hash::HashInfo;
use crate::index::Index;
use crate::odb::{AddOptions, ObjectDb};
use crate::pool::{default_jobs, WorkerPool};
use crate::progress::{NoProgress, Progress};
use crate::status::{compare, compare_indexed, expand_wanted, Status};
use crate::tree::{Reachable, TreeArena};

/// knobs for [`transfer`]
pub struct TransferOptions<'a> {
    /// worker threads for existence checks and copies
    pub jobs: usize,
    /// re-hash bytes on arrival
    pub verify: bool,
    /// link instead of copy when both stores share a filesystem
    pub hardlink: bool,
    /// extra store consulted first when loading trees
    pub cache: Option<&'a ObjectDb>,
    /// destination index, updated only when the whole batch succeeds
    pub index: Option<&'a Index>,
    pub progress: &'a dyn Progress,
}

impl Default for TransferOptions<'_> {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            verify: false,
            hardlink: false,
            cache: None,
            index: None,
            progress: &NoProgress,
        }
    }
}

/// copy every wanted object `dest` lacks from `src`
///
/// wanted directories pull in everything they reach. returns how many objects
/// were copied; any per-object failure turns the result into
/// [`Error::Transfer`] once the rest of the batch has been attempted.
pub fn transfer(
    src: &ObjectDb,
    dest: &ObjectDb,
    wanted: &BTreeSet<HashInfo>,
    opts: &TransferOptions<'_>,
) -> Result<usize> {
    let result = run(src, dest, wanted, opts);

    let Some(index) = opts.index else {
        return result;
    };
    match result {
        Ok(copied) => {
            index.commit_staged()?;
            Ok(copied)
        }
        Err(e) => {
            index.discard_staged();
            Err(e)
        }
    }
}

fn run(
    src: &ObjectDb,
    dest: &ObjectDb,
    wanted: &BTreeSet<HashInfo>,
    opts: &TransferOptions<'_>,
) -> Result<usize> {
    let pool = WorkerPool::new(opts.jobs)?;

    let mut sources: Vec<&ObjectDb> = Vec::with_capacity(2);
    sources.extend(opts.cache);
    sources.push(src);

    let mut arena = TreeArena::new();
    let wanted = expand_wanted(&sources, wanted, &mut arena)?;
    let status = match opts.index {
        Some(index) => compare_indexed(src, dest, &wanted, true, &pool, index),
        None => compare(src, dest, &wanted, true, &pool),
    };

    if !status.missing.is_empty() {
        tracing::warn!(
            count = status.missing.len(),
            "objects missing from both source and destination"
        );
    }
    if status.new.is_empty() {
        tracing::info!(backend = %dest.backend().describe(), "nothing to transfer");
        return Ok(0);
    }

    let (dirs, files): (BTreeSet<HashInfo>, BTreeSet<HashInfo>) =
        status.new.iter().cloned().partition(|h| h.is_dir);

    let mut reach: BTreeMap<HashInfo, Arc<Reachable>> = BTreeMap::new();
    for dir in &dirs {
        reach.insert(dir.clone(), arena.reachable(&sources, dir)?);
    }

    let mut batch = Batch {
        copier: Copier {
            src,
            dest,
            add: AddOptions {
                verify: opts.verify,
                hardlink: opts.hardlink,
            },
            progress: opts.progress,
            pool: &pool,
        },
        index: opts.index,
        status: &status,
        dirs: &dirs,
        reach: &reach,
        files,
        uploaded: HashSet::new(),
        failed_files: HashSet::new(),
        failed: Vec::new(),
        failures: 0,
        copied: 0,
    };

    // nested trees travel with the outermost directory that reaches them
    let nested: HashSet<&HashInfo> = reach.values().flat_map(|r| r.trees.iter()).collect();
    for dir in dirs.iter().filter(|d| !nested.contains(d)) {
        batch.directory(dir)?;
    }
    batch.loose_files()?;

    if batch.failures > 0 {
        tracing::warn!(
            failed = batch.failures,
            copied = batch.copied,
            "transfer finished with failures"
        );
        return Err(Error::Transfer {
            failed: batch.failures,
            hashes: batch.failed,
        });
    }

    tracing::info!(copied = batch.copied, backend = %dest.backend().describe(), "transfer complete");
    Ok(batch.copied)
}

/// bookkeeping for one transfer run
struct Batch<'a> {
    copier: Copier<'a>,
    index: Option<&'a Index>,
    status: &'a Status,
    /// directories the destination lacks
    dirs: &'a BTreeSet<HashInfo>,
    reach: &'a BTreeMap<HashInfo, Arc<Reachable>>,
    /// files not yet claimed by a directory
    files: BTreeSet<HashInfo>,
    uploaded: HashSet<HashInfo>,
    failed_files: HashSet<HashInfo>,
    failed: Vec<HashInfo>,
    failures: usize,
    copied: usize,
}

impl Batch<'_> {
    fn directory(&mut self, dir: &HashInfo) -> Result<()> {
        let reach = self.reach;
        let Some(reachable) = reach.get(dir) else {
            return Ok(());
        };

        let bound: Vec<HashInfo> = reachable
            .files
            .iter()
            .filter(|f| self.files.contains(*f))
            .cloned()
            .collect();
        for f in &bound {
            self.files.remove(f);
        }

        let bound_failed = self.copier.copy_all(&bound)?;
        self.copied += bound.len() - bound_failed.len();

        if !bound_failed.is_empty() {
            tracing::warn!(
                dir = %dir,
                failed = bound_failed.len(),
                "withholding directory, files failed"
            );
            self.failures += bound_failed.len() + 1;
            self.failed_files.extend(bound_failed.iter().cloned());
            self.failed.extend(bound_failed);
            self.failed.push(dir.clone());
            return Ok(());
        }

        if reachable.files.iter().any(|f| self.failed_files.contains(f)) {
            tracing::warn!(dir = %dir, "withholding directory, a shared file failed");
            self.failures += 1;
            self.failed.push(dir.clone());
            return Ok(());
        }

        if reachable
            .files
            .iter()
            .chain(&reachable.trees)
            .chain(&reachable.unresolved)
            .any(|h| self.status.missing.contains(h))
        {
            tracing::warn!(dir = %dir, "withholding directory, source lacks some of its content");
            return Ok(());
        }

        // children come before parents in `trees`
        let pending: Vec<&HashInfo> = reachable
            .trees
            .iter()
            .filter(|t| self.dirs.contains(*t) && !self.uploaded.contains(*t))
            .collect();
        for tree in pending.into_iter().chain(std::iter::once(dir)) {
            if !self.copier.copy_one(tree)? {
                self.failures += 1;
                self.failed.push(tree.clone());
                return Ok(());
            }
            self.copied += 1;
            self.uploaded.insert(tree.clone());
            if let (Some(index), Some(r)) = (self.index, reach.get(tree)) {
                index.stage(tree, &r.files);
            }
        }

        Ok(())
    }

    fn loose_files(&mut self) -> Result<()> {
        let loose: Vec<HashInfo> = std::mem::take(&mut self.files).into_iter().collect();
        if loose.is_empty() {
            return Ok(());
        }
        let failed = self.copier.copy_all(&loose)?;
        self.copied += loose.len() - failed.len();
        self.failures += failed.len();
        self.failed.extend(failed);
        Ok(())
    }
}

struct Copier<'a> {
    src: &'a ObjectDb,
    dest: &'a ObjectDb,
    add: AddOptions,
    progress: &'a dyn Progress,
    pool: &'a WorkerPool,
}

impl Copier<'_> {
    /// `Ok(false)` for a per-object failure, `Err` only when the batch must stop
    fn copy_one(&self, hash: &HashInfo) -> Result<bool> {
        let result = self.dest.copy_from(self.src, hash, self.add);
        self.progress.tick(hash);
        match result {
            Ok(()) => {
                tracing::debug!(hash = %hash, "copied");
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(hash = %hash, "failed to copy: {}", e);
                Ok(false)
            }
        }
    }

    /// copy in parallel, returning the hashes that failed
    fn copy_all(&self, hashes: &[HashInfo]) -> Result<Vec<HashInfo>> {
        let outcomes = self.pool.install(|| {
            hashes
                .par_iter()
                .map(|h| self.copy_one(h).map(|ok| (h, ok)))
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(outcomes
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(h, _)| h.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::hash::HashAlgorithm;
    use crate::progress::CountingProgress;
    use crate::tree::{Tree, TreeEntry};

    fn memory_odb() -> (MemoryBackend, ObjectDb) {
        let backend = MemoryBackend::new();
        let odb = ObjectDb::new(Arc::new(backend.clone()), HashAlgorithm::Sha256);
        (backend, odb)
    }

    fn opts<'a>(index: Option<&'a Index>, progress: &'a dyn Progress) -> TransferOptions<'a> {
        TransferOptions {
            jobs: 2,
            verify: true,
            index,
            progress,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_wanted_is_nothing_to_do() {
        let (_, src) = memory_odb();
        let (_, dest) = memory_odb();
        let copied = transfer(&src, &dest, &BTreeSet::new(), &opts(None, &NoProgress)).unwrap();
        assert_eq!(copied, 0);
    }

    #[test]
    fn test_loose_files() {
        let (_, src) = memory_odb();
        let (dest_backend, dest) = memory_odb();
        let a = src.add_content(b"a").unwrap();
        let b = src.add_content(b"b").unwrap();

        let progress = CountingProgress::new();
        let copied = transfer(&src, &dest, &BTreeSet::from([a.clone(), b.clone()]), &opts(None, &progress)).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(progress.count(), 2);
        assert_eq!(dest_backend.len(), 2);
        assert_eq!(dest.read(&a).unwrap(), b"a");
    }

    #[test]
    fn test_nested_directories_are_indexed() {
        let (_, src) = memory_odb();
        let (_, dest) = memory_odb();
        let f1 = src.add_content(b"one").unwrap();
        let f2 = src.add_content(b"two").unwrap();
        let inner = Tree::new(vec![TreeEntry::new("two", f2.clone(), None)])
            .unwrap()
            .save(&src)
            .unwrap();
        let root = Tree::new(vec![
            TreeEntry::new("one", f1.clone(), None),
            TreeEntry::new("sub", inner.clone(), None),
        ])
        .unwrap()
        .save(&src)
        .unwrap();

        let index = Index::in_memory();
        let copied = transfer(&src, &dest, &BTreeSet::from([root.clone()]), &opts(Some(&index), &NoProgress)).unwrap();

        assert_eq!(copied, 4);
        for h in [&f1, &f2, &inner, &root] {
            assert!(dest.exists(h), "{}", h);
        }
        assert_eq!(
            index.get(&root).unwrap(),
            BTreeSet::from([f1.value.clone(), f2.value.clone()])
        );
        assert_eq!(index.get(&inner).unwrap(), BTreeSet::from([f2.value.clone()]));
    }

    #[test]
    fn test_second_transfer_copies_nothing() {
        let (_, src) = memory_odb();
        let (dest_backend, dest) = memory_odb();
        let f = src.add_content(b"again").unwrap();
        let dir = Tree::new(vec![TreeEntry::new("f", f, None)])
            .unwrap()
            .save(&src)
            .unwrap();
        let wanted = BTreeSet::from([dir]);
        let index = Index::in_memory();

        assert_eq!(transfer(&src, &dest, &wanted, &opts(Some(&index), &NoProgress)).unwrap(), 2);
        let before = dest_backend.len();

        let progress = CountingProgress::new();
        assert_eq!(transfer(&src, &dest, &wanted, &opts(Some(&index), &progress)).unwrap(), 0);
        assert_eq!(progress.count(), 0);
        assert_eq!(dest_backend.len(), before);
    }

    #[test]
    fn test_missing_content_withholds_manifest_without_failing() {
        let (_, src) = memory_odb();
        let (_, dest) = memory_odb();
        let present = src.add_content(b"here").unwrap();
        let gone = HashInfo::file(HashAlgorithm::Sha256, HashAlgorithm::Sha256.digest(b"gone"));
        let dir = Tree::new(vec![
            TreeEntry::new("gone", gone.clone(), None),
            TreeEntry::new("here", present.clone(), None),
        ])
        .unwrap()
        .save(&src)
        .unwrap();

        let index = Index::in_memory();
        let copied = transfer(&src, &dest, &BTreeSet::from([dir.clone()]), &opts(Some(&index), &NoProgress)).unwrap();

        assert_eq!(copied, 1);
        assert!(dest.exists(&present));
        assert!(!dest.exists(&dir));
        assert!(!index.contains(&dir));
    }

    #[test]
    fn test_missing_subtree_withholds_manifest_without_failing() {
        let (_, src) = memory_odb();
        let (_, dest) = memory_odb();
        let present = src.add_content(b"here").unwrap();
        let sub = Tree::new(vec![TreeEntry::new("x", present.clone(), None)])
            .unwrap()
            .digest(HashAlgorithm::Sha256)
            .unwrap();
        // `sub` was never stored anywhere
        let root = Tree::new(vec![
            TreeEntry::new("here", present.clone(), None),
            TreeEntry::new("sub", sub.clone(), None),
        ])
        .unwrap()
        .save(&src)
        .unwrap();

        let index = Index::in_memory();
        let copied = transfer(&src, &dest, &BTreeSet::from([root.clone()]), &opts(Some(&index), &NoProgress)).unwrap();

        assert_eq!(copied, 1);
        assert!(dest.exists(&present));
        assert!(!dest.exists(&sub));
        assert!(!dest.exists(&root));
        assert!(index.is_empty());
    }

    #[test]
    fn test_file_holding_tree_bytes_reaches_destination() {
        let (_, src) = memory_odb();
        let (_, dest) = memory_odb();
        let inner_file = src.add_content(b"inner").unwrap();
        let inner = Tree::new(vec![TreeEntry::new("inner", inner_file.clone(), None)]).unwrap();
        let inner_hash = inner.save(&src).unwrap();
        // a dataset file that happens to be a serialized tree
        let backup = src.add_content(&inner.to_bytes().unwrap()).unwrap();
        let root = Tree::new(vec![
            TreeEntry::new("backup.bin", backup.clone(), None),
            TreeEntry::new("sub", inner_hash.clone(), None),
        ])
        .unwrap()
        .save(&src)
        .unwrap();

        let copied = transfer(&src, &dest, &BTreeSet::from([root.clone()]), &opts(None, &NoProgress)).unwrap();

        // the file and the tree share one object
        assert_eq!(copied, 3);
        for h in [&root, &inner_hash, &backup, &inner_file] {
            assert!(dest.exists(h), "{}", h);
        }
        assert_eq!(dest.read(&backup).unwrap(), inner.to_bytes().unwrap());
        assert!(dest.get(&inner_hash).is_ok());
    }

    #[test]
    fn test_tree_loaded_from_cache() {
        let (_, src) = memory_odb();
        let (_, cache) = memory_odb();
        let (_, dest) = memory_odb();
        let f = src.add_content(b"payload").unwrap();
        let tree = Tree::new(vec![TreeEntry::new("p", f.clone(), None)]).unwrap();
        let dir = tree.save(&src).unwrap();
        tree.save(&cache).unwrap();

        let options = TransferOptions {
            jobs: 1,
            cache: Some(&cache),
            ..Default::default()
        };
        assert_eq!(transfer(&src, &dest, &BTreeSet::from([dir.clone()]), &options).unwrap(), 2);
        assert!(dest.exists(&dir));
        assert!(dest.exists(&f));
    }
}
