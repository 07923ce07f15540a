//! directory manifests and recursive tree resolution

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, HashInfo};
use crate::odb::ObjectDb;

/// a directory manifest - entries sorted by path
///
/// the canonical form is the CBOR encoding of the sorted entries, and the
/// tree's own hash is the digest of those bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

/// a single entry in a tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// `/`-separated path relative to the tree root
    pub path: String,
    /// file object, or a nested tree when `hash.is_dir`
    pub hash: HashInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl TreeEntry {
    pub fn new(path: impl Into<String>, hash: HashInfo, mode: Option<u32>) -> Self {
        Self {
            path: path.into(),
            hash,
            mode,
        }
    }
}

impl Tree {
    /// create a new tree, validating and sorting entries
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self> {
        for entry in &entries {
            validate_path(&entry.path)?;
        }

        entries.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));

        for window in entries.windows(2) {
            if window[0].path == window[1].path {
                return Err(Error::DuplicatePath(window[0].path.clone()));
            }
        }

        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// look up entry by path
    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_bytes().cmp(path.as_bytes()))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// every hash directly referenced by an entry
    pub fn entry_hashes(&self) -> BTreeSet<HashInfo> {
        self.entries.iter().map(|e| e.hash.clone()).collect()
    }

    /// canonical serialized form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    /// parse a stored tree
    ///
    /// stored trees are never repaired: unsorted, duplicate or invalid
    /// entries mean the object is corrupt.
    pub fn from_bytes(hash: &HashInfo, bytes: &[u8]) -> Result<Self> {
        let format_error = |message: String| Error::ObjectFormat {
            hash: hash.clone(),
            message,
        };

        let tree: Tree = ciborium::from_reader(bytes).map_err(|e| format_error(e.to_string()))?;

        for entry in &tree.entries {
            validate_path(&entry.path).map_err(|e| format_error(e.to_string()))?;
        }
        for window in tree.entries.windows(2) {
            if window[0].path.as_bytes() >= window[1].path.as_bytes() {
                return Err(format_error(format!(
                    "entries out of order at {:?}",
                    window[1].path
                )));
            }
        }

        Ok(tree)
    }

    /// hash of the canonical form
    pub fn digest(&self, algorithm: HashAlgorithm) -> Result<HashInfo> {
        Ok(HashInfo::dir(algorithm, algorithm.digest(&self.to_bytes()?)))
    }

    /// store this tree, returning its hash
    pub fn save(&self, odb: &ObjectDb) -> Result<HashInfo> {
        let bytes = self.to_bytes()?;
        let hash = HashInfo::dir(odb.algorithm(), odb.algorithm().digest(&bytes));
        odb.add_bytes(&bytes, &hash)?;
        Ok(hash)
    }

    /// load and validate a stored tree
    pub fn load(odb: &ObjectDb, hash: &HashInfo) -> Result<Self> {
        let bytes = odb.read(hash)?;

        let actual = hash.algorithm.digest(&bytes);
        if actual != hash.value {
            return Err(Error::Integrity {
                expected: hash.clone(),
                actual,
            });
        }

        Tree::from_bytes(hash, &bytes)
    }
}

/// validate an entry path
fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidPath("empty path".to_string()));
    }
    if path.starts_with('/') {
        return Err(Error::InvalidPath(format!("absolute path: {}", path)));
    }
    if path.contains('\0') {
        return Err(Error::InvalidPath(format!("path contains null byte: {}", path)));
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(Error::InvalidPath(format!("bad component in {}", path)));
        }
    }
    Ok(())
}

/// a leaf reached by flattening a tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatEntry {
    /// path relative to the flattened root
    pub path: String,
    pub hash: HashInfo,
    pub mode: Option<u32>,
}

/// everything reachable from one tree
#[derive(Clone, Debug, Default)]
pub struct Reachable {
    /// file objects
    pub files: BTreeSet<HashInfo>,
    /// nested tree objects, children before parents, root excluded
    pub trees: Vec<HashInfo>,
    /// nested trees no source could load; whatever they hold is unknown
    pub unresolved: BTreeSet<HashInfo>,
}

impl Reachable {
    /// files, nested trees and unresolved trees together
    pub fn all(&self) -> BTreeSet<HashInfo> {
        self.files
            .iter()
            .chain(&self.trees)
            .chain(&self.unresolved)
            .cloned()
            .collect()
    }

    /// true when every nested tree could be loaded
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// trees loaded so far, keyed by hash
///
/// resolution is iterative. a tree that shows up again while it is still
/// being resolved can only come from corrupt input and is rejected.
#[derive(Default)]
pub struct TreeArena {
    trees: HashMap<HashInfo, Arc<Tree>>,
    reachable: HashMap<HashInfo, Arc<Reachable>>,
}

struct Frame {
    hash: HashInfo,
    tree: Arc<Tree>,
    next: usize,
    prefix: String,
}

enum Visit<'a> {
    Leaf(String, &'a TreeEntry),
    TreeDone(&'a HashInfo),
    Unresolved(&'a HashInfo),
}

impl TreeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// load a tree from the first source that has it
    pub fn load(&mut self, sources: &[&ObjectDb], hash: &HashInfo) -> Result<Arc<Tree>> {
        if let Some(tree) = self.trees.get(hash) {
            return Ok(Arc::clone(tree));
        }

        for odb in sources {
            match Tree::load(odb, hash) {
                Ok(tree) => {
                    let tree = Arc::new(tree);
                    self.trees.insert(hash.clone(), Arc::clone(&tree));
                    return Ok(tree);
                }
                Err(Error::ObjectNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::ObjectNotFound(hash.clone()))
    }

    /// all leaves under `root`, in path order
    pub fn flatten(&mut self, sources: &[&ObjectDb], root: &HashInfo) -> Result<Vec<FlatEntry>> {
        let mut leaves = Vec::new();
        self.walk(sources, root, false, false, |visit| {
            if let Visit::Leaf(path, entry) = visit {
                leaves.push(FlatEntry {
                    path,
                    hash: entry.hash.clone(),
                    mode: entry.mode,
                });
            }
        })?;
        leaves.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));
        Ok(leaves)
    }

    /// files and nested trees reachable from `root`
    ///
    /// `root` itself must load. a nested tree missing from every source is
    /// recorded in [`Reachable::unresolved`] instead of failing the walk.
    pub fn reachable(&mut self, sources: &[&ObjectDb], root: &HashInfo) -> Result<Arc<Reachable>> {
        if let Some(r) = self.reachable.get(root) {
            return Ok(Arc::clone(r));
        }

        let mut result = Reachable::default();
        self.walk(sources, root, true, true, |visit| match visit {
            Visit::Leaf(_, entry) => {
                result.files.insert(entry.hash.clone());
            }
            Visit::TreeDone(hash) => {
                if hash != root {
                    result.trees.push(hash.clone());
                }
            }
            Visit::Unresolved(hash) => {
                result.unresolved.insert(hash.clone());
            }
        })?;

        let result = Arc::new(result);
        self.reachable.insert(root.clone(), Arc::clone(&result));
        Ok(result)
    }

    /// depth-first traversal with an explicit stack
    ///
    /// with `dedup`, a subtree shared by several parents is visited once.
    /// with `skip_missing`, a nested tree no source has is reported as
    /// `Visit::Unresolved` and skipped.
    fn walk<F>(
        &mut self,
        sources: &[&ObjectDb],
        root: &HashInfo,
        dedup: bool,
        skip_missing: bool,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(Visit<'_>),
    {
        let mut resolving: HashSet<HashInfo> = HashSet::new();
        let mut done: HashSet<HashInfo> = HashSet::new();

        let tree = self.load(sources, root)?;
        resolving.insert(root.clone());
        let mut stack = vec![Frame {
            hash: root.clone(),
            tree,
            next: 0,
            prefix: String::new(),
        }];

        while let Some(frame) = stack.last_mut() {
            let Some(entry) = frame.tree.entries().get(frame.next).cloned() else {
                let Some(finished) = stack.pop() else {
                    break;
                };
                resolving.remove(&finished.hash);
                visit(Visit::TreeDone(&finished.hash));
                done.insert(finished.hash);
                continue;
            };
            frame.next += 1;

            let path = if frame.prefix.is_empty() {
                entry.path.clone()
            } else {
                format!("{}/{}", frame.prefix, entry.path)
            };

            if !entry.hash.is_dir {
                visit(Visit::Leaf(path, &entry));
                continue;
            }

            if resolving.contains(&entry.hash) {
                return Err(Error::ObjectFormat {
                    hash: entry.hash.clone(),
                    message: format!("tree refers to itself at {:?}", path),
                });
            }
            if dedup && done.contains(&entry.hash) {
                continue;
            }

            let child = match self.load(sources, &entry.hash) {
                Ok(child) => child,
                Err(Error::ObjectNotFound(_)) if skip_missing => {
                    visit(Visit::Unresolved(&entry.hash));
                    continue;
                }
                Err(e) => return Err(e),
            };
            resolving.insert(entry.hash.clone());
            stack.push(Frame {
                hash: entry.hash,
                tree: child,
                next: 0,
                prefix: path,
            });
        }

        Ok(())
    }
}
