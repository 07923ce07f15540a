//! hashing a directory on disk into trees and file objects

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::HashInfo;
use crate::odb::{AddOptions, ObjectDb};
use crate::pool::WorkerPool;
use crate::repo::REPO_DIR;
use crate::state::State;
use crate::tree::{Tree, TreeEntry};

struct SourceFile {
    path: PathBuf,
    /// directory relative to the source root, empty for the root itself
    parent: PathBuf,
    name: String,
    mode: u32,
}

/// store every file under `source` and return the hash of its root tree
///
/// files whose state entry is still valid are not re-hashed. symlinks and
/// special files are skipped.
pub fn build_tree(odb: &ObjectDb, state: &State, source: &Path, jobs: usize) -> Result<HashInfo> {
    let mut dirs: BTreeMap<PathBuf, Vec<TreeEntry>> = BTreeMap::new();
    dirs.insert(PathBuf::new(), Vec::new());
    let mut files = Vec::new();

    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != REPO_DIR);
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            match e.into_io_error() {
                Some(source) => Error::io(path, source),
                None => Error::InvalidPath(format!("filesystem loop at {}", path.display())),
            }
        })?;

        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::InvalidPath(entry.path().display().to_string()))?
            .to_path_buf();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            dirs.insert(rel, Vec::new());
        } else if file_type.is_file() {
            let name = entry
                .file_name()
                .to_str()
                .ok_or_else(|| Error::InvalidPath(entry.path().display().to_string()))?
                .to_string();
            let meta = entry.metadata().map_err(|e| {
                let path = entry.path().to_path_buf();
                match e.into_io_error() {
                    Some(source) => Error::io(path, source),
                    None => Error::InvalidPath(path.display().to_string()),
                }
            })?;
            files.push(SourceFile {
                path: entry.path().to_path_buf(),
                parent: rel.parent().map(Path::to_path_buf).unwrap_or_default(),
                name,
                mode: meta.permissions().mode() & 0o7777,
            });
        } else {
            tracing::warn!(path = %entry.path().display(), "skipping non-regular file");
        }
    }

    let pool = WorkerPool::new(jobs)?;
    let hashed: Vec<HashInfo> = pool.install(|| {
        files
            .par_iter()
            .map(|file| ingest(odb, state, &file.path))
            .collect::<Result<Vec<_>>>()
    })?;
    state.flush()?;

    for (file, hash) in files.into_iter().zip(hashed) {
        if let Some(entries) = dirs.get_mut(&file.parent) {
            entries.push(TreeEntry::new(file.name, hash, Some(file.mode)));
        }
    }

    // deepest directories first, so every child tree exists before its parent
    let mut order: Vec<PathBuf> = dirs.keys().cloned().collect();
    order.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    let mut root = None;
    for rel in order {
        let entries = dirs.remove(&rel).unwrap_or_default();
        let hash = Tree::new(entries)?.save(odb)?;
        tracing::debug!(dir = %rel.display(), tree = %hash, "tree stored");

        if rel.as_os_str().is_empty() {
            root = Some(hash);
            continue;
        }
        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = rel
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidPath(rel.display().to_string()))?
            .to_string();
        if let Some(entries) = dirs.get_mut(&parent) {
            entries.push(TreeEntry::new(name, hash, None));
        }
    }

    let root = root.ok_or_else(|| Error::InvalidPath(source.display().to_string()))?;
    tracing::info!(source = %source.display(), tree = %root, "directory added");
    Ok(root)
}

fn ingest(odb: &ObjectDb, state: &State, path: &Path) -> Result<HashInfo> {
    let hash = match state.get(path) {
        Some(hash) if hash.algorithm == odb.algorithm() => hash,
        _ => {
            let before = fs::metadata(path).with_path(path)?;
            let hash = odb.hash_file(path)?;
            if !state.save_if_unchanged(path, &hash, &before)? {
                tracing::warn!(path = %path.display(), "file changed while hashing, not cached");
            }
            hash
        }
    };
    odb.add_path(path, &hash, AddOptions::default())?;
    Ok(hash)
}
