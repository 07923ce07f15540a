//! which wanted objects a destination lacks

use std::collections::{BTreeSet, HashSet};

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::hash::HashInfo;
use crate::index::Index;
use crate::odb::ObjectDb;
use crate::pool::WorkerPool;
use crate::tree::TreeArena;

/// outcome of comparing a source and a destination
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    /// wanted, absent from the destination
    pub new: BTreeSet<HashInfo>,
    /// wanted, absent from both sides
    pub missing: BTreeSet<HashInfo>,
    /// wanted, already in the destination
    pub ok: BTreeSet<HashInfo>,
}

impl Status {
    pub fn is_clean(&self) -> bool {
        self.new.is_empty() && self.missing.is_empty()
    }
}

enum Presence {
    Ok,
    New,
    Missing,
}

/// compare `wanted` against `dest` without moving any bytes
///
/// with `check_deleted` every hash absent from `dest` is also looked up in
/// `src`, and the ones `src` lacks land in `missing` instead of `new`.
/// without it `src` is never queried.
pub fn compare(
    src: &ObjectDb,
    dest: &ObjectDb,
    wanted: &BTreeSet<HashInfo>,
    check_deleted: bool,
    pool: &WorkerPool,
) -> Status {
    classify(src, dest, wanted, check_deleted, pool, &HashSet::new())
}

/// like [`compare`], trusting the destination's index for known directories
///
/// a wanted directory that the index lists and whose tree is in `dest` vouches
/// for every file it recorded; those files are not queried.
pub fn compare_indexed(
    src: &ObjectDb,
    dest: &ObjectDb,
    wanted: &BTreeSet<HashInfo>,
    check_deleted: bool,
    pool: &WorkerPool,
    index: &Index,
) -> Status {
    let mut vouched = HashSet::new();
    for dir in wanted.iter().filter(|h| h.is_dir) {
        if let Some(files) = index.get(dir) {
            if dest.exists(dir) {
                vouched.extend(files);
            }
        }
    }
    if !vouched.is_empty() {
        tracing::debug!(count = vouched.len(), "files vouched for by index");
    }

    classify(src, dest, wanted, check_deleted, pool, &vouched)
}

fn classify(
    src: &ObjectDb,
    dest: &ObjectDb,
    wanted: &BTreeSet<HashInfo>,
    check_deleted: bool,
    pool: &WorkerPool,
    vouched: &HashSet<String>,
) -> Status {
    let mut status = Status::default();
    if wanted.is_empty() {
        return status;
    }

    let results: Vec<(&HashInfo, Presence)> = pool.install(|| {
        wanted
            .par_iter()
            .map(|hash| {
                let presence = if (!hash.is_dir && vouched.contains(&hash.value)) || dest.exists(hash) {
                    Presence::Ok
                } else if check_deleted && !src.exists(hash) {
                    Presence::Missing
                } else {
                    Presence::New
                };
                (hash, presence)
            })
            .collect()
    });

    for (hash, presence) in results {
        let set = match presence {
            Presence::Ok => &mut status.ok,
            Presence::New => &mut status.new,
            Presence::Missing => &mut status.missing,
        };
        set.insert(hash.clone());
    }

    tracing::debug!(
        new = status.new.len(),
        missing = status.missing.len(),
        ok = status.ok.len(),
        "status computed"
    );
    status
}

/// add everything reachable from the wanted directories
///
/// trees are looked up in `sources` in order. a directory whose tree cannot be
/// found anywhere is kept as is, so that status reports it.
pub fn expand_wanted(
    sources: &[&ObjectDb],
    wanted: &BTreeSet<HashInfo>,
    arena: &mut TreeArena,
) -> Result<BTreeSet<HashInfo>> {
    let mut expanded = wanted.clone();
    for dir in wanted.iter().filter(|h| h.is_dir) {
        match arena.reachable(sources, dir) {
            Ok(reachable) => expanded.extend(reachable.all()),
            Err(Error::ObjectNotFound(h)) => {
                tracing::debug!(dir = %dir, missing = %h, "cannot expand directory");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(expanded)
}
