use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::hash::HashInfo;
use crate::odb::ObjectDb;
use crate::pool::WorkerPool;

/// verification report
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// objects checked
    pub checked: usize,
    /// objects whose bytes do not match their address
    pub corrupt: Vec<CorruptObject>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.corrupt.is_empty()
    }
}

#[derive(Debug)]
pub struct CorruptObject {
    pub hash: HashInfo,
    pub message: String,
}

/// re-hash every object in `odb`
pub fn verify(odb: &ObjectDb, jobs: usize) -> Result<VerifyReport> {
    let mut hashes = odb.hashes()?;
    hashes.sort();

    let pool = WorkerPool::new(jobs)?;
    let outcomes = pool.install(|| {
        hashes
            .par_iter()
            .map(|hash| match check_object(odb, hash) {
                Ok(()) => Ok(None),
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => Ok(Some(CorruptObject {
                    hash: hash.clone(),
                    message: e.to_string(),
                })),
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let report = VerifyReport {
        checked: hashes.len(),
        corrupt: outcomes.into_iter().flatten().collect(),
    };
    for object in &report.corrupt {
        tracing::warn!(hash = %object.hash, "corrupt object: {}", object.message);
    }
    tracing::info!(checked = report.checked, corrupt = report.corrupt.len(), "verify complete");
    Ok(report)
}

// a tree is only ever stored from its own canonical bytes, so a matching
// digest also means the tree still parses
fn check_object(odb: &ObjectDb, hash: &HashInfo) -> Result<()> {
    let mut reader = odb.get(hash)?.open()?;
    let actual = hash
        .algorithm
        .digest_reader(&mut reader)
        .map_err(|e| Error::io(odb.location(hash), e))?;

    if actual != hash.value {
        return Err(Error::Integrity {
            expected: hash.clone(),
            actual,
        });
    }
    Ok(())
}
