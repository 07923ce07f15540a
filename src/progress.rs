use std::sync::atomic::{AtomicUsize, Ordering};

use crate::hash::HashInfo;

/// receives one tick per object a transfer attempted
pub trait Progress: Sync {
    fn tick(&self, hash: &HashInfo);
}

/// ignores every tick
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn tick(&self, _hash: &HashInfo) {}
}

/// counts ticks
#[derive(Debug, Default)]
pub struct CountingProgress {
    ticks: AtomicUsize,
}

impl CountingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Progress for CountingProgress {
    fn tick(&self, hash: &HashInfo) {
        let n = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(hash = %hash, n, "progress");
    }
}
