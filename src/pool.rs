use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::Result;

/// bounded set of worker threads shared by one transfer or checkout
pub struct WorkerPool {
    pool: ThreadPool,
    jobs: usize,
}

impl WorkerPool {
    pub fn new(jobs: usize) -> Result<Self> {
        let jobs = jobs.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("hoard-worker-{}", i))
            .build()?;
        Ok(Self { pool, jobs })
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// run `op` inside the pool, so rayon iterators use its workers
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

/// worker count when none is configured
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
