//! Fixed worker pool with deterministic work partitioning.
//!
//! Every parallel phase broadcasts one closure to all pool threads; the
//! closure receives the worker index and operates on a statically assigned
//! round-robin partition. The broadcast blocks until every worker returns,
//! which is the barrier between phases.

use df_core::{Error, Result};
use tracing::debug;

/// Round-robin partition of `0..len` owned by `worker` out of `n_workers`.
#[inline]
pub fn partition(worker: usize, n_workers: usize, len: usize) -> impl Iterator<Item = usize> {
    (worker..len).step_by(n_workers.max(1))
}

/// Thread pool dedicated to propagation phases.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    n_workers: usize,
}

impl WorkerPool {
    /// Build a pool with `n_workers` threads; 0 picks the hardware default.
    pub fn new(n_workers: usize) -> Result<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if n_workers > 0 {
            builder = builder.num_threads(n_workers);
        }
        let pool = builder
            .build()
            .map_err(|e| Error::Computation(format!("worker pool construction failed: {e}")))?;
        let n_workers = pool.current_num_threads();
        debug!(n_workers, "worker pool ready");
        Ok(Self { pool, n_workers })
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Run `job(worker_index)` on every worker and wait for all of them.
    pub fn run<F>(&self, job: F)
    where
        F: Fn(usize) + Sync,
    {
        self.pool.broadcast(|ctx| job(ctx.index()));
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("n_workers", &self.n_workers).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_runs_every_worker_once() {
        let pool = WorkerPool::new(4).unwrap();
        let hits = AtomicUsize::new(0);
        pool.run(|_worker| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), pool.n_workers());
    }

    #[test]
    fn test_run_blocks_until_all_workers_finish() {
        let pool = WorkerPool::new(2).unwrap();
        let done = AtomicUsize::new(0);
        pool.run(|worker| {
            if worker == 0 {
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            done.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    proptest! {
        /// Partitions cover 0..len exactly once for any worker count.
        #[test]
        fn prop_partitions_are_complete_and_disjoint(
            len in 0usize..200,
            n_workers in 1usize..17,
        ) {
            let mut seen = vec![0u32; len];
            for worker in 0..n_workers {
                for index in partition(worker, n_workers, len) {
                    seen[index] += 1;
                }
            }
            prop_assert!(seen.iter().all(|&count| count == 1));
        }
    }
}
