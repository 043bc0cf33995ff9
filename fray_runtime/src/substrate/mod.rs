//! Process-level collaborators of the executor: the thread topology and the
//! scoped worker pool.
//!
//! A [Topology] describes how worker threads group into *packages* (threads
//! sharing a cache level). The abort-escalation policy uses it to route
//! retries toward progressively more distant workers. Callers that know
//! their machine can build one with [Topology::uniform]; everything else
//! defaults to a single package.

use std::panic;
use std::thread;

pub mod barrier;
pub mod termination;


/// Upper bound on worker threads. The conflict lock word stores the owner
/// id in 16 bits, so this must stay well below that.
pub const MAX_THREADS: usize = 4096;

/// Thread-to-package mapping plus the per-package leaders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    threads: usize,
    pkg: Vec<usize>,
    pkg_leader: Vec<usize>,
}

impl Topology {
    /// All threads in one package.
    pub fn single_package(threads: usize) -> Self {
        Self::uniform(threads, 1)
    }

    /// `threads` workers spread over (at most) `packages` equal blocks of
    /// consecutive tids. The first tid of each block is its leader.
    pub fn uniform(threads: usize, packages: usize) -> Self {
        assert!(threads >= 1 && threads <= MAX_THREADS);
        assert!(packages >= 1);
        let per = (threads + packages - 1) / packages;
        let pkg: Vec<usize> = (0..threads).map(|tid| tid / per).collect();
        let npkg = pkg[threads - 1] + 1;
        let pkg_leader: Vec<usize> = (0..npkg).map(|p| p * per).collect();
        Self {
            threads,
            pkg,
            pkg_leader,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn max_packages(&self) -> usize {
        self.pkg_leader.len()
    }

    pub fn package_of(&self, tid: usize) -> usize {
        self.pkg[tid]
    }

    pub fn leader_of_package(&self, pkg: usize) -> usize {
        self.pkg_leader[pkg]
    }

    /// Leader tid of `tid`'s own package.
    pub fn leader_of(&self, tid: usize) -> usize {
        self.pkg_leader[self.pkg[tid]]
    }

    pub fn is_leader(&self, tid: usize) -> bool {
        self.leader_of(tid) == tid
    }
}

/// Default worker count when the caller does not pin one.
pub fn default_threads() -> usize {
    num_cpus::get().clamp(1, MAX_THREADS)
}

/// Fixed-size pool of OS worker threads. One scoped thread per pool slot,
/// no cooperative suspension; workers either run or spin at the barrier.
#[derive(Debug)]
pub struct ThreadPool {
    topo: Topology,
}

impl ThreadPool {
    pub fn new(topo: Topology) -> Self {
        Self { topo }
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Runs `f(tid)` once on every worker and collects the results in tid
    /// order. A panic that escapes `f` is re-raised here after the
    /// remaining workers have been joined.
    pub fn run<R: Send>(&self, f: impl Fn(usize) -> R + Sync) -> Vec<R> {
        let threads = self.topo.threads();
        thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|tid| {
                    let f = &f;
                    s.spawn(move || f(tid))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(payload) => panic::resume_unwind(payload),
                })
                .collect()
        })
    }
}
