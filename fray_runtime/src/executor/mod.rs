//! The speculative for-each executor.
//!
//! [for_each] applies an operator to every item of a shared worklist on a
//! pool of OS threads. Each application runs inside a conflict-detecting
//! iteration scope: when two in-flight iterations collide on a logical
//! lock, the loser aborts, rolls back its scratch state, and is re-enqueued
//! under a package-aware escalation policy. Work an operator pushes becomes
//! visible at commit; global quiescence is detected by a token ring and
//! confirmed across a barrier round.
//!
//! The worker loop is specialized four ways over
//! `{could_abort} x {is_leader}` (`could_abort = needs_aborts && threads >
//! 1`; a lone thread cannot conflict with anyone). The remaining `needs_*`
//! flags are runtime booleans off the hot path.
//!
//! Lifecycle of one popped item:
//!
//! ```text
//! Popped --start_iteration--> Executing
//! Executing --conflict--> Aborted --push--> (abort queue, escalated) --pop--> Popped
//! Executing --success--> Committed (push buffer flushed, locks released)
//! ```
//!
//! Failure semantics: a conflict is internal and never surfaces. Any other
//! panic escaping the operator is remembered (first one wins), shuts the
//! loop down break-style, and is re-raised from [for_each] after the
//! counters have been merged and reported.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::Level;

use crate::conflict::{Conflict, ConflictContext, IterResult};
use crate::loom_testing::*;
use crate::range::BlockedRange;
use crate::substrate::barrier::Barrier;
use crate::substrate::termination::{Termination, TokenRing};
use crate::substrate::{self, ThreadPool, Topology, MAX_THREADS};
use crate::worklist::{ChunkedWorkStealing, Worklist, DEFAULT_CHUNK_SIZE};

mod aborts;
mod facing;
#[cfg(all(test, not(loom)))]
mod tests;

use aborts::{AbortHandler, Aborted};
pub use aborts::AbortPolicy;
pub use facing::{IterAlloc, UserContext};

/// Chunk limit for a package leader when a parallel break is enabled, so
/// that the leader checks the flag with bounded latency even on a full
/// queue.
const LEADER_CHUNK: usize = 64;

/// A loop operator. Implemented for every
/// `Fn(&mut T, &mut UserContext<'_, T>) -> IterResult + Sync` closure;
/// return `Err(Conflict)` (usually via `?` on a lock acquisition) to abort
/// the current iteration.
pub trait Operator<T>: Sync {
    fn call(&self, item: &mut T, cx: &mut UserContext<'_, T>) -> IterResult;
}

impl<T, F> Operator<T> for F
where
    F: Fn(&mut T, &mut UserContext<'_, T>) -> IterResult + Sync,
{
    fn call(&self, item: &mut T, cx: &mut UserContext<'_, T>) -> IterResult {
        self(item, cx)
    }
}

/// Adapts an operator that uses neither the scratch surface nor conflict
/// detection.
pub fn plain_op<T, F: Fn(&mut T)>(f: F) -> impl Fn(&mut T, &mut UserContext<'_, T>) -> IterResult {
    move |item: &mut T, _cx: &mut UserContext<'_, T>| {
        f(item);
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("thread count must be at least 1")]
    ZeroThreads,
    #[error("thread count {0} exceeds the supported maximum")]
    TooManyThreads(usize),
    #[error("topology is sized for {topology} threads but the loop wants {threads}")]
    TopologyMismatch { topology: usize, threads: usize },
    #[error("worklist chunk size must be at least 1")]
    ZeroChunk,
}

/// Loop configuration. The `needs_*` flags mirror the operator's abilities;
/// everything defaults to the speculative, pushing, counted loop.
#[derive(Clone, Debug)]
pub struct Config {
    loopname: Option<String>,
    threads: Option<usize>,
    topology: Option<Topology>,
    chunk_size: u16,
    abort_policy: AbortPolicy,
    needs_aborts: bool,
    needs_push: bool,
    needs_stats: bool,
    needs_pia: bool,
    needs_break: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loopname: None,
            threads: None,
            topology: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            abort_policy: AbortPolicy::Auto,
            needs_aborts: true,
            needs_push: true,
            needs_stats: true,
            needs_pia: false,
            needs_break: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diagnostic label used in emitted statistics.
    pub fn loopname(mut self, name: impl Into<String>) -> Self {
        self.loopname = Some(name.into());
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology = Some(topo);
        self
    }

    /// Chunk size of the default worklist built by [for_each].
    pub fn chunk_size(mut self, chunk: u16) -> Self {
        self.chunk_size = chunk;
        self
    }

    pub fn abort_policy(mut self, policy: AbortPolicy) -> Self {
        self.abort_policy = policy;
        self
    }

    /// The operator never acquires logical locks; run the cheap loop.
    pub fn disable_aborts(mut self) -> Self {
        self.needs_aborts = false;
        self
    }

    /// The operator never pushes new work.
    pub fn disable_push(mut self) -> Self {
        self.needs_push = false;
        self
    }

    /// Skip emitting loop statistics (they are still counted and returned).
    pub fn disable_stats(mut self) -> Self {
        self.needs_stats = false;
        self
    }

    /// Give the operator a per-iteration arena.
    pub fn enable_per_iter_alloc(mut self) -> Self {
        self.needs_pia = true;
        self
    }

    /// Allow the operator to request an early, orderly shutdown.
    pub fn enable_break(mut self) -> Self {
        self.needs_break = true;
        self
    }

    fn resolve(&self) -> Result<(Topology, String), ConfigError> {
        let threads = match (self.threads, &self.topology) {
            (Some(t), _) => t,
            (None, Some(topo)) => topo.threads(),
            (None, None) => substrate::default_threads(),
        };
        if threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if threads > MAX_THREADS {
            return Err(ConfigError::TooManyThreads(threads));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        let topo = match &self.topology {
            Some(topo) => {
                if topo.threads() != threads {
                    return Err(ConfigError::TopologyMismatch {
                        topology: topo.threads(),
                        threads,
                    });
                }
                topo.clone()
            }
            None => Topology::single_package(threads),
        };
        let name = self
            .loopname
            .clone()
            .unwrap_or_else(|| "(unnamed-loop)".to_owned());
        Ok((topo, name))
    }
}

/// Merged per-thread counters of one finished loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub iterations: u64,
    /// `iterations - conflicts`
    pub commits: u64,
    pub conflicts: u64,
    pub pushes: u64,
    /// Whether the loop ended through the operator's break flag.
    pub broke: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct LoopCounters {
    iterations: u64,
    conflicts: u64,
    pushes: u64,
}

// Per-worker state, allocated on the worker's own stack for locality. The
// operator, the facing view, and the context all hang off this one frame,
// which is what keeps their ownership acyclic.
struct ThreadLocalState<T> {
    tid: usize,
    ctx: ConflictContext,
    push_buf: Vec<T>,
    alloc: IterAlloc,
    counters: LoopCounters,
}

impl<T> ThreadLocalState<T> {
    fn new(tid: usize, armed: bool) -> Self {
        Self {
            tid,
            ctx: ConflictContext::new(tid, armed),
            push_buf: Vec::new(),
            alloc: IterAlloc::new(),
            counters: LoopCounters::default(),
        }
    }
}

struct ForEachExecutor<'e, W, F, T>
where
    T: Send,
    W: Worklist<T>,
    F: Operator<T>,
{
    wl: &'e W,
    function: &'e F,
    aborted: AbortHandler<T>,
    term: TokenRing,
    barrier: Barrier,
    needs_aborts: bool,
    needs_push: bool,
    needs_pia: bool,
    needs_break: bool,
    broke: AtomicBool,
    failed: AtomicBool,
    failure: Mutex<Option<Box<dyn Any + Send>>>,
}

impl<'e, W, F, T> ForEachExecutor<'e, W, F, T>
where
    T: Send,
    W: Worklist<T>,
    F: Operator<T>,
{
    fn stop_requested(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
            || (self.needs_break && self.broke.load(Ordering::Relaxed))
    }

    fn commit_iteration(&self, tld: &mut ThreadLocalState<T>, could_abort: bool) {
        if self.needs_push {
            let n = tld.push_buf.len();
            if n > 0 {
                tld.counters.pushes += n as u64;
                self.wl.push_batch(&mut tld.push_buf);
            }
        }
        if self.needs_pia {
            tld.alloc.reset();
        }
        // pushes are flushed before the locks go; a conflict observed past
        // this point is a commit and is not revertible
        if could_abort {
            tld.ctx.commit_iteration();
        }
    }

    #[inline(never)]
    fn abort_iteration(&self, item: Aborted<T>, tld: &mut ThreadLocalState<T>) {
        tld.ctx.cancel_iteration();
        tld.counters.conflicts += 1;
        if item.retries == 0 {
            self.aborted.push_new(tld.tid, item.val);
        } else {
            self.aborted.push_retry(tld.tid, item);
        }
        if self.needs_push {
            tld.push_buf.clear();
        }
        if self.needs_pia {
            tld.alloc.reset();
        }
    }

    fn record_failure(&self, payload: Box<dyn Any + Send>, tld: &mut ThreadLocalState<T>) {
        tld.ctx.cancel_iteration();
        tld.counters.conflicts += 1;
        if self.needs_push {
            tld.push_buf.clear();
        }
        if self.needs_pia {
            tld.alloc.reset();
        }
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
        drop(slot);
        self.failed.store(true, Ordering::SeqCst);
    }

    /// One operator application. `Err` hands the item back for the abort
    /// path.
    fn do_process<const COULD_ABORT: bool>(
        &self,
        item: Aborted<T>,
        tld: &mut ThreadLocalState<T>,
        spill: Option<&dyn Fn(&mut Vec<T>)>,
    ) -> Result<(), Aborted<T>> {
        if COULD_ABORT {
            tld.ctx.start_iteration();
        }
        tld.counters.iterations += 1;
        let Aborted { mut val, retries } = item;
        let result = {
            let mut cx = UserContext {
                ctx: &tld.ctx,
                push_buf: if self.needs_push {
                    Some(&mut tld.push_buf)
                } else {
                    None
                },
                pushes: &mut tld.counters.pushes,
                alloc: if self.needs_pia {
                    Some(&tld.alloc)
                } else {
                    None
                },
                broke: if self.needs_break {
                    Some(&self.broke)
                } else {
                    None
                },
                spill,
            };
            panic::catch_unwind(AssertUnwindSafe(|| self.function.call(&mut val, &mut cx)))
        };
        match result {
            Ok(Ok(())) => {
                self.commit_iteration(tld, COULD_ABORT);
                Ok(())
            }
            Ok(Err(Conflict)) if COULD_ABORT => Err(Aborted { val, retries }),
            Ok(Err(Conflict)) => {
                // a conflict signal with no abort machinery behind it is an
                // operator bug, not something we can retry
                self.record_failure(
                    Box::new("operator signalled a conflict, but aborts are disabled for this loop"),
                    tld,
                );
                Ok(())
            }
            Err(payload) => {
                self.record_failure(payload, tld);
                Ok(())
            }
        }
    }

    /// Drains `pop` until it runs dry, `limit` items have been processed
    /// (0 = unbounded), or shutdown is requested.
    fn run_queue<const COULD_ABORT: bool>(
        &self,
        tld: &mut ThreadLocalState<T>,
        mut pop: impl FnMut() -> Option<Aborted<T>>,
        limit: usize,
        spill: Option<&dyn Fn(&mut Vec<T>)>,
    ) {
        let mut num = 0usize;
        while limit == 0 || num < limit {
            if self.stop_requested() {
                break;
            }
            let Some(item) = pop() else { break };
            num += 1;
            if let Err(item) = self.do_process::<COULD_ABORT>(item, tld, spill) {
                self.abort_iteration(item, tld);
            }
        }
    }

    #[inline(never)]
    fn handle_aborts(&self, tld: &mut ThreadLocalState<T>) {
        let tid = tld.tid;
        self.run_queue::<true>(tld, || self.aborted.pop_local(tid), 0, None);
    }

    /// The worker loop proper.
    fn go<const COULD_ABORT: bool, const IS_LEADER: bool>(
        &self,
        tid: usize,
        handle: &mut W::Handle,
    ) -> LoopCounters {
        let mut tld = ThreadLocalState::new(tid, COULD_ABORT);
        let spill_fn;
        let spill: Option<&dyn Fn(&mut Vec<T>)> = if self.needs_push && !COULD_ABORT {
            spill_fn = |buf: &mut Vec<T>| self.wl.push_batch(buf);
            Some(&spill_fn)
        } else {
            None
        };

        let mut old_iterations = 0;
        loop {
            loop {
                // run some iterations
                if COULD_ABORT || self.needs_break {
                    let limit = if self.needs_break && IS_LEADER {
                        LEADER_CHUNK
                    } else {
                        0
                    };
                    self.run_queue::<COULD_ABORT>(
                        &mut tld,
                        || self.wl.pop(handle).map(|val| Aborted { val, retries: 0 }),
                        limit,
                        spill,
                    );
                    if COULD_ABORT {
                        self.handle_aborts(&mut tld);
                    }
                } else {
                    // cheap loop: no conflict scope at all
                    self.run_queue::<false>(
                        &mut tld,
                        || self.wl.pop(handle).map(|val| Aborted { val, retries: 0 }),
                        0,
                        spill,
                    );
                }

                let did_work = tld.counters.iterations != old_iterations;
                old_iterations = tld.counters.iterations;

                self.term.local_termination(tid, did_work);
                spin_hint(); // let the token circulate
                if self.term.global_termination() || self.stop_requested() {
                    break;
                }
            }

            if self.wl.empty() || self.stop_requested() {
                break;
            }
            // the hint says something is still in flight: rearm and take
            // another consensus round
            self.term.initialize_thread(tid);
            if !self.barrier.wait_cancelable(|| self.stop_requested()) {
                break;
            }
        }
        tld.counters
    }
}

/// Runs `operator` over `range` on the default chunked work-stealing
/// worklist. Returns the merged counters, or a configuration error before
/// any thread has started.
///
/// Panics raised by the operator are re-raised here after the loop has shut
/// down cleanly.
pub fn for_each<T, R, F>(range: R, operator: F, config: &Config) -> Result<LoopReport, ConfigError>
where
    T: Send,
    R: IntoIterator<Item = T>,
    F: Operator<T>,
{
    let (topo, _) = config.resolve()?;
    let wl = ChunkedWorkStealing::new(topo.threads(), config.chunk_size);
    for_each_in(&wl, range, operator, config)
}

/// [for_each] over a caller-supplied worklist. The worklist must have been
/// built for the same thread count the configuration resolves to.
pub fn for_each_in<W, T, R, F>(
    wl: &W,
    range: R,
    operator: F,
    config: &Config,
) -> Result<LoopReport, ConfigError>
where
    T: Send,
    W: Worklist<T>,
    R: IntoIterator<Item = T>,
    F: Operator<T>,
{
    let (topo, loopname) = config.resolve()?;
    let threads = topo.threads();

    let ex = ForEachExecutor {
        wl,
        function: &operator,
        aborted: AbortHandler::new(&topo, config.abort_policy),
        term: TokenRing::new(threads),
        barrier: Barrier::new(threads),
        needs_aborts: config.needs_aborts,
        needs_push: config.needs_push,
        needs_pia: config.needs_pia,
        needs_break: config.needs_break,
        broke: AtomicBool::new(false),
        failed: AtomicBool::new(false),
        failure: Mutex::new(None),
    };

    let seeds = BlockedRange::new(range.into_iter().collect::<Vec<T>>(), threads);
    let handles: Vec<Mutex<Option<W::Handle>>> = wl
        .handles()
        .into_iter()
        .map(|h| Mutex::new(Some(h)))
        .collect();
    assert_eq!(
        handles.len(),
        threads,
        "worklist was built for a different thread count"
    );

    let pool = ThreadPool::new(topo);
    let counters = pool.run(|tid| {
        let mut handle = handles[tid]
            .lock()
            .take()
            .expect("worklist handle already taken");
        ex.wl.push_initial(&mut handle, seeds.take_local(tid));
        ex.term.initialize_thread(tid);
        ex.barrier.wait();

        let could_abort = ex.needs_aborts && threads > 1;
        let is_leader = pool.topology().is_leader(tid);
        match (could_abort, is_leader) {
            (true, true) => ex.go::<true, true>(tid, &mut handle),
            (true, false) => ex.go::<true, false>(tid, &mut handle),
            (false, true) => ex.go::<false, true>(tid, &mut handle),
            (false, false) => ex.go::<false, false>(tid, &mut handle),
        }
    });

    let mut report = LoopReport::default();
    for c in &counters {
        report.iterations += c.iterations;
        report.conflicts += c.conflicts;
        report.pushes += c.pushes;
    }
    report.commits = report.iterations - report.conflicts;
    report.broke = ex.broke.load(Ordering::SeqCst);

    if config.needs_stats {
        tracing::event!(
            name: "executor::loop_stats",
            Level::INFO,
            loopname = %loopname,
            iterations = report.iterations,
            commits = report.commits,
            conflicts = report.conflicts,
            pushes = report.pushes,
            "loop finished"
        );
    }

    if let Some(payload) = ex.failure.lock().take() {
        panic::resume_unwind(payload);
    }
    Ok(report)
}

/// Runs `f(tid, nthreads)` exactly once per worker. No worklist, no
/// conflict detection, no termination protocol; used for per-thread setup
/// and teardown work.
pub fn on_each<F>(f: F, config: &Config) -> Result<(), ConfigError>
where
    F: Fn(usize, usize) + Sync,
{
    let (topo, _) = config.resolve()?;
    let threads = topo.threads();
    let pool = ThreadPool::new(topo);
    pool.run(|tid| f(tid, threads));
    Ok(())
}
