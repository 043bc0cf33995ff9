//! Shared bags of pending work.
//!
//! The executor relies only on the small contract in [Worklist]: push from
//! any thread, a strictly non-blocking per-thread pop, bulk push, seeding,
//! and an optional emptiness hint. Pop order and fairness are up to the
//! implementation.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::loom_testing::AtomicUsize;


/// Default chunk (local buffer) size for the chunked work-stealing list.
pub const DEFAULT_CHUNK_SIZE: u16 = 32;

pub trait Worklist<T: Send>: Send + Sync {
    /// Per-thread pop handle.
    type Handle: Send;

    /// Creates the per-thread handles, in tid order. Called exactly once
    /// per parallel region.
    fn handles(&self) -> Vec<Self::Handle>;

    /// Pushes one item. Safe from any thread, with or without a handle.
    /// Ownership passes from pusher to whichever thread later pops it.
    fn push(&self, item: T);

    /// Bulk push; drains the vector. Semantically a loop of [Worklist::push].
    fn push_batch(&self, items: &mut Vec<T>) {
        for item in items.drain(..) {
            self.push(item);
        }
    }

    /// Non-blocking pop through this thread's handle. `None` means
    /// "nothing visible right now", not "globally empty".
    fn pop(&self, handle: &mut Self::Handle) -> Option<T>;

    /// Seeds this thread's share of the initial range.
    fn push_initial(&self, handle: &mut Self::Handle, items: Vec<T>);

    /// Emptiness hint consulted once per thread after global quiescence.
    /// Must be stable while no thread is pushing, so that every thread
    /// reaches the same verdict. The default (`true`, "looks empty")
    /// matches a worklist without a cheap size estimate and lets the loop
    /// exit.
    fn empty(&self) -> bool {
        true
    }
}

/// The default worklist: chunked work-stealing FIFO. Each thread owns a
/// fixed-size local buffer (one chunk); overflow and foreign pushes go
/// through the shared global queue, and an idle thread steals from its
/// siblings. An atomic size estimate backs [Worklist::empty].
pub struct ChunkedWorkStealing<T: Send> {
    global: work_queue::Queue<T>,
    len: CachePadded<AtomicUsize>,
    threads: usize,
}

impl<T: Send> ChunkedWorkStealing<T> {
    pub fn new(threads: usize, chunk: u16) -> Self {
        assert!(threads >= 1);
        assert!(chunk >= 1);
        Self {
            global: work_queue::Queue::new(threads, chunk),
            len: CachePadded::new(AtomicUsize::new(0)),
            threads,
        }
    }
}

impl<T: Send> Worklist<T> for ChunkedWorkStealing<T> {
    type Handle = work_queue::LocalQueue<T>;

    fn handles(&self) -> Vec<Self::Handle> {
        let handles: Vec<_> = self.global.local_queues().collect();
        assert_eq!(handles.len(), self.threads);
        handles
    }

    fn push(&self, item: T) {
        self.len.fetch_add(1, Ordering::Relaxed);
        self.global.push(item);
    }

    fn pop(&self, handle: &mut Self::Handle) -> Option<T> {
        let item = handle.pop();
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    fn push_initial(&self, handle: &mut Self::Handle, items: Vec<T>) {
        for item in items {
            self.len.fetch_add(1, Ordering::Relaxed);
            handle.push(item);
        }
    }

    fn empty(&self) -> bool {
        self.len.load(Ordering::Relaxed) == 0
    }
}

/// Plain global FIFO behind a mutex: strict arrival order across all
/// threads, no locality. Mostly useful for tests and for operators that
/// want predictable draining.
pub struct GlobalFifo<T: Send> {
    inner: Mutex<VecDeque<T>>,
    threads: usize,
}

impl<T: Send> GlobalFifo<T> {
    pub fn new(threads: usize) -> Self {
        assert!(threads >= 1);
        Self {
            inner: Mutex::new(VecDeque::new()),
            threads,
        }
    }
}

impl<T: Send> Worklist<T> for GlobalFifo<T> {
    type Handle = ();

    fn handles(&self) -> Vec<()> {
        vec![(); self.threads]
    }

    fn push(&self, item: T) {
        self.inner.lock().push_back(item);
    }

    fn push_batch(&self, items: &mut Vec<T>) {
        self.inner.lock().extend(items.drain(..));
    }

    fn pop(&self, _handle: &mut ()) -> Option<T> {
        self.inner.lock().pop_front()
    }

    fn push_initial(&self, _handle: &mut (), items: Vec<T>) {
        self.inner.lock().extend(items);
    }

    fn empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
