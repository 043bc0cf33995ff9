//! Sense-reversing spin barrier.
//!
//! The generation counter doubles as the sense: a waiter snapshots the
//! generation on entry and spins until it moves. The last arrival resets
//! the arrival count *before* bumping the generation, so a thread racing
//! into the next round can never observe a stale count.

use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;

use crate::loom_testing::*;

#[derive(Debug)]
pub struct Barrier {
    total: usize,
    arrived: CachePadded<AtomicUsize>,
    generation: CachePadded<AtomicUsize>,
}

impl Barrier {
    pub fn new(total: usize) -> Self {
        assert!(total >= 1);
        Self {
            total,
            arrived: CachePadded::new(AtomicUsize::new(0)),
            generation: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Blocks (spinning) until all `total` threads have arrived.
    pub fn wait(&self) {
        self.wait_cancelable(|| false);
    }

    /// Like [wait], but gives up when `cancelled` turns true while spinning.
    /// Returns `false` on cancellation. Once any waiter has been cancelled
    /// the barrier must not be reused; the cancellation condition is
    /// expected to be sticky and to take every other participant down the
    /// same exit path.
    pub fn wait_cancelable(&self, cancelled: impl Fn() -> bool) -> bool {
        let gen = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.total {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            true
        } else {
            loop {
                if self.generation.load(Ordering::Acquire) != gen {
                    return true;
                }
                if cancelled() {
                    return false;
                }
                spin_hint();
            }
        }
    }
}
