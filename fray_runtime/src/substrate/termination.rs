//! Distributed termination detection.
//!
//! [TokenRing] circulates a token over the worker tids. The token word is
//! bit packed:
//! - `bits[31:0]` = holder tid
//! - `bits[63:32]` = clean streak (consecutive advances that saw no work)
//!
//! A thread that did work since its last visit marks its dirty flag; when
//! the token reaches it, the streak resets. Quiescence needs the streak to
//! cover two full circulations (>= 2 * nthreads): one clean pass is not
//! enough, because a thread can pop an item right after its own visit and
//! still be processing it while the remaining threads complete the lap.
//! With two laps every thread advances twice, any pop between its two
//! visits resets the streak, and a thread that is still busy stalls the
//! token outright. On top of that the executor's outer loop re-checks the
//! worklist's emptiness hint across a barrier before really exiting.

use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;
use tracing::Level;

use crate::loom_testing::*;

const fn pack_token(holder: usize, streak: u64) -> u64 {
    (streak << 32) | holder as u64
}
const fn token_holder(t: u64) -> usize {
    (t & 0xFFFF_FFFF) as usize
}
const fn token_streak(t: u64) -> u64 {
    t >> 32
}

/// Two-phase quiescence contract: threads report local activity each round,
/// then all threads observe the same global verdict.
pub trait Termination: Send + Sync {
    /// Rearms this thread's slot for a fresh round. Every thread calls this
    /// before crossing the round barrier; tid 0 also resets the shared
    /// state. Nothing may call [Termination::global_termination] between
    /// the first rearm and the barrier.
    fn initialize_thread(&self, tid: usize);

    /// Reports whether this thread completed any iteration since its last
    /// report, and advances the token if this thread holds it.
    fn local_termination(&self, tid: usize, did_work: bool);

    /// True once all threads have reported quiet for two full
    /// circulations.
    fn global_termination(&self) -> bool;
}

#[derive(Debug)]
pub struct TokenRing {
    threads: usize,
    dirty: Vec<CachePadded<AtomicBool>>,
    token: CachePadded<AtomicU64>,
    quiesced: CachePadded<AtomicBool>,
}

impl TokenRing {
    pub fn new(threads: usize) -> Self {
        assert!(threads >= 1);
        Self {
            threads,
            dirty: (0..threads)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
            token: CachePadded::new(AtomicU64::new(pack_token(0, 0))),
            quiesced: CachePadded::new(AtomicBool::new(false)),
        }
    }
}

impl Termination for TokenRing {
    fn initialize_thread(&self, tid: usize) {
        self.dirty[tid].store(false, Ordering::Relaxed);
        if tid == 0 {
            self.quiesced.store(false, Ordering::Relaxed);
            self.token.store(pack_token(0, 0), Ordering::Release);
        }
    }

    fn local_termination(&self, tid: usize, did_work: bool) {
        if did_work {
            self.dirty[tid].store(true, Ordering::Relaxed);
        }
        let t = self.token.load(Ordering::Acquire);
        if token_holder(t) != tid {
            return;
        }
        let streak = if self.dirty[tid].swap(false, Ordering::Relaxed) {
            0
        } else {
            token_streak(t) + 1
        };
        if streak as usize >= 2 * self.threads {
            tracing::event!(name: "termination::quiesced", Level::TRACE, tid, "quiesced");
            self.quiesced.store(true, Ordering::Release);
        }
        self.token
            .store(pack_token((tid + 1) % self.threads, streak), Ordering::Release);
    }

    fn global_termination(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }
}
