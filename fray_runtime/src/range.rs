//! Seed-range partitioning.
//!
//! A [BlockedRange] hands each worker one contiguous block of the input,
//! computed with the usual `tid * len / threads` bounds so the blocks
//! differ in size by at most one. Workers take their block exactly once,
//! during seeding, and push it into their local worklist slice.

use parking_lot::Mutex;

pub struct BlockedRange<T> {
    slices: Vec<Mutex<Option<Vec<T>>>>,
}

impl<T> BlockedRange<T> {
    pub fn new(mut items: Vec<T>, threads: usize) -> Self {
        assert!(threads >= 1);
        let len = items.len();
        let mut slices = Vec::with_capacity(threads);
        // split back to front so each split_off moves only one block
        for tid in (0..threads).rev() {
            let tail = items.split_off(tid * len / threads);
            slices.push(Mutex::new(Some(tail)));
        }
        slices.reverse();
        Self { slices }
    }

    /// Takes thread `tid`'s block. Each block can be taken once; taking it
    /// again yields an empty vector.
    pub fn take_local(&self, tid: usize) -> Vec<T> {
        self.slices[tid].lock().take().unwrap_or_default()
    }
}
