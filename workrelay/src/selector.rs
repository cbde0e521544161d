//! Round-robin slot selection for the worker pool.

use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::Pid;

/// Cyclic index generator yielding `0, 1, .., size - 1, 0, 1, ..`.
///
/// The counter is stored already wrapped, so it never overflows and every
/// observed value lies in `[0, size)`. Increment-and-wrap is a single atomic
/// read-modify-write, which keeps the distribution even when several request
/// handlers dispatch at the same time.
#[derive(Debug)]
pub struct RoundRobin {
    next: AtomicUsize,
    size: NonZeroUsize,
}

impl RoundRobin {
    pub fn new(size: NonZeroUsize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Returns the next slot index and advances the counter by one.
    pub fn next_index(&self) -> Pid {
        let size = self.size.get();

        // The closure never returns `None`, so both arms carry the previous
        // value of the counter.
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current + 1) % size)
            }) {
            Ok(previous) | Err(previous) => previous,
        }
    }
}
