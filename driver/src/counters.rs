//! Per-interface counter array.
//!
//! Counters are statistics, not synchronization: increments are relaxed
//! atomics so any context (send path, receive soft-context, timers) may
//! bump them without coordination, and snapshots are only approximately
//! consistent.

use core::sync::atomic::{AtomicU64, Ordering};

use omx_abi::counters::{Counter, COUNTER_INDEX_MAX};

/// A flat array of counters indexed by [`Counter`].
pub struct CounterSet {
    counters: Box<[AtomicU64]>,
}

impl Default for CounterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSet {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(COUNTER_INDEX_MAX);
        v.resize_with(COUNTER_INDEX_MAX, || AtomicU64::new(0));
        Self {
            counters: v.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn inc(&self, which: Counter) {
        self.counters[which as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, which: Counter) -> u64 {
        self.counters[which as usize].load(Ordering::Relaxed)
    }

    /// Snapshot all counters, optionally clearing them.
    pub fn snapshot(&self, clear: bool) -> Vec<u64> {
        self.counters
            .iter()
            .map(|c| {
                if clear {
                    c.swap(0, Ordering::Relaxed)
                } else {
                    c.load(Ordering::Relaxed)
                }
            })
            .collect()
    }

    pub fn clear(&self) {
        for c in self.counters.iter() {
            c.store(0, Ordering::Relaxed);
        }
    }
}

impl core::fmt::Debug for CounterSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "CounterSet({} counters)", self.counters.len())
    }
}
