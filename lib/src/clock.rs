//! Jiffies soft-clock.
//!
//! The transport is driven entirely by a monotonic tick counter ("jiffies")
//! that the host environment advances, either from a real timer tick or
//! explicitly from tests.  Everything time-related in the driver (pull
//! retransmission, wait deadlines, progress wakeups) compares against this
//! counter, which makes timer behavior fully deterministic under test.

use core::sync::atomic::{AtomicU64, Ordering};

/// Ticks per second.
pub const HZ: u64 = 1000;

/// A monotonic tick counter advanced by the host.
#[derive(Debug, Default)]
pub struct JiffiesClock {
    jiffies: AtomicU64,
}

impl JiffiesClock {
    pub const fn new() -> Self {
        Self {
            jiffies: AtomicU64::new(0),
        }
    }

    /// Current jiffies value.
    #[inline]
    pub fn now(&self) -> u64 {
        self.jiffies.load(Ordering::Acquire)
    }

    /// Advance the clock by `ticks`; returns the new value.
    pub fn advance(&self, ticks: u64) -> u64 {
        self.jiffies.fetch_add(ticks, Ordering::AcqRel) + ticks
    }

    /// `true` once `deadline` has been reached.
    #[inline]
    pub fn time_after_eq(&self, deadline: u64) -> bool {
        self.now() >= deadline
    }
}

/// Convert milliseconds to jiffies, rounding up.
#[inline]
pub const fn msecs_to_jiffies(ms: u64) -> u64 {
    (ms * HZ).div_ceil(1000)
}
