//! Wait queue for blocking event waiters.
//!
//! Each waiter carries an 8-bit status word.  Wakers store the wakeup
//! status into every queued waiter and wake them all; a waiter that wakes
//! with status still zero was woken spuriously and re-checks its own time
//! conditions through the `poll` closure it passed to [`WaitQueue::wait`].
//!
//! # Design
//!
//! - Waiters are queued before the caller's final condition check, so a
//!   wakeup issued between the check and the sleep is never lost: the
//!   status word is already reachable from the queue.
//! - Wakers set the status first and notify afterwards; the waiter
//!   re-reads the status under the queue mutex, so no ordering is lost.
//! - Time conditions (deadlines, progress wakeups) are the waiter's own
//!   business: the queue re-polls them at a bounded interval instead of
//!   arming per-waiter timers, so a host-advanced clock works unchanged.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Status meaning "nothing happened yet".
pub const WAITER_STATUS_NONE: u8 = 0;

/// Re-poll interval for time conditions.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One blocked (or about to block) task.
#[derive(Debug)]
pub struct Waiter {
    status: AtomicU8,
}

impl Waiter {
    #[inline]
    pub fn status(&self) -> u8 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Release);
    }
}

/// A wait queue whose wakers deliver a status to every waiter.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: Mutex<Vec<Arc<Waiter>>>,
    condvar: Condvar,
    /// Monotonic counter incremented on each wake, for diagnostics.
    generation: AtomicU32,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new waiter.  The caller typically does this under its own
    /// state lock, checks its race conditions, then calls [`wait`].
    ///
    /// [`wait`]: WaitQueue::wait
    pub fn prepare(&self) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter {
            status: AtomicU8::new(WAITER_STATUS_NONE),
        });
        self.waiters.lock().unwrap().push(waiter.clone());
        waiter
    }

    /// Remove a prepared waiter without sleeping (race detected after
    /// `prepare`).
    pub fn abandon(&self, waiter: &Arc<Waiter>) {
        let mut waiters = self.waiters.lock().unwrap();
        waiters.retain(|w| !Arc::ptr_eq(w, waiter));
    }

    /// Block until the waiter's status becomes nonzero or `poll` reports a
    /// terminal status.  Returns the final status and dequeues the waiter.
    ///
    /// `poll` is invoked repeatedly (at least every millisecond of real
    /// time) and returns `Some(status)` when a time condition has tripped.
    pub fn wait<F: FnMut() -> Option<u8>>(&self, waiter: &Arc<Waiter>, mut poll: F) -> u8 {
        let mut waiters = self.waiters.lock().unwrap();
        let status = loop {
            let status = waiter.status();
            if status != WAITER_STATUS_NONE {
                break status;
            }
            if let Some(status) = poll() {
                waiter.set_status(status);
                break status;
            }
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(waiters, POLL_INTERVAL)
                .unwrap();
            waiters = guard;
        };
        waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        status
    }

    /// Wake every queued waiter with `status`.  Returns how many were
    /// woken.
    pub fn wake_all(&self, status: u8) -> usize {
        let waiters = self.waiters.lock().unwrap();
        for waiter in waiters.iter() {
            waiter.set_status(status);
        }
        let woken = waiters.len();
        drop(waiters);
        if woken > 0 {
            self.generation.fetch_add(1, Ordering::Relaxed);
            self.condvar.notify_all();
        }
        woken
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().unwrap().is_empty()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Wake generation counter (diagnostics and tests).
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }
}
