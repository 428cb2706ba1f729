//! Data-driven timer wheel for the transport.
//!
//! All driver timers (today: pull-handle retransmission) go through one
//! wheel with typed dispatch.  No bare `fn()` callbacks — entries carry a
//! [`TimerEvent`] that owns whatever references the handler needs, so a
//! pending timer holds its pull handle (and therefore its endpoint) alive
//! exactly like a reference-counted kernel timer would.
//!
//! # Architecture
//!
//! The wheel has 256 slots.  [`TimerWheel::advance_to`] catches the wheel
//! up with the jiffies clock and drains every entry whose deadline has
//! been reached.  Per-slot work is bounded: if more than
//! [`MAX_TIMERS_PER_SLOT`] entries expire in one slot, the remainder fire
//! on the next advance.
//!
//! # Concurrency
//!
//! The wheel's internal state is protected by a spin mutex.  Expired
//! entries are collected under the lock, then dispatched by the caller
//! **outside** the lock, so dispatch handlers are free to schedule or
//! cancel timers without deadlocking.
//!
//! Cancellation removes the entry and returns its payload; a `None`
//! return means the entry already fired (or was collected for dispatch),
//! which is the "synchronous cancel failed, the handler will observe the
//! state itself" case of the pull close protocol.

use std::sync::Arc;

use spin::Mutex;

use crate::pull::PullHandle;

/// Number of slots in the timer wheel.
const NUM_SLOTS: usize = 256;

/// Maximum number of entries fired from a single slot per advance.
pub const MAX_TIMERS_PER_SLOT: usize = 32;

/// What to do when a timer fires.
pub enum TimerEvent {
    /// Run the retransmission handler of this pull handle.
    PullRetransmit(Arc<PullHandle>),
}

/// Opaque, monotonically increasing token for timer cancellation.
///
/// Tokens are never reused; the generator is a 64-bit counter.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerToken(u64);

impl TimerToken {
    /// A sentinel token that never matches any scheduled timer.
    pub const INVALID: Self = Self(0);
}

struct TimerEntry {
    /// Absolute tick at which this entry fires.
    deadline_tick: u64,
    token: TimerToken,
    event: TimerEvent,
}

struct WheelInner {
    slots: [Vec<TimerEntry>; NUM_SLOTS],
    /// Last tick that was fully processed.
    current_tick: u64,
    next_token: u64,
}

/// The driver's timer wheel.
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WheelInner {
                slots: [const { Vec::new() }; NUM_SLOTS],
                current_tick: 0,
                next_token: 1,
            }),
        }
    }

    /// Schedule `event` to fire at the absolute tick `deadline_tick`.
    ///
    /// A deadline at or before the current tick fires on the next advance.
    pub fn schedule_at(&self, deadline_tick: u64, event: TimerEvent) -> TimerToken {
        let mut inner = self.inner.lock();
        let token = TimerToken(inner.next_token);
        inner.next_token += 1;
        // A past deadline must still land in a slot the next advance
        // visits.
        let deadline_tick = deadline_tick.max(inner.current_tick + 1);
        let slot_idx = (deadline_tick % NUM_SLOTS as u64) as usize;
        inner.slots[slot_idx].push(TimerEntry {
            deadline_tick,
            token,
            event,
        });
        token
    }

    /// Cancel a pending timer, returning its payload.
    ///
    /// `None` means the entry was not found: it already fired or is being
    /// dispatched right now.  O(n) in the number of pending entries, which
    /// stays small.
    pub fn cancel(&self, token: TimerToken) -> Option<TimerEvent> {
        if token == TimerToken::INVALID {
            return None;
        }
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if let Some(pos) = slot.iter().position(|e| e.token == token) {
                return Some(slot.swap_remove(pos).event);
            }
        }
        None
    }

    /// Advance the wheel to `target_tick` and collect everything due.
    ///
    /// The caller dispatches the returned events with no wheel lock held.
    pub fn advance_to(&self, target_tick: u64) -> Vec<TimerEvent> {
        let mut inner = self.inner.lock();
        let current = inner.current_tick;
        if target_tick <= current {
            return Vec::new();
        }

        // One full revolution visits every slot; scanning more than
        // NUM_SLOTS ticks would revisit them.
        let ticks_behind = target_tick - current;
        let slots_to_scan = ticks_behind.min(NUM_SLOTS as u64);

        let mut fired = Vec::new();
        for i in 1..=slots_to_scan {
            let slot_idx = ((current + i) % NUM_SLOTS as u64) as usize;
            let slot = &mut inner.slots[slot_idx];
            let mut pos = 0;
            let mut fired_in_slot = 0;
            while pos < slot.len() {
                if fired_in_slot >= MAX_TIMERS_PER_SLOT {
                    // Defer the rest to the next advance.
                    break;
                }
                if slot[pos].deadline_tick <= target_tick {
                    fired.push(slot.swap_remove(pos).event);
                    fired_in_slot += 1;
                    // Don't advance pos — swap_remove moved the last
                    // element here.
                } else {
                    pos += 1;
                }
            }
        }
        inner.current_tick = target_tick;
        fired
    }

    /// Last fully processed tick (diagnostic).
    pub fn current_tick(&self) -> u64 {
        self.inner.lock().current_tick
    }

    /// Number of pending entries across all slots (diagnostic).
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().map(|s| s.len()).sum()
    }
}

impl core::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TimerWheel(pending={})", self.pending_count())
    }
}
