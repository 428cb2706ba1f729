//! Event queues: publishing records to user space and waiting on them.
//!
//! Two rings per endpoint: expected events (completions the library asked
//! for: medium-fragment done, pull done) and unexpected events (incoming
//! packets).  Both follow the same publication rule: the record body is
//! written first, then the id byte — the last byte of the 64-byte record —
//! with a release store.  A consumer polling the id with an acquire load
//! therefore observes the record fully written once the id matches
//! `1 + (index % 255)`.
//!
//! The unexpected ring is coupled to the recvq: every event that needs
//! payload space reserves its event slot and one recvq slot atomically
//! (`prepare`), fills the recvq slot, then commits the event.  Commit
//! writes the *next reserved* slot rather than "its own": overlapping
//! prepare/commit pairs complete in reservation order.
//!
//! # Backpressure
//!
//! `nextfree - nextreleased` never exceeds the ring size.  When the ring
//! is full the event is dropped, the matching descriptor status bit is set
//! and a counter bumped; the sender's retransmission recovers the loss.
//! The user returns quarters of the ring with the release operations.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use spin::Mutex;

use omx_abi::cmd::{WaitEvent, WaitStatus, NO_WAKEUP_JIFFIES, WAIT_EVENT_TIMEOUT_INFINITE};
use omx_abi::desc::EndpointDescStatus;
use omx_abi::events::{Event, EventRecord, EVENT_ID_OFFSET};
use omx_abi::{
    EVENT_ID_MAX, EXP_EVENTQ_ENTRY_NR, EXP_RELEASE_SLOTS_BATCH_NR, RECVQ_ENTRY_SIZE, RECVQ_SIZE,
    UNEXP_EVENTQ_ENTRY_NR, UNEXP_RELEASE_SLOTS_BATCH_NR,
};

use omx_abi::counters::Counter;
use omx_lib::klog_debug;
use omx_lib::waitqueue::WaitQueue;

use crate::endpoint::Endpoint;
use crate::OmxError;

// The unexpected ring and the recvq are sized together: one reserved
// event slot accounts exactly one recvq slot.
const _: () = assert!(UNEXP_EVENTQ_ENTRY_NR == omx_abi::RECVQ_ENTRY_NR);
// Index arithmetic is modulo 2^32 and compared against ring sizes.
const _: () = assert!(EXP_EVENTQ_ENTRY_NR < u32::MAX && UNEXP_EVENTQ_ENTRY_NR < u32::MAX);
// An id computed as 1 + (index % EVENT_ID_MAX) is never zero.
const _: () = assert!(EVENT_ID_MAX >= 1 && EVENT_ID_MAX <= 255);

// ---------------------------------------------------------------------------
// Ring storage
// ---------------------------------------------------------------------------

/// One 64-byte record slot; the id is the final byte, stored separately
/// so it can be published with a release store.
#[repr(C)]
struct EventSlot {
    body: UnsafeCell<[u8; EVENT_ID_OFFSET]>,
    id: AtomicU8,
}

// SAFETY: the body has a single writer at a time (writers serialize on
// the endpoint event lock) and readers only look at it after an acquire
// load of the id byte published by that writer.
unsafe impl Sync for EventSlot {}

struct EventStorage {
    slots: Box<[EventSlot]>,
}

impl EventStorage {
    fn new(entries: u32) -> Self {
        let mut slots = Vec::with_capacity(entries as usize);
        slots.resize_with(entries as usize, || EventSlot {
            body: UnsafeCell::new([0u8; EVENT_ID_OFFSET]),
            id: AtomicU8::new(0),
        });
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Expected id of ring index `index` once its record is published.
    #[inline]
    fn id_of_index(index: u32) -> u8 {
        (1 + (index % EVENT_ID_MAX)) as u8
    }

    /// Write the record at ring `index`; the id byte goes last.
    fn publish(&self, index: u32, record: &EventRecord) {
        let slot = &self.slots[(index as usize) % self.slots.len()];
        // SAFETY: we are the only writer (callers hold the event lock) and
        // readers are ordered by the release store below.
        unsafe {
            (*slot.body.get()).copy_from_slice(&record[..EVENT_ID_OFFSET]);
        }
        slot.id.store(Self::id_of_index(index), Ordering::Release);
    }

    /// Consumer side: the record at `index`, once its id shows it written.
    fn read(&self, index: u32) -> Option<Event> {
        let slot = &self.slots[(index as usize) % self.slots.len()];
        if slot.id.load(Ordering::Acquire) != Self::id_of_index(index) {
            return None;
        }
        let mut record: EventRecord = [0; 64];
        // SAFETY: the acquire load above ordered us after the writer's
        // release store; the slot is not rewritten until the user releases
        // it back.
        unsafe {
            record[..EVENT_ID_OFFSET].copy_from_slice(&*slot.body.get());
        }
        record[EVENT_ID_OFFSET] = Self::id_of_index(index);
        Event::decode(&record)
    }
}

// ---------------------------------------------------------------------------
// Endpoint event state
// ---------------------------------------------------------------------------

struct EventIndices {
    nextfree_exp: u32,
    nextfree_unexp: u32,
    nextreserved_unexp: u32,
    next_recvq_offset: u32,
}

/// All event machinery of one endpoint.
pub(crate) struct EndpointEvents {
    exp: EventStorage,
    unexp: EventStorage,
    /// The event lock: indices, recvq cursor, and waiter registration.
    state: Mutex<EventIndices>,
    nextreleased_exp: AtomicU32,
    nextreleased_unexp: AtomicU32,
    release_exp_lock: Mutex<()>,
    release_unexp_lock: Mutex<()>,
    pub(crate) waiters: WaitQueue,
}

impl EndpointEvents {
    pub(crate) fn new() -> Self {
        Self {
            exp: EventStorage::new(EXP_EVENTQ_ENTRY_NR),
            unexp: EventStorage::new(UNEXP_EVENTQ_ENTRY_NR),
            state: Mutex::new(EventIndices {
                nextfree_exp: 0,
                nextfree_unexp: 0,
                nextreserved_unexp: 0,
                next_recvq_offset: 0,
            }),
            nextreleased_exp: AtomicU32::new(0),
            nextreleased_unexp: AtomicU32::new(0),
            release_exp_lock: Mutex::new(()),
            release_unexp_lock: Mutex::new(()),
            waiters: WaitQueue::new(),
        }
    }

    pub(crate) fn user_read_exp(&self, index: u32) -> Option<Event> {
        self.exp.read(index)
    }

    pub(crate) fn user_read_unexp(&self, index: u32) -> Option<Event> {
        self.unexp.read(index)
    }
}

// ---------------------------------------------------------------------------
// Posting events
// ---------------------------------------------------------------------------

/// Post an expected event.
///
/// `Busy` when the ring is full — which the library's own accounting must
/// prevent: it sizes its outstanding requests to the ring, so a full ring
/// here means the triggering action is lost.
pub(crate) fn notify_exp(endpoint: &Endpoint, event: &Event) -> Result<(), OmxError> {
    let ev = &endpoint.events;
    {
        let mut state = ev.state.lock();
        if state.nextfree_exp.wrapping_sub(ev.nextreleased_exp.load(Ordering::Relaxed))
            >= EXP_EVENTQ_ENTRY_NR
        {
            klog_debug!(
                "expected event queue full on endpoint {}",
                endpoint.endpoint_index()
            );
            endpoint.iface().counters.inc(Counter::ExpEventqFull);
            endpoint
                .desc()
                .set_status_bits(EndpointDescStatus::EXP_EVENTQ_FULL);
            return Err(OmxError::Busy);
        }
        let index = state.nextfree_exp;
        state.nextfree_exp = state.nextfree_exp.wrapping_add(1);
        ev.exp.publish(index, &event.encode());
    }
    ev.waiters.wake_all(WaitStatus::Event as u8);
    Ok(())
}

/// Post an unexpected event that does not need a recvq slot.
pub(crate) fn notify_unexp(endpoint: &Endpoint, event: &Event) -> Result<(), OmxError> {
    let ev = &endpoint.events;
    {
        let mut state = ev.state.lock();
        if state
            .nextfree_unexp
            .wrapping_sub(ev.nextreleased_unexp.load(Ordering::Relaxed))
            >= UNEXP_EVENTQ_ENTRY_NR
        {
            klog_debug!(
                "unexpected event queue full on endpoint {}",
                endpoint.endpoint_index()
            );
            endpoint.iface().counters.inc(Counter::UnexpEventqFull);
            endpoint
                .desc()
                .set_status_bits(EndpointDescStatus::UNEXP_EVENTQ_FULL);
            return Err(OmxError::Busy);
        }
        state.nextfree_unexp = state.nextfree_unexp.wrapping_add(1);
        let index = state.nextreserved_unexp;
        state.nextreserved_unexp = state.nextreserved_unexp.wrapping_add(1);
        ev.unexp.publish(index, &event.encode());
    }
    ev.waiters.wake_all(WaitStatus::Event as u8);
    Ok(())
}

/// Atomically reserve one unexpected event slot and one recvq slot;
/// returns the recvq byte offset.  Must be followed by exactly one commit
/// or cancel.
pub(crate) fn prepare_notify_unexp_with_recvq(endpoint: &Endpoint) -> Result<u32, OmxError> {
    let mut offsets = [0u32; 1];
    prepare_notify_unexp_with_recvqs(endpoint, &mut offsets)?;
    Ok(offsets[0])
}

/// Reserve `offsets.len()` consecutive unexpected event slots and as many
/// recvq slots.
pub(crate) fn prepare_notify_unexp_with_recvqs(
    endpoint: &Endpoint,
    offsets: &mut [u32],
) -> Result<(), OmxError> {
    let nr = offsets.len() as u32;
    let ev = &endpoint.events;
    let mut state = ev.state.lock();
    if state
        .nextfree_unexp
        .wrapping_add(nr - 1)
        .wrapping_sub(ev.nextreleased_unexp.load(Ordering::Relaxed))
        >= UNEXP_EVENTQ_ENTRY_NR
    {
        klog_debug!(
            "unexpected event queue full on endpoint {}",
            endpoint.endpoint_index()
        );
        endpoint.iface().counters.inc(Counter::UnexpEventqFull);
        endpoint
            .desc()
            .set_status_bits(EndpointDescStatus::UNEXP_EVENTQ_FULL);
        return Err(OmxError::Busy);
    }
    state.nextfree_unexp = state.nextfree_unexp.wrapping_add(nr);
    for off in offsets.iter_mut() {
        *off = state.next_recvq_offset;
        state.next_recvq_offset += RECVQ_ENTRY_SIZE;
        if state.next_recvq_offset >= RECVQ_SIZE {
            // All slots have the same size, so no slot wraps around the
            // end of the ring.
            state.next_recvq_offset = 0;
        }
    }
    Ok(())
}

/// Commit one previously reserved slot, in reservation order.
pub(crate) fn commit_notify_unexp_with_recvq(endpoint: &Endpoint, event: &Event) {
    let ev = &endpoint.events;
    {
        let mut state = ev.state.lock();
        let released = ev.nextreleased_unexp.load(Ordering::Relaxed);
        // A commit without a prior reserve is a driver bug.
        debug_assert!(
            state.nextreserved_unexp.wrapping_sub(released)
                < state.nextfree_unexp.wrapping_sub(released)
        );
        let index = state.nextreserved_unexp;
        state.nextreserved_unexp = state.nextreserved_unexp.wrapping_add(1);
        ev.unexp.publish(index, &event.encode());
    }
    ev.waiters.wake_all(WaitStatus::Event as u8);
}

/// Spend a reserved slot without an event: the recvq slot cannot be
/// reclaimed (slots are fixed-size, no wraparound across one slot), so an
/// `Ignore` record fills the next reserved event slot and the user skips
/// it.
pub(crate) fn cancel_notify_unexp_with_recvq(endpoint: &Endpoint) {
    let ev = &endpoint.events;
    let mut state = ev.state.lock();
    let released = ev.nextreleased_unexp.load(Ordering::Relaxed);
    debug_assert!(
        state.nextreserved_unexp.wrapping_sub(released)
            < state.nextfree_unexp.wrapping_sub(released)
    );
    let index = state.nextreserved_unexp;
    state.nextreserved_unexp = state.nextreserved_unexp.wrapping_add(1);
    ev.unexp.publish(index, &Event::Ignore.encode());
    // No wakeup: there is nothing for the user to process.
}

// ---------------------------------------------------------------------------
// Releasing slots
// ---------------------------------------------------------------------------

/// Advance the released index of the expected ring by one quarter.
pub(crate) fn release_exp_slots(endpoint: &Endpoint) -> Result<(), OmxError> {
    let ev = &endpoint.events;
    let _guard = ev.release_exp_lock.lock();
    let nextfree = ev.state.lock().nextfree_exp;
    let released = ev.nextreleased_exp.load(Ordering::Relaxed);
    if nextfree.wrapping_sub(released) < EXP_RELEASE_SLOTS_BATCH_NR {
        return Err(OmxError::Invalid);
    }
    ev.nextreleased_exp
        .store(released.wrapping_add(EXP_RELEASE_SLOTS_BATCH_NR), Ordering::Relaxed);
    Ok(())
}

/// Advance the released index of the unexpected ring by one quarter.
pub(crate) fn release_unexp_slots(endpoint: &Endpoint) -> Result<(), OmxError> {
    let ev = &endpoint.events;
    let _guard = ev.release_unexp_lock.lock();
    let nextreserved = ev.state.lock().nextreserved_unexp;
    let released = ev.nextreleased_unexp.load(Ordering::Relaxed);
    if nextreserved.wrapping_sub(released) < UNEXP_RELEASE_SLOTS_BATCH_NR {
        return Err(OmxError::Invalid);
    }
    ev.nextreleased_unexp.store(
        released.wrapping_add(UNEXP_RELEASE_SLOTS_BATCH_NR),
        Ordering::Relaxed,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Waiting and wakeup
// ---------------------------------------------------------------------------

/// Sleep until an event, a wakeup, a deadline, or retransmission-progress
/// time.
///
/// Returns `Race` immediately when the caller's snapshot of the queue
/// indices is stale — events arrived that the library has not seen yet —
/// or when the effective deadline has already passed.
pub(crate) fn wait_event(endpoint: &Endpoint, cmd: &WaitEvent) -> WaitStatus {
    let Some(driver) = endpoint.driver() else {
        return WaitStatus::Wakeup;
    };
    let clock = driver.clock();
    let ev = &endpoint.events;

    // The library's progress deadline, read before queueing.
    let wakeup_jiffies = endpoint
        .desc()
        .wakeup_jiffies
        .load(Ordering::Relaxed);

    // Queue ourself first so a packet arriving in the meantime wakes us.
    let waiter = {
        let state = ev.state.lock();
        let waiter = ev.waiters.prepare();
        let user_event_index = endpoint
            .desc()
            .user_event_index
            .load(Ordering::Relaxed);
        if cmd.next_exp_event_index != state.nextfree_exp
            || cmd.next_unexp_event_index != state.nextreserved_unexp
            || cmd.user_event_index != user_event_index
        {
            klog_debug!(
                "wait event race ({},{},{}) != ({},{},{})",
                cmd.next_exp_event_index,
                cmd.next_unexp_event_index,
                cmd.user_event_index,
                state.nextfree_exp,
                state.nextreserved_unexp,
                user_event_index
            );
            drop(state);
            ev.waiters.abandon(&waiter);
            return WaitStatus::Race;
        }
        waiter
    };

    // Pick the earliest of the caller's deadline and the progress wakeup.
    let mut timer: Option<(u64, WaitStatus)> = None;
    if cmd.jiffies_expire != WAIT_EVENT_TIMEOUT_INFINITE {
        timer = Some((cmd.jiffies_expire, WaitStatus::Timeout));
    }
    if wakeup_jiffies != NO_WAKEUP_JIFFIES
        && timer.map_or(true, |(deadline, _)| wakeup_jiffies < deadline)
    {
        timer = Some((wakeup_jiffies, WaitStatus::Progress));
    }

    if let Some((deadline, _)) = timer {
        if clock.time_after_eq(deadline) {
            // The expiry already passed; don't sleep.
            ev.waiters.abandon(&waiter);
            return WaitStatus::Race;
        }
    }

    let status = ev.waiters.wait(&waiter, || {
        timer.and_then(|(deadline, status)| clock.time_after_eq(deadline).then_some(status as u8))
    });

    WaitStatus::from_u8(status).unwrap_or(WaitStatus::Intr)
}

/// Wake all waiters with `status`.
pub(crate) fn wakeup(endpoint: &Endpoint, status: WaitStatus) {
    endpoint.events.waiters.wake_all(status as u8);
}
