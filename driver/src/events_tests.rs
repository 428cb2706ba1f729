//! Event queue tests: backpressure, publication order, the reserve/commit
//! protocol, and waiting.

use std::thread;
use std::time::Duration;

use omx_abi::cmd::{WaitEvent, WaitStatus, NO_WAKEUP_JIFFIES, WAIT_EVENT_TIMEOUT_INFINITE};
use omx_abi::counters::Counter;
use omx_abi::desc::EndpointDescStatus;
use omx_abi::events::{Event, EvtSendMediumFragDone};
use omx_abi::{EXP_EVENTQ_ENTRY_NR, RECVQ_ENTRY_SIZE};

use crate::events;
use crate::test_fixtures::rig;
use crate::OmxError;

fn medium_done(sendq_offset: u32) -> Event {
    Event::SendMediumFragDone(EvtSendMediumFragDone { sendq_offset })
}

/// A fresh waiter snapshot for an endpoint with no consumed events.
fn fresh_snapshot(deadline: u64) -> WaitEvent {
    WaitEvent {
        user_event_index: 0,
        next_exp_event_index: 0,
        next_unexp_event_index: 0,
        jiffies_expire: deadline,
    }
}

// =============================================================================
// Backpressure
// =============================================================================

#[test]
fn exp_queue_full_sets_status_bit_and_counter() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    for i in 0..EXP_EVENTQ_ENTRY_NR {
        events::notify_exp(&endpoint, &medium_done(i)).unwrap();
    }

    // The ring is full: the event is dropped, the library learns it from
    // the descriptor status bit.
    assert_eq!(
        events::notify_exp(&endpoint, &medium_done(0)),
        Err(OmxError::Busy)
    );
    assert!(endpoint
        .desc()
        .status_bits()
        .contains(EndpointDescStatus::EXP_EVENTQ_FULL));
    let iface = rig.driver.iface(rig.board_a).unwrap();
    assert_eq!(iface.counters.get(Counter::ExpEventqFull), 1);

    // One release batch frees a quarter of the ring.
    events::release_exp_slots(&endpoint).unwrap();
    events::notify_exp(&endpoint, &medium_done(1)).unwrap();
}

#[test]
fn release_needs_a_full_batch_outstanding() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    for i in 0..10 {
        events::notify_exp(&endpoint, &medium_done(i)).unwrap();
    }
    assert_eq!(events::release_exp_slots(&endpoint), Err(OmxError::Invalid));
    assert_eq!(
        events::release_unexp_slots(&endpoint),
        Err(OmxError::Invalid)
    );
}

// =============================================================================
// Publication
// =============================================================================

#[test]
fn records_become_readable_in_posting_order() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    // Nothing readable on a fresh ring.
    assert_eq!(endpoint.user_read_exp_event(0), None);

    for i in 0..3 {
        events::notify_exp(&endpoint, &medium_done(100 + i)).unwrap();
    }
    for i in 0..3u32 {
        match endpoint.user_read_exp_event(i) {
            Some(Event::SendMediumFragDone(done)) => {
                assert_eq!(done.sendq_offset, 100 + i);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    // The next slot is not published yet.
    assert_eq!(endpoint.user_read_exp_event(3), None);
}

#[test]
fn reserve_commit_cancel_pairs_event_and_recvq_slots() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    let mut offsets = [0u32; 2];
    events::prepare_notify_unexp_with_recvqs(&endpoint, &mut offsets).unwrap();
    assert_eq!(offsets[0], 0);
    assert_eq!(offsets[1], RECVQ_ENTRY_SIZE);

    // Cancelling spends the first reserved slot with an Ignore record;
    // the commit lands on the second.
    events::cancel_notify_unexp_with_recvq(&endpoint);
    events::commit_notify_unexp_with_recvq(&endpoint, &medium_done(4096));

    assert_eq!(endpoint.user_read_unexp_event(0), Some(Event::Ignore));
    assert_eq!(
        endpoint.user_read_unexp_event(1),
        Some(medium_done(4096))
    );
}

// =============================================================================
// Waiting
// =============================================================================

#[test]
fn wait_event_detects_stale_snapshots() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    events::notify_exp(&endpoint, &medium_done(0)).unwrap();

    // The library thinks no event arrived; the kernel knows better.
    let status = rig
        .driver
        .wait_event(&endpoint, &fresh_snapshot(WAIT_EVENT_TIMEOUT_INFINITE));
    assert_eq!(status, WaitStatus::Race);
}

#[test]
fn wait_event_race_when_deadline_already_passed() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    rig.driver.clock().advance(100);
    let status = rig.driver.wait_event(&endpoint, &fresh_snapshot(50));
    assert_eq!(status, WaitStatus::Race);
}

#[test]
fn wait_event_times_out_at_the_deadline() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    let driver = rig.driver.clone();
    let ep = endpoint.clone();
    let waiter = thread::spawn(move || driver.wait_event(&ep, &fresh_snapshot(50)));

    // Let the waiter park, then advance the clock past the deadline.
    while !endpoint.events.waiters.has_waiters() {
        thread::sleep(Duration::from_millis(1));
    }
    rig.driver.clock().advance(100);
    assert_eq!(waiter.join().unwrap(), WaitStatus::Timeout);
}

#[test]
fn wakeup_delivers_its_status_to_all_waiters() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    let driver = rig.driver.clone();
    let ep = endpoint.clone();
    let waiter = thread::spawn(move || {
        driver.wait_event(&ep, &fresh_snapshot(WAIT_EVENT_TIMEOUT_INFINITE))
    });

    while !endpoint.events.waiters.has_waiters() {
        thread::sleep(Duration::from_millis(1));
    }
    rig.driver.wakeup(&endpoint, WaitStatus::Wakeup);
    assert_eq!(waiter.join().unwrap(), WaitStatus::Wakeup);
}

#[test]
fn progress_wakeup_fires_before_the_deadline() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    assert_eq!(NO_WAKEUP_JIFFIES, 0);
    endpoint.user_set_wakeup_jiffies(20);

    let driver = rig.driver.clone();
    let ep = endpoint.clone();
    let waiter = thread::spawn(move || driver.wait_event(&ep, &fresh_snapshot(1000)));

    while !endpoint.events.waiters.has_waiters() {
        thread::sleep(Duration::from_millis(1));
    }
    rig.driver.clock().advance(30);
    assert_eq!(waiter.join().unwrap(), WaitStatus::Progress);
}

#[test]
fn posted_event_wakes_a_sleeping_waiter() {
    let rig = rig();
    let (endpoint, _vm) = rig.open(rig.board_a, 0);

    let driver = rig.driver.clone();
    let ep = endpoint.clone();
    let waiter = thread::spawn(move || {
        driver.wait_event(&ep, &fresh_snapshot(WAIT_EVENT_TIMEOUT_INFINITE))
    });

    while !endpoint.events.waiters.has_waiters() {
        thread::sleep(Duration::from_millis(1));
    }
    events::notify_exp(&endpoint, &medium_done(0)).unwrap();
    assert_eq!(waiter.join().unwrap(), WaitStatus::Event);
}
