//! Pull engine tests: slot ids, duplicate/stale reply rejection,
//! retransmission, timeout abort, and close draining.

use std::sync::{Arc, Mutex};

use omx_abi::cmd::{CreateUserRegion, Pull, UserSegment};
use omx_abi::counters::Counter;
use omx_abi::events::{Event, EVT_PULL_DONE_SUCCESS, EVT_PULL_DONE_TIMEOUT};

use omx_mm::user_copy::{copy_from_user, copy_to_user};
use omx_mm::UserVm;

use crate::endpoint::Endpoint;
use crate::pull::{SlotId, PULL_HANDLE_SLOTS_NR};
use crate::test_fixtures::{rig, TestRig, PEER_B};
use crate::wire::{PacketType, PKT_HEAD_LEN};

const SRC_VADDR: u64 = 0x10_0000;
const DST_VADDR: u64 = 0x20_0000;
const SRC_REGION: u32 = 7;
const DST_REGION: u32 = 1;

/// Source pattern: position-dependent bytes so shifted fills show up.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// Pulling pair: an endpoint on each board, a filled source region on B
/// and an empty sink region on A.
struct PullPair {
    ep_a: Arc<Endpoint>,
    vm_a: Arc<UserVm>,
    ep_b: Arc<Endpoint>,
}

fn setup_pull_pair(rig: &TestRig, length: usize) -> PullPair {
    let (ep_a, vm_a) = rig.open(rig.board_a, 0);
    let (ep_b, vm_b) = rig.open(rig.board_b, 0);

    vm_a.map(DST_VADDR, length).unwrap();
    vm_b.map(SRC_VADDR, length).unwrap();
    copy_to_user(&vm_b, SRC_VADDR, &pattern(length)).unwrap();

    rig.driver
        .create_user_region(
            &ep_a,
            &CreateUserRegion {
                id: DST_REGION,
                seqnum: 0,
                segments: vec![UserSegment {
                    vaddr: DST_VADDR,
                    len: length as u64,
                }],
            },
        )
        .unwrap();
    rig.driver
        .create_user_region(
            &ep_b,
            &CreateUserRegion {
                id: SRC_REGION,
                seqnum: 0,
                segments: vec![UserSegment {
                    vaddr: SRC_VADDR,
                    len: length as u64,
                }],
            },
        )
        .unwrap();

    PullPair { ep_a, vm_a, ep_b }
}

fn pull_cmd(pair: &PullPair, length: u32, resend_timeout_jiffies: u32) -> Pull {
    Pull {
        peer_index: PEER_B,
        dest_endpoint: pair.ep_b.endpoint_index(),
        shared: false,
        session_id: pair.ep_b.session_id(),
        length,
        resend_timeout_jiffies,
        puller_rdma_id: DST_REGION,
        pulled_rdma_offset: 0,
        pulled_rdma_id: SRC_REGION,
        pulled_rdma_seqnum: 0,
        lib_cookie: 0x00c0_ffee,
    }
}

fn sink_bytes(pair: &PullPair, length: usize) -> Vec<u8> {
    let mut buf = vec![0u8; length];
    copy_from_user(&pair.vm_a, DST_VADDR, &mut buf).unwrap();
    buf
}

fn is_pull_reply(frame: &[u8]) -> bool {
    frame.len() > PKT_HEAD_LEN && frame[PKT_HEAD_LEN] == PacketType::PullReply as u8
}

// =============================================================================
// Slot ids
// =============================================================================

#[test]
fn slot_ids_pack_index_and_generation() {
    let id = SlotId::first(3);
    assert_eq!(id.index(), 3);
    assert_eq!(id.generation(), 0x23);

    let bumped = id.next_generation();
    assert_eq!(bumped.index(), 3);
    assert_eq!(bumped.generation(), 0x24);
    assert_ne!(bumped.to_wire(), id.to_wire());

    // The generation wraps without touching the index bits.
    let saturated = SlotId::from_wire(((3 << 22) | 0x3F_FFFF) as u32);
    let wrapped = saturated.next_generation();
    assert_eq!(wrapped.index(), 3);
    assert_eq!(wrapped.generation(), 0);

    assert_eq!(SlotId::first(PULL_HANDLE_SLOTS_NR - 1).index(), 1023);
}

// =============================================================================
// Happy path
// =============================================================================

#[test]
fn pull_three_frames_completes_and_fills_the_sink() {
    let rig = rig();
    let length = 12288usize;
    let pair = setup_pull_pair(&rig, length);

    rig.driver
        .pull(&pair.ep_a, &pull_cmd(&pair, length as u32, 5000))
        .unwrap();

    // Loopback delivery is synchronous: the pull completed already.
    match pair.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => {
            assert_eq!(done.status, EVT_PULL_DONE_SUCCESS);
            assert_eq!(done.lib_cookie, 0x00c0_ffee);
            assert_eq!(done.puller_rdma_id, DST_REGION);
        }
        other => panic!("expected PullDone, got {other:?}"),
    }
    assert_eq!(sink_bytes(&pair, length), pattern(length));

    let counters_a = rig.driver.counters(rig.board_a, false).unwrap();
    assert_eq!(counters_a[Counter::RecvPullReply as usize], 3);
    let counters_b = rig.driver.counters(rig.board_b, false).unwrap();
    assert_eq!(counters_b[Counter::RecvPullReq as usize], 1);
    assert_eq!(counters_b[Counter::SendPullReply as usize], 3);
}

// =============================================================================
// Duplicate and stale replies
// =============================================================================

#[test]
fn duplicate_reply_is_dropped_and_pull_still_completes() {
    let rig = rig();
    let length = 12288usize;
    let pair = setup_pull_pair(&rig, length);

    // Capture the first two replies on the wire and drop them.
    let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let captured_hook = captured.clone();
    rig.fabric.set_drop_hook(Some(Box::new(move |frame| {
        if is_pull_reply(frame) {
            let mut held = captured_hook.lock().unwrap();
            if held.len() < 2 {
                held.push(frame.to_vec());
                return true;
            }
        }
        false
    })));

    rig.driver
        .pull(&pair.ep_a, &pull_cmd(&pair, length as u32, 5000))
        .unwrap();
    rig.fabric.set_drop_hook(None);

    // One of three frames landed; nothing is complete yet.
    assert_eq!(pair.ep_a.user_read_exp_event(0), None);
    let held = std::mem::take(&mut *captured.lock().unwrap());
    assert_eq!(held.len(), 2);

    // Redeliver the first withheld frame twice: the first delivery
    // applies, the second is a duplicate within the current block and a
    // no-op on the bitmap.
    rig.driver.recv(rig.board_a, &held[0]);
    rig.driver.recv(rig.board_a, &held[0]);

    let counters_a = rig.driver.counters(rig.board_a, false).unwrap();
    assert_eq!(counters_a[Counter::DropPullReplyDuplicate as usize], 1);
    assert_eq!(pair.ep_a.user_read_exp_event(0), None);

    // The last frame completes the pull.
    rig.driver.recv(rig.board_a, &held[1]);
    match pair.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => assert_eq!(done.status, EVT_PULL_DONE_SUCCESS),
        other => panic!("expected PullDone, got {other:?}"),
    }
    assert_eq!(sink_bytes(&pair, length), pattern(length));

    // After completion the slot generation moved on: replaying a frame
    // cannot reach any handle.
    rig.driver.recv(rig.board_a, &held[0]);
    let counters_a = rig.driver.counters(rig.board_a, false).unwrap();
    assert_eq!(counters_a[Counter::DropPullReplyBadWireHandle as usize], 1);
}

// =============================================================================
// Retransmission
// =============================================================================

#[test]
fn lost_first_frame_is_recovered_by_the_timer() {
    let rig = rig();
    let length = 12288usize;
    let pair = setup_pull_pair(&rig, length);

    // Lose the first reply on the wire.
    let dropped = Arc::new(Mutex::new(false));
    let dropped_hook = dropped.clone();
    rig.fabric.set_drop_hook(Some(Box::new(move |frame| {
        if is_pull_reply(frame) {
            let mut dropped = dropped_hook.lock().unwrap();
            if !*dropped {
                *dropped = true;
                return true;
            }
        }
        false
    })));

    rig.driver
        .pull(&pair.ep_a, &pull_cmd(&pair, length as u32, 5000))
        .unwrap();
    rig.fabric.set_drop_hook(None);

    // No completion until the retransmission timer fires.
    assert_eq!(pair.ep_a.user_read_exp_event(0), None);
    assert_eq!(pair.ep_a.pull.live_handles(), 1);

    rig.driver.clock().advance(1000);
    rig.driver.timer_process();

    let counters_a = rig.driver.counters(rig.board_a, false).unwrap();
    assert_eq!(
        counters_a[Counter::PullTimeoutHandlerFirstBlock as usize],
        1
    );

    match pair.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => assert_eq!(done.status, EVT_PULL_DONE_SUCCESS),
        other => panic!("expected PullDone, got {other:?}"),
    }
    assert_eq!(sink_bytes(&pair, length), pattern(length));
}

#[test]
fn pull_aborts_with_timeout_when_nothing_arrives() {
    let rig = rig();
    let length = 12288usize;
    let pair = setup_pull_pair(&rig, length);

    // The wire eats every reply.
    rig.fabric
        .set_drop_hook(Some(Box::new(|frame| is_pull_reply(frame))));

    rig.driver
        .pull(&pair.ep_a, &pull_cmd(&pair, length as u32, 500))
        .unwrap();

    // The deadline passes before the first retransmission period ends.
    rig.driver.clock().advance(1000);
    rig.driver.timer_process();

    match pair.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => assert_eq!(done.status, EVT_PULL_DONE_TIMEOUT),
        other => panic!("expected PullDone, got {other:?}"),
    }
    let counters_a = rig.driver.counters(rig.board_a, false).unwrap();
    assert_eq!(counters_a[Counter::PullTimeoutAbort as usize], 1);
    assert_eq!(pair.ep_a.pull.live_handles(), 0);
}

// =============================================================================
// Close draining
// =============================================================================

#[test]
fn endpoint_close_drains_live_handles() {
    let rig = rig();
    let length = 12288usize;
    let pair = setup_pull_pair(&rig, length);

    rig.fabric
        .set_drop_hook(Some(Box::new(|frame| is_pull_reply(frame))));
    rig.driver
        .pull(&pair.ep_a, &pull_cmd(&pair, length as u32, 5000))
        .unwrap();
    assert_eq!(pair.ep_a.pull.live_handles(), 1);

    pair.ep_a.close().unwrap();

    // The handle reached TimerExited and a non-success completion was
    // posted for the user.
    assert_eq!(pair.ep_a.pull.live_handles(), 0);
    match pair.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => assert_ne!(done.status, EVT_PULL_DONE_SUCCESS),
        other => panic!("expected PullDone, got {other:?}"),
    }

    // The timer was cancelled or exited: later processing is a no-op.
    rig.driver.clock().advance(10_000);
    rig.driver.timer_process();
    assert_eq!(pair.ep_a.user_read_exp_event(1), None);
}
