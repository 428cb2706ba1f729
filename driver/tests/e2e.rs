//! End-to-end scenarios over the loopback fabric: two boards on one
//! driver, endpoints talking through the full wire path.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use omx_abi::cmd::{
    CreateUserRegion, Pull, SendLibAck, SendMediumSqFrag, SendNotify, SendRndv, SendSmall,
    SendTiny, UserSegment, WaitEvent, WaitStatus, WAIT_EVENT_TIMEOUT_INFINITE,
};
use omx_abi::counters::Counter;
use omx_abi::desc::EndpointDescStatus;
use omx_abi::events::{
    Event, RecvMsgSpecific, EVT_PULL_DONE_SUCCESS, EVT_PULL_DONE_TIMEOUT,
};
use omx_abi::{SENDQ_ENTRY_SIZE, TINY_MSG_LENGTH_MAX, UNEXP_EVENTQ_ENTRY_NR};

use omx_driver::endpoint::Endpoint;
use omx_driver::loopback::Fabric;
use omx_driver::wire::{MacAddr, PacketType, PKT_HEAD_LEN};
use omx_driver::{Driver, OmxConfig, OmxError};

use omx_mm::user_copy::{copy_from_user, copy_to_user};
use omx_mm::UserVm;

const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);
const PEER_A: u16 = 5;
const PEER_B: u16 = 7;

struct Net {
    fabric: Arc<Fabric>,
    driver: Arc<Driver>,
    board_a: u32,
    board_b: u32,
}

fn net() -> Net {
    net_with_config(OmxConfig::default())
}

fn net_with_config(config: OmxConfig) -> Net {
    let driver = Driver::new(config);
    let fabric = Fabric::new();
    let board_a = fabric.attach(&driver, MAC_A, "fab0").unwrap();
    let board_b = fabric.attach(&driver, MAC_B, "fab1").unwrap();
    driver
        .peer_add(MAC_A.to_u64(), Some("hosta".into()), Some(PEER_A as u32))
        .unwrap();
    driver
        .peer_add(MAC_B.to_u64(), Some("hostb".into()), Some(PEER_B as u32))
        .unwrap();
    Net {
        fabric,
        driver,
        board_a,
        board_b,
    }
}

impl Net {
    fn open(&self, board_index: u32, endpoint_index: u8) -> (Arc<Endpoint>, Arc<UserVm>) {
        let vm = Arc::new(UserVm::new());
        let endpoint = self
            .driver
            .open_endpoint(board_index, endpoint_index, vm.clone(), 4242, "e2e")
            .unwrap();
        (endpoint, vm)
    }

    fn counter(&self, board_index: u32, which: Counter) -> u64 {
        self.driver.counters(board_index, false).unwrap()[which as usize]
    }
}

fn is_pull_reply(frame: &[u8]) -> bool {
    frame.len() > PKT_HEAD_LEN && frame[PKT_HEAD_LEN] == PacketType::PullReply as u8
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect()
}

// =============================================================================
// Scenario 1: tiny echo
// =============================================================================

#[test]
fn tiny_delivery_reports_the_senders_identity() {
    let net = net();
    let (ep_a, _vm_a) = net.open(net.board_a, 3);
    let (ep_b, _vm_b) = net.open(net.board_b, 3);

    let mut data = [0u8; TINY_MSG_LENGTH_MAX];
    for (i, byte) in data.iter_mut().take(10).enumerate() {
        *byte = i as u8;
    }
    net.driver
        .send_tiny(
            &ep_a,
            &SendTiny {
                peer_index: PEER_B,
                dest_endpoint: 3,
                shared: false,
                session_id: ep_b.session_id(),
                seqnum: 1,
                piggyack: 0,
                length: 10,
                checksum: 0,
                match_info: 0xABCDEF,
                data,
            },
        )
        .unwrap();

    match ep_b.user_read_unexp_event(0) {
        Some(Event::RecvTiny(msg)) => {
            assert_eq!(msg.peer_index, PEER_A);
            assert_eq!(msg.src_endpoint, 3);
            assert_eq!(msg.seqnum, 1);
            assert_eq!(msg.match_info, 0xABCDEF);
            match msg.specific {
                RecvMsgSpecific::Tiny { length, data, .. } => {
                    assert_eq!(length, 10);
                    assert_eq!(&data[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
                }
                other => panic!("unexpected specific {other:?}"),
            }
        }
        other => panic!("expected RecvTiny, got {other:?}"),
    }
    assert_eq!(net.counter(net.board_b, Counter::RecvTiny), 1);
}

// =============================================================================
// Scenario 2: small with a full unexpected queue, then recovery
// =============================================================================

#[test]
fn small_queue_full_drops_then_recovers_after_release() {
    let net = net();
    let (ep_a, vm_a) = net.open(net.board_a, 0);
    let (ep_b, _vm_b) = net.open(net.board_b, 0);

    let vaddr = 0x5_0000u64;
    let payload = pattern(128);
    vm_a.map(vaddr, 4096).unwrap();
    copy_to_user(&vm_a, vaddr, &payload).unwrap();

    let small = |seqnum: u16| SendSmall {
        peer_index: PEER_B,
        dest_endpoint: 0,
        shared: false,
        session_id: ep_b.session_id(),
        seqnum,
        piggyack: 0,
        length: 128,
        checksum: 0,
        vaddr,
        match_info: 0x1122,
    };

    // Fill the receiver's unexpected ring without releasing anything.
    for i in 0..UNEXP_EVENTQ_ENTRY_NR {
        net.driver.send_small(&ep_a, &small(i as u16)).unwrap();
    }
    assert_eq!(net.counter(net.board_b, Counter::RecvSmall), 1024);

    // The next one is dropped and the receiver's descriptor says why.
    net.driver.send_small(&ep_a, &small(9999)).unwrap();
    assert_eq!(net.counter(net.board_b, Counter::UnexpEventqFull), 1);
    assert!(ep_b
        .desc()
        .status_bits()
        .contains(EndpointDescStatus::UNEXP_EVENTQ_FULL));

    // The library releases a quarter of the ring; the retransmitted
    // small is accepted and delivered.
    net.driver.release_unexp_slots(&ep_b).unwrap();
    net.driver.send_small(&ep_a, &small(9999)).unwrap();
    match ep_b.user_read_unexp_event(UNEXP_EVENTQ_ENTRY_NR) {
        Some(Event::RecvSmall(msg)) => {
            assert_eq!(msg.seqnum, 9999);
            match msg.specific {
                RecvMsgSpecific::Small {
                    recvq_offset,
                    length,
                    ..
                } => {
                    assert_eq!(length, 128);
                    assert_eq!(ep_b.user_recvq_read(recvq_offset, 128), payload);
                }
                other => panic!("unexpected specific {other:?}"),
            }
        }
        other => panic!("expected RecvSmall, got {other:?}"),
    }
}

// =============================================================================
// Scenarios 3-5: pull
// =============================================================================

struct PullNet {
    net: Net,
    ep_a: Arc<Endpoint>,
    vm_a: Arc<UserVm>,
    ep_b: Arc<Endpoint>,
    length: usize,
}

const SRC_VADDR: u64 = 0x10_0000;
const DST_VADDR: u64 = 0x80_0000;

fn pull_net(length: usize) -> PullNet {
    let net = net();
    let (ep_a, vm_a) = net.open(net.board_a, 0);
    let (ep_b, vm_b) = net.open(net.board_b, 0);

    vm_a.map(DST_VADDR, length).unwrap();
    vm_b.map(SRC_VADDR, length).unwrap();
    copy_to_user(&vm_b, SRC_VADDR, &pattern(length)).unwrap();

    net.driver
        .create_user_region(
            &ep_a,
            &CreateUserRegion {
                id: 1,
                seqnum: 0,
                segments: vec![UserSegment {
                    vaddr: DST_VADDR,
                    len: length as u64,
                }],
            },
        )
        .unwrap();
    net.driver
        .create_user_region(
            &ep_b,
            &CreateUserRegion {
                id: 7,
                seqnum: 0,
                segments: vec![UserSegment {
                    vaddr: SRC_VADDR,
                    len: length as u64,
                }],
            },
        )
        .unwrap();

    PullNet {
        net,
        ep_a,
        vm_a,
        ep_b,
        length,
    }
}

impl PullNet {
    fn pull_cmd(&self, resend_timeout_jiffies: u32) -> Pull {
        Pull {
            peer_index: PEER_B,
            dest_endpoint: 0,
            shared: false,
            session_id: self.ep_b.session_id(),
            length: self.length as u32,
            resend_timeout_jiffies,
            puller_rdma_id: 1,
            pulled_rdma_offset: 0,
            pulled_rdma_id: 7,
            pulled_rdma_seqnum: 0,
            lib_cookie: 0xfeed,
        }
    }

    fn sink(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.length];
        copy_from_user(&self.vm_a, DST_VADDR, &mut buf).unwrap();
        buf
    }
}

#[test]
fn pull_without_loss_completes_in_three_replies() {
    let p = pull_net(12288);

    p.net.driver.pull(&p.ep_a, &p.pull_cmd(5000)).unwrap();

    assert_eq!(p.net.counter(p.net.board_b, Counter::SendPullReply), 3);
    assert_eq!(p.net.counter(p.net.board_a, Counter::RecvPullReply), 3);
    match p.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => {
            assert_eq!(done.status, EVT_PULL_DONE_SUCCESS);
            assert_eq!(done.lib_cookie, 0xfeed);
        }
        other => panic!("expected PullDone, got {other:?}"),
    }
    assert_eq!(p.sink(), pattern(p.length));
}

#[test]
fn pull_recovers_a_lost_first_reply_via_the_timer() {
    let p = pull_net(12288);

    let dropped = Arc::new(Mutex::new(false));
    let hook_dropped = dropped.clone();
    p.net.fabric.set_drop_hook(Some(Box::new(move |frame| {
        if is_pull_reply(frame) {
            let mut dropped = hook_dropped.lock().unwrap();
            if !*dropped {
                *dropped = true;
                return true;
            }
        }
        false
    })));

    p.net.driver.pull(&p.ep_a, &p.pull_cmd(5000)).unwrap();
    p.net.fabric.set_drop_hook(None);

    // No progress event until the one-second timer fires.
    assert_eq!(p.ep_a.user_read_exp_event(0), None);
    p.net.driver.clock().advance(1000);
    p.net.driver.timer_process();

    match p.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => assert_eq!(done.status, EVT_PULL_DONE_SUCCESS),
        other => panic!("expected PullDone, got {other:?}"),
    }
    assert_eq!(p.sink(), pattern(p.length));
}

#[test]
fn pull_times_out_when_every_reply_is_lost() {
    let p = pull_net(12288);

    p.net
        .fabric
        .set_drop_hook(Some(Box::new(|frame| is_pull_reply(frame))));
    // 500 ms budget for the whole pull.
    p.net.driver.pull(&p.ep_a, &p.pull_cmd(500)).unwrap();

    p.net.driver.clock().advance(1000);
    p.net.driver.timer_process();

    match p.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => assert_eq!(done.status, EVT_PULL_DONE_TIMEOUT),
        other => panic!("expected PullDone, got {other:?}"),
    }
    assert_eq!(p.net.counter(p.net.board_a, Counter::PullTimeoutAbort), 1);
}

// =============================================================================
// Scenario 6: endpoint close with a pending pull
// =============================================================================

#[test]
fn close_with_pending_pull_aborts_and_wakes_waiters() {
    // More than one block's worth keeps several blocks outstanding.
    let length = 160 * 1024;
    let p = pull_net(length);

    p.net
        .fabric
        .set_drop_hook(Some(Box::new(|frame| is_pull_reply(frame))));
    p.net.driver.pull(&p.ep_a, &p.pull_cmd(60_000)).unwrap();

    // Park a waiter on the endpoint.
    let driver = p.net.driver.clone();
    let ep = p.ep_a.clone();
    let waiter = thread::spawn(move || {
        driver.wait_event(
            &ep,
            &WaitEvent {
                user_event_index: 0,
                next_exp_event_index: 0,
                next_unexp_event_index: 0,
                jiffies_expire: WAIT_EVENT_TIMEOUT_INFINITE,
            },
        )
    });
    while p.ep_a.waiter_count() == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    p.ep_a.close().unwrap();

    // All waiters woken with Wakeup; a non-success completion posted;
    // the slot array is cleared so the timer, if any, just exits.
    assert_eq!(waiter.join().unwrap(), WaitStatus::Wakeup);
    match p.ep_a.user_read_exp_event(0) {
        Some(Event::PullDone(done)) => assert_ne!(done.status, EVT_PULL_DONE_SUCCESS),
        other => panic!("expected PullDone, got {other:?}"),
    }

    // Closing again is fine, and the slot can be reopened.
    p.ep_a.close().unwrap();
    let (_ep, _vm) = p.net.open(p.net.board_a, 0);
}

// =============================================================================
// Medium and control-plane coverage
// =============================================================================

#[test]
fn mediumsq_fragment_round_trip_returns_the_sendq_slot() {
    let net = net();
    let (ep_a, _vm_a) = net.open(net.board_a, 0);
    let (ep_b, _vm_b) = net.open(net.board_b, 0);

    let payload = pattern(2000);
    let sendq_offset = 3 * SENDQ_ENTRY_SIZE;
    ep_a.user_sendq_write(sendq_offset, &payload);

    net.driver
        .send_mediumsq_frag(
            &ep_a,
            &SendMediumSqFrag {
                peer_index: PEER_B,
                dest_endpoint: 0,
                shared: false,
                session_id: ep_b.session_id(),
                seqnum: 4,
                piggyack: 2,
                sendq_offset,
                checksum: 0,
                msg_length: 2000,
                frag_length: 2000,
                frag_seqnum: 0,
                frag_pipeline: 0,
                match_info: 0x77,
            },
        )
        .unwrap();

    // Receiver got the fragment payload in its recvq slot.
    match ep_b.user_read_unexp_event(0) {
        Some(Event::RecvMediumFrag(msg)) => match msg.specific {
            RecvMsgSpecific::MediumFrag {
                recvq_offset,
                frag_length,
                msg_length,
                ..
            } => {
                assert_eq!(frag_length, 2000);
                assert_eq!(msg_length, 2000);
                assert_eq!(ep_b.user_recvq_read(recvq_offset, 2000), payload);
            }
            other => panic!("unexpected specific {other:?}"),
        },
        other => panic!("expected RecvMediumFrag, got {other:?}"),
    }

    // Sender got its sendq slot back.
    match ep_a.user_read_exp_event(0) {
        Some(Event::SendMediumFragDone(done)) => {
            assert_eq!(done.sendq_offset, sendq_offset);
        }
        other => panic!("expected SendMediumFragDone, got {other:?}"),
    }
}

#[test]
fn rndv_notify_and_liback_round_trips() {
    let net = net();
    let (ep_a, _vm_a) = net.open(net.board_a, 0);
    let (ep_b, _vm_b) = net.open(net.board_b, 0);

    net.driver
        .send_rndv(
            &ep_a,
            &SendRndv {
                peer_index: PEER_B,
                dest_endpoint: 0,
                shared: false,
                session_id: ep_b.session_id(),
                seqnum: 9,
                piggyack: 0,
                match_info: 0xBEEF,
                msg_length: 1 << 20,
                pulled_rdma_id: 13,
                pulled_rdma_seqnum: 2,
                checksum: 0,
            },
        )
        .unwrap();
    match ep_b.user_read_unexp_event(0) {
        Some(Event::RecvRndv(msg)) => match msg.specific {
            RecvMsgSpecific::Rndv {
                msg_length,
                pulled_rdma_id,
                pulled_rdma_seqnum,
                ..
            } => {
                assert_eq!(msg_length, 1 << 20);
                assert_eq!(pulled_rdma_id, 13);
                assert_eq!(pulled_rdma_seqnum, 2);
            }
            other => panic!("unexpected specific {other:?}"),
        },
        other => panic!("expected RecvRndv, got {other:?}"),
    }

    net.driver
        .send_notify(
            &ep_b,
            &SendNotify {
                peer_index: PEER_A,
                dest_endpoint: 0,
                shared: false,
                session_id: ep_a.session_id(),
                total_length: 1 << 20,
                seqnum: 10,
                piggyack: 9,
                pulled_rdma_id: 13,
                pulled_rdma_seqnum: 2,
            },
        )
        .unwrap();
    match ep_a.user_read_unexp_event(0) {
        Some(Event::RecvNotify(msg)) => match msg.specific {
            RecvMsgSpecific::Notify {
                length,
                pulled_rdma_id,
                ..
            } => {
                assert_eq!(length, 1 << 20);
                assert_eq!(pulled_rdma_id, 13);
            }
            other => panic!("unexpected specific {other:?}"),
        },
        other => panic!("expected RecvNotify, got {other:?}"),
    }

    net.driver
        .send_liback(
            &ep_a,
            &SendLibAck {
                peer_index: PEER_B,
                dest_endpoint: 0,
                shared: false,
                session_id: ep_b.session_id(),
                acknum: 3,
                lib_seqnum: 11,
                send_seq: 44,
                resent: true,
            },
        )
        .unwrap();
    match ep_b.user_read_unexp_event(1) {
        Some(Event::RecvLibAck(ack)) => {
            assert_eq!(ack.acknum, 3);
            assert_eq!(ack.lib_seqnum, 11);
            assert_eq!(ack.send_seq, 44);
            assert_eq!(ack.resent, 1);
        }
        other => panic!("expected RecvLibAck, got {other:?}"),
    }
}

#[test]
fn bad_session_is_nacked_back_to_the_sender() {
    let net = net();
    let (ep_a, _vm_a) = net.open(net.board_a, 0);
    let (ep_b, _vm_b) = net.open(net.board_b, 0);

    net.driver
        .send_tiny(
            &ep_a,
            &SendTiny {
                peer_index: PEER_B,
                dest_endpoint: 0,
                shared: false,
                session_id: ep_b.session_id() ^ 1,
                seqnum: 66,
                piggyack: 0,
                length: 1,
                checksum: 0,
                match_info: 0,
                data: [0u8; TINY_MSG_LENGTH_MAX],
            },
        )
        .unwrap();

    assert_eq!(net.counter(net.board_b, Counter::DropBadSession), 1);
    match ep_a.user_read_unexp_event(0) {
        Some(Event::RecvNackLib(nack)) => {
            assert_eq!(nack.nack_type, omx_abi::events::EVT_NACK_LIB_BAD_SESSION);
            assert_eq!(nack.seqnum, 66);
        }
        other => panic!("expected RecvNackLib, got {other:?}"),
    }
}

#[test]
fn control_plane_reports_boards_endpoints_and_peers() {
    let net = net();
    assert_eq!(net.driver.board_count(), 2);

    let info = net.driver.board_info(net.board_a).unwrap();
    assert_eq!(info.addr, MAC_A.to_u64());
    assert_eq!(info.drivername, "omx_fabric");

    net.driver.set_hostname(net.board_a, "renamed").unwrap();
    assert_eq!(net.driver.board_info(net.board_a).unwrap().hostname, "renamed");

    let (ep, _vm) = net.open(net.board_a, 9);
    let info = net.driver.endpoint_info(net.board_a, 9).unwrap();
    assert!(!info.closed);
    assert_eq!(info.pid, 4242);
    // A never-opened endpoint reports closed.
    assert!(net.driver.endpoint_info(net.board_a, 10).unwrap().closed);

    // Opening the same slot twice is refused.
    let vm = Arc::new(UserVm::new());
    assert_eq!(
        net.driver
            .open_endpoint(net.board_a, 9, vm, 1, "dup")
            .err(),
        Some(OmxError::Busy)
    );
    ep.close().unwrap();

    let peer = net.driver.peer_from_index(PEER_A as u32).unwrap();
    assert_eq!(peer.board_addr, MAC_A.to_u64());
    assert_eq!(
        net.driver.peer_from_hostname("hostb").unwrap().index,
        PEER_B as u32
    );
    let state = net.driver.peer_table_get_state();
    assert_eq!(state.size as usize, net.driver.config.peer_max);
}
