//! Ingress pipeline — single entry point for all received frames.
//!
//! Every frame received from any attached NIC passes through
//! [`omx_recv`], which checks the EtherType and the common head, then
//! dispatches on the 8-bit packet type to a per-type handler.  Unknown
//! types are counted and dropped; reserved or invalid types are counted
//! separately.
//!
//! Each handler follows the same discipline, in order: per-type header
//! length, payload length sanity, peer-index validation against the
//! source MAC, endpoint acquire (nack on failure), session check (nack
//! `BadSession`), then event delivery — either straight to the
//! unexpected queue, or through the reserve/fill/commit recvq protocol
//! for payload-carrying packets.  A full unexpected queue drops the
//! frame silently: the sender's retransmission recovers it.

use std::sync::Arc;

use omx_abi::counters::Counter;
use omx_abi::events::{
    Event, EvtRecvConnectRequest, EvtRecvConnectReply, EvtRecvLibAck, EvtRecvMsg, EvtRecvNackLib,
    RecvMsgSpecific,
};
use omx_abi::{RECVQ_ENTRY_SIZE, SMALL_MSG_LENGTH_MAX, TINY_MSG_LENGTH_MAX};

use omx_lib::klog_debug;

use crate::endpoint::Endpoint;
use crate::events;
use crate::iface::Iface;
use crate::pull;
use crate::send;
use crate::wire::{
    ConnectData, LibAckData, NackType, PacketType, PktConnect, PktHead, PktMediumFrag, PktMsg,
    PktNackLib, PktNotify, PktRndv, PktTruc, CONNECT_HDR_LEN, MEDIUM_HDR_LEN,
    MSG_HDR_LEN, NACK_LIB_HDR_LEN, PKT_HEAD_LEN, RNDV_HDR_LEN, TRUC_HDR_LEN, TRUC_TYPE_ACK,
};
use crate::Driver;

/// Process one received frame through the ingress pipeline.
///
/// `frame` is the full Ethernet frame as it came off the wire.
pub(crate) fn omx_recv(driver: &Driver, iface: &Arc<Iface>, frame: &[u8]) {
    // Enough bytes for the common head plus the packet type byte.
    let Some(head) = PktHead::parse(frame) else {
        // Not our EtherType or truncated head: not for us at all.
        return;
    };
    if frame.len() < PKT_HEAD_LEN + 1 {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    }
    let body = &frame[PKT_HEAD_LEN..];

    match PacketType::from_u8(body[0]) {
        Some(PacketType::Tiny) => recv_tiny(driver, iface, &head, body),
        Some(PacketType::Small) => recv_small(driver, iface, &head, body),
        Some(PacketType::Medium) => recv_medium_frag(driver, iface, &head, body),
        Some(PacketType::Rndv) => recv_rndv(driver, iface, &head, body),
        Some(PacketType::Connect) => recv_connect(driver, iface, &head, body),
        Some(PacketType::Notify) => recv_notify(driver, iface, &head, body),
        Some(PacketType::Truc) => recv_truc(driver, iface, &head, body),
        Some(PacketType::NackLib) => recv_nack_lib(driver, iface, &head, body),
        Some(PacketType::Pull) => pull::recv_pull_request(driver, iface, &head, body),
        Some(PacketType::PullReply) => pull::recv_pull_reply(driver, iface, &head, body),
        Some(PacketType::NackMcp) => pull::recv_nack_mcp(driver, iface, &head, body),
        // The raw side channel is handled elsewhere.
        Some(PacketType::Raw) | Some(PacketType::HostQuery) | Some(PacketType::HostReply) => {
            iface.counters.inc(Counter::DropNosysType);
        }
        Some(PacketType::MfmNicReply)
        | Some(PacketType::EtherUnicast)
        | Some(PacketType::EtherMulticast)
        | Some(PacketType::EtherNative)
        | Some(PacketType::None) => {
            iface.counters.inc(Counter::DropInvalidType);
        }
        None => {
            klog_debug!("unknown packet type {:#x}, dropping", body[0]);
            iface.counters.inc(Counter::DropUnknownType);
        }
    }
}

// ---------------------------------------------------------------------------
// Common handler steps
// ---------------------------------------------------------------------------

/// Peer-index check shared by all indexed handlers.
fn check_peer_index(driver: &Driver, iface: &Iface, head: &PktHead) -> bool {
    if driver
        .peers()
        .check_recv_peer_index(head.dst_src_peer_index, head.src.to_u64())
        .is_err()
    {
        iface.counters.inc(Counter::DropBadPeerIndex);
        return false;
    }
    true
}

/// Endpoint acquire with a library nack on failure.
fn acquire_or_nack_lib(
    driver: &Driver,
    iface: &Iface,
    head: &PktHead,
    dst_endpoint: u8,
    src_endpoint: u8,
    lib_seqnum: u16,
) -> Option<Arc<Endpoint>> {
    match iface.acquire_endpoint(dst_endpoint) {
        Ok(endpoint) => Some(endpoint),
        Err(err) => {
            iface.counters.inc(Counter::DropBadEndpoint);
            send::send_nack_lib(
                driver,
                iface,
                head.dst_src_peer_index,
                err.to_nack_type(),
                dst_endpoint,
                src_endpoint,
                lib_seqnum,
            );
            None
        }
    }
}

/// Session check with a `BadSession` nack on mismatch.
fn check_session_or_nack_lib(
    driver: &Driver,
    iface: &Iface,
    head: &PktHead,
    endpoint: &Endpoint,
    session_id: u32,
    dst_endpoint: u8,
    src_endpoint: u8,
    lib_seqnum: u16,
) -> bool {
    if session_id != endpoint.session_id() {
        iface.counters.inc(Counter::DropBadSession);
        send::send_nack_lib(
            driver,
            iface,
            head.dst_src_peer_index,
            NackType::BadSession,
            dst_endpoint,
            src_endpoint,
            lib_seqnum,
        );
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Tiny
// ---------------------------------------------------------------------------

fn recv_tiny(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    let Some(msg) = PktMsg::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    let length = msg.length as usize;
    if length > TINY_MSG_LENGTH_MAX {
        iface.counters.inc(Counter::DropBadDatalen);
        return;
    }
    if length > body.len() - MSG_HDR_LEN {
        iface.counters.inc(Counter::DropBadFrameLen);
        return;
    }
    if !check_peer_index(driver, iface, head) {
        return;
    }
    let Some(endpoint) = acquire_or_nack_lib(
        driver,
        iface,
        head,
        msg.dst_endpoint,
        msg.src_endpoint,
        msg.lib_seqnum,
    ) else {
        return;
    };
    if !check_session_or_nack_lib(
        driver,
        iface,
        head,
        &endpoint,
        msg.session,
        msg.dst_endpoint,
        msg.src_endpoint,
        msg.lib_seqnum,
    ) {
        return;
    }

    let mut data = [0u8; TINY_MSG_LENGTH_MAX];
    data[..length].copy_from_slice(&body[MSG_HDR_LEN..MSG_HDR_LEN + length]);

    let event = Event::RecvTiny(EvtRecvMsg {
        peer_index: head.dst_src_peer_index,
        src_endpoint: msg.src_endpoint,
        seqnum: msg.lib_seqnum,
        piggyack: msg.lib_piggyack,
        match_info: msg.match_info,
        specific: RecvMsgSpecific::Tiny {
            checksum: msg.checksum,
            length: length as u8,
            data,
        },
    });
    // A full unexpected queue drops the packet; it will be resent.
    if events::notify_unexp(&endpoint, &event).is_ok() {
        iface.counters.inc(Counter::RecvTiny);
    }
}

// ---------------------------------------------------------------------------
// Small
// ---------------------------------------------------------------------------

fn recv_small(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    let Some(msg) = PktMsg::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    let length = msg.length as usize;
    if length > SMALL_MSG_LENGTH_MAX {
        iface.counters.inc(Counter::DropBadDatalen);
        return;
    }
    if length > body.len() - MSG_HDR_LEN {
        iface.counters.inc(Counter::DropBadFrameLen);
        return;
    }
    if !check_peer_index(driver, iface, head) {
        return;
    }
    let Some(endpoint) = acquire_or_nack_lib(
        driver,
        iface,
        head,
        msg.dst_endpoint,
        msg.src_endpoint,
        msg.lib_seqnum,
    ) else {
        return;
    };
    if !check_session_or_nack_lib(
        driver,
        iface,
        head,
        &endpoint,
        msg.session,
        msg.dst_endpoint,
        msg.src_endpoint,
        msg.lib_seqnum,
    ) {
        return;
    }

    // Reserve the event and recvq slot together, fill, then commit.
    let Ok(recvq_offset) = events::prepare_notify_unexp_with_recvq(&endpoint) else {
        return;
    };
    endpoint
        .recvq
        .write(recvq_offset, &body[MSG_HDR_LEN..MSG_HDR_LEN + length]);

    let event = Event::RecvSmall(EvtRecvMsg {
        peer_index: head.dst_src_peer_index,
        src_endpoint: msg.src_endpoint,
        seqnum: msg.lib_seqnum,
        piggyack: msg.lib_piggyack,
        match_info: msg.match_info,
        specific: RecvMsgSpecific::Small {
            recvq_offset,
            length: length as u16,
            checksum: msg.checksum,
        },
    });
    events::commit_notify_unexp_with_recvq(&endpoint, &event);
    iface.counters.inc(Counter::RecvSmall);
}

// ---------------------------------------------------------------------------
// Medium fragment
// ---------------------------------------------------------------------------

fn recv_medium_frag(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    let Some(medium) = PktMediumFrag::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    let frag_length = medium.frag_length as usize;
    if frag_length > RECVQ_ENTRY_SIZE as usize {
        iface.counters.inc(Counter::DropBadDatalen);
        return;
    }
    if frag_length > body.len() - MEDIUM_HDR_LEN {
        iface.counters.inc(Counter::DropBadFrameLen);
        return;
    }
    if !check_peer_index(driver, iface, head) {
        return;
    }
    let msg = &medium.msg;
    let Some(endpoint) = acquire_or_nack_lib(
        driver,
        iface,
        head,
        msg.dst_endpoint,
        msg.src_endpoint,
        msg.lib_seqnum,
    ) else {
        return;
    };
    if !check_session_or_nack_lib(
        driver,
        iface,
        head,
        &endpoint,
        msg.session,
        msg.dst_endpoint,
        msg.src_endpoint,
        msg.lib_seqnum,
    ) {
        return;
    }

    let Ok(recvq_offset) = events::prepare_notify_unexp_with_recvq(&endpoint) else {
        return;
    };

    // Offload the copy into the recvq page when it pays off; whatever the
    // engine rejects is copied by hand.
    let payload = &body[MEDIUM_HDR_LEN..MEDIUM_HDR_LEN + frag_length];
    let mut copied = 0usize;
    if let Some(engine) = driver.config.dma.as_ref() {
        if frag_length as u32 >= driver.config.dma_thresholds.async_frag_min
            && msg.length as u32 >= driver.config.dma_thresholds.async_min
        {
            let page = endpoint.recvq.page_at(recvq_offset);
            let outcome = engine.memcpy_to_page(page, 0, payload);
            copied = frag_length - outcome.residual;
            if outcome.residual == 0 {
                iface.counters.inc(Counter::DmaRecvMediumFrag);
            } else if copied > 0 {
                iface.counters.inc(Counter::DmaRecvPartialMediumFrag);
            }
            // The fragment must be visible before the event commits.
            if let Some(cookie) = outcome.cookie {
                while !engine.poll_done(cookie) {
                    core::hint::spin_loop();
                }
            }
        }
    }
    if copied < frag_length {
        endpoint
            .recvq
            .write(recvq_offset + copied as u32, &payload[copied..]);
    }

    let event = Event::RecvMediumFrag(EvtRecvMsg {
        peer_index: head.dst_src_peer_index,
        src_endpoint: msg.src_endpoint,
        seqnum: msg.lib_seqnum,
        piggyack: msg.lib_piggyack,
        match_info: msg.match_info,
        specific: RecvMsgSpecific::MediumFrag {
            recvq_offset,
            msg_length: msg.length as u32,
            frag_length: medium.frag_length,
            frag_seqnum: medium.frag_seqnum,
            frag_pipeline: medium.frag_pipeline,
            checksum: msg.checksum,
        },
    });
    events::commit_notify_unexp_with_recvq(&endpoint, &event);
    iface.counters.inc(Counter::RecvMediumFrag);
}

// ---------------------------------------------------------------------------
// Rndv
// ---------------------------------------------------------------------------

fn recv_rndv(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    let Some(rndv) = PktRndv::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    let msg = &rndv.msg;
    if (msg.length as usize) < RNDV_HDR_LEN - MSG_HDR_LEN {
        iface.counters.inc(Counter::DropBadDatalen);
        return;
    }
    if !check_peer_index(driver, iface, head) {
        return;
    }
    let Some(endpoint) = acquire_or_nack_lib(
        driver,
        iface,
        head,
        msg.dst_endpoint,
        msg.src_endpoint,
        msg.lib_seqnum,
    ) else {
        return;
    };
    if !check_session_or_nack_lib(
        driver,
        iface,
        head,
        &endpoint,
        msg.session,
        msg.dst_endpoint,
        msg.src_endpoint,
        msg.lib_seqnum,
    ) {
        return;
    }

    let event = Event::RecvRndv(EvtRecvMsg {
        peer_index: head.dst_src_peer_index,
        src_endpoint: msg.src_endpoint,
        seqnum: msg.lib_seqnum,
        piggyack: msg.lib_piggyack,
        match_info: msg.match_info,
        specific: RecvMsgSpecific::Rndv {
            msg_length: rndv.msg_length,
            pulled_rdma_id: rndv.pulled_rdma_id,
            pulled_rdma_seqnum: rndv.pulled_rdma_seqnum,
            pulled_rdma_offset: rndv.pulled_rdma_offset,
            checksum: msg.checksum,
        },
    });
    if events::notify_unexp(&endpoint, &event).is_ok() {
        iface.counters.inc(Counter::RecvRndv);
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

fn recv_notify(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    let Some(notify) = PktNotify::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    if !check_peer_index(driver, iface, head) {
        return;
    }
    let Some(endpoint) = acquire_or_nack_lib(
        driver,
        iface,
        head,
        notify.dst_endpoint,
        notify.src_endpoint,
        notify.lib_seqnum,
    ) else {
        return;
    };
    if !check_session_or_nack_lib(
        driver,
        iface,
        head,
        &endpoint,
        notify.session,
        notify.dst_endpoint,
        notify.src_endpoint,
        notify.lib_seqnum,
    ) {
        return;
    }

    let event = Event::RecvNotify(EvtRecvMsg {
        peer_index: head.dst_src_peer_index,
        src_endpoint: notify.src_endpoint,
        seqnum: notify.lib_seqnum,
        piggyack: notify.lib_piggyack,
        match_info: 0,
        specific: RecvMsgSpecific::Notify {
            length: notify.total_length,
            pulled_rdma_id: notify.puller_rdma_id,
            pulled_rdma_seqnum: notify.puller_rdma_seqnum,
        },
    });
    if events::notify_unexp(&endpoint, &event).is_ok() {
        iface.counters.inc(Counter::RecvNotify);
    }
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

fn recv_connect(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    let Some(connect) = PktConnect::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    if (connect.length as usize) < crate::wire::CONNECT_DATA_LEN
        || body.len() < CONNECT_HDR_LEN + crate::wire::CONNECT_DATA_LEN
    {
        iface.counters.inc(Counter::DropBadDatalen);
        return;
    }
    let Some(data) = ConnectData::parse(&body[CONNECT_HDR_LEN..]) else {
        iface.counters.inc(Counter::DropBadDatalen);
        return;
    };

    // A connect does not know its peer index yet; look the sender up by
    // its address instead.
    let Some(peer) = driver.peers().lookup_by_addr(head.src.to_u64()) else {
        iface.counters.inc(Counter::DropBadPeerAddr);
        return;
    };
    let peer_index = peer.index as u16;

    let endpoint = match iface.acquire_endpoint(connect.dst_endpoint) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            iface.counters.inc(Counter::DropBadEndpoint);
            // The connect seqnum would be more telling, but the nacked
            // library only matches on the lib seqnum.
            send::send_nack_lib(
                driver,
                iface,
                peer_index,
                err.to_nack_type(),
                connect.dst_endpoint,
                connect.src_endpoint,
                connect.lib_seqnum,
            );
            return;
        }
    };

    // No session check: the connect carries the session handshake itself.
    let event = if !data.is_reply {
        Event::RecvConnectRequest(EvtRecvConnectRequest {
            peer_index,
            src_endpoint: connect.src_endpoint,
            shared: 0,
            seqnum: connect.lib_seqnum,
            src_session_id: data.src_session_id,
            app_key: data.app_key_or_target_session,
            target_recv_seqnum_start: data.target_recv_seqnum_start,
            connect_seqnum: data.connect_seqnum,
        })
    } else {
        Event::RecvConnectReply(EvtRecvConnectReply {
            peer_index,
            src_endpoint: connect.src_endpoint,
            shared: 0,
            seqnum: connect.lib_seqnum,
            src_session_id: data.src_session_id,
            target_session_id: data.app_key_or_target_session,
            target_recv_seqnum_start: data.target_recv_seqnum_start,
            connect_seqnum: data.connect_seqnum,
            connect_status_code: data.connect_status_code,
        })
    };
    if events::notify_unexp(&endpoint, &event).is_ok() {
        iface.counters.inc(if data.is_reply {
            Counter::RecvConnectReply
        } else {
            Counter::RecvConnectRequest
        });
    }
}

// ---------------------------------------------------------------------------
// Truc (LibAck)
// ---------------------------------------------------------------------------

fn recv_truc(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    let Some(truc) = PktTruc::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    if !check_peer_index(driver, iface, head) {
        return;
    }
    // No nack for truc messages, just drop.
    let Ok(endpoint) = iface.acquire_endpoint(truc.dst_endpoint) else {
        iface.counters.inc(Counter::DropBadEndpoint);
        return;
    };
    if truc.session != endpoint.session_id() {
        iface.counters.inc(Counter::DropBadSession);
        return;
    }

    if truc.truc_type != TRUC_TYPE_ACK {
        klog_debug!("truc packet with unknown type {}", truc.truc_type);
        return;
    }
    if (truc.length as usize) < crate::wire::LIBACK_DATA_LEN
        || body.len() < TRUC_HDR_LEN + crate::wire::LIBACK_DATA_LEN
    {
        iface.counters.inc(Counter::DropBadDatalen);
        return;
    }
    let Some(liback) = LibAckData::parse(&body[TRUC_HDR_LEN..]) else {
        iface.counters.inc(Counter::DropBadDatalen);
        return;
    };
    if liback.session_id != endpoint.session_id() {
        iface.counters.inc(Counter::DropBadSession);
        return;
    }

    let event = Event::RecvLibAck(EvtRecvLibAck {
        peer_index: head.dst_src_peer_index,
        src_endpoint: truc.src_endpoint,
        acknum: liback.acknum,
        lib_seqnum: liback.lib_seqnum,
        send_seq: liback.send_seq,
        resent: liback.resent as u8,
    });
    if events::notify_unexp(&endpoint, &event).is_ok() {
        iface.counters.inc(Counter::RecvLibAck);
    }
}

// ---------------------------------------------------------------------------
// NackLib
// ---------------------------------------------------------------------------

fn recv_nack_lib(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    let Some(nack) = PktNackLib::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    if body.len() < NACK_LIB_HDR_LEN {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    }

    let mut peer_index = head.dst_src_peer_index;
    if driver
        .peers()
        .check_recv_peer_index(peer_index, head.src.to_u64())
        .is_err()
    {
        // The nacker may not know its own index; fall back to the address.
        if peer_index != u16::MAX {
            iface.counters.inc(Counter::DropBadPeerIndex);
            return;
        }
        match driver.peers().lookup_by_addr(head.src.to_u64()) {
            Some(peer) => peer_index = peer.index as u16,
            None => {
                iface.counters.inc(Counter::DropBadPeerAddr);
                return;
            }
        }
    }

    // The nack targets the original sender's endpoint; no session check.
    let Ok(endpoint) = iface.acquire_endpoint(nack.dst_endpoint) else {
        iface.counters.inc(Counter::DropBadEndpoint);
        return;
    };

    let event = Event::RecvNackLib(EvtRecvNackLib {
        peer_index,
        src_endpoint: nack.src_endpoint,
        nack_type: nack.nack_type,
        seqnum: nack.lib_seqnum,
    });
    if events::notify_unexp(&endpoint, &event).is_ok() {
        iface.counters.inc(Counter::RecvNackLib);
    }
}
