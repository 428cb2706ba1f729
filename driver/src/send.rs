//! Send paths: building frames from commands and handing them to the NIC.
//!
//! Every non-connect send takes the destination peer index and endpoint,
//! the session id to be matched at the receiver, a 16-bit library seqnum
//! and a 16-bit piggybacked ack.  The `shared` flag selects the same-host
//! fast path, which shares the command encoding but not the wire; here it
//! is only counted.
//!
//! Frame allocation failure is `Nomem` with the alloc-failure counter
//! bumped — the library retries at its own pace.  No send path holds any
//! endpoint or handle lock across `tx`: the loopback device delivers
//! synchronously and would reenter the receive path.

use std::sync::Arc;

use omx_abi::cmd;
use omx_abi::counters::Counter;
use omx_abi::events::{Event, EvtSendMediumFragDone};
use omx_abi::{SENDQ_SIZE, SMALL_MSG_LENGTH_MAX, TINY_MSG_LENGTH_MAX};
use omx_mm::user_copy::copy_from_user;

use crate::endpoint::Endpoint;
use crate::events;
use crate::frame::FrameBuf;
use crate::iface::Iface;
use crate::wire::{
    ConnectData, LibAckData, NackType, PacketType, PktConnect, PktHead, PktMediumFrag,
    PktMsg, PktNackLib, PktNackMcp, PktNotify, PktRndv, PktTruc, CONNECT_DATA_LEN,
    CONNECT_HDR_LEN, LIBACK_DATA_LEN, MEDIUM_FRAG_LENGTH_MAX, MEDIUM_HDR_LEN, MSG_HDR_LEN,
    NACK_LIB_HDR_LEN, NACK_MCP_HDR_LEN, NOTIFY_HDR_LEN, PKT_HEAD_LEN, RNDV_HDR_LEN, TRUC_HDR_LEN,
    TRUC_TYPE_ACK,
};
use crate::{Driver, OmxError};

/// Rndv data length advertised in the generic header's length field.
const RNDV_DATA_LEN: u16 = (RNDV_HDR_LEN - MSG_HDR_LEN) as u16;
/// Connect data length advertised in the connect header's length field.
const CONNECT_DATA_LENGTH: u8 = CONNECT_DATA_LEN as u8;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Allocate a frame, counting the failure.
fn new_frame(driver: &Driver, iface: &Iface) -> Result<FrameBuf, OmxError> {
    match FrameBuf::alloc(driver.pool()) {
        Some(frame) => Ok(frame),
        None => {
            iface.counters.inc(Counter::SendNomemFrame);
            Err(OmxError::Nomem)
        }
    }
}

/// Resolve the destination MAC and our own peer index for the head.
fn fill_pkt_head(driver: &Driver, iface: &Iface, peer_index: u16) -> Result<PktHead, OmxError> {
    let dst = driver.peers().mac_of(peer_index).ok_or(OmxError::Invalid)?;
    let src = iface.mac();
    let own_index = driver
        .peers()
        .lookup_by_addr(src.to_u64())
        .map(|p| p.index as u16)
        .unwrap_or(u16::MAX);
    Ok(PktHead {
        dst,
        src,
        dst_src_peer_index: own_index,
    })
}

fn append_head(frame: &mut FrameBuf, head: &PktHead) -> Result<(), OmxError> {
    let off = frame.append_zeroed(PKT_HEAD_LEN)?;
    head.write(frame.linear_mut(off, PKT_HEAD_LEN));
    Ok(())
}

// ---------------------------------------------------------------------------
// Tiny / Small
// ---------------------------------------------------------------------------

pub(crate) fn send_tiny(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendTiny,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if cmd.length as usize > TINY_MSG_LENGTH_MAX {
        return Err(OmxError::Invalid);
    }
    if cmd.shared {
        iface.counters.inc(Counter::SharedTiny);
    }

    let head = fill_pkt_head(driver, iface, cmd.peer_index)?;
    let mut frame = new_frame(driver, iface)?;
    append_head(&mut frame, &head)?;
    let off = frame.append_zeroed(MSG_HDR_LEN)?;
    PktMsg {
        ptype: PacketType::Tiny as u8,
        dst_endpoint: cmd.dest_endpoint,
        src_endpoint: endpoint.endpoint_index(),
        length: cmd.length as u16,
        lib_seqnum: cmd.seqnum,
        lib_piggyack: cmd.piggyack,
        match_info: cmd.match_info,
        session: cmd.session_id,
        checksum: cmd.checksum,
    }
    .write(frame.linear_mut(off, MSG_HDR_LEN));
    frame.append(&cmd.data[..cmd.length as usize])?;
    frame.pad_to_min()?;

    iface.tx(frame)?;
    iface.counters.inc(Counter::SendTiny);
    Ok(())
}

pub(crate) fn send_small(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendSmall,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if cmd.length as usize > SMALL_MSG_LENGTH_MAX {
        return Err(OmxError::Invalid);
    }
    if cmd.shared {
        iface.counters.inc(Counter::SharedSmall);
    }

    // Copy the payload out of the user address space first; a bad vaddr
    // fails the command, not the wire.
    let mut payload = [0u8; SMALL_MSG_LENGTH_MAX];
    copy_from_user(endpoint.vm(), cmd.vaddr, &mut payload[..cmd.length as usize])
        .map_err(|_| OmxError::Fault)?;

    let head = fill_pkt_head(driver, iface, cmd.peer_index)?;
    let mut frame = new_frame(driver, iface)?;
    append_head(&mut frame, &head)?;
    let off = frame.append_zeroed(MSG_HDR_LEN)?;
    PktMsg {
        ptype: PacketType::Small as u8,
        dst_endpoint: cmd.dest_endpoint,
        src_endpoint: endpoint.endpoint_index(),
        length: cmd.length,
        lib_seqnum: cmd.seqnum,
        lib_piggyack: cmd.piggyack,
        match_info: cmd.match_info,
        session: cmd.session_id,
        checksum: cmd.checksum,
    }
    .write(frame.linear_mut(off, MSG_HDR_LEN));
    frame.append(&payload[..cmd.length as usize])?;
    frame.pad_to_min()?;

    iface.tx(frame)?;
    iface.counters.inc(Counter::SendSmall);
    Ok(())
}

// ---------------------------------------------------------------------------
// Medium
// ---------------------------------------------------------------------------

pub(crate) fn send_mediumsq_frag(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendMediumSqFrag,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if cmd.frag_length as usize > MEDIUM_FRAG_LENGTH_MAX
        || cmd.msg_length > u16::MAX as u32
        || cmd.sendq_offset >= SENDQ_SIZE
        || cmd.sendq_offset % omx_abi::SENDQ_ENTRY_SIZE != 0
    {
        return Err(OmxError::Invalid);
    }
    if cmd.shared {
        iface.counters.inc(Counter::SharedMediumSqFrag);
    }

    let head = fill_pkt_head(driver, iface, cmd.peer_index)?;
    let mut frame = new_frame(driver, iface)?;
    append_head(&mut frame, &head)?;
    let off = frame.append_zeroed(MEDIUM_HDR_LEN)?;
    PktMediumFrag {
        msg: PktMsg {
            ptype: PacketType::Medium as u8,
            dst_endpoint: cmd.dest_endpoint,
            src_endpoint: endpoint.endpoint_index(),
            length: cmd.msg_length as u16,
            lib_seqnum: cmd.seqnum,
            lib_piggyack: cmd.piggyack,
            match_info: cmd.match_info,
            session: cmd.session_id,
            checksum: cmd.checksum,
        },
        frag_length: cmd.frag_length,
        frag_seqnum: cmd.frag_seqnum,
        frag_pipeline: cmd.frag_pipeline,
    }
    .write(frame.linear_mut(off, MEDIUM_HDR_LEN));

    // Attach the sendq page without copying when it pays off; small
    // fragments (and frag-less configurations) go linear.
    let frag_len = cmd.frag_length as usize;
    let mut appended = false;
    if frag_len > driver.config.copybreak && driver.config.frame_frags_max > 0 {
        let page = endpoint.sendq.page_at(cmd.sendq_offset).clone();
        appended = frame
            .append_page_frag(
                page,
                (cmd.sendq_offset % omx_abi::SENDQ_ENTRY_SIZE) as usize,
                frag_len,
                driver.config.frame_frags_max,
            )
            .is_ok();
    }
    if !appended {
        iface.counters.inc(Counter::MediumSqFragSendLinear);
        let mut payload = vec![0u8; frag_len];
        endpoint.sendq.read(cmd.sendq_offset, &mut payload);
        frame.append(&payload)?;
    }
    frame.pad_to_min()?;

    iface.tx(frame)?;
    iface.counters.inc(Counter::SendMediumSqFrag);

    // The NIC accepted the fragment: give the sendq slot back.
    let _ = events::notify_exp(
        endpoint,
        &Event::SendMediumFragDone(EvtSendMediumFragDone {
            sendq_offset: cmd.sendq_offset,
        }),
    );
    Ok(())
}

pub(crate) fn send_mediumva(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendMediumVa,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    let total: u64 = cmd.segments.iter().map(|s| s.len).sum();
    if total != cmd.length as u64 || cmd.length > u16::MAX as u32 || cmd.length == 0 {
        return Err(OmxError::Invalid);
    }
    if cmd.shared {
        iface.counters.inc(Counter::SharedMediumVa);
    }

    // Gather the segment vector once, then cut fragments out of it.
    let mut data = vec![0u8; cmd.length as usize];
    let mut gathered = 0usize;
    for seg in &cmd.segments {
        copy_from_user(
            endpoint.vm(),
            seg.vaddr,
            &mut data[gathered..gathered + seg.len as usize],
        )
        .map_err(|_| OmxError::Fault)?;
        gathered += seg.len as usize;
    }

    let head = fill_pkt_head(driver, iface, cmd.peer_index)?;
    let mut frag_seqnum = 0u8;
    let mut sent = 0usize;
    loop {
        let frag_length = (cmd.length as usize - sent).min(MEDIUM_FRAG_LENGTH_MAX);
        let mut frame = new_frame(driver, iface)?;
        append_head(&mut frame, &head)?;
        let off = frame.append_zeroed(MEDIUM_HDR_LEN)?;
        PktMediumFrag {
            msg: PktMsg {
                ptype: PacketType::Medium as u8,
                dst_endpoint: cmd.dest_endpoint,
                src_endpoint: endpoint.endpoint_index(),
                length: cmd.length as u16,
                lib_seqnum: cmd.seqnum,
                lib_piggyack: cmd.piggyack,
                match_info: cmd.match_info,
                session: cmd.session_id,
                checksum: cmd.checksum,
            },
            frag_length: frag_length as u16,
            frag_seqnum,
            frag_pipeline: 0,
        }
        .write(frame.linear_mut(off, MEDIUM_HDR_LEN));
        frame.append(&data[sent..sent + frag_length])?;
        frame.pad_to_min()?;

        iface.tx(frame)?;
        iface.counters.inc(Counter::SendMediumVaFrag);

        sent += frag_length;
        frag_seqnum = frag_seqnum.wrapping_add(1);
        if sent >= cmd.length as usize {
            break;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rndv / Notify
// ---------------------------------------------------------------------------

pub(crate) fn send_rndv(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendRndv,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if cmd.shared {
        iface.counters.inc(Counter::SharedRndv);
    }

    let head = fill_pkt_head(driver, iface, cmd.peer_index)?;
    let mut frame = new_frame(driver, iface)?;
    append_head(&mut frame, &head)?;
    let off = frame.append_zeroed(RNDV_HDR_LEN)?;
    PktRndv {
        msg: PktMsg {
            ptype: PacketType::Rndv as u8,
            dst_endpoint: cmd.dest_endpoint,
            src_endpoint: endpoint.endpoint_index(),
            length: RNDV_DATA_LEN,
            lib_seqnum: cmd.seqnum,
            lib_piggyack: cmd.piggyack,
            match_info: cmd.match_info,
            session: cmd.session_id,
            checksum: cmd.checksum,
        },
        msg_length: cmd.msg_length,
        pulled_rdma_id: cmd.pulled_rdma_id,
        pulled_rdma_seqnum: cmd.pulled_rdma_seqnum,
        pulled_rdma_offset: 0,
    }
    .write(frame.linear_mut(off, RNDV_HDR_LEN));
    frame.pad_to_min()?;

    iface.tx(frame)?;
    iface.counters.inc(Counter::SendRndv);
    Ok(())
}

pub(crate) fn send_notify(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendNotify,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if cmd.shared {
        iface.counters.inc(Counter::SharedNotify);
    }

    let head = fill_pkt_head(driver, iface, cmd.peer_index)?;
    let mut frame = new_frame(driver, iface)?;
    append_head(&mut frame, &head)?;
    let off = frame.append_zeroed(NOTIFY_HDR_LEN)?;
    PktNotify {
        ptype: PacketType::Notify as u8,
        dst_endpoint: cmd.dest_endpoint,
        src_endpoint: endpoint.endpoint_index(),
        session: cmd.session_id,
        total_length: cmd.total_length,
        puller_rdma_id: cmd.pulled_rdma_id,
        puller_rdma_seqnum: cmd.pulled_rdma_seqnum,
        lib_seqnum: cmd.seqnum,
        lib_piggyack: cmd.piggyack,
    }
    .write(frame.linear_mut(off, NOTIFY_HDR_LEN));
    frame.pad_to_min()?;

    iface.tx(frame)?;
    iface.counters.inc(Counter::SendNotify);
    Ok(())
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

fn send_connect(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    peer_index: u16,
    dest_endpoint: u8,
    seqnum: u16,
    data: &ConnectData,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    let head = fill_pkt_head(driver, iface, peer_index)?;
    let mut frame = new_frame(driver, iface)?;
    append_head(&mut frame, &head)?;
    let off = frame.append_zeroed(CONNECT_HDR_LEN)?;
    PktConnect {
        ptype: PacketType::Connect as u8,
        dst_endpoint: dest_endpoint,
        src_endpoint: endpoint.endpoint_index(),
        length: CONNECT_DATA_LENGTH,
        lib_seqnum: seqnum,
        src_dst_peer_index: head.dst_src_peer_index,
    }
    .write(frame.linear_mut(off, CONNECT_HDR_LEN));
    let off = frame.append_zeroed(CONNECT_DATA_LEN)?;
    data.write(frame.linear_mut(off, CONNECT_DATA_LEN));
    frame.pad_to_min()?;
    iface.tx(frame)
}

pub(crate) fn send_connect_request(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendConnectRequest,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if !cmd.shared_disabled {
        iface.counters.inc(Counter::SharedConnectRequest);
    }
    send_connect(
        driver,
        endpoint,
        cmd.peer_index,
        cmd.dest_endpoint,
        cmd.seqnum,
        &ConnectData {
            src_session_id: cmd.src_session_id,
            app_key_or_target_session: cmd.app_key,
            target_recv_seqnum_start: cmd.target_recv_seqnum_start,
            connect_seqnum: cmd.connect_seqnum,
            is_reply: false,
            connect_status_code: 0,
        },
    )?;
    iface.counters.inc(Counter::SendConnectRequest);
    Ok(())
}

pub(crate) fn send_connect_reply(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendConnectReply,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if !cmd.shared_disabled {
        iface.counters.inc(Counter::SharedConnectReply);
    }
    send_connect(
        driver,
        endpoint,
        cmd.peer_index,
        cmd.dest_endpoint,
        cmd.seqnum,
        &ConnectData {
            src_session_id: cmd.src_session_id,
            app_key_or_target_session: cmd.target_session_id,
            target_recv_seqnum_start: cmd.target_recv_seqnum_start,
            connect_seqnum: cmd.connect_seqnum,
            is_reply: true,
            connect_status_code: cmd.connect_status_code,
        },
    )?;
    iface.counters.inc(Counter::SendConnectReply);
    Ok(())
}

// ---------------------------------------------------------------------------
// LibAck
// ---------------------------------------------------------------------------

pub(crate) fn send_liback(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::SendLibAck,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if cmd.shared {
        iface.counters.inc(Counter::SharedLibAck);
    }

    let head = fill_pkt_head(driver, iface, cmd.peer_index)?;
    let mut frame = new_frame(driver, iface)?;
    append_head(&mut frame, &head)?;
    let off = frame.append_zeroed(TRUC_HDR_LEN)?;
    PktTruc {
        ptype: PacketType::Truc as u8,
        dst_endpoint: cmd.dest_endpoint,
        src_endpoint: endpoint.endpoint_index(),
        truc_type: TRUC_TYPE_ACK,
        length: LIBACK_DATA_LEN as u8,
        session: cmd.session_id,
    }
    .write(frame.linear_mut(off, TRUC_HDR_LEN));
    let off = frame.append_zeroed(LIBACK_DATA_LEN)?;
    LibAckData {
        session_id: cmd.session_id,
        acknum: cmd.acknum,
        lib_seqnum: cmd.lib_seqnum,
        send_seq: cmd.send_seq,
        resent: cmd.resent,
    }
    .write(frame.linear_mut(off, LIBACK_DATA_LEN));
    frame.pad_to_min()?;

    iface.tx(frame)?;
    iface.counters.inc(Counter::SendLibAck);
    Ok(())
}

// ---------------------------------------------------------------------------
// Nacks (driver-generated, no endpoint on our side)
// ---------------------------------------------------------------------------

/// Nack a library-level packet back to its sender.
pub(crate) fn send_nack_lib(
    driver: &Driver,
    iface: &Iface,
    peer_index: u16,
    nack_type: NackType,
    dst_endpoint: u8,
    src_endpoint: u8,
    lib_seqnum: u16,
) {
    let Ok(head) = fill_pkt_head(driver, iface, peer_index) else {
        return;
    };
    let Ok(mut frame) = new_frame(driver, iface) else {
        return;
    };
    let build = (|| -> Result<(), OmxError> {
        append_head(&mut frame, &head)?;
        let off = frame.append_zeroed(NACK_LIB_HDR_LEN)?;
        PktNackLib {
            ptype: PacketType::NackLib as u8,
            // The endpoint that was targeted on our side.
            src_endpoint: dst_endpoint,
            nack_type: nack_type as u8,
            // The original sender's endpoint, target of the nack.
            dst_endpoint: src_endpoint,
            dst_src_peer_index: peer_index,
            lib_seqnum,
        }
        .write(frame.linear_mut(off, NACK_LIB_HDR_LEN));
        frame.pad_to_min()
    })();
    if build.is_ok() && iface.tx(frame).is_ok() {
        iface.counters.inc(Counter::SendNackLib);
    }
}

/// Nack a pull-protocol packet back to the pulling endpoint.
pub(crate) fn send_nack_mcp(
    driver: &Driver,
    iface: &Iface,
    peer_index: u16,
    nack_type: NackType,
    src_endpoint: u8,
    src_pull_handle: u32,
    src_magic: u32,
) {
    let Ok(head) = fill_pkt_head(driver, iface, peer_index) else {
        return;
    };
    let Ok(mut frame) = new_frame(driver, iface) else {
        return;
    };
    let build = (|| -> Result<(), OmxError> {
        append_head(&mut frame, &head)?;
        let off = frame.append_zeroed(NACK_MCP_HDR_LEN)?;
        PktNackMcp {
            ptype: PacketType::NackMcp as u8,
            src_endpoint,
            nack_type: nack_type as u8,
            src_pull_handle,
            src_magic,
        }
        .write(frame.linear_mut(off, NACK_MCP_HDR_LEN));
        frame.pad_to_min()
    })();
    if build.is_ok() && iface.tx(frame).is_ok() {
        iface.counters.inc(Counter::SendNackMcp);
    }
}
