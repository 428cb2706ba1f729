//! Wire framing tests: header round-trips and profile arithmetic.

use crate::wire::*;

#[test]
fn profile_arithmetic_is_consistent() {
    assert_eq!(PULL_BLOCK_LENGTH_MAX, PULL_REPLY_LENGTH_MAX * PULL_REPLY_PER_BLOCK);
    assert!(PKT_HEAD_LEN + PULL_REPLY_HDR_LEN + PULL_REPLY_LENGTH_MAX <= OMX_MTU);
    assert!(PKT_HEAD_LEN + MEDIUM_HDR_LEN + MEDIUM_FRAG_LENGTH_MAX <= OMX_MTU);
}

#[test]
fn head_rejects_foreign_ethertype() {
    let head = PktHead {
        dst: MacAddr([1, 2, 3, 4, 5, 6]),
        src: MacAddr([6, 5, 4, 3, 2, 1]),
        dst_src_peer_index: 42,
    };
    let mut buf = [0u8; PKT_HEAD_LEN];
    head.write(&mut buf);
    assert_eq!(PktHead::parse(&buf), Some(head));

    // An IPv4 frame is not ours.
    buf[12] = 0x08;
    buf[13] = 0x00;
    assert_eq!(PktHead::parse(&buf), None);
}

#[test]
fn msg_header_round_trip_carries_match_info() {
    let msg = PktMsg {
        ptype: PacketType::Tiny as u8,
        dst_endpoint: 3,
        src_endpoint: 9,
        length: 10,
        lib_seqnum: 0x1234,
        lib_piggyack: 0x4321,
        match_info: 0xAABB_CCDD_0011_2233,
        session: 0xDEAD_BEEF,
        checksum: 0x0F0F,
    };
    let mut buf = [0u8; MSG_HDR_LEN];
    msg.write(&mut buf);
    assert_eq!(PktMsg::parse(&buf), Some(msg));
}

#[test]
fn pull_request_block_fields_can_be_patched() {
    let req = PktPullRequest {
        ptype: PacketType::Pull as u8,
        dst_endpoint: 1,
        src_endpoint: 2,
        session: 0x5555_AAAA,
        total_length: 12288,
        pulled_rdma_id: 7,
        pulled_rdma_seqnum: 3,
        pulled_rdma_offset: 0,
        src_pull_handle: 0x00C0_0023,
        src_magic: 0x2107_1980,
        first_frame_offset: 0,
        block_length: 0,
        frame_index: 0,
    };
    let mut buf = [0u8; PULL_HDR_LEN];
    req.write(&mut buf);

    PktPullRequest::patch_block_fields(&mut buf, 12288, 128, 64);
    let patched = PktPullRequest::parse(&buf).unwrap();
    assert_eq!(patched.block_length, 12288);
    assert_eq!(patched.first_frame_offset, 128);
    assert_eq!(patched.frame_index, 64);
    // Everything else is untouched.
    assert_eq!(patched.session, req.session);
    assert_eq!(patched.src_pull_handle, req.src_pull_handle);
    assert_eq!(patched.src_magic, req.src_magic);
}

#[test]
fn pull_reply_round_trip() {
    let reply = PktPullReply {
        ptype: PacketType::PullReply as u8,
        frame_seqnum: 200,
        frame_length: 4096,
        msg_offset: 8192,
        dst_pull_handle: 0x1234_5678,
        dst_magic: 0x2107_1983,
    };
    let mut buf = [0u8; PULL_REPLY_HDR_LEN];
    reply.write(&mut buf);
    assert_eq!(PktPullReply::parse(&buf), Some(reply));
}

#[test]
fn connect_data_discriminates_request_and_reply() {
    let request = ConnectData {
        src_session_id: 1,
        app_key_or_target_session: 0xCAFE,
        target_recv_seqnum_start: 17,
        connect_seqnum: 4,
        is_reply: false,
        connect_status_code: 0,
    };
    let mut buf = [0u8; CONNECT_DATA_LEN];
    request.write(&mut buf);
    assert_eq!(ConnectData::parse(&buf), Some(request));

    let reply = ConnectData {
        is_reply: true,
        connect_status_code: omx_abi::CONNECT_STATUS_BAD_KEY,
        ..request
    };
    reply.write(&mut buf);
    let parsed = ConnectData::parse(&buf).unwrap();
    assert!(parsed.is_reply);
    assert_eq!(parsed.connect_status_code, omx_abi::CONNECT_STATUS_BAD_KEY);
}

#[test]
fn mac_addr_u64_round_trip() {
    let mac = MacAddr([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
    assert_eq!(MacAddr::from_u64(mac.to_u64()), mac);
    assert_eq!(mac.to_u64() >> 48, 0);
}
