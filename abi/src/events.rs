//! The 64-byte event records posted to the expected and unexpected queues.
//!
//! Records are a tagged union: the 8-bit type and the 8-bit id occupy the
//! *last* two bytes (offsets 62 and 63) so that a consumer polling the id
//! byte observes the record as fully written once the id becomes nonzero.
//! Everything else is stored little-endian at fixed offsets.
//!
//! [`Event::encode`] and [`Event::decode`] convert between the typed view
//! and the raw record.  The id byte is owned by the queue machinery, not by
//! the event payload, so `encode` leaves it zero and `decode` ignores it.

/// Raw 64-byte event record as it appears in the user-mapped ring.
pub type EventRecord = [u8; 64];

/// Byte offset of the type tag within a record.
pub const EVENT_TYPE_OFFSET: usize = 62;
/// Byte offset of the id within a record.
pub const EVENT_ID_OFFSET: usize = 63;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Event type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    None = 0x00,
    /// Slot was reserved but the event was cancelled; the consumer skips it.
    Ignore = 0x01,
    RecvConnectRequest = 0x11,
    RecvConnectReply = 0x12,
    RecvTiny = 0x13,
    RecvSmall = 0x14,
    RecvMediumFrag = 0x15,
    RecvRndv = 0x16,
    RecvNotify = 0x17,
    RecvLibAck = 0x18,
    RecvNackLib = 0x19,
    SendMediumFragDone = 0x20,
    PullDone = 0x21,
}

impl EventType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::None,
            0x01 => Self::Ignore,
            0x11 => Self::RecvConnectRequest,
            0x12 => Self::RecvConnectReply,
            0x13 => Self::RecvTiny,
            0x14 => Self::RecvSmall,
            0x15 => Self::RecvMediumFrag,
            0x16 => Self::RecvRndv,
            0x17 => Self::RecvNotify,
            0x18 => Self::RecvLibAck,
            0x19 => Self::RecvNackLib,
            0x20 => Self::SendMediumFragDone,
            0x21 => Self::PullDone,
            _ => return None,
        })
    }
}

/// Nack reasons reported through `RecvNackLib` events.
pub const EVT_NACK_LIB_BAD_ENDPT: u8 = 0x01;
pub const EVT_NACK_LIB_ENDPT_CLOSED: u8 = 0x02;
pub const EVT_NACK_LIB_BAD_SESSION: u8 = 0x03;

/// Statuses reported through `PullDone` events.
///
/// The nonzero values coincide with the wire nack types so that a nack can
/// complete a pull handle without translation (checked by a build assertion
/// in the driver).
pub const EVT_PULL_DONE_SUCCESS: u8 = 0x00;
pub const EVT_PULL_DONE_BAD_ENDPT: u8 = 0x01;
pub const EVT_PULL_DONE_ENDPT_CLOSED: u8 = 0x02;
pub const EVT_PULL_DONE_BAD_SESSION: u8 = 0x03;
pub const EVT_PULL_DONE_BAD_RDMAWIN: u8 = 0x04;
pub const EVT_PULL_DONE_ABORTED: u8 = 0x05;
pub const EVT_PULL_DONE_TIMEOUT: u8 = 0x06;

// ---------------------------------------------------------------------------
// Typed event payloads
// ---------------------------------------------------------------------------

/// Payload specific to each received-message kind, stored at offset 16.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvMsgSpecific {
    Tiny {
        checksum: u16,
        length: u8,
        data: [u8; crate::TINY_MSG_LENGTH_MAX],
    },
    Small {
        recvq_offset: u32,
        length: u16,
        checksum: u16,
    },
    MediumFrag {
        recvq_offset: u32,
        msg_length: u32,
        frag_length: u16,
        frag_seqnum: u8,
        frag_pipeline: u8,
        checksum: u16,
    },
    Rndv {
        msg_length: u32,
        pulled_rdma_id: u8,
        pulled_rdma_seqnum: u8,
        pulled_rdma_offset: u16,
        checksum: u16,
    },
    Notify {
        length: u32,
        pulled_rdma_id: u8,
        pulled_rdma_seqnum: u8,
    },
}

/// A message received from a peer endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtRecvMsg {
    pub peer_index: u16,
    pub src_endpoint: u8,
    pub seqnum: u16,
    pub piggyack: u16,
    pub match_info: u64,
    pub specific: RecvMsgSpecific,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtRecvConnectRequest {
    pub peer_index: u16,
    pub src_endpoint: u8,
    pub shared: u8,
    pub seqnum: u16,
    pub src_session_id: u32,
    pub app_key: u32,
    pub target_recv_seqnum_start: u16,
    pub connect_seqnum: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtRecvConnectReply {
    pub peer_index: u16,
    pub src_endpoint: u8,
    pub shared: u8,
    pub seqnum: u16,
    pub src_session_id: u32,
    pub target_session_id: u32,
    pub target_recv_seqnum_start: u16,
    pub connect_seqnum: u8,
    pub connect_status_code: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtRecvLibAck {
    pub peer_index: u16,
    pub src_endpoint: u8,
    pub acknum: u32,
    pub lib_seqnum: u16,
    pub send_seq: u16,
    pub resent: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtRecvNackLib {
    pub peer_index: u16,
    pub src_endpoint: u8,
    pub nack_type: u8,
    pub seqnum: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtSendMediumFragDone {
    pub sendq_offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtPullDone {
    pub lib_cookie: u64,
    pub puller_rdma_id: u32,
    pub status: u8,
}

/// A fully decoded event record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Ignore,
    RecvConnectRequest(EvtRecvConnectRequest),
    RecvConnectReply(EvtRecvConnectReply),
    RecvTiny(EvtRecvMsg),
    RecvSmall(EvtRecvMsg),
    RecvMediumFrag(EvtRecvMsg),
    RecvRndv(EvtRecvMsg),
    RecvNotify(EvtRecvMsg),
    RecvLibAck(EvtRecvLibAck),
    RecvNackLib(EvtRecvNackLib),
    SendMediumFragDone(EvtSendMediumFragDone),
    PullDone(EvtPullDone),
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn put_u16(rec: &mut EventRecord, off: usize, v: u16) {
    rec[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(rec: &mut EventRecord, off: usize, v: u32) {
    rec[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(rec: &mut EventRecord, off: usize, v: u64) {
    rec[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(rec: &EventRecord, off: usize) -> u16 {
    u16::from_le_bytes([rec[off], rec[off + 1]])
}

fn get_u32(rec: &EventRecord, off: usize) -> u32 {
    u32::from_le_bytes([rec[off], rec[off + 1], rec[off + 2], rec[off + 3]])
}

fn get_u64(rec: &EventRecord, off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&rec[off..off + 8]);
    u64::from_le_bytes(b)
}

fn encode_msg_head(rec: &mut EventRecord, msg: &EvtRecvMsg) {
    put_u16(rec, 0, msg.peer_index);
    rec[2] = msg.src_endpoint;
    put_u16(rec, 4, msg.seqnum);
    put_u16(rec, 6, msg.piggyack);
    put_u64(rec, 8, msg.match_info);
}

fn encode_msg_specific(rec: &mut EventRecord, specific: &RecvMsgSpecific) {
    match *specific {
        RecvMsgSpecific::Tiny {
            checksum,
            length,
            data,
        } => {
            put_u16(rec, 16, checksum);
            rec[18] = length;
            rec[24..24 + crate::TINY_MSG_LENGTH_MAX].copy_from_slice(&data);
        }
        RecvMsgSpecific::Small {
            recvq_offset,
            length,
            checksum,
        } => {
            put_u32(rec, 16, recvq_offset);
            put_u16(rec, 20, length);
            put_u16(rec, 22, checksum);
        }
        RecvMsgSpecific::MediumFrag {
            recvq_offset,
            msg_length,
            frag_length,
            frag_seqnum,
            frag_pipeline,
            checksum,
        } => {
            put_u32(rec, 16, recvq_offset);
            put_u32(rec, 20, msg_length);
            put_u16(rec, 24, frag_length);
            rec[26] = frag_seqnum;
            rec[27] = frag_pipeline;
            put_u16(rec, 28, checksum);
        }
        RecvMsgSpecific::Rndv {
            msg_length,
            pulled_rdma_id,
            pulled_rdma_seqnum,
            pulled_rdma_offset,
            checksum,
        } => {
            put_u32(rec, 16, msg_length);
            rec[20] = pulled_rdma_id;
            rec[21] = pulled_rdma_seqnum;
            put_u16(rec, 22, pulled_rdma_offset);
            put_u16(rec, 24, checksum);
        }
        RecvMsgSpecific::Notify {
            length,
            pulled_rdma_id,
            pulled_rdma_seqnum,
        } => {
            put_u32(rec, 16, length);
            rec[20] = pulled_rdma_id;
            rec[21] = pulled_rdma_seqnum;
        }
    }
}

fn decode_msg(rec: &EventRecord, ty: EventType) -> Option<EvtRecvMsg> {
    let specific = match ty {
        EventType::RecvTiny => {
            let mut data = [0u8; crate::TINY_MSG_LENGTH_MAX];
            data.copy_from_slice(&rec[24..24 + crate::TINY_MSG_LENGTH_MAX]);
            RecvMsgSpecific::Tiny {
                checksum: get_u16(rec, 16),
                length: rec[18],
                data,
            }
        }
        EventType::RecvSmall => RecvMsgSpecific::Small {
            recvq_offset: get_u32(rec, 16),
            length: get_u16(rec, 20),
            checksum: get_u16(rec, 22),
        },
        EventType::RecvMediumFrag => RecvMsgSpecific::MediumFrag {
            recvq_offset: get_u32(rec, 16),
            msg_length: get_u32(rec, 20),
            frag_length: get_u16(rec, 24),
            frag_seqnum: rec[26],
            frag_pipeline: rec[27],
            checksum: get_u16(rec, 28),
        },
        EventType::RecvRndv => RecvMsgSpecific::Rndv {
            msg_length: get_u32(rec, 16),
            pulled_rdma_id: rec[20],
            pulled_rdma_seqnum: rec[21],
            pulled_rdma_offset: get_u16(rec, 22),
            checksum: get_u16(rec, 24),
        },
        EventType::RecvNotify => RecvMsgSpecific::Notify {
            length: get_u32(rec, 16),
            pulled_rdma_id: rec[20],
            pulled_rdma_seqnum: rec[21],
        },
        _ => return None,
    };
    Some(EvtRecvMsg {
        peer_index: get_u16(rec, 0),
        src_endpoint: rec[2],
        seqnum: get_u16(rec, 4),
        piggyack: get_u16(rec, 6),
        match_info: get_u64(rec, 8),
        specific,
    })
}

impl Event {
    /// The type tag of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Ignore => EventType::Ignore,
            Event::RecvConnectRequest(_) => EventType::RecvConnectRequest,
            Event::RecvConnectReply(_) => EventType::RecvConnectReply,
            Event::RecvTiny(_) => EventType::RecvTiny,
            Event::RecvSmall(_) => EventType::RecvSmall,
            Event::RecvMediumFrag(_) => EventType::RecvMediumFrag,
            Event::RecvRndv(_) => EventType::RecvRndv,
            Event::RecvNotify(_) => EventType::RecvNotify,
            Event::RecvLibAck(_) => EventType::RecvLibAck,
            Event::RecvNackLib(_) => EventType::RecvNackLib,
            Event::SendMediumFragDone(_) => EventType::SendMediumFragDone,
            Event::PullDone(_) => EventType::PullDone,
        }
    }

    /// Encode into a raw record.  The id byte (offset 63) is left zero; the
    /// queue machinery writes it last.
    pub fn encode(&self) -> EventRecord {
        let mut rec: EventRecord = [0; 64];
        match self {
            Event::Ignore => {}
            Event::RecvConnectRequest(e) => {
                put_u16(&mut rec, 0, e.peer_index);
                rec[2] = e.src_endpoint;
                rec[3] = e.shared;
                put_u16(&mut rec, 4, e.seqnum);
                put_u32(&mut rec, 8, e.src_session_id);
                put_u32(&mut rec, 12, e.app_key);
                put_u16(&mut rec, 16, e.target_recv_seqnum_start);
                rec[18] = e.connect_seqnum;
            }
            Event::RecvConnectReply(e) => {
                put_u16(&mut rec, 0, e.peer_index);
                rec[2] = e.src_endpoint;
                rec[3] = e.shared;
                put_u16(&mut rec, 4, e.seqnum);
                put_u32(&mut rec, 8, e.src_session_id);
                put_u32(&mut rec, 12, e.target_session_id);
                put_u16(&mut rec, 16, e.target_recv_seqnum_start);
                rec[18] = e.connect_seqnum;
                rec[19] = e.connect_status_code;
            }
            Event::RecvTiny(m)
            | Event::RecvSmall(m)
            | Event::RecvMediumFrag(m)
            | Event::RecvRndv(m)
            | Event::RecvNotify(m) => {
                encode_msg_head(&mut rec, m);
                encode_msg_specific(&mut rec, &m.specific);
            }
            Event::RecvLibAck(e) => {
                put_u16(&mut rec, 0, e.peer_index);
                rec[2] = e.src_endpoint;
                put_u32(&mut rec, 8, e.acknum);
                put_u16(&mut rec, 12, e.lib_seqnum);
                put_u16(&mut rec, 14, e.send_seq);
                rec[16] = e.resent;
            }
            Event::RecvNackLib(e) => {
                put_u16(&mut rec, 0, e.peer_index);
                rec[2] = e.src_endpoint;
                rec[3] = e.nack_type;
                put_u16(&mut rec, 4, e.seqnum);
            }
            Event::SendMediumFragDone(e) => {
                put_u32(&mut rec, 0, e.sendq_offset);
            }
            Event::PullDone(e) => {
                put_u64(&mut rec, 0, e.lib_cookie);
                put_u32(&mut rec, 8, e.puller_rdma_id);
                rec[12] = e.status;
            }
        }
        rec[EVENT_TYPE_OFFSET] = self.event_type() as u8;
        rec
    }

    /// Decode a raw record; `None` for unfilled or unknown records.
    pub fn decode(rec: &EventRecord) -> Option<Event> {
        let ty = EventType::from_u8(rec[EVENT_TYPE_OFFSET])?;
        Some(match ty {
            EventType::None => return None,
            EventType::Ignore => Event::Ignore,
            EventType::RecvConnectRequest => Event::RecvConnectRequest(EvtRecvConnectRequest {
                peer_index: get_u16(rec, 0),
                src_endpoint: rec[2],
                shared: rec[3],
                seqnum: get_u16(rec, 4),
                src_session_id: get_u32(rec, 8),
                app_key: get_u32(rec, 12),
                target_recv_seqnum_start: get_u16(rec, 16),
                connect_seqnum: rec[18],
            }),
            EventType::RecvConnectReply => Event::RecvConnectReply(EvtRecvConnectReply {
                peer_index: get_u16(rec, 0),
                src_endpoint: rec[2],
                shared: rec[3],
                seqnum: get_u16(rec, 4),
                src_session_id: get_u32(rec, 8),
                target_session_id: get_u32(rec, 12),
                target_recv_seqnum_start: get_u16(rec, 16),
                connect_seqnum: rec[18],
                connect_status_code: rec[19],
            }),
            EventType::RecvTiny => Event::RecvTiny(decode_msg(rec, ty)?),
            EventType::RecvSmall => Event::RecvSmall(decode_msg(rec, ty)?),
            EventType::RecvMediumFrag => Event::RecvMediumFrag(decode_msg(rec, ty)?),
            EventType::RecvRndv => Event::RecvRndv(decode_msg(rec, ty)?),
            EventType::RecvNotify => Event::RecvNotify(decode_msg(rec, ty)?),
            EventType::RecvLibAck => Event::RecvLibAck(EvtRecvLibAck {
                peer_index: get_u16(rec, 0),
                src_endpoint: rec[2],
                acknum: get_u32(rec, 8),
                lib_seqnum: get_u16(rec, 12),
                send_seq: get_u16(rec, 14),
                resent: rec[16],
            }),
            EventType::RecvNackLib => Event::RecvNackLib(EvtRecvNackLib {
                peer_index: get_u16(rec, 0),
                src_endpoint: rec[2],
                nack_type: rec[3],
                seqnum: get_u16(rec, 4),
            }),
            EventType::SendMediumFragDone => Event::SendMediumFragDone(EvtSendMediumFragDone {
                sendq_offset: get_u32(rec, 0),
            }),
            EventType::PullDone => Event::PullDone(EvtPullDone {
                lib_cookie: get_u64(rec, 0),
                puller_rdma_id: get_u32(rec, 8),
                status: rec[12],
            }),
        })
    }
}
