//! Wire framing: packet types, per-type headers, and profile constants.
//!
//! Every frame is a 16-byte head (Ethernet header plus the sender's 16-bit
//! peer index) followed by a per-type record.  All multi-byte fields are
//! big-endian on the wire; parsing and writing is explicit byte shuffling,
//! no layout tricks.
//!
//! Two wire profiles exist.  The native profile derives fragment sizes from
//! the configured MTU and uses 32 replies per pull block with 32-bit rdma
//! ids/offsets; the `mx-wire-compat` feature selects the MX profile with
//! 4096-byte payloads, 8 replies per block and 8/16-bit rdma fields.

use core::fmt;

/// EtherType of the messaging protocol.
pub const ETH_P_OMX: u16 = 0x86DF;

/// Minimal Ethernet frame length (without FCS); short frames are padded.
pub const ETH_ZLEN: usize = 60;

/// Ethernet header: dst MAC, src MAC, EtherType.
pub const ETH_HDR_LEN: usize = 14;

/// Common head: Ethernet header + 16-bit sender peer index.
pub const PKT_HEAD_LEN: usize = ETH_HDR_LEN + 2;

// Per-type header lengths (after the common head).
pub const MSG_HDR_LEN: usize = 24;
pub const MEDIUM_HDR_LEN: usize = 32;
pub const RNDV_HDR_LEN: usize = 32;
pub const CONNECT_HDR_LEN: usize = 16;
pub const CONNECT_DATA_LEN: usize = 16;
pub const TRUC_HDR_LEN: usize = 12;
pub const LIBACK_DATA_LEN: usize = 16;

/// Truc payload kinds; only acks are defined today.
pub const TRUC_TYPE_ACK: u8 = 1;
pub const PULL_REPLY_HDR_LEN: usize = 16;
pub const NOTIFY_HDR_LEN: usize = 24;
pub const NACK_LIB_HDR_LEN: usize = 16;
pub const NACK_MCP_HDR_LEN: usize = 16;

#[cfg(not(feature = "mx-wire-compat"))]
pub const PULL_HDR_LEN: usize = 44;
#[cfg(feature = "mx-wire-compat")]
pub const PULL_HDR_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Profile constants
// ---------------------------------------------------------------------------

#[cfg(not(feature = "mx-wire-compat"))]
mod profile {
    /// Configure-time MTU; fragment sizes derive from it.
    pub const OMX_MTU: usize = 4128;

    /// Pull replies use the full MTU.
    pub const PULL_REPLY_LENGTH_MAX: usize =
        OMX_MTU - super::PKT_HEAD_LEN - super::PULL_REPLY_HDR_LEN;

    /// Medium fragments use the exact MTU-minus-headers while it fits a page.
    pub const MEDIUM_FRAG_LENGTH_MAX: usize =
        OMX_MTU - super::PKT_HEAD_LEN - super::MEDIUM_HDR_LEN;

    pub const PULL_REPLY_PER_BLOCK: usize = 32;

    /// Smallest unsigned type holding one bit per reply frame of a block.
    pub type BlockFrameBitmask = u32;
}

#[cfg(feature = "mx-wire-compat")]
mod profile {
    /// MX uses 4096-byte payloads plus headers; not really an MTU but it
    /// keeps the arithmetic uniform.
    pub const PULL_REPLY_LENGTH_MAX: usize = 4096;
    pub const MEDIUM_FRAG_LENGTH_MAX: usize = 4096;

    pub const OMX_MTU: usize = super::PKT_HEAD_LEN
        + super::PULL_REPLY_HDR_LEN
        + PULL_REPLY_LENGTH_MAX
        + (super::MEDIUM_HDR_LEN - super::PULL_REPLY_HDR_LEN);

    pub const PULL_REPLY_PER_BLOCK: usize = 8;

    pub type BlockFrameBitmask = u8;
}

pub use profile::{
    BlockFrameBitmask, MEDIUM_FRAG_LENGTH_MAX, OMX_MTU, PULL_REPLY_LENGTH_MAX,
    PULL_REPLY_PER_BLOCK,
};

pub const PULL_BLOCK_LENGTH_MAX: usize = PULL_REPLY_LENGTH_MAX * PULL_REPLY_PER_BLOCK;

pub const ENDPOINT_INDEX_MAX: usize = 256;
pub const PEER_INDEX_MAX: usize = 65536;

// The reply-per-block count must be a power of two (we divide by it on the
// reply hot path) and must fit the bitmap type.
const _: () = assert!(PULL_REPLY_PER_BLOCK.is_power_of_two());
const _: () = assert!(PULL_REPLY_PER_BLOCK <= BlockFrameBitmask::BITS as usize);
// Sendq/recvq entries must hold a medium fragment and a pull reply.
const _: () = assert!(MEDIUM_FRAG_LENGTH_MAX <= omx_abi::RECVQ_ENTRY_SIZE as usize);
const _: () = assert!(PULL_REPLY_LENGTH_MAX <= omx_abi::RECVQ_ENTRY_SIZE as usize);
#[cfg(feature = "mx-wire-compat")]
const _: () = assert!(PULL_REPLY_LENGTH_MAX < 65536 && PULL_BLOCK_LENGTH_MAX < 65536);

// ---------------------------------------------------------------------------
// MAC addresses
// ---------------------------------------------------------------------------

/// A 48-bit Ethernet address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Pack into the low 48 bits of a u64 (board address form).
    pub fn to_u64(self) -> u64 {
        let b = self.0;
        ((b[0] as u64) << 40)
            | ((b[1] as u64) << 32)
            | ((b[2] as u64) << 24)
            | ((b[3] as u64) << 16)
            | ((b[4] as u64) << 8)
            | (b[5] as u64)
    }

    pub fn from_u64(addr: u64) -> Self {
        MacAddr([
            (addr >> 40) as u8,
            (addr >> 32) as u8,
            (addr >> 24) as u8,
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            addr as u8,
        ])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

// ---------------------------------------------------------------------------
// Packet types
// ---------------------------------------------------------------------------

/// 8-bit packet type, first byte after the common head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    None = 0,
    Raw = 1,
    MfmNicReply = 2,
    HostQuery = 3,
    HostReply = 4,
    EtherUnicast = 32,
    EtherMulticast = 33,
    EtherNative = 34,
    Truc = 35,
    Connect = 36,
    Tiny = 37,
    Small = 38,
    Medium = 39,
    Rndv = 40,
    Pull = 41,
    PullReply = 42,
    Notify = 43,
    NackLib = 44,
    NackMcp = 45,
}

impl PacketType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::Raw,
            2 => Self::MfmNicReply,
            3 => Self::HostQuery,
            4 => Self::HostReply,
            32 => Self::EtherUnicast,
            33 => Self::EtherMulticast,
            34 => Self::EtherNative,
            35 => Self::Truc,
            36 => Self::Connect,
            37 => Self::Tiny,
            38 => Self::Small,
            39 => Self::Medium,
            40 => Self::Rndv,
            41 => Self::Pull,
            42 => Self::PullReply,
            43 => Self::Notify,
            44 => Self::NackLib,
            45 => Self::NackMcp,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Raw => "Raw",
            Self::MfmNicReply => "MFM Nic Reply",
            Self::HostQuery => "Host Query",
            Self::HostReply => "Host Reply",
            Self::EtherUnicast => "Ether Unicast",
            Self::EtherMulticast => "Ether Multicast",
            Self::EtherNative => "Ether Native",
            Self::Truc => "Truc",
            Self::Connect => "Connect",
            Self::Tiny => "Tiny",
            Self::Small => "Small",
            Self::Medium => "Medium",
            Self::Rndv => "Rendez Vous",
            Self::Pull => "Pull",
            Self::PullReply => "Pull Reply",
            Self::Notify => "Notify",
            Self::NackLib => "Nack Lib",
            Self::NackMcp => "Nack MCP",
        }
    }
}

/// Nack reasons carried by NackLib and NackMcp packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NackType {
    None = 0,
    BadEndpoint = 1,
    EndpointClosed = 2,
    BadSession = 3,
    BadRdmaWindow = 4,
}

impl NackType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::BadEndpoint,
            2 => Self::EndpointClosed,
            3 => Self::BadSession,
            4 => Self::BadRdmaWindow,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::BadEndpoint => "Bad Endpoint",
            Self::EndpointClosed => "Endpoint Closed",
            Self::BadSession => "Bad Session",
            Self::BadRdmaWindow => "Bad RDMA Window",
        }
    }
}

// A nack can complete a pull handle without translation.
const _: () = assert!(NackType::BadEndpoint as u8 == omx_abi::events::EVT_PULL_DONE_BAD_ENDPT);
const _: () = assert!(NackType::EndpointClosed as u8 == omx_abi::events::EVT_PULL_DONE_ENDPT_CLOSED);
const _: () = assert!(NackType::BadSession as u8 == omx_abi::events::EVT_PULL_DONE_BAD_SESSION);
const _: () = assert!(NackType::BadRdmaWindow as u8 == omx_abi::events::EVT_PULL_DONE_BAD_RDMAWIN);
// ... and a nack-lib event reuses the same values.
const _: () = assert!(NackType::BadEndpoint as u8 == omx_abi::events::EVT_NACK_LIB_BAD_ENDPT);
const _: () = assert!(NackType::EndpointClosed as u8 == omx_abi::events::EVT_NACK_LIB_ENDPT_CLOSED);
const _: () = assert!(NackType::BadSession as u8 == omx_abi::events::EVT_NACK_LIB_BAD_SESSION);

// ---------------------------------------------------------------------------
// Field access helpers
// ---------------------------------------------------------------------------

#[inline]
fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Common head
// ---------------------------------------------------------------------------

/// The 16-byte common head of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PktHead {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// The sender's index in the receiver's peer table.
    pub dst_src_peer_index: u16,
}

impl PktHead {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..6].copy_from_slice(&self.dst.0);
        buf[6..12].copy_from_slice(&self.src.0);
        put_u16(buf, 12, ETH_P_OMX);
        put_u16(buf, 14, self.dst_src_peer_index);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PKT_HEAD_LEN || get_u16(buf, 12) != ETH_P_OMX {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);
        Some(PktHead {
            dst: MacAddr(dst),
            src: MacAddr(src),
            dst_src_peer_index: get_u16(buf, 14),
        })
    }
}

// ---------------------------------------------------------------------------
// Generic message header (Tiny, Small, and the base of Medium/Rndv)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktMsg {
    pub ptype: u8,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub length: u16,
    pub lib_seqnum: u16,
    pub lib_piggyack: u16,
    pub match_info: u64,
    pub session: u32,
    pub checksum: u16,
}

impl PktMsg {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.dst_endpoint;
        buf[2] = self.src_endpoint;
        buf[3] = 0; // src_generation, unused
        put_u16(buf, 4, self.length);
        put_u16(buf, 6, self.checksum);
        put_u16(buf, 8, self.lib_seqnum);
        put_u16(buf, 10, self.lib_piggyack);
        put_u32(buf, 12, (self.match_info >> 32) as u32);
        put_u32(buf, 16, self.match_info as u32);
        put_u32(buf, 20, self.session);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < MSG_HDR_LEN {
            return None;
        }
        Some(PktMsg {
            ptype: buf[0],
            dst_endpoint: buf[1],
            src_endpoint: buf[2],
            length: get_u16(buf, 4),
            checksum: get_u16(buf, 6),
            lib_seqnum: get_u16(buf, 8),
            lib_piggyack: get_u16(buf, 10),
            match_info: ((get_u32(buf, 12) as u64) << 32) | get_u32(buf, 16) as u64,
            session: get_u32(buf, 20),
        })
    }
}

/// Medium fragment header: the generic message header plus fragment fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktMediumFrag {
    pub msg: PktMsg,
    pub frag_length: u16,
    pub frag_seqnum: u8,
    pub frag_pipeline: u8,
}

impl PktMediumFrag {
    pub fn write(&self, buf: &mut [u8]) {
        self.msg.write(buf);
        put_u16(buf, 24, self.frag_length);
        buf[26] = self.frag_seqnum;
        buf[27] = self.frag_pipeline;
        buf[28..32].fill(0);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < MEDIUM_HDR_LEN {
            return None;
        }
        Some(PktMediumFrag {
            msg: PktMsg::parse(buf)?,
            frag_length: get_u16(buf, 24),
            frag_seqnum: buf[26],
            frag_pipeline: buf[27],
        })
    }
}

/// Rendez-vous header: the generic message header plus the advertised
/// region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktRndv {
    pub msg: PktMsg,
    pub msg_length: u32,
    pub pulled_rdma_id: u8,
    pub pulled_rdma_seqnum: u8,
    pub pulled_rdma_offset: u16,
}

impl PktRndv {
    pub fn write(&self, buf: &mut [u8]) {
        self.msg.write(buf);
        put_u32(buf, 24, self.msg_length);
        buf[28] = self.pulled_rdma_id;
        buf[29] = self.pulled_rdma_seqnum;
        put_u16(buf, 30, self.pulled_rdma_offset);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < RNDV_HDR_LEN {
            return None;
        }
        Some(PktRndv {
            msg: PktMsg::parse(buf)?,
            msg_length: get_u32(buf, 24),
            pulled_rdma_id: buf[28],
            pulled_rdma_seqnum: buf[29],
            pulled_rdma_offset: get_u16(buf, 30),
        })
    }
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Connect base header; the connect data follows it on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktConnect {
    pub ptype: u8,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    /// Length of the connect data following this header.
    pub length: u8,
    pub lib_seqnum: u16,
    /// The sender's index for *us* in its own table.
    pub src_dst_peer_index: u16,
}

impl PktConnect {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.dst_endpoint;
        buf[2] = self.src_endpoint;
        buf[3] = 0;
        buf[4] = self.length;
        buf[5..8].fill(0);
        put_u16(buf, 8, self.lib_seqnum);
        put_u16(buf, 10, self.src_dst_peer_index);
        buf[12..16].fill(0);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < CONNECT_HDR_LEN {
            return None;
        }
        Some(PktConnect {
            ptype: buf[0],
            dst_endpoint: buf[1],
            src_endpoint: buf[2],
            length: buf[4],
            lib_seqnum: get_u16(buf, 8),
            src_dst_peer_index: get_u16(buf, 10),
        })
    }
}

/// Connect data: request and reply share the layout; `is_reply`
/// discriminates and `target_session_id`/`app_key` overlay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectData {
    pub src_session_id: u32,
    /// `app_key` in requests, `target_session_id` in replies.
    pub app_key_or_target_session: u32,
    pub target_recv_seqnum_start: u16,
    pub connect_seqnum: u8,
    pub is_reply: bool,
    pub connect_status_code: u8,
}

impl ConnectData {
    pub fn write(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.src_session_id);
        put_u32(buf, 4, self.app_key_or_target_session);
        put_u16(buf, 8, self.target_recv_seqnum_start);
        buf[10] = self.connect_seqnum;
        buf[11] = self.is_reply as u8;
        buf[12] = self.connect_status_code;
        buf[13..16].fill(0);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < CONNECT_DATA_LEN {
            return None;
        }
        Some(ConnectData {
            src_session_id: get_u32(buf, 0),
            app_key_or_target_session: get_u32(buf, 4),
            target_recv_seqnum_start: get_u16(buf, 8),
            connect_seqnum: buf[10],
            is_reply: buf[11] != 0,
            connect_status_code: buf[12],
        })
    }
}

// ---------------------------------------------------------------------------
// Truc (LibAck)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktTruc {
    pub ptype: u8,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    /// Payload kind, [`TRUC_TYPE_ACK`] for library acks.
    pub truc_type: u8,
    /// Length of the payload following this header.
    pub length: u8,
    pub session: u32,
}

impl PktTruc {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.dst_endpoint;
        buf[2] = self.src_endpoint;
        buf[3] = 0;
        buf[4] = self.length;
        buf[5] = self.truc_type;
        buf[6..8].fill(0);
        put_u32(buf, 8, self.session);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < TRUC_HDR_LEN {
            return None;
        }
        Some(PktTruc {
            ptype: buf[0],
            dst_endpoint: buf[1],
            src_endpoint: buf[2],
            length: buf[4],
            truc_type: buf[5],
            session: get_u32(buf, 8),
        })
    }
}

/// LibAck payload carried by Truc packets.  It repeats the session id so
/// a stale ack can be told apart even when the truc header matched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LibAckData {
    pub session_id: u32,
    pub acknum: u32,
    pub lib_seqnum: u16,
    pub send_seq: u16,
    pub resent: bool,
}

impl LibAckData {
    pub fn write(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.session_id);
        put_u32(buf, 4, self.acknum);
        put_u16(buf, 8, self.lib_seqnum);
        put_u16(buf, 10, self.send_seq);
        buf[12] = self.resent as u8;
        buf[13..16].fill(0);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < LIBACK_DATA_LEN {
            return None;
        }
        Some(LibAckData {
            session_id: get_u32(buf, 0),
            acknum: get_u32(buf, 4),
            lib_seqnum: get_u16(buf, 8),
            send_seq: get_u16(buf, 10),
            resent: buf[12] != 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Pull request / reply
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktPullRequest {
    pub ptype: u8,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub session: u32,
    pub total_length: u32,
    pub pulled_rdma_id: u32,
    pub pulled_rdma_seqnum: u8,
    pub pulled_rdma_offset: u32,
    pub src_pull_handle: u32,
    pub src_magic: u32,
    pub first_frame_offset: u32,
    pub block_length: u32,
    pub frame_index: u32,
}

impl PktPullRequest {
    #[cfg(not(feature = "mx-wire-compat"))]
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.dst_endpoint;
        buf[2] = self.src_endpoint;
        buf[3] = 0;
        put_u32(buf, 4, self.session);
        put_u32(buf, 8, self.total_length);
        put_u32(buf, 12, self.pulled_rdma_id);
        buf[16] = self.pulled_rdma_seqnum;
        buf[17..20].fill(0);
        put_u32(buf, 20, self.pulled_rdma_offset);
        put_u32(buf, 24, self.src_pull_handle);
        put_u32(buf, 28, self.src_magic);
        put_u32(buf, 32, self.first_frame_offset);
        put_u32(buf, 36, self.block_length);
        put_u32(buf, 40, self.frame_index);
    }

    #[cfg(not(feature = "mx-wire-compat"))]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PULL_HDR_LEN {
            return None;
        }
        Some(PktPullRequest {
            ptype: buf[0],
            dst_endpoint: buf[1],
            src_endpoint: buf[2],
            session: get_u32(buf, 4),
            total_length: get_u32(buf, 8),
            pulled_rdma_id: get_u32(buf, 12),
            pulled_rdma_seqnum: buf[16],
            pulled_rdma_offset: get_u32(buf, 20),
            src_pull_handle: get_u32(buf, 24),
            src_magic: get_u32(buf, 28),
            first_frame_offset: get_u32(buf, 32),
            block_length: get_u32(buf, 36),
            frame_index: get_u32(buf, 40),
        })
    }

    #[cfg(feature = "mx-wire-compat")]
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.dst_endpoint;
        buf[2] = self.src_endpoint;
        buf[3] = 0;
        put_u32(buf, 4, self.session);
        put_u32(buf, 8, self.total_length);
        buf[12] = self.pulled_rdma_id as u8;
        buf[13] = self.pulled_rdma_seqnum;
        put_u16(buf, 14, self.pulled_rdma_offset as u16);
        put_u32(buf, 16, self.src_pull_handle);
        put_u32(buf, 20, self.src_magic);
        put_u16(buf, 24, self.first_frame_offset as u16);
        put_u16(buf, 26, self.block_length as u16);
        put_u32(buf, 28, self.frame_index);
    }

    #[cfg(feature = "mx-wire-compat")]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PULL_HDR_LEN {
            return None;
        }
        Some(PktPullRequest {
            ptype: buf[0],
            dst_endpoint: buf[1],
            src_endpoint: buf[2],
            session: get_u32(buf, 4),
            total_length: get_u32(buf, 8),
            pulled_rdma_id: buf[12] as u32,
            pulled_rdma_seqnum: buf[13],
            pulled_rdma_offset: get_u16(buf, 14) as u32,
            src_pull_handle: get_u32(buf, 16),
            src_magic: get_u32(buf, 20),
            first_frame_offset: get_u16(buf, 24) as u32,
            block_length: get_u16(buf, 26) as u32,
            frame_index: get_u32(buf, 28),
        })
    }

    /// Patch the per-block fields of an already encoded request header.
    pub fn patch_block_fields(
        buf: &mut [u8],
        block_length: u32,
        first_frame_offset: u32,
        frame_index: u32,
    ) {
        #[cfg(not(feature = "mx-wire-compat"))]
        {
            put_u32(buf, 32, first_frame_offset);
            put_u32(buf, 36, block_length);
            put_u32(buf, 40, frame_index);
        }
        #[cfg(feature = "mx-wire-compat")]
        {
            put_u16(buf, 24, first_frame_offset as u16);
            put_u16(buf, 26, block_length as u16);
            put_u32(buf, 28, frame_index);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktPullReply {
    pub ptype: u8,
    /// Sender's frame index + frame number within the block, modulo 256.
    pub frame_seqnum: u8,
    pub frame_length: u16,
    pub msg_offset: u32,
    pub dst_pull_handle: u32,
    pub dst_magic: u32,
}

impl PktPullReply {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.frame_seqnum;
        put_u16(buf, 2, self.frame_length);
        put_u32(buf, 4, self.msg_offset);
        put_u32(buf, 8, self.dst_pull_handle);
        put_u32(buf, 12, self.dst_magic);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < PULL_REPLY_HDR_LEN {
            return None;
        }
        Some(PktPullReply {
            ptype: buf[0],
            frame_seqnum: buf[1],
            frame_length: get_u16(buf, 2),
            msg_offset: get_u32(buf, 4),
            dst_pull_handle: get_u32(buf, 8),
            dst_magic: get_u32(buf, 12),
        })
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktNotify {
    pub ptype: u8,
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub session: u32,
    pub total_length: u32,
    pub puller_rdma_id: u8,
    pub puller_rdma_seqnum: u8,
    pub lib_seqnum: u16,
    pub lib_piggyack: u16,
}

impl PktNotify {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.dst_endpoint;
        buf[2] = self.src_endpoint;
        buf[3] = 0;
        put_u32(buf, 4, self.session);
        put_u32(buf, 8, self.total_length);
        buf[12] = self.puller_rdma_id;
        buf[13] = self.puller_rdma_seqnum;
        buf[14..18].fill(0);
        put_u16(buf, 18, self.lib_seqnum);
        put_u16(buf, 20, self.lib_piggyack);
        buf[22..24].fill(0);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < NOTIFY_HDR_LEN {
            return None;
        }
        Some(PktNotify {
            ptype: buf[0],
            dst_endpoint: buf[1],
            src_endpoint: buf[2],
            session: get_u32(buf, 4),
            total_length: get_u32(buf, 8),
            puller_rdma_id: buf[12],
            puller_rdma_seqnum: buf[13],
            lib_seqnum: get_u16(buf, 18),
            lib_piggyack: get_u16(buf, 20),
        })
    }
}

// ---------------------------------------------------------------------------
// Nacks
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktNackLib {
    pub ptype: u8,
    pub src_endpoint: u8,
    pub nack_type: u8,
    pub dst_endpoint: u8,
    /// The nacked sender's peer index, as seen from the nacker.
    pub dst_src_peer_index: u16,
    pub lib_seqnum: u16,
}

impl PktNackLib {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.src_endpoint;
        buf[2] = 0;
        buf[3] = self.nack_type;
        buf[4..9].fill(0);
        buf[9] = self.dst_endpoint;
        put_u16(buf, 10, self.dst_src_peer_index);
        put_u16(buf, 12, self.lib_seqnum);
        buf[14..16].fill(0);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < NACK_LIB_HDR_LEN {
            return None;
        }
        Some(PktNackLib {
            ptype: buf[0],
            src_endpoint: buf[1],
            nack_type: buf[3],
            dst_endpoint: buf[9],
            dst_src_peer_index: get_u16(buf, 10),
            lib_seqnum: get_u16(buf, 12),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PktNackMcp {
    pub ptype: u8,
    pub src_endpoint: u8,
    pub nack_type: u8,
    pub src_pull_handle: u32,
    pub src_magic: u32,
}

impl PktNackMcp {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.ptype;
        buf[1] = self.src_endpoint;
        buf[2] = 0;
        buf[3] = self.nack_type;
        buf[4..8].fill(0);
        put_u32(buf, 8, self.src_pull_handle);
        put_u32(buf, 12, self.src_magic);
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < NACK_MCP_HDR_LEN {
            return None;
        }
        Some(PktNackMcp {
            ptype: buf[0],
            src_endpoint: buf[1],
            nack_type: buf[3],
            src_pull_handle: get_u32(buf, 8),
            src_magic: get_u32(buf, 12),
        })
    }
}
