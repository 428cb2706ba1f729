//! Command parameter blocks of the control surface.
//!
//! One struct per operation, mirroring what the library passes through the
//! character device.  Fields common to all non-connect sends: destination
//! peer index and endpoint, the session id to be matched at the receiver, a
//! 16-bit library seqnum and a 16-bit piggybacked ack.  The `shared` flag
//! selects the same-host fast path; it shares the encoding but not the wire.

use bitflags::bitflags;

/// One user segment of a region or a MediumVA source vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserSegment {
    pub vaddr: u64,
    pub len: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct OpenEndpoint {
    pub board_index: u8,
    pub endpoint_index: u8,
}

#[derive(Clone, Copy, Debug)]
pub struct SendTiny {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared: bool,
    pub session_id: u32,
    pub seqnum: u16,
    pub piggyack: u16,
    pub length: u8,
    pub checksum: u16,
    pub match_info: u64,
    pub data: [u8; crate::TINY_MSG_LENGTH_MAX],
}

#[derive(Clone, Copy, Debug)]
pub struct SendSmall {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared: bool,
    pub session_id: u32,
    pub seqnum: u16,
    pub piggyack: u16,
    pub length: u16,
    pub checksum: u16,
    /// User virtual address of the payload.
    pub vaddr: u64,
    pub match_info: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct SendMediumSqFrag {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared: bool,
    pub session_id: u32,
    pub seqnum: u16,
    pub piggyack: u16,
    /// Byte offset of the source slot within the sendq.
    pub sendq_offset: u32,
    pub checksum: u16,
    pub msg_length: u32,
    pub frag_length: u16,
    pub frag_seqnum: u8,
    pub frag_pipeline: u8,
    pub match_info: u64,
}

#[derive(Clone, Debug)]
pub struct SendMediumVa {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared: bool,
    pub session_id: u32,
    pub seqnum: u16,
    pub piggyack: u16,
    pub length: u32,
    pub checksum: u16,
    pub segments: Vec<UserSegment>,
    pub match_info: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct SendRndv {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared: bool,
    pub session_id: u32,
    pub seqnum: u16,
    pub piggyack: u16,
    pub match_info: u64,
    pub msg_length: u32,
    pub pulled_rdma_id: u8,
    pub pulled_rdma_seqnum: u8,
    pub checksum: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct SendConnectRequest {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared_disabled: bool,
    pub seqnum: u16,
    pub src_session_id: u32,
    pub app_key: u32,
    pub target_recv_seqnum_start: u16,
    pub connect_seqnum: u8,
}

#[derive(Clone, Copy, Debug)]
pub struct SendConnectReply {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared_disabled: bool,
    pub seqnum: u16,
    pub src_session_id: u32,
    pub target_session_id: u32,
    pub target_recv_seqnum_start: u16,
    pub connect_seqnum: u8,
    pub connect_status_code: u8,
}

#[derive(Clone, Copy, Debug)]
pub struct Pull {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared: bool,
    pub session_id: u32,
    /// Total number of bytes to pull.
    pub length: u32,
    /// Absolute deadline budget for the whole pull, in jiffies from now.
    pub resend_timeout_jiffies: u32,
    /// Local (sink) region id.
    pub puller_rdma_id: u32,
    /// Bytes to skip at the source before the first useful byte.
    pub pulled_rdma_offset: u32,
    /// Remote (source) region id.
    pub pulled_rdma_id: u32,
    pub pulled_rdma_seqnum: u32,
    /// Opaque cookie echoed in the completion event.
    pub lib_cookie: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct SendNotify {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared: bool,
    pub session_id: u32,
    pub total_length: u32,
    pub seqnum: u16,
    pub piggyack: u16,
    pub pulled_rdma_id: u8,
    pub pulled_rdma_seqnum: u8,
}

#[derive(Clone, Copy, Debug)]
pub struct SendLibAck {
    pub peer_index: u16,
    pub dest_endpoint: u8,
    pub shared: bool,
    pub session_id: u32,
    pub acknum: u32,
    pub lib_seqnum: u16,
    pub send_seq: u16,
    pub resent: bool,
}

#[derive(Clone, Debug)]
pub struct CreateUserRegion {
    pub id: u32,
    pub seqnum: u32,
    pub segments: Vec<UserSegment>,
}

#[derive(Clone, Copy, Debug)]
pub struct DestroyUserRegion {
    pub id: u32,
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Absolute-jiffies deadline meaning "no deadline".
pub const WAIT_EVENT_TIMEOUT_INFINITE: u64 = u64::MAX;

/// `wakeup_jiffies` descriptor value meaning "no progress wakeup requested".
pub const NO_WAKEUP_JIFFIES: u64 = 0;

/// Status of a completed wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitStatus {
    /// Nothing happened; never reported to user space.
    None = 0x00,
    /// An event arrived.
    Event = 0x01,
    /// Interrupted by a signal without any event.
    Intr = 0x02,
    /// Woken to let the library poll retransmission progress.
    Progress = 0x03,
    /// The deadline expired without any event.
    Timeout = 0x04,
    /// Some events arrived in the meantime; go back and check them first.
    Race = 0x05,
    /// The application called the wakeup operation.
    Wakeup = 0x06,
}

impl WaitStatus {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => Self::None,
            0x01 => Self::Event,
            0x02 => Self::Intr,
            0x03 => Self::Progress,
            0x04 => Self::Timeout,
            0x05 => Self::Race,
            0x06 => Self::Wakeup,
            _ => return None,
        })
    }
}

/// Snapshot of the waiter's view of the queues, checked against the
/// driver's indices before sleeping.
#[derive(Clone, Copy, Debug)]
pub struct WaitEvent {
    pub user_event_index: u32,
    pub next_exp_event_index: u32,
    pub next_unexp_event_index: u32,
    /// Absolute jiffies deadline, or [`WAIT_EVENT_TIMEOUT_INFINITE`].
    pub jiffies_expire: u64,
}

// ---------------------------------------------------------------------------
// Board / endpoint information
// ---------------------------------------------------------------------------

bitflags! {
    /// Status bits reported with board information.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BoardInfoStatus: u32 {
        const DOWN = 1 << 0;
        const BAD_MTU = 1 << 1;
        const HIGH_INTRCOAL = 1 << 2;
    }
}

impl Default for BoardInfoStatus {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BoardInfo {
    pub addr: u64,
    pub mtu: u32,
    pub numa_node: u32,
    pub status: BoardInfoStatus,
    pub hostname: String,
    pub ifacename: String,
    pub drivername: String,
}

#[derive(Clone, Debug, Default)]
pub struct EndpointInfo {
    pub closed: bool,
    pub pid: u32,
    pub command: String,
}

// ---------------------------------------------------------------------------
// Peer table
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct PeerInfo {
    pub board_addr: u64,
    pub hostname: Option<String>,
    pub index: u32,
}

bitflags! {
    /// Status bits of the peer table.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PeerTableStatus: u32 {
        const CONFIGURED = 1 << 0;
        const FULL = 1 << 1;
        /// Bits that the set-state operation may change.
        const SETMASK = Self::CONFIGURED.bits();
    }
}

impl Default for PeerTableStatus {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PeerTableState {
    pub status: PeerTableStatus,
    pub version: u32,
    pub size: u32,
    pub mapper_id: u64,
}
