//! Per-interface counter indices.
//!
//! Counters are bumped on the data path with relaxed atomics; they are
//! statistics, not synchronization.  The enum is dense so an interface can
//! hold a flat array indexed by `Counter as usize`.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Counter {
    SendTiny = 0,
    SendSmall,
    SendMediumSqFrag,
    SendMediumVaFrag,
    SendRndv,
    SendNotify,
    SendConnectRequest,
    SendConnectReply,
    SendLibAck,
    SendNackLib,
    SendNackMcp,
    SendPullReq,
    SendPullReply,
    SendRaw,
    SendHostQuery,
    SendHostReply,

    RecvTiny,
    RecvSmall,
    RecvMediumFrag,
    RecvRndv,
    RecvNotify,
    RecvConnectRequest,
    RecvConnectReply,
    RecvLibAck,
    RecvNackLib,
    RecvNackMcp,
    RecvPullReq,
    RecvPullReply,
    RecvRaw,
    RecvHostQuery,
    RecvHostReply,

    DmaRecvMediumFrag,
    DmaRecvPartialMediumFrag,
    DmaRecvPullReply,
    DmaRecvPartialPullReply,
    DmaRecvPullReplyWaitDeferred,

    RecvNonLinearHeader,
    ExpEventqFull,
    UnexpEventqFull,
    SendNomemFrame,
    SendNomemMediumDefEvent,
    MediumSqFragSendLinear,
    PullNonFirstBlockDoneEarly,
    PullRequestNotOnlyFirstBlocks,
    PullTimeoutHandlerFirstBlock,
    PullTimeoutHandlerNonFirstBlock,
    PullTimeoutAbort,
    PullReplySendLinear,
    PullReplyFillFailed,

    DropBadHeaderDatalen,
    DropBadDatalen,
    DropBadFrameLen,
    DropBadPeerAddr,
    DropBadPeerIndex,
    DropBadEndpoint,
    DropBadSession,
    DropPullBadReplies,
    DropPullBadRegion,
    DropPullBadOffsetLength,
    DropPullReplyBadMagicEndpoint,
    DropPullReplyBadWireHandle,
    DropPullReplyBadSeqnumWrapAround,
    DropPullReplyBadSeqnum,
    DropPullReplyDuplicate,
    DropNackMcpBadMagicEndpoint,
    DropNackMcpBadWireHandle,
    DropHostReplyBadMagic,
    DropRawQueueFull,
    DropRawTooLarge,
    DropNosysType,
    DropInvalidType,
    DropUnknownType,

    SharedTiny,
    SharedSmall,
    SharedMediumSqFrag,
    SharedMediumVa,
    SharedRndv,
    SharedNotify,
    SharedConnectRequest,
    SharedConnectReply,
    SharedLibAck,
    SharedPull,

    SharedDmaMediumFrag,
    SharedDmaLarge,
    SharedDmaPartialLarge,
}

/// Number of counters, i.e. the length of a per-interface counter array.
pub const COUNTER_INDEX_MAX: usize = Counter::SharedDmaPartialLarge as usize + 1;

impl Counter {
    /// Human-readable counter name, for the counters display.
    pub fn name(self) -> &'static str {
        match self {
            Counter::SendTiny => "Send Tiny",
            Counter::SendSmall => "Send Small",
            Counter::SendMediumSqFrag => "Send MediumSQ Frag",
            Counter::SendMediumVaFrag => "Send MediumVA Frag",
            Counter::SendRndv => "Send Rndv",
            Counter::SendNotify => "Send Notify",
            Counter::SendConnectRequest => "Send Connect Request",
            Counter::SendConnectReply => "Send Connect Reply",
            Counter::SendLibAck => "Send LibAck",
            Counter::SendNackLib => "Send Nack Lib",
            Counter::SendNackMcp => "Send Nack MCP",
            Counter::SendPullReq => "Send Pull Request",
            Counter::SendPullReply => "Send Pull Reply",
            Counter::SendRaw => "Send Raw",
            Counter::SendHostQuery => "Send Host Query",
            Counter::SendHostReply => "Send Host Reply",
            Counter::RecvTiny => "Recv Tiny",
            Counter::RecvSmall => "Recv Small",
            Counter::RecvMediumFrag => "Recv Medium Frag",
            Counter::RecvRndv => "Recv Rndv",
            Counter::RecvNotify => "Recv Notify",
            Counter::RecvConnectRequest => "Recv Connect Request",
            Counter::RecvConnectReply => "Recv Connect Reply",
            Counter::RecvLibAck => "Recv LibAck",
            Counter::RecvNackLib => "Recv Nack Lib",
            Counter::RecvNackMcp => "Recv Nack MCP",
            Counter::RecvPullReq => "Recv Pull Request",
            Counter::RecvPullReply => "Recv Pull Reply",
            Counter::RecvRaw => "Recv Raw",
            Counter::RecvHostQuery => "Recv Host Query",
            Counter::RecvHostReply => "Recv Host Reply",
            Counter::DmaRecvMediumFrag => "DMA Recv Medium Frag",
            Counter::DmaRecvPartialMediumFrag => "DMA Recv Medium Frag Only Partial",
            Counter::DmaRecvPullReply => "DMA Recv Pull Reply",
            Counter::DmaRecvPartialPullReply => "DMA Recv Pull Reply Only Partial",
            Counter::DmaRecvPullReplyWaitDeferred => "DMA Recv Pull Reply with Deferred Wait",
            Counter::RecvNonLinearHeader => "Recv Header as Non-Linear",
            Counter::ExpEventqFull => "Expected Event Queue Full",
            Counter::UnexpEventqFull => "Unexpected Event Queue Full",
            Counter::SendNomemFrame => "Send Frame Alloc Failed",
            Counter::SendNomemMediumDefEvent => "Send Medium Deferred Event Alloc Failed",
            Counter::MediumSqFragSendLinear => "MediumSQ Frag Sent as Linear",
            Counter::PullNonFirstBlockDoneEarly => "Pull Non-First Block Done before First One",
            Counter::PullRequestNotOnlyFirstBlocks => {
                "Pull Request for Not Only the First Block at Once"
            }
            Counter::PullTimeoutHandlerFirstBlock => "Pull Timeout Handler Requests First Block",
            Counter::PullTimeoutHandlerNonFirstBlock => {
                "Pull Timeout Handler Requests Non-First Block"
            }
            Counter::PullTimeoutAbort => "Pull Timeout Abort",
            Counter::PullReplySendLinear => "Pull Reply Sent as Linear",
            Counter::PullReplyFillFailed => "Pull Reply Recv Fill Pages Failed",
            Counter::DropBadHeaderDatalen => "Drop Bad Data Length for Headers",
            Counter::DropBadDatalen => "Drop Bad Data Length",
            Counter::DropBadFrameLen => "Drop Bad Frame Length",
            Counter::DropBadPeerAddr => "Drop Bad Peer Addr",
            Counter::DropBadPeerIndex => "Drop Bad Peer Index",
            Counter::DropBadEndpoint => "Drop Bad Endpoint",
            Counter::DropBadSession => "Drop Bad Session",
            Counter::DropPullBadReplies => "Drop Pull Bad Number of Replies",
            Counter::DropPullBadRegion => "Drop Pull Bad Region",
            Counter::DropPullBadOffsetLength => "Drop Pull Bad Offset or Length",
            Counter::DropPullReplyBadMagicEndpoint => "Drop Pull Reply Bad Endpoint in Magic",
            Counter::DropPullReplyBadWireHandle => "Drop Pull Reply Bad Wire Handle",
            Counter::DropPullReplyBadSeqnumWrapAround => {
                "Drop Pull Reply Bad Frame SeqNum WrapAround"
            }
            Counter::DropPullReplyBadSeqnum => "Drop Pull Reply Bad Frame SeqNum",
            Counter::DropPullReplyDuplicate => "Drop Pull Reply Duplicate",
            Counter::DropNackMcpBadMagicEndpoint => "Drop Nack MCP Bad Endpoint in Magic",
            Counter::DropNackMcpBadWireHandle => "Drop Nack MCP Bad Wire Handle",
            Counter::DropHostReplyBadMagic => "Drop Host Reply with Bad Magic",
            Counter::DropRawQueueFull => "Drop Raw Queue Full",
            Counter::DropRawTooLarge => "Drop Raw Packet Too Large",
            Counter::DropNosysType => "Drop Not Implemented Packet Type",
            Counter::DropInvalidType => "Drop Invalid Packet Type",
            Counter::DropUnknownType => "Drop Unknown Packet Type",
            Counter::SharedTiny => "Shared Tiny",
            Counter::SharedSmall => "Shared Small",
            Counter::SharedMediumSqFrag => "Shared MediumSQ Frag",
            Counter::SharedMediumVa => "Shared MediumVA",
            Counter::SharedRndv => "Shared Rndv",
            Counter::SharedNotify => "Shared Notify",
            Counter::SharedConnectRequest => "Shared Connect Request",
            Counter::SharedConnectReply => "Shared Connect Reply",
            Counter::SharedLibAck => "Shared LibAck",
            Counter::SharedPull => "Shared Pull",
            Counter::SharedDmaMediumFrag => "DMA Shared Medium Frag",
            Counter::SharedDmaLarge => "DMA Shared Large",
            Counter::SharedDmaPartialLarge => "DMA Shared Large only Partial",
        }
    }
}
