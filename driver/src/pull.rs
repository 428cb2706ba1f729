//! The pull engine: large-message RDMA-style reads with block-pipelined
//! retransmission.
//!
//! A pull retrieves `length` bytes from a remote region into a local
//! region.  The puller requests fixed-size blocks of
//! `PULL_REPLY_PER_BLOCK` reply frames, keeps up to
//! [`PULL_BLOCK_DESCS_NR`] blocks in flight, and tracks per-block frame
//! arrival in a bitmap.  The first block is shortened so that every reply
//! lands on a page boundary at the sink.
//!
//! # Retransmission
//!
//! One 1-second timer per handle.  Every reply reschedules it.  When it
//! fires it re-requests the first block and any later block with missing
//! frames; additionally, when a later block completes before the first,
//! the earlier blocks are optimistically re-requested — at most once per
//! timer period (`already_rerequested_blocks`).  The timer therefore only
//! fires when a frame was lost in every outstanding block, or in the
//! first block after one optimistic re-request, so one second is plenty.
//!
//! # Locking
//!
//! Each handle owns a lock protecting its progress state, its status and
//! its timer token; it is always taken *before* the endpoint's pull slot
//! lock.  Incoming replies look handles up through the slot array under
//! the read side only.  The wire never holds a handle's identity: it
//! carries the 32-bit slot id (10 bits of index, 22 bits of generation)
//! plus the endpoint magic, and a freed slot bumps its generation so
//! stale packets miss.
//!
//! # Close protocol
//!
//! Natural completion, a nack, and endpoint close all follow the same
//! sequence: status `Ok → TimerMustExit` under the handle lock with the
//! slot freed (no incoming packet can reference the handle anymore), then
//! a synchronous timer cancel.  Whoever loses the cancel race — the
//! canceller or the running timer handler — performs the `TimerMustExit →
//! TimerExited` transition, removes the handle from the endpoint list and
//! drops the timer's reference.  The handle is destroyed only after its
//! timer has definitively exited.

use std::sync::Arc;

use spin::{Mutex, RwLock};

use omx_abi::cmd;
use omx_abi::counters::Counter;
use omx_abi::events::{
    Event, EvtPullDone, EVT_PULL_DONE_ABORTED, EVT_PULL_DONE_SUCCESS, EVT_PULL_DONE_TIMEOUT,
};
use omx_lib::clock::msecs_to_jiffies;
use omx_lib::klog_debug;

use crate::endpoint::Endpoint;
use crate::events;
use crate::frame::FrameBuf;
use crate::iface::Iface;
use crate::region::{demand_pin_finish, fill_pages, OffsetCache, UserRegion};
use crate::send;
use crate::timer::{TimerEvent, TimerToken};
use crate::wire::{
    BlockFrameBitmask, NackType, PacketType, PktHead, PktPullReply, PktPullRequest,
    PKT_HEAD_LEN, PULL_BLOCK_LENGTH_MAX, PULL_HDR_LEN, PULL_REPLY_HDR_LEN,
    PULL_REPLY_LENGTH_MAX, PULL_REPLY_PER_BLOCK,
};
use crate::{Driver, OmxError};

/// Retransmission period.
pub const PULL_RETRANSMIT_TIMEOUT_MS: u64 = 1000;

pub(crate) fn retransmit_timeout_jiffies() -> u64 {
    msecs_to_jiffies(PULL_RETRANSMIT_TIMEOUT_MS)
}

/// Endpoint index XOR'ed into the wire-visible magic.
pub const ENDPOINT_PULL_MAGIC_XOR: u32 = 0x2107_1980;

/// Number of block descriptors kept in flight.
pub const PULL_BLOCK_DESCS_NR: usize = 4;

#[inline]
pub(crate) fn endpoint_pull_magic(endpoint_index: u8) -> u32 {
    endpoint_index as u32 ^ ENDPOINT_PULL_MAGIC_XOR
}

// ---------------------------------------------------------------------------
// Slot ids
// ---------------------------------------------------------------------------

const SLOT_INDEX_BITS: u32 = 10;
const SLOT_GENERATION_BITS: u32 = 32 - SLOT_INDEX_BITS;
/// Number of pull-handle slots per endpoint.
pub const PULL_HANDLE_SLOTS_NR: usize = 1 << SLOT_INDEX_BITS;
const SLOT_INDEX_MASK: u32 = ((PULL_HANDLE_SLOTS_NR - 1) as u32) << SLOT_GENERATION_BITS;
const SLOT_GENERATION_MASK: u32 = (1 << SLOT_GENERATION_BITS) - 1;
const SLOT_GENERATION_FIRST: u32 = 0x23;

const _: () = assert!(SLOT_INDEX_BITS + SLOT_GENERATION_BITS == 32);

/// Wire-visible pull handle identifier: slot index plus generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotId(u32);

impl SlotId {
    pub(crate) fn first(index: usize) -> Self {
        Self(((index as u32) << SLOT_GENERATION_BITS) | (SLOT_GENERATION_FIRST & SLOT_GENERATION_MASK))
    }

    #[inline]
    pub fn index(self) -> usize {
        (self.0 >> SLOT_GENERATION_BITS) as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.0 & SLOT_GENERATION_MASK
    }

    /// Bump the generation, keeping the index bits.
    pub(crate) fn next_generation(self) -> Self {
        Self((self.0 & SLOT_INDEX_MASK) | (self.0.wrapping_add(1) & SLOT_GENERATION_MASK))
    }

    #[inline]
    pub fn to_wire(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_wire(raw: u32) -> Self {
        Self(raw)
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle lifecycle; transitions are strictly monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullStatus {
    /// Processed as usual, timer running, reachable from the slot array.
    Ok,
    /// Removed from the slot array; the timer must exit on its next run
    /// (or a synchronous cancel kills it first).
    TimerMustExit,
    /// The timer has definitively exited and dropped its references.
    TimerExited,
}

/// One in-flight block of reply frames.
#[derive(Clone, Copy, Debug, Default)]
struct BlockDesc {
    frame_index: u32,
    block_length: u32,
    first_frame_offset: u32,
    /// One bit per frame not received yet.
    frames_missing_bitmap: BlockFrameBitmask,
}

struct PullInner {
    status: PullStatus,
    remaining_length: u32,
    /// Index of the first requested frame (mod 2^32; replies carry it
    /// mod 256).
    frame_index: u32,
    /// Index of the next frame to request.
    next_frame_index: u32,
    nr_requested_frames: u32,
    nr_missing_frames: u32,
    nr_valid_block_descs: usize,
    /// First blocks re-requested since the last timer, capping the
    /// optimistic re-request to once per period.
    already_rerequested_blocks: usize,
    block_desc: [BlockDesc; PULL_BLOCK_DESCS_NR],
    /// Frames received whose copy into the sink has not finished yet.
    host_copy_nr_frames: u32,
    timer_token: TimerToken,
    done_status: u8,
    /// Completion event already posted (exactly one per handle).
    notified: bool,
    /// Last DMA-offload cookie, when copies were offloaded.
    dma_last_cookie: Option<u64>,
}

/// One in-flight pull request.
pub struct PullHandle {
    slot_id: SlotId,
    endpoint: Arc<Endpoint>,
    region: Arc<UserRegion>,
    total_length: u32,
    pulled_rdma_offset: u32,
    /// Absolute deadline for the whole pull.
    last_retransmit_jiffies: u64,
    lib_cookie: u64,
    puller_rdma_id: u32,
    /// Prebuilt head + pull-request header; every (re)send clones it and
    /// patches the three per-block fields.
    cached_pkt_hdr: Vec<u8>,
    lock: Mutex<PullInner>,
}

impl PullHandle {
    pub fn status(&self) -> PullStatus {
        self.lock.lock().status
    }

    #[inline]
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }
}

impl core::fmt::Debug for PullHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.lock.lock();
        write!(
            f,
            "PullHandle(slot={:?}, total={}, remaining={}, missing={}, {:?})",
            self.slot_id,
            self.total_length,
            inner.remaining_length,
            inner.nr_missing_frames,
            inner.status
        )
    }
}

// ---------------------------------------------------------------------------
// Per-endpoint slot table
// ---------------------------------------------------------------------------

struct SlotEntry {
    handle: Option<Arc<PullHandle>>,
    id: SlotId,
}

struct PullSlots {
    slots: Vec<SlotEntry>,
    free_list: Vec<usize>,
    /// Every live handle, queued as long as its timer is running.
    list: Vec<Arc<PullHandle>>,
}

/// Per-endpoint pull state: the slot array and the handle list.
pub(crate) struct PullEndpointState {
    slots: RwLock<PullSlots>,
}

impl PullEndpointState {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(PULL_HANDLE_SLOTS_NR);
        let mut free_list = Vec::with_capacity(PULL_HANDLE_SLOTS_NR);
        for i in 0..PULL_HANDLE_SLOTS_NR {
            slots.push(SlotEntry {
                handle: None,
                id: SlotId::first(i),
            });
            free_list.push(i);
        }
        // Pop from the back: hand slots out in ascending index order.
        free_list.reverse();
        Self {
            slots: RwLock::new(PullSlots {
                slots,
                free_list,
                list: Vec::new(),
            }),
        }
    }

    /// Look a handle up from a wire id; full-id (generation) mismatch or
    /// an empty slot returns `None`.
    fn acquire_from_slot(&self, wire_id: u32) -> Option<Arc<PullHandle>> {
        let id = SlotId::from_wire(wire_id);
        let index = id.index();
        let slots = self.slots.read();
        let entry = slots.slots.get(index)?;
        if entry.id != id {
            klog_debug!(
                "pull slot {} has generation {} instead of {}",
                index,
                entry.id.generation(),
                id.generation()
            );
            return None;
        }
        entry.handle.clone()
    }

    /// First handle of the endpoint list, if any (close loop, tests).
    pub(crate) fn first_listed(&self) -> Option<Arc<PullHandle>> {
        self.slots.read().list.first().cloned()
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.slots.read().list.len()
    }
}

/// Free the handle's slot so no incoming packet can reference it, bumping
/// the generation.  Called with the handle lock held.
fn free_slot(endpoint: &Endpoint, handle: &PullHandle) {
    let mut slots = endpoint.pull.slots.write();
    let index = handle.slot_id.index();
    let entry = &mut slots.slots[index];
    entry.handle = None;
    entry.id = entry.id.next_generation();
    slots.free_list.push(index);
}

/// Drop the handle from the endpoint list (timer-exit transition).
fn remove_from_list(endpoint: &Endpoint, handle: &Arc<PullHandle>) {
    let mut slots = endpoint.pull.slots.write();
    slots.list.retain(|h| !Arc::ptr_eq(h, handle));
}

// ---------------------------------------------------------------------------
// Frame-bitmap bookkeeping
// ---------------------------------------------------------------------------

/// Frames needed to carry `first_frame_offset + block_length` bytes.
#[inline]
fn frames_of_block(block_length: u32, first_frame_offset: u32) -> u32 {
    (first_frame_offset + block_length).div_ceil(PULL_REPLY_LENGTH_MAX as u32)
}

/// Append one block descriptor covering the next `block_length` bytes.
fn append_needed_frames(inner: &mut PullInner, block_length: u32, first_frame_offset: u32) {
    let new_frames = frames_of_block(block_length, first_frame_offset);
    let new_mask: BlockFrameBitmask =
        (!0 as BlockFrameBitmask) >> (PULL_REPLY_PER_BLOCK as u32 - new_frames);

    let desc = &mut inner.block_desc[inner.nr_valid_block_descs];
    desc.frame_index = inner.next_frame_index;
    desc.block_length = block_length;
    desc.first_frame_offset = first_frame_offset;
    desc.frames_missing_bitmap = new_mask;

    inner.nr_requested_frames += new_frames;
    inner.nr_missing_frames += new_frames;
    inner.next_frame_index = inner.next_frame_index.wrapping_add(new_frames);
    inner.remaining_length -= block_length;
    inner.nr_valid_block_descs += 1;
}

/// Retire the completed first block and shift the descriptor ring.
fn first_block_done(inner: &mut PullInner) {
    let first_block_frames = inner
        .nr_requested_frames
        .min(PULL_REPLY_PER_BLOCK as u32);
    inner.frame_index = inner.frame_index.wrapping_add(first_block_frames);
    inner.nr_requested_frames -= first_block_frames;
    inner.nr_valid_block_descs -= 1;
    if inner.already_rerequested_blocks > 0 {
        inner.already_rerequested_blocks -= 1;
    }
    inner.block_desc.copy_within(1..PULL_BLOCK_DESCS_NR, 0);
    // Keep the invalid descriptors easy to check.
    inner.block_desc[PULL_BLOCK_DESCS_NR - 1].frames_missing_bitmap = 0;
}

// ---------------------------------------------------------------------------
// Request issuance
// ---------------------------------------------------------------------------

/// Build one block request from the cached header.  Called with the
/// handle lock held; the frame is sent after unlock.
fn fill_pull_block_request(
    driver: &Driver,
    handle: &PullHandle,
    desc: &BlockDesc,
) -> Result<FrameBuf, OmxError> {
    let iface = handle.endpoint.iface();
    let Some(mut frame) = FrameBuf::alloc(driver.pool()) else {
        iface.counters.inc(Counter::SendNomemFrame);
        return Err(OmxError::Nomem);
    };
    frame.append(&handle.cached_pkt_hdr)?;
    PktPullRequest::patch_block_fields(
        frame.linear_mut(PKT_HEAD_LEN, PULL_HDR_LEN),
        desc.block_length,
        desc.first_frame_offset,
        desc.frame_index,
    );
    frame.pad_to_min()?;
    Ok(frame)
}

fn send_request_frames(iface: &Iface, frames: Vec<FrameBuf>) {
    for frame in frames {
        if iface.tx(frame).is_ok() {
            iface.counters.inc(Counter::SendPullReq);
        }
    }
}

/// Create a pull handle and issue the initial block requests.
pub(crate) fn ioctl_pull(
    driver: &Driver,
    endpoint: &Arc<Endpoint>,
    cmd: &cmd::Pull,
) -> Result<(), OmxError> {
    let iface = endpoint.iface();
    if cmd.length == 0 {
        return Err(OmxError::Invalid);
    }
    if cmd.shared {
        iface.counters.inc(Counter::SharedPull);
    }

    // Acquire and pin the sink region.
    let region = endpoint
        .regions
        .acquire(cmd.puller_rdma_id)
        .ok_or(OmxError::Invalid)?;
    region.mark_dirty();
    if !driver.config.pin_synchronous {
        demand_pin_finish(&region, &driver.config)?;
    }
    if (cmd.length as u64) > region.total_length() {
        return Err(OmxError::Invalid);
    }

    // Prebuild the request header: everything but the per-block fields.
    let dst = driver
        .peers()
        .mac_of(cmd.peer_index)
        .ok_or(OmxError::Invalid)?;
    let own_index = driver
        .peers()
        .lookup_by_addr(iface.mac().to_u64())
        .map(|p| p.index as u16)
        .unwrap_or(u16::MAX);
    let head = PktHead {
        dst,
        src: iface.mac(),
        dst_src_peer_index: own_index,
    };

    // Allocate the slot and the handle together under the slot lock.
    let handle = {
        let mut slots = endpoint.pull.slots.write();
        let Some(index) = slots.free_list.pop() else {
            return Err(OmxError::Nomem);
        };
        let slot_id = slots.slots[index].id;

        let mut cached_pkt_hdr = vec![0u8; PKT_HEAD_LEN + PULL_HDR_LEN];
        head.write(&mut cached_pkt_hdr[..PKT_HEAD_LEN]);
        PktPullRequest {
            ptype: PacketType::Pull as u8,
            dst_endpoint: cmd.dest_endpoint,
            src_endpoint: endpoint.endpoint_index(),
            session: cmd.session_id,
            total_length: cmd.length,
            pulled_rdma_id: cmd.pulled_rdma_id,
            pulled_rdma_seqnum: cmd.pulled_rdma_seqnum as u8,
            pulled_rdma_offset: cmd.pulled_rdma_offset,
            src_pull_handle: slot_id.to_wire(),
            src_magic: endpoint_pull_magic(endpoint.endpoint_index()),
            first_frame_offset: 0,
            block_length: 0,
            frame_index: 0,
        }
        .write(&mut cached_pkt_hdr[PKT_HEAD_LEN..]);

        let handle = Arc::new(PullHandle {
            slot_id,
            endpoint: endpoint.clone(),
            region,
            total_length: cmd.length,
            pulled_rdma_offset: cmd.pulled_rdma_offset,
            last_retransmit_jiffies: driver.clock().now() + cmd.resend_timeout_jiffies as u64,
            lib_cookie: cmd.lib_cookie,
            puller_rdma_id: cmd.puller_rdma_id,
            cached_pkt_hdr,
            lock: Mutex::new(PullInner {
                status: PullStatus::Ok,
                remaining_length: cmd.length,
                frame_index: 0,
                next_frame_index: 0,
                nr_requested_frames: 0,
                nr_missing_frames: 0,
                nr_valid_block_descs: 0,
                already_rerequested_blocks: 0,
                block_desc: [BlockDesc::default(); PULL_BLOCK_DESCS_NR],
                host_copy_nr_frames: 0,
                timer_token: TimerToken::INVALID,
                done_status: EVT_PULL_DONE_SUCCESS,
                notified: false,
                dma_last_cookie: None,
            }),
        });
        slots.slots[index].handle = Some(handle.clone());
        slots.list.push(handle.clone());
        handle
    };

    // Prepare the first blocks: the first one is shortened so every reply
    // lands on a page boundary at the sink.
    let mut frames = Vec::with_capacity(PULL_BLOCK_DESCS_NR);
    {
        let mut inner = handle.lock.lock();
        let offset_in_frame = handle.pulled_rdma_offset % PULL_REPLY_LENGTH_MAX as u32;
        let block_length =
            (PULL_BLOCK_LENGTH_MAX as u32 - offset_in_frame).min(inner.remaining_length);
        append_needed_frames(&mut inner, block_length, offset_in_frame);

        while inner.nr_valid_block_descs < PULL_BLOCK_DESCS_NR && inner.remaining_length > 0 {
            let block_length = (PULL_BLOCK_LENGTH_MAX as u32).min(inner.remaining_length);
            append_needed_frames(&mut inner, block_length, 0);
        }

        for i in 0..inner.nr_valid_block_descs {
            match fill_pull_block_request(driver, &handle, &inner.block_desc[i]) {
                Ok(frame) => frames.push(frame),
                // Let the timer expire and resend.
                Err(_) => break,
            }
        }

        // Arm the retransmission timer; it owns a handle reference.
        inner.timer_token = driver.wheel().schedule_at(
            driver.clock().now() + retransmit_timeout_jiffies(),
            TimerEvent::PullRetransmit(handle.clone()),
        );
    }

    // Do not hold the handle lock while sending: the loopback device
    // reenters the receive path.
    send_request_frames(iface, frames);
    Ok(())
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Unhash the handle and record its completion status.  Called with the
/// handle lock held, status `Ok`.
fn mark_completed(endpoint: &Endpoint, handle: &PullHandle, inner: &mut PullInner, status: u8) {
    debug_assert_eq!(inner.status, PullStatus::Ok);
    inner.status = PullStatus::TimerMustExit;
    free_slot(endpoint, handle);
    inner.done_status = status;
}

/// Post the completion event, exactly once per handle.
fn notify(handle: &Arc<PullHandle>) {
    let (status, already) = {
        let mut inner = handle.lock.lock();
        let already = inner.notified;
        inner.notified = true;
        (inner.done_status, already)
    };
    if already {
        return;
    }
    let _ = events::notify_exp(
        &handle.endpoint,
        &Event::PullDone(EvtPullDone {
            lib_cookie: handle.lib_cookie,
            puller_rdma_id: handle.puller_rdma_id,
            status,
        }),
    );
}

/// Check whether every DMA-offloaded copy of this handle has landed;
/// `Again` means the caller must come back once the engine caught up.
fn wait_dma_completions(driver: &Driver, handle: &Arc<PullHandle>) -> Result<(), OmxError> {
    let pending_cookie = handle.lock.lock().dma_last_cookie;
    if let (Some(cookie), Some(engine)) = (pending_cookie, driver.config.dma.as_ref()) {
        if !engine.poll_done(cookie) {
            return Err(OmxError::Again);
        }
    }
    Ok(())
}

/// Notify completion, deferring while DMA-offloaded copies are still in
/// flight.
fn bh_notify(driver: &Driver, handle: &Arc<PullHandle>) {
    match wait_dma_completions(driver, handle) {
        Ok(()) => notify(handle),
        Err(_) => {
            handle
                .endpoint
                .iface()
                .counters
                .inc(Counter::DmaRecvPullReplyWaitDeferred);
            driver.defer_pull_notify(handle.clone());
        }
    }
}

/// Deferred-work path: retry a notify whose DMA copies were pending.
/// Returns `true` once the notify went out.
pub(crate) fn try_deferred_notify(driver: &Driver, handle: &Arc<PullHandle>) -> bool {
    if wait_dma_completions(driver, handle).is_err() {
        return false;
    }
    notify(handle);
    true
}

// ---------------------------------------------------------------------------
// Timer handler
// ---------------------------------------------------------------------------

/// Re-request the first block and any later block with missing frames.
/// Called with the handle lock held; unlocks before sending.
fn progress_pull_on_timeout_locked(
    driver: &Driver,
    handle: &Arc<PullHandle>,
    mut inner: spin::MutexGuard<'_, PullInner>,
) {
    let iface = handle.endpoint.iface();
    let mut frames = Vec::with_capacity(PULL_BLOCK_DESCS_NR);

    iface.counters.inc(Counter::PullTimeoutHandlerFirstBlock);
    match fill_pull_block_request(driver, handle, &inner.block_desc[0]) {
        Ok(frame) => {
            frames.push(frame);
            inner.already_rerequested_blocks = 0;
        }
        Err(_) => {}
    }

    // If the other blocks aren't done either, request them again,
    // otherwise the block pipeline would stay broken for ever.  This
    // means a packet was lost in each block, so it should stay rare.
    if !frames.is_empty() {
        for i in 1..PULL_BLOCK_DESCS_NR {
            if inner.block_desc[i].frames_missing_bitmap != 0 {
                iface
                    .counters
                    .inc(Counter::PullTimeoutHandlerNonFirstBlock);
                match fill_pull_block_request(driver, handle, &inner.block_desc[i]) {
                    Ok(frame) => frames.push(frame),
                    Err(_) => break,
                }
            }
        }
    }

    // Reschedule another period.
    inner.timer_token = driver.wheel().schedule_at(
        driver.clock().now() + retransmit_timeout_jiffies(),
        TimerEvent::PullRetransmit(handle.clone()),
    );

    drop(inner);
    send_request_frames(iface, frames);
}

/// Retransmission timer callback; the wheel entry owned a handle
/// reference, which the dispatcher drops when this returns.
pub(crate) fn pull_timeout_handler(driver: &Driver, handle: Arc<PullHandle>) {
    let endpoint = handle.endpoint.clone();
    let mut inner = handle.lock.lock();

    if inner.status != PullStatus::Ok {
        debug_assert_eq!(inner.status, PullStatus::TimerMustExit);
        inner.status = PullStatus::TimerExited;
        drop(inner);
        remove_from_list(&endpoint, &handle);
        return;
    }

    if driver.clock().time_after_eq(handle.last_retransmit_jiffies) {
        klog_debug!("pull handle {:?} total deadline reached", handle.slot_id);
        endpoint.iface().counters.inc(Counter::PullTimeoutAbort);
        mark_completed(&endpoint, &handle, &mut inner, EVT_PULL_DONE_TIMEOUT);
        inner.status = PullStatus::TimerExited;
        drop(inner);
        remove_from_list(&endpoint, &handle);
        bh_notify(driver, &handle);
        return;
    }

    debug_assert!(inner.block_desc[0].frames_missing_bitmap != 0);
    progress_pull_on_timeout_locked(driver, &handle, inner);
}

// ---------------------------------------------------------------------------
// Receiving pull requests (the replier side)
// ---------------------------------------------------------------------------

/// Serve a pull request: stream one block of replies out of the local
/// region.
pub(crate) fn recv_pull_request(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    iface.counters.inc(Counter::RecvPullReq);

    let Some(req) = PktPullRequest::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };

    if driver
        .peers()
        .check_recv_peer_index(head.dst_src_peer_index, head.src.to_u64())
        .is_err()
    {
        iface.counters.inc(Counter::DropBadPeerIndex);
        return;
    }

    let endpoint = match iface.acquire_endpoint(req.dst_endpoint) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            iface.counters.inc(Counter::DropBadEndpoint);
            send::send_nack_mcp(
                driver,
                iface,
                head.dst_src_peer_index,
                err.to_nack_type(),
                req.src_endpoint,
                req.src_pull_handle,
                req.src_magic,
            );
            return;
        }
    };

    if req.session != endpoint.session_id() {
        iface.counters.inc(Counter::DropBadSession);
        send::send_nack_mcp(
            driver,
            iface,
            head.dst_src_peer_index,
            NackType::BadSession,
            req.src_endpoint,
            req.src_pull_handle,
            req.src_magic,
        );
        return;
    }

    // Bound the number of replies one block may ask for.
    let replies = frames_of_block(req.block_length, req.first_frame_offset);
    if replies as usize > PULL_REPLY_PER_BLOCK {
        iface.counters.inc(Counter::DropPullBadReplies);
        return;
    }

    let Some(region) = endpoint.regions.acquire(req.pulled_rdma_id) else {
        iface.counters.inc(Counter::DropPullBadRegion);
        send::send_nack_mcp(
            driver,
            iface,
            head.dst_src_peer_index,
            NackType::BadRdmaWindow,
            req.src_endpoint,
            req.src_pull_handle,
            req.src_magic,
        );
        return;
    };
    if !driver.config.pin_synchronous && demand_pin_finish(&region, &driver.config).is_err() {
        iface.counters.inc(Counter::DropPullBadRegion);
        return;
    }

    // The msg offset hides the frames skipped before the pull beginning.
    let mut current_frame_seqnum = req.frame_index;
    let mut current_msg_offset = req
        .frame_index
        .wrapping_mul(PULL_REPLY_LENGTH_MAX as u32)
        .wrapping_sub(req.pulled_rdma_offset % PULL_REPLY_LENGTH_MAX as u32)
        .wrapping_add(req.first_frame_offset);
    let mut block_remaining_length = req.block_length;

    let mut cache = match OffsetCache::init(
        &region,
        current_msg_offset as u64 + req.pulled_rdma_offset as u64,
        req.block_length as u64,
    ) {
        Ok(cache) => cache,
        Err(_) => {
            iface.counters.inc(Counter::DropPullBadOffsetLength);
            // No nack for this; the wire protocol has no word for it.
            return;
        }
    };

    for i in 0..replies {
        let mut frame_length = if i == 0 {
            PULL_REPLY_LENGTH_MAX as u32 - req.first_frame_offset
        } else {
            PULL_REPLY_LENGTH_MAX as u32
        };
        frame_length = frame_length.min(block_remaining_length);

        let Some(mut frame) = FrameBuf::alloc(driver.pool()) else {
            iface.counters.inc(Counter::SendNomemFrame);
            return;
        };
        let build = (|| -> Result<(), OmxError> {
            let off = frame.append_zeroed(PKT_HEAD_LEN)?;
            PktHead {
                dst: head.src,
                src: iface.mac(),
                dst_src_peer_index: head.dst_src_peer_index,
            }
            .write(frame.linear_mut(off, PKT_HEAD_LEN));
            let off = frame.append_zeroed(PULL_REPLY_HDR_LEN)?;
            PktPullReply {
                ptype: PacketType::PullReply as u8,
                frame_seqnum: current_frame_seqnum as u8,
                frame_length: frame_length as u16,
                msg_offset: current_msg_offset,
                dst_pull_handle: req.src_pull_handle,
                dst_magic: req.src_magic,
            }
            .write(frame.linear_mut(off, PULL_REPLY_HDR_LEN));
            Ok(())
        })();
        if build.is_err() {
            return;
        }

        // Zero-copy page attachment with a linear fallback.
        let mut attached = false;
        if frame_length as usize > driver.config.copybreak && driver.config.frame_frags_max > 0 {
            if cache
                .append_to_frame(&mut frame, frame_length as usize, driver.config.frame_frags_max)
                .is_ok()
            {
                frame.hold_owner(region.clone());
                attached = true;
            }
        }
        if !attached {
            iface.counters.inc(Counter::PullReplySendLinear);
            let mut payload = vec![0u8; frame_length as usize];
            cache.copy_to_buf(&mut payload);
            if frame.append(&payload).is_err() {
                return;
            }
        }
        if frame.pad_to_min().is_err() {
            return;
        }

        if iface.tx(frame).is_ok() {
            iface.counters.inc(Counter::SendPullReply);
        }

        current_frame_seqnum = current_frame_seqnum.wrapping_add(1);
        current_msg_offset = current_msg_offset.wrapping_add(frame_length);
        block_remaining_length -= frame_length;
    }
}

// ---------------------------------------------------------------------------
// Receiving pull replies (the puller side)
// ---------------------------------------------------------------------------

/// Request more replies if necessary after a reply landed.  Consumes the
/// handle lock and sends with it released.
fn progress_pull_on_recv_reply_locked(
    driver: &Driver,
    handle: &Arc<PullHandle>,
    mut inner: spin::MutexGuard<'_, PullInner>,
    idesc: usize,
) {
    let iface = handle.endpoint.iface();
    let completed_block = inner.block_desc[idesc].frames_missing_bitmap == 0;
    let mut frames = Vec::new();

    if inner.block_desc[0].frames_missing_bitmap != 0 {
        // The first block is not done; maybe re-request earlier blocks
        // when a later one completed before them, at most once per timer
        // period.
        if completed_block && idesc > 0 && inner.already_rerequested_blocks < idesc {
            iface.counters.inc(Counter::PullNonFirstBlockDoneEarly);
            klog_debug!(
                "pull handle {:?}: block {} done before the first, re-requesting",
                handle.slot_id,
                idesc
            );
            for i in inner.already_rerequested_blocks..idesc {
                if inner.block_desc[i].frames_missing_bitmap != 0 {
                    match fill_pull_block_request(driver, handle, &inner.block_desc[i]) {
                        Ok(frame) => {
                            frames.push(frame);
                            inner.already_rerequested_blocks = i + 1;
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    } else {
        // The first block is done: slide the pipeline.
        first_block_done(&mut inner);
        while inner.nr_valid_block_descs > 0 && inner.block_desc[0].frames_missing_bitmap == 0 {
            first_block_done(&mut inner);
        }
        let first_new_block = inner.nr_valid_block_descs;

        while inner.nr_valid_block_descs < PULL_BLOCK_DESCS_NR && inner.remaining_length > 0 {
            let block_length = (PULL_BLOCK_LENGTH_MAX as u32).min(inner.remaining_length);
            append_needed_frames(&mut inner, block_length, 0);
        }

        if inner.nr_valid_block_descs.saturating_sub(first_new_block) > 1 {
            iface.counters.inc(Counter::PullRequestNotOnlyFirstBlocks);
        }

        for i in first_new_block..inner.nr_valid_block_descs {
            match fill_pull_block_request(driver, handle, &inner.block_desc[i]) {
                Ok(frame) => frames.push(frame),
                // Let the timeout expire and resend.
                Err(_) => break,
            }
        }
    }

    // Push the retransmission timer out by one period, unless the timer
    // handler is running right now (it re-arms itself).
    let token = inner.timer_token;
    if driver.wheel().cancel(token).is_some() {
        inner.timer_token = driver.wheel().schedule_at(
            driver.clock().now() + retransmit_timeout_jiffies(),
            TimerEvent::PullRetransmit(handle.clone()),
        );
    }

    drop(inner);
    send_request_frames(iface, frames);
}

/// Advance a pull handle with one received reply.
pub(crate) fn recv_pull_reply(driver: &Driver, iface: &Arc<Iface>, _head: &PktHead, body: &[u8]) {
    iface.counters.inc(Counter::RecvPullReply);

    let Some(reply) = PktPullReply::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };
    let payload = &body[PULL_REPLY_HDR_LEN..];
    let frame_length = reply.frame_length as u32;

    if payload.len() < frame_length as usize {
        iface.counters.inc(Counter::DropBadFrameLen);
        return;
    }

    // The magic carries the destination endpoint index.
    let endpoint_index = reply.dst_magic ^ ENDPOINT_PULL_MAGIC_XOR;
    if endpoint_index >= crate::wire::ENDPOINT_INDEX_MAX as u32 {
        iface.counters.inc(Counter::DropPullReplyBadMagicEndpoint);
        return;
    }
    let Ok(endpoint) = iface.acquire_endpoint(endpoint_index as u8) else {
        iface.counters.inc(Counter::DropPullReplyBadMagicEndpoint);
        return;
    };

    let Some(handle) = endpoint.pull.acquire_from_slot(reply.dst_pull_handle) else {
        iface.counters.inc(Counter::DropPullReplyBadWireHandle);
        return;
    };

    // No session to check: the slot generation and the magic are the
    // guard.
    let mut inner = handle.lock.lock();
    if inner.status != PullStatus::Ok {
        // The handle is being closed; forget about this packet.
        return;
    }

    // frame_seqnum is mod 256: compute the offset from the current first
    // requested frame, normalized into 0..256.
    let frame_seqnum_offset =
        (reply.frame_seqnum as u32).wrapping_sub(inner.frame_index % 256).wrapping_add(256) % 256;

    // The seqnum must agree with the message offset, or a 256-lap
    // wraparound corrupted the reply.
    if (reply.msg_offset as u64 + PULL_REPLY_LENGTH_MAX as u64 - 1)
        / PULL_REPLY_LENGTH_MAX as u64
        != inner.frame_index as u64 + frame_seqnum_offset as u64
    {
        iface
            .counters
            .inc(Counter::DropPullReplyBadSeqnumWrapAround);
        return;
    }

    // Out of the currently requested window.
    if frame_seqnum_offset >= inner.nr_requested_frames {
        iface.counters.inc(Counter::DropPullReplyBadSeqnum);
        return;
    }

    // Duplicate?
    let idesc = (frame_seqnum_offset as usize) / PULL_REPLY_PER_BLOCK;
    let bitmap_mask: BlockFrameBitmask =
        (1 as BlockFrameBitmask) << (frame_seqnum_offset as usize % PULL_REPLY_PER_BLOCK);
    if inner.block_desc[idesc].frames_missing_bitmap & bitmap_mask == 0 {
        iface.counters.inc(Counter::DropPullReplyDuplicate);
        return;
    }
    inner.block_desc[idesc].frames_missing_bitmap &= !bitmap_mask;
    inner.nr_missing_frames -= 1;

    // Try to offload the copy; the residual is ours to memcpy.
    let mut remaining_copy = frame_length;
    let mut copy_offset = 0u32;
    if let Some(engine) = driver.config.dma.as_ref() {
        if frame_length >= driver.config.dma_thresholds.async_frag_min
            && handle.total_length >= driver.config.dma_thresholds.async_min
        {
            if let Ok(mut cache) = OffsetCache::init(
                &handle.region,
                reply.msg_offset as u64,
                frame_length as u64,
            ) {
                let mut cookie = inner.dma_last_cookie;
                let residual = cache.dma_copy_from_buf(
                    engine.as_ref(),
                    &payload[..frame_length as usize],
                    &mut cookie,
                );
                inner.dma_last_cookie = cookie;
                if residual == 0 {
                    iface.counters.inc(Counter::DmaRecvPullReply);
                } else if residual < frame_length as usize {
                    iface.counters.inc(Counter::DmaRecvPartialPullReply);
                }
                copy_offset = frame_length - residual as u32;
                remaining_copy = residual as u32;
            }
        }
    }

    // Our copy is pending until the fill below completes.
    inner.host_copy_nr_frames += 1;

    // Request more replies if necessary; unlocks before sending.
    progress_pull_on_recv_reply_locked(driver, &handle, inner, idesc);

    if remaining_copy > 0 {
        let start = copy_offset as usize;
        let end = frame_length as usize;
        if fill_pages(
            &handle.region,
            reply.msg_offset as u64 + start as u64,
            &payload[start..end],
        )
        .is_err()
        {
            iface.counters.inc(Counter::PullReplyFillFailed);
            // The peer is sending garbage: close the handle and report it
            // truncated; whatever was transferred is not worth keeping.
            let mut inner = handle.lock.lock();
            if inner.status == PullStatus::Ok {
                mark_completed(&endpoint, &handle, &mut inner, EVT_PULL_DONE_ABORTED);
                drop(inner);
                bh_notify(driver, &handle);
            }
            return;
        }
    }

    // Take the lock back to check for completion.
    let mut inner = handle.lock.lock();
    inner.host_copy_nr_frames -= 1;
    if inner.status != PullStatus::Ok {
        // Closed while we were copying.
        return;
    }
    if inner.remaining_length == 0 && inner.nr_missing_frames == 0 && inner.host_copy_nr_frames == 0
    {
        klog_debug!("pull handle {:?} complete", handle.slot_id);
        mark_completed(&endpoint, &handle, &mut inner, EVT_PULL_DONE_SUCCESS);
        drop(inner);
        bh_notify(driver, &handle);
    }
}

// ---------------------------------------------------------------------------
// Receiving pull nacks
// ---------------------------------------------------------------------------

/// Complete the matching handle with the nack's status.
pub(crate) fn recv_nack_mcp(driver: &Driver, iface: &Arc<Iface>, head: &PktHead, body: &[u8]) {
    iface.counters.inc(Counter::RecvNackMcp);

    let Some(nack) = crate::wire::PktNackMcp::parse(body) else {
        iface.counters.inc(Counter::DropBadHeaderDatalen);
        return;
    };

    let mut peer_index = head.dst_src_peer_index;
    if driver
        .peers()
        .check_recv_peer_index(peer_index, head.src.to_u64())
        .is_err()
    {
        // A nack may come from a peer that does not know its own index
        // yet; fall back to an address lookup.
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
    let _ = peer_index;

    let endpoint_index = nack.src_magic ^ ENDPOINT_PULL_MAGIC_XOR;
    if endpoint_index >= crate::wire::ENDPOINT_INDEX_MAX as u32 {
        iface.counters.inc(Counter::DropNackMcpBadMagicEndpoint);
        return;
    }
    let Ok(endpoint) = iface.acquire_endpoint(endpoint_index as u8) else {
        iface.counters.inc(Counter::DropNackMcpBadMagicEndpoint);
        return;
    };

    let Some(handle) = endpoint.pull.acquire_from_slot(nack.src_pull_handle) else {
        iface.counters.inc(Counter::DropNackMcpBadWireHandle);
        return;
    };

    let mut inner = handle.lock.lock();
    if inner.status != PullStatus::Ok {
        // Duplicate nack for a closing handle: silent drop.
        return;
    }
    // Nack types and pull-done statuses coincide (build-asserted).
    mark_completed(&endpoint, &handle, &mut inner, nack.nack_type);
    drop(inner);
    bh_notify(driver, &handle);
}

// ---------------------------------------------------------------------------
// Endpoint close
// ---------------------------------------------------------------------------

/// Drain every pull handle of a closing endpoint.
///
/// Each handle still `Ok` is aborted (slot freed, completion event
/// posted); then its timer is cancelled synchronously.  If cancellation
/// loses the race, the running handler performs the exit transition and
/// this loop waits for it.
pub(crate) fn endpoint_pull_handles_exit(endpoint: &Endpoint) {
    let Some(driver) = endpoint.driver() else {
        return;
    };
    while let Some(handle) = endpoint.pull.first_listed() {
        let token = {
            let mut inner = handle.lock.lock();
            if inner.status == PullStatus::Ok {
                klog_debug!(
                    "(endpoint close) aborting pull handle {:?}",
                    handle.slot_id
                );
                mark_completed(endpoint, &handle, &mut inner, EVT_PULL_DONE_ABORTED);
            }
            inner.timer_token
        };

        match driver.wheel().cancel(token) {
            Some(_timer_ref) => {
                // We deactivated the timer: do its exit transition.
                let mut inner = handle.lock.lock();
                debug_assert_eq!(inner.status, PullStatus::TimerMustExit);
                inner.status = PullStatus::TimerExited;
                drop(inner);
                remove_from_list(endpoint, &handle);
                bh_notify(&driver, &handle);
                // The cancelled entry's reference drops here.
            }
            None => {
                // The timer fired meanwhile; wait until its handler has
                // exited and removed the handle from the list.
                while handle.status() != PullStatus::TimerExited {
                    core::hint::spin_loop();
                }
                bh_notify(&driver, &handle);
            }
        }
    }
}
