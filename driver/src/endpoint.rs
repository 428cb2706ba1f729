//! Endpoints: the unit of addressability for a user process.
//!
//! An endpoint owns the user-mapped rings (sendq, recvq, the two event
//! queues), the shared endpoint descriptor, the user-region table and the
//! pull-handle state.  Its lifecycle is `Initializing → Ok → Closing`
//! under the status lock; an empty interface slot stands for `Free`.
//! Incoming packets can only reach an endpoint whose status is `Ok`.
//!
//! Destruction happens at the last reference drop, which by construction
//! is after close has drained the pull handles (each live handle and each
//! pending timer holds a reference).

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use spin::Mutex;

use omx_abi::cmd::EndpointInfo;
use omx_abi::desc::EndpointDesc;
use omx_abi::events::Event;
use omx_abi::{RECVQ_ENTRY_NR, RECVQ_ENTRY_SIZE, SENDQ_ENTRY_NR, SENDQ_ENTRY_SIZE};

use omx_lib::klog_debug;
use omx_mm::{UnmapListener, UserVm};

use crate::events::EndpointEvents;
use crate::iface::Iface;
use crate::pull::PullEndpointState;
use crate::region::RegionTable;
use crate::{Driver, OmxError};

// ---------------------------------------------------------------------------
// Queue memory
// ---------------------------------------------------------------------------

// Sendq and recvq entries are exactly one page, so the rings are plain
// page arrays and receive-side DMA offload can target a ring slot the
// same way it targets a pinned region page.
const _: () = assert!(SENDQ_ENTRY_SIZE as usize == omx_mm::PAGE_SIZE);
const _: () = assert!(RECVQ_ENTRY_SIZE as usize == omx_mm::PAGE_SIZE);

/// Page-aligned fixed-slot ring mapped into user space (sendq or recvq).
pub(crate) struct QueueMem {
    pages: Box<[Arc<omx_mm::PageFrame>]>,
    entry_size: u32,
}

impl QueueMem {
    fn new(entries: u32, entry_size: u32) -> Self {
        let mut pages = Vec::with_capacity(entries as usize);
        pages.resize_with(entries as usize, || Arc::new(omx_mm::PageFrame::new()));
        Self {
            pages: pages.into_boxed_slice(),
            entry_size,
        }
    }

    fn locate(&self, offset: u32, len: usize) -> (usize, usize) {
        let slot = (offset / self.entry_size) as usize;
        let within = (offset % self.entry_size) as usize;
        assert!(slot < self.pages.len(), "queue offset out of range");
        assert!(
            within + len <= self.entry_size as usize,
            "queue access crosses a slot boundary"
        );
        (slot, within)
    }

    /// The page backing the slot at byte `offset`.
    pub(crate) fn page_at(&self, offset: u32) -> &Arc<omx_mm::PageFrame> {
        let (slot, _) = self.locate(offset, 0);
        &self.pages[slot]
    }

    /// Copy `src` into the queue at byte `offset` (within one slot).
    pub(crate) fn write(&self, offset: u32, src: &[u8]) {
        let (slot, within) = self.locate(offset, src.len());
        self.pages[slot].write(within, src);
    }

    /// Copy `dst.len()` bytes out of the queue at byte `offset`.
    pub(crate) fn read(&self, offset: u32, dst: &mut [u8]) {
        let (slot, within) = self.locate(offset, dst.len());
        self.pages[slot].read(within, dst);
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Endpoint lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointStatus {
    /// Slot is free and may be opened.
    Free,
    /// Being opened; not yet reachable from the wire.
    Initializing,
    /// Ready; reachable from the wire.
    Ok,
    /// Being closed; packets are nacked `EndpointClosed`.
    Closing,
}

/// A (board, index) addressable endpoint.
pub struct Endpoint {
    board_index: u8,
    endpoint_index: u8,
    session_id: u32,
    opener_pid: u32,
    opener_command: String,

    iface: Arc<Iface>,
    driver: Weak<Driver>,
    vm: Arc<UserVm>,

    status: Mutex<EndpointStatus>,
    desc: Arc<EndpointDesc>,

    pub(crate) sendq: QueueMem,
    pub(crate) recvq: QueueMem,
    pub(crate) events: EndpointEvents,
    pub(crate) regions: RegionTable,
    pub(crate) pull: PullEndpointState,

    invalidator: Mutex<Option<Arc<RegionInvalidator>>>,
}

impl Endpoint {
    pub(crate) fn new(
        board_index: u8,
        endpoint_index: u8,
        session_id: u32,
        iface: Arc<Iface>,
        driver: Weak<Driver>,
        vm: Arc<UserVm>,
        opener_pid: u32,
        opener_command: String,
    ) -> Arc<Self> {
        let desc = Arc::new(EndpointDesc::default());
        desc.session_id.store(session_id, Ordering::Relaxed);
        Arc::new(Self {
            board_index,
            endpoint_index,
            session_id,
            opener_pid,
            opener_command,
            iface,
            driver,
            vm,
            status: Mutex::new(EndpointStatus::Initializing),
            desc,
            sendq: QueueMem::new(SENDQ_ENTRY_NR, SENDQ_ENTRY_SIZE),
            recvq: QueueMem::new(RECVQ_ENTRY_NR, RECVQ_ENTRY_SIZE),
            events: EndpointEvents::new(),
            regions: RegionTable::new(),
            pull: PullEndpointState::new(),
            invalidator: Mutex::new(None),
        })
    }

    #[inline]
    pub fn board_index(&self) -> u8 {
        self.board_index
    }

    #[inline]
    pub fn endpoint_index(&self) -> u8 {
        self.endpoint_index
    }

    #[inline]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    #[inline]
    pub fn iface(&self) -> &Arc<Iface> {
        &self.iface
    }

    #[inline]
    pub(crate) fn driver(&self) -> Option<Arc<Driver>> {
        self.driver.upgrade()
    }

    #[inline]
    pub fn vm(&self) -> &Arc<UserVm> {
        &self.vm
    }

    /// The user-mapped endpoint descriptor.
    #[inline]
    pub fn desc(&self) -> &Arc<EndpointDesc> {
        &self.desc
    }

    pub fn status(&self) -> EndpointStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status_ok(&self) {
        *self.status.lock() = EndpointStatus::Ok;
    }

    pub fn endpoint_info(&self) -> EndpointInfo {
        EndpointInfo {
            closed: self.status() == EndpointStatus::Closing,
            pid: self.opener_pid,
            command: self.opener_command.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Close the endpoint.
    ///
    /// Safe to call concurrently: the first caller transitions `Ok →
    /// Closing` and does the teardown, later callers observe `Closing` and
    /// return success immediately.
    pub fn close(&self) -> Result<(), OmxError> {
        {
            let mut status = self.status.lock();
            match *status {
                EndpointStatus::Closing => return Ok(()),
                EndpointStatus::Ok => *status = EndpointStatus::Closing,
                _ => return Err(OmxError::Invalid),
            }
        }

        klog_debug!(
            "closing endpoint {}:{}",
            self.board_index,
            self.endpoint_index
        );

        // Wake all waiters; the library sees Wakeup and stops waiting.
        crate::events::wakeup(self, omx_abi::cmd::WaitStatus::Wakeup);

        // Quiesce the pull engine: every handle reaches TimerExited and a
        // completion event is posted for the user.
        crate::pull::endpoint_pull_handles_exit(self);

        // Drop the user-region table entries; pinned pages go away with
        // the last reference on each region.
        self.regions.clear();

        // Unreachable from the wire and from the control plane now.
        self.iface.detach_endpoint(self.endpoint_index);

        *self.invalidator.lock() = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // User-side views (the mmap'ed surfaces)
    // -----------------------------------------------------------------------

    /// User view: write a sendq slot before issuing a MediumSQ send.
    pub fn user_sendq_write(&self, offset: u32, data: &[u8]) {
        self.sendq.write(offset, data);
    }

    /// User view: read a recvq slot after consuming its event.
    pub fn user_recvq_read(&self, offset: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.recvq.read(offset, &mut buf);
        buf
    }

    /// User view: read the expected event at ring index `index`.
    ///
    /// `None` until the record's id byte shows it fully written.
    pub fn user_read_exp_event(&self, index: u32) -> Option<Event> {
        self.events.user_read_exp(index)
    }

    /// User view: read the unexpected event at ring index `index`.
    pub fn user_read_unexp_event(&self, index: u32) -> Option<Event> {
        self.events.user_read_unexp(index)
    }

    /// User view: account one consumed event (part of the wait-event race
    /// check).
    pub fn user_consume_event(&self) {
        self.desc.user_event_index.fetch_add(1, Ordering::Relaxed);
    }

    /// User view: request a progress wakeup at `jiffies`.
    pub fn user_set_wakeup_jiffies(&self, jiffies: u64) {
        self.desc.wakeup_jiffies.store(jiffies, Ordering::Relaxed);
    }

    /// Number of tasks currently blocked in a wait (diagnostic).
    pub fn waiter_count(&self) -> usize {
        self.events.waiters.waiter_count()
    }
}

impl core::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Endpoint({}:{}, session={:#x}, {:?})",
            self.board_index,
            self.endpoint_index,
            self.session_id,
            self.status()
        )
    }
}

/// Unmap listener quiescing the regions that intersect an unmapped range.
pub(crate) struct RegionInvalidator {
    endpoint: Weak<Endpoint>,
}

impl UnmapListener for RegionInvalidator {
    fn invalidate_range(&self, start: u64, end: u64) {
        let Some(endpoint) = self.endpoint.upgrade() else {
            return;
        };
        let Some(driver) = endpoint.driver() else {
            return;
        };
        crate::region::invalidate_endpoint_regions(&endpoint, &driver.config, start, end);
    }
}

/// Register a region invalidator with the endpoint opener's address
/// space (the MMU-notifier role).
pub(crate) fn register_invalidator(endpoint: &Arc<Endpoint>, pin_invalidate: bool) {
    if !pin_invalidate {
        return;
    }
    let inv = Arc::new(RegionInvalidator {
        endpoint: Arc::downgrade(endpoint),
    });
    let inv_dyn: Arc<dyn UnmapListener> = inv.clone();
    let listener: Weak<dyn UnmapListener> = Arc::downgrade(&inv_dyn);
    endpoint.vm.register_unmap_listener(listener);
    *endpoint.invalidator.lock() = Some(inv);
}
