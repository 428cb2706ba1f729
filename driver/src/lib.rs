//! Reliable per-endpoint messaging engine over raw Ethernet.
//!
//! The driver exposes endpoints to user processes through user-mapped
//! rings and event queues, classifies incoming frames into per-type
//! receive paths, serves large transfers through the pull engine, and
//! pins user memory into regions that feed the transmit path or absorb
//! received payload.
//!
//! A [`Driver`] owns the board table, the peer table, the frame pool,
//! the timer wheel, the deferred-work queue and the jiffies clock.  Its
//! public methods are the control surface the character device would
//! demultiplex into; [`Driver::recv`] is the entry point NICs deliver
//! frames to, and [`Driver::timer_process`] is the soft-timer
//! integration point the host environment calls after advancing the
//! clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use spin::{Mutex, RwLock};

use omx_abi::cmd::{self, WaitEvent, WaitStatus};
use omx_abi::desc::{DriverDesc, DriverFeatures};
use omx_abi::{ABI_CONFIG_WIRECOMPAT, DRIVER_ABI_VERSION};

use omx_lib::clock::HZ;
use omx_lib::JiffiesClock;
use omx_mm::UserVm;

pub mod counters;
pub mod dma;
pub mod endpoint;
mod events;
pub mod frame;
pub mod iface;
pub mod loopback;
pub mod peer;
pub mod pool;
pub mod pull;
mod recv;
pub mod region;
mod send;
pub mod timer;
pub mod wire;

#[cfg(test)]
mod events_tests;
#[cfg(test)]
mod pull_tests;
#[cfg(test)]
mod region_tests;
#[cfg(test)]
mod test_fixtures;
#[cfg(test)]
mod wire_tests;

use endpoint::Endpoint;
use iface::{Iface, NetDevice};
use peer::PeerTable;
use pool::FramePool;
use pull::PullHandle;
use timer::{TimerEvent, TimerWheel};

/// Errors returned by the control surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OmxError {
    /// Resource already in use (endpoint slot, region id, full ring).
    Busy,
    /// Bad argument or unknown object.
    Invalid,
    /// Out of frames or slots.
    Nomem,
    /// User memory access failed.
    Fault,
    /// No such board.
    NoDevice,
    /// Operation not permitted.
    Perm,
    /// Lost a race against a concurrent state change; retry the
    /// operation (a pin watcher saw the region invalidated under it).
    Race,
    /// Not finished yet; retry later (deferred copies still in flight).
    Again,
}

impl core::fmt::Display for OmxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            Self::Busy => "resource busy",
            Self::Invalid => "invalid argument",
            Self::Nomem => "out of memory",
            Self::Fault => "bad address",
            Self::NoDevice => "no such board",
            Self::Perm => "operation not permitted",
            Self::Race => "raced with a concurrent change, retry",
            Self::Again => "not finished yet, retry later",
        };
        f.write_str(text)
    }
}

impl std::error::Error for OmxError {}

/// Tunables of a driver instance.
#[derive(Clone)]
pub struct OmxConfig {
    /// Number of board slots.
    pub board_max: u32,
    /// Peer table size.
    pub peer_max: usize,
    /// Pin regions fully at creation instead of on demand.
    pub pin_synchronous: bool,
    /// First demand-pin chunk, in pages; doubles per chunk.
    pub pin_chunk_pages_min: usize,
    /// Demand-pin chunk growth limit, in pages.
    pub pin_chunk_pages_max: usize,
    /// Invalidate regions when their backing range is unmapped.
    pub pin_invalidate: bool,
    /// Optional copy-offload engine.
    pub dma: Option<Arc<dyn dma::DmaEngine>>,
    pub dma_thresholds: dma::DmaThresholds,
    /// Maximum page fragments per transmit frame; 0 disables the
    /// zero-copy paths.
    pub frame_frags_max: usize,
    /// Payloads at or below this size are copied linearly rather than
    /// page-attached.
    pub copybreak: usize,
}

impl Default for OmxConfig {
    fn default() -> Self {
        Self {
            board_max: 32,
            peer_max: peer::PEER_TABLE_SIZE_DEFAULT,
            pin_synchronous: false,
            pin_chunk_pages_min: 16,
            pin_chunk_pages_max: 1024,
            pin_invalidate: true,
            dma: None,
            dma_thresholds: dma::DmaThresholds::default(),
            frame_frags_max: 16,
            copybreak: 256,
        }
    }
}

impl core::fmt::Debug for OmxConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OmxConfig")
            .field("board_max", &self.board_max)
            .field("pin_synchronous", &self.pin_synchronous)
            .field("dma", &self.dma.is_some())
            .field("frame_frags_max", &self.frame_frags_max)
            .finish()
    }
}

/// The transport driver.
pub struct Driver {
    pub config: OmxConfig,
    clock: Arc<JiffiesClock>,
    pool: Arc<FramePool>,
    peers: PeerTable,
    ifaces: RwLock<Vec<Option<Arc<Iface>>>>,
    wheel: TimerWheel,
    driver_desc: Arc<DriverDesc>,
    deferred_pull_notifies: Mutex<Vec<Arc<PullHandle>>>,
    next_session: AtomicU32,
    weak_self: Weak<Driver>,
}

impl Driver {
    pub fn new(config: OmxConfig) -> Arc<Self> {
        let abi_config = if cfg!(feature = "mx-wire-compat") {
            ABI_CONFIG_WIRECOMPAT
        } else {
            0
        };
        let mut features = DriverFeatures::SHARED;
        if config.pin_invalidate {
            features |= DriverFeatures::PIN_INVALIDATE;
        }
        let driver_desc = Arc::new(DriverDesc {
            abi_version: DRIVER_ABI_VERSION,
            abi_config,
            features,
            board_max: config.board_max,
            endpoint_max: wire::ENDPOINT_INDEX_MAX as u32,
            peer_max: config.peer_max as u32,
            jiffies: Default::default(),
            hz: HZ as u32,
            mtu: wire::OMX_MTU as u16,
            medium_frag_length_max: wire::MEDIUM_FRAG_LENGTH_MAX as u16,
        });

        let mut ifaces = Vec::with_capacity(config.board_max as usize);
        ifaces.resize_with(config.board_max as usize, || None);

        Arc::new_cyclic(|weak_self| Self {
            peers: PeerTable::new(config.peer_max),
            config,
            clock: Arc::new(JiffiesClock::new()),
            pool: Arc::new(FramePool::new()),
            ifaces: RwLock::new(ifaces),
            wheel: TimerWheel::new(),
            driver_desc,
            deferred_pull_notifies: Mutex::new(Vec::new()),
            next_session: AtomicU32::new(1),
            weak_self: weak_self.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Internal accessors
    // -----------------------------------------------------------------------

    #[inline]
    pub(crate) fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    #[inline]
    pub(crate) fn wheel(&self) -> &TimerWheel {
        &self.wheel
    }

    #[inline]
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    #[inline]
    pub fn clock(&self) -> &Arc<JiffiesClock> {
        &self.clock
    }

    /// The read-only driver descriptor user processes map.
    #[inline]
    pub fn driver_desc(&self) -> &Arc<DriverDesc> {
        &self.driver_desc
    }

    pub(crate) fn defer_pull_notify(&self, handle: Arc<PullHandle>) {
        self.deferred_pull_notifies.lock().push(handle);
    }

    // -----------------------------------------------------------------------
    // Boards
    // -----------------------------------------------------------------------

    /// Attach a NIC as a new board; returns its board index.
    pub fn attach_iface(
        &self,
        dev: Arc<dyn NetDevice>,
        driver_name: &str,
    ) -> Result<u32, OmxError> {
        let mut ifaces = self.ifaces.write();
        let Some(index) = ifaces.iter().position(|s| s.is_none()) else {
            return Err(OmxError::Busy);
        };
        let hostname = format!("{}:{}", dev.name(), index);
        let iface = Arc::new(Iface::new(
            index as u32,
            dev,
            driver_name.to_string(),
            hostname,
            self.weak_self.clone(),
        ));
        ifaces[index] = Some(iface);
        Ok(index as u32)
    }

    pub fn iface(&self, board_index: u32) -> Result<Arc<Iface>, OmxError> {
        self.ifaces
            .read()
            .get(board_index as usize)
            .and_then(|s| s.clone())
            .ok_or(OmxError::NoDevice)
    }

    pub fn board_count(&self) -> u32 {
        self.ifaces.read().iter().flatten().count() as u32
    }

    pub fn board_info(&self, board_index: u32) -> Result<cmd::BoardInfo, OmxError> {
        Ok(self.iface(board_index)?.board_info())
    }

    pub fn set_hostname(&self, board_index: u32, hostname: &str) -> Result<(), OmxError> {
        self.iface(board_index)?.set_hostname(hostname);
        Ok(())
    }

    pub fn endpoint_info(
        &self,
        board_index: u32,
        endpoint_index: u8,
    ) -> Result<cmd::EndpointInfo, OmxError> {
        let iface = self.iface(board_index)?;
        match iface.endpoint_at(endpoint_index) {
            Some(endpoint) => Ok(endpoint.endpoint_info()),
            None => Ok(cmd::EndpointInfo {
                closed: true,
                ..Default::default()
            }),
        }
    }

    /// Snapshot (and optionally clear) a board's counters.
    pub fn counters(&self, board_index: u32, clear: bool) -> Result<Vec<u64>, OmxError> {
        Ok(self.iface(board_index)?.counters.snapshot(clear))
    }

    // -----------------------------------------------------------------------
    // Peer table
    // -----------------------------------------------------------------------

    pub fn peer_add(
        &self,
        board_addr: u64,
        hostname: Option<String>,
        index: Option<u32>,
    ) -> Result<u32, OmxError> {
        self.peers.add(board_addr, hostname, index)
    }

    pub fn peer_from_index(&self, index: u32) -> Option<cmd::PeerInfo> {
        self.peers.lookup_by_index(index)
    }

    pub fn peer_from_addr(&self, addr: u64) -> Option<cmd::PeerInfo> {
        self.peers.lookup_by_addr(addr)
    }

    pub fn peer_from_hostname(&self, hostname: &str) -> Option<cmd::PeerInfo> {
        self.peers.lookup_by_hostname(hostname)
    }

    pub fn peer_table_get_state(&self) -> cmd::PeerTableState {
        self.peers.get_state()
    }

    pub fn peer_table_set_state(&self, state: &cmd::PeerTableState) {
        self.peers.set_state(state)
    }

    pub fn peer_table_clear(&self) {
        self.peers.clear()
    }

    pub fn peer_table_clear_names(&self) {
        self.peers.clear_names()
    }

    // -----------------------------------------------------------------------
    // Endpoints
    // -----------------------------------------------------------------------

    /// Open the endpoint `(board_index, endpoint_index)` for the process
    /// whose address space is `vm`.
    pub fn open_endpoint(
        &self,
        board_index: u32,
        endpoint_index: u8,
        vm: Arc<UserVm>,
        opener_pid: u32,
        opener_command: &str,
    ) -> Result<Arc<Endpoint>, OmxError> {
        let iface = self.iface(board_index)?;
        let session_id = self.new_session_id();
        let endpoint = Endpoint::new(
            board_index as u8,
            endpoint_index,
            session_id,
            iface.clone(),
            self.weak_self.clone(),
            vm,
            opener_pid,
            opener_command.to_string(),
        );
        // The slot rejects us with Busy when not free; the endpoint only
        // becomes reachable from the wire once its status turns Ok.
        iface.attach_endpoint(endpoint.clone())?;
        endpoint::register_invalidator(&endpoint, self.config.pin_invalidate);
        endpoint.set_status_ok();
        Ok(endpoint)
    }

    pub fn close_endpoint(&self, board_index: u32, endpoint_index: u8) -> Result<(), OmxError> {
        let iface = self.iface(board_index)?;
        match iface.endpoint_at(endpoint_index) {
            Some(endpoint) => endpoint.close(),
            None => Err(OmxError::Invalid),
        }
    }

    fn new_session_id(&self) -> u32 {
        // A cheap generation nonce; only inequality across endpoint
        // generations matters.
        self.next_session
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_mul(0x9E37_79B1)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    pub fn send_tiny(&self, endpoint: &Arc<Endpoint>, cmd: &cmd::SendTiny) -> Result<(), OmxError> {
        send::send_tiny(self, endpoint, cmd)
    }

    pub fn send_small(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::SendSmall,
    ) -> Result<(), OmxError> {
        send::send_small(self, endpoint, cmd)
    }

    pub fn send_mediumsq_frag(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::SendMediumSqFrag,
    ) -> Result<(), OmxError> {
        send::send_mediumsq_frag(self, endpoint, cmd)
    }

    pub fn send_mediumva(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::SendMediumVa,
    ) -> Result<(), OmxError> {
        send::send_mediumva(self, endpoint, cmd)
    }

    pub fn send_rndv(&self, endpoint: &Arc<Endpoint>, cmd: &cmd::SendRndv) -> Result<(), OmxError> {
        send::send_rndv(self, endpoint, cmd)
    }

    pub fn send_notify(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::SendNotify,
    ) -> Result<(), OmxError> {
        send::send_notify(self, endpoint, cmd)
    }

    pub fn send_connect_request(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::SendConnectRequest,
    ) -> Result<(), OmxError> {
        send::send_connect_request(self, endpoint, cmd)
    }

    pub fn send_connect_reply(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::SendConnectReply,
    ) -> Result<(), OmxError> {
        send::send_connect_reply(self, endpoint, cmd)
    }

    pub fn send_liback(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::SendLibAck,
    ) -> Result<(), OmxError> {
        send::send_liback(self, endpoint, cmd)
    }

    /// Start a pull; completion is always reported through a `PullDone`
    /// event, success or failure.
    pub fn pull(&self, endpoint: &Arc<Endpoint>, cmd: &cmd::Pull) -> Result<(), OmxError> {
        pull::ioctl_pull(self, endpoint, cmd)
    }

    // -----------------------------------------------------------------------
    // User regions
    // -----------------------------------------------------------------------

    pub fn create_user_region(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::CreateUserRegion,
    ) -> Result<(), OmxError> {
        let region = region::UserRegion::new(cmd.id, cmd.seqnum, &cmd.segments, endpoint.vm().clone())?;
        if self.config.pin_synchronous {
            region::immediate_full_pin(&region, &self.config)?;
        }
        endpoint.regions.insert(region)
    }

    pub fn destroy_user_region(
        &self,
        endpoint: &Arc<Endpoint>,
        cmd: &cmd::DestroyUserRegion,
    ) -> Result<(), OmxError> {
        endpoint
            .regions
            .remove(cmd.id)
            .map(|_| ())
            .ok_or(OmxError::Invalid)
    }

    // -----------------------------------------------------------------------
    // Waiting
    // -----------------------------------------------------------------------

    pub fn wait_event(&self, endpoint: &Arc<Endpoint>, cmd: &WaitEvent) -> WaitStatus {
        events::wait_event(endpoint, cmd)
    }

    /// Wake all of the endpoint's waiters with `status`.
    pub fn wakeup(&self, endpoint: &Arc<Endpoint>, status: WaitStatus) {
        events::wakeup(endpoint, status)
    }

    pub fn release_exp_slots(&self, endpoint: &Arc<Endpoint>) -> Result<(), OmxError> {
        events::release_exp_slots(endpoint)
    }

    pub fn release_unexp_slots(&self, endpoint: &Arc<Endpoint>) -> Result<(), OmxError> {
        events::release_unexp_slots(endpoint)
    }

    // -----------------------------------------------------------------------
    // Data-plane entry points
    // -----------------------------------------------------------------------

    /// Deliver one received Ethernet frame to a board.
    pub fn recv(&self, board_index: u32, frame: &[u8]) {
        let Ok(iface) = self.iface(board_index) else {
            return;
        };
        recv::omx_recv(self, &iface, frame);
    }

    /// Timer/NAPI integration point: advance the wheel to the current
    /// jiffies, dispatch expired timers, and run deferred work.
    ///
    /// The host calls this after advancing the clock (a timer tick) and
    /// whenever it polls the driver.
    pub fn timer_process(&self) {
        let now = self.clock.now();
        self.driver_desc.jiffies.store(now, Ordering::Relaxed);

        let fired = self.wheel.advance_to(now);
        for event in fired {
            match event {
                TimerEvent::PullRetransmit(handle) => pull::pull_timeout_handler(self, handle),
            }
        }

        self.process_deferred_work();
    }

    /// Run deferred completions (DMA waits).
    pub fn process_deferred_work(&self) {
        let pending = {
            let mut deferred = self.deferred_pull_notifies.lock();
            std::mem::take(&mut *deferred)
        };
        for handle in pending {
            if !pull::try_deferred_notify(self, &handle) {
                self.deferred_pull_notifies.lock().push(handle);
            }
        }
    }
}

impl core::fmt::Debug for Driver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Driver(boards={}, peers={}, jiffies={})",
            self.board_count(),
            self.peers.count(),
            self.clock.now()
        )
    }
}
