//! Interface layer: one attachment per NIC.
//!
//! An [`Iface`] owns the per-NIC counter array and the endpoint slot
//! array.  Attach/detach of endpoints takes the slot lock in write; the
//! receive path acquires endpoints under the read side only, so incoming
//! packets never contend with each other.
//!
//! The NIC itself is abstracted as [`NetDevice`]: the transport only
//! needs a send function and link identity (MAC, MTU, name).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use spin::{Mutex, RwLock};

use omx_abi::cmd::{BoardInfo, BoardInfoStatus};

use crate::counters::CounterSet;
use crate::endpoint::{Endpoint, EndpointStatus};
use crate::frame::FrameBuf;
use crate::wire::{MacAddr, ENDPOINT_INDEX_MAX};
use crate::{Driver, OmxError};

// ---------------------------------------------------------------------------
// NetDevice trait
// ---------------------------------------------------------------------------

/// Abstraction for the NIC under an interface.
///
/// All methods take `&self`; implementations use interior mutability.
/// `tx` consumes the frame — the device reads fragments before returning
/// or keeps the frame alive until it has.
pub trait NetDevice: Send + Sync {
    /// Transmit one frame.  `Err(Nomem)` when the device queue is full.
    fn tx(&self, frame: FrameBuf) -> Result<(), OmxError>;

    /// Hardware MAC address.
    fn mac(&self) -> MacAddr;

    /// Device MTU in bytes.
    fn mtu(&self) -> u16;

    /// Interface name ("fab0" and friends).
    fn name(&self) -> String;
}

// ---------------------------------------------------------------------------
// Iface
// ---------------------------------------------------------------------------

/// Why acquiring an endpoint by index failed; maps to the nack the sender
/// receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointAcquireError {
    /// No endpoint open at this index (or the index is out of range).
    BadEndpoint,
    /// The endpoint exists but is being closed.
    EndpointClosed,
}

impl EndpointAcquireError {
    pub fn to_nack_type(self) -> crate::wire::NackType {
        match self {
            Self::BadEndpoint => crate::wire::NackType::BadEndpoint,
            Self::EndpointClosed => crate::wire::NackType::EndpointClosed,
        }
    }
}

/// One NIC attachment.
pub struct Iface {
    board_index: u32,
    dev: Arc<dyn NetDevice>,
    driver_name: String,
    hostname: Mutex<String>,
    /// Endpoint slots; `None` = free.  Write-locked only on attach and
    /// detach; the receive path reads.
    endpoints: RwLock<Vec<Option<Arc<Endpoint>>>>,
    endpoint_nr: AtomicU32,
    pub(crate) counters: CounterSet,
    pub(crate) driver: Weak<Driver>,
}

impl Iface {
    pub(crate) fn new(
        board_index: u32,
        dev: Arc<dyn NetDevice>,
        driver_name: String,
        hostname: String,
        driver: Weak<Driver>,
    ) -> Self {
        let mut endpoints = Vec::with_capacity(ENDPOINT_INDEX_MAX);
        endpoints.resize_with(ENDPOINT_INDEX_MAX, || None);
        Self {
            board_index,
            dev,
            driver_name,
            hostname: Mutex::new(hostname),
            endpoints: RwLock::new(endpoints),
            endpoint_nr: AtomicU32::new(0),
            counters: CounterSet::new(),
            driver,
        }
    }

    #[inline]
    pub fn board_index(&self) -> u32 {
        self.board_index
    }

    #[inline]
    pub fn mac(&self) -> MacAddr {
        self.dev.mac()
    }

    #[inline]
    pub fn mtu(&self) -> u16 {
        self.dev.mtu()
    }

    pub fn hostname(&self) -> String {
        self.hostname.lock().clone()
    }

    pub fn set_hostname(&self, hostname: &str) {
        *self.hostname.lock() = hostname.to_string();
    }

    /// Hand a frame to the NIC.
    pub(crate) fn tx(&self, frame: FrameBuf) -> Result<(), OmxError> {
        self.dev.tx(frame)
    }

    pub fn board_info(&self) -> BoardInfo {
        BoardInfo {
            addr: self.mac().to_u64(),
            mtu: self.mtu() as u32,
            numa_node: 0,
            status: BoardInfoStatus::empty(),
            hostname: self.hostname(),
            ifacename: self.dev.name(),
            drivername: self.driver_name.clone(),
        }
    }

    pub fn endpoint_nr(&self) -> u32 {
        self.endpoint_nr.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Endpoint slots
    // -----------------------------------------------------------------------

    /// Attach an endpoint to its slot.  `Busy` if the slot is taken.
    pub(crate) fn attach_endpoint(&self, endpoint: Arc<Endpoint>) -> Result<(), OmxError> {
        let index = endpoint.endpoint_index() as usize;
        if index >= ENDPOINT_INDEX_MAX {
            return Err(OmxError::Invalid);
        }
        let mut slots = self.endpoints.write();
        if slots[index].is_some() {
            return Err(OmxError::Busy);
        }
        slots[index] = Some(endpoint);
        self.endpoint_nr.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Detach the endpoint at `index`, dropping the slot's reference.
    pub(crate) fn detach_endpoint(&self, index: u8) {
        let mut slots = self.endpoints.write();
        if slots[index as usize].take().is_some() {
            self.endpoint_nr.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Acquire the endpoint at `index` for packet delivery.
    ///
    /// Only endpoints whose status is `Ok` are reachable from the wire.
    pub(crate) fn acquire_endpoint(
        &self,
        index: u8,
    ) -> Result<Arc<Endpoint>, EndpointAcquireError> {
        let slots = self.endpoints.read();
        match slots.get(index as usize).and_then(|s| s.as_ref()) {
            None => Err(EndpointAcquireError::BadEndpoint),
            Some(endpoint) => match endpoint.status() {
                EndpointStatus::Ok => Ok(endpoint.clone()),
                EndpointStatus::Closing => Err(EndpointAcquireError::EndpointClosed),
                _ => Err(EndpointAcquireError::BadEndpoint),
            },
        }
    }

    /// Status of the slot at `index`, `Free` when empty.
    pub fn endpoint_status(&self, index: u8) -> EndpointStatus {
        let slots = self.endpoints.read();
        match slots.get(index as usize).and_then(|s| s.as_ref()) {
            None => EndpointStatus::Free,
            Some(endpoint) => endpoint.status(),
        }
    }

    /// A clone of the endpoint slot regardless of status (control plane).
    pub(crate) fn endpoint_at(&self, index: u8) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(index as usize)?.clone()
    }
}

impl core::fmt::Debug for Iface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Iface(board={}, mac={}, endpoints={})",
            self.board_index,
            self.mac(),
            self.endpoint_nr()
        )
    }
}
