//! User-mapped driver and endpoint descriptors.
//!
//! Both descriptors live in memory shared with user space.  The driver
//! descriptor is read-only for the user; the endpoint descriptor is written
//! by both sides, so every mutable word is an atomic: the driver may export
//! information by writing into it but can never trust what it reads back.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Feature bits advertised by the driver descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DriverFeatures: u32 {
        /// Same-host shared fast path is available.
        const SHARED = 1 << 1;
        /// Regions are invalidated when their backing range is unmapped.
        const PIN_INVALIDATE = 1 << 2;
    }
}

impl Default for DriverFeatures {
    fn default() -> Self {
        Self::empty()
    }
}

/// Read-only descriptor advertising the driver ABI and limits.
#[derive(Debug)]
pub struct DriverDesc {
    pub abi_version: u32,
    pub abi_config: u32,
    pub features: DriverFeatures,
    pub board_max: u32,
    pub endpoint_max: u32,
    pub peer_max: u32,
    /// Current jiffies, refreshed by the driver on timer processing.
    pub jiffies: AtomicU64,
    pub hz: u32,
    pub mtu: u16,
    pub medium_frag_length_max: u16,
}

bitflags! {
    /// Status bits of the endpoint descriptor, set by the driver and
    /// cleared by the library once it has reacted.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EndpointDescStatus: u64 {
        /// The expected event queue had no free slot; an event was lost.
        const EXP_EVENTQ_FULL = 1 << 0;
        /// The unexpected event queue had no free slot; a packet was
        /// dropped and will be resent.
        const UNEXP_EVENTQ_FULL = 1 << 1;
        const IFACE_DOWN = 1 << 2;
        const IFACE_BAD_MTU = 1 << 3;
        const IFACE_REMOVED = 1 << 4;
        const IFACE_HIGH_INTRCOAL = 1 << 5;
    }
}

impl Default for EndpointDescStatus {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor shared between the driver and one endpoint's user process.
#[derive(Debug, Default)]
pub struct EndpointDesc {
    /// Status word ([`EndpointDescStatus`] bits), set by the driver,
    /// cleared by the library once it has reacted.
    pub status: AtomicU64,
    /// Absolute jiffies at which the library wants waiters woken with
    /// `Progress`, or [`crate::cmd::NO_WAKEUP_JIFFIES`].  Written by the
    /// library.
    pub wakeup_jiffies: AtomicU64,
    pub session_id: AtomicU32,
    /// Incremented by the library as it consumes events; part of the
    /// wait-event race check.
    pub user_event_index: AtomicU32,
}

impl EndpointDesc {
    pub fn set_status_bits(&self, bits: EndpointDescStatus) {
        self.status.fetch_or(bits.bits(), Ordering::Relaxed);
    }

    pub fn clear_status_bits(&self, bits: EndpointDescStatus) {
        self.status.fetch_and(!bits.bits(), Ordering::Relaxed);
    }

    pub fn status_bits(&self) -> EndpointDescStatus {
        EndpointDescStatus::from_bits_retain(self.status.load(Ordering::Relaxed))
    }
}
