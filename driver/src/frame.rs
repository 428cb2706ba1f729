//! Pool-backed transmit frame with zero-copy page attachment.
//!
//! `FrameBuf` is the single currency handed to [`NetDevice::tx`]: a linear
//! header/payload area backed by the pool, plus an optional list of page
//! fragments referencing pinned region pages (the zero-copy path of pull
//! replies and MediumVA fragments).  A frame holding page fragments also
//! holds a reference keeping the owning region alive until the frame is
//! dropped — the NIC has consumed the data by then.
//!
//! # Ownership
//!
//! `FrameBuf` is **move-only** — it deliberately does not implement
//! `Clone`.  Dropping a frame automatically returns its slot to the pool.
//!
//! [`NetDevice::tx`]: crate::iface::NetDevice::tx

use std::any::Any;
use std::sync::Arc;

use omx_mm::PageFrame;

use crate::pool::{FramePool, FRAME_SLOT_SIZE};
use crate::wire::ETH_ZLEN;
use crate::OmxError;

/// One page fragment attached to a frame.
struct FrameFrag {
    page: Arc<PageFrame>,
    pageoff: u16,
    len: u16,
}

/// A transmit frame: linear bytes plus optional page fragments.
pub struct FrameBuf {
    pool: Arc<FramePool>,
    slot: u16,
    /// Length of the linear part.
    len: u16,
    frags: Vec<FrameFrag>,
    frags_len: u32,
    /// Keeps the fragment owner (a user region) alive until the frame is
    /// consumed.
    hold: Option<Arc<dyn Any + Send + Sync>>,
}

impl Drop for FrameBuf {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

impl FrameBuf {
    /// Allocate an empty frame from the pool; `None` when exhausted (the
    /// caller reports `Nomem` and bumps the alloc-failure counter).
    pub fn alloc(pool: &Arc<FramePool>) -> Option<Self> {
        let slot = pool.alloc()?;
        Some(Self {
            pool: pool.clone(),
            slot,
            len: 0,
            frags: Vec::new(),
            frags_len: 0,
            hold: None,
        })
    }

    fn data(&self) -> &[u8] {
        // SAFETY: we own this slot; FrameBuf is move-only so no aliasing
        // mutable access exists.
        unsafe { core::slice::from_raw_parts(self.pool.slot_data(self.slot), FRAME_SLOT_SIZE) }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: we own this slot and hold &mut self.
        unsafe { core::slice::from_raw_parts_mut(self.pool.slot_data(self.slot), FRAME_SLOT_SIZE) }
    }

    /// Linear length (without fragments).
    #[inline]
    pub fn linear_len(&self) -> usize {
        self.len as usize
    }

    /// Total frame length including fragments.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.len as usize + self.frags_len as usize
    }

    /// Append bytes to the linear part.
    pub fn append(&mut self, src: &[u8]) -> Result<(), OmxError> {
        let new_len = self.len as usize + src.len();
        if new_len > FRAME_SLOT_SIZE {
            return Err(OmxError::Nomem);
        }
        let off = self.len as usize;
        self.data_mut()[off..new_len].copy_from_slice(src);
        self.len = new_len as u16;
        Ok(())
    }

    /// Reserve `len` zeroed linear bytes and return their offset, for
    /// headers that are written after sizing decisions.
    pub fn append_zeroed(&mut self, len: usize) -> Result<usize, OmxError> {
        let off = self.len as usize;
        let new_len = off + len;
        if new_len > FRAME_SLOT_SIZE {
            return Err(OmxError::Nomem);
        }
        self.data_mut()[off..new_len].fill(0);
        self.len = new_len as u16;
        Ok(off)
    }

    /// Mutable view of a previously appended linear range.
    pub fn linear_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        debug_assert!(off + len <= self.len as usize);
        &mut self.data_mut()[off..off + len]
    }

    /// Attach a page fragment, bounded by `frags_max`.
    ///
    /// On `Err` the caller reverts to a linear copy (and counts it).
    pub fn append_page_frag(
        &mut self,
        page: Arc<PageFrame>,
        pageoff: usize,
        len: usize,
        frags_max: usize,
    ) -> Result<(), OmxError> {
        if self.frags.len() >= frags_max {
            return Err(OmxError::Nomem);
        }
        self.frags.push(FrameFrag {
            page,
            pageoff: pageoff as u16,
            len: len as u16,
        });
        self.frags_len += len as u32;
        Ok(())
    }

    /// Record the owner that must outlive this frame (the region whose
    /// pages are attached).
    pub fn hold_owner(&mut self, owner: Arc<dyn Any + Send + Sync>) {
        self.hold = Some(owner);
    }

    /// Pad the linear part with zeroes up to the minimal Ethernet length.
    ///
    /// With fragments attached the padding must come after them, so it is
    /// left to the wire assembly instead.
    pub fn pad_to_min(&mut self) -> Result<(), OmxError> {
        if self.frags.is_empty() && self.total_len() < ETH_ZLEN {
            let missing = ETH_ZLEN - self.total_len();
            self.append_zeroed(missing)?;
        }
        Ok(())
    }

    /// Linearize the whole frame (headers + fragments) into one buffer,
    /// padded to the minimal Ethernet length.
    ///
    /// This is the "wire": the NIC consumes the page contents here, after
    /// which the fragment references may be dropped.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len().max(ETH_ZLEN));
        out.extend_from_slice(&self.data()[..self.len as usize]);
        let mut chunk = [0u8; 4096];
        for frag in &self.frags {
            let mut remaining = frag.len as usize;
            let mut pgoff = frag.pageoff as usize;
            while remaining > 0 {
                let n = remaining.min(chunk.len());
                frag.page.read(pgoff, &mut chunk[..n]);
                out.extend_from_slice(&chunk[..n]);
                pgoff += n;
                remaining -= n;
            }
        }
        if out.len() < ETH_ZLEN {
            out.resize(ETH_ZLEN, 0);
        }
        out
    }
}

impl core::fmt::Debug for FrameBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FrameBuf {{ slot={}, len={}, frags={}, frags_len={}, held={} }}",
            self.slot,
            self.len,
            self.frags.len(),
            self.frags_len,
            self.hold.is_some()
        )
    }
}
