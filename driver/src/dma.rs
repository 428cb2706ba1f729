//! Optional DMA-offload capability for receive-side copies.
//!
//! An engine accepts copy submissions into pinned pages and reports how
//! many bytes it did *not* take; the caller memcpys the residual itself,
//! keeping the CPU fallback path explicit.  Completion is tracked by
//! monotonically increasing cookies: once [`DmaEngine::poll_done`] returns
//! `true` for a cookie, every submission up to it has landed.

use std::sync::Arc;

use omx_mm::PageFrame;

/// Outcome of one submission.
pub struct DmaSubmit {
    /// Bytes not accepted by the engine; the caller copies them itself.
    pub residual: usize,
    /// Completion cookie of the accepted part, if any was accepted.
    pub cookie: Option<u64>,
}

/// A DMA engine able to offload copies into pinned pages.
pub trait DmaEngine: Send + Sync {
    /// Submit an asynchronous copy of `src` into `page` at `pgoff`.
    fn memcpy_to_page(&self, page: &Arc<PageFrame>, pgoff: usize, src: &[u8]) -> DmaSubmit;

    /// Whether every submission up to `cookie` has completed.
    fn poll_done(&self, cookie: u64) -> bool;
}

/// Copy thresholds: offload only pays off above these sizes.
#[derive(Clone, Copy, Debug)]
pub struct DmaThresholds {
    /// Minimum per-fragment length worth offloading.
    pub async_frag_min: u32,
    /// Minimum total message length worth offloading.
    pub async_min: u32,
}

impl Default for DmaThresholds {
    fn default() -> Self {
        Self {
            async_frag_min: 1024,
            async_min: 64 * 1024,
        }
    }
}
