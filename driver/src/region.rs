//! User regions: pinned user memory fed to the transmit path or filled
//! from received frames.
//!
//! A region is an ordered sequence of segments, each backed by an array
//! of pinned pages.  Regions are the source of pull replies and MediumVA
//! fragments and the sink of pull transfers.
//!
//! # Pinning
//!
//! Two modes.  Synchronous pin populates every page array at creation.
//! Demand pin elects a single pinner with a compare-and-swap on the
//! region status (`NotPinned → Pinned`); the winner pins in chunks that
//! double from `pin_chunk_pages_min` to `pin_chunk_pages_max`, publishing
//! progress through `total_registered_length` with a release store, while
//! any number of watchers spin on that counter with acquire loads until
//! the prefix they need is covered.  A pinning failure makes the status
//! `Failed`, which is sticky until invalidation resets the region.
//!
//! # Addressing
//!
//! Packet paths address region bytes through an [`OffsetCache`]: a cursor
//! of (segment, segment offset, page, page offset) advanced as data is
//! copied, with a contiguous fast path for single-segment regions and a
//! vectored path for the general case.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::{Mutex, RwLock};

use omx_abi::cmd::UserSegment;
use omx_abi::USER_REGION_MAX;
use omx_lib::{klog_debug, klog_warn};
use omx_mm::{nr_pages_spanned, PageFrame, UserVm, PAGE_MASK, PAGE_SIZE};

use crate::dma::DmaEngine;
use crate::frame::FrameBuf;
use crate::{OmxConfig, OmxError};

/// Page arrays above this page count come from the large-allocation pool.
pub const VMALLOC_NR_PAGES_THRESHOLD: usize = 4096;

// ---------------------------------------------------------------------------
// Region and segments
// ---------------------------------------------------------------------------

const STATUS_NOT_PINNED: u8 = 0;
const STATUS_PINNED: u8 = 1;
const STATUS_FAILED: u8 = 2;

/// Pinning status of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionStatus {
    NotPinned,
    /// Pinned or being pinned.
    Pinned,
    Failed,
}

/// One contiguous sub-range of a region.
pub struct Segment {
    aligned_vaddr: u64,
    first_page_offset: usize,
    length: u64,
    nr_pages: usize,
    /// Large page array, released outside atomic context.
    vmalloced: bool,
    pinned_pages: AtomicUsize,
    pages: Mutex<Vec<Option<Arc<PageFrame>>>>,
}

impl Segment {
    fn new(useg: &UserSegment) -> Self {
        let first_page_offset = (useg.vaddr & !PAGE_MASK) as usize;
        let aligned_vaddr = useg.vaddr & PAGE_MASK;
        let nr_pages = nr_pages_spanned(first_page_offset, useg.len as usize);
        Self {
            aligned_vaddr,
            first_page_offset,
            length: useg.len,
            nr_pages,
            vmalloced: nr_pages > VMALLOC_NR_PAGES_THRESHOLD,
            pinned_pages: AtomicUsize::new(0),
            pages: Mutex::new(vec![None; nr_pages]),
        }
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Whether `[start, end)` intersects this segment's byte range.
    fn intersects(&self, start: u64, end: u64) -> bool {
        let seg_start = self.aligned_vaddr + self.first_page_offset as u64;
        let seg_end = seg_start + self.length;
        seg_start < end && start < seg_end
    }

    fn page(&self, idx: usize) -> Arc<PageFrame> {
        self.pages.lock()[idx]
            .clone()
            .expect("region page accessed before being pinned")
    }

    fn release_pages(&self) {
        let mut pages = self.pages.lock();
        pages.iter_mut().for_each(|p| *p = None);
        self.pinned_pages.store(0, Ordering::Relaxed);
    }
}

/// A registered user region.
pub struct UserRegion {
    id: u32,
    seqnum: u32,
    /// Set when the region is a pull sink.
    dirty: AtomicBool,
    nr_vmalloc_segments: usize,
    total_length: u64,
    status: AtomicU8,
    /// Bytes pinned so far, monotone while pinning; watchers spin on it.
    total_registered_length: AtomicU64,
    vm: Arc<UserVm>,
    segments: Vec<Segment>,
}

impl UserRegion {
    pub(crate) fn new(
        id: u32,
        seqnum: u32,
        usegs: &[UserSegment],
        vm: Arc<UserVm>,
    ) -> Result<Arc<Self>, OmxError> {
        if usegs.is_empty() {
            return Err(OmxError::Invalid);
        }
        let segments: Vec<Segment> = usegs.iter().map(Segment::new).collect();
        let total_length = segments.iter().map(|s| s.length).sum();
        let nr_vmalloc_segments = segments.iter().filter(|s| s.vmalloced).count();
        Ok(Arc::new(Self {
            id,
            seqnum,
            dirty: AtomicBool::new(false),
            nr_vmalloc_segments,
            total_length,
            status: AtomicU8::new(STATUS_NOT_PINNED),
            total_registered_length: AtomicU64::new(0),
            vm,
            segments,
        }))
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    #[inline]
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    #[inline]
    pub fn nr_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn status(&self) -> RegionStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_NOT_PINNED => RegionStatus::NotPinned,
            STATUS_PINNED => RegionStatus::Pinned,
            _ => RegionStatus::Failed,
        }
    }

    #[inline]
    pub fn total_registered_length(&self) -> u64 {
        self.total_registered_length.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Pinning
    // -----------------------------------------------------------------------

    /// Wait for another task's pinning to cover `needed` bytes.
    pub(crate) fn parallel_pin_wait(&self, needed: u64) -> Result<u64, OmxError> {
        while self.total_registered_length() < needed
            && self.status.load(Ordering::Acquire) == STATUS_PINNED
        {
            core::hint::spin_loop();
        }
        if self.status.load(Ordering::Acquire) == STATUS_FAILED {
            return Err(OmxError::Fault);
        }
        let registered = self.total_registered_length();
        if registered < needed {
            // The region was invalidated under us; a retry re-elects the
            // pinner.
            return Err(OmxError::Race);
        }
        Ok(registered)
    }

    // -----------------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------------

    /// Quiesce the region after part of its backing range was unmapped:
    /// wait out the demand pinner, release every pinned page, and return
    /// the region to `NotPinned`.
    pub(crate) fn invalidate(&self, config: &OmxConfig) {
        if self.status.load(Ordering::Acquire) == STATUS_NOT_PINNED {
            return;
        }
        if config.pin_synchronous {
            klog_warn!(
                "invalidating synchronously-pinned region {} — pages were in use",
                self.id
            );
        }
        // Wait until the pinner is done so no chunk lands after the reset.
        while self.status.load(Ordering::Acquire) == STATUS_PINNED
            && self.total_registered_length() < self.total_length
        {
            core::hint::spin_loop();
        }
        for segment in &self.segments {
            segment.release_pages();
        }
        self.total_registered_length.store(0, Ordering::Release);
        self.status.store(STATUS_NOT_PINNED, Ordering::Release);
    }

    /// Whether any segment intersects the unmapped `[start, end)` range.
    pub(crate) fn intersects(&self, start: u64, end: u64) -> bool {
        self.segments.iter().any(|s| s.intersects(start, end))
    }
}

impl Drop for UserRegion {
    fn drop(&mut self) {
        if self.nr_vmalloc_segments > 0 {
            klog_debug!(
                "releasing region {} with {} large page arrays",
                self.id,
                self.nr_vmalloc_segments
            );
        }
    }
}

impl core::fmt::Debug for UserRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "UserRegion(id={}, len={}, {:?}, registered={})",
            self.id,
            self.total_length,
            self.status(),
            self.total_registered_length()
        )
    }
}

// ---------------------------------------------------------------------------
// Pin state machine
// ---------------------------------------------------------------------------

/// Cursor of an in-progress pin (the pinner's own state) or a watch on
/// somebody else's.
pub(crate) struct RegionPinState {
    region: Arc<UserRegion>,
    watching: bool,
    iseg: usize,
    /// Next aligned address to pin in the current segment.
    vaddr: u64,
    page_idx: usize,
    remaining: u64,
    chunk_offset: usize,
    next_chunk_pages: usize,
    /// Cursor not yet loaded from the current segment.
    fresh_segment: bool,
    chunk_pages_max: usize,
}

/// Full pin at creation (synchronous-pin mode).
pub(crate) fn immediate_full_pin(
    region: &Arc<UserRegion>,
    config: &OmxConfig,
) -> Result<(), OmxError> {
    debug_assert!(config.pin_synchronous);
    region.status.store(STATUS_PINNED, Ordering::Release);
    let mut pinstate = RegionPinState::start(region.clone(), config.pin_chunk_pages_max);
    pinstate.pin_continue(region.total_length).map(|_| ())
}

/// Make sure the whole region is pinned, demand-pin style: become the
/// pinner or wait the pinner out.
pub(crate) fn demand_pin_finish(
    region: &Arc<UserRegion>,
    config: &OmxConfig,
) -> Result<(), OmxError> {
    let mut pinstate = demand_pin_init(region, config);
    pinstate.finish()
}

/// Start demand pinning: atomically elect the pinner; losers watch.
pub(crate) fn demand_pin_init(region: &Arc<UserRegion>, config: &OmxConfig) -> RegionPinState {
    debug_assert!(!config.pin_synchronous);
    let won = region
        .status
        .compare_exchange(
            STATUS_NOT_PINNED,
            STATUS_PINNED,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok();
    let mut state = RegionPinState::start(region.clone(), config.pin_chunk_pages_max);
    state.next_chunk_pages = config.pin_chunk_pages_min;
    state.watching = !won;
    state
}

impl RegionPinState {
    fn start(region: Arc<UserRegion>, chunk_pages_max: usize) -> Self {
        Self {
            region,
            watching: false,
            iseg: 0,
            vaddr: 0,
            page_idx: 0,
            remaining: 0,
            chunk_offset: 0,
            next_chunk_pages: chunk_pages_max,
            fresh_segment: true,
            chunk_pages_max,
        }
    }

    fn load_segment(&mut self) {
        let segment = &self.region.segments[self.iseg];
        self.vaddr = segment.aligned_vaddr;
        self.page_idx = 0;
        self.remaining = segment.length;
        self.chunk_offset = segment.first_page_offset;
        self.fresh_segment = false;
    }

    /// Pin one chunk of pages in the current segment.
    fn add_chunk(&mut self) -> Result<(), OmxError> {
        if self.fresh_segment {
            self.load_segment();
        }

        // Estimated page count, doubling towards the configured max.
        let mut chunk_pages = self.next_chunk_pages;
        if chunk_pages < self.chunk_pages_max {
            self.next_chunk_pages = (chunk_pages << 1).min(self.chunk_pages_max);
        }

        // Corresponding byte length, clipped to the segment.
        let chunk_length = if self.chunk_offset as u64 + self.remaining
            <= (chunk_pages * PAGE_SIZE) as u64
        {
            self.remaining
        } else {
            (chunk_pages * PAGE_SIZE - self.chunk_offset) as u64
        };

        // The actual page count spanned by that length.
        chunk_pages = nr_pages_spanned(self.chunk_offset, chunk_length as usize);

        let region = &self.region;
        let segment = &region.segments[self.iseg];
        let pinned = match region.vm.get_user_pages(self.vaddr, chunk_pages) {
            Ok(pinned) => pinned,
            Err(_) => {
                klog_warn!(
                    "failed to pin region {} ({} pages at {:#x})",
                    region.id,
                    chunk_pages,
                    self.vaddr
                );
                region.status.store(STATUS_FAILED, Ordering::Release);
                return Err(OmxError::Fault);
            }
        };

        {
            let mut pages = segment.pages.lock();
            for (i, page) in pinned.into_iter().enumerate() {
                pages[self.page_idx + i] = Some(page);
            }
        }
        segment.pinned_pages.fetch_add(chunk_pages, Ordering::Relaxed);
        // Release-publish the progress for busy-waiting watchers.
        region
            .total_registered_length
            .fetch_add(chunk_length, Ordering::Release);

        if chunk_length < self.remaining {
            // Keep the same segment; the chunk ended on a page boundary.
            self.vaddr += (self.chunk_offset as u64 + chunk_length) & PAGE_MASK;
            self.page_idx += chunk_pages;
            self.remaining -= chunk_length;
            self.chunk_offset = 0;
        } else {
            // Jump to the next segment.
            self.iseg += 1;
            self.fresh_segment = true;
        }
        Ok(())
    }

    /// Drive the pin until `needed` bytes are covered; watchers wait
    /// instead.  Returns the registered length.
    pub(crate) fn pin_continue(&mut self, needed: u64) -> Result<u64, OmxError> {
        if self.watching {
            return self.region.parallel_pin_wait(needed);
        }
        while self.region.total_registered_length() < needed {
            self.add_chunk()?;
        }
        Ok(self.region.total_registered_length())
    }

    /// Cover the whole region (or wait until somebody else has).
    pub(crate) fn finish(&mut self) -> Result<(), OmxError> {
        let total = self.region.total_length;
        self.pin_continue(total).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Offset cache
// ---------------------------------------------------------------------------

/// Dispatch variant of an offset cache: single-segment regions take the
/// contiguous path, everything else the vectored path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OffsetCacheKind {
    Contig,
    Vect,
}

/// Cursor addressing a region's bytes for copies in either direction.
pub(crate) struct OffsetCache {
    region: Arc<UserRegion>,
    kind: OffsetCacheKind,
    iseg: usize,
    segoff: u64,
    page_idx: usize,
    pageoff: usize,
}

impl OffsetCache {
    /// Build a cache positioned at `offset`, checking that
    /// `offset + length` lies within the region.
    pub(crate) fn init(
        region: &Arc<UserRegion>,
        offset: u64,
        length: u64,
    ) -> Result<Self, OmxError> {
        if length == 0 || offset + length > region.total_length {
            return Err(OmxError::Invalid);
        }
        let kind = if region.segments.len() == 1 {
            OffsetCacheKind::Contig
        } else {
            OffsetCacheKind::Vect
        };
        let mut iseg = 0;
        let mut segoff = offset;
        while segoff >= region.segments[iseg].length {
            // A zero-length tail segment cannot be reached: offset+length
            // is bounded by the total length checked above.
            segoff -= region.segments[iseg].length;
            iseg += 1;
        }
        let segment = &region.segments[iseg];
        let byte = segment.first_page_offset as u64 + segoff;
        Ok(Self {
            region: region.clone(),
            kind,
            iseg,
            segoff,
            page_idx: (byte / PAGE_SIZE as u64) as usize,
            pageoff: (byte % PAGE_SIZE as u64) as usize,
        })
    }

    /// Size of the next contiguous chunk, bounded by `remaining`.
    fn chunk_len(&self, remaining: usize) -> usize {
        let segment = &self.region.segments[self.iseg];
        let mut chunk = remaining.min(PAGE_SIZE - self.pageoff);
        if self.kind == OffsetCacheKind::Vect {
            chunk = chunk.min((segment.length - self.segoff) as usize);
        }
        chunk
    }

    fn advance(&mut self, chunk: usize) {
        let segment = &self.region.segments[self.iseg];
        self.segoff += chunk as u64;
        if self.kind == OffsetCacheKind::Vect && self.segoff == segment.length {
            // Next segment.
            self.iseg += 1;
            self.segoff = 0;
            if self.iseg < self.region.segments.len() {
                let next = &self.region.segments[self.iseg];
                self.page_idx = next.first_page_offset / PAGE_SIZE;
                self.pageoff = next.first_page_offset % PAGE_SIZE;
            }
        } else if self.pageoff + chunk == PAGE_SIZE {
            // Next page in the same segment.
            self.page_idx += 1;
            self.pageoff = 0;
        } else {
            self.pageoff += chunk;
        }
    }

    /// Copy region bytes into `dst` (pull-reply generation, linear path).
    pub(crate) fn copy_to_buf(&mut self, dst: &mut [u8]) {
        let mut copied = 0;
        while copied < dst.len() {
            let chunk = self.chunk_len(dst.len() - copied);
            let page = self.region.segments[self.iseg].page(self.page_idx);
            page.read(self.pageoff, &mut dst[copied..copied + chunk]);
            self.advance(chunk);
            copied += chunk;
        }
    }

    /// Attach region pages to an outgoing frame without copying.
    ///
    /// Bounded by `frags_max`; on failure the caller falls back to the
    /// linear copy (and counts it).  The frame must also be given a
    /// reference that keeps the region alive.
    pub(crate) fn append_to_frame(
        &mut self,
        frame: &mut FrameBuf,
        length: usize,
        frags_max: usize,
    ) -> Result<(), OmxError> {
        let mut appended = 0;
        while appended < length {
            let chunk = self.chunk_len(length - appended);
            let page = self.region.segments[self.iseg].page(self.page_idx);
            frame.append_page_frag(page, self.pageoff, chunk, frags_max)?;
            self.advance(chunk);
            appended += chunk;
        }
        Ok(())
    }

    /// Fill region pages from `src` (pull sink).
    pub(crate) fn copy_from_buf(&mut self, src: &[u8]) {
        let mut copied = 0;
        while copied < src.len() {
            let chunk = self.chunk_len(src.len() - copied);
            let page = self.region.segments[self.iseg].page(self.page_idx);
            page.write(self.pageoff, &src[copied..copied + chunk]);
            self.advance(chunk);
            copied += chunk;
        }
    }

    /// Offload the fill to a DMA engine; returns the residual byte count
    /// the engine did not accept.  The cursor has advanced past the
    /// accepted prefix only: the caller memcpys the tail through
    /// [`copy_from_buf`](Self::copy_from_buf).
    pub(crate) fn dma_copy_from_buf(
        &mut self,
        engine: &dyn DmaEngine,
        src: &[u8],
        last_cookie: &mut Option<u64>,
    ) -> usize {
        let mut submitted = 0;
        while submitted < src.len() {
            let chunk = self.chunk_len(src.len() - submitted);
            let page = self.region.segments[self.iseg].page(self.page_idx);
            let outcome =
                engine.memcpy_to_page(&page, self.pageoff, &src[submitted..submitted + chunk]);
            if let Some(cookie) = outcome.cookie {
                *last_cookie = Some(cookie);
            }
            let accepted = chunk - outcome.residual;
            if accepted > 0 {
                self.advance(accepted);
                submitted += accepted;
            }
            if outcome.residual > 0 {
                break;
            }
        }
        src.len() - submitted
    }
}

/// Fill `data` into `region` at `region_offset` (CPU path).
pub(crate) fn fill_pages(
    region: &Arc<UserRegion>,
    region_offset: u64,
    data: &[u8],
) -> Result<(), OmxError> {
    let mut cache = OffsetCache::init(region, region_offset, data.len() as u64)?;
    cache.copy_from_buf(data);
    Ok(())
}

// ---------------------------------------------------------------------------
// Endpoint region table
// ---------------------------------------------------------------------------

/// Per-endpoint table of registered regions, read on the receive path.
pub(crate) struct RegionTable {
    slots: RwLock<Vec<Option<Arc<UserRegion>>>>,
}

impl RegionTable {
    pub(crate) fn new() -> Self {
        let mut slots = Vec::with_capacity(USER_REGION_MAX);
        slots.resize_with(USER_REGION_MAX, || None);
        Self {
            slots: RwLock::new(slots),
        }
    }

    pub(crate) fn insert(&self, region: Arc<UserRegion>) -> Result<(), OmxError> {
        let id = region.id() as usize;
        if id >= USER_REGION_MAX {
            return Err(OmxError::Invalid);
        }
        let mut slots = self.slots.write();
        if slots[id].is_some() {
            return Err(OmxError::Busy);
        }
        slots[id] = Some(region);
        Ok(())
    }

    /// Acquire the region registered under `id`.
    pub(crate) fn acquire(&self, id: u32) -> Option<Arc<UserRegion>> {
        self.slots.read().get(id as usize)?.clone()
    }

    pub(crate) fn remove(&self, id: u32) -> Option<Arc<UserRegion>> {
        self.slots.write().get_mut(id as usize)?.take()
    }

    pub(crate) fn clear(&self) {
        self.slots.write().iter_mut().for_each(|s| *s = None);
    }

    /// Snapshot of live regions (invalidation walks this).
    pub(crate) fn snapshot(&self) -> Vec<Arc<UserRegion>> {
        self.slots.read().iter().flatten().cloned().collect()
    }
}

/// Quiesce every region of `endpoint` intersecting the unmapped range.
pub(crate) fn invalidate_endpoint_regions(
    endpoint: &crate::endpoint::Endpoint,
    config: &OmxConfig,
    start: u64,
    end: u64,
) {
    for region in endpoint.regions.snapshot() {
        if region.intersects(start, end) {
            klog_debug!("invalidating region {} on unmap", region.id());
            region.invalidate(config);
        }
    }
}
