//! User address space: mapping, pinning, unmap notifications.
//!
//! A [`UserVm`] models the address space of the process that opened an
//! endpoint.  Regions pin pages out of it with [`UserVm::get_user_pages`];
//! unmapping a range drops the backing pages and notifies registered
//! [`UnmapListener`]s, which is how region invalidation is driven (the
//! MMU-notifier role).
//!
//! # Concurrency
//!
//! The page table is behind a spin mutex; listeners are invoked *after*
//! the lock is dropped so a listener may call back into the VM.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::page::{PageFrame, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::MmError;

/// Notified when a mapped range goes away.
pub trait UnmapListener: Send + Sync {
    /// `start..end` (page-aligned) is being unmapped.
    fn invalidate_range(&self, start: u64, end: u64);
}

struct VmInner {
    /// Page-aligned virtual address -> backing frame.
    pages: BTreeMap<u64, Arc<PageFrame>>,
    listeners: Vec<Weak<dyn UnmapListener>>,
}

/// One user address space.
pub struct UserVm {
    inner: Mutex<VmInner>,
}

impl Default for UserVm {
    fn default() -> Self {
        Self::new()
    }
}

impl UserVm {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VmInner {
                pages: BTreeMap::new(),
                listeners: Vec::new(),
            }),
        }
    }

    /// Map `len` bytes at `vaddr`, allocating zeroed pages for every page
    /// the range touches.  Already-mapped pages are left in place.
    pub fn map(&self, vaddr: u64, len: usize) -> Result<(), MmError> {
        if len == 0 {
            return Err(MmError::Invalid);
        }
        let mut inner = self.inner.lock();
        let mut page_vaddr = vaddr & PAGE_MASK;
        let end = vaddr + len as u64;
        while page_vaddr < end {
            inner
                .pages
                .entry(page_vaddr)
                .or_insert_with(|| Arc::new(PageFrame::new()));
            page_vaddr += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Unmap every page the range touches and notify listeners.
    pub fn unmap(&self, vaddr: u64, len: usize) {
        let start = vaddr & PAGE_MASK;
        let end = vaddr + len as u64;
        let listeners = {
            let mut inner = self.inner.lock();
            let mut page_vaddr = start;
            while page_vaddr < end {
                inner.pages.remove(&page_vaddr);
                page_vaddr += PAGE_SIZE as u64;
            }
            inner.listeners.retain(|l| l.strong_count() > 0);
            inner.listeners.clone()
        };
        // Notify outside the lock so a listener may reenter the VM.
        for listener in listeners {
            if let Some(listener) = listener.upgrade() {
                listener.invalidate_range(start, end);
            }
        }
    }

    /// Register an unmap listener.
    pub fn register_unmap_listener(&self, listener: Weak<dyn UnmapListener>) {
        self.inner.lock().listeners.push(listener);
    }

    /// Pin `nr_pages` pages starting at the page-aligned `aligned_vaddr`.
    ///
    /// Returns the pinned frames; cloning the `Arc` is what pins.  Fails
    /// with `Fault` if any page in the range is not mapped (nothing is
    /// pinned in that case).
    pub fn get_user_pages(
        &self,
        aligned_vaddr: u64,
        nr_pages: usize,
    ) -> Result<Vec<Arc<PageFrame>>, MmError> {
        if aligned_vaddr & !PAGE_MASK != 0 {
            return Err(MmError::Invalid);
        }
        let inner = self.inner.lock();
        let mut pinned = Vec::with_capacity(nr_pages);
        for i in 0..nr_pages {
            let page_vaddr = aligned_vaddr + ((i as u64) << PAGE_SHIFT);
            match inner.pages.get(&page_vaddr) {
                Some(frame) => pinned.push(frame.clone()),
                None => return Err(MmError::Fault),
            }
        }
        Ok(pinned)
    }

    /// Whether the whole byte range is mapped.
    pub fn range_mapped(&self, vaddr: u64, len: usize) -> bool {
        let inner = self.inner.lock();
        let mut page_vaddr = vaddr & PAGE_MASK;
        let end = vaddr + len as u64;
        while page_vaddr < end {
            if !inner.pages.contains_key(&page_vaddr) {
                return false;
            }
            page_vaddr += PAGE_SIZE as u64;
        }
        true
    }

    pub(crate) fn page_at(&self, page_vaddr: u64) -> Option<Arc<PageFrame>> {
        self.inner.lock().pages.get(&page_vaddr).cloned()
    }
}
