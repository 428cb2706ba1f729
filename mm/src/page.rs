//! 4 KiB page frames.
//!
//! A [`PageFrame`] is the unit of pinning: a region segment holds an array
//! of `Arc<PageFrame>` clones, which is exactly what keeps the page alive
//! ("pinned") while packet paths read or fill it.  Content access goes
//! through a per-page spin mutex; the packet paths only ever touch a page
//! in bounded bursts, so contention is negligible and the accessors stay
//! free of raw-pointer aliasing concerns.

use spin::Mutex;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// One page of memory.
pub struct PageFrame {
    data: Mutex<Box<[u8; PAGE_SIZE]>>,
}

impl Default for PageFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl PageFrame {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    /// Copy `dst.len()` bytes out of the page starting at `pgoff`.
    ///
    /// # Panics
    /// If the range exceeds the page.
    pub fn read(&self, pgoff: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        dst.copy_from_slice(&data[pgoff..pgoff + dst.len()]);
    }

    /// Copy `src` into the page starting at `pgoff`.
    ///
    /// # Panics
    /// If the range exceeds the page.
    pub fn write(&self, pgoff: usize, src: &[u8]) {
        let mut data = self.data.lock();
        data[pgoff..pgoff + src.len()].copy_from_slice(src);
    }

    /// Zero the whole page.
    pub fn clear(&self) {
        self.data.lock().fill(0);
    }
}

impl core::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageFrame")
    }
}
