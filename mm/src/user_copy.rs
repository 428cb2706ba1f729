//! Copying between kernel buffers and user virtual ranges.
//!
//! The send paths read payload from user addresses (small sends, MediumVA
//! segments) and tests stand in for the user process when preparing source
//! buffers or checking pull sinks.  Both go through these two helpers,
//! which walk the page table a page at a time.

use crate::page::{PAGE_MASK, PAGE_SIZE};
use crate::vm::UserVm;
use crate::MmError;

/// Copy `buf.len()` bytes from the user range at `vaddr` into `buf`.
pub fn copy_from_user(vm: &UserVm, vaddr: u64, buf: &mut [u8]) -> Result<(), MmError> {
    let mut copied = 0usize;
    while copied < buf.len() {
        let cur = vaddr + copied as u64;
        let page_vaddr = cur & PAGE_MASK;
        let pgoff = (cur - page_vaddr) as usize;
        let chunk = (PAGE_SIZE - pgoff).min(buf.len() - copied);
        let page = vm.page_at(page_vaddr).ok_or(MmError::Fault)?;
        page.read(pgoff, &mut buf[copied..copied + chunk]);
        copied += chunk;
    }
    Ok(())
}

/// Copy `buf` into the user range at `vaddr`.
pub fn copy_to_user(vm: &UserVm, vaddr: u64, buf: &[u8]) -> Result<(), MmError> {
    let mut copied = 0usize;
    while copied < buf.len() {
        let cur = vaddr + copied as u64;
        let page_vaddr = cur & PAGE_MASK;
        let pgoff = (cur - page_vaddr) as usize;
        let chunk = (PAGE_SIZE - pgoff).min(buf.len() - copied);
        let page = vm.page_at(page_vaddr).ok_or(MmError::Fault)?;
        page.write(pgoff, &buf[copied..copied + chunk]);
        copied += chunk;
    }
    Ok(())
}
