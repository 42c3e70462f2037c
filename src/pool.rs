//! A recycling pool of page blocks, usable as the `PageProvider` behind
//! any number of caches.

use alloc::collections::VecDeque;
use lazy_static::lazy_static;
use log::trace;

use core::ptr::NonNull;

use crate::{AllocationError, PageProvider, PAGE_SIZE};

/// A `PageProvider` over a pool of donated page blocks.
///
/// The pool hands out pages in FIFO order and takes released pages back
/// for reuse; it never maps or unmaps memory itself. Exhaustion surfaces
/// as `OutOfMemory` from `acquire_page`, at which point the owner can
/// donate more blocks and the failed caller can retry.
///
/// Page addresses are stored as plain integers, so the pool can be shared
/// between execution contexts behind its own lock.
pub struct PagePool {
    pages: spin::Mutex<VecDeque<usize>>,
}

impl PagePool {
    pub fn new() -> PagePool {
        PagePool {
            pages: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Donate a page block to the pool.
    ///
    /// # Safety
    ///
    /// `page` must be page-aligned, `PAGE_SIZE` bytes long, and exclusively
    /// owned; ownership transfers to the pool.
    pub unsafe fn donate(&self, page: NonNull<u8>) {
        assert_eq!(
            page.as_ptr() as usize % PAGE_SIZE,
            0,
            "Donated page is not aligned to page-size."
        );
        self.pages.lock().push_back(page.as_ptr() as usize);
    }

    /// Number of page blocks currently available.
    pub fn available(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Default for PagePool {
    fn default() -> PagePool {
        PagePool::new()
    }
}

unsafe impl PageProvider for PagePool {
    fn acquire_page(&self) -> Result<NonNull<u8>, AllocationError> {
        match self.pages.lock().pop_front() {
            Some(addr) => {
                trace!("[SLAB] page pool: acquire {:#x}", addr);
                // SAFETY: only non-null addresses are ever donated.
                Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
            }
            None => Err(AllocationError::OutOfMemory),
        }
    }

    fn release_page(&self, page: NonNull<u8>) {
        trace!("[SLAB] page pool: release {:p}", page);
        self.pages.lock().push_back(page.as_ptr() as usize);
    }
}

lazy_static! {
    /// Shared pool for callers that want one process-wide page reservoir.
    pub static ref GLOBAL_PAGE_POOL: PagePool = PagePool::new();
}
