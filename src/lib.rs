//! A slab allocator for fixed-size objects, one page per slab.
//!
//! # Overview
//!
//! The organization is as follows:
//!
//!  * A `SlabCache` hands out objects of exactly one declared size.
//!    It keeps its slabs on intrusive membership lists (`partial` and
//!    `full`, plus an optional bounded `empty` reserve) and serializes
//!    all mutation behind one per-cache lock.
//!  * A `SlabPage` is one page-sized block whose header is stored in
//!    place at the start of the block, with an intrusive free list
//!    threaded through the unused slots.
//!  * A trait `PageProvider` defines the page-granularity allocator the
//!    caches sit on top of.
//!
//! Lastly, it provides a default `PageProvider` implementation `PagePool`:
//! a recycling pool of donated page blocks, with `GLOBAL_PAGE_POOL` as a
//! process-wide shared instance.
#![no_std]

mod cache;
mod page;
mod pool;

pub use cache::SlabCache;
pub use page::{SlabPage, HEADER_SIZE};
pub use pool::{PagePool, GLOBAL_PAGE_POOL};

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;


use core::ptr::NonNull;

/// Size in bytes of the page blocks this allocator is built on.
pub const PAGE_SIZE: usize = 4096;

/// Maximum length in bytes of a cache name; longer names are truncated.
pub const CACHE_NAME_MAX: usize = 32;

/// Error that can be returned for `allocation` and `deallocation` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// The page provider could not supply a page (you may be able to free
    /// objects, or donate pages to the pool, and retry).
    OutOfMemory,
    /// The object size leaves no room for a single slot in one page, or is
    /// too small to hold the free-list link word.
    InvalidObjectSize,
    /// The pointer does not belong to any slab of this cache.
    NotAllocated,
}

/// A page-granularity allocator supplying the blocks that back slabs.
///
/// # Safety
///
/// `acquire_page` must hand out blocks that are page-aligned, `PAGE_SIZE`
/// bytes long, and exclusively owned by the caller until given back through
/// `release_page`.
pub unsafe trait PageProvider {
    /// Hand out one page-aligned, page-sized block.
    fn acquire_page(&self) -> Result<NonNull<u8>, AllocationError>;

    /// Take back a block previously returned by `acquire_page`.
    fn release_page(&self, page: NonNull<u8>);
}
