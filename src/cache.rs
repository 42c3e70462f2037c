//! A `SlabCache` that can allocate fixed size objects.

use arrayvec::ArrayString;
use log::{debug, error, info, log, trace, warn, Level};

use alloc::format;
use alloc::string::String;

use core::mem;
use core::ptr::NonNull;

use crate::page::{PageList, SlabPage};
use crate::{AllocationError, PageProvider, CACHE_NAME_MAX, HEADER_SIZE, PAGE_SIZE};

/// A slab cache allocates objects of a fixed size out of page-sized slabs.
///
/// It maintains three internal lists of `SlabPage`s:
///
///  * `partial`: slabs with at least one free slot. Allocation always takes
///    from the front, so the slab that most recently returned to the list
///    is reused first.
///  * `full`: slabs with no free slot, kept off the allocation path.
///  * `empty`: slabs with no outstanding object. By default a slab's page
///    goes back to the provider the instant its last object comes home;
///    with a nonzero retention budget up to that many empty slabs are kept
///    here for reuse instead.
///
/// On allocation we take from `partial`, falling back to a retained empty
/// slab and then to a fresh page from the provider. If a slab becomes full
/// after the allocation we move it from `partial` to `full`; on
/// deallocation a slab may move back from `full` to `partial`, or leave
/// the cache entirely once it empties.
///
/// Every mutation of the lists, of the slabs reachable from them, and every
/// page-provider call made on behalf of this cache happens under the
/// cache's own lock, so a cache can be shared freely between execution
/// contexts; operations on different caches never contend.
pub struct SlabCache<'a, P: PageProvider> {
    name: ArrayString<CACHE_NAME_MAX>,
    object_size: usize,
    obj_per_page: usize,
    empty_retained: usize,
    provider: &'a P,
    inner: spin::Mutex<CacheInner<'a>>,
}

struct CacheInner<'a> {
    partial: PageList<'a>,
    full: PageList<'a>,
    empty: PageList<'a>,
}

// The raw slab pointers inside the lists are exclusively owned by the
// cache and only ever touched under `inner`'s lock.
unsafe impl<'a, P: PageProvider + Sync> Send for SlabCache<'a, P> {}
unsafe impl<'a, P: PageProvider + Sync> Sync for SlabCache<'a, P> {}

impl<'a> CacheInner<'a> {
    /// Move a slab from `partial` to `full`.
    fn move_partial_to_full(&mut self, slab: &'a mut SlabPage<'a>) {
        let slab_ptr = slab as *const SlabPage<'a>;
        debug_assert!(self.partial.contains(slab_ptr));
        debug_assert!(!self.full.contains(slab_ptr));
        self.partial.remove_from_list(slab);
        self.full.insert_front(slab);
    }
}

impl<'a, P: PageProvider> SlabCache<'a, P> {
    /// Create a cache handing out `object_size`-byte objects backed by
    /// `provider`, with the default empty-slab policy: a slab's page is
    /// released the moment its last object is freed.
    ///
    /// Names longer than `CACHE_NAME_MAX` bytes are truncated. Fails with
    /// `InvalidObjectSize` when one page cannot hold at least one slot, or
    /// when a slot could not hold the free-list link word; a cache is
    /// never created in a partially-usable state.
    pub fn new(
        name: &str,
        object_size: usize,
        provider: &'a P,
    ) -> Result<SlabCache<'a, P>, AllocationError> {
        SlabCache::with_empty_retention(name, object_size, provider, 0)
    }

    /// Like [`SlabCache::new`], but keep up to `empty_retained` empty slabs
    /// cached for reuse instead of releasing their pages immediately.
    pub fn with_empty_retention(
        name: &str,
        object_size: usize,
        provider: &'a P,
        empty_retained: usize,
    ) -> Result<SlabCache<'a, P>, AllocationError> {
        if object_size < mem::size_of::<usize>() {
            return Err(AllocationError::InvalidObjectSize);
        }
        let obj_per_page = (PAGE_SIZE - HEADER_SIZE) / object_size;
        if obj_per_page == 0 {
            return Err(AllocationError::InvalidObjectSize);
        }

        let cache = SlabCache {
            name: bounded_name(name),
            object_size,
            obj_per_page,
            empty_retained,
            provider,
            inner: spin::Mutex::new(CacheInner {
                partial: PageList::new(),
                full: PageList::new(),
                empty: PageList::new(),
            }),
        };
        info!(
            "[SLAB] new cache {{ name: {}, object_size: {}, max objects per slab: {} }}",
            cache.name, object_size, obj_per_page
        );
        Ok(cache)
    }

    /// The cache's (possibly truncated) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fixed object size this cache serves.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Slots per slab for this object size.
    pub fn obj_per_page(&self) -> usize {
        self.obj_per_page
    }

    /// Number of slabs currently on the partial list.
    pub fn partial_slabs(&self) -> usize {
        self.inner.lock().partial.len()
    }

    /// Number of slabs currently on the full list.
    pub fn full_slabs(&self) -> usize {
        self.inner.lock().full.len()
    }

    /// Number of retained empty slabs.
    pub fn empty_slabs(&self) -> usize {
        self.inner.lock().empty.len()
    }

    /// Hand out one object slot.
    ///
    /// The returned memory is uninitialized except for its first word,
    /// which held the free-list link. `OutOfMemory` is returned when no
    /// owned slab has room and the provider cannot supply a fresh page;
    /// the caller decides whether to free, retry or give up.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocationError> {
        let mut inner = self.inner.lock();
        trace!("[SLAB] {}: alloc request", self.name);

        if let Some(slab) = inner.partial.front_mut() {
            let obj = slab
                .take_slot()
                .expect("slab on the partial list must have a free slot");
            if slab.is_full() {
                trace!("[SLAB] {}: move {:p} partial -> full", self.name, slab);
                inner.move_partial_to_full(slab);
            }
            trace!("[SLAB] {}: object {:p} allocated", self.name, obj);
            return Ok(obj);
        }

        if let Some(slab) = inner.empty.pop() {
            trace!("[SLAB] {}: reuse retained slab {:p}", self.name, slab);
            let obj = slab
                .take_slot()
                .expect("retained empty slab must have a free slot");
            if slab.is_full() {
                inner.full.insert_front(slab);
            } else {
                inner.partial.insert_front(slab);
            }
            trace!("[SLAB] {}: object {:p} allocated", self.name, obj);
            return Ok(obj);
        }

        // Grow. The provider call stays under the cache lock.
        let page = self.provider.acquire_page()?;
        // SAFETY: the provider contract gives us an exclusively owned,
        // page-aligned PAGE_SIZE block, and the capacity was validated at
        // cache creation.
        let slab = unsafe { SlabPage::init(page, self.object_size, self.obj_per_page) };
        debug!("[SLAB] {}: new slab {:p}", self.name, slab);
        let obj = slab
            .take_slot()
            .expect("fresh slab must have a free slot");
        if slab.is_full() {
            // A single-slot slab fills up on its first allocation.
            inner.full.insert_front(slab);
        } else {
            inner.partial.insert_front(slab);
        }
        trace!("[SLAB] {}: object {:p} allocated", self.name, obj);
        Ok(obj)
    }

    /// Give an object slot back.
    ///
    /// The owning slab is found by address-range containment, scanning the
    /// full list first: under churny workloads a freed object most often
    /// belongs to a recently filled slab. An address no slab contains is a
    /// caller bug (a foreign pointer, or a double free whose slab was
    /// already reclaimed); it is reported as `NotAllocated` and no state
    /// is touched.
    pub fn deallocate(&self, obj: NonNull<u8>) -> Result<(), AllocationError> {
        let addr = obj.as_ptr() as usize;
        let mut inner = self.inner.lock();
        trace!("[SLAB] {}: free request {:p}", self.name, obj);

        let mut was_full = false;
        let mut owner = None;
        for slab in inner.full.iter_mut() {
            if slab.contains(addr) {
                was_full = true;
                owner = Some(slab);
                break;
            }
        }
        if owner.is_none() {
            for slab in inner.partial.iter_mut() {
                if slab.contains(addr) {
                    owner = Some(slab);
                    break;
                }
            }
        }
        let slab = match owner {
            Some(slab) => slab,
            None => {
                error!("[SLAB] {}: free target {:p} not found", self.name, obj);
                return Err(AllocationError::NotAllocated);
            }
        };

        trace!("[SLAB] {}: free {:p} in slab {:p}", self.name, obj, slab);
        // SAFETY: `obj` lies within this slab; provenance beyond that is
        // the caller's contract.
        unsafe { slab.give_slot(obj) };

        if was_full {
            inner.full.remove_from_list(slab);
        }
        if slab.is_empty() {
            if !was_full {
                inner.partial.remove_from_list(slab);
            }
            if inner.empty.len() < self.empty_retained {
                trace!("[SLAB] {}: retain empty slab {:p}", self.name, slab);
                inner.empty.insert_front(slab);
            } else {
                self.release_slab(slab);
            }
        } else if was_full {
            trace!("[SLAB] {}: move {:p} full -> partial", self.name, slab);
            inner.partial.insert_front(slab);
        }
        Ok(())
    }

    /// Release every retained empty slab back to the page provider.
    pub fn reclaim(&self) {
        let mut inner = self.inner.lock();
        while let Some(slab) = inner.empty.pop() {
            self.release_slab(slab);
        }
    }

    /// Tear the cache down, releasing every slab it still owns back to the
    /// page provider. Outstanding objects become invalid; calling this is
    /// the owner's assertion that none remain.
    pub fn destroy(self) {
        // The actual work happens in Drop.
    }

    fn release_slab(&self, slab: &'a mut SlabPage<'a>) {
        debug_assert!(slab.is_empty());
        debug!(
            "[SLAB] {}: slab {:p} released to the page provider",
            self.name, slab
        );
        self.provider.release_page(NonNull::from(slab).cast::<u8>());
    }

    /// Log a human-readable dump of the cache: every partial slab (at info
    /// level), then every full slab (at debug level), each slot's address
    /// and the raw free-list interpretation of its first word.
    /// `obj_printer`, when supplied, additionally renders each slot as a
    /// client object.
    ///
    /// Read-only with respect to cache state; holds the cache lock for the
    /// duration, so it can run concurrently with allocation from other
    /// contexts.
    pub fn dump(&self, obj_printer: Option<&dyn Fn(NonNull<u8>) -> String>) {
        let mut inner = self.inner.lock();
        info!(
            "[SLAB] cache {{ name: {}, object_size: {}, partial: {}, full: {}, empty: {} }}",
            self.name,
            self.object_size,
            inner.partial.len(),
            inner.full.len(),
            inner.empty.len()
        );

        if inner.partial.len() > 0 {
            info!("[SLAB]  [ partial slabs ]");
            for slab in inner.partial.iter_mut() {
                self.dump_slab(slab, Level::Info, obj_printer);
            }
        }
        if inner.full.len() > 0 {
            debug!("[SLAB]  [ full slabs ]");
            for slab in inner.full.iter_mut() {
                self.dump_slab(slab, Level::Debug, obj_printer);
            }
        }
        info!("[SLAB] dump end");
    }

    fn dump_slab(
        &self,
        slab: &SlabPage<'a>,
        level: Level,
        obj_printer: Option<&dyn Fn(NonNull<u8>) -> String>,
    ) {
        log!(
            level,
            "[SLAB]   [ slab {:p} ] {{ freelist: {:p}, allocated: {} }}",
            slab,
            slab.freelist_head(),
            slab.allocated()
        );
        for idx in 0..self.obj_per_page {
            let addr = slab.slot_addr(idx, self.object_size);
            let link = slab.slot_link(idx, self.object_size);
            let mut line = format!(
                "[SLAB]    [ idx {} ] {{ addr: {:p}, as_ptr: {:#x}",
                idx, addr, link
            );
            if let Some(printer) = obj_printer {
                // SAFETY: slot addresses inside an owned slab are non-null.
                let obj = unsafe { NonNull::new_unchecked(addr as *mut u8) };
                line.push_str(&format!(", as_obj: {{{}}}", printer(obj)));
            }
            line.push_str(" }");
            log!(level, "{}", line);
        }
    }
}

impl<'a, P: PageProvider> Drop for SlabCache<'a, P> {
    fn drop(&mut self) {
        let provider = self.provider;
        let mut live = 0;
        let inner = self.inner.get_mut();
        while let Some(slab) = inner.full.pop() {
            live += slab.allocated();
            provider.release_page(NonNull::from(slab).cast::<u8>());
        }
        while let Some(slab) = inner.partial.pop() {
            live += slab.allocated();
            provider.release_page(NonNull::from(slab).cast::<u8>());
        }
        while let Some(slab) = inner.empty.pop() {
            provider.release_page(NonNull::from(slab).cast::<u8>());
        }
        if live > 0 {
            warn!(
                "[SLAB] {}: destroyed with {} live objects",
                self.name, live
            );
        }
        debug!("[SLAB] {}: destroyed", self.name);
    }
}

fn bounded_name(name: &str) -> ArrayString<CACHE_NAME_MAX> {
    let mut bounded = ArrayString::new();
    for c in name.chars() {
        if bounded.try_push(c).is_err() {
            break;
        }
    }
    bounded
}
