//! Thread heaps and size-class pools.
//!
//! Every mutator owns a [`ThreadHeap`] with one [`Pool`] per size class.
//! A pool serves blocks from its free list first and otherwise bump-allocates
//! through its current fresh page. Pages a pool takes are pushed on the
//! heap's `pages_allocd` stack, which is what the sweep walks.
//!
//! Objects above [`MAX_SZCLASS`] become big objects on the heap's young
//! big-object list.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::bigval::{BigList, BigVal};
use crate::error::GcError;
use crate::object::ObjectRef;
use crate::page::{
    page_base, page_metadata, PageRef, PageState, FL_EMPTY, GC_CLEAN, MAX_SZCLASS, PAGE_OFFSET,
    PAGE_SZ, TAG_RESERVED_BITS, TAG_SIZE,
};
use crate::page_stack::PaddedPageStack;
use crate::pages::PageAllocator;
use crate::roots::ShadowStack;
use crate::stack_pool::StackPool;

// ===== Size classes =====

/// Block sizes of the pools, tag word included. All are multiples of 16.
pub const SIZE_CLASSES: [u16; N_POOLS] = [
    16, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, //
    272, 288, 304, 336, 368, 400, 448, 496, 544, 576, 624, 672, 736, 816, 896, 1008, //
    1088, 1168, 1248, 1360, 1488, 1632, 1808, 2032,
];

/// Number of pools per heap.
pub const N_POOLS: usize = 40;

const _: () = assert!(SIZE_CLASSES[N_POOLS - 1] as usize == MAX_SZCLASS);

/// Pool serving a block of `alloc_size` bytes (tag word included), or `None`
/// if the request needs a big object.
#[must_use]
pub fn size_class_index(alloc_size: usize) -> Option<usize> {
    if alloc_size > MAX_SZCLASS {
        return None;
    }
    Some(SIZE_CLASSES.partition_point(|&c| usize::from(c) < alloc_size))
}

/// Builds a fresh tag word.
#[inline]
pub(crate) const fn make_tag(type_tag: usize) -> usize {
    (type_tag << TAG_RESERVED_BITS) | GC_CLEAN
}

// ===== Pools =====

/// Allocation state of one size class.
///
/// `freelist` and `newpages` hold tag-word addresses. A free block stores the
/// address of the next free block in its tag word.
#[derive(Debug)]
pub(crate) struct Pool {
    pub(crate) freelist: *mut u8,
    pub(crate) newpages: *mut u8,
    pub(crate) osize: usize,
}

impl Pool {
    const fn new(osize: usize) -> Self {
        Self {
            freelist: ptr::null_mut(),
            newpages: ptr::null_mut(),
            osize,
        }
    }
}

#[inline]
unsafe fn read_next(block: *mut u8) -> *mut u8 {
    // SAFETY: free blocks store a pointer-sized link in their tag word.
    unsafe { block.cast::<*mut u8>().read() }
}

#[inline]
unsafe fn write_next(block: *mut u8, next: *mut u8) {
    // SAFETY: see `read_next`.
    unsafe { block.cast::<*mut u8>().write(next) }
}

// ===== Thread heap =====

/// State only the owning mutator touches between collections. The collector
/// takes the lock while the world is stopped.
#[derive(Debug)]
pub(crate) struct HeapLocal {
    pub(crate) pools: [Pool; N_POOLS],
    pub(crate) young_bigvals: BigList,
    /// Old objects that gained references to young ones.
    pub(crate) remset: Vec<ObjectRef>,
    pub(crate) roots: ShadowStack,
}

// SAFETY: raw pool pointers refer to pages owned by this heap; access is
// serialized by the surrounding mutex.
unsafe impl Send for HeapLocal {}

/// Per-mutator heap.
#[derive(Debug)]
pub(crate) struct ThreadHeap {
    pub(crate) index: usize,
    pub(crate) pages_allocd: PaddedPageStack,
    pub(crate) pages_buffered: PaddedPageStack,
    pub(crate) local: Mutex<HeapLocal>,
    pub(crate) stacks: Mutex<StackPool>,
    /// Cleared when the owning mutator exits so the slot can be reused.
    pub(crate) in_use: AtomicBool,
}

impl ThreadHeap {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            pages_allocd: PaddedPageStack::new(),
            pages_buffered: PaddedPageStack::new(),
            local: Mutex::new(HeapLocal::new()),
            stacks: Mutex::new(StackPool::new()),
            in_use: AtomicBool::new(true),
        }
    }
}

impl HeapLocal {
    pub(crate) fn new() -> Self {
        Self {
            pools: std::array::from_fn(|i| Pool::new(usize::from(SIZE_CLASSES[i]))),
            young_bigvals: BigList::new(),
            remset: Vec::new(),
            roots: ShadowStack::new(),
        }
    }

    /// Allocates a zeroed block from pool `pool_n`.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] when no page can be obtained.
    pub(crate) fn pool_alloc(
        &mut self,
        heap: &ThreadHeap,
        pages: &PageAllocator,
        pool_n: usize,
        type_tag: usize,
        max_pop_attempts: u32,
    ) -> Result<ObjectRef, GcError> {
        let osize = self.pools[pool_n].osize;
        let block = match self.take_free(pool_n) {
            Some(block) => block,
            None => self.bump(heap, pages, pool_n, max_pop_attempts)?,
        };
        // SAFETY: `block` is a free block of `osize` bytes on an allocated page.
        unsafe {
            ptr::write_bytes(block.add(TAG_SIZE), 0, osize - TAG_SIZE);
            block.cast::<usize>().write(make_tag(type_tag));
        }
        pages.status.add_heap_size(osize);
        // SAFETY: the payload address is non-null.
        Ok(ObjectRef::from_non_null(unsafe {
            ptr::NonNull::new_unchecked(block.add(TAG_SIZE))
        }))
    }

    /// Whether the next allocation from `pool_n` has to take a new page.
    pub(crate) fn needs_page(&self, pool_n: usize) -> bool {
        let pool = &self.pools[pool_n];
        pool.freelist.is_null() && !bump_fits(pool.newpages, pool.osize)
    }

    fn take_free(&mut self, pool_n: usize) -> Option<*mut u8> {
        let pool = &mut self.pools[pool_n];
        let block = pool.freelist;
        if block.is_null() {
            return None;
        }
        // SAFETY: free-list entries are free blocks on allocated pages.
        let next = unsafe { read_next(block) };
        pool.freelist = next;
        if page_base(block as usize) != page_base(next as usize) {
            // Leaving this page: it has no free blocks left and now holds
            // young objects.
            // SAFETY: `block` lies on an allocated page.
            let pg = unsafe { page_metadata(block as usize) };
            pg.nfree.store(0, Ordering::Relaxed);
            pg.has_young.store(true, Ordering::Relaxed);
        }
        Some(block)
    }

    fn bump(
        &mut self,
        heap: &ThreadHeap,
        pages: &PageAllocator,
        pool_n: usize,
        max_pop_attempts: u32,
    ) -> Result<*mut u8, GcError> {
        let pool = &mut self.pools[pool_n];
        let osize = pool.osize;
        let mut block = pool.newpages;
        if !bump_fits(block, osize) {
            if !block.is_null() {
                // SAFETY: the previous page is still allocated to this pool.
                let pg = unsafe { page_metadata(block as usize - 1) };
                pg.nfree.store(0, Ordering::Relaxed);
                pg.has_young.store(true, Ordering::Relaxed);
            }
            let pg = match heap.pages_buffered.try_pop(max_pop_attempts) {
                Some(pg) => {
                    pages.table.set(pg.data() as usize, PageState::Allocated);
                    pg
                }
                None => pages.alloc_page()?,
            };
            block = Self::add_page(heap, pg, osize, pool_n);
        }
        pool.newpages = block.wrapping_add(osize);
        Ok(block)
    }

    fn add_page(heap: &ThreadHeap, pg: PageRef, osize: usize, pool_n: usize) -> *mut u8 {
        let first = pg.reset(osize, pool_n, heap.index);
        // SAFETY: the page was just handed to us in the `Allocated` state.
        unsafe { pg.stamp() };
        heap.pages_allocd.push(pg);
        first
    }

    /// Allocates a zeroed big object with `payload` bytes.
    ///
    /// # Errors
    ///
    /// See [`BigVal::alloc`].
    pub(crate) fn big_alloc(
        &mut self,
        pages: &PageAllocator,
        payload: usize,
        type_tag: usize,
    ) -> Result<ObjectRef, GcError> {
        let node = BigVal::alloc(payload, make_tag(type_tag))?;
        // SAFETY: fresh allocation.
        let (obj, size) = unsafe { ((*node).payload(), (*node).size()) };
        self.young_bigvals.push(node);
        pages.status.add_heap_size(size);
        Ok(obj)
    }

    /// Publishes the allocation state of every pool to its page metadata so
    /// the sweep sees accurate counts, then detaches the pools from their
    /// pages. Returns where each pool's bump pointer stood.
    pub(crate) fn prepare_sweep(&mut self) -> [usize; N_POOLS] {
        let mut newpages = [0; N_POOLS];
        for (i, pool) in self.pools.iter_mut().enumerate() {
            let last = pool.freelist;
            if !last.is_null() {
                // SAFETY: a non-empty free list lives on allocated pages.
                let pg = unsafe { page_metadata(last as usize) };
                // SAFETY: as above.
                unsafe { sync_nfree(pg, last) };
                pg.has_young.store(true, Ordering::Relaxed);
            }
            pool.freelist = ptr::null_mut();

            let last = pool.newpages;
            if !last.is_null() {
                let base = page_base(last as usize - 1);
                // SAFETY: the bump page is allocated to this pool.
                let pg = unsafe { page_metadata(base) };
                debug_assert!(last as usize - base >= PAGE_OFFSET);
                let nfree = (base + PAGE_SZ - last as usize) / pool.osize;
                #[allow(clippy::cast_possible_truncation)]
                pg.nfree.store(nfree as u16, Ordering::Relaxed);
                pg.has_young.store(true, Ordering::Relaxed);
            }
            newpages[i] = last as usize;
            pool.newpages = ptr::null_mut();
        }
        newpages
    }

    /// Rebuilds the pool free lists from the swept pages of `heap`.
    ///
    /// Must run while no other thread touches `heap.pages_allocd`.
    pub(crate) fn merge_freelists(&mut self, heap: &ThreadHeap) {
        let mut tails: [*mut u8; N_POOLS] = [ptr::null_mut(); N_POOLS];
        for pg in heap.pages_allocd.iter() {
            let begin = pg.fl_begin_offset.load(Ordering::Relaxed);
            if begin == FL_EMPTY {
                continue;
            }
            let end = pg.fl_end_offset.load(Ordering::Relaxed);
            let data = pg.data();
            // SAFETY: offsets recorded by the sweep lie inside the page.
            let (fl_begin, fl_end) =
                unsafe { (data.add(usize::from(begin)), data.add(usize::from(end))) };
            let pool_n = usize::from(pg.pool_n.load(Ordering::Relaxed));
            let tail = tails[pool_n];
            if tail.is_null() {
                self.pools[pool_n].freelist = fl_begin;
            } else {
                // SAFETY: `tail` is the last free block of an earlier page.
                unsafe { write_next(tail, fl_begin) };
            }
            tails[pool_n] = fl_end;
        }
        for tail in tails {
            if !tail.is_null() {
                // SAFETY: as above.
                unsafe { write_next(tail, ptr::null_mut()) };
            }
        }
    }

    /// Free blocks currently on pool `pool_n`'s free list.
    #[cfg(test)]
    pub(crate) fn freelist_len(&self, pool_n: usize) -> usize {
        let mut n = 0;
        let mut cur = self.pools[pool_n].freelist;
        while !cur.is_null() {
            n += 1;
            // SAFETY: free-list entries are free blocks.
            cur = unsafe { read_next(cur) };
        }
        n
    }
}

/// Whether a block of `osize` fits between the bump pointer and the end of
/// its page. `newpages` may sit one past the end of its page, so the page is
/// probed at `newpages - 1`.
fn bump_fits(newpages: *mut u8, osize: usize) -> bool {
    !newpages.is_null()
        && newpages as usize + osize <= page_base(newpages as usize - 1) + PAGE_SZ
}

/// Recounts `pg.nfree` from the part of a free list still on that page.
///
/// # Safety
///
/// `last` must be the head of a free list whose first entry lies on `pg`.
unsafe fn sync_nfree(pg: PageRef, last: *mut u8) {
    let begin = pg.fl_begin_offset.load(Ordering::Relaxed);
    debug_assert_ne!(begin, FL_EMPTY);
    let base = page_base(last as usize);
    if last as usize == base + usize::from(begin) {
        // Nothing was taken from this page.
        return;
    }
    let mut nfree: u16 = 0;
    let mut cur = last;
    while !cur.is_null() && page_base(cur as usize) == base {
        nfree += 1;
        // SAFETY: free-list entries are free blocks.
        cur = unsafe { read_next(cur) };
    }
    pg.nfree.store(nfree, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::blocks_per_page;

    #[test]
    fn size_classes_are_sorted_multiples_of_16() {
        assert!(SIZE_CLASSES.windows(2).all(|w| w[0] < w[1]));
        assert!(SIZE_CLASSES.iter().all(|&c| c % 16 == 0));
    }

    #[test]
    fn size_class_lookup() {
        assert_eq!(size_class_index(1), Some(0));
        assert_eq!(size_class_index(16), Some(0));
        assert_eq!(size_class_index(17), Some(1));
        assert_eq!(size_class_index(64), Some(3));
        assert_eq!(size_class_index(2032), Some(N_POOLS - 1));
        assert_eq!(size_class_index(2033), None);
        for size in 1..=MAX_SZCLASS {
            let i = size_class_index(size).expect("pool");
            assert!(usize::from(SIZE_CLASSES[i]) >= size);
            if i > 0 {
                assert!(usize::from(SIZE_CLASSES[i - 1]) < size);
            }
        }
    }

    #[test]
    fn bump_allocation_fills_a_page_then_takes_another() {
        let pages = PageAllocator::new(4, 0);
        let heap = ThreadHeap::new(0);
        let mut local = heap.local.lock();
        let pool_n = size_class_index(64).expect("pool");
        let per_page = blocks_per_page(64);

        let mut objs = Vec::new();
        for _ in 0..per_page {
            objs.push(local.pool_alloc(&heap, &pages, pool_n, 3, 8).expect("alloc"));
        }
        assert_eq!(heap.pages_allocd.iter().count(), 1);
        let first_page = page_base(objs[0].as_ptr() as usize);
        assert!(objs.iter().all(|o| page_base(o.as_ptr() as usize) == first_page));
        assert!(objs.iter().all(|o| o.type_tag() == 3 && o.gc_bits() == GC_CLEAN));

        assert!(local.needs_page(pool_n));
        let next = local.pool_alloc(&heap, &pages, pool_n, 3, 8).expect("alloc");
        assert!(!local.needs_page(pool_n));
        assert_ne!(page_base(next.as_ptr() as usize), first_page);
        assert_eq!(heap.pages_allocd.iter().count(), 2);
        // SAFETY: the first page is allocated.
        let pg = unsafe { page_metadata(first_page) };
        assert_eq!(pg.nfree.load(Ordering::Relaxed), 0);
        assert!(pg.has_young.load(Ordering::Relaxed));
        assert_eq!(pages.status.heap_size(), (per_page + 1) * 64);
    }

    #[test]
    fn payloads_are_zeroed_and_aligned() {
        let pages = PageAllocator::new(4, 0);
        let heap = ThreadHeap::new(0);
        let mut local = heap.local.lock();
        let obj = local.pool_alloc(&heap, &pages, 2, 0, 8).expect("alloc");
        assert_eq!(obj.as_ptr() as usize % 16, 0);
        unsafe {
            assert_eq!(obj.load_slot(0), None);
            assert_eq!(obj.load_slot(4), None);
        }
    }

    #[test]
    fn big_alloc_tracks_heap_size() {
        let pages = PageAllocator::new(4, 0);
        let heap = ThreadHeap::new(0);
        let mut local = heap.local.lock();
        let obj = local.big_alloc(&pages, 10_000, 9).expect("alloc");
        assert_eq!(obj.type_tag(), 9);
        assert_eq!(local.young_bigvals.len(), 1);
        assert_eq!(pages.status.heap_size(), local.young_bigvals.bytes());
    }

    #[test]
    fn prepare_sweep_records_remaining_bump_space() {
        let pages = PageAllocator::new(4, 0);
        let heap = ThreadHeap::new(0);
        let mut local = heap.local.lock();
        let pool_n = size_class_index(128).expect("pool");
        for _ in 0..3 {
            local.pool_alloc(&heap, &pages, pool_n, 0, 8).expect("alloc");
        }
        let newpages = local.prepare_sweep();

        assert_ne!(newpages[pool_n], 0);
        assert!(local.pools[pool_n].newpages.is_null());
        let pg = heap.pages_allocd.iter().next().expect("page");
        assert_eq!(
            usize::from(pg.nfree.load(Ordering::Relaxed)),
            (PAGE_SZ - PAGE_OFFSET - 3 * 128) / 128
        );
        assert!(pg.has_young.load(Ordering::Relaxed));
    }
}
