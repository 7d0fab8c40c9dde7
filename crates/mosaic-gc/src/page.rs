//! Page geometry, per-page metadata and tag-word helpers.
//!
//! A page is `PAGE_SZ` bytes. Its first word holds a pointer to the page's
//! [`PageMeta`]; blocks start at `PAGE_OFFSET` so that the data following each
//! block's tag word is 16-byte aligned.
//!
//! ```text
//! +------------+---------+---------+---------+-----+
//! | meta ptr   | tag|obj | tag|obj | tag|obj | ... |
//! +------------+---------+---------+---------+-----+
//! 0            PAGE_OFFSET
//! ```

use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU8, AtomicUsize, Ordering};

// ===== Geometry =====

/// log2 of the page size.
#[cfg(not(feature = "small-page"))]
pub const PAGE_LG2: usize = 14;
/// log2 of the page size.
#[cfg(feature = "small-page")]
pub const PAGE_LG2: usize = 12;

/// Size of one heap page in bytes.
pub const PAGE_SZ: usize = 1 << PAGE_LG2;

/// Size of the tag word preceding every object.
pub const TAG_SIZE: usize = std::mem::size_of::<usize>();

/// Offset of the first block in a page.
pub const PAGE_OFFSET: usize = 16 - (TAG_SIZE % 16);

/// Largest block (tag word included) served from pools.
pub const MAX_SZCLASS: usize = 2032;

/// Free-list offset marking an empty page free list.
pub const FL_EMPTY: u16 = u16::MAX;

const _: () = assert!(PAGE_SZ <= u16::MAX as usize);
const _: () = assert!(PAGE_OFFSET >= std::mem::size_of::<usize>());

/// Returns the base address of the page containing `addr`.
#[inline]
#[must_use]
pub const fn page_base(addr: usize) -> usize {
    addr & !(PAGE_SZ - 1)
}

/// Number of `osize` blocks that fit in one page.
#[inline]
#[must_use]
pub const fn blocks_per_page(osize: usize) -> usize {
    (PAGE_SZ - PAGE_OFFSET) / osize
}

// ===== GC bits =====

/// Unmarked, young.
pub const GC_CLEAN: usize = 0;
/// Marked, young.
pub const GC_MARKED: usize = 1;
/// Unmarked, old.
pub const GC_OLD: usize = 2;
/// Marked, old. Sticky across quick collections.
pub const GC_OLD_MARKED: usize = GC_OLD | GC_MARKED;

pub(crate) const GC_BITS_MASK: usize = 3;

/// Bits of the tag word reserved for the collector.
pub const TAG_RESERVED_BITS: u32 = 4;

/// Largest host type tag that fits above the reserved bits.
pub const MAX_TYPE_TAG: usize = usize::MAX >> TAG_RESERVED_BITS;

/// Tag word of the big-object list sentinel. No live object can carry it:
/// bits 2 and 3 are never set on objects.
pub(crate) const SENTINEL_TAG: usize = usize::MAX;

#[inline]
pub(crate) const fn gc_marked(bits: usize) -> bool {
    bits & GC_MARKED != 0
}

#[inline]
pub(crate) const fn gc_old(bits: usize) -> bool {
    bits & GC_OLD != 0
}

/// Returns the tag word belonging to the object at `obj`.
///
/// # Safety
///
/// `obj` must point just past a tag word owned by the collector.
#[inline]
pub(crate) unsafe fn tag_word<'a>(obj: *const u8) -> &'a AtomicUsize {
    // SAFETY: the caller guarantees a tag word precedes `obj`; it is word aligned.
    unsafe { &*obj.sub(TAG_SIZE).cast::<AtomicUsize>() }
}

// ===== Allocation state =====

/// Allocation state of a page as recorded in the page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Never handed out, or not a heap page at all.
    Unmapped = 0,
    /// Owned by a pool.
    Allocated = 1,
    /// Free but still resident; reusable immediately.
    LazilyFreed = 2,
    /// Physical memory returned to the OS.
    Freed = 3,
}

impl PageState {
    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Allocated,
            2 => Self::LazilyFreed,
            3 => Self::Freed,
            _ => Self::Unmapped,
        }
    }
}

// ===== Page metadata =====

/// Bookkeeping for one page.
///
/// Every field except `data` is atomic so that `&PageMeta` can be shared
/// between the owning pool, the mark workers (which bump `nold`/flags) and
/// the page stacks. Outside of marking a page is owned by exactly one list
/// or stack at a time and the relaxed orderings are enough.
#[repr(C)]
pub(crate) struct PageMeta {
    pub(crate) next: AtomicPtr<PageMeta>,
    pub(crate) pool_n: AtomicU8,
    pub(crate) has_marked: AtomicBool,
    pub(crate) has_young: AtomicBool,
    pub(crate) nold: AtomicU16,
    pub(crate) prev_nold: AtomicU16,
    pub(crate) nfree: AtomicU16,
    pub(crate) osize: AtomicU16,
    pub(crate) fl_begin_offset: AtomicU16,
    pub(crate) fl_end_offset: AtomicU16,
    pub(crate) thread_n: AtomicU16,
    data: *mut u8,
}

// SAFETY: `data` is written once before the metadata is published and never
// changes afterwards; every other field is atomic.
unsafe impl Send for PageMeta {}
unsafe impl Sync for PageMeta {}

impl PageMeta {
    pub(crate) const fn new(data: *mut u8) -> Self {
        Self {
            next: AtomicPtr::new(std::ptr::null_mut()),
            pool_n: AtomicU8::new(0),
            has_marked: AtomicBool::new(false),
            has_young: AtomicBool::new(false),
            nold: AtomicU16::new(0),
            prev_nold: AtomicU16::new(0),
            nfree: AtomicU16::new(0),
            osize: AtomicU16::new(0),
            fl_begin_offset: AtomicU16::new(FL_EMPTY),
            fl_end_offset: AtomicU16::new(FL_EMPTY),
            thread_n: AtomicU16::new(0),
            data,
        }
    }

    /// Start of the page.
    #[inline]
    pub(crate) const fn data(&self) -> *mut u8 {
        self.data
    }

    #[inline]
    pub(crate) fn osize(&self) -> usize {
        usize::from(self.osize.load(Ordering::Relaxed))
    }

    /// Reinitialises the page for pool `pool_n` of heap `thread_n` and
    /// returns the first block.
    pub(crate) fn reset(&self, osize: usize, pool_n: usize, thread_n: usize) -> *mut u8 {
        debug_assert!(osize <= MAX_SZCLASS);
        #[allow(clippy::cast_possible_truncation)]
        {
            self.osize.store(osize as u16, Ordering::Relaxed);
            self.pool_n.store(pool_n as u8, Ordering::Relaxed);
            self.thread_n.store(thread_n as u16, Ordering::Relaxed);
            self.nfree.store(blocks_per_page(osize) as u16, Ordering::Relaxed);
        }
        self.has_marked.store(false, Ordering::Relaxed);
        self.has_young.store(false, Ordering::Relaxed);
        self.nold.store(0, Ordering::Relaxed);
        self.prev_nold.store(0, Ordering::Relaxed);
        self.fl_begin_offset.store(FL_EMPTY, Ordering::Relaxed);
        self.fl_end_offset.store(FL_EMPTY, Ordering::Relaxed);
        // SAFETY: PAGE_OFFSET < PAGE_SZ.
        unsafe { self.data.add(PAGE_OFFSET) }
    }

    /// Stores the back-pointer to this metadata at the page base.
    ///
    /// # Safety
    ///
    /// The page must be mapped, committed and owned by the caller.
    pub(crate) unsafe fn stamp(&self) {
        // SAFETY: the page base is word aligned and writable per the contract.
        unsafe {
            self.data
                .cast::<*const Self>()
                .write(std::ptr::from_ref(self));
        }
    }
}

impl std::fmt::Debug for PageMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageMeta")
            .field("data", &self.data)
            .field("osize", &self.osize())
            .field("nfree", &self.nfree.load(Ordering::Relaxed))
            .field("nold", &self.nold.load(Ordering::Relaxed))
            .field("prev_nold", &self.prev_nold.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Reads the metadata back-pointer stored at the base of `addr`'s page.
///
/// # Safety
///
/// The page containing `addr` must be `Allocated` in the page table.
#[inline]
pub(crate) unsafe fn page_metadata(addr: usize) -> PageRef {
    // SAFETY: allocated pages always carry a valid back-pointer.
    unsafe {
        let meta = *(page_base(addr) as *const *mut PageMeta);
        PageRef::from_raw(meta)
    }
}

/// Copyable handle to a [`PageMeta`].
///
/// Metadata lives in boxed slices owned by the page allocator and is never
/// freed while the collector exists, so the handle stays valid for the
/// collector's lifetime.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageRef(NonNull<PageMeta>);

// SAFETY: points at `Sync` metadata that outlives every handle.
unsafe impl Send for PageRef {}
unsafe impl Sync for PageRef {}

impl PageRef {
    pub(crate) fn new(meta: &PageMeta) -> Self {
        Self(NonNull::from(meta))
    }

    /// # Safety
    ///
    /// `ptr` must be non-null and point at metadata owned by a live allocator.
    pub(crate) const unsafe fn from_raw(ptr: *mut PageMeta) -> Self {
        // SAFETY: forwarded to the caller.
        Self(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub(crate) const fn as_ptr(self) -> *mut PageMeta {
        self.0.as_ptr()
    }
}

impl Deref for PageRef {
    type Target = PageMeta;

    fn deref(&self) -> &PageMeta {
        // SAFETY: see the type-level invariant.
        unsafe { self.0.as_ref() }
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PageRef").field(&self.0).finish()
    }
}
