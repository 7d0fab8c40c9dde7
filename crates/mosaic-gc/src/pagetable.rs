//! Region page table: a three level sparse map from address to [`PageState`].
//!
//! `region -> intermediate table -> leaf table of state bytes`. The bit fields
//! extracted at each level depend on the pointer width and page size and are
//! picked so that every table is one allocation. Branches are installed lazily
//! with a CAS and published with release ordering, so a page drawn from a
//! region is never visible to another thread before its branch is.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::page::PageState;

#[cfg(all(target_pointer_width = "64", not(feature = "small-page")))]
mod geometry {
    pub const LEAF_BITS: u32 = 16;
    pub const LEAF_SHIFT: u32 = 14;
    pub const MID_BITS: u32 = 16;
    pub const MID_SHIFT: u32 = 30;
    pub const REGION_BITS: u32 = 18;
    pub const REGION_SHIFT: u32 = 46;
}

#[cfg(all(target_pointer_width = "64", feature = "small-page"))]
mod geometry {
    pub const LEAF_BITS: u32 = 16;
    pub const LEAF_SHIFT: u32 = 12;
    pub const MID_BITS: u32 = 18;
    pub const MID_SHIFT: u32 = 28;
    pub const REGION_BITS: u32 = 18;
    pub const REGION_SHIFT: u32 = 46;
}

#[cfg(all(target_pointer_width = "32", not(feature = "small-page")))]
mod geometry {
    pub const LEAF_BITS: u32 = 8;
    pub const LEAF_SHIFT: u32 = 14;
    pub const MID_BITS: u32 = 10;
    pub const MID_SHIFT: u32 = 22;
    pub const REGION_BITS: u32 = 0;
    pub const REGION_SHIFT: u32 = 0;
}

#[cfg(all(target_pointer_width = "32", feature = "small-page"))]
mod geometry {
    pub const LEAF_BITS: u32 = 10;
    pub const LEAF_SHIFT: u32 = 12;
    pub const MID_BITS: u32 = 10;
    pub const MID_SHIFT: u32 = 22;
    pub const REGION_BITS: u32 = 0;
    pub const REGION_SHIFT: u32 = 0;
}

use geometry::{LEAF_BITS, LEAF_SHIFT, MID_BITS, MID_SHIFT, REGION_BITS, REGION_SHIFT};

const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const REGION_LEN: usize = 1 << REGION_BITS;

const _: () = assert!(LEAF_SHIFT as usize == crate::page::PAGE_LG2);

#[inline]
const fn leaf_index(addr: usize) -> usize {
    (addr >> LEAF_SHIFT) & (LEAF_LEN - 1)
}

#[inline]
const fn mid_index(addr: usize) -> usize {
    (addr >> MID_SHIFT) & (MID_LEN - 1)
}

#[inline]
const fn region_index(addr: usize) -> usize {
    (addr >> REGION_SHIFT) & (REGION_LEN - 1)
}

struct LeafTable {
    meta: Box<[AtomicU8]>,
}

impl LeafTable {
    fn new() -> Self {
        Self {
            meta: (0..LEAF_LEN).map(|_| AtomicU8::new(0)).collect(),
        }
    }
}

struct MidTable {
    leaves: Box<[AtomicPtr<LeafTable>]>,
}

impl MidTable {
    fn new() -> Self {
        Self {
            leaves: (0..MID_LEN)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
        }
    }
}

impl Drop for MidTable {
    fn drop(&mut self) {
        for leaf in &*self.leaves {
            let p = leaf.load(Ordering::Acquire);
            if !p.is_null() {
                // SAFETY: installed from `Box::into_raw` and never shared after drop.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

/// Installs a fresh `T` into `slot` unless one is already present.
fn install<T>(slot: &AtomicPtr<T>, make: impl FnOnce() -> T) -> *mut T {
    let cur = slot.load(Ordering::Acquire);
    if !cur.is_null() {
        return cur;
    }
    let fresh = Box::into_raw(Box::new(make()));
    match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => fresh,
        Err(winner) => {
            // SAFETY: `fresh` was never published.
            drop(unsafe { Box::from_raw(fresh) });
            winner
        }
    }
}

/// Sparse address-to-state map covering the whole address space.
pub(crate) struct PageTable {
    regions: Box<[AtomicPtr<MidTable>]>,
}

impl PageTable {
    pub(crate) fn new() -> Self {
        Self {
            regions: (0..REGION_LEN)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
        }
    }

    fn leaf(&self, addr: usize) -> Option<&LeafTable> {
        let mid = self.regions[region_index(addr)].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }
        // SAFETY: published tables live until the table itself is dropped.
        let mid = unsafe { &*mid };
        let leaf = mid.leaves[mid_index(addr)].load(Ordering::Acquire);
        // SAFETY: as above.
        unsafe { leaf.as_ref() }
    }

    /// Ensures the intermediate and leaf tables covering `addr` exist.
    pub(crate) fn maybe_create(&self, addr: usize) {
        let mid = install(&self.regions[region_index(addr)], MidTable::new);
        // SAFETY: `install` returns a published, live table.
        let mid = unsafe { &*mid };
        install(&mid.leaves[mid_index(addr)], LeafTable::new);
    }

    /// Records the state of the page containing `addr`.
    ///
    /// # Panics
    ///
    /// Panics if [`PageTable::maybe_create`] was never called for this page.
    pub(crate) fn set(&self, addr: usize, state: PageState) {
        let Some(leaf) = self.leaf(addr) else {
            panic!("page table branch missing for {addr:#x}");
        };
        leaf.meta[leaf_index(addr)].store(state as u8, Ordering::Release);
    }

    /// State of the page containing `addr`; `Unmapped` for unknown regions.
    pub(crate) fn get(&self, addr: usize) -> PageState {
        self.leaf(addr).map_or(PageState::Unmapped, |leaf| {
            PageState::from_u8(leaf.meta[leaf_index(addr)].load(Ordering::Acquire))
        })
    }

    /// Whether the page containing `addr` is currently owned by a pool.
    #[inline]
    pub(crate) fn is_set(&self, addr: usize) -> bool {
        self.get(addr) == PageState::Allocated
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for region in &*self.regions {
            let p = region.load(Ordering::Acquire);
            if !p.is_null() {
                // SAFETY: installed from `Box::into_raw`.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}
