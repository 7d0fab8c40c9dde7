//! The page allocator.
//!
//! Pages come from large anonymous mappings ("blocks"). Once mapped a page
//! is never unmapped while the collector lives; it only cycles through the
//! page table states:
//!
//! ```text
//!            alloc_page                 sweep                  free_pages
//! clean ─────────────────▶ Allocated ─────────▶ LazilyFreed ──────────────▶ Freed
//!                              ▲                     │                       │
//!                              └──── alloc_page ─────┴────── alloc_page ─────┘
//! ```
//!
//! Reuse order on allocation is lazily freed, then clean, then freed
//! (which has to be recommitted), and only then a new mapping.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::error::GcError;
use crate::page::{PageMeta, PageRef, PageState, PAGE_SZ};
use crate::page_stack::PaddedPageStack;
use crate::pagetable::PageTable;

/// Process-visible heap counters, updated atomically.
#[derive(Debug)]
pub struct HeapStatus {
    pub(crate) bytes_mapped: AtomicUsize,
    pub(crate) bytes_resident: AtomicUsize,
    pub(crate) heap_size: AtomicUsize,
    pub(crate) heap_target: AtomicUsize,
}

impl HeapStatus {
    pub(crate) const fn new(heap_target: usize) -> Self {
        Self {
            bytes_mapped: AtomicUsize::new(0),
            bytes_resident: AtomicUsize::new(0),
            heap_size: AtomicUsize::new(0),
            heap_target: AtomicUsize::new(heap_target),
        }
    }

    /// Bytes of address space mapped for pool pages.
    #[must_use]
    pub fn bytes_mapped(&self) -> usize {
        self.bytes_mapped.load(Ordering::Relaxed)
    }

    /// Mapped pool bytes currently backed by physical memory.
    #[must_use]
    pub fn bytes_resident(&self) -> usize {
        self.bytes_resident.load(Ordering::Relaxed)
    }

    /// Bytes held by allocated objects, pool blocks and big objects alike.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap_size.load(Ordering::Relaxed)
    }

    /// Heap size at which the next automatic collection triggers.
    #[must_use]
    pub fn heap_target(&self) -> usize {
        self.heap_target.load(Ordering::Relaxed)
    }

    pub(crate) fn add_heap_size(&self, bytes: usize) {
        self.heap_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_heap_size(&self, bytes: usize) {
        // Saturate: concurrent accounting may briefly run ahead of frees.
        let _ = self
            .heap_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }
}

/// One OS mapping and the metadata of every page carved from it.
struct MappedBlock {
    _map: Mmap,
    metas: Box<[PageMeta]>,
}

/// Global page supply shared by every thread heap.
pub(crate) struct PageAllocator {
    pub(crate) table: PageTable,
    pub(crate) status: HeapStatus,
    clean: PaddedPageStack,
    pub(crate) lazily_freed: PaddedPageStack,
    freed: PaddedPageStack,
    /// The permanent-allocation lock; serializes new mappings.
    blocks: Mutex<Vec<MappedBlock>>,
    block_pages: AtomicUsize,
}

impl PageAllocator {
    pub(crate) fn new(block_pages: usize, heap_target: usize) -> Self {
        Self {
            table: PageTable::new(),
            status: HeapStatus::new(heap_target),
            clean: PaddedPageStack::new(),
            lazily_freed: PaddedPageStack::new(),
            freed: PaddedPageStack::new(),
            blocks: Mutex::new(Vec::new()),
            block_pages: AtomicUsize::new(block_pages),
        }
    }

    /// Hands out a page in the `Allocated` state.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the OS refuses even a single-page mapping,
    /// or a freed page cannot be recommitted.
    pub(crate) fn alloc_page(&self) -> Result<PageRef, GcError> {
        if let Some(pg) = self.lazily_freed.pop() {
            self.table.set(pg.data() as usize, PageState::Allocated);
            return Ok(pg);
        }
        if let Some(pg) = self.clean.pop() {
            self.table.set(pg.data() as usize, PageState::Allocated);
            return Ok(pg);
        }
        if let Some(pg) = self.freed.pop() {
            // SAFETY: the page belongs to one of our live mappings.
            if let Err(source) = unsafe { sys_alloc::recommit(pg.data(), PAGE_SZ) } {
                self.freed.push(pg);
                return Err(GcError::OutOfMemory {
                    requested: PAGE_SZ,
                    source,
                });
            }
            self.status
                .bytes_resident
                .fetch_add(PAGE_SZ, Ordering::Relaxed);
            self.table.set(pg.data() as usize, PageState::Allocated);
            return Ok(pg);
        }

        let mut blocks = self.blocks.lock();
        // Another thread may have mapped a block while we waited.
        if let Some(pg) = self.clean.pop() {
            drop(blocks);
            self.table.set(pg.data() as usize, PageState::Allocated);
            return Ok(pg);
        }
        let block = self.map_block()?;
        let mut first = None;
        for meta in &*block.metas {
            let pg = PageRef::new(meta);
            self.table.maybe_create(meta.data() as usize);
            if first.is_none() {
                self.table.set(meta.data() as usize, PageState::Allocated);
                first = Some(pg);
            } else {
                self.clean.push(pg);
            }
        }
        blocks.push(block);
        drop(blocks);
        first.ok_or_else(|| GcError::oom(PAGE_SZ))
    }

    /// Maps a fresh block, halving the request on failure down to one page.
    fn map_block(&self) -> Result<MappedBlock, GcError> {
        let mut pages = self.block_pages.load(Ordering::Relaxed);
        loop {
            // One extra page so the start can be aligned to PAGE_SZ.
            let len = (pages + 1) * PAGE_SZ;
            // SAFETY: no hint address.
            match unsafe { MmapOptions::new().len(len).map_anon() } {
                Ok(map) => {
                    let base = (map.ptr() as usize + PAGE_SZ - 1) & !(PAGE_SZ - 1);
                    let metas: Box<[PageMeta]> = (0..pages)
                        .map(|i| PageMeta::new((base + i * PAGE_SZ) as *mut u8))
                        .collect();
                    debug_assert!(map.contains(base as *const u8, pages * PAGE_SZ));
                    self.block_pages.store(pages, Ordering::Relaxed);
                    let bytes = pages * PAGE_SZ;
                    self.status.bytes_mapped.fetch_add(bytes, Ordering::Relaxed);
                    self.status
                        .bytes_resident
                        .fetch_add(bytes, Ordering::Relaxed);
                    return Ok(MappedBlock {
                        _map: map,
                        metas,
                    });
                }
                Err(source) if pages <= 1 => {
                    return Err(GcError::OutOfMemory {
                        requested: len,
                        source,
                    });
                }
                Err(_) => pages /= 2,
            }
        }
    }

    /// Returns a page to the lazily-freed pool. Its memory stays resident.
    pub(crate) fn free_page(&self, pg: PageRef) {
        self.table.set(pg.data() as usize, PageState::LazilyFreed);
        self.lazily_freed.push(pg);
    }

    /// Gives a page's physical memory back to the OS. Returns `false` when
    /// the page stays resident, in which case the caller keeps it lazily
    /// freed.
    fn decommit(&self, pg: PageRef, release: &impl Fn(PageRef) -> io::Result<()>) -> bool {
        if PAGE_SZ % sys_alloc::page_size() != 0 {
            return false;
        }
        if let Err(err) = release(pg) {
            crate::tracing::internal::log_decommit_failed(pg.data() as usize, &err);
            return false;
        }
        self.table.set(pg.data() as usize, PageState::Freed);
        self.status
            .bytes_resident
            .fetch_sub(PAGE_SZ, Ordering::Relaxed);
        self.freed.push(pg);
        true
    }

    /// Decommits lazily freed pages beyond the first `keep_bytes` worth.
    ///
    /// Returns the number of pages decommitted.
    pub(crate) fn free_pages(&self, keep_bytes: usize) -> usize {
        self.free_pages_with(keep_bytes, |pg| {
            // SAFETY: the page lies in a live mapping and sits on no stack,
            // so nobody else can reach it.
            unsafe { sys_alloc::decommit(pg.data(), PAGE_SZ) }
        })
    }

    fn free_pages_with(
        &self,
        keep_bytes: usize,
        release: impl Fn(PageRef) -> io::Result<()>,
    ) -> usize {
        let mut kept = Vec::new();
        let mut decommitted = 0;
        let mut seen = 0usize;
        while let Some(pg) = self.lazily_freed.pop() {
            seen += 1;
            if seen * PAGE_SZ > keep_bytes && self.decommit(pg, &release) {
                decommitted += 1;
            } else {
                kept.push(pg);
            }
        }
        for pg in kept.into_iter().rev() {
            self.lazily_freed.push(pg);
        }
        decommitted
    }

    /// Pages currently mapped across all blocks.
    pub(crate) fn mapped_pages(&self) -> usize {
        self.status.bytes_mapped() / PAGE_SZ
    }
}

impl std::fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageAllocator")
            .field("status", &self.status)
            .field("blocks", &self.blocks.lock().len())
            .finish_non_exhaustive()
    }
}
