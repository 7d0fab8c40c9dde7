//! The sweep engine.
//!
//! Pool pages are swept through a [`SweepJob`]. The collecting thread first
//! prescans every heap's `pages_allocd` stack: pages that need no block walk
//! (nothing marked, or skippable by a quick sweep) are settled right away,
//! the rest are queued on the job. If enough page bytes are queued the job
//! is published to the workers, and every participant pops queued pages
//! until none are left. Swept pages land on per-heap scratch stacks, which
//! replace `pages_allocd` once all sweepers are done.
//!
//! Big objects are swept on the collecting thread alone.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bigval::{BigList, BigSweepStats};
use crate::config::GcHooks;
use crate::heap::{HeapLocal, ThreadHeap, N_POOLS};
use crate::metrics::PageSweepRecord;
use crate::page::{
    blocks_per_page, gc_marked, page_base, PageRef, PageState, FL_EMPTY, GC_BITS_MASK, GC_MARKED,
    GC_OLD, PAGE_OFFSET, PAGE_SZ,
};
use crate::page_stack::PaddedPageStack;
use crate::pages::PageAllocator;

/// Totals accumulated by every sweeper of one job.
#[derive(Debug, Default)]
pub(crate) struct SweepCounters {
    pub(crate) freed_bytes: AtomicUsize,
    pub(crate) promoted_bytes: AtomicUsize,
    pub(crate) pages_swept: AtomicUsize,
    pub(crate) pages_skipped: AtomicUsize,
    pub(crate) pages_released: AtomicUsize,
}

/// Shared state of one pool sweep.
pub(crate) struct SweepJob {
    full: bool,
    prev_sweep_full: bool,
    /// Keep empty pages on their heap's buffered stack.
    keep_buffered: bool,
    heaps: Vec<Arc<ThreadHeap>>,
    /// Bump pointer of every pool when the world stopped, per heap.
    newpages: Vec<[usize; N_POOLS]>,
    pending: Box<[PaddedPageStack]>,
    scratch: Box<[PaddedPageStack]>,
    pub(crate) counters: SweepCounters,
}

/// Where a sweeper reports to.
#[derive(Clone, Copy)]
pub(crate) struct SweepSink<'a> {
    pub(crate) pages: &'a PageAllocator,
    /// Set when the `memory_profile` capability is on.
    pub(crate) profile: Option<&'a dyn GcHooks>,
}

impl SweepJob {
    pub(crate) fn new(
        heaps: Vec<Arc<ThreadHeap>>,
        newpages: Vec<[usize; N_POOLS]>,
        full: bool,
        prev_sweep_full: bool,
        keep_buffered: bool,
    ) -> Self {
        debug_assert_eq!(heaps.len(), newpages.len());
        let n = heaps.len();
        Self {
            full,
            prev_sweep_full,
            keep_buffered,
            heaps,
            newpages,
            pending: (0..n).map(|_| PaddedPageStack::new()).collect(),
            scratch: (0..n).map(|_| PaddedPageStack::new()).collect(),
            counters: SweepCounters::default(),
        }
    }

    fn needs_walk(&self, pg: PageRef) -> bool {
        if !pg.has_marked.load(Ordering::Relaxed) {
            return false;
        }
        self.full
            || pg.has_young.load(Ordering::Relaxed)
            || (self.prev_sweep_full
                && pg.prev_nold.load(Ordering::Relaxed) != pg.nold.load(Ordering::Relaxed))
    }

    /// Drains every heap's `pages_allocd`, settling cheap pages inline and
    /// queueing the rest. Returns the bytes of queued pages.
    ///
    /// Runs on the collecting thread before any worker sees the job.
    pub(crate) fn prescan(&self, sink: SweepSink<'_>) -> usize {
        let mut queued = 0;
        for (i, heap) in self.heaps.iter().enumerate() {
            while let Some(pg) = heap.pages_allocd.pop_nosync() {
                if self.needs_walk(pg) {
                    self.pending[i].push_nosync(pg);
                    queued += PAGE_SZ;
                } else {
                    self.sweep_page(i, pg, sink);
                }
            }
        }
        queued
    }

    /// Sweeps queued pages until none are left, starting at heap `start`.
    pub(crate) fn sweep_pending(&self, start: usize, sink: SweepSink<'_>) {
        let n = self.heaps.len();
        if n == 0 {
            return;
        }
        for k in 0..n {
            let i = (start + k) % n;
            while let Some(pg) = self.pending[i].pop() {
                self.sweep_page(i, pg, sink);
            }
        }
    }

    /// Installs the swept pages as each heap's `pages_allocd`.
    ///
    /// Every sweeper must have finished.
    pub(crate) fn install(&self) {
        for (i, heap) in self.heaps.iter().enumerate() {
            debug_assert!(self.pending[i].is_empty(), "sweep finished with queued pages");
            heap.pages_allocd.replace(self.scratch[i].take());
        }
    }

    fn sweep_page(&self, i: usize, pg: PageRef, sink: SweepSink<'_>) {
        let osize = pg.osize();
        let data = pg.data() as usize;
        let old_nfree = usize::from(pg.nfree.load(Ordering::Relaxed));
        let pool_n = usize::from(pg.pool_n.load(Ordering::Relaxed));
        let newpages = self.newpages[i][pool_n];
        // Blocks at or past the bump pointer were never handed out.
        let lim_newpages = if newpages != 0 && page_base(newpages - 1) == data {
            newpages
        } else {
            data + PAGE_SZ
        };

        let counters = &self.counters;
        let mut released = false;
        let nfree = if !pg.has_marked.load(Ordering::Relaxed) {
            released = true;
            if self.keep_buffered {
                sink.pages.table.set(data, PageState::LazilyFreed);
                self.heaps[i].pages_buffered.push(pg);
            } else {
                sink.pages.free_page(pg);
            }
            counters.pages_released.fetch_add(1, Ordering::Relaxed);
            blocks_per_page(osize)
        } else if !self.needs_walk(pg) {
            counters.pages_skipped.fetch_add(1, Ordering::Relaxed);
            self.scratch[i].push(pg);
            old_nfree
        } else {
            let nfree = self.walk_blocks(pg, lim_newpages);
            counters.pages_swept.fetch_add(1, Ordering::Relaxed);
            self.scratch[i].push(pg);
            nfree
        };

        counters
            .freed_bytes
            .fetch_add(nfree.saturating_sub(old_nfree) * osize, Ordering::Relaxed);
        if let Some(hooks) = sink.profile {
            hooks.page_swept(&PageSweepRecord {
                page: data,
                osize,
                nfree,
                released,
            });
        }
    }

    /// Threads unmarked blocks into the page free list and ages survivors.
    /// Returns the number of free blocks.
    fn walk_blocks(&self, pg: PageRef, lim_newpages: usize) -> usize {
        let osize = pg.osize();
        let data = pg.data() as usize;
        let lim = data + PAGE_SZ - osize;

        let mut fl_begin = 0usize;
        let mut fl_end = 0usize;
        let mut nfree = 0usize;
        let mut live: u16 = 0;
        let mut has_marked = false;
        let mut promoted = 0usize;

        let mut block = data + PAGE_OFFSET;
        while block <= lim {
            // SAFETY: `block` is a block start inside an allocated page.
            let tag = unsafe { &*(block as *const AtomicUsize) };
            let word = tag.load(Ordering::Relaxed);
            let bits = word & GC_BITS_MASK;
            if !gc_marked(bits) || block >= lim_newpages {
                if fl_end == 0 {
                    fl_begin = block;
                } else {
                    // SAFETY: `fl_end` is an earlier free block on this page.
                    unsafe { (fl_end as *mut usize).write(block) };
                }
                fl_end = block;
                nfree += 1;
            } else {
                let mut bits = bits;
                if self.full || bits == GC_MARKED {
                    if bits == GC_MARKED {
                        promoted += osize;
                    }
                    tag.store((word & !GC_BITS_MASK) | GC_OLD, Ordering::Relaxed);
                    bits = GC_OLD;
                }
                live += 1;
                has_marked |= gc_marked(bits);
            }
            block += osize;
        }
        debug_assert!(live > 0, "walked a page with nothing marked");

        pg.has_marked.store(has_marked, Ordering::Relaxed);
        pg.has_young.store(false, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        {
            let (begin, end) = if fl_end == 0 {
                (FL_EMPTY, FL_EMPTY)
            } else {
                ((fl_begin - data) as u16, (fl_end - data) as u16)
            };
            pg.fl_begin_offset.store(begin, Ordering::Relaxed);
            pg.fl_end_offset.store(end, Ordering::Relaxed);
            pg.nfree.store(nfree as u16, Ordering::Relaxed);
        }
        if self.full {
            pg.nold.store(0, Ordering::Relaxed);
            pg.prev_nold.store(live, Ordering::Relaxed);
        }
        self.counters
            .promoted_bytes
            .fetch_add(promoted, Ordering::Relaxed);
        nfree
    }

    #[cfg(test)]
    pub(crate) fn pending_pages(&self) -> usize {
        self.pending.iter().map(|s| s.iter().count()).sum()
    }
}

impl std::fmt::Debug for SweepJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepJob")
            .field("full", &self.full)
            .field("heaps", &self.heaps.len())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

/// Sweeps every heap's young big objects and, on a full sweep, the oldest
/// list as well, whose survivors go back to `master` to be re-examined.
pub(crate) fn sweep_big_objects(
    locals: &mut [parking_lot::MutexGuard<'_, HeapLocal>],
    master: usize,
    oldest: &mut BigList,
    full: bool,
) -> BigSweepStats {
    let mut stats = BigSweepStats::default();
    for local in locals.iter_mut() {
        local.young_bigvals.sweep_young(full, oldest, &mut stats);
    }
    if full {
        let mut unused = BigList::new();
        oldest.sweep_young(true, &mut unused, &mut stats);
        debug_assert!(unused.is_empty());
        locals[master].young_bigvals.splice_from(oldest);
    }
    stats
}
