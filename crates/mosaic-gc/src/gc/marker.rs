//! The mark engine.
//!
//! Marking claims an object by setting its mark bit with one atomic
//! read-modify-write; whoever flips the bit owns the object and scans it.
//! Page metadata (`has_marked`, `nold`) and the scanned-byte counters are
//! updated by the claiming thread only.
//!
//! While scanning, each container folds a 2-bit summary `nptr`: bit 1 is
//! set when the owner is old, bit 0 once a young child was seen. An owner
//! whose summary ends at `3` goes to the remembered set.

use std::sync::atomic::Ordering;

use super::worklist::{Chunk, MarkQueue, QueueStealers, REMSET_TAG};
use crate::bigval::BigVal;
use crate::object::{ObjectLayout, ObjectModel, ObjectRef};
use crate::page::{gc_marked, gc_old, page_metadata, tag_word, GC_MARKED};
use crate::pagetable::PageTable;

const NPTR_YOUNG: usize = 1;
const NPTR_OLD_OWNER: usize = 2;
const NPTR_REMSET: usize = NPTR_YOUNG | NPTR_OLD_OWNER;

const WORD: usize = std::mem::size_of::<usize>();

static OBJARRAY_FIELDS: [u8; 1] = [0];

/// Field offsets of inline array elements.
trait ElementFields: Copy + Into<usize> + 'static {
    fn chunk(
        parent: ObjectRef,
        begin: usize,
        end: usize,
        elsize: usize,
        fields: &'static [Self],
        nptr: usize,
    ) -> Chunk;
}

impl ElementFields for u8 {
    fn chunk(
        parent: ObjectRef,
        begin: usize,
        end: usize,
        elsize: usize,
        fields: &'static [Self],
        nptr: usize,
    ) -> Chunk {
        Chunk::Array8 {
            parent,
            begin,
            end,
            elsize,
            fields,
            nptr,
        }
    }
}

impl ElementFields for u16 {
    fn chunk(
        parent: ObjectRef,
        begin: usize,
        end: usize,
        elsize: usize,
        fields: &'static [Self],
        nptr: usize,
    ) -> Chunk {
        Chunk::Array16 {
            parent,
            begin,
            end,
            elsize,
            fields,
            nptr,
        }
    }
}

const fn objarray_chunk(
    parent: ObjectRef,
    begin: usize,
    end: usize,
    step: usize,
    _fields: &'static [u8],
    nptr: usize,
) -> Chunk {
    Chunk::ObjArray {
        parent,
        begin,
        end,
        step,
        nptr,
    }
}

/// Reads a slot. Slots hold null or an object payload address.
#[inline]
fn load(slot: usize) -> Option<ObjectRef> {
    // SAFETY: the object model guarantees every slot it names is readable and
    // word aligned.
    let raw = unsafe { (slot as *const *mut u8).read() };
    // SAFETY: non-null slots hold valid object addresses.
    unsafe { ObjectRef::from_raw(raw) }
}

/// Everything a marking thread needs besides its own queue.
#[derive(Clone, Copy)]
pub(crate) struct Marker<'a> {
    pub(crate) table: &'a PageTable,
    pub(crate) model: &'a dyn ObjectModel,
    /// Elements scanned inline before the rest of a container is deferred.
    pub(crate) batch: usize,
}

impl std::fmt::Debug for Marker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marker")
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl Marker<'_> {
    // ===== Claiming =====

    /// Sets the mark bit of `obj`. Returns `true` if this call marked it.
    pub(crate) fn try_claim(&self, mq: &mut MarkQueue, obj: ObjectRef) -> bool {
        // SAFETY: `obj` is a managed object.
        let tag = unsafe { tag_word(obj.as_ptr()) };
        if gc_marked(tag.load(Ordering::Relaxed)) {
            return false;
        }
        let prev = tag.fetch_or(GC_MARKED, Ordering::AcqRel);
        if gc_marked(prev) {
            return false;
        }
        self.note_marked(mq, obj, gc_old(prev));
        true
    }

    fn note_marked(&self, mq: &mut MarkQueue, obj: ObjectRef, old: bool) {
        let addr = obj.addr();
        let size = if self.table.is_set(addr) {
            // SAFETY: the page is allocated, so its back-pointer is valid.
            let pg = unsafe { page_metadata(addr) };
            if old {
                pg.nold.fetch_add(1, Ordering::Relaxed);
            }
            pg.has_marked.store(true, Ordering::Relaxed);
            pg.osize()
        } else {
            // SAFETY: objects off the pool pages are big objects.
            unsafe { (*BigVal::from_payload(obj)).size() }
        };
        if old {
            mq.cache.perm_scanned_bytes += size;
        } else {
            mq.cache.scanned_bytes += size;
        }
        mq.cache.objects_marked += 1;
    }

    /// Folds `obj`'s age into `nptr`, then claims and queues it.
    #[inline]
    fn try_claim_and_push(&self, mq: &mut MarkQueue, obj: ObjectRef, nptr: Option<&mut usize>) {
        if let Some(nptr) = nptr {
            *nptr |= usize::from(!obj.is_old());
        }
        if self.try_claim(mq, obj) {
            mq.push_obj(obj);
        }
    }

    /// Marks and queues a root.
    pub(crate) fn push_root(&self, mq: &mut MarkQueue, obj: ObjectRef) {
        self.try_claim_and_push(mq, obj, None);
    }

    fn push_remset(mq: &mut MarkQueue, obj: ObjectRef, nptr: usize) {
        if nptr & NPTR_REMSET == NPTR_REMSET {
            mq.cache.remset.push(obj);
        }
    }

    // ===== Scanning =====

    /// Scans one queued entry and everything reachable by tail position.
    pub(crate) fn mark_outrefs(&self, mq: &mut MarkQueue, entry: usize) {
        let addr = entry & !REMSET_TAG;
        // SAFETY: queued entries are object addresses.
        let Some(mut obj) = (unsafe { ObjectRef::from_raw(addr as *mut u8) }) else {
            return;
        };
        loop {
            match self.scan_object(mq, obj) {
                Some(next) => obj = next,
                None => return,
            }
        }
    }

    /// Scans `obj`. Returns its last child when this call claimed it, so the
    /// caller can continue with it directly instead of queueing it.
    fn scan_object(&self, mq: &mut MarkQueue, obj: ObjectRef) -> Option<ObjectRef> {
        let nptr = if obj.is_old() { NPTR_OLD_OWNER } else { 0 };
        match self.model.layout(obj) {
            ObjectLayout::Leaf => None,
            ObjectLayout::Fields8(offsets) => self.mark_fields(mq, obj, offsets, nptr),
            ObjectLayout::Fields16(offsets) => self.mark_fields(mq, obj, offsets, nptr),
            ObjectLayout::ObjArray { begin, len, step } => {
                let begin = begin as usize;
                let step = step.max(1);
                let end = begin + len * WORD;
                self.mark_array(mq, obj, begin, end, step, &OBJARRAY_FIELDS, nptr, objarray_chunk);
                None
            }
            ObjectLayout::Array8 {
                begin,
                len,
                elsize,
                fields,
            } => {
                self.mark_inline(mq, obj, begin as usize, len, elsize, fields, nptr);
                None
            }
            ObjectLayout::Array16 {
                begin,
                len,
                elsize,
                fields,
            } => {
                self.mark_inline(mq, obj, begin as usize, len, elsize, fields, nptr);
                None
            }
        }
    }

    fn mark_fields<T: Copy + Into<usize>>(
        &self,
        mq: &mut MarkQueue,
        parent: ObjectRef,
        offsets: &[T],
        mut nptr: usize,
    ) -> Option<ObjectRef> {
        let base = parent.addr();
        let n = offsets.len();
        for (i, &off) in offsets.iter().enumerate() {
            let Some(child) = load(base + off.into() * WORD) else {
                continue;
            };
            if i + 1 != n {
                self.try_claim_and_push(mq, child, Some(&mut nptr));
                continue;
            }
            // Last field: mark it here and hand it back rather than
            // pushing and immediately popping it.
            nptr |= usize::from(!child.is_old());
            let claimed = self.try_claim(mq, child);
            Self::push_remset(mq, parent, nptr);
            return claimed.then_some(child);
        }
        Self::push_remset(mq, parent, nptr);
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn mark_inline<T: ElementFields>(
        &self,
        mq: &mut MarkQueue,
        parent: ObjectRef,
        begin: usize,
        len: usize,
        elsize: usize,
        fields: &'static [T],
        nptr: usize,
    ) {
        let elsize = elsize.max(1);
        let end = begin + len * elsize * WORD;
        self.mark_array(mq, parent, begin, end, elsize, fields, nptr, T::chunk);
    }

    /// Scans elements `begin..end` of `elsize` words. Large ranges scan a
    /// prefix of `batch` elements and defer the rest as one chunk.
    #[allow(clippy::too_many_arguments)]
    fn mark_array<T: Copy + Into<usize>>(
        &self,
        mq: &mut MarkQueue,
        parent: ObjectRef,
        mut begin: usize,
        end: usize,
        elsize: usize,
        fields: &'static [T],
        mut nptr: usize,
        make_chunk: impl Fn(ObjectRef, usize, usize, usize, &'static [T], usize) -> Chunk,
    ) {
        let stride = elsize * WORD;
        if nptr & NPTR_OLD_OWNER != 0 {
            // Old owners mostly hold old children: skip ahead to the first
            // unmarked child, noting any young one on the way.
            'prescan: while begin < end {
                for &f in fields {
                    if let Some(child) = load(begin + f.into() * WORD) {
                        if !child.is_old() {
                            nptr |= NPTR_YOUNG;
                        }
                        if !child.is_marked() {
                            break 'prescan;
                        }
                    }
                }
                begin += stride;
            }
        }
        let remaining = end.saturating_sub(begin).div_ceil(stride);
        let too_big = remaining > self.batch;
        let mut scan_end = end;
        let mut pushed_chunk = false;
        if too_big {
            scan_end = begin + self.batch * stride;
            // A young owner never enters the remset, and a summary of 3
            // cannot change: publish the rest early for thieves.
            if nptr & NPTR_OLD_OWNER == 0 || nptr & NPTR_REMSET == NPTR_REMSET {
                mq.push_chunk(make_chunk(parent, scan_end, end, elsize, fields, nptr));
                pushed_chunk = true;
            }
        }
        while begin < scan_end {
            for &f in fields {
                if let Some(child) = load(begin + f.into() * WORD) {
                    self.try_claim_and_push(mq, child, Some(&mut nptr));
                }
            }
            begin += stride;
        }
        if too_big {
            if !pushed_chunk {
                mq.push_chunk(make_chunk(parent, scan_end, end, elsize, fields, nptr));
            }
        } else {
            Self::push_remset(mq, parent, nptr);
        }
    }

    /// Marks the entries of a finalizer list, deferring all but the first
    /// `batch` entries.
    pub(crate) fn mark_finlist(&self, mq: &mut MarkQueue, list: &[usize]) {
        let begin = list.as_ptr() as usize;
        self.mark_finlist_range(mq, begin, begin + list.len() * WORD);
    }

    fn mark_finlist_range(&self, mq: &mut MarkQueue, begin: usize, mut end: usize) {
        if (end - begin) / WORD > self.batch {
            let split = begin + self.batch * WORD;
            mq.push_chunk(Chunk::FinList { begin: split, end });
            end = split;
        }
        let mut slot = begin;
        while slot < end {
            if let Some(obj) = load(slot) {
                self.try_claim_and_push(mq, obj, None);
            }
            slot += WORD;
        }
    }

    pub(crate) fn mark_chunk(&self, mq: &mut MarkQueue, chunk: Chunk) {
        match chunk {
            Chunk::ObjArray {
                parent,
                begin,
                end,
                step,
                nptr,
            } => {
                let fields = &OBJARRAY_FIELDS;
                self.mark_array(mq, parent, begin, end, step, fields, nptr, objarray_chunk);
            }
            Chunk::Array8 {
                parent,
                begin,
                end,
                elsize,
                fields,
                nptr,
            } => self.mark_array(mq, parent, begin, end, elsize, fields, nptr, u8::chunk),
            Chunk::Array16 {
                parent,
                begin,
                end,
                elsize,
                fields,
                nptr,
            } => self.mark_array(mq, parent, begin, end, elsize, fields, nptr, u16::chunk),
            Chunk::FinList { begin, end } => self.mark_finlist_range(mq, begin, end),
        }
    }

    // ===== Loops =====

    /// Drains `mq` on the calling thread alone.
    pub(crate) fn mark_loop_serial(&self, mq: &mut MarkQueue) {
        loop {
            if let Some(entry) = mq.pop_ptr() {
                self.mark_outrefs(mq, entry);
            } else if let Some(chunk) = mq.pop_chunk() {
                self.mark_chunk(mq, chunk);
            } else {
                return;
            }
        }
    }

    /// Drains `mq`, then steals until no queue has observable work.
    ///
    /// `stealers[0]` is the collecting thread's queue; `1..` are the workers.
    /// Chunks are stolen before pointers since they expand into more work.
    pub(crate) fn mark_and_steal(&self, mq: &mut MarkQueue, stealers: &[QueueStealers]) {
        use rand::Rng;

        let n_workers = stealers.len().saturating_sub(1);
        'pop: loop {
            self.mark_loop_serial(mq);
            if n_workers == 0 {
                return;
            }

            for _ in 0..4 * n_workers {
                let victim = mq.rng.gen_range(1..=n_workers);
                if let Some(chunk) = stealers[victim].steal_chunk() {
                    self.mark_chunk(mq, chunk);
                    continue 'pop;
                }
            }
            for victim in &stealers[1..] {
                if let Some(chunk) = victim.steal_chunk() {
                    self.mark_chunk(mq, chunk);
                    continue 'pop;
                }
            }
            if let Some(chunk) = stealers[0].steal_chunk() {
                self.mark_chunk(mq, chunk);
                continue 'pop;
            }

            for _ in 0..4 * n_workers {
                let victim = mq.rng.gen_range(1..=n_workers);
                if let Some(entry) = stealers[victim].steal_ptr() {
                    self.mark_outrefs(mq, entry);
                    continue 'pop;
                }
            }
            for victim in &stealers[1..] {
                if let Some(entry) = victim.steal_ptr() {
                    self.mark_outrefs(mq, entry);
                    continue 'pop;
                }
            }
            if let Some(entry) = stealers[0].steal_ptr() {
                self.mark_outrefs(mq, entry);
                continue 'pop;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::heap::{size_class_index, ThreadHeap};
    use crate::page::{GC_OLD_MARKED, TAG_SIZE};
    use crate::pages::PageAllocator;

    const LEAF: usize = 0;
    const ARRAY: usize = 1;
    const STRUCTS8: usize = 2;
    const STRUCTS16: usize = 3;
    /// Payload words of every container below.
    const LEN: usize = 10;
    /// Two-word elements of the struct arrays.
    const ELEMS: usize = LEN / 2;

    /// `ARRAY` is `LEN` reference words. `STRUCTS8` and `STRUCTS16` are
    /// `ELEMS` two-word elements with a reference in word 1 and word 0
    /// respectively.
    struct Model;

    // SAFETY: containers are allocated with `LEN` zeroed payload words.
    unsafe impl ObjectModel for Model {
        fn layout(&self, obj: ObjectRef) -> ObjectLayout {
            let begin: *const *mut u8 = obj.as_ptr().cast::<*mut u8>();
            match obj.type_tag() {
                ARRAY => ObjectLayout::ObjArray {
                    begin,
                    len: LEN,
                    step: 1,
                },
                STRUCTS8 => ObjectLayout::Array8 {
                    begin,
                    len: ELEMS,
                    elsize: 2,
                    fields: &[1],
                },
                STRUCTS16 => ObjectLayout::Array16 {
                    begin,
                    len: ELEMS,
                    elsize: 2,
                    fields: &[0],
                },
                _ => ObjectLayout::Leaf,
            }
        }
    }

    struct Fixture {
        pages: PageAllocator,
        heap: Arc<ThreadHeap>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pages: PageAllocator::new(8, 0),
                heap: Arc::new(ThreadHeap::new(0)),
            }
        }

        fn alloc(&self, size: usize, type_tag: usize) -> ObjectRef {
            let pool_n = size_class_index(size + TAG_SIZE).expect("pool");
            self.heap
                .local
                .lock()
                .pool_alloc(&self.heap, &self.pages, pool_n, type_tag, 8)
                .expect("alloc")
        }

        /// A container of kind `type_tag` with a fresh leaf in each of
        /// `slots`.
        fn container(
            &self,
            type_tag: usize,
            slots: impl Iterator<Item = usize>,
        ) -> (ObjectRef, Vec<ObjectRef>) {
            let obj = self.alloc(LEN * WORD, type_tag);
            let children = slots
                .map(|slot| {
                    let child = self.alloc(16, LEAF);
                    // SAFETY: containers have `LEN` words.
                    unsafe { obj.store_slot_raw(slot, Some(child)) };
                    child
                })
                .collect();
            (obj, children)
        }

        fn array(&self) -> (ObjectRef, Vec<ObjectRef>) {
            self.container(ARRAY, 0..LEN)
        }

        fn marker(&self, batch: usize) -> Marker<'_> {
            Marker {
                table: &self.pages.table,
                model: &Model,
                batch,
            }
        }
    }

    fn drain_ptrs(mq: &MarkQueue) -> usize {
        std::iter::from_fn(|| mq.pop_ptr()).count()
    }

    #[test]
    fn long_array_scans_a_prefix_and_defers_one_chunk() {
        let fx = Fixture::new();
        let (arr, elems) = fx.array();
        let marker = fx.marker(6);
        let (mut mq, _stealers) = MarkQueue::new(0);

        marker.mark_outrefs(&mut mq, arr.addr());

        assert_eq!(mq.chunk_count(), 1);
        assert_eq!(drain_ptrs(&mq), 6);
        assert!(elems[..6].iter().all(|e| e.is_marked()));
        assert!(elems[6..].iter().all(|e| !e.is_marked()));

        let chunk = mq.pop_chunk().expect("deferred chunk");
        let Chunk::ObjArray { begin, end, .. } = chunk else {
            panic!("unexpected chunk {chunk:?}");
        };
        assert_eq!(begin, arr.addr() + 6 * WORD);
        assert_eq!(end, arr.addr() + LEN * WORD);

        marker.mark_chunk(&mut mq, chunk);

        assert!(mq.pop_chunk().is_none());
        assert_eq!(drain_ptrs(&mq), LEN - 6);
        assert!(elems.iter().all(|e| e.is_marked()));
        assert_eq!(mq.cache.objects_marked, LEN);
    }

    #[test]
    fn one_element_over_the_batch_is_deferred() {
        let fx = Fixture::new();
        let (arr, elems) = fx.array();
        let (mut mq, _stealers) = MarkQueue::new(0);

        fx.marker(LEN - 1).mark_outrefs(&mut mq, arr.addr());

        assert_eq!(mq.chunk_count(), 1);
        assert_eq!(drain_ptrs(&mq), LEN - 1);
        assert!(!elems[LEN - 1].is_marked());
    }

    #[test]
    fn array_of_exactly_the_batch_is_scanned_inline() {
        let fx = Fixture::new();
        let (arr, elems) = fx.array();
        let (mut mq, _stealers) = MarkQueue::new(0);

        fx.marker(LEN).mark_outrefs(&mut mq, arr.addr());

        assert_eq!(mq.chunk_count(), 0);
        assert_eq!(drain_ptrs(&mq), LEN);
        assert!(elems.iter().all(|e| e.is_marked()));
    }

    #[test]
    fn chunks_split_again_until_the_tail_fits() {
        let fx = Fixture::new();
        let (arr, elems) = fx.array();
        let marker = fx.marker(4);
        let (mut mq, _stealers) = MarkQueue::new(0);

        marker.mark_outrefs(&mut mq, arr.addr());
        let first = mq.pop_chunk().expect("first chunk");
        marker.mark_chunk(&mut mq, first);
        let second = mq.pop_chunk().expect("second chunk");
        let Chunk::ObjArray { begin, end, .. } = second else {
            panic!("unexpected chunk {second:?}");
        };
        assert_eq!((begin, end), (arr.addr() + 8 * WORD, arr.addr() + LEN * WORD));

        marker.mark_chunk(&mut mq, second);
        marker.mark_loop_serial(&mut mq);

        assert!(mq.is_empty());
        assert!(elems.iter().all(|e| e.is_marked()));
        assert_eq!(mq.cache.objects_marked, LEN);
    }

    #[test]
    fn struct_array8_is_chunked_by_element() {
        let fx = Fixture::new();
        let (arr, elems) = fx.container(STRUCTS8, (0..ELEMS).map(|i| 2 * i + 1));
        let marker = fx.marker(3);
        let (mut mq, _stealers) = MarkQueue::new(0);

        marker.mark_outrefs(&mut mq, arr.addr());

        assert_eq!(drain_ptrs(&mq), 3);
        let chunk = mq.pop_chunk().expect("deferred chunk");
        let Chunk::Array8 {
            begin, end, elsize, ..
        } = chunk
        else {
            panic!("unexpected chunk {chunk:?}");
        };
        assert_eq!(begin, arr.addr() + 3 * 2 * WORD);
        assert_eq!(end, arr.addr() + LEN * WORD);
        assert_eq!(elsize, 2);

        marker.mark_chunk(&mut mq, chunk);

        assert!(mq.pop_chunk().is_none());
        assert_eq!(drain_ptrs(&mq), ELEMS - 3);
        assert!(elems.iter().all(|e| e.is_marked()));
    }

    #[test]
    fn struct_array16_is_chunked_by_element() {
        let fx = Fixture::new();
        let (arr, elems) = fx.container(STRUCTS16, (0..ELEMS).map(|i| 2 * i));
        let marker = fx.marker(ELEMS - 1);
        let (mut mq, _stealers) = MarkQueue::new(0);

        marker.mark_outrefs(&mut mq, arr.addr());

        let chunk = mq.pop_chunk().expect("deferred chunk");
        assert!(matches!(
            chunk,
            Chunk::Array16 { begin, .. } if begin == arr.addr() + (ELEMS - 1) * 2 * WORD
        ));
        assert!(!elems[ELEMS - 1].is_marked());

        marker.mark_chunk(&mut mq, chunk);

        assert!(mq.pop_chunk().is_none());
        assert!(elems.iter().all(|e| e.is_marked()));
        assert_eq!(mq.cache.objects_marked, ELEMS);
    }

    #[test]
    fn old_owner_of_young_child_is_remembered() {
        let fx = Fixture::new();
        let (arr, _elems) = fx.array();
        arr.set_gc_bits(GC_OLD_MARKED);
        let (mut mq, _stealers) = MarkQueue::new(0);

        fx.marker(64).mark_outrefs(&mut mq, arr.addr() | REMSET_TAG);

        assert_eq!(mq.cache.remset, vec![arr]);
        assert_eq!(mq.cache.objects_marked, LEN);
    }

    #[test]
    fn claiming_twice_marks_once() {
        let fx = Fixture::new();
        let obj = fx.alloc(16, LEAF);
        let marker = fx.marker(64);
        let (mut mq, _stealers) = MarkQueue::new(0);

        assert!(marker.try_claim(&mut mq, obj));
        assert!(!marker.try_claim(&mut mq, obj));
        assert_eq!(mq.cache.objects_marked, 1);
        assert_eq!(mq.cache.scanned_bytes, 32);
        // SAFETY: pool object on an allocated page.
        let pg = unsafe { page_metadata(obj.addr()) };
        assert!(pg.has_marked.load(Ordering::Relaxed));
    }
}
