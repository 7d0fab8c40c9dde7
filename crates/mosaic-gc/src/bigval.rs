//! Big objects.
//!
//! Objects too large for a pool get their own system allocation, prefixed by
//! a [`BigVal`] header. Headers are threaded onto doubly linked lists that
//! start at a sentinel node, so unlinking never needs to know which list a
//! node is on.

use std::alloc::{self, Layout};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::GcError;
use crate::object::ObjectRef;
use crate::page::{gc_marked, GC_BITS_MASK, GC_MARKED, GC_OLD, SENTINEL_TAG, TAG_SIZE};

/// Header of a big allocation. The tag word is the last field, so the object
/// payload begins right after the header.
#[repr(C, align(16))]
pub(crate) struct BigVal {
    next: *mut BigVal,
    prev: *mut BigVal,
    /// Total allocation size, header included.
    size: usize,
    pub(crate) header: AtomicUsize,
}

pub(crate) const BIGVAL_HEADER: usize = std::mem::size_of::<BigVal>();

const _: () = assert!(BIGVAL_HEADER % 16 == 0);
const _: () = assert!(std::mem::offset_of!(BigVal, header) + TAG_SIZE == BIGVAL_HEADER);

impl BigVal {
    const fn sentinel() -> Self {
        Self {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            size: 0,
            header: AtomicUsize::new(SENTINEL_TAG),
        }
    }

    fn is_sentinel(&self) -> bool {
        self.header.load(Ordering::Relaxed) == SENTINEL_TAG
    }

    pub(crate) const fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn payload(&self) -> ObjectRef {
        let p = ptr::from_ref(self).cast::<u8>().cast_mut();
        // SAFETY: the payload follows the header inside the same allocation.
        ObjectRef::from_non_null(unsafe { ptr::NonNull::new_unchecked(p.add(BIGVAL_HEADER)) })
    }

    /// Header of the big object whose payload is `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be the payload of a big allocation.
    pub(crate) unsafe fn from_payload(obj: ObjectRef) -> *mut Self {
        // SAFETY: forwarded to the caller.
        unsafe { obj.as_ptr().sub(BIGVAL_HEADER).cast::<Self>() }
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, 16).ok()
    }

    /// Allocates a zeroed big object with `payload` bytes.
    ///
    /// # Errors
    ///
    /// [`GcError::ObjectTooLarge`] if the size overflows, otherwise
    /// [`GcError::OutOfMemory`] when the system allocator fails.
    pub(crate) fn alloc(payload: usize, tag: usize) -> Result<*mut Self, GcError> {
        let size = payload
            .checked_add(BIGVAL_HEADER + 15)
            .map(|s| s & !15)
            .ok_or(GcError::ObjectTooLarge { size: payload })?;
        let layout = Self::layout(size).ok_or(GcError::ObjectTooLarge { size: payload })?;
        // SAFETY: the layout is non-zero sized.
        let raw = unsafe { alloc::alloc_zeroed(layout) }.cast::<Self>();
        if raw.is_null() {
            return Err(GcError::oom(size));
        }
        // SAFETY: fresh, suitably aligned allocation.
        unsafe {
            raw.write(Self {
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                size,
                header: AtomicUsize::new(tag),
            });
        }
        Ok(raw)
    }

    /// # Safety
    ///
    /// `node` must come from [`BigVal::alloc`] and be unlinked.
    pub(crate) unsafe fn free(node: *mut Self) {
        // SAFETY: the caller owns the allocation.
        unsafe {
            let size = (*node).size;
            if let Some(layout) = Self::layout(size) {
                alloc::dealloc(node.cast::<u8>(), layout);
            }
        }
    }
}

/// Inserts `node` right after `sentinel`.
///
/// # Safety
///
/// Both pointers must be live; `node` must not be on any list.
///
/// # Panics
///
/// If `sentinel` is not a sentinel or `node` is one.
pub(crate) unsafe fn link(sentinel: *mut BigVal, node: *mut BigVal) {
    // SAFETY: liveness per the caller.
    unsafe {
        assert!(!sentinel.is_null() && (*sentinel).is_sentinel(), "link target is not a sentinel");
        assert!(!node.is_null() && !(*node).is_sentinel(), "cannot link a sentinel");
        (*node).next = (*sentinel).next;
        (*node).prev = sentinel;
        if let Some(next) = (*sentinel).next.as_mut() {
            next.prev = node;
        }
        (*sentinel).next = node;
    }
}

/// Removes `node` from whatever list holds it.
///
/// # Safety
///
/// `node` must be live.
///
/// # Panics
///
/// If `node` is a sentinel or already detached.
pub(crate) unsafe fn unlink(node: *mut BigVal) {
    // SAFETY: liveness per the caller.
    unsafe {
        assert!(!node.is_null() && !(*node).is_sentinel(), "cannot unlink a sentinel");
        let prev = (*node).prev;
        assert!(!prev.is_null(), "big object is not on a list");
        (*prev).next = (*node).next;
        if let Some(next) = (*node).next.as_mut() {
            next.prev = prev;
        }
        (*node).next = ptr::null_mut();
        (*node).prev = ptr::null_mut();
    }
}

/// A list of big objects headed by a sentinel.
pub(crate) struct BigList {
    sentinel: Box<BigVal>,
}

// SAFETY: the nodes are exclusively owned by the list; access is serialized
// by whoever owns the list.
unsafe impl Send for BigList {}

impl BigList {
    pub(crate) fn new() -> Self {
        Self {
            sentinel: Box::new(BigVal::sentinel()),
        }
    }

    pub(crate) fn sentinel(&mut self) -> *mut BigVal {
        ptr::from_mut(&mut *self.sentinel)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sentinel.next.is_null()
    }

    pub(crate) fn push(&mut self, node: *mut BigVal) {
        let sentinel = self.sentinel();
        // SAFETY: the sentinel is ours and callers hand over fresh nodes.
        unsafe { link(sentinel, node) };
    }

    /// First node, if any.
    pub(crate) fn first(&self) -> *mut BigVal {
        self.sentinel.next
    }

    /// Moves every node of `other` to the front of this list.
    pub(crate) fn splice_from(&mut self, other: &mut Self) {
        let head = other.sentinel.next;
        if head.is_null() {
            return;
        }
        let mut tail = head;
        // SAFETY: nodes on `other` are live and owned by it.
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
            let sentinel = self.sentinel();
            (*tail).next = (*sentinel).next;
            if let Some(next) = (*sentinel).next.as_mut() {
                next.prev = tail;
            }
            (*sentinel).next = head;
            (*head).prev = sentinel;
        }
        other.sentinel.next = ptr::null_mut();
    }

    /// Walks the nodes. The list must not change during the walk.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &BigVal> + '_ {
        let mut cur = self.sentinel.next;
        std::iter::from_fn(move || {
            // SAFETY: list nodes are live while the list is borrowed.
            let node = unsafe { cur.as_ref()? };
            cur = node.next;
            Some(node)
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.iter().count()
    }

    #[cfg(test)]
    pub(crate) fn bytes(&self) -> usize {
        self.iter().map(BigVal::size).sum()
    }

    /// Sweeps a young list after marking.
    ///
    /// Marked nodes survive; a node that reached `GC_OLD_MARKED` during a
    /// quick sweep moves to `oldest`. Unmarked nodes are freed.
    pub(crate) fn sweep_young(&mut self, full: bool, oldest: &mut Self, stats: &mut BigSweepStats) {
        let mut cur = self.sentinel.next;
        while !cur.is_null() {
            // SAFETY: nodes on the list are live; `next` is read before the
            // node can be moved or freed.
            unsafe {
                let next = (*cur).next;
                let tag = (*cur).header.load(Ordering::Relaxed);
                let bits = tag & GC_BITS_MASK;
                if gc_marked(bits) {
                    if full || bits == GC_MARKED {
                        if bits == GC_MARKED {
                            stats.promoted_bytes += (*cur).size;
                        }
                        (*cur).header.store((tag & !GC_BITS_MASK) | GC_OLD, Ordering::Relaxed);
                    } else {
                        unlink(cur);
                        oldest.push(cur);
                    }
                } else {
                    unlink(cur);
                    stats.freed_bytes += (*cur).size;
                    stats.freed_count += 1;
                    BigVal::free(cur);
                }
                cur = next;
            }
        }
    }
}

/// Totals of one big-object sweep.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BigSweepStats {
    pub(crate) freed_bytes: usize,
    pub(crate) freed_count: usize,
    pub(crate) promoted_bytes: usize,
}

impl Drop for BigList {
    fn drop(&mut self) {
        let mut cur = self.sentinel.next;
        while !cur.is_null() {
            // SAFETY: the list owns its nodes.
            unsafe {
                let next = (*cur).next;
                BigVal::free(cur);
                cur = next;
            }
        }
    }
}

impl std::fmt::Debug for BigList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigList")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_aligned_and_tag_precedes_it() {
        let node = BigVal::alloc(5000, 0x70).expect("alloc");
        unsafe {
            let obj = (*node).payload();
            assert_eq!(obj.as_ptr() as usize % 16, 0);
            assert_eq!(obj.type_tag(), 0x70 >> 4);
            assert_eq!(BigVal::from_payload(obj), node);
            assert!((*node).size() >= 5000 + BIGVAL_HEADER);
            BigVal::free(node);
        }
    }

    #[test]
    fn link_then_unlink_restores_list() {
        let mut list = BigList::new();
        let a = BigVal::alloc(64, 0).expect("alloc");
        let b = BigVal::alloc(64, 0).expect("alloc");
        list.push(a);
        list.push(b);
        assert_eq!(list.len(), 2);
        assert_eq!(list.first(), b);

        unsafe { unlink(b) };
        assert_eq!(list.len(), 1);
        assert_eq!(list.first(), a);
        unsafe { unlink(a) };
        assert!(list.is_empty());

        unsafe {
            BigVal::free(a);
            BigVal::free(b);
        }
    }

    #[test]
    #[should_panic(expected = "cannot unlink a sentinel")]
    fn unlinking_sentinel_panics() {
        let mut list = BigList::new();
        let s = list.sentinel();
        unsafe { unlink(s) };
    }

    #[test]
    #[should_panic(expected = "not on a list")]
    fn double_unlink_panics() {
        let mut list = BigList::new();
        let a = BigVal::alloc(16, 0).expect("alloc");
        list.push(a);
        unsafe {
            unlink(a);
            unlink(a);
        }
    }

    #[test]
    #[should_panic(expected = "not a sentinel")]
    fn linking_after_ordinary_node_panics() {
        let a = BigVal::alloc(16, 0).expect("alloc");
        let b = BigVal::alloc(16, 0).expect("alloc");
        unsafe { link(a, b) };
    }

    #[test]
    fn splice_moves_all_nodes() {
        let mut young = BigList::new();
        let mut oldest = BigList::new();
        young.push(BigVal::alloc(16, 0).expect("alloc"));
        oldest.push(BigVal::alloc(32, 0).expect("alloc"));
        oldest.push(BigVal::alloc(48, 0).expect("alloc"));

        young.splice_from(&mut oldest);

        assert!(oldest.is_empty());
        assert_eq!(young.len(), 3);
        let first = young.first();
        unsafe {
            unlink(first);
            BigVal::free(first);
        }
        assert_eq!(young.len(), 2);
    }

    fn set_bits(list: &BigList, bits: &[usize]) {
        for (node, &b) in list.iter().zip(bits) {
            node.header.store(b, Ordering::Relaxed);
        }
    }

    #[test]
    fn quick_sweep_promotes_frees_and_moves_old_marked() {
        let mut young = BigList::new();
        let mut oldest = BigList::new();
        for _ in 0..4 {
            young.push(BigVal::alloc(100, 0).expect("alloc"));
        }
        let size = young.iter().next().map(BigVal::size).expect("node");
        set_bits(&young, &[GC_MARKED, 0, crate::page::GC_OLD_MARKED, GC_OLD]);

        let mut stats = BigSweepStats::default();
        young.sweep_young(false, &mut oldest, &mut stats);

        assert_eq!(young.len(), 1);
        assert_eq!(oldest.len(), 1);
        assert_eq!(stats.freed_count, 2);
        assert_eq!(stats.freed_bytes, 2 * size);
        assert_eq!(stats.promoted_bytes, size);
        assert!(young.iter().all(|n| n.header.load(Ordering::Relaxed) == GC_OLD));
    }

    #[test]
    fn full_sweep_keeps_old_marked_on_young_list() {
        let mut young = BigList::new();
        let mut oldest = BigList::new();
        young.push(BigVal::alloc(16, 0).expect("alloc"));
        set_bits(&young, &[crate::page::GC_OLD_MARKED]);

        let mut stats = BigSweepStats::default();
        young.sweep_young(true, &mut oldest, &mut stats);

        assert_eq!(young.len(), 1);
        assert!(oldest.is_empty());
        assert_eq!(stats.promoted_bytes, 0);
        assert!(young.iter().all(|n| n.header.load(Ordering::Relaxed) == GC_OLD));
    }
}
