//! The host object model.
//!
//! The collector never interprets object payloads itself. Every managed
//! object is preceded by a one-word tag: the low [`TAG_RESERVED_BITS`] belong
//! to the collector, the rest carry a host-chosen type tag. To find the
//! outgoing references of an object the collector asks the host's
//! [`ObjectModel`] for an [`ObjectLayout`].

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::page::{gc_marked, gc_old, tag_word, GC_BITS_MASK, TAG_RESERVED_BITS};

/// Address of a managed object's payload.
///
/// The tag word lives immediately before this address. Payloads are always
/// 16-byte aligned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonNull<u8>);

// SAFETY: an `ObjectRef` is an address; access to the payload is governed by
// the host and the collector's stop-the-world protocol.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Wraps a raw payload pointer. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must be the payload address of an object allocated by
    /// a live collector.
    #[inline]
    #[must_use]
    pub unsafe fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[inline]
    pub(crate) const fn from_non_null(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Payload address.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn tag(self) -> usize {
        // SAFETY: every `ObjectRef` is preceded by a collector-owned tag word.
        unsafe { tag_word(self.as_ptr()) }.load(Ordering::Relaxed)
    }

    /// Host type tag stored above the collector's reserved bits.
    #[inline]
    #[must_use]
    pub fn type_tag(self) -> usize {
        self.tag() >> TAG_RESERVED_BITS
    }

    /// The two GC bits (`GC_CLEAN`, `GC_MARKED`, `GC_OLD`, `GC_OLD_MARKED`).
    #[inline]
    #[must_use]
    pub fn gc_bits(self) -> usize {
        self.tag() & GC_BITS_MASK
    }

    /// Replaces the GC bits, keeping the type tag.
    #[inline]
    pub(crate) fn set_gc_bits(self, bits: usize) {
        // SAFETY: every `ObjectRef` is preceded by a collector-owned tag word.
        let tag = unsafe { tag_word(self.as_ptr()) };
        let word = tag.load(Ordering::Relaxed);
        tag.store((word & !GC_BITS_MASK) | bits, Ordering::Relaxed);
    }

    /// Whether the object was reached in the current or, if old, an earlier
    /// cycle.
    #[inline]
    #[must_use]
    pub fn is_marked(self) -> bool {
        gc_marked(self.tag())
    }

    /// Whether the object survived a collection.
    #[inline]
    #[must_use]
    pub fn is_old(self) -> bool {
        gc_old(self.tag())
    }

    /// Reads the pointer stored in payload word `index`.
    ///
    /// # Safety
    ///
    /// The payload must be at least `index + 1` words long.
    #[inline]
    #[must_use]
    pub unsafe fn load_slot(self, index: usize) -> Option<Self> {
        // SAFETY: in bounds per the caller; payloads are word aligned.
        let raw = unsafe { self.as_ptr().cast::<*mut u8>().add(index).read() };
        NonNull::new(raw).map(Self)
    }

    /// Writes `value` into payload word `index` without a write barrier.
    ///
    /// Use [`Mutator::store_slot`](crate::Mutator::store_slot) for stores
    /// that may create old-to-young references.
    ///
    /// # Safety
    ///
    /// The payload must be at least `index + 1` words long.
    #[inline]
    pub unsafe fn store_slot_raw(self, index: usize, value: Option<Self>) {
        let raw = value.map_or(std::ptr::null_mut(), Self::as_ptr);
        // SAFETY: in bounds per the caller.
        unsafe { self.as_ptr().cast::<*mut u8>().add(index).write(raw) };
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.0)
    }
}

/// Where an object keeps its outgoing references.
///
/// Slot addresses point at pointer-sized words holding either null or an
/// object payload address.
#[derive(Debug, Clone, Copy)]
pub enum ObjectLayout {
    /// No outgoing references.
    Leaf,
    /// References at the given payload word offsets (objects up to 256 words).
    Fields8(&'static [u8]),
    /// References at the given payload word offsets.
    Fields16(&'static [u16]),
    /// `len` words starting at `begin`; every `step`-th word is a reference.
    ObjArray {
        /// First slot.
        begin: *const *mut u8,
        /// Words in the range, not elements.
        len: usize,
        /// Distance in words between consecutive references.
        step: usize,
    },
    /// `len` inline elements of `elsize` words, each with references at the
    /// given word offsets.
    Array8 {
        /// First element.
        begin: *const *mut u8,
        /// Number of elements.
        len: usize,
        /// Element size in words.
        elsize: usize,
        /// Reference offsets within one element.
        fields: &'static [u8],
    },
    /// Like [`ObjectLayout::Array8`] with wide offsets.
    Array16 {
        /// First element.
        begin: *const *mut u8,
        /// Number of elements.
        len: usize,
        /// Element size in words.
        elsize: usize,
        /// Reference offsets within one element.
        fields: &'static [u16],
    },
}

/// Describes the reference layout of host objects.
///
/// # Safety
///
/// Every layout returned must describe memory that is readable for the
/// duration of the collection and whose slots hold null or valid
/// [`ObjectRef`] addresses. The method is called from mark workers while
/// the world is stopped; it must not allocate managed memory.
pub unsafe trait ObjectModel: Send + Sync {
    /// Layout of `obj`'s references.
    fn layout(&self, obj: ObjectRef) -> ObjectLayout;
}

/// Source of extra roots consulted at the start of every collection.
pub trait RootProvider: Send + Sync {
    /// Push every root this provider knows about.
    fn roots(&self, sink: &mut RootSink<'_>);
}

/// Receives roots during root seeding.
pub struct RootSink<'a> {
    push: &'a mut dyn FnMut(ObjectRef),
}

impl<'a> RootSink<'a> {
    pub(crate) fn new(push: &'a mut dyn FnMut(ObjectRef)) -> Self {
        Self { push }
    }

    /// Marks `obj` reachable.
    #[inline]
    pub fn push(&mut self, obj: ObjectRef) {
        (self.push)(obj);
    }

    /// Marks every object in `objs` reachable.
    pub fn extend(&mut self, objs: impl IntoIterator<Item = ObjectRef>) {
        for obj in objs {
            self.push(obj);
        }
    }
}

impl fmt::Debug for RootSink<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootSink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{GC_OLD_MARKED, TAG_SIZE};

    #[repr(C, align(16))]
    struct Boxed([usize; 4]);

    #[test]
    fn tag_accessors_split_reserved_bits() {
        let mut cell = Boxed([0; 4]);
        cell.0[1] = (7 << TAG_RESERVED_BITS) | GC_OLD_MARKED;
        let payload = unsafe { cell.0.as_mut_ptr().cast::<u8>().add(TAG_SIZE) };
        let obj = unsafe { ObjectRef::from_raw(payload) }.expect("non-null");

        assert_eq!(obj.type_tag(), 7);
        assert_eq!(obj.gc_bits(), GC_OLD_MARKED);
        assert!(obj.is_marked());
        assert!(obj.is_old());
    }

    #[test]
    fn slots_round_trip() {
        let mut cell = Boxed([0; 4]);
        let payload = unsafe { cell.0.as_mut_ptr().cast::<u8>().add(TAG_SIZE) };
        let obj = unsafe { ObjectRef::from_raw(payload) }.expect("non-null");
        unsafe {
            assert_eq!(obj.load_slot(0), None);
            obj.store_slot_raw(1, Some(obj));
            assert_eq!(obj.load_slot(1), Some(obj));
        }
        assert!(unsafe { ObjectRef::from_raw(std::ptr::null_mut()) }.is_none());
    }

    #[test]
    fn root_sink_forwards() {
        let mut seen = Vec::new();
        let mut push = |o: ObjectRef| seen.push(o);
        let mut cell = Boxed([0; 4]);
        let payload = unsafe { cell.0.as_mut_ptr().cast::<u8>().add(TAG_SIZE) };
        let obj = unsafe { ObjectRef::from_raw(payload) }.expect("non-null");
        {
            let mut sink = RootSink::new(&mut push);
            sink.push(obj);
            sink.extend([obj, obj]);
        }
        assert_eq!(seen.len(), 3);
    }
}
