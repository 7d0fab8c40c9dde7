//! Mutator handles.
//!
//! A [`Mutator`] is one thread's view of a [`Collector`]: it owns a heap with
//! its pools, young big objects, remembered set and shadow stack. Mutators
//! must reach a safepoint regularly so that a cycle started by another thread
//! can stop the world.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::collector::{Collector, GcShared};
use crate::error::GcError;
use crate::gc::heuristics::CollectionKind;
use crate::heap::{size_class_index, ThreadHeap};
use crate::metrics::PauseInfo;
use crate::object::ObjectRef;
use crate::page::{tag_word, GC_OLD, GC_OLD_MARKED, MAX_TYPE_TAG, TAG_SIZE};
use crate::stack_pool::TaskStack;

/// A thread attached to a [`Collector`].
///
/// While a `Mutator` exists, its thread counts as running: cycles wait for it
/// to call [`Mutator::safepoint`], allocate, or enter
/// [`Mutator::enter_gc_safe`]. Dropping it detaches the thread and releases
/// its heap for reuse; objects it allocated stay managed.
pub struct Mutator {
    collector: Arc<Collector>,
    heap: Arc<ThreadHeap>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Mutator {
    pub(crate) fn new(collector: Arc<Collector>, heap: Arc<ThreadHeap>) -> Self {
        Self {
            collector,
            heap,
            _not_sync: PhantomData,
        }
    }

    fn shared(&self) -> &GcShared {
        self.collector.shared()
    }

    /// The collector this mutator is attached to.
    #[must_use]
    pub const fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    // ===== Allocation =====

    /// Allocates an object with a zeroed `size`-byte payload and the host
    /// type tag `type_tag`.
    ///
    /// Sizes up to 2032 bytes including the tag word come from a size-class
    /// pool; larger objects are allocated individually. The new object is
    /// unrooted: push it on the shadow stack or store it into a reachable
    /// object before the next safepoint.
    ///
    /// # Errors
    ///
    /// [`GcError::ObjectTooLarge`] if the size overflows, and
    /// [`GcError::OutOfMemory`] if the OS refuses memory.
    ///
    /// # Panics
    ///
    /// If `type_tag` exceeds [`MAX_TYPE_TAG`].
    pub fn alloc(&self, size: usize, type_tag: usize) -> Result<ObjectRef, GcError> {
        assert!(type_tag <= MAX_TYPE_TAG, "type tag {type_tag} does not fit the tag word");
        let shared = self.shared();
        let alloc_size = size
            .checked_add(TAG_SIZE)
            .ok_or(GcError::ObjectTooLarge { size })?;
        if let Some(pool_n) = size_class_index(alloc_size) {
            if self.heap.local.lock().needs_page(pool_n) {
                self.alloc_slow_path();
            }
            self.heap.local.lock().pool_alloc(
                &self.heap,
                &shared.pages,
                pool_n,
                type_tag,
                shared.config.max_pop_attempts(),
            )
        } else {
            self.alloc_slow_path();
            self.heap.local.lock().big_alloc(&shared.pages, size, type_tag)
        }
    }

    /// Reaches a safepoint and, once the heap is over its target, collects.
    fn alloc_slow_path(&self) {
        self.safepoint();
        let shared = self.shared();
        let status = &shared.pages.status;
        if shared.config.auto_collect() && status.heap_size() >= status.heap_target() {
            self.collect(CollectionKind::Auto);
        }
    }

    // ===== Collection =====

    /// Runs a collection cycle.
    ///
    /// Returns the pause report, or `None` if another thread was already
    /// collecting; that cycle has finished when this returns.
    pub fn collect(&self, kind: CollectionKind) -> Option<PauseInfo> {
        self.shared().collect(&self.heap, kind)
    }

    /// Parks while another thread collects.
    #[inline]
    pub fn safepoint(&self) {
        let world = &self.shared().world;
        if world.gc_requested() {
            world.park();
        }
    }

    /// Runs `f` without blocking collections, e.g. around a blocking call.
    ///
    /// `f` must not touch managed objects: a cycle may sweep concurrently.
    pub fn enter_gc_safe<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared().world.gc_safe(f)
    }

    // ===== Write barrier =====

    /// Remembers `obj` after an old-to-young store into it.
    ///
    /// Clears the object's old bit so the barrier fires once per cycle.
    pub fn queue_root(&self, obj: ObjectRef) {
        // SAFETY: `obj` is a managed object.
        let tag = unsafe { tag_word(obj.as_ptr()) };
        let prev = tag.fetch_and(!GC_OLD, Ordering::AcqRel);
        if prev & GC_OLD != 0 {
            self.heap.local.lock().remset.push(obj);
        }
    }

    /// Records the reference `parent -> child` if it crosses from the old to
    /// the young generation.
    #[inline]
    pub fn write_barrier(&self, parent: ObjectRef, child: ObjectRef) {
        if parent.gc_bits() == GC_OLD_MARKED && !child.is_marked() {
            self.queue_root(parent);
        }
    }

    /// Stores `value` into payload word `index` of `parent` and applies the
    /// write barrier.
    ///
    /// # Safety
    ///
    /// `parent`'s payload must be at least `index + 1` words long and the
    /// word must be one of its reference slots.
    pub unsafe fn store_slot(&self, parent: ObjectRef, index: usize, value: Option<ObjectRef>) {
        // SAFETY: forwarded from the caller.
        unsafe { parent.store_slot_raw(index, value) };
        if let Some(child) = value {
            self.write_barrier(parent, child);
        }
    }

    // ===== Roots =====

    /// Keeps `obj` alive until it is popped or removed.
    pub fn push_root(&self, obj: ObjectRef) {
        self.heap.local.lock().roots.push(obj);
    }

    /// Drops the most recently pushed root.
    pub fn pop_root(&self) -> Option<ObjectRef> {
        self.heap.local.lock().roots.pop()
    }

    /// Drops one registration of `obj`. Returns `false` if it was not rooted.
    pub fn remove_root(&self, obj: ObjectRef) -> bool {
        self.heap.local.lock().roots.remove(obj)
    }

    /// Roots on the shadow stack.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.heap.local.lock().roots.len()
    }

    /// Drops every root above the first `len`, like unwinding a frame.
    pub fn truncate_roots(&self, len: usize) {
        self.heap.local.lock().roots.truncate(len);
    }

    // ===== Finalizers =====

    /// See [`Collector::register_finalizer`].
    pub fn register_finalizer(&self, obj: ObjectRef, f: impl FnOnce(ObjectRef) + Send + 'static) {
        self.collector.register_finalizer(obj, f);
    }

    // ===== Task stacks =====

    /// Borrows a stack of at least `size` bytes for a task represented by
    /// `owner`. The stack returns to the pool once `owner` dies.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if a new mapping cannot be created.
    pub fn alloc_task_stack(&self, owner: ObjectRef, size: usize) -> Result<TaskStack, GcError> {
        self.heap.stacks.lock().alloc(size, owner)
    }

    /// Returns a stack before its owner dies. Returns `false` if the stack
    /// was not handed out by this mutator.
    pub fn release_task_stack(&self, stack: TaskStack) -> bool {
        self.heap.stacks.lock().release(stack)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.heap.local.lock().roots.clear();
        self.heap.in_use.store(false, Ordering::Release);
        self.shared().world.detach();
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("heap", &self.heap.index)
            .finish_non_exhaustive()
    }
}
