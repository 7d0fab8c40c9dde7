//! Finalizer registry.
//!
//! A registered object is not a root. When a cycle finds it unmarked, its
//! address moves to `to_finalize`, which is then marked so the object and
//! everything it references survive until the finalizer has run. Entries of
//! `to_finalize` stay roots until their finalizer returns; a finished entry
//! is zeroed so that in-flight indices stay valid.

use crate::object::ObjectRef;

/// A finalizer callback.
pub(crate) type Finalizer = Box<dyn FnOnce(ObjectRef) + Send>;

/// A finalizer whose object is dead, with its slot in `to_finalize`.
pub(crate) struct ReadyFinalizer {
    slot: usize,
    obj: ObjectRef,
    f: Finalizer,
}

#[derive(Default)]
pub(crate) struct Finalizers {
    objs: Vec<ObjectRef>,
    fns: Vec<Finalizer>,
    to_finalize: Vec<usize>,
    ready: Vec<ReadyFinalizer>,
}

impl Finalizers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, obj: ObjectRef, f: Finalizer) {
        self.objs.push(obj);
        self.fns.push(f);
    }

    pub(crate) fn registered(&self) -> usize {
        self.objs.len()
    }

    /// Objects waiting for, or running, their finalizer. Null entries are
    /// finished slots.
    pub(crate) fn pending(&self) -> &[usize] {
        &self.to_finalize
    }

    /// Moves every unmarked registered object to `to_finalize`. Returns the
    /// index of the first new entry.
    pub(crate) fn schedule_unmarked(&mut self) -> usize {
        let first = self.to_finalize.len();
        let mut i = 0;
        while i < self.objs.len() {
            if self.objs[i].is_marked() {
                i += 1;
                continue;
            }
            let obj = self.objs.swap_remove(i);
            let f = self.fns.swap_remove(i);
            let slot = self.to_finalize.len();
            self.to_finalize.push(obj.addr());
            self.ready.push(ReadyFinalizer { slot, obj, f });
        }
        first
    }

    pub(crate) fn take_ready(&mut self) -> Vec<ReadyFinalizer> {
        std::mem::take(&mut self.ready)
    }

    /// Releases the root held for a finished finalizer.
    pub(crate) fn finish(&mut self, slot: usize) {
        self.to_finalize[slot] = 0;
        while self.to_finalize.last() == Some(&0) {
            self.to_finalize.pop();
        }
    }
}

impl std::fmt::Debug for Finalizers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizers")
            .field("registered", &self.objs.len())
            .field("to_finalize", &self.to_finalize.len())
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl ReadyFinalizer {
    pub(crate) const fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn run(self) {
        (self.f)(self.obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{GC_MARKED, TAG_SIZE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[repr(C, align(16))]
    struct FakeObj([AtomicUsize; 2]);

    impl FakeObj {
        fn new() -> Self {
            Self([AtomicUsize::new(0), AtomicUsize::new(0)])
        }

        fn obj(&self) -> ObjectRef {
            let p = std::ptr::from_ref(self).cast::<u8>().cast_mut();
            unsafe { ObjectRef::from_raw(p.add(TAG_SIZE)) }.expect("non-null")
        }
    }

    #[test]
    fn only_unmarked_objects_are_scheduled() {
        let live = FakeObj::new();
        let dead = FakeObj::new();
        live.0[0].store(GC_MARKED, Ordering::Relaxed);
        let ran = Arc::new(AtomicUsize::new(0));

        let mut fins = Finalizers::new();
        for o in [&live, &dead] {
            let ran = Arc::clone(&ran);
            fins.register(o.obj(), Box::new(move |_: ObjectRef| {
                ran.fetch_add(1, Ordering::Relaxed);
            }));
        }

        assert_eq!(fins.schedule_unmarked(), 0);
        assert_eq!(fins.registered(), 1);
        assert_eq!(fins.pending(), &[dead.obj().addr()]);

        let ready = fins.take_ready();
        assert_eq!(ready.len(), 1);
        for r in ready {
            let slot = r.slot();
            r.run();
            fins.finish(slot);
        }
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert!(fins.pending().is_empty());
    }

    #[test]
    fn finishing_out_of_order_keeps_slots_stable() {
        let a = FakeObj::new();
        let b = FakeObj::new();
        let mut fins = Finalizers::new();
        fins.register(a.obj(), Box::new(|_: ObjectRef| {}));
        fins.register(b.obj(), Box::new(|_: ObjectRef| {}));
        fins.schedule_unmarked();
        let ready = fins.take_ready();
        assert_eq!(fins.pending().len(), 2);

        fins.finish(0);
        assert_eq!(fins.pending()[0], 0);
        assert_eq!(fins.pending().len(), 2);
        fins.finish(1);
        assert!(fins.pending().is_empty());
        drop(ready);
    }
}
