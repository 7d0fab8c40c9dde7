//! Per-mutator root tracking using a shadow stack.
//!
//! Each [`Mutator`](crate::Mutator) owns one shadow stack. Objects pushed on
//! it stay reachable until popped, or until the stack is truncated below
//! them.

use crate::object::ObjectRef;

/// Explicit roots of one mutator.
#[derive(Debug, Default)]
pub(crate) struct ShadowStack {
    roots: Vec<ObjectRef>,
}

impl ShadowStack {
    pub(crate) const fn new() -> Self {
        Self { roots: Vec::new() }
    }

    pub(crate) fn push(&mut self, obj: ObjectRef) {
        self.roots.push(obj);
    }

    pub(crate) fn pop(&mut self) -> Option<ObjectRef> {
        self.roots.pop()
    }

    /// Removes one registration of `obj`. Returns `false` if it was not rooted.
    pub(crate) fn remove(&mut self, obj: ObjectRef) -> bool {
        // Search from the top: roots are usually released in LIFO order.
        if let Some(pos) = self.roots.iter().rposition(|&r| r == obj) {
            self.roots.remove(pos);
            true
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.roots.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.roots.iter().copied()
    }

    pub(crate) fn clear(&mut self) {
        self.roots.clear();
    }

    /// Drops every root above the first `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.roots.truncate(len);
    }
}
