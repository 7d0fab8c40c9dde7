//! Lock-free stacks of page metadata.
//!
//! These stacks move pages between pools, sweepers and the page allocator.
//! They are not ABA safe. Correctness relies on the hand-off discipline of the
//! collector: a page popped from a stack is owned by the popper and is only
//! pushed again by sweep or reclaim code, never back onto the same stack by a
//! racing popper. Do not use this type for anything else.

use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::page::{PageMeta, PageRef};

/// Intrusive Treiber stack linked through [`PageMeta::next`].
#[derive(Debug)]
pub(crate) struct PageStack {
    bottom: AtomicPtr<PageMeta>,
}

impl PageStack {
    pub(crate) const fn new() -> Self {
        Self {
            bottom: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bottom.load(Ordering::Acquire).is_null()
    }

    /// Pushes `page`; retries until the CAS succeeds.
    pub(crate) fn push(&self, page: PageRef) {
        let mut old = self.bottom.load(Ordering::Relaxed);
        loop {
            page.next.store(old, Ordering::Relaxed);
            match self
                .bottom
                .compare_exchange_weak(old, page.as_ptr(), Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(cur) => {
                    old = cur;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Pops a page, spinning for as long as the stack is contended.
    pub(crate) fn pop(&self) -> Option<PageRef> {
        loop {
            let old = self.bottom.load(Ordering::Acquire);
            if old.is_null() {
                return None;
            }
            // SAFETY: non-null entries are live metadata.
            let next = unsafe { (*old).next.load(Ordering::Relaxed) };
            if self
                .bottom
                .compare_exchange_weak(old, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: checked non-null above.
                return Some(unsafe { PageRef::from_raw(old) });
            }
            std::hint::spin_loop();
        }
    }

    /// Pops a page, giving up after `max_attempts` failed CAS rounds.
    ///
    /// Giving up is reported as `None`, the same as an empty stack; callers
    /// fall back to another source or retry later.
    pub(crate) fn try_pop(&self, max_attempts: u32) -> Option<PageRef> {
        for _ in 0..max_attempts.max(1) {
            let old = self.bottom.load(Ordering::Acquire);
            if old.is_null() {
                return None;
            }
            // SAFETY: non-null entries are live metadata.
            let next = unsafe { (*old).next.load(Ordering::Relaxed) };
            if self
                .bottom
                .compare_exchange_weak(old, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: checked non-null above.
                return Some(unsafe { PageRef::from_raw(old) });
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Push for phases where the caller is the only thread touching the stack.
    pub(crate) fn push_nosync(&self, page: PageRef) {
        page.next
            .store(self.bottom.load(Ordering::Relaxed), Ordering::Relaxed);
        self.bottom.store(page.as_ptr(), Ordering::Relaxed);
    }

    /// Pop for phases where the caller is the only thread touching the stack.
    pub(crate) fn pop_nosync(&self) -> Option<PageRef> {
        let old = self.bottom.load(Ordering::Relaxed);
        if old.is_null() {
            return None;
        }
        // SAFETY: non-null entries are live metadata.
        unsafe {
            self.bottom
                .store((*old).next.load(Ordering::Relaxed), Ordering::Relaxed);
            Some(PageRef::from_raw(old))
        }
    }

    /// Detaches the whole chain, leaving the stack empty.
    pub(crate) fn take(&self) -> Option<PageRef> {
        let old = self.bottom.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: non-null entries are live metadata.
        (!old.is_null()).then(|| unsafe { PageRef::from_raw(old) })
    }

    /// Replaces the contents with the chain headed by `head`.
    ///
    /// Only valid while no other thread uses either stack.
    pub(crate) fn replace(&self, head: Option<PageRef>) {
        self.bottom.store(
            head.map_or(ptr::null_mut(), PageRef::as_ptr),
            Ordering::Release,
        );
    }

    /// Walks the chain without popping. Only valid while the stack is quiescent.
    pub(crate) fn iter(&self) -> impl Iterator<Item = PageRef> + '_ {
        let mut cur = self.bottom.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            // SAFETY: non-null entries are live metadata.
            let page = unsafe { PageRef::from_raw(cur) };
            cur = page.next.load(Ordering::Relaxed);
            Some(page)
        })
    }
}

impl Default for PageStack {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`PageStack`] alone on its own 128 bytes so independently contended
/// stacks never share a cache line.
#[derive(Debug, Default)]
#[repr(C, align(128))]
pub(crate) struct PaddedPageStack {
    stack: PageStack,
}

const _: () = assert!(std::mem::size_of::<PaddedPageStack>() == 128);

impl PaddedPageStack {
    pub(crate) const fn new() -> Self {
        Self {
            stack: PageStack::new(),
        }
    }
}

impl Deref for PaddedPageStack {
    type Target = PageStack;

    fn deref(&self) -> &PageStack {
        &self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(n: usize) -> Vec<Box<PageMeta>> {
        (0..n)
            .map(|i| Box::new(PageMeta::new((i * 0x4000) as *mut u8)))
            .collect()
    }

    #[test]
    fn push_pop_is_lifo() {
        let metas = pages(16);
        let stack = PageStack::new();
        for m in &metas {
            stack.push(PageRef::new(m));
        }
        for m in metas.iter().rev() {
            let got = stack.pop().expect("stack drained early");
            assert_eq!(got.as_ptr().cast_const(), std::ptr::from_ref(&**m));
        }
        assert!(stack.pop().is_none());
        assert!(stack.is_empty());
    }

    #[test]
    fn try_pop_on_empty_returns_none() {
        let stack = PageStack::new();
        assert!(stack.try_pop(1).is_none());
        assert!(stack.try_pop(1024).is_none());
        assert!(stack.try_pop(0).is_none());
    }

    #[test]
    fn nosync_variants_share_layout() {
        let metas = pages(3);
        let stack = PaddedPageStack::new();
        stack.push_nosync(PageRef::new(&metas[0]));
        stack.push(PageRef::new(&metas[1]));
        stack.push_nosync(PageRef::new(&metas[2]));
        assert_eq!(stack.iter().count(), 3);
        assert_eq!(stack.pop_nosync().map(|p| p.data()), Some(metas[2].data()));
        assert_eq!(stack.try_pop(4).map(|p| p.data()), Some(metas[1].data()));
        assert_eq!(stack.pop().map(|p| p.data()), Some(metas[0].data()));
        assert!(stack.pop_nosync().is_none());
    }

    #[test]
    fn take_and_replace_move_chains() {
        let metas = pages(4);
        let a = PageStack::new();
        let b = PageStack::new();
        for m in &metas {
            a.push(PageRef::new(m));
        }
        b.replace(a.take());
        assert!(a.is_empty());
        assert_eq!(b.iter().count(), 4);
    }

    #[test]
    fn concurrent_pops_hand_out_each_page_once() {
        let metas = pages(256);
        let stack = std::sync::Arc::new(PageStack::new());
        for m in &metas {
            stack.push(PageRef::new(m));
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stack = std::sync::Arc::clone(&stack);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(p) = stack.pop() {
                        got.push(p.data() as usize);
                    }
                    got
                })
            })
            .collect();
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 256);
    }
}
