//! Pools of task stacks.
//!
//! Host runtimes that run coroutines or green threads can borrow stack
//! mappings from their mutator. A stack is tied to an owner object: once the
//! owner is found dead by a collection, the stack returns to its size-class
//! pool. Pools are trimmed after every collection, keeping a few mappings
//! per size for reuse.

use sys_alloc::{Mmap, MmapOptions};

use crate::error::GcError;
use crate::object::ObjectRef;

/// Stack sizes served from pools.
pub const STACK_POOL_SIZES: [usize; N_STACK_POOLS] = [
    128 << 10,
    192 << 10,
    256 << 10,
    384 << 10,
    512 << 10,
    768 << 10,
    1 << 20,
    1536 << 10,
    2 << 20,
    3 << 20,
    4 << 20,
    6 << 20,
    8 << 20,
    12 << 20,
    16 << 20,
    24 << 20,
];

const N_STACK_POOLS: usize = 16;

/// Mappings a pool keeps through a trim while its heap is alive.
const MIN_STACK_MAPPINGS_PER_POOL: usize = 5;

fn pool_index(size: usize) -> Option<usize> {
    let i = STACK_POOL_SIZES.partition_point(|&s| s < size);
    (i < N_STACK_POOLS).then_some(i)
}

/// A stack handed out to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStack {
    base: *mut u8,
    size: usize,
}

// SAFETY: a descriptor of memory owned by the stack pool.
unsafe impl Send for TaskStack {}
unsafe impl Sync for TaskStack {}

impl TaskStack {
    /// Lowest address of the stack.
    #[must_use]
    pub const fn base(&self) -> *mut u8 {
        self.base
    }

    /// Usable size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

struct LiveStack {
    map: Mmap,
    owner: ObjectRef,
}

/// Per-heap cache of stack mappings.
pub(crate) struct StackPool {
    free: [Vec<Mmap>; N_STACK_POOLS],
    live: Vec<LiveStack>,
}

impl StackPool {
    pub(crate) fn new() -> Self {
        Self {
            free: std::array::from_fn(|_| Vec::new()),
            live: Vec::new(),
        }
    }

    /// Hands out a stack of at least `size` bytes owned by `owner`.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if a new mapping cannot be created.
    pub(crate) fn alloc(&mut self, size: usize, owner: ObjectRef) -> Result<TaskStack, GcError> {
        let map = match pool_index(size) {
            Some(i) => match self.free[i].pop() {
                Some(map) => map,
                None => map_stack(STACK_POOL_SIZES[i])?,
            },
            None => map_stack(size)?,
        };
        let stack = TaskStack {
            base: map.ptr(),
            size: map.len(),
        };
        self.live.push(LiveStack { map, owner });
        Ok(stack)
    }

    /// Returns a stack to its pool before its owner dies.
    ///
    /// Returns `false` if the stack is not live in this pool.
    pub(crate) fn release(&mut self, stack: TaskStack) -> bool {
        let Some(pos) = self.live.iter().position(|l| l.map.ptr() == stack.base) else {
            return false;
        };
        let live = self.live.swap_remove(pos);
        self.cache(live.map);
        true
    }

    fn cache(&mut self, map: Mmap) {
        // Oversized stacks are not pooled; dropping unmaps them.
        if let Some(i) = STACK_POOL_SIZES.iter().position(|&s| s == map.len()) {
            self.free[i].push(map);
        }
    }

    /// Returns the stacks of owners that did not survive marking.
    ///
    /// Only valid between mark and sweep, while mark bits are current.
    pub(crate) fn sweep_dead_owners(&mut self) -> usize {
        let mut released = 0;
        let mut i = 0;
        while i < self.live.len() {
            if self.live[i].owner.is_marked() {
                i += 1;
            } else {
                let live = self.live.swap_remove(i);
                self.cache(live.map);
                released += 1;
            }
        }
        released
    }

    /// Unmaps surplus cached stacks. A dead heap gives back everything.
    pub(crate) fn trim(&mut self, heap_alive: bool) -> usize {
        let mut unmapped = 0;
        for pool in &mut self.free {
            let n = pool.len();
            let n_to_free = if !heap_alive {
                n
            } else if n > MIN_STACK_MAPPINGS_PER_POOL {
                (n / 2).min(n - MIN_STACK_MAPPINGS_PER_POOL)
            } else {
                0
            };
            pool.truncate(n - n_to_free);
            unmapped += n_to_free;
        }
        unmapped
    }

    pub(crate) fn cached(&self) -> usize {
        self.free.iter().map(Vec::len).sum()
    }

    pub(crate) fn live(&self) -> usize {
        self.live.len()
    }
}

impl std::fmt::Debug for StackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackPool")
            .field("live", &self.live())
            .field("cached", &self.cached())
            .finish()
    }
}

fn map_stack(size: usize) -> Result<Mmap, GcError> {
    let len = size.max(sys_alloc::page_size());
    // SAFETY: no hint address.
    unsafe { MmapOptions::new().len(len).no_reserve(true).map_anon() }.map_err(|source| {
        GcError::OutOfMemory {
            requested: len,
            source,
        }
    })
}
