//! Per-thread mark queues.
//!
//! Each marking thread owns two work-stealing deques: one of object
//! addresses and one of [`Chunk`]s describing unscanned suffixes of large
//! containers. The owner pushes and pops at one end; thieves take from the
//! other through the matching [`QueueStealers`].

use crossbeam::deque::{Steal, Stealer, Worker};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::object::ObjectRef;

/// Low bit of a queued address: the object came from the remembered set and
/// is already marked.
pub(crate) const REMSET_TAG: usize = 1;

/// A deferred slice of a container.
///
/// `nptr` is the 2-bit summary of the owner: bit 0 set once a young child
/// was seen, bit 1 set when the owner is old.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Chunk {
    /// Slots `begin..end`, every `step` words.
    ObjArray {
        parent: ObjectRef,
        begin: usize,
        end: usize,
        step: usize,
        nptr: usize,
    },
    /// Elements `begin..end` of `elsize` words with 8-bit field offsets.
    Array8 {
        parent: ObjectRef,
        begin: usize,
        end: usize,
        elsize: usize,
        fields: &'static [u8],
        nptr: usize,
    },
    /// Elements `begin..end` of `elsize` words with 16-bit field offsets.
    Array16 {
        parent: ObjectRef,
        begin: usize,
        end: usize,
        elsize: usize,
        fields: &'static [u16],
        nptr: usize,
    },
    /// Entries `begin..end` of a finalizer list. Null entries are skipped.
    FinList { begin: usize, end: usize },
}

/// What one thread accumulated while marking; flushed into the cycle totals
/// before the thread stops marking.
#[derive(Debug, Default)]
pub(crate) struct MarkCache {
    pub(crate) objects_marked: usize,
    pub(crate) scanned_bytes: usize,
    pub(crate) perm_scanned_bytes: usize,
    /// Old objects found pointing at young ones.
    pub(crate) remset: Vec<ObjectRef>,
}

impl MarkCache {
    pub(crate) fn merge(&mut self, other: &mut Self) {
        self.objects_marked += other.objects_marked;
        self.scanned_bytes += other.scanned_bytes;
        self.perm_scanned_bytes += other.perm_scanned_bytes;
        self.remset.append(&mut other.remset);
        other.objects_marked = 0;
        other.scanned_bytes = 0;
        other.perm_scanned_bytes = 0;
    }
}

/// The owner side of a thread's mark queues.
pub(crate) struct MarkQueue {
    ptrs: Worker<usize>,
    chunks: Worker<Chunk>,
    pub(crate) cache: MarkCache,
    pub(crate) rng: SmallRng,
}

impl MarkQueue {
    pub(crate) fn new(seed: u64) -> (Self, QueueStealers) {
        let ptrs = Worker::new_lifo();
        let chunks = Worker::new_lifo();
        let stealers = QueueStealers {
            ptrs: ptrs.stealer(),
            chunks: chunks.stealer(),
        };
        let queue = Self {
            ptrs,
            chunks,
            cache: MarkCache::default(),
            rng: SmallRng::seed_from_u64(seed),
        };
        (queue, stealers)
    }

    #[inline]
    pub(crate) fn push_obj(&self, obj: ObjectRef) {
        self.ptrs.push(obj.addr());
    }

    #[inline]
    pub(crate) fn push_remset_obj(&self, obj: ObjectRef) {
        self.ptrs.push(obj.addr() | REMSET_TAG);
    }

    #[inline]
    pub(crate) fn pop_ptr(&self) -> Option<usize> {
        self.ptrs.pop()
    }

    #[inline]
    pub(crate) fn push_chunk(&self, chunk: Chunk) {
        self.chunks.push(chunk);
    }

    #[inline]
    pub(crate) fn pop_chunk(&self) -> Option<Chunk> {
        self.chunks.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ptrs.is_empty() && self.chunks.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl std::fmt::Debug for MarkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkQueue")
            .field("ptrs", &self.ptrs.len())
            .field("chunks", &self.chunks.len())
            .finish_non_exhaustive()
    }
}

/// The thief side of a thread's mark queues.
#[derive(Debug, Clone)]
pub(crate) struct QueueStealers {
    ptrs: Stealer<usize>,
    chunks: Stealer<Chunk>,
}

impl QueueStealers {
    /// Items currently observable in both queues.
    pub(crate) fn work(&self) -> usize {
        self.ptrs.len() + self.chunks.len()
    }

    pub(crate) fn steal_ptr(&self) -> Option<usize> {
        retry(|| self.ptrs.steal())
    }

    pub(crate) fn steal_chunk(&self) -> Option<Chunk> {
        retry(|| self.chunks.steal())
    }
}

fn retry<T>(mut steal: impl FnMut() -> Steal<T>) -> Option<T> {
    loop {
        match steal() {
            Steal::Success(v) => return Some(v),
            Steal::Empty => return None,
            Steal::Retry => std::hint::spin_loop(),
        }
    }
}
