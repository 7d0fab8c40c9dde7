//! Full-sweep decisions and the heap-target controller.
//!
//! Every cycle first decides between a quick sweep (old pages without young
//! objects are skipped) and a full sweep. The reasons that can escalate a
//! cycle are counted in [`FullSweepReasons`].
//!
//! After the sweep, [`HeapBalancer`] derives the next heap target from the
//! smoothed allocation rate of the mutators and the collection rate of the
//! collector, so that a fast-allocating program gets proportionally more
//! headroom.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Which collection a caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CollectionKind {
    /// Let the heuristics choose between a quick and a full sweep.
    #[default]
    Auto,
    /// Sweep fully, re-collecting once if the previous sweep was quick.
    Full,
}

impl CollectionKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Full => "full",
        }
    }
}

// ===== Reasons =====

/// Why a cycle swept fully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FullSweepReason {
    /// [`GcConfig::always_full`](crate::GcConfig::always_full) is set.
    AlwaysFull = 0,
    /// A full collection was requested after a quick sweep.
    Forced = 1,
    /// The heap outgrew [`GcConfig::max_total_memory`](crate::GcConfig::max_total_memory).
    UserMaxExceeded = 2,
    /// Too many bytes were promoted since the last full sweep.
    LargePromotionRate = 3,
}

impl FullSweepReason {
    /// Every reason, in counter order.
    pub const ALL: [Self; 4] = [
        Self::AlwaysFull,
        Self::Forced,
        Self::UserMaxExceeded,
        Self::LargePromotionRate,
    ];

    /// Short name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AlwaysFull => "always_full",
            Self::Forced => "forced",
            Self::UserMaxExceeded => "user_max_exceeded",
            Self::LargePromotionRate => "large_promotion_rate",
        }
    }
}

/// A set of [`FullSweepReason`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReasonSet(u8);

impl ReasonSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Whether `reason` is in the set.
    #[must_use]
    pub const fn contains(self, reason: FullSweepReason) -> bool {
        self.0 & (1 << reason as u8) != 0
    }

    /// Whether the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn insert(&mut self, reason: FullSweepReason) {
        self.0 |= 1 << reason as u8;
    }

    /// The reasons in the set, in counter order.
    pub fn iter(self) -> impl Iterator<Item = FullSweepReason> {
        FullSweepReason::ALL
            .into_iter()
            .filter(move |&r| self.contains(r))
    }
}

/// Process counters of full-sweep reasons.
#[derive(Debug, Default)]
pub struct FullSweepReasons {
    counts: [AtomicU64; 4],
}

impl FullSweepReasons {
    /// All counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counts: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    /// Cycles escalated for `reason`.
    #[must_use]
    pub fn get(&self, reason: FullSweepReason) -> u64 {
        self.counts[reason as usize].load(Ordering::Relaxed)
    }

    /// Every counter, in [`FullSweepReason::ALL`] order.
    #[must_use]
    pub fn snapshot(&self) -> [u64; 4] {
        std::array::from_fn(|i| self.counts[i].load(Ordering::Relaxed))
    }

    pub(crate) fn record(&self, reasons: ReasonSet) {
        for reason in reasons.iter() {
            self.counts[reason as usize].fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ===== Decision =====

/// What the full-sweep decision looks at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepInputs {
    pub(crate) kind: CollectionKind,
    pub(crate) always_full: bool,
    pub(crate) prev_sweep_full: bool,
    pub(crate) heap_size: usize,
    pub(crate) max_total_memory: usize,
    pub(crate) promoted_since_full: usize,
    pub(crate) live_at_last_full: usize,
    pub(crate) collect_interval: usize,
    pub(crate) promotion_rate_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepDecision {
    pub(crate) full: bool,
    pub(crate) recollect: bool,
    pub(crate) reasons: ReasonSet,
}

/// Decides whether this cycle sweeps fully. Every applicable reason is
/// reported, not just the first.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn decide_full_sweep(inputs: &SweepInputs) -> SweepDecision {
    let mut reasons = ReasonSet::EMPTY;
    let mut recollect = false;
    if inputs.always_full {
        reasons.insert(FullSweepReason::AlwaysFull);
    }
    if inputs.kind == CollectionKind::Full && !inputs.prev_sweep_full {
        reasons.insert(FullSweepReason::Forced);
        recollect = true;
    }
    if inputs.heap_size > inputs.max_total_memory {
        reasons.insert(FullSweepReason::UserMaxExceeded);
    }
    let base = inputs.live_at_last_full.max(inputs.collect_interval);
    if inputs.promoted_since_full as f64 > inputs.promotion_rate_threshold * base as f64 {
        reasons.insert(FullSweepReason::LargePromotionRate);
    }
    SweepDecision {
        full: !reasons.is_empty(),
        recollect,
        reasons,
    }
}

// ===== Heap target =====

const ALLOC_SMOOTHING: f64 = 0.95;
const COLLECT_SMOOTHING: f64 = 0.5;
const TUNING_FACTOR: f64 = 2e4;
const SMOOTH_CEILING: f64 = (2u64 << 36) as f64;

/// One cycle's worth of controller input.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CycleSample {
    /// Bytes allocated since the previous cycle ended.
    pub(crate) allocated: usize,
    /// Bytes this cycle freed.
    pub(crate) freed: usize,
    /// Time the mutators ran since the previous cycle.
    pub(crate) mutator_time: Duration,
    /// Length of the pause.
    pub(crate) pause: Duration,
    /// Part of the pause spent sweeping. Charged to the mutators.
    pub(crate) sweep_time: Duration,
    /// Heap size after the sweep.
    pub(crate) heap_size: usize,
}

fn smooth(old: f64, new: f64, factor: f64) -> f64 {
    let est = factor.mul_add(old, (1.0 - factor) * new);
    est.clamp(1.0, SMOOTH_CEILING)
}

/// Computes the heap size at which the next automatic collection runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeapBalancer {
    alloc_bytes: f64,
    alloc_time: f64,
    gc_bytes: f64,
    gc_time: f64,
    thrash_counter: u32,
    thrashing: bool,
}

impl HeapBalancer {
    pub(crate) const fn new() -> Self {
        Self {
            alloc_bytes: 0.0,
            alloc_time: 0.0,
            gc_bytes: 0.0,
            gc_time: 0.0,
            thrash_counter: 0,
            thrashing: false,
        }
    }

    #[cfg(test)]
    pub(crate) const fn is_thrashing(&self) -> bool {
        self.thrashing
    }

    /// Feeds one cycle and returns the next heap target.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub(crate) fn update(
        &mut self,
        sample: &CycleSample,
        current_target: usize,
        collect_interval: usize,
        max_total_memory: usize,
    ) -> usize {
        let mutator_ns = sample.mutator_time.as_nanos() as f64;
        let pause_ns = sample.pause.as_nanos() as f64;
        let sweep_ns = sample.sweep_time.as_nanos() as f64;

        self.alloc_bytes = smooth(self.alloc_bytes, sample.allocated as f64, ALLOC_SMOOTHING);
        self.alloc_time = smooth(self.alloc_time, mutator_ns + sweep_ns, ALLOC_SMOOTHING);
        self.gc_bytes = smooth(self.gc_bytes, sample.freed as f64, COLLECT_SMOOTHING);
        self.gc_time = smooth(self.gc_time, (pause_ns - sweep_ns).max(0.0), COLLECT_SMOOTHING);

        // More time collecting than mutating.
        if pause_ns > mutator_ns && self.thrash_counter < 4 {
            self.thrash_counter += 1;
        } else if self.thrash_counter > 0 {
            self.thrash_counter -= 1;
        }
        if !self.thrashing && self.thrash_counter >= 3 {
            self.thrashing = true;
            self.thrash_counter = 6;
        } else if self.thrashing && self.thrash_counter <= 2 {
            self.thrashing = false;
        }

        let interval = collect_interval.max(1) as f64;
        let heap = sample.heap_size as f64;
        let alloc_rate = self.alloc_bytes / self.alloc_time;
        let gc_rate = self.gc_bytes / self.gc_time;
        let mut target_allocs = ((heap / interval) * alloc_rate / (gc_rate * TUNING_FACTOR)).sqrt();

        // A target more than twice the current one is not trusted.
        let unreasonable = target_allocs.mul_add(interval, heap) > 2.0 * current_target as f64;
        if !target_allocs.is_finite() || target_allocs == 0.0 || self.thrashing || unreasonable {
            target_allocs = 2.0 * (heap / interval).sqrt();
        }
        let target = target_allocs.mul_add(interval, heap);
        let target = if target >= usize::MAX as f64 {
            usize::MAX
        } else {
            target as usize
        };

        if target > max_total_memory && !self.thrashing {
            max_total_memory.max(collect_interval)
        } else {
            target.max(collect_interval)
        }
    }
}
