//! Collection metrics, pause reports and hook payloads.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Phases of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePhase {
    /// Seeding the mark queue from every root.
    Roots,
    /// Draining the mark queues.
    Mark,
    /// Moving dead finalizable objects aside and marking them.
    Finalizers,
    /// Sweeping big objects, pool pages and task stacks.
    Sweep,
    /// Returning lazily freed pages and cached stacks to the OS.
    Reclaim,
}

/// The structured event emitted at the end of every pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseInfo {
    /// Wall time the world was stopped.
    pub pause: Duration,
    /// Bytes reclaimed by this cycle.
    pub freed: usize,
    /// Whether the cycle swept fully.
    pub full: bool,
    /// Whether another cycle was requested to finish reclaiming old garbage.
    pub recollect: bool,
    /// Live bytes after the sweep.
    pub live_bytes: usize,
}

/// Totals gathered by the mark phase, handed to the verify hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkSummary {
    /// Objects marked this cycle.
    pub objects_marked: usize,
    /// Bytes of young objects marked.
    pub scanned_bytes: usize,
    /// Bytes of old objects marked.
    pub perm_scanned_bytes: usize,
    /// Remembered-set entries carried into the next cycle.
    pub remset_len: usize,
}

/// Per-page sweep report for the memory-profile hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSweepRecord {
    /// Page base address.
    pub page: usize,
    /// Block size.
    pub osize: usize,
    /// Free blocks after the sweep.
    pub nfree: usize,
    /// The page had no live block and went back to the page stacks.
    pub released: bool,
}

/// Statistics from one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcMetrics {
    /// Duration of the pause.
    pub duration: Duration,
    /// Duration of root seeding plus marking.
    pub mark_duration: Duration,
    /// Duration of the sweep.
    pub sweep_duration: Duration,
    /// Bytes reclaimed.
    pub bytes_reclaimed: usize,
    /// Live bytes after the sweep.
    pub bytes_surviving: usize,
    /// Objects marked.
    pub objects_marked: usize,
    /// Pool pages walked by the sweep.
    pub pages_swept: usize,
    /// Pool pages skipped by a quick sweep.
    pub pages_skipped: usize,
    /// Pool pages that became entirely free.
    pub pages_released: usize,
    /// Big objects freed.
    pub big_objects_freed: usize,
    /// Whether the sweep was full.
    pub full: bool,
    /// Whether a re-collection was requested.
    pub recollect: bool,
}

/// Captures phase durations while the `timing` capability is on.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Accumulated mark time.
    pub mark: Duration,
    /// Accumulated sweep time.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// Create a timer with every duration at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Time since the last `start`, clearing it.
    pub fn lap(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End a mark sub-phase and add its duration.
    pub fn end_mark(&mut self) -> Duration {
        let d = self.lap();
        self.mark += d;
        d
    }

    /// End a sweep sub-phase and add its duration.
    pub fn end_sweep(&mut self) -> Duration {
        let d = self.lap();
        self.sweep += d;
        d
    }
}

/// Process-level cumulative statistics across every collector.
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    full_collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
    max_pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create a new `GlobalMetrics` with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            full_collections: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            max_pause_ns: AtomicU64::new(0),
        }
    }

    /// Total collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Total collections that swept fully.
    #[inline]
    #[must_use]
    pub fn total_full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Total bytes reclaimed.
    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Total pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    /// Longest single pause in nanoseconds.
    #[inline]
    #[must_use]
    pub fn max_pause_ns(&self) -> u64 {
        self.max_pause_ns.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, metrics: &GcMetrics) {
        let ns = metrics.duration.as_nanos().try_into().unwrap_or(u64::MAX);
        self.collections.fetch_add(1, Ordering::Relaxed);
        if metrics.full {
            self.full_collections.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_reclaimed
            .fetch_add(metrics.bytes_reclaimed, Ordering::Relaxed);
        self.pause_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_pause_ns.fetch_max(ns, Ordering::Relaxed);
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Cumulative metrics for the process.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_timer_accumulates() {
        let mut timer = PhaseTimer::new();
        assert_eq!(timer.lap(), Duration::ZERO);

        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        let first = timer.end_mark();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        let second = timer.end_mark();

        assert!(first > Duration::ZERO);
        assert_eq!(timer.mark, first + second);
        assert_eq!(timer.sweep, Duration::ZERO);
    }

    #[test]
    fn global_metrics_record() {
        let g = GlobalMetrics::new();
        g.record(&GcMetrics {
            duration: Duration::from_nanos(500),
            bytes_reclaimed: 64,
            full: true,
            ..GcMetrics::default()
        });
        g.record(&GcMetrics {
            duration: Duration::from_nanos(200),
            ..GcMetrics::default()
        });
        assert_eq!(g.total_collections(), 2);
        assert_eq!(g.total_full_collections(), 1);
        assert_eq!(g.total_bytes_reclaimed(), 64);
        assert_eq!(g.total_pause_ns(), 700);
        assert_eq!(g.max_pause_ns(), 500);
    }
}
