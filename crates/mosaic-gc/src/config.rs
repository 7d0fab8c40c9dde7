//! Collector configuration and capability hooks.

use std::time::Duration;

use crate::metrics::{CyclePhase, MarkSummary, PageSweepRecord, PauseInfo};

/// Default minimum collection interval: 5600 KiB per pointer byte.
pub const DEFAULT_COLLECT_INTERVAL: usize = 5600 * 1024 * std::mem::size_of::<usize>();

#[cfg(target_pointer_width = "64")]
const DEFAULT_MAX_TOTAL_MEMORY: usize = 2 << 40;
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_MAX_TOTAL_MEMORY: usize = 2 << 30;

/// Optional instrumentation the collector calls into.
///
/// Each flag enables the matching [`GcHooks`] callback; with a flag off the
/// callback is never invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// Log every pause through `tracing` and report per-phase events.
    pub debug_logging: bool,
    /// Call [`GcHooks::verify_mark`] after marking.
    pub verify: bool,
    /// Time each phase and report it through [`GcHooks::phase_timing`].
    pub timing: bool,
    /// Report every swept page through [`GcHooks::page_swept`].
    pub memory_profile: bool,
}

/// Configuration for a [`Collector`](crate::Collector).
///
/// Fields are set through the `set_*` methods, which clamp degenerate
/// values, and read through the accessors of the same name.
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct GcConfig {
    /// Parallel mark/sweep worker threads. 0 marks and sweeps serially on the
    /// collecting thread.
    mark_threads: usize,
    /// Run the concurrent collector thread that reclaims pages and trims
    /// stack pools after the pause.
    concurrent_sweep: bool,
    /// Make every collection a full sweep.
    always_full: bool,
    /// Heap size above which every collection is a full sweep.
    max_total_memory: usize,
    /// Minimum bytes allocated between collections. Also the amount of freed
    /// page memory kept resident and the per-heap buffered page budget.
    collect_interval: usize,
    /// Promoted bytes since the last full sweep, relative to the live bytes
    /// at that sweep, that escalate a collection to a full sweep.
    promotion_rate_threshold: f64,
    /// CAS rounds before a bounded page-stack pop gives up.
    max_pop_attempts: u32,
    /// Element count above which an array is scanned in chunks.
    chunk_batch_size: usize,
    /// Page bytes below which pool sweeping stays on the collecting thread.
    parallel_sweep_bytes: usize,
    /// Pages requested from the OS per mapping.
    block_pages: usize,
    /// Collect from the allocation slow path once the heap target is reached.
    auto_collect: bool,
    /// Enabled instrumentation.
    capabilities: Capabilities,
}

impl Default for GcConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            mark_threads: cores.saturating_sub(1).min(4),
            concurrent_sweep: false,
            always_full: false,
            max_total_memory: DEFAULT_MAX_TOTAL_MEMORY,
            collect_interval: DEFAULT_COLLECT_INTERVAL,
            promotion_rate_threshold: 1.0,
            max_pop_attempts: 1 << 10,
            chunk_batch_size: 1 << 16,
            parallel_sweep_bytes: 4 << 20,
            block_pages: 256,
            auto_collect: true,
            capabilities: Capabilities::default(),
        }
    }
}

impl GcConfig {
    /// Default configuration with `mark_threads` parallel workers.
    #[must_use]
    pub fn new(mark_threads: usize) -> Self {
        Self {
            mark_threads,
            ..Default::default()
        }
    }

    /// Whether marking and pool sweeping use the worker pool.
    #[must_use]
    pub const fn use_parallel(&self) -> bool {
        self.mark_threads > 0
    }

    // ===== Accessors =====

    /// Parallel mark/sweep worker threads.
    #[must_use]
    pub const fn mark_threads(&self) -> usize {
        self.mark_threads
    }

    /// Whether the concurrent collector thread runs.
    #[must_use]
    pub const fn concurrent_sweep(&self) -> bool {
        self.concurrent_sweep
    }

    /// Whether every collection is a full sweep.
    #[must_use]
    pub const fn always_full(&self) -> bool {
        self.always_full
    }

    /// The user heap ceiling.
    #[must_use]
    pub const fn max_total_memory(&self) -> usize {
        self.max_total_memory
    }

    /// The minimum collection interval, at least one page.
    #[must_use]
    pub const fn collect_interval(&self) -> usize {
        self.collect_interval
    }

    /// The promotion-rate escalation threshold.
    #[must_use]
    pub const fn promotion_rate_threshold(&self) -> f64 {
        self.promotion_rate_threshold
    }

    /// The bounded-pop budget, at least 1.
    #[must_use]
    pub const fn max_pop_attempts(&self) -> u32 {
        self.max_pop_attempts
    }

    /// The array chunking threshold, at least 1.
    #[must_use]
    pub const fn chunk_batch_size(&self) -> usize {
        self.chunk_batch_size
    }

    /// The parallel pool-sweep threshold.
    #[must_use]
    pub const fn parallel_sweep_bytes(&self) -> usize {
        self.parallel_sweep_bytes
    }

    /// Pages mapped per OS request, at least 1.
    #[must_use]
    pub const fn block_pages(&self) -> usize {
        self.block_pages
    }

    /// Whether allocation may trigger collections.
    #[must_use]
    pub const fn auto_collect(&self) -> bool {
        self.auto_collect
    }

    /// The enabled instrumentation.
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    // ===== Setters =====

    /// Set the number of parallel mark/sweep workers.
    pub const fn set_mark_threads(&mut self, n: usize) {
        self.mark_threads = n;
    }

    /// Enable or disable the concurrent collector thread.
    pub const fn set_concurrent_sweep(&mut self, enabled: bool) {
        self.concurrent_sweep = enabled;
    }

    /// Force every collection to sweep fully.
    pub const fn set_always_full(&mut self, enabled: bool) {
        self.always_full = enabled;
    }

    /// Set the user heap ceiling.
    pub const fn set_max_total_memory(&mut self, bytes: usize) {
        self.max_total_memory = bytes;
    }

    /// Set the minimum collection interval.
    pub const fn set_collect_interval(&mut self, bytes: usize) {
        self.collect_interval = if bytes < crate::page::PAGE_SZ {
            crate::page::PAGE_SZ
        } else {
            bytes
        };
    }

    /// Set the promotion-rate escalation threshold.
    pub const fn set_promotion_rate_threshold(&mut self, ratio: f64) {
        self.promotion_rate_threshold = ratio;
    }

    /// Set the bounded-pop budget.
    pub const fn set_max_pop_attempts(&mut self, attempts: u32) {
        self.max_pop_attempts = if attempts == 0 { 1 } else { attempts };
    }

    /// Set the array chunking threshold.
    pub const fn set_chunk_batch_size(&mut self, elements: usize) {
        self.chunk_batch_size = if elements == 0 { 1 } else { elements };
    }

    /// Set the parallel pool-sweep threshold.
    pub const fn set_parallel_sweep_bytes(&mut self, bytes: usize) {
        self.parallel_sweep_bytes = bytes;
    }

    /// Set how many pages are mapped per OS request.
    pub const fn set_block_pages(&mut self, pages: usize) {
        self.block_pages = if pages == 0 { 1 } else { pages };
    }

    /// Enable or disable allocation-triggered collections.
    pub const fn set_auto_collect(&mut self, enabled: bool) {
        self.auto_collect = enabled;
    }

    /// Replace the enabled instrumentation.
    pub const fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }
}

/// Instrumentation callbacks. Every method defaults to doing nothing.
///
/// `pause_finished` is always delivered; the others only when the matching
/// [`Capabilities`] flag is set.
pub trait GcHooks: Send + Sync {
    /// A collection pause ended.
    fn pause_finished(&self, _info: &PauseInfo) {}

    /// A phase of the cycle finished (`timing`).
    fn phase_timing(&self, _phase: CyclePhase, _elapsed: Duration) {}

    /// Marking finished and the heap is quiescent (`verify`).
    fn verify_mark(&self, _summary: &MarkSummary) {}

    /// A pool page was swept (`memory_profile`).
    fn page_swept(&self, _record: &PageSweepRecord) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl GcHooks for NoHooks {}
