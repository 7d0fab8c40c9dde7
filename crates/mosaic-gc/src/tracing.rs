//! GC tracing support.
//!
//! With the `tracing` feature, collections and their phases run inside spans
//! and the pause report can be logged. Without it the same names compile to
//! nothing.

/// Spans and events emitted by the collector.
#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::metrics::{CyclePhase, PauseInfo};

    /// Identifier correlating every event of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection.
    pub fn trace_gc_collection(kind: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", kind = kind, gc_id = gc_id.0).entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: CyclePhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Debug event at the start of a phase.
    pub fn log_phase_start(phase: CyclePhase, heap_size: usize) {
        tracing::debug!(phase = ?phase, heap_size, "phase_start");
    }

    /// Debug event at the end of a phase.
    pub fn log_phase_end(phase: CyclePhase, bytes_reclaimed: usize) {
        tracing::debug!(phase = ?phase, bytes_reclaimed, "phase_end");
    }

    /// Emitted when collection logging is switched on.
    pub fn log_pause(info: &PauseInfo) {
        tracing::info!(
            pause_ms = info.pause.as_secs_f64() * 1e3,
            freed = info.freed,
            full = info.full,
            recollect = info.recollect,
            live_bytes = info.live_bytes,
            "GC: pause finished"
        );
    }

    /// Trace event once a helper thread is up.
    pub fn log_worker_ready(role: &'static str, index: usize) {
        tracing::trace!(role, worker = index, "gc worker ready");
    }

    /// The OS refused to decommit a free page; it stays resident.
    pub fn log_decommit_failed(page: usize, err: &std::io::Error) {
        tracing::warn!(page, error = %err, "decommit failed");
    }
}

/// No-op stand-ins used when the `tracing` feature is off.
#[cfg(not(feature = "tracing"))]
#[allow(missing_docs)]
pub mod internal {
    use crate::metrics::{CyclePhase, PauseInfo};

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }

    pub const fn trace_gc_collection(_kind: &str, _gc_id: GcId) {}

    pub const fn trace_phase(_phase: CyclePhase) {}

    pub const fn log_phase_start(_phase: CyclePhase, _heap_size: usize) {}

    pub const fn log_phase_end(_phase: CyclePhase, _bytes_reclaimed: usize) {}

    pub const fn log_pause(_info: &PauseInfo) {}

    pub const fn log_worker_ready(_role: &'static str, _index: usize) {}

    pub const fn log_decommit_failed(_page: usize, _err: &std::io::Error) {}
}

pub use internal::GcId;
