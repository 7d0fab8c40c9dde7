//! The collector: shared state, helper threads and the collection cycle.
//!
//! A [`Collector`] owns the page allocator, one [`ThreadHeap`] per mutator
//! and the worker pool. A cycle runs on the mutator that asked for it, after
//! every other mutator has parked:
//!
//! 1. premark the remembered sets and seed the mark queue from every root,
//! 2. drain the queues, serially or with the workers,
//! 3. move dead finalizable objects aside and mark them,
//! 4. decide between a quick and a full sweep,
//! 5. sweep task stacks, big objects and pool pages,
//! 6. hand reclamation to the concurrent thread (or do it inline) and
//!    recompute the heap target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::bigval::BigList;
use crate::config::{GcConfig, GcHooks};
use crate::error::GcError;
use crate::gc::finalizer::{Finalizer, Finalizers};
use crate::gc::heuristics::{
    decide_full_sweep, CollectionKind, CycleSample, FullSweepReasons, HeapBalancer, SweepInputs,
};
use crate::gc::marker::Marker;
use crate::gc::sweep::{sweep_big_objects, SweepJob, SweepSink};
use crate::gc::sync::{self, Coordinator, Phase, World};
use crate::gc::worklist::{MarkCache, MarkQueue, QueueStealers};
use crate::heap::{HeapLocal, ThreadHeap};
use crate::metrics::{global_metrics, CyclePhase, GcMetrics, MarkSummary, PauseInfo, PhaseTimer};
use crate::mutator::Mutator;
use crate::object::{ObjectModel, ObjectRef, RootProvider, RootSink};
use crate::page::{PageState, GC_MARKED, GC_OLD_MARKED};
use crate::pages::{HeapStatus, PageAllocator};
use crate::tracing::internal::{log_pause, log_phase_end, log_phase_start, next_gc_id};

/// Seed of the collecting thread's queue; workers derive theirs from it.
const QUEUE_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Heuristics carried from one cycle to the next.
#[derive(Debug)]
struct CycleState {
    prev_sweep_full: bool,
    promoted_since_full: usize,
    live_at_last_full: usize,
    heap_after_last: usize,
    last_cycle_end: Instant,
    balancer: HeapBalancer,
}

/// State shared by mutators, the collecting thread and the helper threads.
pub(crate) struct GcShared {
    pub(crate) config: GcConfig,
    model: Box<dyn ObjectModel>,
    hooks: Box<dyn GcHooks>,
    pub(crate) pages: PageAllocator,
    pub(crate) heaps: RwLock<Vec<Arc<ThreadHeap>>>,
    pub(crate) world: World,
    pub(crate) coord: Coordinator,
    /// Index 0 belongs to the collecting thread's queue.
    pub(crate) stealers: Box<[QueueStealers]>,
    master_queue: Mutex<MarkQueue>,
    pub(crate) mark_totals: Mutex<MarkCache>,
    root_providers: RwLock<Vec<Arc<dyn RootProvider>>>,
    finalizers: Mutex<Finalizers>,
    /// Big objects that survived as old.
    oldest: Mutex<BigList>,
    state: Mutex<CycleState>,
    reasons: FullSweepReasons,
    logging: AtomicBool,
    last_metrics: Mutex<GcMetrics>,
}

/// A running phase: its span, its start time and the optional hooks.
struct PhaseScope<'a> {
    shared: &'a GcShared,
    phase: CyclePhase,
    start: Instant,
    #[cfg(feature = "tracing")]
    _span: tracing::span::EnteredSpan,
}

impl PhaseScope<'_> {
    fn finish(self, bytes_reclaimed: usize) -> Duration {
        let elapsed = self.start.elapsed();
        let caps = self.shared.config.capabilities();
        if caps.debug_logging {
            log_phase_end(self.phase, bytes_reclaimed);
        }
        if caps.timing {
            self.shared.hooks.phase_timing(self.phase, elapsed);
        }
        elapsed
    }
}

impl GcShared {
    pub(crate) fn marker(&self) -> Marker<'_> {
        Marker {
            table: &self.pages.table,
            model: &*self.model,
            batch: self.config.chunk_batch_size(),
        }
    }

    pub(crate) fn sweep_sink(&self) -> SweepSink<'_> {
        SweepSink {
            pages: &self.pages,
            profile: self
                .config
                .capabilities()
                .memory_profile
                .then_some(&*self.hooks),
        }
    }

    /// Returns surplus lazily freed pages to the OS and trims stack pools.
    pub(crate) fn reclaim_now(&self) -> usize {
        let released = self.pages.free_pages(self.config.collect_interval());
        for heap in self.heaps.read().iter() {
            heap.stacks.lock().trim(heap.in_use.load(Ordering::Acquire));
        }
        released
    }

    fn enter_phase(&self, phase: CyclePhase) -> PhaseScope<'_> {
        if self.config.capabilities().debug_logging {
            log_phase_start(phase, self.pages.status.heap_size());
        }
        PhaseScope {
            shared: self,
            phase,
            start: Instant::now(),
            #[cfg(feature = "tracing")]
            _span: crate::tracing::internal::trace_phase(phase),
        }
    }

    // ===== Heaps =====

    /// Hands out a released heap or creates a new one.
    pub(crate) fn claim_heap(&self) -> Arc<ThreadHeap> {
        let mut heaps = self.heaps.write();
        for heap in heaps.iter() {
            if heap
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Arc::clone(heap);
            }
        }
        let index = heaps.len();
        assert!(
            u16::try_from(index).is_ok(),
            "too many mutator heaps for the page metadata"
        );
        let heap = Arc::new(ThreadHeap::new(index));
        heaps.push(Arc::clone(&heap));
        heap
    }

    // ===== Finalizers =====

    pub(crate) fn register_finalizer(&self, obj: ObjectRef, f: Finalizer) {
        self.finalizers.lock().register(obj, f);
    }

    /// Runs the finalizers scheduled by the last cycle. The world must be
    /// running.
    fn run_finalizers(&self) {
        let ready = self.finalizers.lock().take_ready();
        for fin in ready {
            let slot = fin.slot();
            fin.run();
            self.finalizers.lock().finish(slot);
        }
    }

    // ===== Collection =====

    /// Stops the world and collects on behalf of `heap`'s mutator.
    ///
    /// Returns `None` if another thread was already collecting; the caller
    /// waited for that cycle instead.
    pub(crate) fn collect(&self, heap: &ThreadHeap, kind: CollectionKind) -> Option<PauseInfo> {
        if !self.world.stop() {
            return None;
        }
        let info = self.collect_stopped(heap, kind);
        self.world.resume();
        self.run_finalizers();
        Some(info)
    }

    fn collect_stopped(&self, heap: &ThreadHeap, kind: CollectionKind) -> PauseInfo {
        let first = self.run_cycle(heap, kind);
        if !first.recollect {
            return first;
        }
        let second = self.run_cycle(heap, CollectionKind::Auto);
        PauseInfo {
            pause: first.pause + second.pause,
            freed: first.freed + second.freed,
            full: first.full || second.full,
            recollect: true,
            live_bytes: second.live_bytes,
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_cycle(&self, master_heap: &ThreadHeap, kind: CollectionKind) -> PauseInfo {
        let start = Instant::now();
        let gc_id = next_gc_id();
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection(kind.as_str(), gc_id);
        #[cfg(not(feature = "tracing"))]
        let _ = gc_id;

        // The previous cycle's reclamation must not race this sweep.
        self.coord.reclaim.wait_idle();

        let heaps: Vec<Arc<ThreadHeap>> = self.heaps.read().clone();
        let master = master_heap.index;
        let mut locals: Vec<MutexGuard<'_, HeapLocal>> =
            heaps.iter().map(|h| h.local.lock()).collect();
        let mut timer = PhaseTimer::new();
        let heap_size = self.pages.status.heap_size();

        // ----- mark -----
        self.coord.advance(Phase::Idle);
        timer.start();
        let marker = self.marker();
        let mut mq = self.master_queue.lock();
        let mut finalizers = self.finalizers.lock();

        let scope = self.enter_phase(CyclePhase::Roots);
        let last_remsets = premark(&mut locals);
        self.queue_roots(marker, &mut mq, &locals, &last_remsets, &finalizers);
        scope.finish(0);

        let scope = self.enter_phase(CyclePhase::Mark);
        self.drain(marker, &mut mq);
        scope.finish(0);

        let scope = self.enter_phase(CyclePhase::Finalizers);
        let first_new = finalizers.schedule_unmarked();
        marker.mark_finlist(&mut mq, &finalizers.pending()[first_new..]);
        self.drain(marker, &mut mq);
        scope.finish(0);
        drop(finalizers);

        self.mark_totals.lock().merge(&mut mq.cache);
        drop(mq);
        let totals = std::mem::take(&mut *self.mark_totals.lock());
        let summary = MarkSummary {
            objects_marked: totals.objects_marked,
            scanned_bytes: totals.scanned_bytes,
            perm_scanned_bytes: totals.perm_scanned_bytes,
            remset_len: totals.remset.len(),
        };
        locals[master].remset.extend(totals.remset);
        timer.end_mark();
        self.coord.advance(Phase::Marking);

        if self.config.capabilities().verify {
            self.hooks.verify_mark(&summary);
        }

        // ----- decide -----
        let mut state = self.state.lock();
        let decision = decide_full_sweep(&SweepInputs {
            kind,
            always_full: self.config.always_full(),
            prev_sweep_full: state.prev_sweep_full,
            heap_size,
            max_total_memory: self.config.max_total_memory(),
            promoted_since_full: state.promoted_since_full,
            live_at_last_full: state.live_at_last_full,
            collect_interval: self.config.collect_interval(),
            promotion_rate_threshold: self.config.promotion_rate_threshold(),
        });
        self.reasons.record(decision.reasons);
        let full = decision.full;

        // ----- sweep -----
        self.coord.advance(Phase::MarkDone);
        timer.start();
        let scope = self.enter_phase(CyclePhase::Sweep);
        for h in &heaps {
            h.stacks.lock().sweep_dead_owners();
        }
        let big = sweep_big_objects(&mut locals, master, &mut self.oldest.lock(), full);
        self.pages.status.sub_heap_size(big.freed_bytes);

        let newpages = locals.iter_mut().map(|l| l.prepare_sweep()).collect();
        let keep_buffered =
            !full && self.pages.status.heap_size() <= self.config.collect_interval();
        let job = Arc::new(SweepJob::new(
            heaps.clone(),
            newpages,
            full,
            state.prev_sweep_full,
            keep_buffered,
        ));
        let sink = self.sweep_sink();
        let queued = job.prescan(sink);
        if self.coord.n_workers() > 0 && queued >= self.config.parallel_sweep_bytes() {
            self.coord.wake_sweepers(Arc::clone(&job));
            self.coord.join_sweep(|j| j.sweep_pending(master, sink));
            self.coord.wait_sweepers();
        } else {
            job.sweep_pending(master, sink);
        }
        job.install();
        for (local, h) in locals.iter_mut().zip(&heaps) {
            local.merge_freelists(h);
        }
        let counters = &job.counters;
        let pool_freed = counters.freed_bytes.load(Ordering::Relaxed);
        self.pages.status.sub_heap_size(pool_freed);

        for local in &mut locals {
            if full {
                local.remset.clear();
            } else {
                for obj in &local.remset {
                    obj.set_gc_bits(GC_MARKED);
                }
            }
        }
        let freed = big.freed_bytes + pool_freed;
        scope.finish(freed);
        let sweep_time = timer.end_sweep();
        self.coord.advance(Phase::Sweeping);
        drop(locals);

        // ----- reclaim -----
        let scope = self.enter_phase(CyclePhase::Reclaim);
        if self.config.concurrent_sweep() {
            self.coord.reclaim.post();
        } else {
            self.reclaim_now();
        }
        scope.finish(0);
        self.coord.advance(Phase::SweepDone);

        // ----- heuristics -----
        let live_bytes = self.pages.status.heap_size();
        let promoted = big.promoted_bytes + counters.promoted_bytes.load(Ordering::Relaxed);
        if full {
            state.promoted_since_full = 0;
            state.live_at_last_full = live_bytes;
        } else {
            state.promoted_since_full += promoted;
        }
        state.prev_sweep_full = full;

        let pause = start.elapsed();
        let sample = CycleSample {
            allocated: heap_size.saturating_sub(state.heap_after_last),
            freed,
            mutator_time: start.saturating_duration_since(state.last_cycle_end),
            pause,
            sweep_time,
            heap_size: live_bytes,
        };
        let target = state.balancer.update(
            &sample,
            self.pages.status.heap_target(),
            self.config.collect_interval(),
            self.config.max_total_memory(),
        );
        self.pages.status.heap_target.store(target, Ordering::Relaxed);
        state.heap_after_last = live_bytes;
        state.last_cycle_end = Instant::now();
        drop(state);

        // ----- report -----
        let info = PauseInfo {
            pause,
            freed,
            full,
            recollect: decision.recollect,
            live_bytes,
        };
        let metrics = GcMetrics {
            duration: pause,
            mark_duration: timer.mark,
            sweep_duration: timer.sweep,
            bytes_reclaimed: freed,
            bytes_surviving: live_bytes,
            objects_marked: summary.objects_marked,
            pages_swept: counters.pages_swept.load(Ordering::Relaxed),
            pages_skipped: counters.pages_skipped.load(Ordering::Relaxed),
            pages_released: counters.pages_released.load(Ordering::Relaxed),
            big_objects_freed: big.freed_count,
            full,
            recollect: decision.recollect,
        };
        *self.last_metrics.lock() = metrics;
        global_metrics().record(&metrics);
        self.hooks.pause_finished(&info);
        if self.logging.load(Ordering::Relaxed) {
            log_pause(&info);
        }
        info
    }

    /// Seeds `mq` from every root: shadow stacks, root providers, objects
    /// awaiting finalization and last cycle's remembered sets.
    fn queue_roots(
        &self,
        marker: Marker<'_>,
        mq: &mut MarkQueue,
        locals: &[MutexGuard<'_, HeapLocal>],
        last_remsets: &[Vec<ObjectRef>],
        finalizers: &Finalizers,
    ) {
        for local in locals {
            for root in local.roots.iter() {
                marker.push_root(mq, root);
            }
        }
        for provider in self.root_providers.read().iter() {
            let mut push = |obj| marker.push_root(mq, obj);
            provider.roots(&mut RootSink::new(&mut push));
        }
        marker.mark_finlist(mq, finalizers.pending());
        for obj in last_remsets.iter().flatten() {
            mq.push_remset_obj(*obj);
        }
    }

    fn drain(&self, marker: Marker<'_>, mq: &mut MarkQueue) {
        if self.coord.n_workers() == 0 {
            marker.mark_loop_serial(mq);
        } else {
            let (stealers, totals) = (&self.stealers, &self.mark_totals);
            sync::mark_loop_parallel(marker, mq, stealers, &self.coord, totals, true);
        }
    }
}

/// Takes every heap's remembered set and marks its objects old-marked, so
/// they are rescanned but never claimed again this cycle.
fn premark(locals: &mut [MutexGuard<'_, HeapLocal>]) -> Vec<Vec<ObjectRef>> {
    locals
        .iter_mut()
        .map(|local| {
            let remset = std::mem::take(&mut local.remset);
            for obj in &remset {
                obj.set_gc_bits(GC_OLD_MARKED);
            }
            remset
        })
        .collect()
}

impl std::fmt::Debug for GcShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcShared")
            .field("config", &self.config)
            .field("status", &self.pages.status)
            .field("coord", &self.coord)
            .finish_non_exhaustive()
    }
}

// ===== Collector =====

/// A garbage-collected heap and its helper threads.
///
/// Mutators attach through [`Collector::mutator`]. Dropping the last handle
/// stops the helper threads; every [`Mutator`] keeps its collector alive.
pub struct Collector {
    shared: Arc<GcShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Collector {
    /// Creates a collector and starts its worker and concurrent threads.
    ///
    /// # Errors
    ///
    /// [`GcError::ThreadSpawn`] if a helper thread cannot be started.
    pub fn new(
        config: GcConfig,
        model: impl ObjectModel + 'static,
        hooks: impl GcHooks + 'static,
    ) -> Result<Arc<Self>, GcError> {
        let n_workers = config.mark_threads();
        let (master_queue, master_stealers) = MarkQueue::new(QUEUE_SEED);
        let mut stealers = Vec::with_capacity(n_workers + 1);
        stealers.push(master_stealers);
        let mut worker_queues = Vec::with_capacity(n_workers);
        for i in 1..=n_workers {
            let (mq, s) = MarkQueue::new(QUEUE_SEED.wrapping_add(i as u64));
            worker_queues.push(mq);
            stealers.push(s);
        }

        let logging = config.capabilities().debug_logging;
        let shared = Arc::new(GcShared {
            pages: PageAllocator::new(config.block_pages(), config.collect_interval()),
            model: Box::new(model),
            hooks: Box::new(hooks),
            heaps: RwLock::new(Vec::new()),
            world: World::new(),
            coord: Coordinator::new(n_workers),
            stealers: stealers.into_boxed_slice(),
            master_queue: Mutex::new(master_queue),
            mark_totals: Mutex::new(MarkCache::default()),
            root_providers: RwLock::new(Vec::new()),
            finalizers: Mutex::new(Finalizers::new()),
            oldest: Mutex::new(BigList::new()),
            state: Mutex::new(CycleState {
                prev_sweep_full: true,
                promoted_since_full: 0,
                live_at_last_full: 0,
                heap_after_last: 0,
                last_cycle_end: Instant::now(),
                balancer: HeapBalancer::new(),
            }),
            reasons: FullSweepReasons::new(),
            logging: AtomicBool::new(logging),
            last_metrics: Mutex::new(GcMetrics::default()),
            config,
        });

        let collector = Self {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::new()),
        };
        for (i, mq) in worker_queues.into_iter().enumerate() {
            let index = i + 1;
            let s = Arc::clone(&shared);
            collector.spawn(format!("mosaic-gc-worker-{index}"), move || {
                sync::run_worker(&s, index, mq);
            })?;
        }
        if shared.config.concurrent_sweep() {
            let s = Arc::clone(&shared);
            collector.spawn("mosaic-gc-concurrent".to_owned(), move || {
                sync::run_concurrent(&s);
            })?;
        }
        let spawned = collector.threads.lock().len();
        shared.coord.started.wait_for(spawned);
        Ok(Arc::new(collector))
    }

    /// On failure `self` is dropped by the caller, which joins the threads
    /// already started.
    fn spawn(&self, name: String, f: impl FnOnce() + Send + 'static) -> Result<(), GcError> {
        let handle = thread::Builder::new()
            .name(name)
            .spawn(f)
            .map_err(GcError::ThreadSpawn)?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Registers the calling thread as a mutator.
    ///
    /// A thread must hold at most one mutator at a time: a second one would
    /// never park while the first collects.
    #[must_use]
    pub fn mutator(self: &Arc<Self>) -> Mutator {
        self.shared.world.attach();
        let heap = self.shared.claim_heap();
        Mutator::new(Arc::clone(self), heap)
    }

    pub(crate) fn shared(&self) -> &GcShared {
        &self.shared
    }

    /// Adds a source of roots consulted by every cycle.
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) {
        self.shared.root_providers.write().push(provider);
    }

    /// Runs `f` on the collecting thread once a cycle finds `obj` unreachable.
    /// The object and everything it references stay alive until `f` returns.
    pub fn register_finalizer(&self, obj: ObjectRef, f: impl FnOnce(ObjectRef) + Send + 'static) {
        self.shared.register_finalizer(obj, Box::new(f));
    }

    /// Finalizers registered and not yet scheduled.
    #[must_use]
    pub fn registered_finalizers(&self) -> usize {
        self.shared.finalizers.lock().registered()
    }

    /// Switches the per-pause log line on or off.
    pub fn set_logging(&self, enabled: bool) {
        self.shared.logging.store(enabled, Ordering::Relaxed);
    }

    /// Whether the per-pause log line is on.
    #[must_use]
    pub fn logging_enabled(&self) -> bool {
        self.shared.logging.load(Ordering::Relaxed)
    }

    /// The configuration the collector was created with.
    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    /// Live heap counters.
    #[must_use]
    pub fn heap_status(&self) -> &HeapStatus {
        &self.shared.pages.status
    }

    /// How often each full-sweep reason applied.
    #[must_use]
    pub fn full_sweep_reasons(&self) -> &FullSweepReasons {
        &self.shared.reasons
    }

    /// Metrics of the most recent cycle.
    #[must_use]
    pub fn last_metrics(&self) -> GcMetrics {
        *self.shared.last_metrics.lock()
    }

    /// Task-stack mappings currently held, in use or cached.
    #[must_use]
    pub fn stack_mappings(&self) -> usize {
        self.shared
            .heaps
            .read()
            .iter()
            .map(|h| {
                let stacks = h.stacks.lock();
                stacks.live() + stacks.cached()
            })
            .sum()
    }

    /// Pages currently mapped from the OS.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.shared.pages.mapped_pages()
    }

    /// State of the page holding `addr`; [`PageState::Unmapped`] if it was
    /// never mapped.
    #[must_use]
    pub fn page_state(&self, addr: *const u8) -> PageState {
        self.shared.pages.table.get(addr as usize)
    }

    /// Returns surplus lazily freed pages and cached stacks to the OS now.
    /// Returns the number of pages decommitted.
    pub fn reclaim(&self) -> usize {
        self.shared.coord.reclaim.wait_idle();
        self.shared.reclaim_now()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shared.coord.shut_down();
        for handle in self.threads.get_mut().drain(..) {
            // A panicking worker already reported its panic.
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("shared", &self.shared)
            .field("threads", &self.threads.lock().len())
            .finish()
    }
}
