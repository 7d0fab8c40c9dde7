//! Collector coordination.
//!
//! # Lock order
//!
//! | Level | Lock | Held by |
//! |-------|------|---------|
//! | 1 | `World::state` | mutators entering or leaving a safepoint, the collecting thread while stopping the world |
//! | 2 | `ThreadHeap::local`, `GcShared::finalizers`, `GcShared::oldest` | the owning mutator; the collecting thread once the world is stopped |
//! | 3 | `Coordinator::threads_lock`, `queue_observer_lock`, `sweep_job`, `Reclaim::state` | the collecting thread and the workers |
//!
//! A lock is only taken while holding locks of a lower level. Workers never
//! take a level 1 or 2 lock, except the concurrent thread, which takes the
//! stack-pool locks while no cycle is running.
//!
//! # Phases
//!
//! A cycle moves the coordinator through `Idle -> Marking -> MarkDone ->
//! Sweeping -> SweepDone -> Idle`. Workers park on `threads_cond` until the
//! number of marking threads becomes non-zero, a sweep is requested for them,
//! or the collector shuts down. The concurrent thread parks on the reclaim
//! semaphore.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use super::marker::Marker;
use super::sweep::SweepJob;
use super::worklist::{MarkCache, MarkQueue, QueueStealers};
use crate::collector::GcShared;
use crate::tracing::internal::log_worker_ready;

/// Work items per marking thread a queue must hold before another thread
/// joins.
const WORK_PER_MARKER: usize = 16;

// ===== Phases =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Idle = 0,
    Marking = 1,
    MarkDone = 2,
    Sweeping = 3,
    SweepDone = 4,
}

impl Phase {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Marking,
            2 => Self::MarkDone,
            3 => Self::Sweeping,
            4 => Self::SweepDone,
            _ => Self::Idle,
        }
    }

    const fn next(self) -> Self {
        match self {
            Self::Idle => Self::Marking,
            Self::Marking => Self::MarkDone,
            Self::MarkDone => Self::Sweeping,
            Self::Sweeping => Self::SweepDone,
            Self::SweepDone => Self::Idle,
        }
    }
}

/// Why a parked worker woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerWake {
    Mark,
    Sweep,
    Shutdown,
}

// ===== Coordinator =====

/// Shared state of the collecting thread and the worker pool.
pub(crate) struct Coordinator {
    phase: AtomicU8,
    threads_lock: Mutex<()>,
    threads_cond: Condvar,
    n_threads_marking: AtomicUsize,
    n_threads_sweeping: AtomicUsize,
    sweeps_requested: Box<[AtomicUsize]>,
    queue_observer_lock: Mutex<()>,
    sweep_job: Mutex<Option<Arc<SweepJob>>>,
    shutdown: AtomicBool,
    pub(crate) reclaim: Reclaim,
    pub(crate) started: StartupLatch,
}

impl Coordinator {
    pub(crate) fn new(n_workers: usize) -> Self {
        Self {
            phase: AtomicU8::new(Phase::Idle as u8),
            threads_lock: Mutex::new(()),
            threads_cond: Condvar::new(),
            n_threads_marking: AtomicUsize::new(0),
            n_threads_sweeping: AtomicUsize::new(0),
            sweeps_requested: (0..n_workers).map(|_| AtomicUsize::new(0)).collect(),
            queue_observer_lock: Mutex::new(()),
            sweep_job: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            reclaim: Reclaim::new(),
            started: StartupLatch::default(),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Moves to the next phase.
    ///
    /// # Panics
    ///
    /// If the coordinator is not in `from`.
    pub(crate) fn advance(&self, from: Phase) {
        let prev = self
            .phase
            .swap(from.next() as u8, Ordering::AcqRel);
        assert_eq!(
            Phase::from_u8(prev),
            from,
            "collector phase out of order"
        );
    }

    pub(crate) fn n_workers(&self) -> usize {
        self.sweeps_requested.len()
    }

    fn notify_workers(&self) {
        let _guard = self.threads_lock.lock();
        self.threads_cond.notify_all();
    }

    // ----- marking -----

    /// Registers the collecting thread as a marker and wakes the workers.
    pub(crate) fn start_marking(&self) {
        self.n_threads_marking.fetch_add(1, Ordering::AcqRel);
        self.notify_workers();
    }

    pub(crate) fn leave_marking(&self) {
        self.n_threads_marking.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_marking(&self) -> bool {
        self.n_threads_marking.load(Ordering::Acquire) > 0
    }

    /// Waits until either marking is over (`false`) or the queues hold
    /// enough work for one more marker (`true`, the caller is counted).
    pub(crate) fn should_mark(&self, stealers: &[QueueStealers]) -> bool {
        let _observer = self.queue_observer_lock.lock();
        let backoff = Backoff::new();
        loop {
            let n_marking = self.n_threads_marking.load(Ordering::Acquire);
            if n_marking == 0 {
                return false;
            }
            let work: usize = stealers.iter().map(QueueStealers::work).sum();
            if work >= WORK_PER_MARKER * n_marking {
                self.n_threads_marking.fetch_add(1, Ordering::AcqRel);
                return true;
            }
            backoff.snooze();
        }
    }

    // ----- sweeping -----

    /// Publishes `job` and asks every worker to join it.
    pub(crate) fn wake_sweepers(&self, job: Arc<SweepJob>) {
        *self.sweep_job.lock() = Some(job);
        for requested in &*self.sweeps_requested {
            requested.fetch_add(1, Ordering::AcqRel);
        }
        self.notify_workers();
    }

    /// Runs `f` on the published job, if any, counted as a sweeper.
    pub(crate) fn join_sweep(&self, f: impl FnOnce(&SweepJob)) {
        self.n_threads_sweeping.fetch_add(1, Ordering::AcqRel);
        let job = self.sweep_job.lock().clone();
        if let Some(job) = job {
            f(&job);
        }
        self.n_threads_sweeping.fetch_sub(1, Ordering::AcqRel);
    }

    /// Waits for every sweeper to finish and withdraws the job.
    pub(crate) fn wait_sweepers(&self) -> Option<Arc<SweepJob>> {
        let backoff = Backoff::new();
        while self.n_threads_sweeping.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        self.sweep_job.lock().take()
    }

    // ----- worker parking -----

    /// Parks worker `i` (0-based) until there is something for it to do.
    pub(crate) fn wait_for_work(&self, i: usize) -> WorkerWake {
        let mut guard = self.threads_lock.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return WorkerWake::Shutdown;
            }
            if self.is_marking() {
                return WorkerWake::Mark;
            }
            let requested = &self.sweeps_requested[i];
            if requested.load(Ordering::Acquire) > 0 {
                requested.fetch_sub(1, Ordering::AcqRel);
                return WorkerWake::Sweep;
            }
            self.threads_cond.wait(&mut guard);
        }
    }

    pub(crate) fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify_workers();
        self.reclaim.shut_down();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("phase", &self.phase())
            .field("n_workers", &self.n_workers())
            .field("n_threads_marking", &self.n_threads_marking)
            .field("n_threads_sweeping", &self.n_threads_sweeping)
            .finish_non_exhaustive()
    }
}

// ===== Reclaim semaphore =====

#[derive(Debug, Default)]
struct ReclaimState {
    requests: usize,
    busy: bool,
    shutdown: bool,
}

/// Hands page reclamation to the concurrent thread.
#[derive(Debug, Default)]
pub(crate) struct Reclaim {
    state: Mutex<ReclaimState>,
    cond: Condvar,
}

impl Reclaim {
    fn new() -> Self {
        Self::default()
    }

    /// Posts one reclaim request.
    pub(crate) fn post(&self) {
        self.state.lock().requests += 1;
        self.cond.notify_all();
    }

    /// Waits until no request is queued or running.
    pub(crate) fn wait_idle(&self) {
        let mut state = self.state.lock();
        while (state.requests > 0 || state.busy) && !state.shutdown {
            self.cond.wait(&mut state);
        }
    }

    /// Takes one request. Returns `false` on shutdown.
    fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return false;
            }
            if state.requests > 0 {
                state.requests -= 1;
                state.busy = true;
                return true;
            }
            self.cond.wait(&mut state);
        }
    }

    fn release(&self) {
        self.state.lock().busy = false;
        self.cond.notify_all();
    }

    fn shut_down(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }
}

// ===== Thread start-up =====

/// Counts helper threads that finished starting up.
///
/// Unlike a fixed-size barrier, the creator can wait for however many
/// threads it actually managed to spawn.
#[derive(Debug, Default)]
pub(crate) struct StartupLatch {
    arrived: Mutex<usize>,
    cond: Condvar,
}

impl StartupLatch {
    pub(crate) fn arrive(&self) {
        *self.arrived.lock() += 1;
        self.cond.notify_all();
    }

    pub(crate) fn wait_for(&self, n: usize) {
        let mut arrived = self.arrived.lock();
        while *arrived < n {
            self.cond.wait(&mut arrived);
        }
    }
}

// ===== Stopping the world =====

#[derive(Debug, Default)]
struct WorldState {
    /// Attached mutators not parked at a safepoint.
    running: usize,
    collecting: bool,
}

/// Stops mutators for a cycle.
///
/// Every attached mutator counts as running until it parks. A collecting
/// thread stops counting itself and waits for the count to reach zero.
#[derive(Debug, Default)]
pub(crate) struct World {
    state: Mutex<WorldState>,
    cond: Condvar,
    gc_requested: AtomicBool,
}

impl World {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A mutator starts running. Waits out a cycle in progress.
    pub(crate) fn attach(&self) {
        let mut state = self.state.lock();
        while state.collecting {
            self.cond.wait(&mut state);
        }
        state.running += 1;
    }

    /// A mutator stops running for good.
    pub(crate) fn detach(&self) {
        let mut state = self.state.lock();
        state.running -= 1;
        self.cond.notify_all();
    }

    #[inline]
    pub(crate) fn gc_requested(&self) -> bool {
        self.gc_requested.load(Ordering::Acquire)
    }

    /// Parks the caller while a cycle is in progress.
    pub(crate) fn park(&self) {
        let mut state = self.state.lock();
        if !state.collecting {
            return;
        }
        state.running -= 1;
        self.cond.notify_all();
        while state.collecting {
            self.cond.wait(&mut state);
        }
        state.running += 1;
    }

    /// Runs `f` without counting as running, so cycles may proceed.
    pub(crate) fn gc_safe<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut state = self.state.lock();
            state.running -= 1;
            self.cond.notify_all();
        }
        let out = f();
        self.attach();
        out
    }

    /// Stops the world for the caller. Returns `false` if another thread was
    /// already collecting; the caller then waited for that cycle instead.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.state.lock();
        state.running -= 1;
        if state.collecting {
            self.cond.notify_all();
            while state.collecting {
                self.cond.wait(&mut state);
            }
            state.running += 1;
            return false;
        }
        state.collecting = true;
        self.gc_requested.store(true, Ordering::Release);
        while state.running > 0 {
            self.cond.wait(&mut state);
        }
        true
    }

    /// Restarts the world stopped by [`World::stop`].
    pub(crate) fn resume(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.collecting);
        state.collecting = false;
        self.gc_requested.store(false, Ordering::Release);
        state.running += 1;
        self.cond.notify_all();
    }

    #[cfg(test)]
    fn running(&self) -> usize {
        self.state.lock().running
    }
}

// ===== Thread mains =====

/// Mark/sweep worker `index` (1-based; 0 is the collecting thread).
pub(crate) fn run_worker(shared: &GcShared, index: usize, mut mq: MarkQueue) {
    let coord = &shared.coord;
    log_worker_ready("mark_sweep", index);
    coord.started.arrive();
    loop {
        match coord.wait_for_work(index - 1) {
            WorkerWake::Shutdown => return,
            WorkerWake::Mark => {
                mark_loop_parallel(
                    shared.marker(),
                    &mut mq,
                    &shared.stealers,
                    coord,
                    &shared.mark_totals,
                    false,
                );
            }
            WorkerWake::Sweep => {
                let sink = shared.sweep_sink();
                coord.join_sweep(|job| job.sweep_pending(index, sink));
            }
        }
    }
}

/// The concurrent collector thread: reclaims pages and trims stack pools
/// after each pause.
pub(crate) fn run_concurrent(shared: &GcShared) {
    log_worker_ready("concurrent", 0);
    shared.coord.started.arrive();
    let reclaim = &shared.coord.reclaim;
    while reclaim.acquire() {
        shared.reclaim_now();
        reclaim.release();
    }
}

/// Parallel mark loop of one thread.
///
/// The collecting thread (`master`) registers itself and wakes the workers
/// before draining its own queue. Every thread then keeps joining while
/// enough work is observable, and returns once no thread is marking.
pub(crate) fn mark_loop_parallel(
    marker: Marker<'_>,
    mq: &mut MarkQueue,
    stealers: &[QueueStealers],
    coord: &Coordinator,
    totals: &Mutex<MarkCache>,
    master: bool,
) {
    if master {
        coord.start_marking();
        marker.mark_and_steal(mq, stealers);
        totals.lock().merge(&mut mq.cache);
        coord.leave_marking();
    }
    while coord.is_marking() {
        if coord.should_mark(stealers) {
            marker.mark_and_steal(mq, stealers);
            totals.lock().merge(&mut mq.cache);
            coord.leave_marking();
        }
    }
}
