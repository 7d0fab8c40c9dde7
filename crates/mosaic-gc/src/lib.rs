//! A concurrent, non-moving, generational mark-sweep collector core.
//!
//! `mosaic-gc` manages memory for a host runtime that describes its own
//! objects. Small objects live in 40 size-class pools carved out of 16 KiB
//! pages (4 KiB with `small-page`); larger ones are allocated individually
//! and kept on intrusive lists. Collections stop the world, mark in parallel
//! with work stealing, and sweep either quickly (young objects only) or
//! fully.
//!
//! # Quick Start
//!
//! ```ignore
//! use mosaic_gc::{Collector, CollectionKind, GcConfig, NoHooks, ObjectLayout, ObjectModel, ObjectRef};
//!
//! struct Pairs;
//!
//! // SAFETY: every object is two pointer slots.
//! unsafe impl ObjectModel for Pairs {
//!     fn layout(&self, _obj: ObjectRef) -> ObjectLayout {
//!         ObjectLayout::Fields8(&[0, 1])
//!     }
//! }
//!
//! let gc = Collector::new(GcConfig::default(), Pairs, NoHooks)?;
//! let m = gc.mutator();
//! let pair = m.alloc(16, 0)?;
//! m.push_root(pair);
//! m.collect(CollectionKind::Full);
//! ```
//!
//! # Generations
//!
//! Objects that survive a cycle become old. Old objects are not rescanned by
//! quick cycles, so stores of young references into them must go through
//! [`Mutator::store_slot`] or [`Mutator::write_barrier`].
//!
//! # Threads
//!
//! Every thread that touches managed objects holds a [`Mutator`] and calls
//! [`Mutator::safepoint`] regularly. `mark_threads` workers help with marking
//! and pool sweeping; an optional concurrent thread returns memory to the OS
//! after the pause.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bigval;
mod collector;
mod config;
mod error;
mod gc;
mod heap;
mod metrics;
mod mutator;
mod object;
mod page;
mod page_stack;
mod pages;
mod pagetable;
mod roots;
mod stack_pool;

/// `tracing` integration; compiled to no-ops without the `tracing` feature.
pub mod tracing;

pub use collector::Collector;
pub use config::{Capabilities, GcConfig, GcHooks, NoHooks, DEFAULT_COLLECT_INTERVAL};
pub use error::GcError;
pub use gc::{CollectionKind, FullSweepReason, FullSweepReasons, ReasonSet};
pub use heap::{size_class_index, N_POOLS, SIZE_CLASSES};
pub use metrics::{
    global_metrics, CyclePhase, GcMetrics, GlobalMetrics, MarkSummary, PageSweepRecord, PauseInfo,
    PhaseTimer,
};
pub use mutator::Mutator;
pub use object::{ObjectLayout, ObjectModel, ObjectRef, RootProvider, RootSink};
pub use page::{
    PageState, GC_CLEAN, GC_MARKED, GC_OLD, GC_OLD_MARKED, MAX_SZCLASS, MAX_TYPE_TAG, PAGE_SZ,
    TAG_RESERVED_BITS, TAG_SIZE,
};
pub use pages::HeapStatus;
pub use stack_pool::{TaskStack, STACK_POOL_SIZES};
