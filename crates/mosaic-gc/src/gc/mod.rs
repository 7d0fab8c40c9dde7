//! Marking, sweeping and the collector's coordination machinery.
//!
//! - [`worklist`]: per-thread mark queues with stealers
//! - [`marker`]: object claiming, scanning and the mark loops
//! - [`sweep`]: pool-page and big-object sweeping
//! - [`finalizer`]: the finalizer registry
//! - [`heuristics`]: full-sweep decision and heap target
//! - [`sync`]: phases, worker parking, stopping the world

pub(crate) mod finalizer;
pub(crate) mod heuristics;
pub(crate) mod marker;
pub(crate) mod sweep;
pub(crate) mod sync;
pub(crate) mod worklist;

pub use heuristics::{CollectionKind, FullSweepReason, FullSweepReasons, ReasonSet};
