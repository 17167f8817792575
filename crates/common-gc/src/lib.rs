//! # Common GC
//!
//! Concurrent, region-based garbage collector for a managed runtime.
//!
//! ## Design
//!
//! - **Mutators**: application threads poll suspension flags at safepoints;
//!   the collector stops the world and moves them through GC phases with a
//!   per-mutator handshake
//! - **Barriers**: a plain barrier outside cycles, a snapshot-at-the-beginning
//!   barrier while marking
//! - **Marking**: parallel, with either a splittable stack or a blocking work
//!   queue, followed by a bounded stop-the-world remark
//! - **Evacuation**: live young objects are copied into old regions and every
//!   stale pointer is fixed in the same pause
//! - **Heuristics**: heap thresholds, native memory pressure, startup and
//!   background state decide when to collect

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod address;
pub mod barrier;
pub mod collector;
pub mod context;
pub mod error;
pub mod heap;
pub mod heuristic;
pub mod mutator;
pub mod mutator_manager;
pub mod object;
pub mod param;
pub mod phase;
pub mod roots;
pub mod satb;
pub mod space;
pub mod stats;
pub mod sync;

pub use address::{HeapAddress, RefValue};
pub use barrier::{Barrier, BarrierKind};
pub use collector::{Collector, GcDriver, GcObserver, GcTrigger};
pub use context::GcContext;
pub use error::{GcError, GcResult};
pub use heap::Heap;
pub use heuristic::{HeuristicGcPolicy, MemoryReduceDegree, StartupStatus, StartupStatusManager};
pub use mutator::{Mutator, TransitionState};
pub use object::{BaseObject, FieldKind, TypeInfo};
pub use param::{CollectorKind, GcParam, HeapParam, RuntimeParam};
pub use phase::GcPhase;
pub use roots::RootHandle;
pub use space::AllocType;
pub use stats::{GcReason, GcStats, GcType};
