//! Shared collector state
//!
//! One [`GcContext`] is built per heap and shared by reference with every
//! component that needs heap-wide state: mutators, barriers, collectors and
//! the heuristic policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use crate::barrier::{Barrier, BarrierKind, ConcurrentBarrier, StwBarrier};
use crate::param::RuntimeParam;
use crate::phase::PhaseCell;
use crate::roots::{FinalizerQueue, RootTable};
use crate::satb::SatbBuffer;
use crate::space::RegionSpace;
use crate::sync::StwSignal;

/// Heap-wide collector state
#[derive(Debug)]
pub struct GcContext {
    param: RuntimeParam,
    space: Arc<RegionSpace>,
    phase: PhaseCell,
    satb: SatbBuffer,
    stw: StwSignal,
    roots: RootTable,
    finalizers: FinalizerQueue,
    barrier: AtomicU8,
    gc_count: AtomicU64,
    gc_running: AtomicBool,
}

impl GcContext {
    /// Build the context for `param`
    pub fn new(param: RuntimeParam) -> Self {
        let space = Arc::new(RegionSpace::new(&param.heap));
        Self {
            param,
            space,
            phase: PhaseCell::default(),
            satb: SatbBuffer::new(),
            stw: StwSignal::new(),
            roots: RootTable::new(),
            finalizers: FinalizerQueue::new(),
            barrier: AtomicU8::new(BarrierKind::Stw as u8),
            gc_count: AtomicU64::new(0),
            gc_running: AtomicBool::new(false),
        }
    }

    /// Runtime parameters
    pub fn param(&self) -> &RuntimeParam {
        &self.param
    }

    /// Region space
    pub fn space(&self) -> &Arc<RegionSpace> {
        &self.space
    }

    /// Heap-wide phase
    pub fn phase(&self) -> &PhaseCell {
        &self.phase
    }

    /// Retired SATB nodes
    pub fn satb(&self) -> &SatbBuffer {
        &self.satb
    }

    /// Stop-the-world parking signal
    pub fn stw(&self) -> &StwSignal {
        &self.stw
    }

    /// Static roots
    pub fn roots(&self) -> &RootTable {
        &self.roots
    }

    /// Finalizer queue
    pub fn finalizers(&self) -> &FinalizerQueue {
        &self.finalizers
    }

    /// Active barrier
    pub fn barrier(&self) -> &'static dyn Barrier {
        match self.barrier_kind() {
            BarrierKind::Stw => &StwBarrier,
            BarrierKind::Concurrent => &ConcurrentBarrier,
        }
    }

    /// Kind of the active barrier
    pub fn barrier_kind(&self) -> BarrierKind {
        match self.barrier.load(Ordering::Acquire) {
            0 => BarrierKind::Stw,
            _ => BarrierKind::Concurrent,
        }
    }

    /// Swap the active barrier
    pub fn set_barrier(&self, kind: BarrierKind) {
        self.barrier.store(kind as u8, Ordering::Release);
    }

    /// Completed cycles
    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_gc_count(&self) -> u64 {
        self.gc_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether a cycle is in flight
    pub fn is_gc_running(&self) -> bool {
        self.gc_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_gc_running(&self, running: bool) {
        self.gc_running.store(running, Ordering::Release);
    }
}
