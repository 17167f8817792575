//! Weak slot processing and finalizer resurrection

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::debug;

use super::CollectorCore;
use super::work::MarkStack;
use crate::address::RefValue;
use crate::object::BaseObject;
use crate::stats::GcType;

/// A weak slot found by the trace
#[derive(Debug, Clone)]
pub struct WeakEdge {
    holder: Arc<BaseObject>,
    index: usize,
}

impl WeakEdge {
    /// Slot `index` of `holder`
    pub fn new(holder: Arc<BaseObject>, index: usize) -> Self {
        Self { holder, index }
    }

    /// Object holding the slot
    pub fn holder(&self) -> &Arc<BaseObject> {
        &self.holder
    }

    /// Slot index
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Weak slots collected during marking, behind their own lock
#[derive(Debug, Default)]
pub struct WeakStack {
    edges: Mutex<Vec<WeakEdge>>,
}

impl WeakStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a worker's batch
    pub fn push_all(&self, edges: Vec<WeakEdge>) {
        if !edges.is_empty() {
            self.edges.lock().extend(edges);
        }
    }

    /// Take every recorded edge
    pub fn take(&self) -> Vec<WeakEdge> {
        std::mem::take(&mut *self.edges.lock())
    }

    /// Number of recorded edges
    pub fn len(&self) -> usize {
        self.edges.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.edges.lock().is_empty()
    }

    /// Drop every recorded edge
    pub fn clear(&self) {
        self.edges.lock().clear();
    }
}

impl CollectorCore {
    /// Move unreachable finalizable objects to the pending list and mark
    /// them. Returns how many were resurrected and the objects to scan.
    pub(crate) fn resurrect_finalizable(&self, gc_type: GcType) -> (usize, MarkStack) {
        let space = self.context.space();
        let dead = self.context.finalizers().resurrect_dead(|addr| {
            space
                .lookup(addr)
                .is_some_and(|obj| !space.is_live(gc_type, &obj))
        });
        let mut gray = MarkStack::new();
        for &addr in &dead {
            gray.extend(self.mark_value(gc_type, addr.into()));
        }
        if !dead.is_empty() {
            debug!(target: "common_gc::gc", count = dead.len(), "finalizable objects resurrected");
        }
        (dead.len(), gray)
    }

    /// Clear every recorded weak slot whose target did not survive marking.
    ///
    /// The slot is re-read, so a value stored after the slot was recorded is
    /// judged on its own. Runs before evacuation, so holders are never
    /// forwarded here.
    pub(crate) fn clear_weak_refs(&self, gc_type: GcType) -> usize {
        let space = self.context.space();
        let mut cleared = 0;
        for edge in self.weak.take() {
            let Some(field) = edge.holder().field(edge.index()) else {
                continue;
            };
            let value = field.load(Ordering::Acquire);
            let Some(target) = space.lookup_value(value) else {
                continue;
            };
            if space.is_live(gc_type, &target) {
                continue;
            }
            if field
                .compare_exchange(value, RefValue::NULL, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(target: "common_gc::gc", cleared, "weak references cleared");
        }
        cleared
    }
}
