//! Split-stack marking collector
//!
//! Each worker drains a private stack. When the shared pool runs dry a
//! worker gives away half of a deep stack, or an eighth of a moderately deep
//! one. The remark pause replays SATB logs and, for young collections, the
//! remembered set.

use std::sync::Arc;

use tracing::trace;

use super::work::{MarkStack, SplitStack};
use super::{Collector, CollectorCore, WeakEdge};
use crate::param::CollectorKind;
use crate::phase::GcPhase;
use crate::stats::GcType;

/// Collector using the steal-by-split work model
pub struct MarkingCollector {
    core: Arc<CollectorCore>,
}

impl MarkingCollector {
    /// Create the collector
    pub fn new(core: CollectorCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    fn mark_worker(core: &CollectorCore, stack: &SplitStack, gc_type: GcType) {
        let mut local = MarkStack::new();
        let mut weak: Vec<WeakEdge> = Vec::new();
        stack.join();
        loop {
            while let Some(obj) = local.pop() {
                core.scan_object(gc_type, &obj, &mut local, &mut weak);
                stack.maybe_split(&mut local);
            }
            match stack.steal_or_terminate() {
                Some(chunk) => local = chunk,
                None => break,
            }
        }
        core.weak_stack().push_all(weak);
    }
}

impl Collector for MarkingCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Marking
    }

    fn core(&self) -> &CollectorCore {
        &self.core
    }

    fn remark_phase(&self) -> GcPhase {
        GcPhase::RemarkSatb
    }

    fn enumerate_roots(&self, gc_type: GcType) -> MarkStack {
        self.core.mark_roots(gc_type, true)
    }

    fn process_mark_stack(&self, gc_type: GcType, seeds: MarkStack, workers: usize) {
        if seeds.is_empty() {
            return;
        }
        let pool = self.core.pool();
        let workers = pool.parallelism(workers);
        let stack = Arc::new(SplitStack::new(seeds));
        let core = self.core.clone();
        let task = {
            let stack = stack.clone();
            Arc::new(move |_worker: usize| Self::mark_worker(&core, &stack, gc_type))
        };
        let used = pool.run_parallel(workers, task);
        trace!(target: "common_gc::gc", workers = used, "mark stack drained");
    }

    fn remark(&self, gc_type: GcType) {
        self.core.mutators().transition_all_mutators(self.remark_phase());
        self.core.remark_until_stable(self, gc_type, true);
    }
}
