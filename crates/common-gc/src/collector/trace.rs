//! Queue-based tracing collector
//!
//! Workers drawn from the task pool pull batches from a blocking queue and
//! publish overflow in fixed-size batches. The remembered set only seeds
//! root enumeration; the final-mark pause replays SATB logs and roots.

use std::sync::Arc;

use tracing::trace;

use super::work::{CHUNK_SIZE, MarkStack, WorkQueue};
use super::{Collector, CollectorCore, WeakEdge};
use crate::param::CollectorKind;
use crate::phase::GcPhase;
use crate::stats::GcType;

/// Collector using the blocking queue work model
pub struct TraceCollector {
    core: Arc<CollectorCore>,
}

impl TraceCollector {
    /// Create the collector
    pub fn new(core: CollectorCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    fn trace_worker(core: &CollectorCore, queue: &WorkQueue, gc_type: GcType) {
        let mut weak: Vec<WeakEdge> = Vec::new();
        while let Some(mut local) = queue.pop_batch() {
            while let Some(obj) = local.pop() {
                core.scan_object(gc_type, &obj, &mut local, &mut weak);
                if local.len() >= 2 * CHUNK_SIZE {
                    let batch = local.split_off(local.len() - CHUNK_SIZE);
                    queue.push_batch(batch);
                }
            }
            queue.finish_batch();
        }
        core.weak_stack().push_all(weak);
    }
}

impl Collector for TraceCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Trace
    }

    fn core(&self) -> &CollectorCore {
        &self.core
    }

    fn remark_phase(&self) -> GcPhase {
        GcPhase::FinalMark
    }

    fn enumerate_roots(&self, gc_type: GcType) -> MarkStack {
        self.core.mark_roots(gc_type, true)
    }

    fn process_mark_stack(&self, gc_type: GcType, seeds: MarkStack, workers: usize) {
        if seeds.is_empty() {
            return;
        }
        let pool = self.core.pool();
        let queue = Arc::new(WorkQueue::new(seeds));
        let core = self.core.clone();
        let task = {
            let queue = queue.clone();
            Arc::new(move |_worker: usize| Self::trace_worker(&core, &queue, gc_type))
        };
        let used = pool.run_parallel(pool.parallelism(workers), task);
        trace!(target: "common_gc::gc", workers = used, "trace queue drained");
    }

    fn remark(&self, gc_type: GcType) {
        self.core.mutators().transition_all_mutators(self.remark_phase());
        self.core.remark_until_stable(self, gc_type, false);
    }
}
