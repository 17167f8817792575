//! Collector strategies and the GC cycle
//!
//! Both strategies share one cycle shape, implemented by
//! [`Collector::run_garbage_collection`]:
//!
//! 1. pre-GC: reset statistics and SATB storage
//! 2. ENUM (stop-the-world): swap in the SATB barrier, open a marking epoch,
//!    mark the roots
//! 3. MARK (concurrent): parallel marking with `N - 1` pool workers plus the
//!    driving thread
//! 4. PRECOPY (handshake): fix the from-space set
//! 5. REMARK_SATB / FINAL_MARK (stop-the-world): replay retired SATB logs,
//!    then finalizer resurrection and weak slot clearing
//! 6. COPY and FIX (same pause): evacuate from-space, fix stale pointers,
//!    reclaim dead objects
//! 7. POST_MARK, IDLE, post-GC: publish statistics, destroy expired mutators
//!
//! The strategies differ in how marking work is distributed and in how the
//! remark pause consumes the remembered set.

mod driver;
mod marking;
mod trace;
mod weak;
pub mod work;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::RefValue;
use crate::barrier::BarrierKind;
use crate::context::GcContext;
use crate::mutator_manager::MutatorManager;
use crate::object::BaseObject;
use crate::param::CollectorKind;
use crate::phase::GcPhase;
use crate::stats::{GcReason, GcStats, GcType};
use crate::sync::TaskPool;

pub use driver::{GcDriver, GcTrigger};
pub use marking::MarkingCollector;
pub use trace::TraceCollector;
pub use weak::{WeakEdge, WeakStack};
use work::MarkStack;

/// Notified after every completed cycle
pub trait GcObserver: Send + Sync {
    /// Called on the GC thread with the finalized statistics
    fn on_gc_finished(&self, stats: &GcStats);
}

/// State and building blocks shared by both strategies
pub struct CollectorCore {
    context: Arc<GcContext>,
    mutators: Arc<MutatorManager>,
    pool: Arc<TaskPool>,
    stats: Mutex<GcStats>,
    weak: WeakStack,
    marked: AtomicUsize,
    observers: Mutex<Vec<Weak<dyn GcObserver>>>,
    cycle_lock: Mutex<()>,
}

impl CollectorCore {
    /// Create the shared core
    pub fn new(context: Arc<GcContext>, mutators: Arc<MutatorManager>, pool: Arc<TaskPool>) -> Self {
        let stats = GcStats::new(&context.param().gc);
        Self {
            context,
            mutators,
            pool,
            stats: Mutex::new(stats),
            weak: WeakStack::new(),
            marked: AtomicUsize::new(0),
            observers: Mutex::new(Vec::new()),
            cycle_lock: Mutex::new(()),
        }
    }

    /// Shared heap state
    pub fn context(&self) -> &Arc<GcContext> {
        &self.context
    }

    /// Mutator registry
    pub fn mutators(&self) -> &Arc<MutatorManager> {
        &self.mutators
    }

    /// Worker pool
    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Weak slots recorded by the current trace
    pub fn weak_stack(&self) -> &WeakStack {
        &self.weak
    }

    /// Copy of the current statistics
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    /// Register a cycle observer
    pub fn add_observer(&self, observer: Weak<dyn GcObserver>) {
        self.observers.lock().push(observer);
    }

    /// Participants in concurrent marking: `N - 1` workers plus the driver
    pub fn concurrent_workers(&self) -> usize {
        self.context.param().gc_worker_count()
    }

    /// Participants in stop-the-world marking: the full pool plus the driver
    pub fn stw_workers(&self) -> usize {
        self.context.param().gc_worker_count() + 1
    }

    fn pre_garbage_collection(&self, reason: GcReason, gc_type: GcType, is_async: bool) {
        let space = self.context.space();
        self.context.satb().init();
        self.weak.clear();
        self.marked.store(0, Ordering::Relaxed);
        self.stats
            .lock()
            .reset_for_cycle(reason, gc_type, is_async, space.allocated_bytes());
        space.reset_recent_allocated();
        self.context.set_gc_running(true);
        debug!(
            target: "common_gc::gc",
            %reason,
            ?gc_type,
            is_async,
            allocated = space.allocated_bytes(),
            "GC cycle started"
        );
    }

    fn post_garbage_collection(&self) {
        let ctx = &self.context;
        let space = ctx.space();
        ctx.satb().reclaim();
        let keep = ctx.param().gc.min_heap_threshold / space.region_size();
        space.trim_region_cache(keep);
        let destroyed = self.mutators.destroy_expired_mutators();
        let count = ctx.increment_gc_count();

        let stats = {
            let mut stats = self.stats.lock();
            stats.marked_objects = self.marked.load(Ordering::Relaxed);
            stats.allocated_during_gc = space.recent_allocated_size();
            stats.update(&ctx.param().heap, &ctx.param().gc, space.allocated_bytes());
            stats.clone()
        };
        ctx.set_gc_running(false);

        info!(
            target: "common_gc::gc",
            gc_count = count,
            reason = %stats.reason,
            gc_type = ?stats.gc_type,
            collected_bytes = stats.collected_bytes,
            collected_objects = stats.collected_objects,
            survived_objects = stats.survived_objects,
            copied_bytes = stats.copied_bytes,
            pause_us = stats.total_pause.as_micros() as u64,
            total_us = stats.total_duration.as_micros() as u64,
            heap_threshold = stats.heap_threshold,
            destroyed_mutators = destroyed,
            "GC cycle finished"
        );

        let observers: Vec<_> = {
            let mut observers = self.observers.lock();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_gc_finished(&stats);
        }
    }

    fn record_pause(&self, pause: Duration) {
        self.stats.lock().total_pause += pause;
    }

    /// Mark the object named by `value`.
    ///
    /// Returns it when it was newly marked and has slots to scan.
    pub fn mark_value(&self, gc_type: GcType, value: RefValue) -> Option<Arc<BaseObject>> {
        let space = self.context.space();
        let target = space.lookup_value(value)?;
        self.mark_object(gc_type, target)
    }

    fn mark_object(&self, gc_type: GcType, target: Arc<BaseObject>) -> Option<Arc<BaseObject>> {
        let space = self.context.space();
        if !space.is_collected_by(gc_type, &target) || space.mark_object(&target) {
            return None;
        }
        space.add_live_byte_count(target.region(), target.size());
        self.marked.fetch_add(1, Ordering::Relaxed);
        space.is_scannable(&target).then_some(target)
    }

    /// Scan `holder`'s slots: strong targets are marked and pushed onto
    /// `out`, weak slots are recorded into `weak_out`
    pub fn scan_object(
        &self,
        gc_type: GcType,
        holder: &Arc<BaseObject>,
        out: &mut MarkStack,
        weak_out: &mut Vec<WeakEdge>,
    ) {
        holder.for_each_ref_field(|index, field| {
            let value = field.load(Ordering::Acquire);
            if !value.is_heap_reference() {
                return;
            }
            if field.is_weak() {
                weak_out.push(WeakEdge::new(holder.clone(), index));
                return;
            }
            if let Some(target) = self.mark_value(gc_type, value) {
                out.push(target);
            }
        });
    }

    /// Mark every root and return the newly marked objects to scan.
    ///
    /// Roots are the static root table, mutator local roots, objects
    /// awaiting finalization, slots of read-only objects and, when
    /// `with_remset` is set for a young collection, slots of remembered old
    /// objects.
    pub fn mark_roots(&self, gc_type: GcType, with_remset: bool) -> MarkStack {
        let ctx = &self.context;
        let space = ctx.space();
        let mut gray = MarkStack::new();
        let mut weak = Vec::new();

        ctx.roots().for_each(|value| {
            gray.extend(self.mark_value(gc_type, value));
        });
        self.mutators.for_each_mutator(|mutator| {
            mutator.for_each_root(|value| gray.extend(self.mark_value(gc_type, value)));
        });
        ctx.finalizers().for_each_pending(|addr| {
            gray.extend(self.mark_value(gc_type, addr.into()));
        });
        for obj in space.read_only_objects() {
            self.scan_object(gc_type, &obj, &mut gray, &mut weak);
        }
        if with_remset && gc_type == GcType::Young {
            for addr in space.remembered_set().roots() {
                if let Some(holder) = space.lookup(addr) {
                    self.scan_object(gc_type, &holder, &mut gray, &mut weak);
                }
            }
        }
        self.weak.push_all(weak);
        gray
    }

    /// Mark everything logged in retired SATB nodes
    pub fn drain_satb(&self, gc_type: GcType) -> MarkStack {
        let mut gray = MarkStack::new();
        for node in self.context.satb().take_retired() {
            for &addr in node.entries() {
                gray.extend(self.mark_value(gc_type, addr.into()));
            }
        }
        gray
    }

    /// Seeds for a forced full stop-the-world trace: every live scannable
    /// object is rescanned
    fn full_trace_seeds(&self, gc_type: GcType) -> MarkStack {
        let space = self.context.space();
        let mut gray = MarkStack::new();
        let mut weak = Vec::new();
        for obj in space.objects() {
            if space.is_scannable(&obj) && space.is_live(gc_type, &obj) {
                self.scan_object(gc_type, &obj, &mut gray, &mut weak);
            }
        }
        self.weak.push_all(weak);
        gray
    }

    /// Replay SATB logs, roots and optionally the remembered set until no
    /// new work appears. Runs with the world stopped.
    ///
    /// The drain is bounded by `max_remark_iterations` and
    /// `remark_time_limit`; past either bound one forced full trace runs.
    pub(crate) fn remark_until_stable(
        &self,
        collector: &(impl Collector + ?Sized),
        gc_type: GcType,
        with_remset: bool,
    ) {
        let gc = &self.context.param().gc;
        let start = Instant::now();
        let mut iterations = 0;
        loop {
            iterations += 1;
            let mut gray = self.drain_satb(gc_type);
            gray.extend(self.mark_roots(gc_type, with_remset));
            if gray.is_empty() {
                break;
            }
            collector.process_mark_stack(gc_type, gray, self.stw_workers());

            if iterations >= gc.max_remark_iterations || start.elapsed() > gc.remark_time_limit() {
                warn!(
                    target: "common_gc::gc",
                    iterations,
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "remark did not converge, forcing full STW trace"
                );
                let seeds = self.full_trace_seeds(gc_type);
                collector.process_mark_stack(gc_type, seeds, self.stw_workers());
                self.stats.lock().forced_stw_trace = true;
                break;
            }
        }
        self.stats.lock().remark_iterations = iterations;
    }

    /// Evacuate from-space and fix every stale reference. Runs with the
    /// world stopped and the heap in COPY.
    fn evacuate_and_reclaim(&self, gc_type: GcType) {
        let ctx = &self.context;
        let space = ctx.space();

        self.mutators.transition_all_mutators(GcPhase::Copy);
        let copied = space.copy_from_space(&self.pool, gc_type);

        self.mutators.transition_all_mutators(GcPhase::Fix);
        space.fix_references(&self.pool);
        ctx.roots().fix(|value| space.resolve(value));
        ctx.finalizers().fix(|addr| {
            space
                .resolve(addr.into())
                .address()
                .unwrap_or(addr)
        });

        let reclaimed = space.reclaim(gc_type);
        ctx.finalizers().prune(|addr| space.lookup(addr).is_none());

        let mut stats = self.stats.lock();
        stats.copied_bytes = copied.bytes;
        stats.collected_bytes = reclaimed.bytes;
        stats.collected_objects = reclaimed.objects;
        stats.survived_objects = space.object_count();
    }
}

/// A GC strategy.
///
/// Implementors supply root enumeration, mark stack processing and the
/// remark pause; the cycle itself is shared.
pub trait Collector: Send + Sync {
    /// Strategy kind
    fn kind(&self) -> CollectorKind;

    /// Shared state
    fn core(&self) -> &CollectorCore;

    /// Phase of the stop-the-world remark
    fn remark_phase(&self) -> GcPhase;

    /// Mark the roots; returns the initial gray set
    fn enumerate_roots(&self, gc_type: GcType) -> MarkStack;

    /// Drain `seeds` and everything reachable from them using `workers`
    /// participants
    fn process_mark_stack(&self, gc_type: GcType, seeds: MarkStack, workers: usize);

    /// Finish marking with the world stopped
    fn remark(&self, gc_type: GcType);

    /// Resurrect unreachable finalizable objects, then clear weak slots
    /// whose targets died. Runs with the world stopped.
    fn process_weak_stack(&self, gc_type: GcType) {
        let core = self.core();
        let (resurrected, seeds) = core.resurrect_finalizable(gc_type);
        if !seeds.is_empty() {
            self.process_mark_stack(gc_type, seeds, core.stw_workers());
        }
        let cleared = core.clear_weak_refs(gc_type);
        let mut stats = core.stats.lock();
        stats.resurrected_objects = resurrected;
        stats.cleared_weak_refs = cleared;
    }

    /// Run one full cycle
    fn run_garbage_collection(&self, reason: GcReason, gc_type: GcType, is_async: bool) {
        let core = self.core();
        let _cycle = core.cycle_lock.lock();
        let ctx = core.context();
        let mutators = core.mutators();

        core.pre_garbage_collection(reason, gc_type, is_async);

        // ENUM
        let pause_start = Instant::now();
        mutators.stop_the_world();
        ctx.set_barrier(BarrierKind::Concurrent);
        ctx.space().start_marking();
        mutators.transition_all_mutators(GcPhase::Enum);
        let seeds = self.enumerate_roots(gc_type);
        mutators.transition_all_mutators(GcPhase::Mark);
        mutators.start_the_world();
        core.record_pause(pause_start.elapsed());

        // MARK
        self.process_mark_stack(gc_type, seeds, core.concurrent_workers());

        // PRECOPY
        mutators.transition_all_mutators(GcPhase::Precopy);
        let from_space_bytes = ctx.space().select_from_space();
        core.stats.lock().from_space_bytes = from_space_bytes;

        // REMARK, weak processing, COPY, FIX
        let pause_start = Instant::now();
        mutators.stop_the_world();
        self.remark(gc_type);
        self.process_weak_stack(gc_type);
        core.evacuate_and_reclaim(gc_type);
        mutators.transition_all_mutators(GcPhase::PostMark);
        mutators.start_the_world();
        core.record_pause(pause_start.elapsed());

        mutators.transition_all_mutators(GcPhase::Idle);
        ctx.set_barrier(BarrierKind::Stw);
        core.post_garbage_collection();
    }
}

/// Build the strategy selected by `kind`
pub fn create_collector(kind: CollectorKind, core: CollectorCore) -> Arc<dyn Collector> {
    match kind {
        CollectorKind::Marking => Arc::new(MarkingCollector::new(core)),
        CollectorKind::Trace => Arc::new(TraceCollector::new(core)),
    }
}
