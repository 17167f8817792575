//! Heap facade
//!
//! [`Heap`] wires the pieces together for an embedding runtime: the shared
//! [`GcContext`], the mutator registry, the worker pool, the selected
//! collector with its driver thread and the heuristic policy. Everything the
//! runtime calls goes through here.

use std::sync::{Arc, Weak};

use tracing::{error, info};

use crate::address::{HeapAddress, RefValue};
use crate::barrier::Barrier;
use crate::collector::{Collector, CollectorCore, GcDriver, GcObserver, GcTrigger, create_collector};
use crate::context::GcContext;
use crate::error::{GcError, GcResult};
use crate::heuristic::{HeuristicGcPolicy, MemoryReduceDegree, StartupStatusManager};
use crate::mutator::Mutator;
use crate::mutator_manager::MutatorManager;
use crate::object::{BaseObject, TypeInfo};
use crate::param::{CollectorKind, RuntimeParam};
use crate::phase::GcPhase;
use crate::roots::RootHandle;
use crate::space::AllocType;
use crate::stats::{GcReason, GcStats, GcType};
use crate::sync::TaskPool;

/// A garbage-collected heap
pub struct Heap {
    context: Arc<GcContext>,
    mutators: Arc<MutatorManager>,
    pool: Arc<TaskPool>,
    collector: Arc<dyn Collector>,
    driver: Arc<GcDriver>,
    policy: Arc<HeuristicGcPolicy>,
    startup: Arc<StartupStatusManager>,
    raw_type: Arc<TypeInfo>,
}

impl Heap {
    /// Create a heap and start its GC threads
    pub fn new(param: RuntimeParam) -> GcResult<Self> {
        param.validate()?;
        let context = Arc::new(GcContext::new(param));
        let mutators = Arc::new(MutatorManager::new(context.clone()));
        let workers = context.param().gc_worker_count();
        let pool = Arc::new(TaskPool::new(workers)?);

        let kind = context.param().gc.collector;
        let core = CollectorCore::new(context.clone(), mutators.clone(), pool.clone());
        let collector = create_collector(kind, core);
        let driver = Arc::new(GcDriver::start(collector.clone())?);

        let startup = Arc::new(StartupStatusManager::new(&context.param().gc));
        let trigger: Arc<dyn GcTrigger> = driver.clone();
        let policy = Arc::new(HeuristicGcPolicy::new(
            context.clone(),
            trigger,
            startup.clone(),
            Some(pool.clone()),
        ));
        let observer: Weak<dyn GcObserver> = Arc::<HeuristicGcPolicy>::downgrade(&policy);
        collector.core().add_observer(observer);

        info!(
            target: "common_gc::gc",
            ?kind,
            heap_size = context.param().heap.heap_size,
            region_size = context.param().heap.region_size,
            workers,
            "heap created"
        );

        Ok(Self {
            context,
            mutators,
            pool,
            collector,
            driver,
            policy,
            startup,
            raw_type: TypeInfo::leaf("RawObject", 0),
        })
    }

    /// Shared heap state
    pub fn context(&self) -> &Arc<GcContext> {
        &self.context
    }

    /// Mutator registry
    pub fn mutator_manager(&self) -> &Arc<MutatorManager> {
        &self.mutators
    }

    /// Active collector strategy
    pub fn collector_kind(&self) -> CollectorKind {
        self.collector.kind()
    }

    /// Heuristic policy
    pub fn policy(&self) -> &Arc<HeuristicGcPolicy> {
        &self.policy
    }

    /// Startup status tracking
    pub fn startup(&self) -> &Arc<StartupStatusManager> {
        &self.startup
    }

    /// Attach the calling thread
    pub fn attach_mutator(&self) -> Arc<Mutator> {
        self.mutators.register()
    }

    /// Detach a mutator; it is destroyed by the next cycle
    pub fn detach_mutator(&self, mutator: &Arc<Mutator>) {
        self.mutators.unregister(mutator);
    }

    /// Allocate `size` raw bytes and return the object's address
    pub fn allocate(
        &self,
        mutator: &Mutator,
        size: usize,
        alloc: AllocType,
        allow_gc: bool,
    ) -> GcResult<HeapAddress> {
        let obj = self.allocate_inner(mutator, size, self.raw_type.clone(), alloc, allow_gc)?;
        Ok(obj.addr())
    }

    /// Allocate an instance of `type_info`.
    ///
    /// Finalizable types are registered with the finalizer queue.
    pub fn allocate_object(
        &self,
        mutator: &Mutator,
        type_info: Arc<TypeInfo>,
        alloc: AllocType,
        allow_gc: bool,
    ) -> GcResult<Arc<BaseObject>> {
        let size = type_info.instance_size();
        self.allocate_inner(mutator, size, type_info, alloc, allow_gc)
    }

    fn allocate_inner(
        &self,
        mutator: &Mutator,
        size: usize,
        type_info: Arc<TypeInfo>,
        alloc: AllocType,
        allow_gc: bool,
    ) -> GcResult<Arc<BaseObject>> {
        mutator.safepoint();
        if self.context.is_gc_running() {
            mutator.throttle_allocation(size);
        }

        let space = self.context.space();
        let obj = match space.allocate(size, type_info.clone(), alloc) {
            Some(obj) => obj,
            None if allow_gc => {
                self.collect_garbage(Some(mutator), GcReason::Oom, GcType::Full)?;
                space
                    .allocate(size, type_info, alloc)
                    .ok_or_else(|| self.throw_oom(size))?
            }
            None => return Err(self.throw_oom(size)),
        };

        if obj.type_info().is_finalizable() {
            self.context.finalizers().register(obj.addr());
        }
        if allow_gc {
            self.policy.try_heuristic_gc();
        }
        Ok(obj)
    }

    /// Build the out-of-memory error once the OOM collection did not help
    pub fn throw_oom(&self, requested: usize) -> GcError {
        let allocated = self.context.space().allocated_bytes();
        let limit = self.context.param().heap.heap_size;
        error!(target: "common_gc::gc", requested, allocated, limit, "heap out of memory");
        GcError::OutOfMemory {
            requested,
            allocated,
            limit,
        }
    }

    /// Request a collection; see [`GcDriver::request`]
    pub fn request_gc(&self, reason: GcReason, is_async: bool, gc_type: GcType) -> GcResult<bool> {
        self.driver.request(reason, is_async, gc_type)
    }

    /// Run a collection and wait for it.
    ///
    /// When called from a mutator thread pass its mutator: it waits inside a
    /// safe region so the cycle can stop the world.
    pub fn collect_garbage(
        &self,
        mutator: Option<&Mutator>,
        reason: GcReason,
        gc_type: GcType,
    ) -> GcResult<bool> {
        match mutator {
            Some(mutator) => {
                let _safe = mutator.enter_safe_region();
                self.driver.request(reason, false, gc_type)
            }
            None => self.driver.request(reason, false, gc_type),
        }
    }

    /// Active barrier
    pub fn barrier(&self) -> &'static dyn Barrier {
        self.context.barrier()
    }

    /// Load slot `index` of `holder` through the barrier
    pub fn read_field(&self, mutator: &Mutator, holder: &BaseObject, index: usize) -> RefValue {
        self.barrier().read_ref_field(mutator, holder, index)
    }

    /// Store into slot `index` of `holder` through the barrier
    pub fn write_field(&self, mutator: &Mutator, holder: &BaseObject, index: usize, value: RefValue) {
        self.barrier().write_ref_field(mutator, holder, index, value);
    }

    /// Add a static root
    pub fn add_root(&self, value: RefValue) -> RootHandle {
        self.context.roots().add(value)
    }

    /// Remove a static root
    pub fn remove_root(&self, handle: RootHandle) -> Option<RefValue> {
        self.context.roots().remove(handle)
    }

    /// Current value of a static root; evacuation keeps it up to date
    pub fn root(&self, handle: RootHandle) -> RefValue {
        self.context.roots().get(handle)
    }

    /// Register an object for finalization
    pub fn register_finalizer(&self, addr: HeapAddress) {
        self.context.finalizers().register(addr);
    }

    /// Take the objects whose finalizers are due.
    ///
    /// They stop being rooted; the next cycle reclaims them unless the
    /// finalizer stored them somewhere reachable.
    pub fn drain_finalizable(&self) -> Vec<HeapAddress> {
        self.context.finalizers().drain()
    }

    /// Object at `addr`, following a forwarding pointer if it moved
    pub fn object(&self, addr: HeapAddress) -> Option<Arc<BaseObject>> {
        let space = self.context.space();
        space.lookup_value(space.resolve(addr.into()))
    }

    /// Heap-wide GC phase
    pub fn phase(&self) -> GcPhase {
        self.context.phase().load()
    }

    /// Whether `addr` lies in the heap's address range
    pub fn is_heap_address(&self, addr: HeapAddress) -> bool {
        self.context.space().range().contains(addr)
    }

    /// Statistics of the last cycle
    pub fn gc_stats(&self) -> GcStats {
        self.collector.core().stats()
    }

    /// Completed cycles
    pub fn gc_count(&self) -> u64 {
        self.context.gc_count()
    }

    /// Get notified after every cycle; dropped observers are forgotten
    pub fn add_gc_observer(&self, observer: Weak<dyn GcObserver>) {
        self.collector.core().add_observer(observer);
    }

    fn with_safe_region(&self, mutator: Option<&Mutator>, f: impl FnOnce(&HeuristicGcPolicy)) {
        match mutator {
            Some(mutator) => {
                let _safe = mutator.enter_safe_region();
                f(&self.policy);
            }
            None => f(&self.policy),
        }
    }

    /// Account native memory owned by managed objects.
    ///
    /// Urgent pressure runs a synchronous collection, so a mutator thread
    /// must pass its mutator.
    pub fn notify_native_allocation(&self, mutator: Option<&Mutator>, bytes: usize) {
        self.with_safe_region(mutator, |policy| policy.notify_native_allocation(bytes));
    }

    /// Account freed native memory
    pub fn notify_native_free(&self, bytes: usize) {
        self.policy.notify_native_free(bytes);
    }

    /// Account a resized native block
    pub fn notify_native_reset(&self, mutator: Option<&Mutator>, old_bytes: usize, new_bytes: usize) {
        self.with_safe_region(mutator, |policy| policy.notify_native_reset(old_bytes, new_bytes));
    }

    /// Application moved to the background or foreground
    pub fn change_gc_params(&self, is_background: bool) {
        self.policy.change_gc_params(is_background);
    }

    /// Memory-reduction hint from the embedder
    pub fn check_and_trigger_hint_gc(&self, degree: MemoryReduceDegree) -> bool {
        self.policy.check_and_trigger_hint_gc(degree)
    }

    /// Stop the GC threads. Queued cycles finish first.
    pub fn shutdown(&self) {
        if self.driver.is_shut_down() {
            return;
        }
        self.driver.shutdown();
        self.startup.cancel_timer();
        self.pool.shutdown();
        info!(target: "common_gc::gc", gc_count = self.gc_count(), "heap shut down");
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.shutdown();
    }
}
