//! Heuristic trigger tests
//!
//! Collections requested by the policy on its own: heap threshold, startup
//! throttling, native memory pressure, background switch and hints.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use common_gc::{
    AllocType, GcObserver, GcReason, GcStats, GcType, Heap, MemoryReduceDegree, Mutator,
    RuntimeParam, StartupStatus,
};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct CycleLog {
    cycles: Mutex<Vec<(GcReason, GcType)>>,
}

impl GcObserver for CycleLog {
    fn on_gc_finished(&self, stats: &GcStats) {
        self.cycles.lock().push((stats.reason, stats.gc_type));
    }
}

impl CycleLog {
    fn attach(heap: &Heap) -> Arc<Self> {
        let log = Arc::new(Self::default());
        let observer: Weak<dyn GcObserver> = Arc::<CycleLog>::downgrade(&log);
        heap.add_gc_observer(observer);
        log
    }

    fn snapshot(&self) -> Vec<(GcReason, GcType)> {
        self.cycles.lock().clone()
    }

    /// Wait inside a safe region until `count` cycles were logged
    fn wait_for(&self, mutator: &Mutator, count: usize) -> Vec<(GcReason, GcType)> {
        let _safe = mutator.enter_safe_region();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let cycles = self.snapshot();
            if cycles.len() >= count {
                return cycles;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {count} cycles");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn heuristic_param() -> RuntimeParam {
    let mut param = RuntimeParam::default();
    param.heap.region_size = 16 * 1024;
    param.heap.heap_size = 8 * 1024 * 1024;
    param.gc.gc_threads = 2;
    param.gc.gc_interval = 0;
    param.gc.min_heap_threshold = 64 * 1024;
    param.gc.min_grow_bytes = 16 * 1024;
    param.gc.max_grow_bytes = 64 * 1024;
    param
}

fn allocate_garbage(heap: &Heap, mutator: &Mutator, kib: usize) {
    for _ in 0..kib {
        heap.allocate(mutator, 1024, AllocType::MovableObject, true)
            .unwrap();
    }
}

#[test]
fn test_threshold_crossing_requests_full_then_young() {
    init_tracing();
    let heap = Heap::new(heuristic_param()).unwrap();
    let log = CycleLog::attach(&heap);
    let m = heap.attach_mutator();

    let deadline = Instant::now() + Duration::from_secs(10);
    while log.snapshot().is_empty() {
        assert!(Instant::now() < deadline, "no heuristic collection");
        allocate_garbage(&heap, &m, 8);
    }
    assert_eq!(log.snapshot()[0], (GcReason::Heu, GcType::Full));

    // A full cycle arms the young request for the next crossing
    while !log
        .snapshot()
        .iter()
        .any(|&cycle| cycle == (GcReason::Young, GcType::Young))
    {
        assert!(Instant::now() < deadline, "no young collection");
        allocate_garbage(&heap, &m, 8);
    }
    heap.detach_mutator(&m);
}

#[test]
fn test_cold_startup_holds_back_heuristic_gc() {
    init_tracing();
    let heap = Heap::new(heuristic_param()).unwrap();
    let log = CycleLog::attach(&heap);
    let m = heap.attach_mutator();

    heap.startup().set_startup_status(StartupStatus::ColdStartup);
    allocate_garbage(&heap, &m, 256);
    assert!(heap.policy().should_restrain_gc_on_startup());
    assert_eq!(heap.gc_count(), 0);
    assert!(log.snapshot().is_empty());

    heap.startup()
        .set_startup_status(StartupStatus::ColdStartupFinish);
    allocate_garbage(&heap, &m, 1);
    let cycles = log.wait_for(&m, 1);
    assert_eq!(cycles[0], (GcReason::Heu, GcType::Full));
    heap.detach_mutator(&m);
}

#[test]
fn test_native_pressure_async_then_sync() {
    init_tracing();
    let mut param = heuristic_param();
    param.gc.native_immediate_threshold = 100;
    param.gc.native_init_threshold = 1000;
    param.gc.urgency_native_limit = 1024 * 1024;
    let heap = Heap::new(param).unwrap();
    let log = CycleLog::attach(&heap);
    let m = heap.attach_mutator();

    heap.notify_native_allocation(Some(&m), 2000);
    let cycles = log.wait_for(&m, 1);
    assert_eq!(cycles[0], (GcReason::Native, GcType::Full));
    assert!(heap.policy().native_heap_threshold() > 2000);

    // Above the urgency limit the caller waits for the cycle
    heap.notify_native_allocation(Some(&m), 2 * 1024 * 1024);
    let cycles = log.snapshot();
    assert_eq!(cycles.len(), 2);
    assert_eq!(cycles[1], (GcReason::NativeSync, GcType::Full));

    heap.notify_native_free(2 * 1024 * 1024);
    heap.notify_native_reset(Some(&m), 2000, 500);
    assert_eq!(heap.policy().notified_native_size(), 500);
    heap.detach_mutator(&m);
}

#[test]
fn test_background_switch_collects_grown_heap() {
    init_tracing();
    let mut param = heuristic_param();
    param.gc.background_limit = 4 * 1024;
    param.gc.min_background_gc_size = 8 * 1024;
    let heap = Heap::new(param).unwrap();
    let log = CycleLog::attach(&heap);
    let m = heap.attach_mutator();

    allocate_garbage(&heap, &m, 16);
    heap.change_gc_params(true);
    assert!(heap.policy().is_background());
    let cycles = log.wait_for(&m, 1);
    assert_eq!(cycles[0], (GcReason::Background, GcType::Full));

    heap.change_gc_params(false);
    assert!(!heap.policy().is_background());
    heap.detach_mutator(&m);
}

#[test]
fn test_hint_gc_respects_degree() {
    init_tracing();
    let mut param = heuristic_param();
    param.gc.hint_low_threshold = 1024 * 1024;
    param.gc.hint_high_threshold = 8 * 1024;
    let heap = Heap::new(param).unwrap();
    let log = CycleLog::attach(&heap);
    let m = heap.attach_mutator();

    allocate_garbage(&heap, &m, 16);
    assert!(!heap.check_and_trigger_hint_gc(MemoryReduceDegree::Low));
    assert!(heap.check_and_trigger_hint_gc(MemoryReduceDegree::High));
    let cycles = log.wait_for(&m, 1);
    assert_eq!(cycles[0], (GcReason::Hint, GcType::Full));
    heap.detach_mutator(&m);
}

#[test]
fn test_startup_timeline_releases_restraint() {
    init_tracing();
    let mut param = heuristic_param();
    param.gc.startup_duration = 20;
    param.gc.finish_startup_timepoint = 40;
    let heap = Heap::new(param).unwrap();

    heap.startup().on_app_startup().unwrap();
    assert!(matches!(
        heap.startup().status(),
        StartupStatus::ColdStartup | StartupStatus::ColdStartupPartiallyFinish
    ));

    let deadline = Instant::now() + Duration::from_secs(10);
    while heap.startup().status() != StartupStatus::ColdStartupFinish {
        assert!(Instant::now() < deadline, "startup never finished");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!heap.policy().should_restrain_gc_on_startup());
}
