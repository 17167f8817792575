//! GC cycle tests
//!
//! End-to-end collections through the `Heap` facade, plus a stepwise cycle
//! driven by hand to observe the SATB barrier at work.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common_gc::collector::{CollectorCore, create_collector};
use common_gc::mutator_manager::MutatorManager;
use common_gc::sync::TaskPool;
use common_gc::{
    AllocType, BarrierKind, Collector, CollectorKind, FieldKind, GcContext, GcError, GcPhase,
    GcReason, GcType, Heap, RefValue, RuntimeParam, TypeInfo,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small heap with heuristic collections out of the way
fn test_param(kind: CollectorKind) -> RuntimeParam {
    let mut param = RuntimeParam::default();
    param.heap.region_size = 16 * 1024;
    param.heap.heap_size = 8 * 1024 * 1024;
    param.gc.collector = kind;
    param.gc.gc_threads = 2;
    param.gc.min_heap_threshold = 64 * 1024 * 1024;
    param
}

fn node_type() -> Arc<TypeInfo> {
    TypeInfo::new("Node", vec![FieldKind::Strong], 24)
}

fn collect_unreachable_objects(kind: CollectorKind) {
    init_tracing();
    let heap = Heap::new(test_param(kind)).unwrap();
    let m = heap.attach_mutator();
    let ty = node_type();

    let mut kept = Vec::new();
    for i in 0..1000 {
        let obj = heap
            .allocate_object(&m, ty.clone(), AllocType::MovableObject, true)
            .unwrap();
        if i % 100 == 0 {
            kept.push(heap.add_root(obj.addr().into()));
        }
    }

    assert!(heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap());
    let stats = heap.gc_stats();
    assert_eq!(stats.survived_objects, 10);
    assert_eq!(stats.collected_objects, 990);
    assert!(stats.collected_bytes > 0);
    assert_eq!(heap.gc_count(), 1);
    assert_eq!(heap.phase(), GcPhase::Idle);
    assert_eq!(heap.context().barrier_kind(), BarrierKind::Stw);

    for handle in kept {
        let addr = heap.root(handle).address().unwrap();
        assert!(heap.object(addr).is_some());
        assert!(heap.is_heap_address(addr));
    }
    heap.detach_mutator(&m);
}

#[test]
fn test_full_gc_keeps_only_rooted_objects() {
    collect_unreachable_objects(CollectorKind::Marking);
}

#[test]
fn test_trace_collector_keeps_only_rooted_objects() {
    collect_unreachable_objects(CollectorKind::Trace);
}

#[test]
fn test_reachable_graph_survives_evacuation() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    let m = heap.attach_mutator();
    let ty = node_type();

    // root -> n1 -> n2 -> ... -> n49
    let head = heap
        .allocate_object(&m, ty.clone(), AllocType::MovableObject, true)
        .unwrap();
    let root = heap.add_root(head.addr().into());
    let mut tail = head;
    for _ in 1..50 {
        let next = heap
            .allocate_object(&m, ty.clone(), AllocType::MovableObject, true)
            .unwrap();
        heap.write_field(&m, &tail, 0, next.addr().into());
        tail = next;
    }
    drop(tail);

    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap();
    assert_eq!(heap.gc_stats().survived_objects, 50);
    assert!(heap.gc_stats().copied_bytes > 0);

    let mut length = 0;
    let mut cursor = heap.root(root);
    while let Some(addr) = cursor.address() {
        let obj = heap.object(addr).expect("reachable object was reclaimed");
        assert!(!heap.context().space().is_in_young_space(&obj));
        cursor = heap.read_field(&m, &obj, 0);
        length += 1;
    }
    assert_eq!(length, 50);
    heap.detach_mutator(&m);
}

#[test]
fn test_young_gc_promotes_and_uses_remembered_set() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    let m = heap.attach_mutator();
    let ty = node_type();

    let old = heap
        .allocate_object(&m, ty.clone(), AllocType::MovableOldObject, true)
        .unwrap();
    let old_root = heap.add_root(old.addr().into());

    let young = heap
        .allocate_object(&m, ty.clone(), AllocType::MovableObject, true)
        .unwrap();
    let young_addr = young.addr();
    heap.write_field(&m, &old, 0, young_addr.into());
    assert!(heap.context().space().remembered_set().contains(old.addr()));
    for _ in 0..20 {
        heap.allocate_object(&m, ty.clone(), AllocType::MovableObject, true)
            .unwrap();
    }

    heap.collect_garbage(Some(&m), GcReason::Young, GcType::Young).unwrap();
    let stats = heap.gc_stats();
    assert_eq!(stats.gc_type, GcType::Young);
    assert_eq!(stats.collected_objects, 20);

    // The old holder stays put; its slot follows the promoted copy
    assert_eq!(heap.root(old_root).address(), Some(old.addr()));
    let promoted = heap.read_field(&m, &old, 0).address().unwrap();
    assert_ne!(promoted, young_addr);
    let promoted = heap.object(promoted).unwrap();
    assert!(!heap.context().space().is_in_young_space(&promoted));
    assert!(heap.object(young_addr).is_none());
    heap.detach_mutator(&m);
}

#[test]
fn test_young_gc_leaves_old_garbage_alone() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Trace)).unwrap();
    let m = heap.attach_mutator();
    let ty = node_type();

    let old_garbage = heap
        .allocate_object(&m, ty.clone(), AllocType::MovableOldObject, true)
        .unwrap();
    heap.collect_garbage(Some(&m), GcReason::Young, GcType::Young).unwrap();
    assert!(heap.object(old_garbage.addr()).is_some());

    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap();
    assert!(heap.object(old_garbage.addr()).is_none());
    heap.detach_mutator(&m);
}

#[test]
fn test_weak_ref_cleared_once() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    let m = heap.attach_mutator();
    let weak_box = TypeInfo::new("WeakBox", vec![FieldKind::Weak], 0);
    let ty = node_type();

    let dying_holder = heap
        .allocate_object(&m, weak_box.clone(), AllocType::MovableObject, true)
        .unwrap();
    let dying_root = heap.add_root(dying_holder.addr().into());
    let dying = heap
        .allocate_object(&m, ty.clone(), AllocType::MovableObject, true)
        .unwrap();
    heap.write_field(&m, &dying_holder, 0, dying.addr().into());

    let kept_holder = heap
        .allocate_object(&m, weak_box, AllocType::MovableObject, true)
        .unwrap();
    let kept_root = heap.add_root(kept_holder.addr().into());
    let kept = heap
        .allocate_object(&m, ty, AllocType::MovableObject, true)
        .unwrap();
    let kept_target_root = heap.add_root(kept.addr().into());
    heap.write_field(&m, &kept_holder, 0, kept.addr().into());

    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap();
    assert_eq!(heap.gc_stats().cleared_weak_refs, 1);

    let holder = heap.object(heap.root(dying_root).address().unwrap()).unwrap();
    assert!(heap.read_field(&m, &holder, 0).is_null());
    assert!(heap.object(dying.addr()).is_none());

    // A weak slot to a live target follows the move
    let holder = heap.object(heap.root(kept_root).address().unwrap()).unwrap();
    assert_eq!(heap.read_field(&m, &holder, 0), heap.root(kept_target_root));

    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap();
    assert_eq!(heap.gc_stats().cleared_weak_refs, 0);
    let holder = heap.object(heap.root(dying_root).address().unwrap()).unwrap();
    assert!(heap.read_field(&m, &holder, 0).is_null());
    heap.detach_mutator(&m);
}

#[test]
fn test_finalizable_object_resurrected_then_reclaimed() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    let m = heap.attach_mutator();
    let resource = TypeInfo::finalizable("Resource", vec![FieldKind::Strong], 8);

    let obj = heap
        .allocate_object(&m, resource, AllocType::MovableObject, true)
        .unwrap();
    let child = heap
        .allocate_object(&m, node_type(), AllocType::MovableObject, true)
        .unwrap();
    heap.write_field(&m, &obj, 0, child.addr().into());
    assert_eq!(heap.context().finalizers().registered_count(), 1);
    drop((obj, child));

    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap();
    assert_eq!(heap.gc_stats().resurrected_objects, 1);
    assert_eq!(heap.gc_stats().survived_objects, 2);

    let due = heap.drain_finalizable();
    assert_eq!(due.len(), 1);
    let resurrected = heap.object(due[0]).unwrap();
    let child = heap.read_field(&m, &resurrected, 0).address().unwrap();
    assert!(heap.object(child).is_some());
    drop(resurrected);

    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap();
    assert_eq!(heap.gc_stats().resurrected_objects, 0);
    assert!(heap.object(due[0]).is_none());
    assert!(heap.object(child).is_none());
    heap.detach_mutator(&m);
}

#[test]
fn test_oversized_allocation_reports_oom() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    let m = heap.attach_mutator();

    let err = heap
        .allocate(&m, 64 * 1024, AllocType::MovableObject, false)
        .unwrap_err();
    assert!(matches!(err, GcError::OutOfMemory { requested: 65536, .. }));
    assert_eq!(heap.gc_count(), 0);

    let err = heap
        .allocate(&m, 64 * 1024, AllocType::MovableObject, true)
        .unwrap_err();
    assert!(matches!(err, GcError::OutOfMemory { .. }));
    assert_eq!(heap.gc_count(), 1);
    assert_eq!(heap.gc_stats().reason, GcReason::Oom);
    heap.detach_mutator(&m);
}

#[test]
fn test_oom_collection_frees_room() {
    init_tracing();
    let mut param = test_param(CollectorKind::Marking);
    param.heap.region_size = 4096;
    param.heap.heap_size = 4 * 4096;
    let heap = Heap::new(param).unwrap();
    let m = heap.attach_mutator();

    for _ in 0..64 {
        heap.allocate(&m, 1024, AllocType::MovableObject, true)
            .unwrap();
    }
    assert!(heap.gc_count() >= 1);
    assert_eq!(heap.gc_stats().reason, GcReason::Oom);
    heap.detach_mutator(&m);
}

#[test]
fn test_oom_with_live_young_heap_reports_error() {
    init_tracing();
    let mut param = test_param(CollectorKind::Marking);
    param.heap.region_size = 4096;
    param.heap.heap_size = 2 * 4096;
    let heap = Heap::new(param).unwrap();
    let m = heap.attach_mutator();

    let mut roots = Vec::new();
    let err = loop {
        match heap.allocate(&m, 1024, AllocType::MovableObject, true) {
            Ok(addr) => roots.push(heap.add_root(addr.into())),
            Err(err) => break err,
        }
        assert!(roots.len() <= 8, "heap never filled up");
    };
    assert!(matches!(err, GcError::OutOfMemory { requested: 1024, .. }));
    assert_eq!(roots.len(), 8);
    assert_eq!(heap.gc_stats().reason, GcReason::Oom);
    assert_eq!(heap.gc_stats().survived_objects, 8);

    // Survivors stayed in place and are still reachable
    for &handle in &roots {
        let addr = heap.root(handle).address().unwrap();
        assert!(heap.object(addr).is_some());
    }

    // Dropping the roots makes the space reusable
    for handle in roots {
        heap.remove_root(handle);
    }
    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full)
        .unwrap();
    heap.allocate(&m, 1024, AllocType::MovableObject, false)
        .unwrap();
    heap.detach_mutator(&m);
}

#[test]
fn test_stale_handle_accesses_moved_object() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    let m = heap.attach_mutator();

    let holder = heap
        .allocate_object(&m, node_type(), AllocType::MovableObject, true)
        .unwrap();
    let root = heap.add_root(holder.addr().into());
    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full)
        .unwrap();
    let moved = heap.root(root).address().unwrap();
    assert_ne!(moved, holder.addr());

    // Written through the handle taken before the move
    let child = heap
        .allocate_object(&m, node_type(), AllocType::MovableObject, true)
        .unwrap();
    heap.write_field(&m, &holder, 0, child.addr().into());
    let live = heap.object(moved).unwrap();
    assert_eq!(live.fields()[0].load(Ordering::Acquire), child.addr().into());
    assert_eq!(heap.read_field(&m, &holder, 0), child.addr().into());

    // The edge keeps the child alive through the next cycle
    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full)
        .unwrap();
    let child_now = heap.read_field(&m, &holder, 0).address().unwrap();
    assert_ne!(child_now, child.addr());
    assert!(heap.object(child_now).is_some());
    heap.detach_mutator(&m);
}

#[test]
fn test_read_only_objects_are_roots() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    let m = heap.attach_mutator();

    let table = heap
        .allocate_object(&m, node_type(), AllocType::ReadOnlyObject, true)
        .unwrap();
    let entry = heap
        .allocate_object(&m, node_type(), AllocType::MovableObject, true)
        .unwrap();
    heap.write_field(&m, &table, 0, entry.addr().into());

    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap();
    assert!(heap.object(table.addr()).is_some());
    let moved = heap.read_field(&m, &table, 0).address().unwrap();
    assert!(heap.object(moved).is_some());
    heap.detach_mutator(&m);
}

#[test]
fn test_mutator_roots_follow_evacuation() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Trace)).unwrap();
    let m = heap.attach_mutator();

    let obj = heap
        .allocate_object(&m, node_type(), AllocType::MovableObject, true)
        .unwrap();
    let slot = m.push_root(obj.addr().into());

    heap.collect_garbage(Some(&m), GcReason::User, GcType::Full).unwrap();
    let moved = m.root(slot).address().unwrap();
    assert_ne!(moved, obj.addr());
    assert!(heap.object(moved).is_some());
    assert!(heap.object(obj.addr()).is_none());
    heap.detach_mutator(&m);
}

/// A mutator keeps rotating four lists hanging off a rooted head object
/// while the main thread collects. Every node stays reachable, so none may
/// be lost.
fn mutate_during_collections(kind: CollectorKind) {
    init_tracing();
    const NODES: usize = 2000;
    let heap = Arc::new(Heap::new(test_param(kind)).unwrap());
    let head_type = TypeInfo::new("Head", vec![FieldKind::Strong; 4], 0);

    let worker = {
        let heap = heap.clone();
        std::thread::spawn(move || {
            let m = heap.attach_mutator();
            let head = heap
                .allocate_object(&m, head_type, AllocType::MovableObject, true)
                .unwrap();
            let root = heap.add_root(head.addr().into());
            drop(head);
            let ty = node_type();
            for i in 0..NODES {
                let node = heap
                    .allocate_object(&m, ty.clone(), AllocType::MovableObject, true)
                    .unwrap();
                let head = heap.object(heap.root(root).address().unwrap()).unwrap();
                let first = heap.read_field(&m, &head, i % 4);
                heap.write_field(&m, &node, 0, first);
                heap.write_field(&m, &head, i % 4, node.addr().into());
                m.safepoint();
            }
            heap.detach_mutator(&m);
            root
        })
    };

    let mut cycles = 0;
    while !worker.is_finished() {
        let gc_type = if cycles % 2 == 0 {
            GcType::Full
        } else {
            GcType::Young
        };
        heap.collect_garbage(None, GcReason::User, gc_type).unwrap();
        cycles += 1;
    }
    let root = worker.join().unwrap();
    heap.collect_garbage(None, GcReason::User, GcType::Full).unwrap();

    let head = heap.object(heap.root(root).address().unwrap()).unwrap();
    let mut count = 0;
    for list in 0..4 {
        let mut cursor = head.field(list).unwrap().load(Ordering::Acquire);
        while let Some(addr) = cursor.address() {
            let node = heap.object(addr).expect("live node was reclaimed");
            cursor = node.field(0).unwrap().load(Ordering::Acquire);
            count += 1;
        }
    }
    assert_eq!(count, NODES);
    assert_eq!(heap.gc_stats().survived_objects, NODES + 1);
}

#[test]
fn test_marking_collector_sound_under_mutation() {
    mutate_during_collections(CollectorKind::Marking);
}

#[test]
fn test_trace_collector_sound_under_mutation() {
    mutate_during_collections(CollectorKind::Trace);
}

/// Drives one cycle by hand: an edge from an already scanned object to an
/// unreached one, written during marking, must be caught by the remark.
fn satb_catches_write_during_marking(kind: CollectorKind) {
    init_tracing();
    let context = Arc::new(GcContext::new(test_param(kind)));
    let mutators = Arc::new(MutatorManager::new(context.clone()));
    let pool = Arc::new(TaskPool::new(2).unwrap());
    let collector = create_collector(
        kind,
        CollectorCore::new(context.clone(), mutators.clone(), pool),
    );
    let space = context.space();
    let m = mutators.register();
    let ty = node_type();

    let black = space
        .allocate(0, ty.clone(), AllocType::MovableObject)
        .unwrap();
    context.roots().add(black.addr().into());
    let white = space.allocate(0, ty, AllocType::MovableObject).unwrap();

    // ENUM and concurrent MARK
    {
        let _safe = m.enter_safe_region();
        mutators.stop_the_world();
        context.set_barrier(BarrierKind::Concurrent);
        space.start_marking();
        mutators.transition_all_mutators(GcPhase::Enum);
        let seeds = collector.enumerate_roots(GcType::Full);
        mutators.transition_all_mutators(GcPhase::Mark);
        mutators.start_the_world();
        collector.process_mark_stack(GcType::Full, seeds, 2);
    }
    assert_eq!(m.phase(), GcPhase::Mark);
    assert!(space.is_marked(&black));
    assert!(!space.is_marked(&white));

    context
        .barrier()
        .write_ref_field(&m, &black, 0, white.addr().into());
    assert!(m.has_satb_node());
    assert!(!space.is_marked(&white));

    // REMARK
    {
        let _safe = m.enter_safe_region();
        mutators.stop_the_world();
        collector.remark(GcType::Full);
        mutators.transition_all_mutators(GcPhase::Idle);
        mutators.start_the_world();
        context.set_barrier(BarrierKind::Stw);
    }
    assert!(!m.has_satb_node());
    assert!(space.is_marked(&white));
    assert!(space.is_live(GcType::Full, &white));
    assert_eq!(black.field(0).unwrap().load(Ordering::Acquire), RefValue::from(white.addr()));
    mutators.unregister(&m);
}

#[test]
fn test_satb_catches_write_during_marking() {
    satb_catches_write_during_marking(CollectorKind::Marking);
}

#[test]
fn test_satb_catches_write_during_final_mark() {
    satb_catches_write_during_marking(CollectorKind::Trace);
}

#[test]
fn test_objects_allocated_during_marking_survive() {
    init_tracing();
    let context = Arc::new(GcContext::new(test_param(CollectorKind::Marking)));
    let space = context.space();
    let ty = node_type();

    let before = space
        .allocate(0, ty.clone(), AllocType::MovableObject)
        .unwrap();
    space.start_marking();
    let during = space.allocate(0, ty, AllocType::MovableObject).unwrap();

    assert!(!space.is_live(GcType::Full, &before));
    assert!(space.is_new_object_since_marking(&during));
    assert!(space.is_live(GcType::Full, &during));
}

#[test]
fn test_disabled_gc_ignores_requests_but_force() {
    init_tracing();
    let mut param = test_param(CollectorKind::Marking);
    param.gc.enable_gc = false;
    let heap = Heap::new(param).unwrap();

    assert!(!heap.request_gc(GcReason::User, false, GcType::Full).unwrap());
    assert_eq!(heap.gc_count(), 0);
    assert!(heap.request_gc(GcReason::Force, false, GcType::Full).unwrap());
    assert_eq!(heap.gc_count(), 1);
}

#[test]
fn test_requests_after_shutdown_fail() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    heap.shutdown();
    let err = heap.request_gc(GcReason::User, true, GcType::Full).unwrap_err();
    assert!(matches!(err, GcError::ShutDown));
}

#[test]
fn test_async_requests_coalesce() {
    init_tracing();
    let heap = Heap::new(test_param(CollectorKind::Marking)).unwrap();
    let mut scheduled = 0;
    for _ in 0..50 {
        if heap.request_gc(GcReason::User, true, GcType::Full).unwrap() {
            scheduled += 1;
        }
    }
    // Wait for the queue to drain
    heap.request_gc(GcReason::User, false, GcType::Full).unwrap();
    assert!(scheduled >= 1);
    assert_eq!(heap.gc_count(), scheduled + 1);
}
