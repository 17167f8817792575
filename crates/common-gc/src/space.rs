//! Region space
//!
//! The heap is a run of fixed-size regions starting at [`HEAP_BASE`]. Each
//! region holds objects of one allocation kind and is bump allocated.
//! Young regions are evacuated into old space by copying; the other kinds
//! are swept in place by a full collection. A young region whose survivors
//! do not all fit into old space is promoted in place instead.
//!
//! Objects are tracked in an address-keyed table so the collector can go
//! from a [`RefValue`] to the [`BaseObject`] it names.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::address::{HeapAddress, HeapRange, RefValue};
use crate::barrier::RememberedSet;
use crate::object::{BaseObject, TypeInfo, align_up};
use crate::param::HeapParam;
use crate::stats::GcType;
use crate::sync::TaskPool;

/// Address of the first region
pub const HEAP_BASE: usize = 0x1000_0000;

/// Allocation kind requested by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocType {
    /// Young, evacuated on collection
    MovableObject,
    /// Allocated directly in old space
    MovableOldObject,
    /// Never moved, swept by full collections
    NonMovableObject,
    /// Never moved and never scanned for references
    RawPointerObject,
    /// Never collected; its slots act as roots
    ReadOnlyObject,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Free = 0,
    Young = 1,
    Old = 2,
    NonMovable = 3,
    RawPointer = 4,
    ReadOnly = 5,
}

impl RegionKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RegionKind::Young,
            2 => RegionKind::Old,
            3 => RegionKind::NonMovable,
            4 => RegionKind::RawPointer,
            5 => RegionKind::ReadOnly,
            _ => RegionKind::Free,
        }
    }

    fn for_alloc(alloc: AllocType) -> Self {
        match alloc {
            AllocType::MovableObject => RegionKind::Young,
            AllocType::MovableOldObject => RegionKind::Old,
            AllocType::NonMovableObject => RegionKind::NonMovable,
            AllocType::RawPointerObject => RegionKind::RawPointer,
            AllocType::ReadOnlyObject => RegionKind::ReadOnly,
        }
    }

    // Slot in `RegionTable::current`
    fn cursor_slot(self) -> usize {
        self as usize - 1
    }
}

#[derive(Debug)]
struct Region {
    kind: RegionKind,
    top: usize,
    objects: Vec<HeapAddress>,
}

#[derive(Debug, Default)]
struct RegionTable {
    regions: Vec<Region>,
    free: Vec<usize>,
    /// Free regions still counted as committed
    cached_free: usize,
    /// Current bump region per kind
    current: [Option<usize>; 5],
}

/// Outcome of an evacuation
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyOutcome {
    /// Objects copied
    pub objects: usize,
    /// Bytes copied
    pub bytes: usize,
    /// From-space regions promoted in place for lack of to-space
    pub promoted_regions: usize,
    /// Threads that took part
    pub workers: usize,
}

/// Outcome of a reclamation pass
#[derive(Debug, Default, Clone, Copy)]
pub struct ReclaimOutcome {
    /// Dead objects dropped
    pub objects: usize,
    /// Bytes held by dead objects
    pub bytes: usize,
    /// Regions returned to the free list
    pub regions: usize,
}

/// Region-based heap space
pub struct RegionSpace {
    range: HeapRange,
    region_size: usize,
    max_regions: usize,
    table: Mutex<RegionTable>,
    kinds: Box<[AtomicU8]>,
    from_space: Box<[AtomicBool]>,
    pinned: Box<[AtomicBool]>,
    live_bytes: Box<[AtomicUsize]>,
    objects: RwLock<FxHashMap<HeapAddress, Arc<BaseObject>>>,
    read_only: Mutex<Vec<Arc<BaseObject>>>,
    mark_version: AtomicU32,
    allocated: AtomicUsize,
    recent_allocated: AtomicUsize,
    survived: AtomicUsize,
    remembered: RememberedSet,
}

impl std::fmt::Debug for RegionSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionSpace")
            .field("range", &self.range)
            .field("region_size", &self.region_size)
            .field("max_regions", &self.max_regions)
            .field("allocated", &self.allocated_bytes())
            .field("mark_version", &self.mark_version())
            .finish_non_exhaustive()
    }
}

impl RegionSpace {
    /// Create an empty space sized by `param`
    pub fn new(param: &HeapParam) -> Self {
        let max_regions = param.heap_size / param.region_size;
        Self {
            range: HeapRange::new(HeapAddress::new(HEAP_BASE)),
            region_size: param.region_size,
            max_regions,
            table: Mutex::new(RegionTable::default()),
            kinds: (0..max_regions).map(|_| AtomicU8::new(0)).collect(),
            from_space: (0..max_regions).map(|_| AtomicBool::new(false)).collect(),
            pinned: (0..max_regions).map(|_| AtomicBool::new(false)).collect(),
            live_bytes: (0..max_regions).map(|_| AtomicUsize::new(0)).collect(),
            objects: RwLock::new(FxHashMap::default()),
            read_only: Mutex::new(Vec::new()),
            mark_version: AtomicU32::new(0),
            allocated: AtomicUsize::new(0),
            recent_allocated: AtomicUsize::new(0),
            survived: AtomicUsize::new(0),
            remembered: RememberedSet::new(),
        }
    }

    /// Heap address range
    pub fn range(&self) -> &HeapRange {
        &self.range
    }

    /// Region size in bytes
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Maximum heap size in bytes
    pub fn heap_size(&self) -> usize {
        self.max_regions * self.region_size
    }

    /// Old-to-young remembered set
    pub fn remembered_set(&self) -> &RememberedSet {
        &self.remembered
    }

    fn region_index(&self, addr: HeapAddress) -> Option<usize> {
        if !self.range.contains(addr) {
            return None;
        }
        let index = (addr.raw() - HEAP_BASE) / self.region_size;
        (index < self.max_regions).then_some(index)
    }

    fn region_kind(&self, index: usize) -> RegionKind {
        RegionKind::from_u8(self.kinds[index].load(Ordering::Acquire))
    }

    /// Allocate a `type_info` instance of `size` bytes.
    ///
    /// Returns `None` when no region can hold the object.
    pub fn allocate(
        &self,
        size: usize,
        type_info: Arc<TypeInfo>,
        alloc: AllocType,
    ) -> Option<Arc<BaseObject>> {
        let size = align_up(size.max(type_info.instance_size()));
        let obj = self.allocate_in(RegionKind::for_alloc(alloc), size, type_info, None)?;
        if alloc == AllocType::ReadOnlyObject && obj.has_ref_field() {
            self.read_only.lock().push(obj.clone());
        }
        self.recent_allocated.fetch_add(size, Ordering::Relaxed);
        Some(obj)
    }

    /// Read-only objects with slots; their slots are roots
    pub fn read_only_objects(&self) -> Vec<Arc<BaseObject>> {
        self.read_only.lock().clone()
    }

    fn allocate_in(
        &self,
        kind: RegionKind,
        size: usize,
        type_info: Arc<TypeInfo>,
        copy_of: Option<&BaseObject>,
    ) -> Option<Arc<BaseObject>> {
        if size > self.region_size {
            return None;
        }
        let mut table = self.table.lock();
        let slot = kind.cursor_slot();
        let index = match table.current[slot] {
            Some(index) if table.regions[index].top + size <= self.region_size => index,
            _ => {
                let index = self.acquire_region(&mut table, kind)?;
                table.current[slot] = Some(index);
                index
            }
        };

        let region = &mut table.regions[index];
        let addr = HeapAddress::new(HEAP_BASE + index * self.region_size + region.top);
        region.top += size;
        region.objects.push(addr);

        let version = self.mark_version.load(Ordering::Acquire);
        let obj = Arc::new(match copy_of {
            Some(from) => from.copy_to(addr, index, version),
            None => BaseObject::new(addr, index, size, type_info, version),
        });
        // Publish before the address escapes the table lock
        self.objects.write().insert(addr, obj.clone());
        drop(table);

        self.allocated.fetch_add(size, Ordering::Relaxed);
        Some(obj)
    }

    fn acquire_region(&self, table: &mut RegionTable, kind: RegionKind) -> Option<usize> {
        let index = if let Some(index) = table.free.pop() {
            table.cached_free = table.cached_free.saturating_sub(1);
            let region = &mut table.regions[index];
            region.kind = kind;
            region.top = 0;
            region.objects.clear();
            index
        } else {
            let index = table.regions.len();
            if index >= self.max_regions {
                return None;
            }
            table.regions.push(Region {
                kind,
                top: 0,
                objects: Vec::new(),
            });
            let end = HEAP_BASE + (index + 1) * self.region_size;
            self.range.extend_to(HeapAddress::new(end));
            index
        };
        self.kinds[index].store(kind as u8, Ordering::Release);
        self.live_bytes[index].store(0, Ordering::Relaxed);
        trace!(target: "common_gc::space", region = index, ?kind, "region acquired");
        Some(index)
    }

    fn release_region(&self, table: &mut RegionTable, index: usize) {
        let kind = table.regions[index].kind;
        if kind == RegionKind::Free {
            return;
        }
        if table.current[kind.cursor_slot()] == Some(index) {
            table.current[kind.cursor_slot()] = None;
        }
        let region = &mut table.regions[index];
        region.kind = RegionKind::Free;
        region.top = 0;
        region.objects = Vec::new();
        self.kinds[index].store(RegionKind::Free as u8, Ordering::Release);
        self.from_space[index].store(false, Ordering::Release);
        self.pinned[index].store(false, Ordering::Release);
        table.free.push(index);
        table.cached_free += 1;
    }

    /// Object at `addr`
    pub fn lookup(&self, addr: HeapAddress) -> Option<Arc<BaseObject>> {
        self.objects.read().get(&addr).cloned()
    }

    /// Object named by a slot value
    pub fn lookup_value(&self, value: RefValue) -> Option<Arc<BaseObject>> {
        value.address().and_then(|addr| self.lookup(addr))
    }

    /// Snapshot of every object in the space
    pub fn objects(&self) -> Vec<Arc<BaseObject>> {
        self.objects.read().values().cloned().collect()
    }

    /// Number of objects in the space
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Current mark version
    pub fn mark_version(&self) -> u32 {
        self.mark_version.load(Ordering::Acquire)
    }

    /// Open a new marking epoch; previous marks become stale
    pub fn start_marking(&self) -> u32 {
        for live in self.live_bytes.iter() {
            live.store(0, Ordering::Relaxed);
        }
        self.mark_version.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Mark `obj`; returns true if it was already marked
    pub fn mark_object(&self, obj: &BaseObject) -> bool {
        obj.mark(self.mark_version())
    }

    /// Whether `obj` is marked in the current epoch
    pub fn is_marked(&self, obj: &BaseObject) -> bool {
        obj.is_marked(self.mark_version())
    }

    /// Whether `obj` was allocated after the current epoch began
    pub fn is_new_object_since_marking(&self, obj: &BaseObject) -> bool {
        obj.is_new_since(self.mark_version())
    }

    /// Whether `obj` lives in a young region
    pub fn is_in_young_space(&self, obj: &BaseObject) -> bool {
        self.region_kind(obj.region()) == RegionKind::Young
    }

    /// Whether `addr` lies in a young region
    pub fn is_young_address(&self, addr: HeapAddress) -> bool {
        self.region_index(addr)
            .is_some_and(|index| self.region_kind(index) == RegionKind::Young)
    }

    /// Whether `obj` lives in a read-only region
    pub fn is_read_only(&self, obj: &BaseObject) -> bool {
        self.region_kind(obj.region()) == RegionKind::ReadOnly
    }

    /// Whether the collector must scan `obj`'s slots
    pub fn is_scannable(&self, obj: &BaseObject) -> bool {
        obj.has_ref_field() && self.region_kind(obj.region()) != RegionKind::RawPointer
    }

    /// Whether a `gc_type` collection traces into `obj`
    pub fn is_collected_by(&self, gc_type: GcType, obj: &BaseObject) -> bool {
        match self.region_kind(obj.region()) {
            RegionKind::ReadOnly | RegionKind::Free => false,
            RegionKind::Young => true,
            _ => gc_type == GcType::Full,
        }
    }

    /// Whether `obj` survives the current cycle as far as marking knows
    pub fn is_live(&self, gc_type: GcType, obj: &BaseObject) -> bool {
        !self.is_collected_by(gc_type, obj)
            || self.is_marked(obj)
            || self.is_new_object_since_marking(obj)
    }

    /// Credit `bytes` of live data to `region`
    pub fn add_live_byte_count(&self, region: usize, bytes: usize) {
        if let Some(live) = self.live_bytes.get(region) {
            live.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Live bytes found in `region` by the current trace
    pub fn live_byte_count(&self, region: usize) -> usize {
        self.live_bytes
            .get(region)
            .map_or(0, |live| live.load(Ordering::Relaxed))
    }

    /// Bytes held by all objects
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Bytes allocated by the runtime since the last cycle started
    pub fn recent_allocated_size(&self) -> usize {
        self.recent_allocated.load(Ordering::Relaxed)
    }

    /// Restart the recent allocation counter
    pub fn reset_recent_allocated(&self) {
        self.recent_allocated.store(0, Ordering::Relaxed);
    }

    /// Bytes that survived the last cycle
    pub fn survived_size(&self) -> usize {
        self.survived.load(Ordering::Relaxed)
    }

    /// Bytes in regions that are in use or cached
    pub fn committed_bytes(&self) -> usize {
        let table = self.table.lock();
        (table.regions.len() - table.free.len() + table.cached_free) * self.region_size
    }

    /// Record an old-to-young edge created by a write
    pub fn record_cross_gen_write(&self, holder: &BaseObject, value: RefValue) {
        if let Some(target) = value.address()
            && self.is_young_address(target)
            && !self.is_in_young_space(holder)
        {
            self.remembered.add(holder.addr());
        }
    }

    /// Turn every current young region into from-space.
    ///
    /// Later young allocations open new regions, so from-space stays fixed
    /// for the rest of the cycle. Returns the bytes held by from-space.
    pub fn select_from_space(&self) -> usize {
        let mut table = self.table.lock();
        let mut bytes = 0;
        for (index, region) in table.regions.iter().enumerate() {
            if region.kind == RegionKind::Young {
                self.from_space[index].store(true, Ordering::Release);
                bytes += region.top;
            }
        }
        table.current[RegionKind::Young.cursor_slot()] = None;
        debug!(target: "common_gc::space", from_space_bytes = bytes, "from-space selected");
        bytes
    }

    /// Whether `obj` sits in from-space
    pub fn is_from_space(&self, obj: &BaseObject) -> bool {
        self.from_space[obj.region()].load(Ordering::Acquire)
    }

    /// Whether `obj` stays where it is after evacuation: it lives in a
    /// promoted from-space region, was not copied and survived marking
    fn survives_in_place(&self, obj: &BaseObject) -> bool {
        self.pinned[obj.region()].load(Ordering::Acquire)
            && obj.forwarding_pointer().is_none()
            && (self.is_marked(obj) || self.is_new_object_since_marking(obj))
    }

    fn is_from_space_address(&self, addr: HeapAddress) -> bool {
        self.region_index(addr)
            .is_some_and(|index| self.from_space[index].load(Ordering::Acquire))
    }

    /// Follow a forwarding pointer if `value` names an evacuated object
    pub fn resolve(&self, value: RefValue) -> RefValue {
        match value.address() {
            Some(addr) if self.is_from_space_address(addr) => self
                .lookup(addr)
                .and_then(|obj| obj.forwarding_pointer())
                .map_or(value, RefValue::from_address),
            _ => value,
        }
    }

    /// Copy every live from-space object into old space using `pool`.
    ///
    /// Survivors that find no to-space stay put, and their regions are
    /// promoted to old space once copying is done.
    pub fn copy_from_space(self: &Arc<Self>, pool: &TaskPool, gc_type: GcType) -> CopyOutcome {
        let survivors: Arc<Vec<Arc<BaseObject>>> = Arc::new(
            self.objects
                .read()
                .values()
                .filter(|obj| self.is_from_space(obj) && self.is_live(gc_type, obj))
                .cloned()
                .collect(),
        );
        let next = Arc::new(AtomicUsize::new(0));
        let copied = Arc::new(AtomicUsize::new(0));
        let copied_bytes = Arc::new(AtomicUsize::new(0));

        let task = {
            let space = self.clone();
            let survivors = survivors.clone();
            let (next, copied, copied_bytes) = (next.clone(), copied.clone(), copied_bytes.clone());
            Arc::new(move |_worker: usize| {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(from) = survivors.get(i) else { break };
                    if space.copy_object(from) {
                        copied.fetch_add(1, Ordering::Relaxed);
                        copied_bytes.fetch_add(from.size_forwarded(), Ordering::Relaxed);
                    }
                }
            })
        };
        let workers = pool.run_parallel(pool.parallelism(pool.total_thread_num() + 1), task);

        let outcome = CopyOutcome {
            objects: copied.load(Ordering::Relaxed),
            bytes: copied_bytes.load(Ordering::Relaxed),
            promoted_regions: self.promote_pinned_regions(),
            workers,
        };
        debug!(
            target: "common_gc::space",
            objects = outcome.objects,
            bytes = outcome.bytes,
            workers,
            "from-space evacuated"
        );
        outcome
    }

    /// Copy `from` into old space; false when no to-space is left and the
    /// object's region has been pinned instead
    fn copy_object(&self, from: &BaseObject) -> bool {
        if from.forwarding_pointer().is_some() {
            return false;
        }
        let size = from.size_forwarded();
        let Some(copy) = self.allocate_in(RegionKind::Old, size, from.type_info().clone(), Some(from))
        else {
            self.pinned[from.region()].store(true, Ordering::Release);
            return false;
        };
        if !from.set_forwarding_pointer(copy.addr()) {
            crate::gc_fatal!("object {} forwarded twice", from.addr());
        }
        true
    }

    /// Turn pinned from-space regions into old regions. They keep their
    /// from-space flag until reclaim so copied neighbours still resolve.
    fn promote_pinned_regions(&self) -> usize {
        let mut table = self.table.lock();
        let mut promoted = 0;
        for index in 0..table.regions.len() {
            if !self.pinned[index].load(Ordering::Acquire) {
                continue;
            }
            table.regions[index].kind = RegionKind::Old;
            self.kinds[index].store(RegionKind::Old as u8, Ordering::Release);
            promoted += 1;
        }
        if promoted > 0 {
            warn!(target: "common_gc::space", regions = promoted, "to-space exhausted, promoting regions in place");
        }
        promoted
    }

    /// Rewrite slots that still name evacuated objects and rebuild the
    /// remembered set from the surviving heap.
    pub fn fix_references(self: &Arc<Self>, pool: &TaskPool) -> usize {
        let holders: Arc<Vec<Arc<BaseObject>>> = Arc::new(
            self.objects
                .read()
                .values()
                .filter(|obj| {
                    obj.has_ref_field() && (!self.is_from_space(obj) || self.survives_in_place(obj))
                })
                .cloned()
                .collect(),
        );
        self.remembered.clear();
        let next = Arc::new(AtomicUsize::new(0));
        let fixed = Arc::new(AtomicUsize::new(0));

        let task = {
            let space = self.clone();
            let holders = holders.clone();
            let (next, fixed) = (next.clone(), fixed.clone());
            Arc::new(move |_worker: usize| {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(holder) = holders.get(i) else { break };
                    holder.for_each_ref_field(|_, field| {
                        let value = field.load(Ordering::Acquire);
                        let resolved = space.resolve(value);
                        if resolved != value {
                            field.store(resolved, Ordering::Release);
                            fixed.fetch_add(1, Ordering::Relaxed);
                        }
                        space.record_cross_gen_write(holder, resolved);
                    });
                }
            })
        };
        pool.run_parallel(pool.parallelism(pool.total_thread_num() + 1), task);
        fixed.load(Ordering::Relaxed)
    }

    /// Drop from-space and, for a full collection, sweep unmarked objects
    /// out of the other collectable regions.
    pub fn reclaim(&self, gc_type: GcType) -> ReclaimOutcome {
        let mut outcome = ReclaimOutcome::default();
        let mut table = self.table.lock();
        let mut objects = self.objects.write();
        let mut freed_bytes = 0;

        for index in 0..table.regions.len() {
            let kind = table.regions[index].kind;
            if kind == RegionKind::Free {
                continue;
            }
            if self.from_space[index].load(Ordering::Acquire) {
                let mut kept = Vec::new();
                for addr in std::mem::take(&mut table.regions[index].objects) {
                    let Some(obj) = objects.get(&addr) else { continue };
                    if self.survives_in_place(obj) {
                        kept.push(addr);
                        continue;
                    }
                    freed_bytes += obj.size();
                    if obj.forwarding_pointer().is_none() {
                        outcome.objects += 1;
                        outcome.bytes += obj.size();
                    }
                    objects.remove(&addr);
                }
                self.from_space[index].store(false, Ordering::Release);
                self.pinned[index].store(false, Ordering::Release);
                if kept.is_empty() {
                    self.release_region(&mut table, index);
                    outcome.regions += 1;
                } else {
                    table.regions[index].objects = kept;
                }
                continue;
            }
            if gc_type != GcType::Full || matches!(kind, RegionKind::Young | RegionKind::ReadOnly) {
                continue;
            }
            let mut dead_bytes = 0;
            let mut dead = 0;
            table.regions[index].objects.retain(|addr| {
                let Some(obj) = objects.get(addr) else { return false };
                if self.is_live(gc_type, obj) {
                    return true;
                }
                dead_bytes += obj.size();
                dead += 1;
                objects.remove(addr);
                false
            });
            freed_bytes += dead_bytes;
            outcome.objects += dead;
            outcome.bytes += dead_bytes;
            if table.regions[index].objects.is_empty() {
                self.release_region(&mut table, index);
                outcome.regions += 1;
            }
        }
        drop(objects);
        drop(table);

        let allocated = self.allocated.fetch_sub(freed_bytes, Ordering::Relaxed) - freed_bytes;
        self.survived.store(allocated, Ordering::Relaxed);
        debug!(
            target: "common_gc::space",
            objects = outcome.objects,
            bytes = outcome.bytes,
            regions = outcome.regions,
            "space reclaimed"
        );
        outcome
    }

    /// Keep at most `keep` free regions committed
    pub fn trim_region_cache(&self, keep: usize) -> usize {
        let mut table = self.table.lock();
        let released = table.cached_free.saturating_sub(keep);
        table.cached_free -= released;
        if released > 0 {
            trace!(target: "common_gc::space", released, "region cache trimmed");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::FieldKind;
    use crate::sync::PriorityMode;

    fn small_space() -> Arc<RegionSpace> {
        Arc::new(RegionSpace::new(&HeapParam {
            region_size: 4096,
            heap_size: 16 * 4096,
            ..HeapParam::default()
        }))
    }

    #[test]
    fn test_allocate_bumps_within_region() {
        let space = small_space();
        let ty = TypeInfo::leaf("Blob", 64);
        let a = space.allocate(64, ty.clone(), AllocType::MovableObject).unwrap();
        let b = space.allocate(64, ty, AllocType::MovableObject).unwrap();
        assert_eq!(a.addr(), HeapAddress::new(HEAP_BASE));
        assert_eq!(b.addr(), HeapAddress::new(HEAP_BASE + 64));
        assert!(space.is_in_young_space(&a));
        assert_eq!(space.allocated_bytes(), 128);
        assert!(space.range().contains(b.addr()));
    }

    #[test]
    fn test_kinds_get_separate_regions() {
        let space = small_space();
        let ty = TypeInfo::leaf("Blob", 32);
        let young = space.allocate(32, ty.clone(), AllocType::MovableObject).unwrap();
        let old = space.allocate(32, ty, AllocType::MovableOldObject).unwrap();
        assert_ne!(young.region(), old.region());
        assert!(!space.is_in_young_space(&old));
        assert!(space.is_collected_by(GcType::Young, &young));
        assert!(!space.is_collected_by(GcType::Young, &old));
        assert!(space.is_collected_by(GcType::Full, &old));
    }

    #[test]
    fn test_allocation_fails_when_heap_is_full() {
        let space = small_space();
        let ty = TypeInfo::leaf("Blob", 4096);
        for _ in 0..16 {
            assert!(space.allocate(4096, ty.clone(), AllocType::NonMovableObject).is_some());
        }
        assert!(space.allocate(4096, ty.clone(), AllocType::NonMovableObject).is_none());
        assert!(space.allocate(8192, ty, AllocType::MovableObject).is_none());
    }

    #[test]
    fn test_full_sweep_drops_unmarked() {
        let space = small_space();
        let ty = TypeInfo::leaf("Blob", 64);
        let keep = space.allocate(64, ty.clone(), AllocType::NonMovableObject).unwrap();
        let lose = space.allocate(64, ty, AllocType::NonMovableObject).unwrap();

        space.start_marking();
        assert!(!space.mark_object(&keep));
        let outcome = space.reclaim(GcType::Full);

        assert_eq!(outcome.objects, 1);
        assert_eq!(outcome.bytes, 64);
        assert!(space.lookup(keep.addr()).is_some());
        assert!(space.lookup(lose.addr()).is_none());
        assert_eq!(space.allocated_bytes(), 64);
        assert_eq!(space.survived_size(), 64);
    }

    #[test]
    fn test_evacuation_forwards_and_fixes() {
        let space = small_space();
        let pool = TaskPool::new(2).unwrap();
        let holder_ty = TypeInfo::new("Holder", vec![FieldKind::Strong], 0);
        let leaf_ty = TypeInfo::leaf("Leaf", 16);

        let holder = space.allocate(0, holder_ty, AllocType::MovableOldObject).unwrap();
        let young = space.allocate(16, leaf_ty.clone(), AllocType::MovableObject).unwrap();
        let garbage = space.allocate(16, leaf_ty, AllocType::MovableObject).unwrap();
        holder.fields()[0].store(young.addr().into(), Ordering::Relaxed);
        space.record_cross_gen_write(&holder, young.addr().into());
        assert!(space.remembered_set().contains(holder.addr()));

        space.start_marking();
        space.mark_object(&young);
        space.select_from_space();
        let copied = space.copy_from_space(&pool, GcType::Young);
        assert_eq!(copied.objects, 1);
        assert_eq!(copied.promoted_regions, 0);

        let forwarded = young.forwarding_pointer().unwrap();
        assert_eq!(space.resolve(young.addr().into()), forwarded.into());
        assert_eq!(space.fix_references(&pool), 1);
        assert_eq!(holder.fields()[0].load(Ordering::Relaxed), forwarded.into());
        // The survivor is old now, so the edge is no longer cross-generational
        assert!(space.remembered_set().is_empty());

        let outcome = space.reclaim(GcType::Young);
        assert_eq!(outcome.objects, 1);
        assert!(space.lookup(garbage.addr()).is_none());
        assert!(space.lookup(young.addr()).is_none());
        assert!(space.lookup(forwarded).is_some());
    }

    #[test]
    fn test_background_evacuation_uses_half_the_pool() {
        let space = small_space();
        let pool = TaskPool::new(4).unwrap();
        let ty = TypeInfo::leaf("Leaf", 16);
        space.allocate(16, ty, AllocType::MovableObject).unwrap();
        space.start_marking();
        space.select_from_space();

        pool.set_priority(PriorityMode::Background);
        assert_eq!(space.copy_from_space(&pool, GcType::Young).workers, 3);
        pool.set_priority(PriorityMode::Foreground);
        assert_eq!(space.copy_from_space(&pool, GcType::Young).workers, 5);
    }

    #[test]
    fn test_full_young_space_is_promoted_in_place() {
        let space = Arc::new(RegionSpace::new(&HeapParam {
            region_size: 4096,
            heap_size: 2 * 4096,
            ..HeapParam::default()
        }));
        let pool = TaskPool::new(2).unwrap();
        let ty = TypeInfo::leaf("Blob", 1024);
        let live: Vec<_> = (0..8)
            .map(|_| space.allocate(1024, ty.clone(), AllocType::MovableObject).unwrap())
            .collect();
        assert!(space.allocate(1024, ty.clone(), AllocType::MovableObject).is_none());

        space.start_marking();
        for obj in &live[..6] {
            space.mark_object(obj);
        }
        space.select_from_space();
        let copied = space.copy_from_space(&pool, GcType::Full);
        assert_eq!(copied.objects, 0);
        assert_eq!(copied.promoted_regions, 2);
        space.fix_references(&pool);

        let outcome = space.reclaim(GcType::Full);
        assert_eq!(outcome.objects, 2);
        assert_eq!(outcome.regions, 0);
        for obj in &live[..6] {
            assert_eq!(obj.forwarding_pointer(), None);
            assert!(space.lookup(obj.addr()).is_some());
            assert!(!space.is_in_young_space(obj));
            assert!(!space.is_from_space(obj));
        }
        assert!(space.lookup(live[7].addr()).is_none());
        assert_eq!(space.allocated_bytes(), 6 * 1024);
        // Promoted regions keep their bump pointer, so young space is still full
        assert!(space.allocate(1024, ty, AllocType::MovableObject).is_none());
    }

    #[test]
    fn test_region_cache_trim() {
        let space = small_space();
        let ty = TypeInfo::leaf("Blob", 4096);
        for _ in 0..3 {
            space.allocate(4096, ty.clone(), AllocType::NonMovableObject).unwrap();
        }
        space.start_marking();
        assert_eq!(space.reclaim(GcType::Full).regions, 3);
        assert_eq!(space.committed_bytes(), 3 * 4096);
        assert_eq!(space.trim_region_cache(1), 2);
        assert_eq!(space.committed_bytes(), 4096);
        // Freed regions are reused and the range never shrinks
        assert_eq!(space.range().current_end(), HeapAddress::new(HEAP_BASE + 3 * 4096));
    }
}
