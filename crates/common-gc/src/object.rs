//! Managed object layout
//!
//! The collector only needs a narrow view of an object: its size, its
//! reference slots, a mark word and a forwarding slot. Everything else about
//! the object model lives with the language runtime.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::address::{HeapAddress, RefValue};

/// Size of the object header in bytes
pub const HEADER_SIZE: usize = 8;
/// Size of one reference slot in bytes
pub const SLOT_SIZE: usize = 8;
/// Object alignment
pub const OBJECT_ALIGNMENT: usize = 8;

/// How the collector treats a reference slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Keeps its target alive
    Strong,
    /// Cleared when its target is otherwise unreachable
    Weak,
}

/// Type metadata shared by all instances of a type
#[derive(Debug)]
pub struct TypeInfo {
    name: String,
    fields: Box<[FieldKind]>,
    payload_bytes: usize,
    finalizable: bool,
}

impl TypeInfo {
    /// Type with the given reference slots and opaque payload
    pub fn new(name: impl Into<String>, fields: Vec<FieldKind>, payload_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fields: fields.into_boxed_slice(),
            payload_bytes,
            finalizable: false,
        })
    }

    /// Type whose instances are registered for finalization at allocation
    pub fn finalizable(
        name: impl Into<String>,
        fields: Vec<FieldKind>,
        payload_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fields: fields.into_boxed_slice(),
            payload_bytes,
            finalizable: true,
        })
    }

    /// Type without reference slots whose instances are `size` bytes
    pub fn leaf(name: impl Into<String>, size: usize) -> Arc<Self> {
        Self::new(name, Vec::new(), size.saturating_sub(HEADER_SIZE))
    }

    /// Type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot layout
    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    /// Whether instances need finalization
    pub fn is_finalizable(&self) -> bool {
        self.finalizable
    }

    /// Aligned instance size in bytes
    pub fn instance_size(&self) -> usize {
        align_up(HEADER_SIZE + self.fields.len() * SLOT_SIZE + self.payload_bytes)
    }
}

/// Round `size` up to the object alignment
pub const fn align_up(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// A reference slot.
///
/// All mutator access goes through a [`Barrier`](crate::barrier::Barrier);
/// the raw accessors here are the barrier's building blocks.
pub struct RefField {
    value: AtomicU64,
    kind: FieldKind,
}

impl RefField {
    fn new(kind: FieldKind) -> Self {
        Self {
            value: AtomicU64::new(RefValue::NULL.to_raw()),
            kind,
        }
    }

    /// Slot kind
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// True for weak slots
    pub fn is_weak(&self) -> bool {
        self.kind == FieldKind::Weak
    }

    /// Raw load
    pub fn load(&self, order: Ordering) -> RefValue {
        RefValue::from_raw(self.value.load(order))
    }

    /// Raw store
    pub fn store(&self, value: RefValue, order: Ordering) {
        self.value.store(value.to_raw(), order);
    }

    /// Raw swap, returns the previous value
    pub fn swap(&self, value: RefValue, order: Ordering) -> RefValue {
        RefValue::from_raw(self.value.swap(value.to_raw(), order))
    }

    /// Raw compare-and-swap, returns the previous value either way
    pub fn compare_exchange(
        &self,
        expected: RefValue,
        new: RefValue,
        success: Ordering,
        failure: Ordering,
    ) -> Result<RefValue, RefValue> {
        self.value
            .compare_exchange(expected.to_raw(), new.to_raw(), success, failure)
            .map(RefValue::from_raw)
            .map_err(RefValue::from_raw)
    }
}

impl fmt::Debug for RefField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefField")
            .field("kind", &self.kind)
            .field("value", &self.load(Ordering::Relaxed))
            .finish()
    }
}

/// A managed object as seen by the collector
pub struct BaseObject {
    addr: HeapAddress,
    region: usize,
    size: usize,
    type_info: Arc<TypeInfo>,
    fields: Box<[RefField]>,
    /// Mark version this object was last marked in
    mark: AtomicU32,
    /// Mark version current when the object was allocated
    birth: u32,
    /// Address of the evacuated copy, 0 when not forwarded
    forwarding: AtomicUsize,
}

impl BaseObject {
    pub(crate) fn new(
        addr: HeapAddress,
        region: usize,
        size: usize,
        type_info: Arc<TypeInfo>,
        birth: u32,
    ) -> Self {
        let fields = type_info
            .fields()
            .iter()
            .map(|&kind| RefField::new(kind))
            .collect();
        Self {
            addr,
            region,
            size,
            type_info,
            fields,
            mark: AtomicU32::new(0),
            birth,
            forwarding: AtomicUsize::new(0),
        }
    }

    /// Copy of `self` living at `addr`, with the slots' current contents
    pub(crate) fn copy_to(&self, addr: HeapAddress, region: usize, mark_version: u32) -> Self {
        let copy = Self::new(addr, region, self.size, self.type_info.clone(), self.birth);
        for (dst, src) in copy.fields.iter().zip(self.fields.iter()) {
            dst.store(src.load(Ordering::Acquire), Ordering::Relaxed);
        }
        copy.mark.store(mark_version, Ordering::Relaxed);
        copy
    }

    /// Object address
    pub fn addr(&self) -> HeapAddress {
        self.addr
    }

    /// Index of the region holding the object
    pub fn region(&self) -> usize {
        self.region
    }

    /// Type metadata
    pub fn type_info(&self) -> &Arc<TypeInfo> {
        &self.type_info
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size of the forwarded copy, which equals the original size
    pub fn size_forwarded(&self) -> usize {
        self.size
    }

    /// Reference slots
    pub fn fields(&self) -> &[RefField] {
        &self.fields
    }

    /// Slot at `index`
    pub fn field(&self, index: usize) -> Option<&RefField> {
        self.fields.get(index)
    }

    /// Whether the object has any reference slot
    pub fn has_ref_field(&self) -> bool {
        !self.fields.is_empty()
    }

    /// Sanity check used on values read out of the object table
    pub fn is_valid_object(&self) -> bool {
        self.addr.raw() != 0 && self.size >= HEADER_SIZE + self.fields.len() * SLOT_SIZE
    }

    /// Visit every reference slot
    pub fn for_each_ref_field(&self, mut visitor: impl FnMut(usize, &RefField)) {
        for (index, field) in self.fields.iter().enumerate() {
            visitor(index, field);
        }
    }

    /// Visit every reference slot and return the object size
    pub fn for_each_ref_field_and_get_size(&self, visitor: impl FnMut(usize, &RefField)) -> usize {
        self.for_each_ref_field(visitor);
        self.size
    }

    /// Address of the evacuated copy
    pub fn forwarding_pointer(&self) -> Option<HeapAddress> {
        match self.forwarding.load(Ordering::Acquire) {
            0 => None,
            raw => Some(HeapAddress::new(raw)),
        }
    }

    /// Install the forwarding pointer; only the first install wins
    pub(crate) fn set_forwarding_pointer(&self, to: HeapAddress) -> bool {
        self.forwarding
            .compare_exchange(0, to.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark for `version`; returns true if it was already marked
    pub(crate) fn mark(&self, version: u32) -> bool {
        self.mark.swap(version, Ordering::AcqRel) == version
    }

    /// Whether the object is marked for `version`
    pub(crate) fn is_marked(&self, version: u32) -> bool {
        self.mark.load(Ordering::Acquire) == version
    }

    /// Whether the object was allocated after marking version `version` began
    pub(crate) fn is_new_since(&self, version: u32) -> bool {
        self.birth == version
    }
}

impl fmt::Debug for BaseObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseObject")
            .field("addr", &self.addr)
            .field("type", &self.type_info.name())
            .field("size", &self.size)
            .field("forwarding", &self.forwarding_pointer())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_size() {
        let ty = TypeInfo::new("Pair", vec![FieldKind::Strong, FieldKind::Weak], 3);
        assert_eq!(ty.instance_size(), 32);
        assert_eq!(TypeInfo::leaf("Blob", 20).instance_size(), 24);
    }

    #[test]
    fn test_mark_versioning() {
        let ty = TypeInfo::new("Node", vec![FieldKind::Strong], 0);
        let obj = BaseObject::new(HeapAddress::new(0x1000), 0, 16, ty, 1);

        assert!(!obj.is_marked(2));
        assert!(!obj.mark(2));
        assert!(obj.mark(2));
        assert!(obj.is_marked(2));
        // A new version makes the old mark stale
        assert!(!obj.is_marked(3));
        assert!(obj.is_new_since(1));
        assert!(!obj.is_new_since(2));
    }

    #[test]
    fn test_forwarding_installs_once() {
        let ty = TypeInfo::new("Node", vec![FieldKind::Strong], 0);
        let obj = BaseObject::new(HeapAddress::new(0x1000), 0, 16, ty, 0);
        assert_eq!(obj.forwarding_pointer(), None);
        assert!(obj.set_forwarding_pointer(HeapAddress::new(0x2000)));
        assert!(!obj.set_forwarding_pointer(HeapAddress::new(0x3000)));
        assert_eq!(obj.forwarding_pointer(), Some(HeapAddress::new(0x2000)));
    }

    #[test]
    fn test_copy_preserves_fields() {
        let ty = TypeInfo::new("Pair", vec![FieldKind::Strong, FieldKind::Weak], 0);
        let obj = BaseObject::new(HeapAddress::new(0x1000), 0, 24, ty, 0);
        let target = RefValue::from_address(HeapAddress::new(0x1800));
        obj.fields()[1].store(target, Ordering::Relaxed);

        let copy = obj.copy_to(HeapAddress::new(0x4000), 3, 9);
        assert_eq!(copy.addr(), HeapAddress::new(0x4000));
        assert_eq!(copy.region(), 3);
        assert!(copy.is_marked(9));
        assert_eq!(copy.fields()[1].load(Ordering::Relaxed), target);
        assert!(copy.fields()[1].is_weak());
    }
}
