//! Read/write barriers
//!
//! Every access to a [`RefField`](crate::object::RefField) goes through the
//! heap's active barrier. Two implementations exist:
//! - [`StwBarrier`]: raw memory operation plus remembered-set upkeep, used
//!   while no cycle is running
//! - [`ConcurrentBarrier`]: additionally logs old and new values to the
//!   mutator's SATB node while the mutator is between ENUM and FIX, and
//!   resolves forwarded objects on reads while copying
//!
//! The heap swaps between them by flipping [`BarrierKind`].
//!
//! Holders are resolved before access: a handle taken before its object was
//! evacuated reaches the copy, not the dead original.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::address::{HeapAddress, RefValue};
use crate::mutator::Mutator;
use crate::object::{BaseObject, RefField};

/// Which barrier is active
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Plain barrier, no cycle running
    Stw = 0,
    /// SATB barrier, a cycle is running
    Concurrent = 1,
}

/// Copy of `holder` if it was evacuated.
///
/// `None` as well when the copy itself was reclaimed: the handle then names
/// garbage and accesses stay on the dead original.
fn forwarded_holder(mutator: &Mutator, holder: &BaseObject) -> Option<Arc<BaseObject>> {
    let space = mutator.context().space();
    let mut copy = space.lookup(holder.forwarding_pointer()?)?;
    while let Some(next) = copy.forwarding_pointer() {
        copy = space.lookup(next)?;
    }
    Some(copy)
}

fn slot<'a>(holder: &'a BaseObject, index: usize) -> &'a RefField {
    match holder.field(index) {
        Some(field) => field,
        None => crate::gc_fatal!(
            "slot {} out of range for {} ({} slots)",
            index,
            holder.addr(),
            holder.fields().len()
        ),
    }
}

fn slot_range(holder: &BaseObject, start: usize, len: usize) -> &[RefField] {
    match start.checked_add(len).and_then(|end| holder.fields().get(start..end)) {
        Some(fields) => fields,
        None => crate::gc_fatal!(
            "struct access {}..+{} out of range for {} ({} slots)",
            start,
            len,
            holder.addr(),
            holder.fields().len()
        ),
    }
}

/// Barrier contract.
///
/// Implementations provide the two hooks; the accessors are shared.
pub trait Barrier: Send + Sync {
    /// Which barrier this is
    fn kind(&self) -> BarrierKind;

    /// Called with the overwritten and the new value of every store
    fn on_write(&self, mutator: &Mutator, holder: &BaseObject, old: RefValue, new: RefValue);

    /// Called with every loaded value; returns the value handed to the mutator
    fn on_read(&self, mutator: &Mutator, value: RefValue) -> RefValue;

    /// Load a slot
    fn read_ref_field(&self, mutator: &Mutator, holder: &BaseObject, index: usize) -> RefValue {
        let current = forwarded_holder(mutator, holder);
        let holder = current.as_deref().unwrap_or(holder);
        let value = slot(holder, index).load(Ordering::Acquire);
        self.on_read(mutator, value)
    }

    /// Store into a slot
    fn write_ref_field(&self, mutator: &Mutator, holder: &BaseObject, index: usize, value: RefValue) {
        let current = forwarded_holder(mutator, holder);
        let holder = current.as_deref().unwrap_or(holder);
        let field = slot(holder, index);
        let old = field.load(Ordering::Acquire);
        self.on_write(mutator, holder, old, value);
        field.store(value, Ordering::Release);
    }

    /// Atomic load with the given ordering
    fn atomic_read_ref_field(
        &self,
        mutator: &Mutator,
        holder: &BaseObject,
        index: usize,
        order: Ordering,
    ) -> RefValue {
        let current = forwarded_holder(mutator, holder);
        let holder = current.as_deref().unwrap_or(holder);
        let value = slot(holder, index).load(order);
        self.on_read(mutator, value)
    }

    /// Atomic store with the given ordering
    fn atomic_write_ref_field(
        &self,
        mutator: &Mutator,
        holder: &BaseObject,
        index: usize,
        value: RefValue,
        order: Ordering,
    ) {
        let current = forwarded_holder(mutator, holder);
        let holder = current.as_deref().unwrap_or(holder);
        let field = slot(holder, index);
        let old = field.swap(value, order);
        self.on_write(mutator, holder, old, value);
    }

    /// Atomic swap, returns the previous value
    fn atomic_swap_ref_field(
        &self,
        mutator: &Mutator,
        holder: &BaseObject,
        index: usize,
        value: RefValue,
        order: Ordering,
    ) -> RefValue {
        let current = forwarded_holder(mutator, holder);
        let holder = current.as_deref().unwrap_or(holder);
        let field = slot(holder, index);
        let old = field.swap(value, order);
        self.on_write(mutator, holder, old, value);
        self.on_read(mutator, old)
    }

    /// Compare-and-swap; true when `new` was stored
    fn compare_and_swap_ref_field(
        &self,
        mutator: &Mutator,
        holder: &BaseObject,
        index: usize,
        expected: RefValue,
        new: RefValue,
    ) -> bool {
        let current = forwarded_holder(mutator, holder);
        let holder = current.as_deref().unwrap_or(holder);
        let field = slot(holder, index);
        match field.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(old) => {
                self.on_write(mutator, holder, old, new);
                true
            }
            Err(_) => false,
        }
    }

    /// Load `dst.len()` consecutive slots starting at `start`
    fn read_struct(&self, mutator: &Mutator, holder: &BaseObject, start: usize, dst: &mut [RefValue]) {
        let current = forwarded_holder(mutator, holder);
        let holder = current.as_deref().unwrap_or(holder);
        let fields = slot_range(holder, start, dst.len());
        for (out, field) in dst.iter_mut().zip(fields) {
            *out = self.on_read(mutator, field.load(Ordering::Acquire));
        }
    }

    /// Store `src` into consecutive slots starting at `start`
    fn write_struct(&self, mutator: &Mutator, holder: &BaseObject, start: usize, src: &[RefValue]) {
        let current = forwarded_holder(mutator, holder);
        let holder = current.as_deref().unwrap_or(holder);
        let fields = slot_range(holder, start, src.len());
        for (field, &value) in fields.iter().zip(src) {
            let old = field.load(Ordering::Acquire);
            self.on_write(mutator, holder, old, value);
            field.store(value, Ordering::Release);
        }
    }

    /// Copy `len` slots between objects; overlapping ranges behave like memmove
    fn copy_struct_array(
        &self,
        mutator: &Mutator,
        dst: &BaseObject,
        dst_start: usize,
        src: &BaseObject,
        src_start: usize,
        len: usize,
    ) {
        let current = forwarded_holder(mutator, src);
        let src = current.as_deref().unwrap_or(src);
        let values: Vec<RefValue> = slot_range(src, src_start, len)
            .iter()
            .map(|field| self.on_read(mutator, field.load(Ordering::Acquire)))
            .collect();
        self.write_struct(mutator, dst, dst_start, &values);
    }
}

/// Barrier used while no cycle is running
#[derive(Debug, Default, Clone, Copy)]
pub struct StwBarrier;

impl Barrier for StwBarrier {
    fn kind(&self) -> BarrierKind {
        BarrierKind::Stw
    }

    fn on_write(&self, mutator: &Mutator, holder: &BaseObject, _old: RefValue, new: RefValue) {
        mutator.context().space().record_cross_gen_write(holder, new);
    }

    fn on_read(&self, _mutator: &Mutator, value: RefValue) -> RefValue {
        value
    }
}

/// SATB barrier used while a cycle is running
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcurrentBarrier;

impl Barrier for ConcurrentBarrier {
    fn kind(&self) -> BarrierKind {
        BarrierKind::Concurrent
    }

    fn on_write(&self, mutator: &Mutator, holder: &BaseObject, old: RefValue, new: RefValue) {
        if mutator.phase().is_satb_logging() {
            // Old value keeps the snapshot intact, new value covers black
            // holders that will not be rescanned
            if let Some(addr) = old.address() {
                mutator.log_satb(addr);
            }
            if let Some(addr) = new.address() {
                mutator.log_satb(addr);
            }
        }
        mutator.context().space().record_cross_gen_write(holder, new);
    }

    fn on_read(&self, mutator: &Mutator, value: RefValue) -> RefValue {
        if mutator.phase().is_forwarding() {
            mutator.context().space().resolve(value)
        } else {
            value
        }
    }
}

/// Remembered set for tracking cross-generation references
///
/// Records old objects holding young references; they serve as additional
/// roots during young collection.
#[derive(Debug, Default)]
pub struct RememberedSet {
    entries: Mutex<FxHashSet<HeapAddress>>,
}

impl RememberedSet {
    /// Create a new remembered set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    pub fn add(&self, holder: HeapAddress) {
        self.entries.lock().insert(holder);
    }

    /// Remove an entry
    pub fn remove(&self, holder: HeapAddress) {
        self.entries.lock().remove(&holder);
    }

    /// Check if contains entry
    pub fn contains(&self, holder: HeapAddress) -> bool {
        self.entries.lock().contains(&holder)
    }

    /// Get all entries as roots
    pub fn roots(&self) -> Vec<HeapAddress> {
        self.entries.lock().iter().copied().collect()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remembered_set() {
        let rs = RememberedSet::new();
        let a = HeapAddress::new(0x1000);
        assert!(rs.is_empty());
        rs.add(a);
        rs.add(a);
        assert_eq!(rs.len(), 1);
        assert!(rs.contains(a));
        assert_eq!(rs.roots(), vec![a]);
        rs.remove(a);
        assert!(!rs.contains(a));
    }
}
