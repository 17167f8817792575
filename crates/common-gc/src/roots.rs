//! Static roots and the finalizer queue

use parking_lot::Mutex;

use crate::address::{HeapAddress, RefValue};

/// Handle to a static root slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(usize);

#[derive(Debug, Default)]
struct RootSlab {
    slots: Vec<Option<RefValue>>,
    free: Vec<usize>,
}

/// Table of runtime-global roots (builtins, handles held by native code)
#[derive(Debug, Default)]
pub struct RootTable {
    slab: Mutex<RootSlab>,
}

impl RootTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` as a root
    pub fn add(&self, value: RefValue) -> RootHandle {
        let mut slab = self.slab.lock();
        match slab.free.pop() {
            Some(index) => {
                slab.slots[index] = Some(value);
                RootHandle(index)
            }
            None => {
                slab.slots.push(Some(value));
                RootHandle(slab.slots.len() - 1)
            }
        }
    }

    /// Unregister a root, returning its last value
    pub fn remove(&self, handle: RootHandle) -> Option<RefValue> {
        let mut slab = self.slab.lock();
        let value = slab.slots.get_mut(handle.0)?.take()?;
        slab.free.push(handle.0);
        Some(value)
    }

    /// Current value of a root, null once removed
    pub fn get(&self, handle: RootHandle) -> RefValue {
        self.slab
            .lock()
            .slots
            .get(handle.0)
            .copied()
            .flatten()
            .unwrap_or(RefValue::NULL)
    }

    /// Overwrite a live root
    pub fn set(&self, handle: RootHandle, value: RefValue) {
        let mut slab = self.slab.lock();
        if let Some(slot) = slab.slots.get_mut(handle.0)
            && slot.is_some()
        {
            *slot = Some(value);
        }
    }

    /// Visit every live root value
    pub fn for_each(&self, mut visitor: impl FnMut(RefValue)) {
        for value in self.slab.lock().slots.iter().flatten() {
            visitor(*value);
        }
    }

    /// Rewrite every root through `fix`
    pub fn fix(&self, mut fix: impl FnMut(RefValue) -> RefValue) {
        for value in self.slab.lock().slots.iter_mut().flatten() {
            *value = fix(*value);
        }
    }

    /// Number of live roots
    pub fn len(&self) -> usize {
        self.slab.lock().slots.iter().flatten().count()
    }

    /// Whether no root is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Objects with finalizers.
///
/// Registered objects are not roots. Once a trace finds one unreachable it
/// is resurrected into the pending list, which is a root until the runtime
/// drains it and runs the finalizers.
#[derive(Debug, Default)]
pub struct FinalizerQueue {
    registered: Mutex<Vec<HeapAddress>>,
    pending: Mutex<Vec<HeapAddress>>,
}

impl FinalizerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `addr` for unreachability
    pub fn register(&self, addr: HeapAddress) {
        self.registered.lock().push(addr);
    }

    /// Number of watched objects
    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// Move every registered object for which `is_dead` holds to the
    /// pending list and return them
    pub fn resurrect_dead(&self, mut is_dead: impl FnMut(HeapAddress) -> bool) -> Vec<HeapAddress> {
        let mut dead = Vec::new();
        self.registered.lock().retain(|&addr| {
            if is_dead(addr) {
                dead.push(addr);
                false
            } else {
                true
            }
        });
        self.pending.lock().extend_from_slice(&dead);
        dead
    }

    /// Visit pending objects, which are roots
    pub fn for_each_pending(&self, mut visitor: impl FnMut(HeapAddress)) {
        for &addr in self.pending.lock().iter() {
            visitor(addr);
        }
    }

    /// Number of objects waiting for their finalizer
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Hand pending objects to the runtime; they stop being roots
    pub fn drain(&self) -> Vec<HeapAddress> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Rewrite every entry through `fix`
    pub fn fix(&self, mut fix: impl FnMut(HeapAddress) -> HeapAddress) {
        for addr in self.registered.lock().iter_mut() {
            *addr = fix(*addr);
        }
        for addr in self.pending.lock().iter_mut() {
            *addr = fix(*addr);
        }
    }

    /// Drop registered entries that `is_gone` reports as reclaimed
    pub fn prune(&self, mut is_gone: impl FnMut(HeapAddress) -> bool) {
        self.registered.lock().retain(|&addr| !is_gone(addr));
    }
}
