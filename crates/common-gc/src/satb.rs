//! Snapshot-at-the-beginning log buffers
//!
//! Each mutator owns at most one [`SatbNode`] while it logs. A node is moved
//! into the global [`SatbBuffer`] when it fills up, on phase exit, or when
//! the mutator detaches. Ownership moves by value, so a node can be retired
//! once and only once.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::address::HeapAddress;

/// Entries per node before it is retired
pub const SATB_NODE_CAPACITY: usize = 512;

/// Per-mutator batch of logged references
#[derive(Debug)]
pub struct SatbNode {
    entries: Vec<HeapAddress>,
    max_size: usize,
}

impl SatbNode {
    /// Create a node with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(SATB_NODE_CAPACITY)
    }

    /// Create a node with a specific capacity
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Log an entry; returns true when the node is full
    pub fn push(&mut self, addr: HeapAddress) -> bool {
        self.entries.push(addr);
        self.entries.len() >= self.max_size
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was logged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Logged entries
    pub fn entries(&self) -> &[HeapAddress] {
        &self.entries
    }
}

impl Default for SatbNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Global collection of retired nodes
#[derive(Debug, Default)]
pub struct SatbBuffer {
    retired: Mutex<Vec<SatbNode>>,
    retired_total: AtomicUsize,
}

impl SatbBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a cycle with an empty buffer
    pub fn init(&self) {
        self.retired.lock().clear();
        self.retired_total.store(0, Ordering::Relaxed);
    }

    /// Take ownership of a mutator's node
    pub fn retire(&self, node: SatbNode) {
        if node.is_empty() {
            return;
        }
        self.retired_total.fetch_add(1, Ordering::Relaxed);
        self.retired.lock().push(node);
    }

    /// Hand every retired node to the collector
    pub fn take_retired(&self) -> Vec<SatbNode> {
        std::mem::take(&mut *self.retired.lock())
    }

    /// Whether retired nodes are waiting
    pub fn has_retired(&self) -> bool {
        !self.retired.lock().is_empty()
    }

    /// Nodes retired since [`init`](Self::init)
    pub fn retired_count(&self) -> usize {
        self.retired_total.load(Ordering::Relaxed)
    }

    /// Release storage at the end of a cycle
    pub fn reclaim(&self) {
        let mut retired = self.retired.lock();
        retired.clear();
        retired.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_reports_full() {
        let mut node = SatbNode::with_capacity(2);
        assert!(!node.push(HeapAddress::new(0x10)));
        assert!(node.push(HeapAddress::new(0x18)));
        assert_eq!(node.len(), 2);
    }

    #[test]
    fn test_buffer_takes_ownership() {
        let buffer = SatbBuffer::new();
        let mut node = SatbNode::new();
        node.push(HeapAddress::new(0x10));
        buffer.retire(node);
        buffer.retire(SatbNode::new());

        assert!(buffer.has_retired());
        assert_eq!(buffer.retired_count(), 1);
        let nodes = buffer.take_retired();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].entries(), &[HeapAddress::new(0x10)]);
        assert!(!buffer.has_retired());
    }
}
