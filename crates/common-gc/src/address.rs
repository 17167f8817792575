//! Heap addresses, tagged reference values and the heap address range

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Address of a managed object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapAddress(usize);

impl HeapAddress {
    /// Wrap a raw address
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw address value
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Address `bytes` past this one
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for HeapAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapAddress({:#x})", self.0)
    }
}

impl fmt::Display for HeapAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// Heap references are 8-byte aligned, so the low bits are free for tags.
const TAG_SPECIAL: u64 = 0b010;
const TAG_MASK: u64 = 0b111;
const PAYLOAD_SHIFT: u32 = 3;

/// Content of a reference slot.
///
/// A slot holds null, a heap reference, or a non-heap sentinel (undefined,
/// holes, booleans and similar runtime values). The encoding is private;
/// callers only ask which kind a value is.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefValue(u64);

impl RefValue {
    /// The null reference
    pub const NULL: RefValue = RefValue(0);

    /// Reference to a heap object
    pub fn from_address(addr: HeapAddress) -> Self {
        debug_assert!(addr.raw() != 0 && addr.raw() as u64 & TAG_MASK == 0);
        Self(addr.raw() as u64)
    }

    /// Non-heap sentinel carrying a small payload
    pub const fn special(payload: u32) -> Self {
        Self(((payload as u64) << PAYLOAD_SHIFT) | TAG_SPECIAL)
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) const fn to_raw(self) -> u64 {
        self.0
    }

    /// True for the null reference
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True if this value points at a heap object
    pub fn is_heap_reference(self) -> bool {
        self.0 != 0 && self.0 & TAG_MASK == 0
    }

    /// True for non-heap sentinels
    pub fn is_special_value(self) -> bool {
        self.0 & TAG_SPECIAL != 0
    }

    /// Payload of a sentinel value
    pub fn special_payload(self) -> Option<u32> {
        self.is_special_value()
            .then(|| (self.0 >> PAYLOAD_SHIFT) as u32)
    }

    /// Heap address, if this is a heap reference
    pub fn address(self) -> Option<HeapAddress> {
        self.is_heap_reference()
            .then(|| HeapAddress::new(self.0 as usize))
    }
}

impl From<HeapAddress> for RefValue {
    fn from(addr: HeapAddress) -> Self {
        RefValue::from_address(addr)
    }
}

impl fmt::Debug for RefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("RefValue(null)")
        } else if let Some(addr) = self.address() {
            write!(f, "RefValue({addr})")
        } else {
            write!(f, "RefValue(special {:#x})", self.0)
        }
    }
}

/// `[start, current_end)` range covering every region ever handed out.
///
/// The end only grows, so membership is a pair of comparisons and a stale
/// read can only under-report.
#[derive(Debug)]
pub struct HeapRange {
    start: usize,
    current_end: AtomicUsize,
}

impl HeapRange {
    /// Create an empty range starting at `start`
    pub fn new(start: HeapAddress) -> Self {
        Self {
            start: start.raw(),
            current_end: AtomicUsize::new(start.raw()),
        }
    }

    /// First heap address
    pub fn start(&self) -> HeapAddress {
        HeapAddress::new(self.start)
    }

    /// One past the last address handed out so far
    pub fn current_end(&self) -> HeapAddress {
        HeapAddress::new(self.current_end.load(Ordering::Acquire))
    }

    /// Grow the range to cover `end`; smaller values are ignored
    pub fn extend_to(&self, end: HeapAddress) {
        self.current_end.fetch_max(end.raw(), Ordering::AcqRel);
    }

    /// O(1) heap membership test
    pub fn contains(&self, addr: HeapAddress) -> bool {
        addr.raw() >= self.start && addr.raw() < self.current_end.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_value_kinds() {
        assert!(RefValue::NULL.is_null());
        assert!(!RefValue::NULL.is_heap_reference());
        assert!(!RefValue::NULL.is_special_value());

        let r = RefValue::from_address(HeapAddress::new(0x1000_0040));
        assert!(r.is_heap_reference());
        assert!(!r.is_special_value());
        assert_eq!(r.address(), Some(HeapAddress::new(0x1000_0040)));

        let s = RefValue::special(7);
        assert!(s.is_special_value());
        assert!(!s.is_heap_reference());
        assert_eq!(s.special_payload(), Some(7));
        assert_eq!(s.address(), None);
    }

    #[test]
    fn test_heap_range_only_grows() {
        let range = HeapRange::new(HeapAddress::new(0x1000));
        assert!(!range.contains(HeapAddress::new(0x1000)));

        range.extend_to(HeapAddress::new(0x3000));
        assert!(range.contains(HeapAddress::new(0x1000)));
        assert!(range.contains(HeapAddress::new(0x2fff)));
        assert!(!range.contains(HeapAddress::new(0x3000)));

        range.extend_to(HeapAddress::new(0x2000));
        assert_eq!(range.current_end(), HeapAddress::new(0x3000));
        assert!(!range.contains(HeapAddress::new(0x0fff)));
    }
}
