//! GC phase state machine

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Heap-wide GC phase.
///
/// Phases are totally ordered in cycle order, so "between ENUM and FIX" is a
/// pair of comparisons.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcPhase {
    /// No GC in progress
    Idle = 0,
    /// Root enumeration (stop-the-world)
    Enum = 1,
    /// Concurrent marking
    Mark = 2,
    /// From-space selection ahead of copying
    Precopy = 3,
    /// Remark replaying retired SATB logs (stop-the-world)
    RemarkSatb = 4,
    /// Final marking of the tracing collector (stop-the-world)
    FinalMark = 5,
    /// Evacuation of from-space
    Copy = 6,
    /// Stale pointer fix-up
    Fix = 7,
    /// Cycle wrap-up
    PostMark = 8,
}

impl GcPhase {
    /// Decode a raw phase value; unknown values are a broken invariant
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => GcPhase::Idle,
            1 => GcPhase::Enum,
            2 => GcPhase::Mark,
            3 => GcPhase::Precopy,
            4 => GcPhase::RemarkSatb,
            5 => GcPhase::FinalMark,
            6 => GcPhase::Copy,
            7 => GcPhase::Fix,
            8 => GcPhase::PostMark,
            _ => crate::gc_fatal!("unknown gc phase {raw}"),
        }
    }

    /// Whether the concurrent barrier must log writes in this phase
    pub fn is_satb_logging(self) -> bool {
        self >= GcPhase::Enum && self < GcPhase::Fix
    }

    /// Whether reads may observe from-space references in this phase
    pub fn is_forwarding(self) -> bool {
        matches!(self, GcPhase::Copy | GcPhase::Fix)
    }
}

impl fmt::Display for GcPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcPhase::Idle => "IDLE",
            GcPhase::Enum => "ENUM",
            GcPhase::Mark => "MARK",
            GcPhase::Precopy => "PRECOPY",
            GcPhase::RemarkSatb => "REMARK_SATB",
            GcPhase::FinalMark => "FINAL_MARK",
            GcPhase::Copy => "COPY",
            GcPhase::Fix => "FIX",
            GcPhase::PostMark => "POST_MARK",
        };
        f.write_str(name)
    }
}

/// Atomically published phase
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    /// Cell holding `phase`
    pub const fn new(phase: GcPhase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    /// Acquire load
    pub fn load(&self) -> GcPhase {
        GcPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Release store
    pub fn store(&self, phase: GcPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    /// Sequentially consistent store, used where a Dekker-style check follows
    pub fn store_seq_cst(&self, phase: GcPhase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new(GcPhase::Idle)
    }
}
