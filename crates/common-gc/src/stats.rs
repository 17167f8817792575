//! GC statistics and request descriptors

use std::fmt;
use std::time::{Duration, Instant};

use crate::param::{GcParam, HeapParam};

/// Why a collection was requested
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcReason {
    /// Explicit runtime API call
    User = 0,
    /// Allocation failure retry
    Oom = 1,
    /// Heap threshold reached
    Heu = 2,
    /// Heap threshold reached while young collections are productive
    Young = 3,
    /// Native memory above its threshold
    Native = 4,
    /// Native memory above the urgency limit
    NativeSync = 5,
    /// Application moved to the background
    Background = 6,
    /// Memory-reduction hint from the embedder
    Hint = 7,
    /// Forced collection that ignores the enable switch and intervals
    Force = 8,
}

impl GcReason {
    /// Number of reasons, for per-reason tables
    pub const COUNT: usize = 9;

    /// Whether requests for this reason are coalesced by the minimum interval
    pub fn is_rate_limited(self) -> bool {
        matches!(self, GcReason::Heu | GcReason::Young | GcReason::Native | GcReason::Hint)
    }

    /// Stable lowercase name
    pub fn name(self) -> &'static str {
        match self {
            GcReason::User => "user",
            GcReason::Oom => "oom",
            GcReason::Heu => "heuristic",
            GcReason::Young => "young",
            GcReason::Native => "native",
            GcReason::NativeSync => "native_sync",
            GcReason::Background => "background",
            GcReason::Hint => "hint",
            GcReason::Force => "force",
        }
    }
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Generation scope of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcType {
    /// Evacuate young regions, old space is treated as roots via the remembered set
    Young,
    /// Whole-heap collection
    Full,
}

/// Per-cycle and cross-cycle collector statistics.
///
/// Per-cycle fields are reset in `PreGarbageCollection`; the derived
/// fields at the bottom carry over and seed the next heuristic decision.
#[derive(Debug, Clone)]
pub struct GcStats {
    /// Completed cycles
    pub gc_count: u64,
    /// Reason of the current or last cycle
    pub reason: GcReason,
    /// Scope of the current or last cycle
    pub gc_type: GcType,
    /// Whether the current or last request was asynchronous
    pub is_async: bool,
    /// When the current or last cycle started
    pub gc_start_time: Option<Instant>,
    /// When the last cycle finished
    pub gc_end_time: Option<Instant>,
    /// Summed stop-the-world time of the cycle
    pub total_pause: Duration,
    /// Wall time of the cycle
    pub total_duration: Duration,
    /// Allocated bytes when the cycle started
    pub heap_bytes_before_gc: usize,
    /// Allocated bytes after reclamation
    pub heap_bytes_after_gc: usize,
    /// Bytes reclaimed
    pub collected_bytes: usize,
    /// Objects reclaimed
    pub collected_objects: usize,
    /// Objects surviving the cycle
    pub survived_objects: usize,
    /// Objects marked by the trace
    pub marked_objects: usize,
    /// Bytes held by from-space regions
    pub from_space_bytes: usize,
    /// Bytes evacuated out of from-space
    pub copied_bytes: usize,
    /// Bytes allocated by mutators while the cycle ran
    pub allocated_during_gc: usize,
    /// Remark drain iterations
    pub remark_iterations: usize,
    /// Whether remark blew its budget and forced a full STW trace
    pub forced_stw_trace: bool,
    /// Weak slots cleared
    pub cleared_weak_refs: usize,
    /// Objects resurrected for finalization
    pub resurrected_objects: usize,

    /// Collected bytes per millisecond of the last cycle
    pub collection_rate: f64,
    /// Rolling mean of full-GC collection rates
    pub full_gc_mean_rate: f64,
    /// Full cycles contributing to the mean
    pub full_gc_count: u64,
    /// Footprint the heap is allowed to grow to
    pub target_footprint: usize,
    /// Allocated bytes at which the heuristic requests the next cycle
    pub heap_threshold: usize,
    /// Whether the next heuristic request should be a young GC
    pub should_request_young: bool,
}

impl GcStats {
    /// Initial statistics for a heap
    pub fn new(gc: &GcParam) -> Self {
        let threshold = gc.gc_threshold.min(gc.min_heap_threshold.max(1));
        Self {
            gc_count: 0,
            reason: GcReason::User,
            gc_type: GcType::Full,
            is_async: false,
            gc_start_time: None,
            gc_end_time: None,
            total_pause: Duration::ZERO,
            total_duration: Duration::ZERO,
            heap_bytes_before_gc: 0,
            heap_bytes_after_gc: 0,
            collected_bytes: 0,
            collected_objects: 0,
            survived_objects: 0,
            marked_objects: 0,
            from_space_bytes: 0,
            copied_bytes: 0,
            allocated_during_gc: 0,
            remark_iterations: 0,
            forced_stw_trace: false,
            cleared_weak_refs: 0,
            resurrected_objects: 0,
            collection_rate: 0.0,
            full_gc_mean_rate: 0.0,
            full_gc_count: 0,
            target_footprint: threshold,
            heap_threshold: threshold,
            should_request_young: false,
        }
    }

    /// Reset the per-cycle fields
    pub fn reset_for_cycle(
        &mut self,
        reason: GcReason,
        gc_type: GcType,
        is_async: bool,
        allocated: usize,
    ) {
        self.reason = reason;
        self.gc_type = gc_type;
        self.is_async = is_async;
        self.gc_start_time = Some(Instant::now());
        self.total_pause = Duration::ZERO;
        self.total_duration = Duration::ZERO;
        self.heap_bytes_before_gc = allocated;
        self.heap_bytes_after_gc = 0;
        self.collected_bytes = 0;
        self.collected_objects = 0;
        self.survived_objects = 0;
        self.marked_objects = 0;
        self.from_space_bytes = 0;
        self.copied_bytes = 0;
        self.allocated_during_gc = 0;
        self.remark_iterations = 0;
        self.forced_stw_trace = false;
        self.cleared_weak_refs = 0;
        self.resurrected_objects = 0;
    }

    /// Finalize the cycle and derive the next heap threshold.
    ///
    /// `allocated` is the allocated byte count after reclamation.
    pub fn update(&mut self, heap: &HeapParam, gc: &GcParam, allocated: usize) {
        let now = Instant::now();
        self.gc_count += 1;
        self.gc_end_time = Some(now);
        if let Some(start) = self.gc_start_time {
            self.total_duration = now.duration_since(start);
        }
        self.heap_bytes_after_gc = allocated;

        let millis = (self.total_duration.as_secs_f64() * 1000.0).max(0.001);
        self.collection_rate = self.collected_bytes as f64 / millis;

        match self.gc_type {
            GcType::Full => {
                self.should_request_young = true;
                self.full_gc_count += 1;
                let n = self.full_gc_count as f64;
                self.full_gc_mean_rate =
                    (self.full_gc_mean_rate * (n - 1.0) + self.collection_rate) / n;

                let grow = (allocated as f64 * (1.0 / heap.heap_utilization - 1.0)) as usize;
                let grow = grow.clamp(gc.min_grow_bytes, gc.max_grow_bytes);
                self.target_footprint = allocated + (grow as f64 * gc.multiplier) as usize;
            }
            GcType::Young => {
                self.should_request_young = self.collection_rate * gc.ygc_rate_adjustment
                    >= self.full_gc_mean_rate
                    && allocated <= self.target_footprint;
            }
        }

        let remaining = self.allocated_during_gc.clamp(
            gc.min_concurrent_remaining_bytes,
            gc.max_concurrent_remaining_bytes,
        );
        let threshold = self
            .target_footprint
            .saturating_sub(remaining)
            .max(allocated)
            .max(gc.min_heap_threshold);
        self.heap_threshold = threshold.min(gc.gc_threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    #[test]
    fn test_full_gc_sets_target_footprint() {
        let heap = HeapParam {
            heap_utilization: 0.5,
            ..HeapParam::default()
        };
        let gc = GcParam::default();
        let mut stats = GcStats::new(&gc);
        stats.reset_for_cycle(GcReason::User, GcType::Full, false, 100 * MB);
        stats.collected_bytes = 80 * MB;
        stats.update(&heap, &gc, 20 * MB);

        assert_eq!(stats.gc_count, 1);
        assert!(stats.should_request_young);
        // 20MB * (1/0.5 - 1) = 20MB growth, inside [8MB, 32MB]
        assert_eq!(stats.target_footprint, 40 * MB);
        assert_eq!(stats.heap_threshold, 40 * MB - 128 * 1024);
        assert_eq!(stats.full_gc_count, 1);
    }

    #[test]
    fn test_threshold_floor_and_cap() {
        let heap = HeapParam::default();
        let mut gc = GcParam::default();
        let mut stats = GcStats::new(&gc);
        stats.reset_for_cycle(GcReason::User, GcType::Full, false, MB);
        stats.update(&heap, &gc, MB);
        assert_eq!(stats.heap_threshold, gc.min_heap_threshold);

        gc.gc_threshold = 4 * MB;
        stats.reset_for_cycle(GcReason::User, GcType::Full, false, MB);
        stats.update(&heap, &gc, MB);
        assert_eq!(stats.heap_threshold, 4 * MB);
    }

    #[test]
    fn test_unproductive_young_gc_turns_off_young_requests() {
        let heap = HeapParam::default();
        let gc = GcParam::default();
        let mut stats = GcStats::new(&gc);
        stats.full_gc_mean_rate = f64::MAX;
        stats.reset_for_cycle(GcReason::Young, GcType::Young, true, 30 * MB);
        stats.collected_bytes = 1;
        stats.update(&heap, &gc, 30 * MB);
        assert!(!stats.should_request_young);
    }

    #[test]
    fn test_reason_rate_limits() {
        assert!(GcReason::Heu.is_rate_limited());
        assert!(GcReason::Native.is_rate_limited());
        assert!(!GcReason::Oom.is_rate_limited());
        assert!(!GcReason::NativeSync.is_rate_limited());
        assert_eq!(GcReason::NativeSync.to_string(), "native_sync");
    }
}
