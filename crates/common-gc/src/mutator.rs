//! Mutator safepoint protocol
//!
//! A [`Mutator`] is the collector's view of one application thread. The
//! collector never interrupts it; it raises suspension flags and the thread
//! services them at its next safepoint. While the thread sits in a safe
//! region (blocked in native code, waiting for a sync GC, detached) the
//! collector acts on its behalf instead.
//!
//! Phase changes use a small per-mutator state machine
//! (`NO -> NEED -> IN -> FINISH -> NO`). Whoever wins the `NEED -> IN`
//! compare-and-swap, the mutator itself or the GC thread, runs the phase
//! handler; everybody else waits for or observes `FINISH`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::address::{HeapAddress, RefValue};
use crate::context::GcContext;
use crate::phase::GcPhase;
use crate::satb::SatbNode;

/// Park at the next safepoint until the world restarts
pub const SUSPENSION_FOR_STW: u32 = 1 << 0;
/// Converge to the heap's current GC phase
pub const SUSPENSION_FOR_GC_PHASE: u32 = 1 << 1;
/// Record a profiling sample
pub const SUSPENSION_FOR_CPU_PROFILE: u32 = 1 << 2;
/// Park forever; the runtime is exiting
pub const SUSPENSION_FOR_EXIT: u32 = 1 << 3;

/// Progress of a mutator's current phase transition
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    /// Nothing requested
    NoTransition = 0,
    /// Requested, nobody claimed it yet
    NeedTransition = 1,
    /// Handler running
    InTransition = 2,
    /// Handler done, waiting for the GC thread to acknowledge
    FinishTransition = 3,
}

impl TransitionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransitionState::NoTransition,
            1 => TransitionState::NeedTransition,
            2 => TransitionState::InTransition,
            3 => TransitionState::FinishTransition,
            _ => crate::gc_fatal!("unknown transition state {raw}"),
        }
    }
}

#[derive(Debug)]
struct AllocWindow {
    start: Instant,
    bytes: usize,
}

/// Per-thread collector state
pub struct Mutator {
    id: usize,
    context: Arc<GcContext>,
    suspension_flags: AtomicU32,
    in_safe_region: AtomicBool,
    mutator_phase: AtomicU8,
    transition_state: AtomicU8,
    transition_lock: Mutex<()>,
    transition_done: Condvar,
    satb: Mutex<Option<SatbNode>>,
    roots: Mutex<Vec<RefValue>>,
    observers: AtomicUsize,
    expired: AtomicBool,
    handler_runs: AtomicU64,
    profile_samples: AtomicU64,
    alloc_window: Mutex<AllocWindow>,
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("transition", &self.transition_state())
            .field("flags", &self.suspension_flags())
            .field("in_safe_region", &self.in_safe_region())
            .finish_non_exhaustive()
    }
}

impl Mutator {
    /// Create a mutator converged to the heap's current phase
    pub fn new(id: usize, context: Arc<GcContext>) -> Self {
        let phase = context.phase().load();
        Self {
            id,
            context,
            suspension_flags: AtomicU32::new(0),
            in_safe_region: AtomicBool::new(false),
            mutator_phase: AtomicU8::new(phase as u8),
            transition_state: AtomicU8::new(TransitionState::NoTransition as u8),
            transition_lock: Mutex::new(()),
            transition_done: Condvar::new(),
            satb: Mutex::new(None),
            roots: Mutex::new(Vec::new()),
            observers: AtomicUsize::new(0),
            expired: AtomicBool::new(false),
            handler_runs: AtomicU64::new(0),
            profile_samples: AtomicU64::new(0),
            alloc_window: Mutex::new(AllocWindow {
                start: Instant::now(),
                bytes: 0,
            }),
        }
    }

    /// Mutator id, unique per heap
    pub fn id(&self) -> usize {
        self.id
    }

    /// Shared heap state
    pub fn context(&self) -> &Arc<GcContext> {
        &self.context
    }

    /// Phase this mutator has converged to
    pub fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.mutator_phase.load(Ordering::Acquire))
    }

    /// Current transition state
    pub fn transition_state(&self) -> TransitionState {
        TransitionState::from_u8(self.transition_state.load(Ordering::Acquire))
    }

    /// Pending suspension flags
    pub fn suspension_flags(&self) -> u32 {
        self.suspension_flags.load(Ordering::SeqCst)
    }

    /// Whether the thread is in a safe region
    pub fn in_safe_region(&self) -> bool {
        self.in_safe_region.load(Ordering::SeqCst)
    }

    /// Whether the mutator detached and waits for destruction
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub(crate) fn set_expired(&self) {
        self.expired.store(true, Ordering::Release);
    }

    /// How many times a phase handler ran for this mutator
    pub fn transition_handler_runs(&self) -> u64 {
        self.handler_runs.load(Ordering::Acquire)
    }

    /// Profiling samples recorded
    pub fn profile_samples(&self) -> u64 {
        self.profile_samples.load(Ordering::Acquire)
    }

    pub(crate) fn set_flag(&self, flag: u32) {
        self.suspension_flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub(crate) fn clear_flag(&self, flag: u32) {
        self.suspension_flags.fetch_and(!flag, Ordering::SeqCst);
    }

    /// Ask the thread to record a profiling sample at its next safepoint
    pub fn request_cpu_profile(&self) {
        self.set_flag(SUSPENSION_FOR_CPU_PROFILE);
    }

    /// Ask the thread to park forever at its next safepoint
    pub fn request_exit(&self) {
        self.set_flag(SUSPENSION_FOR_EXIT);
    }

    /// Request convergence to the heap's current phase
    pub fn request_transition(&self) {
        self.transition_state
            .store(TransitionState::NeedTransition as u8, Ordering::SeqCst);
        self.set_flag(SUSPENSION_FOR_GC_PHASE);
    }

    /// Acknowledge a finished transition
    pub(crate) fn reset_transition(&self) {
        let _ = self.transition_state.compare_exchange(
            TransitionState::FinishTransition as u8,
            TransitionState::NoTransition as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Converge to the heap's current phase.
    ///
    /// Returns whether the mutator's phase now matches the heap's. A call
    /// from the GC thread (`by_self == false`) never blocks: it returns false
    /// while the mutator itself is mid-transition.
    pub fn transition_gc_phase(&self, by_self: bool) -> bool {
        loop {
            match self.transition_state() {
                TransitionState::FinishTransition => {
                    let heap_phase = self.context.phase().load();
                    let matches = self.phase() == heap_phase;
                    if !matches && !by_self {
                        crate::gc_fatal!(
                            "mutator {} finished transition in {} but heap is in {}",
                            self.id,
                            self.phase(),
                            heap_phase
                        );
                    }
                    return matches;
                }
                TransitionState::InTransition => {
                    if !by_self {
                        return false;
                    }
                    let mut guard = self.transition_lock.lock();
                    while self.transition_state() == TransitionState::InTransition {
                        self.transition_done.wait(&mut guard);
                    }
                }
                TransitionState::NoTransition => {
                    return self.phase() == self.context.phase().load();
                }
                TransitionState::NeedTransition => {
                    let won = self
                        .transition_state
                        .compare_exchange(
                            TransitionState::NeedTransition as u8,
                            TransitionState::InTransition as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok();
                    if won {
                        self.run_transition();
                        return true;
                    }
                }
            }
        }
    }

    fn run_transition(&self) {
        let phase = self.context.phase().load();
        match phase {
            GcPhase::RemarkSatb | GcPhase::FinalMark | GcPhase::PostMark => {
                self.retire_satb_node();
            }
            GcPhase::Fix => self.fix_roots(),
            _ => {}
        }
        self.mutator_phase.store(phase as u8, Ordering::Release);
        self.handler_runs.fetch_add(1, Ordering::AcqRel);
        self.clear_flag(SUSPENSION_FOR_GC_PHASE);

        let _guard = self.transition_lock.lock();
        self.transition_state
            .store(TransitionState::FinishTransition as u8, Ordering::Release);
        self.transition_done.notify_all();
        trace!(target: "common_gc::mutator", id = self.id, %phase, "mutator transitioned");
    }

    /// Service pending suspension requests.
    ///
    /// Enters a safe region, handles STW, phase, profiling and exit requests
    /// in that order, and leaves only once no flag is set and no observer is
    /// attached.
    pub fn handle_suspension_request(&self) {
        let backoff = Backoff::new();
        loop {
            self.in_safe_region.store(true, Ordering::SeqCst);
            let flags = self.suspension_flags();

            if flags & SUSPENSION_FOR_STW != 0 {
                self.context
                    .stw()
                    .wait_while(|| self.suspension_flags() & SUSPENSION_FOR_STW != 0);
            }
            if flags & SUSPENSION_FOR_GC_PHASE != 0 {
                self.transition_gc_phase(true);
            }
            if flags & SUSPENSION_FOR_CPU_PROFILE != 0 {
                self.profile_samples.fetch_add(1, Ordering::AcqRel);
                self.clear_flag(SUSPENSION_FOR_CPU_PROFILE);
            }
            if flags & SUSPENSION_FOR_EXIT != 0 {
                debug!(target: "common_gc::mutator", id = self.id, "mutator parked for exit");
                loop {
                    std::thread::park();
                }
            }

            if self.observers.load(Ordering::SeqCst) > 0 {
                backoff.snooze();
                continue;
            }
            self.in_safe_region.store(false, Ordering::SeqCst);
            if self.suspension_flags() == 0 && self.observers.load(Ordering::SeqCst) == 0 {
                return;
            }
        }
    }

    /// Safepoint poll at managed-code entry
    #[inline]
    pub fn safepoint(&self) {
        if self.suspension_flags.load(Ordering::Acquire) != 0 {
            self.handle_suspension_request();
        }
    }

    /// Enter a safe region; the collector may act for this thread until the
    /// guard is dropped
    pub fn enter_safe_region(&self) -> SafeRegionGuard<'_> {
        let nested = self.in_safe_region.swap(true, Ordering::SeqCst);
        SafeRegionGuard {
            mutator: self,
            nested,
        }
    }

    pub(crate) fn enter_safe_region_forever(&self) {
        self.in_safe_region.store(true, Ordering::SeqCst);
    }

    fn leave_safe_region(&self) {
        self.in_safe_region.store(false, Ordering::SeqCst);
        if self.suspension_flags() != 0 || self.observers.load(Ordering::SeqCst) > 0 {
            self.handle_suspension_request();
        }
    }

    /// Keep the thread inside its safe region while the guard lives
    pub fn observe(&self) -> ObserverGuard<'_> {
        self.observers.fetch_add(1, Ordering::SeqCst);
        ObserverGuard { mutator: self }
    }

    /// Log a reference into this mutator's SATB node
    pub fn log_satb(&self, addr: HeapAddress) {
        let mut slot = self.satb.lock();
        let node = slot.get_or_insert_with(SatbNode::new);
        if node.push(addr)
            && let Some(full) = slot.take()
        {
            self.context.satb().retire(full);
        }
    }

    /// Hand the current SATB node to the collector.
    ///
    /// Returns false when there is nothing to retire, so a second retire of
    /// the same node is a no-op.
    pub fn retire_satb_node(&self) -> bool {
        match self.satb.lock().take() {
            Some(node) => {
                self.context.satb().retire(node);
                true
            }
            None => false,
        }
    }

    /// Whether a SATB node is attached
    pub fn has_satb_node(&self) -> bool {
        self.satb.lock().is_some()
    }

    /// Push a local root, returning its index
    pub fn push_root(&self, value: RefValue) -> usize {
        let mut roots = self.roots.lock();
        roots.push(value);
        roots.len() - 1
    }

    /// Local root at `index`, null when out of range
    pub fn root(&self, index: usize) -> RefValue {
        self.roots.lock().get(index).copied().unwrap_or(RefValue::NULL)
    }

    /// Overwrite the local root at `index`
    pub fn set_root(&self, index: usize, value: RefValue) {
        if let Some(slot) = self.roots.lock().get_mut(index) {
            *slot = value;
        }
    }

    /// Pop the most recent local root
    pub fn pop_root(&self) -> Option<RefValue> {
        self.roots.lock().pop()
    }

    /// Drop local roots above `len`
    pub fn truncate_roots(&self, len: usize) {
        self.roots.lock().truncate(len);
    }

    /// Number of local roots
    pub fn root_count(&self) -> usize {
        self.roots.lock().len()
    }

    /// Visit every local root
    pub fn for_each_root(&self, mut visitor: impl FnMut(RefValue)) {
        for &value in self.roots.lock().iter() {
            visitor(value);
        }
    }

    fn fix_roots(&self) {
        let space = self.context.space();
        for value in self.roots.lock().iter_mut() {
            *value = space.resolve(*value);
        }
    }

    /// Throttle a thread that allocates faster than the heap tolerates while
    /// a cycle is running
    pub(crate) fn throttle_allocation(&self, bytes: usize) {
        let heap = &self.context.param().heap;
        let mut window = self.alloc_window.lock();
        if window.start.elapsed() >= Duration::from_millis(1) {
            window.start = Instant::now();
            window.bytes = 0;
        }
        window.bytes += bytes;
        if window.bytes <= heap.allocation_rate {
            return;
        }
        window.bytes = 0;
        window.start = Instant::now();
        drop(window);

        trace!(target: "common_gc::mutator", id = self.id, "allocation throttled");
        let _safe = self.enter_safe_region();
        std::thread::sleep(Duration::from_micros(heap.allocation_wait_time));
    }
}

/// Safe region scope returned by [`Mutator::enter_safe_region`]
#[must_use = "the safe region ends when the guard is dropped"]
pub struct SafeRegionGuard<'a> {
    mutator: &'a Mutator,
    nested: bool,
}

impl Drop for SafeRegionGuard<'_> {
    fn drop(&mut self) {
        if !self.nested {
            self.mutator.leave_safe_region();
        }
    }
}

/// External observer attached to a mutator
pub struct ObserverGuard<'a> {
    mutator: &'a Mutator,
}

impl Drop for ObserverGuard<'_> {
    fn drop(&mut self) {
        self.mutator.observers.fetch_sub(1, Ordering::SeqCst);
    }
}
