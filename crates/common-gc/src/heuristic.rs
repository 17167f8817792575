//! Heuristic GC policy
//!
//! Decides when to collect: heap threshold crossings after allocation,
//! native memory pressure, background transitions and memory hints. While
//! the application is starting up, heuristic collections are held back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::collector::{GcObserver, GcTrigger};
use crate::context::GcContext;
use crate::error::{GcError, GcResult};
use crate::param::GcParam;
use crate::stats::{GcReason, GcStats, GcType};
use crate::sync::{PriorityMode, TaskPool};

/// Application startup status
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStatus {
    /// The application has not started yet
    BeforeStartup = 0,
    /// Cold start in progress; heuristic GC is suppressed
    ColdStartup = 1,
    /// Cold start winding down; heuristic GC only under real pressure
    ColdStartupPartiallyFinish = 2,
    /// Startup done
    ColdStartupFinish = 3,
}

impl StartupStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => StartupStatus::ColdStartup,
            2 => StartupStatus::ColdStartupPartiallyFinish,
            3 => StartupStatus::ColdStartupFinish,
            _ => StartupStatus::BeforeStartup,
        }
    }
}

/// How hard a memory hint asks the heap to shrink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryReduceDegree {
    /// Collect only after substantial allocation
    Low,
    /// Collect after moderate allocation
    High,
}

struct StartupTimer {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// Tracks the startup status and advances it on a timeline
pub struct StartupStatusManager {
    status: Arc<AtomicU8>,
    startup_duration: Duration,
    finish_timepoint: Duration,
    timer: Mutex<Option<StartupTimer>>,
}

fn advance(status: &AtomicU8, from: StartupStatus, to: StartupStatus) -> bool {
    let moved = status
        .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    if moved {
        info!(target: "common_gc::heuristic", ?from, ?to, "startup status changed");
    }
    moved
}

impl StartupStatusManager {
    /// Create a manager in `BeforeStartup`
    pub fn new(gc: &GcParam) -> Self {
        Self {
            status: Arc::new(AtomicU8::new(StartupStatus::BeforeStartup as u8)),
            startup_duration: Duration::from_millis(gc.startup_duration),
            finish_timepoint: Duration::from_millis(gc.finish_startup_timepoint),
            timer: Mutex::new(None),
        }
    }

    /// Current status
    pub fn status(&self) -> StartupStatus {
        StartupStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Force a status, cancelling the timeline
    pub fn set_startup_status(&self, status: StartupStatus) {
        self.cancel_timer();
        self.status.store(status as u8, Ordering::Release);
        debug!(target: "common_gc::heuristic", ?status, "startup status set");
    }

    /// Enter cold startup and schedule the timed transitions
    pub fn on_app_startup(&self) -> GcResult<()> {
        self.cancel_timer();
        self.status
            .store(StartupStatus::ColdStartup as u8, Ordering::Release);
        info!(target: "common_gc::heuristic", "cold startup begins");

        let (cancel, cancelled) = bounded::<()>(0);
        let status = self.status.clone();
        let first = self.startup_duration;
        let second = self.finish_timepoint.saturating_sub(self.startup_duration);
        let handle = std::thread::Builder::new()
            .name("gc-startup-timer".to_string())
            .spawn(move || {
                // Dropping the sender disconnects the channel and cancels
                if !matches!(cancelled.recv_timeout(first), Err(RecvTimeoutError::Timeout)) {
                    return;
                }
                advance(
                    &status,
                    StartupStatus::ColdStartup,
                    StartupStatus::ColdStartupPartiallyFinish,
                );
                if !matches!(cancelled.recv_timeout(second), Err(RecvTimeoutError::Timeout)) {
                    return;
                }
                advance(
                    &status,
                    StartupStatus::ColdStartupPartiallyFinish,
                    StartupStatus::ColdStartupFinish,
                );
            })
            .map_err(|source| GcError::ThreadSpawn {
                what: "startup timer",
                source,
            })?;
        *self.timer.lock() = Some(StartupTimer { cancel, handle });
        Ok(())
    }

    /// The application reported its cold start done
    pub fn notify_finish_cold_start(&self) {
        advance(
            &self.status,
            StartupStatus::ColdStartup,
            StartupStatus::ColdStartupPartiallyFinish,
        );
    }

    /// Stop the timeline, if any
    pub fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            drop(timer.cancel);
            let _ = timer.handle.join();
        }
    }
}

impl Drop for StartupStatusManager {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Heuristic trigger policy
pub struct HeuristicGcPolicy {
    context: Arc<GcContext>,
    trigger: Arc<dyn GcTrigger>,
    startup: Arc<StartupStatusManager>,
    pool: Option<Arc<TaskPool>>,
    notified_native_size: AtomicUsize,
    native_heap_threshold: AtomicUsize,
    alive_size_after_gc: AtomicUsize,
    native_notify_count: AtomicUsize,
    heap_threshold: AtomicUsize,
    should_request_young: AtomicBool,
    is_background: AtomicBool,
}

impl HeuristicGcPolicy {
    /// Create a policy issuing requests through `trigger`
    pub fn new(
        context: Arc<GcContext>,
        trigger: Arc<dyn GcTrigger>,
        startup: Arc<StartupStatusManager>,
        pool: Option<Arc<TaskPool>>,
    ) -> Self {
        let gc = &context.param().gc;
        let initial = GcStats::new(gc);
        Self {
            notified_native_size: AtomicUsize::new(0),
            native_heap_threshold: AtomicUsize::new(gc.native_init_threshold),
            alive_size_after_gc: AtomicUsize::new(0),
            native_notify_count: AtomicUsize::new(0),
            heap_threshold: AtomicUsize::new(initial.heap_threshold),
            should_request_young: AtomicBool::new(initial.should_request_young),
            is_background: AtomicBool::new(false),
            context,
            trigger,
            startup,
            pool,
        }
    }

    fn gc_param(&self) -> &GcParam {
        &self.context.param().gc
    }

    /// Startup status manager
    pub fn startup(&self) -> &Arc<StartupStatusManager> {
        &self.startup
    }

    /// Whether startup holds heuristic collections back
    pub fn should_restrain_gc_on_startup(&self) -> bool {
        match self.startup.status() {
            StartupStatus::ColdStartup => true,
            StartupStatus::ColdStartupPartiallyFinish => {
                let heap_size = self.context.param().heap.heap_size as f64;
                let limit = (heap_size * self.gc_param().cold_startup_phase1_ratio) as usize;
                self.context.space().allocated_bytes() < limit
            }
            _ => false,
        }
    }

    /// Request a collection if the heap crossed its threshold.
    ///
    /// Returns whether a request was issued.
    pub fn try_heuristic_gc(&self) -> bool {
        if self.should_restrain_gc_on_startup() || self.context.is_gc_running() {
            return false;
        }
        let allocated = self.context.space().allocated_bytes();
        if allocated < self.heap_threshold.load(Ordering::Acquire) {
            return false;
        }
        if self.should_request_young.load(Ordering::Acquire) {
            self.trigger.request_gc(GcReason::Young, true, GcType::Young);
        } else {
            self.trigger.request_gc(GcReason::Heu, true, GcType::Full);
        }
        true
    }

    /// Account a native allocation.
    ///
    /// Limits are checked for large blocks, every `native_notify_interval`
    /// calls, and whenever this allocation crosses a native limit.
    pub fn notify_native_allocation(&self, bytes: usize) {
        let previous = self.notified_native_size.fetch_add(bytes, Ordering::AcqRel);
        let total = previous.saturating_add(bytes);
        let count = self.native_notify_count.fetch_add(1, Ordering::AcqRel) + 1;
        let gc = self.gc_param();
        let crosses = |limit: usize| previous <= limit && total > limit;
        if bytes > gc.native_immediate_threshold
            || count % gc.native_notify_interval == 0
            || crosses(self.native_heap_threshold.load(Ordering::Acquire))
            || crosses(gc.urgency_native_limit)
        {
            self.check_gc_for_native();
        }
    }

    /// Account a native free
    pub fn notify_native_free(&self, bytes: usize) {
        let previous = self
            .notified_native_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                Some(size.saturating_sub(bytes))
            })
            .unwrap_or(0);
        debug_assert!(previous >= bytes, "native free of {bytes} exceeds tracked {previous}");
    }

    /// A native block was resized from `old_bytes` to `new_bytes`
    pub fn notify_native_reset(&self, old_bytes: usize, new_bytes: usize) {
        self.notify_native_free(old_bytes);
        self.notify_native_allocation(new_bytes);
    }

    /// Compare tracked native memory with its limits and request a
    /// collection when needed
    pub fn check_gc_for_native(&self) {
        let size = self.notified_native_size.load(Ordering::Acquire);
        if size > self.gc_param().urgency_native_limit {
            info!(target: "common_gc::heuristic", native_size = size, "native memory urgent, collecting synchronously");
            self.trigger
                .request_gc(GcReason::NativeSync, false, GcType::Full);
        } else if size > self.native_heap_threshold.load(Ordering::Acquire) {
            debug!(target: "common_gc::heuristic", native_size = size, "native memory above threshold");
            self.trigger.request_gc(GcReason::Native, true, GcType::Full);
        }
    }

    /// Tracked native bytes
    pub fn notified_native_size(&self) -> usize {
        self.notified_native_size.load(Ordering::Acquire)
    }

    /// Native bytes that trigger an async collection
    pub fn native_heap_threshold(&self) -> usize {
        self.native_heap_threshold.load(Ordering::Acquire)
    }

    /// Allocated bytes that trigger a heuristic collection
    pub fn heap_threshold(&self) -> usize {
        self.heap_threshold.load(Ordering::Acquire)
    }

    /// Live bytes after the last cycle
    pub fn alive_size_after_gc(&self) -> usize {
        self.alive_size_after_gc.load(Ordering::Acquire)
    }

    /// Whether the application is in the background
    pub fn is_background(&self) -> bool {
        self.is_background.load(Ordering::Acquire)
    }

    fn update_native_threshold(&self) {
        let gc = self.gc_param();
        let native = self.notified_native_size.load(Ordering::Acquire);
        let threshold = if native < gc.max_native_step {
            (native + gc.min_grow_bytes).max(gc.native_init_threshold)
        } else {
            native + gc.max_native_step
        };
        self.native_heap_threshold
            .store(threshold.min(gc.max_global_native_limit), Ordering::Release);
    }

    /// Application moved to the background (`true`) or foreground
    pub fn change_gc_params(&self, is_background: bool) {
        let was_background = self.is_background.swap(is_background, Ordering::AcqRel);
        if was_background == is_background {
            return;
        }
        let mode = if is_background {
            PriorityMode::Background
        } else {
            PriorityMode::Foreground
        };
        if let Some(pool) = &self.pool {
            pool.set_priority(mode);
        }
        info!(target: "common_gc::heuristic", is_background, "GC params changed");
        if !is_background {
            return;
        }

        let gc = self.gc_param();
        let allocated = self.context.space().allocated_bytes();
        let alive = self.alive_size_after_gc.load(Ordering::Acquire);
        if allocated > alive + gc.background_limit && allocated >= gc.min_background_gc_size {
            self.trigger
                .request_gc(GcReason::Background, true, GcType::Full);
        }
    }

    /// Memory-reduction hint from the embedder.
    ///
    /// Returns whether a collection was requested.
    pub fn check_and_trigger_hint_gc(&self, degree: MemoryReduceDegree) -> bool {
        if self.should_restrain_gc_on_startup() {
            return false;
        }
        let gc = self.gc_param();
        let threshold = match degree {
            MemoryReduceDegree::Low => gc.hint_low_threshold,
            MemoryReduceDegree::High => gc.hint_high_threshold,
        };
        if self.context.space().recent_allocated_size() <= threshold {
            return false;
        }
        self.trigger.request_gc(GcReason::Hint, true, GcType::Full);
        true
    }
}

impl GcObserver for HeuristicGcPolicy {
    fn on_gc_finished(&self, stats: &GcStats) {
        self.alive_size_after_gc
            .store(stats.heap_bytes_after_gc, Ordering::Release);
        self.heap_threshold
            .store(stats.heap_threshold, Ordering::Release);
        self.should_request_young
            .store(stats.should_request_young, Ordering::Release);
        self.update_native_threshold();
    }
}
