//! Registry of live mutators
//!
//! Owns attach/detach, stop-the-world and the non-STW phase handshake.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::context::GcContext;
use crate::mutator::{Mutator, SUSPENSION_FOR_STW, TransitionState};
use crate::phase::GcPhase;

fn wait_step(backoff: &Backoff) {
    if backoff.is_completed() {
        std::thread::sleep(Duration::from_micros(50));
    } else {
        backoff.snooze();
    }
}

/// Set of mutators attached to a heap
#[derive(Debug)]
pub struct MutatorManager {
    context: Arc<GcContext>,
    mutators: Mutex<Vec<Arc<Mutator>>>,
    expired: Mutex<Vec<Arc<Mutator>>>,
    next_id: AtomicUsize,
    world_stopped: AtomicBool,
}

impl MutatorManager {
    /// Create an empty manager
    pub fn new(context: Arc<GcContext>) -> Self {
        Self {
            context,
            mutators: Mutex::new(Vec::new()),
            expired: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            world_stopped: AtomicBool::new(false),
        }
    }

    /// Attach a new mutator; blocks while the world is stopped
    pub fn register(&self) -> Arc<Mutator> {
        loop {
            {
                let mut mutators = self.mutators.lock();
                if !self.world_stopped.load(Ordering::SeqCst) {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let mutator = Arc::new(Mutator::new(id, self.context.clone()));
                    mutators.push(mutator.clone());
                    trace!(target: "common_gc::mutator", id, "mutator attached");
                    return mutator;
                }
            }
            self.context
                .stw()
                .wait_while(|| self.world_stopped.load(Ordering::SeqCst));
        }
    }

    /// Detach a mutator.
    ///
    /// The mutator stays in a safe region for good and is destroyed by the
    /// next cycle's post-GC step.
    pub fn unregister(&self, mutator: &Arc<Mutator>) {
        mutator.enter_safe_region_forever();
        mutator.retire_satb_node();
        mutator.set_expired();

        let mut mutators = self.mutators.lock();
        if let Some(pos) = mutators.iter().position(|m| Arc::ptr_eq(m, mutator)) {
            let removed = mutators.swap_remove(pos);
            drop(mutators);
            self.expired.lock().push(removed);
            trace!(target: "common_gc::mutator", id = mutator.id(), "mutator detached");
        }
    }

    /// Live mutators
    pub fn mutator_count(&self) -> usize {
        self.mutators.lock().len()
    }

    /// Detached mutators awaiting destruction
    pub fn expired_count(&self) -> usize {
        self.expired.lock().len()
    }

    /// Snapshot of the live mutators
    pub fn mutators(&self) -> Vec<Arc<Mutator>> {
        self.mutators.lock().clone()
    }

    /// Visit every live mutator
    pub fn for_each_mutator(&self, mut visitor: impl FnMut(&Mutator)) {
        for mutator in self.mutators() {
            visitor(&mutator);
        }
    }

    /// Whether the world is stopped
    pub fn is_world_stopped(&self) -> bool {
        self.world_stopped.load(Ordering::SeqCst)
    }

    /// Park every mutator in a safe region and return the time it took
    pub fn stop_the_world(&self) -> Duration {
        let start = Instant::now();
        let snapshot = {
            let mutators = self.mutators.lock();
            self.world_stopped.store(true, Ordering::SeqCst);
            mutators.clone()
        };
        for mutator in &snapshot {
            mutator.set_flag(SUSPENSION_FOR_STW);
        }

        let warn_after = Duration::from_millis(self.context.param().gc.stw_wait_warn);
        let mut warned = false;
        for mutator in &snapshot {
            let backoff = Backoff::new();
            while !mutator.in_safe_region() {
                wait_step(&backoff);
                if !warned && start.elapsed() > warn_after {
                    warned = true;
                    warn!(
                        target: "common_gc::mutator",
                        id = mutator.id(),
                        waited_ms = start.elapsed().as_millis() as u64,
                        "mutator slow to reach safepoint"
                    );
                }
            }
        }
        let elapsed = start.elapsed();
        debug!(
            target: "common_gc::mutator",
            mutators = snapshot.len(),
            wait_us = elapsed.as_micros() as u64,
            "world stopped"
        );
        elapsed
    }

    /// Release every parked mutator
    pub fn start_the_world(&self) {
        let snapshot = self.mutators();
        self.context.stw().release(|| {
            self.world_stopped.store(false, Ordering::SeqCst);
            for mutator in &snapshot {
                mutator.clear_flag(SUSPENSION_FOR_STW);
            }
        });
        trace!(target: "common_gc::mutator", "world started");
    }

    /// Move the heap to `phase` and wait until every mutator converged.
    ///
    /// Running mutators transition themselves at their next safepoint;
    /// mutators in a safe region are transitioned by the calling thread.
    pub fn transition_all_mutators(&self, phase: GcPhase) {
        self.context.phase().store_seq_cst(phase);
        let snapshot = self.mutators();
        for mutator in &snapshot {
            mutator.request_transition();
        }

        for mutator in &snapshot {
            let backoff = Backoff::new();
            loop {
                if mutator.transition_state() == TransitionState::FinishTransition {
                    mutator.transition_gc_phase(false);
                    break;
                }
                if mutator.in_safe_region() {
                    let _observer = mutator.observe();
                    if mutator.in_safe_region() && mutator.transition_gc_phase(false) {
                        break;
                    }
                }
                wait_step(&backoff);
            }
        }

        for mutator in &snapshot {
            mutator.reset_transition();
        }
        trace!(target: "common_gc::mutator", %phase, mutators = snapshot.len(), "phase handshake done");
    }

    /// Drop detached mutators; returns how many were destroyed
    pub fn destroy_expired_mutators(&self) -> usize {
        let expired = std::mem::take(&mut *self.expired.lock());
        let count = expired.len();
        if count > 0 {
            debug!(target: "common_gc::mutator", count, "expired mutators destroyed");
        }
        count
    }
}
