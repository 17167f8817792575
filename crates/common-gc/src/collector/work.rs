//! Work distribution for parallel marking
//!
//! [`SplitStack`] is the steal-by-split model: workers keep a private stack
//! and publish chunks of it when the shared pool runs dry. [`WorkQueue`] is
//! the queue model: workers pull pre-chunked batches from a blocking queue
//! until it is both empty and marked finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::object::BaseObject;

/// Gray objects waiting to be scanned
pub type MarkStack = Vec<Arc<BaseObject>>;

/// Batch size used when seeding or publishing work
pub const CHUNK_SIZE: usize = 64;
/// Above this depth a worker publishes half its stack to starving peers
pub const SPLIT_HALF_THRESHOLD: usize = 256;
/// Above this depth a worker publishes an eighth of its stack
pub const SPLIT_EIGHTH_THRESHOLD: usize = 32;

/// Split `stack` into `CHUNK_SIZE` batches
pub fn into_chunks(mut stack: MarkStack) -> Vec<MarkStack> {
    let mut chunks = Vec::with_capacity(stack.len().div_ceil(CHUNK_SIZE));
    while stack.len() > CHUNK_SIZE {
        let tail = stack.split_off(stack.len() - CHUNK_SIZE);
        chunks.push(tail);
    }
    if !stack.is_empty() {
        chunks.push(stack);
    }
    chunks
}

/// Shared pool of the steal-by-split model.
///
/// Termination: a worker goes idle only after failing to take a chunk, and
/// only non-idle workers publish. Once every joined worker is idle the pool
/// is empty for good; a worker joining later finds nothing and leaves.
pub struct SplitStack {
    chunks: Mutex<Vec<MarkStack>>,
    available: AtomicUsize,
    idle: AtomicUsize,
    joined: AtomicUsize,
}

impl SplitStack {
    /// Pool seeded with `seeds`
    pub fn new(seeds: MarkStack) -> Self {
        let chunks = into_chunks(seeds);
        Self {
            available: AtomicUsize::new(chunks.len()),
            chunks: Mutex::new(chunks),
            idle: AtomicUsize::new(0),
            joined: AtomicUsize::new(0),
        }
    }

    /// Register the calling worker; call once before taking work
    pub fn join(&self) {
        self.joined.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether peers may be waiting for work
    pub fn is_starving(&self) -> bool {
        self.available.load(Ordering::SeqCst) == 0
    }

    fn publish(&self, chunk: MarkStack) {
        let mut chunks = self.chunks.lock();
        chunks.push(chunk);
        self.available.store(chunks.len(), Ordering::SeqCst);
    }

    fn take(&self) -> Option<MarkStack> {
        let mut chunks = self.chunks.lock();
        let chunk = chunks.pop();
        self.available.store(chunks.len(), Ordering::SeqCst);
        chunk
    }

    /// Rebalance after pushing onto `local`
    pub fn maybe_split(&self, local: &mut MarkStack) {
        if !self.is_starving() {
            return;
        }
        let len = local.len();
        let give = if len > SPLIT_HALF_THRESHOLD {
            len / 2
        } else if len > SPLIT_EIGHTH_THRESHOLD {
            len / 8
        } else {
            return;
        };
        let chunk = local.split_off(len - give);
        self.publish(chunk);
    }

    /// Next chunk for an empty worker, or `None` once marking terminated
    pub fn steal_or_terminate(&self) -> Option<MarkStack> {
        if let Some(chunk) = self.take() {
            return Some(chunk);
        }
        self.idle.fetch_add(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        loop {
            if self.available.load(Ordering::SeqCst) > 0 {
                self.idle.fetch_sub(1, Ordering::SeqCst);
                if let Some(chunk) = self.take() {
                    return Some(chunk);
                }
                self.idle.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            if self.idle.load(Ordering::SeqCst) >= self.joined.load(Ordering::SeqCst) {
                return None;
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(20));
            } else {
                backoff.snooze();
            }
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    batches: Vec<MarkStack>,
    active: usize,
    finished: bool,
}

/// Blocking batch queue of the queue/task-pool model
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl WorkQueue {
    /// Queue seeded with `seeds`
    pub fn new(seeds: MarkStack) -> Self {
        Self {
            state: Mutex::new(QueueState {
                batches: into_chunks(seeds),
                active: 0,
                finished: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Publish a batch
    pub fn push_batch(&self, batch: MarkStack) {
        if batch.is_empty() {
            return;
        }
        self.state.lock().batches.push(batch);
        self.cond.notify_one();
    }

    /// Block until a batch is available or the queue is finished.
    ///
    /// A returned batch must be acknowledged with
    /// [`finish_batch`](Self::finish_batch).
    pub fn pop_batch(&self) -> Option<MarkStack> {
        let mut state = self.state.lock();
        loop {
            if let Some(batch) = state.batches.pop() {
                state.active += 1;
                return Some(batch);
            }
            if state.finished {
                return None;
            }
            if state.active == 0 {
                state.finished = true;
                self.cond.notify_all();
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Acknowledge a batch returned by [`pop_batch`](Self::pop_batch)
    pub fn finish_batch(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        if state.active == 0 && state.batches.is_empty() {
            state.finished = true;
            self.cond.notify_all();
        }
    }

    /// Whether the queue drained
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}
