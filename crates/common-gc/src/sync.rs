//! Parking primitives and the GC task pool

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};
use crossbeam_utils::sync::WaitGroup;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::error::{GcError, GcResult};

/// Wait/wake primitive for stop-the-world parking.
///
/// Waiters re-check their predicate under the lock and wakers change the
/// state under the same lock, so no wakeup is lost.
#[derive(Debug, Default)]
pub struct StwSignal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl StwSignal {
    /// Create a new signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while `blocked` returns true
    pub fn wait_while(&self, mut blocked: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while blocked() {
            self.cond.wait(&mut guard);
        }
    }

    /// Apply `change` under the lock and wake every waiter
    pub fn release(&self, change: impl FnOnce()) {
        let _guard = self.lock.lock();
        change();
        self.cond.notify_all();
    }
}

/// Scheduling mode of the task pool
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityMode {
    /// Application in the foreground: use the full pool
    Foreground = 0,
    /// Application in the background: use half the pool
    Background = 1,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of GC worker threads fed by a channel
pub struct TaskPool {
    sender: Mutex<Option<Sender<Task>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    priority: AtomicU8,
}

impl TaskPool {
    /// Spawn `size` worker threads
    pub fn new(size: usize) -> GcResult<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("gc-worker-{index}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .map_err(|source| GcError::ThreadSpawn {
                    what: "gc worker",
                    source,
                })?;
            threads.push(handle);
        }
        debug!(target: "common_gc::gc", threads = size, "GC task pool started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
            size,
            priority: AtomicU8::new(PriorityMode::Foreground as u8),
        })
    }

    /// Number of pool threads
    pub fn total_thread_num(&self) -> usize {
        self.size
    }

    /// Current scheduling mode
    pub fn priority(&self) -> PriorityMode {
        match self.priority.load(Ordering::Acquire) {
            0 => PriorityMode::Foreground,
            _ => PriorityMode::Background,
        }
    }

    /// Switch scheduling mode
    pub fn set_priority(&self, mode: PriorityMode) {
        let old = self.priority.swap(mode as u8, Ordering::AcqRel);
        if old != mode as u8 {
            info!(target: "common_gc::gc", ?mode, "GC task pool priority changed");
        }
    }

    /// Workers (including the calling thread) a parallel phase may use
    pub fn parallelism(&self, requested: usize) -> usize {
        let available = match self.priority() {
            PriorityMode::Foreground => self.size + 1,
            PriorityMode::Background => self.size / 2 + 1,
        };
        requested.clamp(1, available)
    }

    /// Queue a task; returns false once the pool is shut down
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Run `task(i)` for `i in 0..workers`, index 0 on the calling thread,
    /// and return once all of them finished.
    ///
    /// `workers` is capped at the pool size plus the caller. Once the pool
    /// is shut down the remaining indices run on the calling thread after
    /// index 0, so tasks must not wait for each other.
    pub fn run_parallel(&self, workers: usize, task: Arc<dyn Fn(usize) + Send + Sync>) -> usize {
        let workers = workers.clamp(1, self.size + 1);
        let wait_group = WaitGroup::new();
        let mut inline = Vec::new();
        for index in 1..workers {
            let task = task.clone();
            let wg = wait_group.clone();
            let posted = self.post_task(move || {
                task(index);
                drop(wg);
            });
            if !posted {
                inline.push(index);
            }
        }
        task(0);
        // Only reachable after shutdown: run the rest here
        for index in inline {
            task(index);
        }
        wait_group.wait();
        workers
    }

    /// Stop accepting tasks and join the workers
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
