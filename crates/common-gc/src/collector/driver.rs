//! GC request intake and the GC thread
//!
//! `RequestGC` lands here. Requests travel over a channel to a dedicated
//! thread that runs cycles one at a time. Async requests return at once and
//! are coalesced while one is pending; sync requests block until their
//! cycle has finished. Heuristic-class reasons are additionally rate limited
//! per reason.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::Collector;
use crate::context::GcContext;
use crate::error::{GcError, GcResult};
use crate::stats::{GcReason, GcType};

/// Something that accepts GC requests
pub trait GcTrigger: Send + Sync {
    /// Request a collection; see [`GcDriver::request`]
    fn request_gc(&self, reason: GcReason, is_async: bool, gc_type: GcType);
}

enum DriverMsg {
    Collect {
        reason: GcReason,
        gc_type: GcType,
        is_async: bool,
        done: Option<Sender<()>>,
    },
    Shutdown,
}

/// Owner of the GC thread
pub struct GcDriver {
    context: Arc<GcContext>,
    sender: Sender<DriverMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_request: Mutex<[Option<Instant>; GcReason::COUNT]>,
    async_pending: Arc<AtomicBool>,
    shut_down: AtomicBool,
    coalesced: AtomicU64,
}

impl GcDriver {
    /// Spawn the GC thread for `collector`
    pub fn start(collector: Arc<dyn Collector>) -> GcResult<Self> {
        let context = collector.core().context().clone();
        let (sender, receiver) = unbounded::<DriverMsg>();
        let async_pending = Arc::new(AtomicBool::new(false));

        let pending = async_pending.clone();
        let handle = std::thread::Builder::new()
            .name("gc-driver".to_string())
            .spawn(move || {
                while let Ok(msg) = receiver.recv() {
                    match msg {
                        DriverMsg::Collect {
                            reason,
                            gc_type,
                            is_async,
                            done,
                        } => {
                            if is_async {
                                pending.store(false, Ordering::Release);
                            }
                            collector.run_garbage_collection(reason, gc_type, is_async);
                            if let Some(done) = done {
                                let _ = done.send(());
                            }
                        }
                        DriverMsg::Shutdown => break,
                    }
                }
                debug!(target: "common_gc::gc", "GC driver stopped");
            })
            .map_err(|source| GcError::ThreadSpawn {
                what: "gc driver",
                source,
            })?;

        Ok(Self {
            context,
            sender,
            handle: Mutex::new(Some(handle)),
            last_request: Mutex::new([None; GcReason::COUNT]),
            async_pending,
            shut_down: AtomicBool::new(false),
            coalesced: AtomicU64::new(0),
        })
    }

    /// Request a collection.
    ///
    /// Returns whether a cycle was scheduled (async) or ran (sync). A sync
    /// request from a mutator thread must be made inside a safe region.
    pub fn request(&self, reason: GcReason, is_async: bool, gc_type: GcType) -> GcResult<bool> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(GcError::ShutDown);
        }
        if !self.context.param().gc.enable_gc && reason != GcReason::Force {
            trace!(target: "common_gc::gc", %reason, "GC disabled, request ignored");
            return Ok(false);
        }
        if reason.is_rate_limited() && !self.pass_interval(reason) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            trace!(target: "common_gc::gc", %reason, "request inside minimum interval, coalesced");
            return Ok(false);
        }

        if is_async {
            if self.async_pending.swap(true, Ordering::AcqRel) {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                trace!(target: "common_gc::gc", %reason, "async request coalesced with pending one");
                return Ok(false);
            }
            self.send(DriverMsg::Collect {
                reason,
                gc_type,
                is_async,
                done: None,
            })?;
            return Ok(true);
        }

        let (done, finished) = bounded(1);
        self.send(DriverMsg::Collect {
            reason,
            gc_type,
            is_async,
            done: Some(done),
        })?;
        finished.recv().map_err(|_| GcError::ShutDown)?;
        Ok(true)
    }

    fn pass_interval(&self, reason: GcReason) -> bool {
        let interval = self.context.param().gc.gc_interval();
        let mut last = self.last_request.lock();
        let slot = &mut last[reason as usize];
        let now = Instant::now();
        match *slot {
            Some(at) if now.duration_since(at) < interval => false,
            _ => {
                *slot = Some(now);
                true
            }
        }
    }

    fn send(&self, msg: DriverMsg) -> GcResult<()> {
        self.sender.send(msg).map_err(|_| GcError::ShutDown)
    }

    /// Requests dropped by coalescing
    pub fn coalesced_requests(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Whether the driver stopped accepting requests
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Finish queued cycles and stop the GC thread
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.sender.send(DriverMsg::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl GcTrigger for GcDriver {
    fn request_gc(&self, reason: GcReason, is_async: bool, gc_type: GcType) {
        if let Err(err) = self.request(reason, is_async, gc_type) {
            debug!(target: "common_gc::gc", %reason, %err, "GC request rejected");
        }
    }
}

impl Drop for GcDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
