//! Runtime parameters consumed once when the heap is created

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// Collector strategy selected at heap creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorKind {
    /// Split-stack parallel marking with an SATB remark pause
    #[default]
    Marking,
    /// Queue/task-pool tracing with a final-mark pause
    Trace,
}

/// Heap sizing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapParam {
    /// Region size in bytes (power of two)
    pub region_size: usize,
    /// Maximum heap size in bytes
    pub heap_size: usize,
    /// Fraction of the target footprint expected to be live after a cycle
    pub heap_utilization: f64,
    /// Bytes per millisecond a mutator may allocate while a cycle runs
    pub allocation_rate: usize,
    /// Microseconds a throttled allocation waits
    pub allocation_wait_time: u64,
}

impl Default for HeapParam {
    fn default() -> Self {
        Self {
            region_size: 256 * KB,
            heap_size: 512 * MB,
            heap_utilization: 0.8,
            allocation_rate: 10 * MB,
            allocation_wait_time: 1000,
        }
    }
}

/// Collector behaviour parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcParam {
    /// Master switch; when false every request is ignored
    pub enable_gc: bool,
    /// Collector strategy
    pub collector: CollectorKind,
    /// Upper bound on GC worker threads
    pub gc_threads: usize,
    /// Available CPUs are divided by this before capping with `gc_threads`
    pub gc_thread_divisor: usize,
    /// Upper bound for the heuristic heap threshold
    pub gc_threshold: usize,
    /// Lower bound for the heuristic heap threshold
    pub min_heap_threshold: usize,
    /// Minimum interval between heuristic/young requests (ms)
    pub gc_interval: u64,
    /// Minimum footprint growth after a full GC
    pub min_grow_bytes: usize,
    /// Maximum footprint growth after a full GC
    pub max_grow_bytes: usize,
    /// Growth multiplier
    pub multiplier: f64,
    /// Young collection rate must reach `mean_full_rate / adjustment` to keep requesting young GCs
    pub ygc_rate_adjustment: f64,
    /// Lower clamp of the headroom kept below the target footprint
    pub min_concurrent_remaining_bytes: usize,
    /// Upper clamp of the headroom kept below the target footprint
    pub max_concurrent_remaining_bytes: usize,
    /// Remark drain iterations before forcing a full STW trace
    pub max_remark_iterations: usize,
    /// Remark wall-clock budget (ms) before forcing a full STW trace
    pub remark_time_limit: u64,
    /// Warn when a stop-the-world wait exceeds this many ms
    pub stw_wait_warn: u64,
    /// A single native allocation above this size is checked immediately
    pub native_immediate_threshold: usize,
    /// Native size above which a synchronous collection is requested
    pub urgency_native_limit: usize,
    /// Native allocations are checked every this many notifications
    pub native_notify_interval: usize,
    /// Initial native heap threshold
    pub native_init_threshold: usize,
    /// Native threshold growth step once native size is large
    pub max_native_step: usize,
    /// Upper bound for the native heap threshold
    pub max_global_native_limit: usize,
    /// During partial startup, GC is restrained below `heap_size * ratio`
    pub cold_startup_phase1_ratio: f64,
    /// Duration of the cold startup phase (ms)
    pub startup_duration: u64,
    /// Time after launch when startup is fully finished (ms)
    pub finish_startup_timepoint: u64,
    /// Growth since the last GC that justifies a collection when backgrounded
    pub background_limit: usize,
    /// Minimum allocated size for a background collection
    pub min_background_gc_size: usize,
    /// Hint threshold for `MemoryReduceDegree::Low`
    pub hint_low_threshold: usize,
    /// Hint threshold for `MemoryReduceDegree::High`
    pub hint_high_threshold: usize,
}

impl Default for GcParam {
    fn default() -> Self {
        Self {
            enable_gc: true,
            collector: CollectorKind::Marking,
            gc_threads: 8,
            gc_thread_divisor: 2,
            gc_threshold: 512 * MB,
            min_heap_threshold: 20 * MB,
            gc_interval: 150,
            min_grow_bytes: 8 * MB,
            max_grow_bytes: 32 * MB,
            multiplier: 1.0,
            ygc_rate_adjustment: 0.5,
            min_concurrent_remaining_bytes: 128 * KB,
            max_concurrent_remaining_bytes: 512 * KB,
            max_remark_iterations: 16,
            remark_time_limit: 50,
            stw_wait_warn: 1000,
            native_immediate_threshold: 300 * KB,
            urgency_native_limit: 2 * GB,
            native_notify_interval: 32,
            native_init_threshold: 64 * MB,
            max_native_step: 64 * MB,
            max_global_native_limit: 3 * GB,
            cold_startup_phase1_ratio: 0.25,
            startup_duration: 2000,
            finish_startup_timepoint: 8000,
            background_limit: 2 * MB,
            min_background_gc_size: 4 * MB,
            hint_low_threshold: 10 * MB,
            hint_high_threshold: 5 * MB,
        }
    }
}

impl GcParam {
    /// Minimum interval between heuristic requests
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval)
    }

    /// Remark wall-clock budget
    pub fn remark_time_limit(&self) -> Duration {
        Duration::from_millis(self.remark_time_limit)
    }
}

/// All runtime parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeParam {
    /// Heap sizing
    pub heap: HeapParam,
    /// Collector behaviour
    pub gc: GcParam,
}

impl RuntimeParam {
    /// Parse parameters from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> GcResult<Self> {
        let param: RuntimeParam = serde_json::from_str(json)?;
        param.validate()?;
        Ok(param)
    }

    /// Apply `COMMON_GC_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> GcResult<()> {
        if let Some(v) = env_usize("COMMON_GC_HEAP_SIZE")? {
            self.heap.heap_size = v;
        }
        if let Some(v) = env_usize("COMMON_GC_REGION_SIZE")? {
            self.heap.region_size = v;
        }
        if let Some(v) = env_usize("COMMON_GC_THREADS")? {
            self.gc.gc_threads = v;
        }
        if let Ok(v) = std::env::var("COMMON_GC_COLLECTOR") {
            self.gc.collector = match v.as_str() {
                "marking" => CollectorKind::Marking,
                "trace" => CollectorKind::Trace,
                other => {
                    return Err(GcError::invalid_param(
                        "collector",
                        format!("unknown collector `{other}`"),
                    ));
                }
            };
        }
        if let Ok(v) = std::env::var("COMMON_GC_ENABLE") {
            self.gc.enable_gc = !matches!(v.as_str(), "0" | "false" | "off");
        }
        self.validate()
    }

    /// Check parameter ranges
    pub fn validate(&self) -> GcResult<()> {
        let heap = &self.heap;
        if !heap.region_size.is_power_of_two() || heap.region_size < 4 * KB {
            return Err(GcError::invalid_param(
                "region_size",
                format!("{} is not a power of two of at least 4096", heap.region_size),
            ));
        }
        if heap.heap_size < heap.region_size {
            return Err(GcError::invalid_param(
                "heap_size",
                "must hold at least one region",
            ));
        }
        if !(heap.heap_utilization > 0.0 && heap.heap_utilization <= 1.0) {
            return Err(GcError::invalid_param(
                "heap_utilization",
                "must be in (0, 1]",
            ));
        }
        let gc = &self.gc;
        if gc.gc_threads == 0 || gc.gc_thread_divisor == 0 {
            return Err(GcError::invalid_param(
                "gc_threads",
                "thread count and divisor must be at least 1",
            ));
        }
        if gc.min_grow_bytes > gc.max_grow_bytes {
            return Err(GcError::invalid_param(
                "min_grow_bytes",
                "must not exceed max_grow_bytes",
            ));
        }
        if gc.min_concurrent_remaining_bytes > gc.max_concurrent_remaining_bytes {
            return Err(GcError::invalid_param(
                "min_concurrent_remaining_bytes",
                "must not exceed max_concurrent_remaining_bytes",
            ));
        }
        if !(0.0..=1.0).contains(&gc.cold_startup_phase1_ratio) {
            return Err(GcError::invalid_param(
                "cold_startup_phase1_ratio",
                "must be in [0, 1]",
            ));
        }
        if gc.native_notify_interval == 0 {
            return Err(GcError::invalid_param(
                "native_notify_interval",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Number of threads taking part in a stop-the-world marking pass
    pub fn gc_worker_count(&self) -> usize {
        let hardware = num_cpus::get() / self.gc.gc_thread_divisor;
        hardware.min(self.gc.gc_threads).max(1)
    }
}

fn env_usize(name: &'static str) -> GcResult<Option<usize>> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| GcError::invalid_param(name, e.to_string())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let param = RuntimeParam::default();
        assert!(param.validate().is_ok());
        assert!(param.gc_worker_count() >= 1);
        assert!(param.gc_worker_count() <= param.gc.gc_threads);
    }

    #[test]
    fn test_from_json_partial() {
        let param = RuntimeParam::from_json(
            r#"{ "heap": { "region_size": 8192 }, "gc": { "collector": "trace", "gc_threads": 2 } }"#,
        )
        .unwrap();
        assert_eq!(param.heap.region_size, 8192);
        assert_eq!(param.heap.heap_size, HeapParam::default().heap_size);
        assert_eq!(param.gc.collector, CollectorKind::Trace);
        assert_eq!(param.gc.gc_threads, 2);
    }

    #[test]
    fn test_validate_rejects_bad_region() {
        let err = RuntimeParam::from_json(r#"{ "heap": { "region_size": 5000 } }"#).unwrap_err();
        assert!(matches!(err, GcError::InvalidParam { name: "region_size", .. }));
    }

    #[test]
    fn test_validate_rejects_bad_utilization() {
        let mut param = RuntimeParam::default();
        param.heap.heap_utilization = 0.0;
        assert!(param.validate().is_err());
    }
}
