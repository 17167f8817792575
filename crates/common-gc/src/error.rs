//! Error types for the collector
//!
//! Two classes of failure exist. Recoverable ones (bad configuration, thread
//! spawn failures, out-of-memory after the OOM retry) are returned as
//! [`GcError`]. Broken collector invariants are not errors at all: they go
//! through [`gc_fatal!`](crate::gc_fatal), which logs and aborts the process.

use thiserror::Error;

/// Errors reported to the embedding runtime
#[derive(Error, Debug)]
pub enum GcError {
    /// Allocation failed even after a synchronous OOM collection
    #[error("out of memory: cannot allocate {requested} bytes ({allocated} of {limit} bytes in use)")]
    OutOfMemory {
        /// Bytes requested by the failing allocation
        requested: usize,
        /// Bytes held by live objects when the allocation failed
        allocated: usize,
        /// Configured maximum heap size
        limit: usize,
    },

    /// A runtime parameter is outside its valid range
    #[error("invalid runtime parameter `{name}`: {reason}")]
    InvalidParam {
        /// Parameter name
        name: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Runtime parameters could not be parsed
    #[error("failed to parse runtime parameters: {0}")]
    ParamParse(#[from] serde_json::Error),

    /// A collector thread could not be started
    #[error("failed to spawn {what} thread: {source}")]
    ThreadSpawn {
        /// Which thread failed to start
        what: &'static str,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The heap has been shut down and no longer accepts requests
    #[error("heap has been shut down")]
    ShutDown,
}

impl GcError {
    /// Create an invalid parameter error
    pub fn invalid_param(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            name,
            reason: reason.into(),
        }
    }
}

/// Result type alias for collector operations
pub type GcResult<T> = Result<T, GcError>;

/// Log a fatal collector invariant violation and abort the process.
///
/// Used for states the collector can never recover from: an unreachable
/// phase, a mutator that disagrees with the heap phase after a handshake,
/// or an object copy that could not complete.
#[macro_export]
macro_rules! gc_fatal {
    ($($arg:tt)+) => {
        $crate::error::fatal(format_args!($($arg)+))
    };
}

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn fatal(args: std::fmt::Arguments<'_>) -> ! {
    tracing::error!(target: "common_gc::fatal", "{}", args);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GcError::OutOfMemory {
            requested: 64,
            allocated: 1024,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "out of memory: cannot allocate 64 bytes (1024 of 1024 bytes in use)"
        );

        let err = GcError::invalid_param("region_size", "must be a power of two");
        assert_eq!(
            err.to_string(),
            "invalid runtime parameter `region_size`: must be a power of two"
        );
    }

    #[test]
    fn test_parse_error_conversion() {
        let parse = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: GcError = parse.into();
        assert!(matches!(err, GcError::ParamParse(_)));
    }
}
