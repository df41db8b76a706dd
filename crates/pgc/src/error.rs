//! Error Module - PGC Error Types
//!
//! Defines all error types used in PGC.
//!
//! # Error Categories
//!
//! ## Resource Errors
//! - `OutOfMemory` - Heap exhausted even after a forced collection and heap expansion
//! - `HeapLimitExceeded` - Allocation would cross the current heap limit (recoverable)
//! - `SystemCall` - mmap, pipe, sigaction or pthread call failed
//!
//! ## Collection Errors
//! - `MarkingOverflow` - Mark packet pool exhausted
//! - `ThreadPool` - GC worker pool could not be built
//!
//! ## Protocol Errors
//! - `ProtocolViolation` - Host/integration bug (double index, unbalanced scopes)
//! - `InvalidState` - Operation not allowed in the current state
//! - `InvalidPointer` - Address is not managed memory
//! - `InvalidArgument` - Argument fails validation
//! - `Configuration` - Invalid configuration

use thiserror::Error;

/// Main error type for all PGC operations
///
/// # Examples
///
/// ```rust
/// use pgc::GcError;
///
/// fn handle_error(err: GcError) {
///     match err {
///         GcError::OutOfMemory { requested, available } => {
///             eprintln!("OOM: requested {}, available {}", requested, available);
///         }
///         GcError::MarkingOverflow => {
///             eprintln!("mark stack overflow");
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum GcError {
    /// Out of memory - heap exhaustion
    ///
    /// **When returned:** No memory could be produced even after a forced
    /// collection and a heap expansion attempt
    ///
    /// **Recovery strategy:** Release references and retry, or fail gracefully
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Heap limit exceeded
    ///
    /// **When returned:** The core allocator would grow the heap beyond its
    /// current limit
    ///
    /// **Recovery strategy:** Run a collection, then expand the heap, then retry
    #[error("Heap limit exceeded: requested {requested} bytes with limit {limit} bytes")]
    HeapLimitExceeded { requested: usize, limit: usize },

    /// Mark stack overflow
    ///
    /// **When returned:** The mark packet pool was exhausted while tracing
    ///
    /// **Recovery strategy:** Restart the cycle with an unbounded serial mark
    /// stack (see `OverflowPolicy`)
    #[error("Mark stack overflow")]
    MarkingOverflow,

    /// Invalid pointer address
    ///
    /// **When returned:** Address does not resolve to a managed cell
    #[error("Invalid pointer address: {address:#x}")]
    InvalidPointer { address: usize },

    /// Protocol violation
    ///
    /// **When returned:** The host broke a usage contract, e.g. indexed the
    /// same range twice or left a scope it never entered
    ///
    /// **Recovery strategy:** None - continuing risks heap corruption
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid state
    ///
    /// **When returned:** Operation not allowed in the current state
    ///
    /// **Example scenario:** Stop-the-world requested from inside an unsafe scope
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid argument
    ///
    /// **When returned:** Function argument fails validation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// System call failed
    ///
    /// **When returned:** An OS primitive (mmap, pipe, sigaction, pthread_kill)
    /// reported an error
    #[error("System call {call} failed: {source}")]
    SystemCall {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Worker thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Configuration error
    ///
    /// **When returned:** Invalid GC configuration detected
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl GcError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GcError::OutOfMemory { .. }
                | GcError::HeapLimitExceeded { .. }
                | GcError::MarkingOverflow
        )
    }

    /// Check if this error indicates a bug in the host or in PGC
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            GcError::ProtocolViolation(_) | GcError::InvalidState { .. }
        )
    }

    /// Wrap the current `errno` as a system call failure
    pub(crate) fn last_os_error(call: &'static str) -> Self {
        GcError::SystemCall {
            call,
            source: std::io::Error::last_os_error(),
        }
    }
}

impl From<crate::config::ConfigError> for GcError {
    fn from(err: crate::config::ConfigError) -> Self {
        GcError::Configuration(err.to_string())
    }
}

/// Result type alias for PGC operations
pub type Result<T> = std::result::Result<T, GcError>;

/// Macro for early return with error
#[macro_export]
macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(value: usize) -> Result<usize> {
        ensure!(
            value > 0,
            GcError::InvalidArgument("value must be positive".to_string())
        );
        Ok(value)
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(GcError::MarkingOverflow.is_recoverable());
        assert!(GcError::HeapLimitExceeded { requested: 1, limit: 0 }.is_recoverable());
        assert!(!GcError::ProtocolViolation("x".into()).is_recoverable());
        assert!(GcError::ProtocolViolation("x".into()).is_bug());
    }

    #[test]
    fn test_ensure_macro() {
        assert_eq!(checked(3).unwrap(), 3);
        assert!(matches!(checked(0), Err(GcError::InvalidArgument(_))));
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(GcError::MarkingOverflow.to_string(), "Mark stack overflow");
        let err = GcError::InvalidPointer { address: 0x1000 };
        assert_eq!(err.to_string(), "Invalid pointer address: 0x1000");
    }
}
