//! Error types for the memory layer

use crate::memory::AllocationKind;

/// Result type alias for memory-layer operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors reported by the memory layer
///
/// Incompatible operations (size or identity mismatches) are reported
/// synchronously, before any device work is enqueued. Failures that happen
/// during device execution surface through the completion token instead and
/// only become a `MemoryError` when the token is waited on.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Source and destination byte counts differ
    #[error("byte count mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Operation crosses engine boundaries
    #[error("memory belongs to engine {actual}, operation issued against engine {expected}")]
    EngineMismatch { expected: u64, actual: u64 },

    /// The engine allocator cannot produce this allocation kind
    #[error("allocation kind {0:?} cannot be produced by the engine allocator")]
    UnsupportedAllocationKind(AllocationKind),

    /// Imported layout does not fit its backing region
    #[error("imported layout requires {required} bytes but backing region holds {available}")]
    ImportTooLarge { required: usize, available: usize },

    /// A device task failed during asynchronous execution
    #[error("asynchronous device task failed: {0}")]
    AsyncTaskFailed(String),
}
