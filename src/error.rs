//! Error Module - RGC Error Types
//!
//! Defines all error types used in RGC.

use thiserror::Error;

/// Which object heap an allocation failure was charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectHeap {
    /// Small object heap (generations 0..2)
    Soh,
    /// Large object heap
    Loh,
    /// Pinned object heap
    Poh,
}

impl std::fmt::Display for ObjectHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectHeap::Soh => write!(f, "SOH"),
            ObjectHeap::Loh => write!(f, "LOH"),
            ObjectHeap::Poh => write!(f, "POH"),
        }
    }
}

/// Main error type for all RGC operations
#[derive(Debug, Error)]
pub enum GcError {
    #[error("Commit failed on {oh}: requested {size} bytes, available {available} bytes")]
    OomCommit {
        size: usize,
        oh: ObjectHeap,
        available: usize,
    },

    #[error("Reserve failed: no free run of {size} bytes in the region range")]
    OomReserve { size: usize },

    #[error("Heap hard limit exceeded: requested {requested} bytes, limit {limit} bytes")]
    HardLimitExceeded { requested: usize, limit: usize },

    #[error("Heap corruption: {0}")]
    Corruption(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid handle: {address:#x}")]
    InvalidHandle { address: usize },

    #[error("Invalid pointer address: {address:#x}")]
    InvalidPointer { address: usize },

    #[error("Virtual memory error: {0}")]
    VirtualMemory(String),

    #[error("No-GC region error: {0}")]
    NoGcRegion(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GcError {
    /// Check if this error is recoverable by the caller (a managed OOM,
    /// not a collector defect).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GcError::OomCommit { .. }
                | GcError::OomReserve { .. }
                | GcError::HardLimitExceeded { .. }
                | GcError::NoGcRegion(_)
        )
    }

    /// Check if this error indicates a bug in the collector
    pub fn is_bug(&self) -> bool {
        matches!(self, GcError::Corruption(_) | GcError::Internal(_))
    }
}

/// Result type alias for RGC operations
pub type Result<T> = std::result::Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let oom = GcError::OomReserve { size: 4096 };
        assert!(oom.is_recoverable());
        assert!(!oom.is_bug());

        let bad = GcError::Corruption("brick points outside region".to_string());
        assert!(bad.is_bug());
        assert!(!bad.is_recoverable());
    }
}
