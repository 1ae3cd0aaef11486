//! Unified error handling for rocvmm
//!
//! Every fallible operation in the crate returns [`VmmResult`]. The variants fall
//! into a small number of categories:
//! - Driver errors (a HIP VMM call failed)
//! - Capacity errors (a block cannot take a mapping)
//! - Invariant violations (ownership, duplicate or unknown mappings)
//! - Usage errors (bad arguments or configuration)
//! - Internal errors (poisoned locks, inconsistent bookkeeping)

use std::fmt;

use crate::backend::DeviceAddress;
use crate::memory::{BlockId, PoolRole};

/// Unified error type for rocvmm
#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    // ========== Driver Errors ==========
    /// A driver call returned a non-success code
    #[error("{op} failed with code {code}: {message}")]
    Driver {
        op: &'static str,
        code: i32,
        message: String,
    },

    /// GPU device not present or not usable
    #[error("device {0} not available")]
    DeviceNotFound(i32),

    // ========== Capacity Errors ==========
    /// Block does not have enough unmapped capacity
    #[error("block #{block} has {remaining} bytes remaining, {requested} requested")]
    InsufficientCapacity {
        block: BlockId,
        requested: usize,
        remaining: usize,
    },

    /// Block has enough remaining bytes but no contiguous physical extent
    #[error("block #{block} cannot place {requested} bytes contiguously (largest extent {largest})")]
    Fragmented {
        block: BlockId,
        requested: usize,
        largest: usize,
    },

    // ========== Invariant Violations ==========
    /// A mapping already starts at this virtual address
    #[error("block #{block} already has a mapping at {address}")]
    DuplicateMapping { block: BlockId, address: DeviceAddress },

    /// No mapping matches the (address, length) pair exactly
    #[error("block #{block} has no mapping of {length} bytes at {address}")]
    MappingNotFound {
        block: BlockId,
        address: DeviceAddress,
        length: usize,
    },

    /// Block is already owned by a pool
    #[error("block #{block} is already owned by the {owner} pool")]
    AlreadyOwned { block: BlockId, owner: PoolRole },

    /// Block is bound to a different allocator
    #[error("block #{block} belongs to another allocator")]
    ForeignBlock { block: BlockId },

    /// Block is not a member of the pool
    #[error("block #{block} is not a member of the {pool} pool")]
    NotMember { block: BlockId, pool: PoolRole },

    /// Block still has mappings or an owner
    #[error("block #{block} is busy: {reason}")]
    BlockBusy { block: BlockId, reason: String },

    /// Block id is unknown to the allocator
    #[error("block #{0} not found")]
    BlockNotFound(BlockId),

    /// No allocation is recorded at this address
    #[error("no allocation recorded at {0}")]
    UnknownAddress(DeviceAddress),

    // ========== Usage Errors ==========
    /// Invalid argument passed to an allocator operation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid allocator or logging configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Bookkeeping structures disagree with each other
    #[error("allocator state inconsistent: {0}")]
    Inconsistent(String),

    /// Internal lock poisoned
    #[error("internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl VmmError {
    /// Build a driver error from an operation name and a raw status code
    pub fn driver(op: &'static str, code: i32, message: impl Into<String>) -> Self {
        VmmError::Driver {
            op,
            code,
            message: message.into(),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            VmmError::Driver { .. } | VmmError::DeviceNotFound(_) => ErrorCategory::Driver,

            VmmError::InsufficientCapacity { .. } | VmmError::Fragmented { .. } => {
                ErrorCategory::Capacity
            }

            VmmError::DuplicateMapping { .. }
            | VmmError::MappingNotFound { .. }
            | VmmError::AlreadyOwned { .. }
            | VmmError::ForeignBlock { .. }
            | VmmError::NotMember { .. }
            | VmmError::BlockBusy { .. }
            | VmmError::BlockNotFound(_)
            | VmmError::UnknownAddress(_) => ErrorCategory::Invariant,

            VmmError::InvalidArgument(_) | VmmError::InvalidConfiguration(_) => {
                ErrorCategory::Usage
            }

            VmmError::Inconsistent(_) | VmmError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Capacity errors go away once other allocations are released. Driver
    /// errors may be transient (out of memory), so they are retryable too.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Capacity | ErrorCategory::Driver
        )
    }

    /// Check if this error reports a broken ownership or mapping invariant
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self.category(), ErrorCategory::Invariant)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// HIP driver failure
    Driver,
    /// Block capacity exhausted or fragmented
    Capacity,
    /// Ownership / mapping invariant violated by the caller
    Invariant,
    /// Invalid input or configuration
    Usage,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Driver => write!(f, "Driver"),
            ErrorCategory::Capacity => write!(f, "Capacity"),
            ErrorCategory::Invariant => write!(f, "Invariant"),
            ErrorCategory::Usage => write!(f, "Usage"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for VmmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        VmmError::LockPoisoned(err.to_string())
    }
}

/// Result type used across the crate
pub type VmmResult<T> = std::result::Result<T, VmmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            VmmError::driver("hipMemCreate", 2, "out of memory").category(),
            ErrorCategory::Driver
        );
        assert_eq!(
            VmmError::InsufficientCapacity {
                block: 1,
                requested: 2,
                remaining: 1
            }
            .category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            VmmError::UnknownAddress(DeviceAddress::new(0x1000)).category(),
            ErrorCategory::Invariant
        );
        assert_eq!(
            VmmError::InvalidArgument("size".into()).category(),
            ErrorCategory::Usage
        );
        assert_eq!(
            VmmError::LockPoisoned("x".into()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(VmmError::driver("hipMemMap", 1, "invalid value").is_recoverable());
        assert!(!VmmError::ForeignBlock { block: 3 }.is_recoverable());
        assert!(VmmError::ForeignBlock { block: 3 }.is_invariant_violation());
        assert!(!VmmError::Inconsistent("x".into()).is_invariant_violation());
    }

    #[test]
    fn test_error_display_mentions_block() {
        let err = VmmError::AlreadyOwned {
            block: 7,
            owner: PoolRole::Shared,
        };
        assert_eq!(err.to_string(), "block #7 is already owned by the shared pool");

        let err = VmmError::driver("hipMemAddressReserve", 2, "out of memory");
        assert_eq!(
            err.to_string(),
            "hipMemAddressReserve failed with code 2: out of memory"
        );
    }

    #[test]
    fn test_poison_error_converts() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err: VmmError = lock.lock().unwrap_err().into();
        assert!(matches!(err, VmmError::LockPoisoned(_)));
    }
}
