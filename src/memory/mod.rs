//! Block-pool management for GPU virtual memory
//!
//! Physical memory is created in blocks and mapped into virtual address ranges
//! on demand. Both sides are reused rather than handed back to the driver,
//! because every create / reserve call is expensive.
//!
//! # Pattern
//!
//! 1. Reserve a virtual range rounded to the device granularity (or reuse an
//!    idle one of the same size)
//! 2. Pick the best-fitting block by remaining capacity from the owned pool
//! 3. Create a new block only when no pooled block can take the mapping
//! 4. On release, unmap and re-index the block under its new remaining capacity

pub mod allocator;
pub mod arena;
pub mod block;
mod extents;
pub mod pool;
pub mod provision;
pub mod stats;

pub use allocator::{AccessClass, AdoptError, AllocatorId, BlockInfo, DeviceAllocator};
pub use arena::BlockArena;
pub use block::{BlockId, MappedRange, PhysicalBlock};
pub use pool::{BlockPool, BlockRegistry, CapacityIndex, Membership, OwnedBlockPool, PoolIndex, PoolRole};
pub use provision::BlockReserve;
pub use stats::AllocatorStats;
