//! rocvmm - Block-pool GPU memory allocator for AMD GPUs
//!
//! Serves device allocations through the ROCm/HIP virtual memory management
//! API: physical blocks are created once, indexed by remaining capacity and
//! mapped into reserved virtual ranges on demand.

#![allow(clippy::missing_safety_doc)] // FFI bindings documented at module level

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod plugin;

#[cfg(feature = "rocm")]
pub use backend::HipVmmDriver;
pub use backend::{DeviceAddress, DeviceId, PhysicalHandle, SimulatedDriver, VmmDriver};
pub use config::{AllocatorConfig, FitPolicy};
pub use error::{ErrorCategory, VmmError, VmmResult};
pub use memory::{
    AccessClass, AllocatorStats, BlockId, BlockInfo, BlockReserve, DeviceAllocator, PhysicalBlock,
    PoolRole,
};
pub use plugin::{PluggableAllocator, StreamHandle};
