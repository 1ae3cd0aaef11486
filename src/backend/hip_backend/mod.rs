//! ROCm/HIP backend
//!
//! Binds the allocator to the HIP virtual memory management API. Compiled only
//! with the `rocm` feature; the crate links against `amdhip64` in that case.

pub mod device;
pub mod device_context;
pub mod ffi;
mod vmm;

pub use device::{get_error_string, gpu_available};
pub use device_context::{ensure_device, get_thread_device};
pub use vmm::HipVmmDriver;
