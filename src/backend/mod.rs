//! GPU driver backends

pub mod driver;
#[cfg(feature = "rocm")]
pub mod hip_backend;
pub mod sim;

pub use driver::{round_up, DeviceAddress, DeviceId, PhysicalHandle, VmmDriver};
#[cfg(feature = "rocm")]
pub use hip_backend::HipVmmDriver;
pub use sim::{DriverCounters, DriverOp, SimMapping, SimulatedDriver};
