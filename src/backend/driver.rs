//! VMM driver abstraction
//!
//! The allocator never talks to HIP directly. Every virtual-memory operation goes
//! through [`VmmDriver`], so the same pool logic runs on a real GPU
//! ([`HipVmmDriver`](crate::backend::HipVmmDriver), `rocm` feature) and on the
//! host-side [`SimulatedDriver`](crate::backend::SimulatedDriver).

use std::ffi::c_void;
use std::fmt;

use crate::error::{VmmError, VmmResult};

/// GPU device ordinal, as used by `hipSetDevice`
pub type DeviceId = i32;

/// A virtual address in the GPU address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    pub const NULL: DeviceAddress = DeviceAddress(0);

    pub const fn new(raw: u64) -> Self {
        DeviceAddress(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        DeviceAddress(ptr as usize as u64)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as usize as *mut c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    pub fn offset(self, bytes: usize) -> Self {
        DeviceAddress(self.0 + bytes as u64)
    }

    /// Whether `[self, self + len)` lies inside `[base, base + base_len)`
    pub fn within(self, len: usize, base: DeviceAddress, base_len: usize) -> bool {
        self.0 >= base.0 && self.0 + len as u64 <= base.0 + base_len as u64
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Opaque physical allocation handle (`hipMemGenericAllocationHandle_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalHandle(u64);

impl PhysicalHandle {
    pub const fn from_raw(raw: u64) -> Self {
        PhysicalHandle(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Virtual memory management operations of a GPU driver
///
/// Sizes passed to `reserve_address`, `create_physical`, `map` and `unmap` must
/// be multiples of [`granularity`](VmmDriver::granularity) for the device.
pub trait VmmDriver: Send + Sync + fmt::Debug {
    /// Make `device` current for the calling thread. Idempotent.
    fn ensure_context(&self, device: DeviceId) -> VmmResult<()>;

    /// Minimum allocation granularity for physical memory on `device`
    fn granularity(&self, device: DeviceId) -> VmmResult<usize>;

    /// Reserve `size` bytes of virtual address space (no physical backing)
    fn reserve_address(&self, size: usize, alignment: usize) -> VmmResult<DeviceAddress>;

    /// Return a reservation to the driver
    fn free_address(&self, address: DeviceAddress, size: usize) -> VmmResult<()>;

    /// Allocate `size` bytes of physical memory on `device`
    fn create_physical(&self, device: DeviceId, size: usize) -> VmmResult<PhysicalHandle>;

    /// Release a physical allocation
    fn release_physical(&self, handle: PhysicalHandle) -> VmmResult<()>;

    /// Map `size` bytes of `handle`, starting at `physical_offset`, to `address`
    fn map(
        &self,
        address: DeviceAddress,
        size: usize,
        physical_offset: usize,
        handle: PhysicalHandle,
    ) -> VmmResult<()>;

    /// Grant read/write access to a mapped range for `device`
    fn set_access(&self, address: DeviceAddress, size: usize, device: DeviceId) -> VmmResult<()>;

    /// Tear down a mapping previously created with [`map`](VmmDriver::map)
    fn unmap(&self, address: DeviceAddress, size: usize) -> VmmResult<()>;
}

/// Round `size` up to a multiple of `granularity`
///
/// Fails with `InvalidArgument` when the rounded size does not fit in `usize`.
pub fn round_up(size: usize, granularity: usize) -> VmmResult<usize> {
    if granularity == 0 {
        return Ok(size);
    }
    size.div_ceil(granularity)
        .checked_mul(granularity)
        .ok_or_else(|| {
            VmmError::InvalidArgument(format!(
                "size {} overflows when rounded to granularity {}",
                size, granularity
            ))
        })
}
