//! `VmmDriver` implementation on top of the HIP `hipMem*` API

use std::collections::HashMap;
use std::ptr;
use std::sync::Mutex;

use super::device::{check, device_count, gpu_available};
use super::device_context::ensure_device;
use super::ffi;
use crate::backend::{DeviceAddress, DeviceId, PhysicalHandle, VmmDriver};
use crate::error::{VmmError, VmmResult};

/// HIP virtual memory management driver
///
/// Granularity is queried once per device and cached; every other call goes
/// straight to HIP.
#[derive(Debug)]
pub struct HipVmmDriver {
    device_count: i32,
    granularity: Mutex<HashMap<DeviceId, usize>>,
}

impl HipVmmDriver {
    /// Initialize HIP and discover devices
    ///
    /// # Errors
    /// - `DeviceNotFound` if HIP fails to initialize or no device is visible
    pub fn new() -> VmmResult<Self> {
        if !gpu_available() {
            return Err(VmmError::DeviceNotFound(0));
        }
        let device_count = device_count()?;
        tracing::info!("HipVmmDriver initialized with {} device(s)", device_count);
        Ok(HipVmmDriver {
            device_count,
            granularity: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_count(&self) -> i32 {
        self.device_count
    }

    fn check_device(&self, device: DeviceId) -> VmmResult<()> {
        if device < 0 || device >= self.device_count {
            return Err(VmmError::DeviceNotFound(device));
        }
        Ok(())
    }
}

impl VmmDriver for HipVmmDriver {
    fn ensure_context(&self, device: DeviceId) -> VmmResult<()> {
        self.check_device(device)?;
        ensure_device(device)
    }

    fn granularity(&self, device: DeviceId) -> VmmResult<usize> {
        self.check_device(device)?;
        let mut cache = self.granularity.lock()?;
        if let Some(granularity) = cache.get(&device) {
            return Ok(*granularity);
        }

        let prop = ffi::HipMemAllocationProp::pinned_on_device(device);
        let mut granularity: usize = 0;
        check("hipMemGetAllocationGranularity", unsafe {
            ffi::hipMemGetAllocationGranularity(
                &mut granularity,
                &prop,
                ffi::HIP_MEM_ALLOC_GRANULARITY_MINIMUM,
            )
        })?;
        tracing::debug!("Device {} allocation granularity: {} bytes", device, granularity);
        cache.insert(device, granularity);
        Ok(granularity)
    }

    fn reserve_address(&self, size: usize, alignment: usize) -> VmmResult<DeviceAddress> {
        let mut ptr: *mut std::ffi::c_void = ptr::null_mut();
        check("hipMemAddressReserve", unsafe {
            ffi::hipMemAddressReserve(&mut ptr, size, alignment, ptr::null_mut(), 0)
        })?;
        if ptr.is_null() {
            return Err(VmmError::driver(
                "hipMemAddressReserve",
                ffi::HIP_SUCCESS,
                format!("returned null address for {} bytes", size),
            ));
        }
        Ok(DeviceAddress::from_ptr(ptr))
    }

    fn free_address(&self, address: DeviceAddress, size: usize) -> VmmResult<()> {
        check("hipMemAddressFree", unsafe {
            ffi::hipMemAddressFree(address.as_ptr(), size)
        })
    }

    fn create_physical(&self, device: DeviceId, size: usize) -> VmmResult<PhysicalHandle> {
        self.check_device(device)?;
        let prop = ffi::HipMemAllocationProp::pinned_on_device(device);
        let mut handle: ffi::HipMemHandle = ptr::null_mut();
        check("hipMemCreate", unsafe {
            ffi::hipMemCreate(&mut handle, size, &prop, 0)
        })?;
        Ok(PhysicalHandle::from_raw(handle as usize as u64))
    }

    fn release_physical(&self, handle: PhysicalHandle) -> VmmResult<()> {
        check("hipMemRelease", unsafe {
            ffi::hipMemRelease(handle.as_raw() as usize as ffi::HipMemHandle)
        })
    }

    fn map(
        &self,
        address: DeviceAddress,
        size: usize,
        physical_offset: usize,
        handle: PhysicalHandle,
    ) -> VmmResult<()> {
        check("hipMemMap", unsafe {
            ffi::hipMemMap(
                address.as_ptr(),
                size,
                physical_offset,
                handle.as_raw() as usize as ffi::HipMemHandle,
                0,
            )
        })
    }

    fn set_access(&self, address: DeviceAddress, size: usize, device: DeviceId) -> VmmResult<()> {
        let desc = ffi::HipMemAccessDesc {
            location: ffi::HipMemLocation {
                location_type: ffi::HIP_MEM_LOCATION_TYPE_DEVICE,
                id: device,
            },
            flags: ffi::HIP_MEM_ACCESS_FLAGS_PROT_READ_WRITE,
        };
        check("hipMemSetAccess", unsafe {
            ffi::hipMemSetAccess(address.as_ptr(), size, &desc, 1)
        })
    }

    fn unmap(&self, address: DeviceAddress, size: usize) -> VmmResult<()> {
        check("hipMemUnmap", unsafe {
            ffi::hipMemUnmap(address.as_ptr(), size)
        })
    }
}
