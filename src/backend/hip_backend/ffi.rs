//! HIP FFI bindings for the virtual memory management API
//!
//! Only the entry points the allocator needs are declared here: device
//! selection, error strings, and the `hipMem*` VMM family. Struct layouts
//! mirror `hip_runtime_api.h` and are checked in `layout_verification` below.

use std::ffi::c_void;
use std::os::raw::c_char;

/// `hipMemGenericAllocationHandle_t` is an opaque pointer
pub type HipMemHandle = *mut c_void;

/// `hipMemLocation`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HipMemLocation {
    pub location_type: i32,
    pub id: i32,
}

/// `allocFlags` member of `hipMemAllocationProp`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HipMemAllocFlags {
    pub compression_type: u8,
    pub gpu_direct_rdma_capable: u8,
    pub usage: u16,
}

/// `hipMemAllocationProp`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HipMemAllocationProp {
    pub alloc_type: i32,
    pub requested_handle_type: i32,
    pub location: HipMemLocation,
    pub win32_handle_meta_data: *mut c_void,
    pub alloc_flags: HipMemAllocFlags,
}

impl HipMemAllocationProp {
    /// Pinned device memory on `device`, no shareable handle, no compression
    pub fn pinned_on_device(device: i32) -> Self {
        HipMemAllocationProp {
            alloc_type: HIP_MEM_ALLOCATION_TYPE_PINNED,
            requested_handle_type: HIP_MEM_HANDLE_TYPE_NONE,
            location: HipMemLocation {
                location_type: HIP_MEM_LOCATION_TYPE_DEVICE,
                id: device,
            },
            win32_handle_meta_data: std::ptr::null_mut(),
            alloc_flags: HipMemAllocFlags::default(),
        }
    }
}

/// `hipMemAccessDesc`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HipMemAccessDesc {
    pub location: HipMemLocation,
    pub flags: i32,
}

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipInit(flags: u32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipGetDevice(device: *mut i32) -> i32;
    pub fn hipSetDevice(device: i32) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const c_char;

    pub fn hipMemGetAllocationGranularity(
        granularity: *mut usize,
        prop: *const HipMemAllocationProp,
        option: i32,
    ) -> i32;
    pub fn hipMemCreate(
        handle: *mut HipMemHandle,
        size: usize,
        prop: *const HipMemAllocationProp,
        flags: u64,
    ) -> i32;
    pub fn hipMemRelease(handle: HipMemHandle) -> i32;
    pub fn hipMemAddressReserve(
        ptr: *mut *mut c_void,
        size: usize,
        alignment: usize,
        addr: *mut c_void,
        flags: u64,
    ) -> i32;
    pub fn hipMemAddressFree(ptr: *mut c_void, size: usize) -> i32;
    pub fn hipMemMap(
        ptr: *mut c_void,
        size: usize,
        offset: usize,
        handle: HipMemHandle,
        flags: u64,
    ) -> i32;
    pub fn hipMemSetAccess(
        ptr: *mut c_void,
        size: usize,
        desc: *const HipMemAccessDesc,
        count: usize,
    ) -> i32;
    pub fn hipMemUnmap(ptr: *mut c_void, size: usize) -> i32;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// `hipMemAllocationTypePinned`
pub const HIP_MEM_ALLOCATION_TYPE_PINNED: i32 = 0x1;
/// `hipMemHandleTypeNone`
pub const HIP_MEM_HANDLE_TYPE_NONE: i32 = 0x0;
/// `hipMemLocationTypeDevice`
pub const HIP_MEM_LOCATION_TYPE_DEVICE: i32 = 0x1;
/// `hipMemAllocationGranularityMinimum`
pub const HIP_MEM_ALLOC_GRANULARITY_MINIMUM: i32 = 0x0;
/// `hipMemAccessFlagsProtReadWrite`
pub const HIP_MEM_ACCESS_FLAGS_PROT_READ_WRITE: i32 = 0x3;
