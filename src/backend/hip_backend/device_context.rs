//! Thread-local GPU device context management
//!
//! **CRITICAL:** HIP device context is PER-THREAD, not global.
//! - hipSetDevice() only affects the calling thread
//! - hipGetDevice() returns the current device for the calling thread
//!
//! The allocator is called from whatever thread the host framework allocates
//! on, so every entry point activates the requested device first.

use std::cell::Cell;
use std::thread_local;

use super::device::check;
use super::ffi;
use crate::backend::DeviceId;
use crate::error::VmmResult;

// -1 means "not queried yet" for this thread.
thread_local! {
    static THREAD_DEVICE_ID: Cell<DeviceId> = const { Cell::new(-1) };
}

/// Get the current HIP device for this thread, querying HIP on first use
pub fn get_thread_device() -> VmmResult<DeviceId> {
    THREAD_DEVICE_ID.with(|cell| {
        let cached = cell.get();
        if cached >= 0 {
            return Ok(cached);
        }

        let mut device: i32 = -1;
        check("hipGetDevice", unsafe { ffi::hipGetDevice(&mut device) })?;
        cell.set(device);
        Ok(device)
    })
}

/// Ensure the current thread is using `expected_device`
///
/// Calls hipSetDevice() only when the cached device differs, so redundant calls
/// from hot paths cost a thread-local read.
pub fn ensure_device(expected_device: DeviceId) -> VmmResult<()> {
    let current = get_thread_device()?;
    if current != expected_device {
        tracing::debug!(
            "Device mismatch: current={}, expected={}, calling hipSetDevice({})",
            current,
            expected_device,
            expected_device
        );

        check("hipSetDevice", unsafe { ffi::hipSetDevice(expected_device) })?;
        THREAD_DEVICE_ID.with(|cell| cell.set(expected_device));
    }
    Ok(())
}
