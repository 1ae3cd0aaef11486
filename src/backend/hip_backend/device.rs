//! HIP status codes and device discovery

use std::ffi::CStr;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ffi;
use crate::error::{VmmError, VmmResult};

/// Get HIP error string from error code
pub fn get_error_string(error: i32) -> String {
    unsafe {
        let error_ptr = ffi::hipGetErrorString(error);
        if error_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(error_ptr).to_string_lossy().into_owned()
        }
    }
}

/// Turn a HIP status code into a `VmmResult`
pub fn check(op: &'static str, code: i32) -> VmmResult<()> {
    if code == ffi::HIP_SUCCESS {
        Ok(())
    } else {
        Err(VmmError::driver(op, code, get_error_string(code)))
    }
}

/// Number of visible HIP devices
pub fn device_count() -> VmmResult<i32> {
    let mut count: i32 = 0;
    check("hipGetDeviceCount", unsafe { ffi::hipGetDeviceCount(&mut count) })?;
    Ok(count)
}

/// Check whether HIP initializes and at least one device is visible
///
/// The result is computed once per process.
pub fn gpu_available() -> bool {
    static AVAILABLE: AtomicBool = AtomicBool::new(false);
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let init_result = unsafe { ffi::hipInit(0) };
        if init_result != ffi::HIP_SUCCESS {
            tracing::debug!("HIP not available: hipInit failed with code {}", init_result);
            return;
        }
        match device_count() {
            Ok(count) if count > 0 => AVAILABLE.store(true, Ordering::Release),
            Ok(_) => tracing::debug!("HIP initialized but no devices found"),
            Err(e) => tracing::debug!("HIP not available: {}", e),
        }
    });

    AVAILABLE.load(Ordering::Acquire)
}
