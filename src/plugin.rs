//! Pluggable allocator contract for host tensor frameworks
//!
//! Frameworks that let users replace their device allocator call two entry
//! points: `alloc(size, device, stream)` and `dealloc(ptr, size, device, stream)`.
//! [`PluggableAllocator`] is that contract in Rust; with the `rocm` feature the
//! crate also exports it over the C ABI as `rocvmm_alloc` / `rocvmm_dealloc`,
//! backed by one lazily created allocator configured from the environment.

use std::ffi::c_void;

use crate::backend::{DeviceAddress, DeviceId};
use crate::error::{VmmError, VmmResult};
use crate::memory::DeviceAllocator;

/// Opaque stream handle passed by the host framework (`hipStream_t`)
pub type StreamHandle = *mut c_void;

/// The allocate / free pair a host framework calls
///
/// VMM calls are synchronous, so implementations may ignore `stream`.
pub trait PluggableAllocator: Send + Sync {
    fn alloc(&self, size: usize, device: DeviceId, stream: StreamHandle) -> VmmResult<DeviceAddress>;

    fn dealloc(
        &self,
        ptr: DeviceAddress,
        size: usize,
        device: DeviceId,
        stream: StreamHandle,
    ) -> VmmResult<()>;
}

impl PluggableAllocator for DeviceAllocator {
    fn alloc(&self, size: usize, device: DeviceId, _stream: StreamHandle) -> VmmResult<DeviceAddress> {
        DeviceAllocator::alloc(self, size, device)
    }

    fn dealloc(
        &self,
        ptr: DeviceAddress,
        size: usize,
        device: DeviceId,
        _stream: StreamHandle,
    ) -> VmmResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        DeviceAllocator::dealloc(self, ptr, size, device)
    }
}

/// Convert a signed C size into a byte count
pub(crate) fn checked_size(size: isize) -> VmmResult<usize> {
    usize::try_from(size)
        .map_err(|_| VmmError::InvalidArgument(format!("negative allocation size {}", size)))
}

/// Run one plugin call: errors are logged and replaced by `fallback`
///
/// Panics are caught as well; nothing unwinds into the caller's frames.
pub(crate) fn guarded<T>(op: &'static str, fallback: T, call: impl FnOnce() -> VmmResult<T>) -> T {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(call)) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            tracing::error!("{} failed: {}", op, e);
            fallback
        }
        Err(_) => {
            tracing::error!("{} panicked", op);
            fallback
        }
    }
}

#[cfg(feature = "rocm")]
mod exports {
    use std::ffi::c_void;
    use std::sync::Arc;

    use once_cell::sync::OnceCell;

    use super::{checked_size, guarded, PluggableAllocator, StreamHandle};
    use crate::backend::{DeviceAddress, HipVmmDriver};
    use crate::config::AllocatorConfig;
    use crate::error::VmmResult;
    use crate::memory::DeviceAllocator;

    static GLOBAL_ALLOCATOR: OnceCell<DeviceAllocator> = OnceCell::new();

    fn global() -> VmmResult<&'static DeviceAllocator> {
        GLOBAL_ALLOCATOR.get_or_try_init(|| {
            crate::logging::init_logging_default();
            let config = AllocatorConfig::from_env()?;
            let driver = Arc::new(HipVmmDriver::new()?);
            DeviceAllocator::with_config(driver, config)
        })
    }

    /// Allocate `size` bytes on `device`; null on failure
    ///
    /// # Safety
    /// Called by the host framework through its pluggable-allocator hook.
    #[no_mangle]
    pub unsafe extern "C" fn rocvmm_alloc(size: isize, device: i32, stream: *mut c_void) -> *mut c_void {
        guarded("rocvmm_alloc", std::ptr::null_mut(), || {
            let size = checked_size(size)?;
            let address = PluggableAllocator::alloc(global()?, size, device, stream as StreamHandle)?;
            Ok(address.as_ptr())
        })
    }

    /// Release memory returned by [`rocvmm_alloc`]; errors are logged
    ///
    /// # Safety
    /// `ptr` and `size` must come from a previous `rocvmm_alloc` call.
    #[no_mangle]
    pub unsafe extern "C" fn rocvmm_dealloc(ptr: *mut c_void, size: isize, device: i32, stream: *mut c_void) {
        guarded("rocvmm_dealloc", (), || {
            let size = checked_size(size)?;
            PluggableAllocator::dealloc(global()?, DeviceAddress::from_ptr(ptr), size, device, stream)
        })
    }
}

#[cfg(feature = "rocm")]
pub use exports::{rocvmm_alloc, rocvmm_dealloc};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedDriver;
    use std::sync::Arc;

    const G: usize = 64 * 1024;

    #[test]
    fn test_trait_round_trip() {
        let sim = Arc::new(SimulatedDriver::with_granularity(G));
        let allocator = DeviceAllocator::new(sim.clone());
        let plugin: &dyn PluggableAllocator = &allocator;

        let ptr = plugin.alloc(3 * G, 0, std::ptr::null_mut()).unwrap();
        assert_eq!(sim.live_mappings(), 1);
        plugin.dealloc(ptr, 3 * G, 0, std::ptr::null_mut()).unwrap();
        assert_eq!(sim.live_mappings(), 0);
    }

    #[test]
    fn test_dealloc_null_is_noop() {
        let sim = Arc::new(SimulatedDriver::with_granularity(G));
        let allocator = DeviceAllocator::new(sim.clone());
        PluggableAllocator::dealloc(&allocator, DeviceAddress::NULL, G, 0, std::ptr::null_mut())
            .unwrap();
        assert_eq!(sim.counters().unmap_calls, 0);
    }

    #[test]
    fn test_checked_size() {
        assert_eq!(checked_size(4096).unwrap(), 4096);
        assert!(matches!(checked_size(-1), Err(VmmError::InvalidArgument(_))));
    }

    #[test]
    fn test_guarded_maps_errors_and_panics() {
        assert_eq!(guarded("ok", 0, || Ok(7)), 7);
        assert_eq!(
            guarded("err", 0, || Err(VmmError::InvalidArgument("x".into()))),
            0
        );
        assert_eq!(guarded("panic", 0, || -> VmmResult<i32> { panic!("boom") }), 0);
    }
}
