//! Common test utilities
//!
//! Most integration tests run the allocator against [`SimulatedDriver`] with a
//! 64 KiB granularity so sizes stay readable. GPU tests share one lazily built
//! [`GpuTestFixture`] and skip gracefully when no device is present.

#![allow(dead_code)]

use std::sync::Arc;

use rocvmm::backend::SimulatedDriver;
use rocvmm::{AllocatorConfig, DeviceAllocator};
pub use serial_test::serial;

/// Granularity used by every simulated test
pub const G: usize = 64 * 1024;
pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

/// Fresh simulated driver with the test granularity
pub fn sim() -> Arc<SimulatedDriver> {
    Arc::new(SimulatedDriver::with_granularity(G))
}

/// Simulated driver plus an allocator with the default configuration
pub fn allocator() -> (Arc<SimulatedDriver>, DeviceAllocator) {
    allocator_with(AllocatorConfig::default())
}

/// Simulated driver plus an allocator with `config`
pub fn allocator_with(config: AllocatorConfig) -> (Arc<SimulatedDriver>, DeviceAllocator) {
    let sim = sim();
    let allocator = DeviceAllocator::with_config(sim.clone(), config)
        .expect("test configuration must validate");
    (sim, allocator)
}

/// Assert the allocator's books agree and the driver never aliased memory
pub fn assert_consistent(sim: &SimulatedDriver, allocator: &DeviceAllocator) {
    if let Err(e) = allocator.check_consistency() {
        panic!("allocator is inconsistent: {}", e);
    }
    assert!(!sim.has_physical_aliasing(), "two mappings share physical memory");
}

#[cfg(feature = "rocm")]
pub use gpu::{GpuTestFixture, GPU_FIXTURE};

#[cfg(feature = "rocm")]
mod gpu {
    use std::sync::Arc;

    use once_cell::sync::Lazy;
    use rocvmm::backend::hip_backend::gpu_available;
    use rocvmm::backend::VmmDriver;
    use rocvmm::HipVmmDriver;

    /// Shared HIP driver for GPU tests, `None` when no GPU is usable
    pub static GPU_FIXTURE: Lazy<Option<GpuTestFixture>> = Lazy::new(|| {
        if !gpu_available() {
            eprintln!("WARNING: GPU not available - skipping GPU tests");
            eprintln!("To enable GPU tests, ensure:");
            eprintln!("  1. AMD GPU is present");
            eprintln!("  2. ROCm is installed (check with rocm-smi)");
            eprintln!("  3. amdhip64 library is in LD_LIBRARY_PATH");
            return None;
        }

        match GpuTestFixture::new() {
            Ok(fixture) => {
                eprintln!("GPU test fixture initialized");
                eprintln!("   Devices: {}", fixture.driver.device_count());
                eprintln!("   Granularity: {} KiB", fixture.granularity / 1024);
                Some(fixture)
            }
            Err(e) => {
                eprintln!("ERROR: Failed to initialize GPU test fixture: {}", e);
                eprintln!("   GPU tests will be skipped");
                None
            }
        }
    });

    pub struct GpuTestFixture {
        driver: Arc<HipVmmDriver>,
        granularity: usize,
    }

    impl GpuTestFixture {
        fn new() -> rocvmm::VmmResult<Self> {
            let driver = Arc::new(HipVmmDriver::new()?);
            driver.ensure_context(0)?;
            let granularity = driver.granularity(0)?;
            Ok(GpuTestFixture { driver, granularity })
        }

        pub fn driver(&self) -> Arc<HipVmmDriver> {
            self.driver.clone()
        }

        /// Minimum granularity of device 0
        pub fn granularity(&self) -> usize {
            self.granularity
        }
    }
}
