//! Host-side simulation of the HIP VMM API
//!
//! `SimulatedDriver` keeps the same books a real driver keeps (reservations,
//! physical handles, mappings) and rejects the same mistakes: unaligned sizes,
//! mappings outside a reservation, overlapping mappings, unmaps that do not match
//! a mapping exactly. No memory is ever touched, which makes it suitable for
//! tests and benchmarks on machines without a GPU.
//!
//! Faults can be injected per operation with [`SimulatedDriver::fail_next`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::driver::{DeviceAddress, DeviceId, PhysicalHandle, VmmDriver};
use crate::error::{VmmError, VmmResult};

/// Status code reported for rejected arguments (`hipErrorInvalidValue`)
pub const SIM_INVALID_VALUE: i32 = 1;
/// Status code reported for injected failures (`hipErrorOutOfMemory`)
pub const SIM_OUT_OF_MEMORY: i32 = 2;

const ADDRESS_BASE: u64 = 0x7f00_0000_0000;

/// Driver operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Context,
    Reserve,
    FreeAddress,
    Create,
    Release,
    Map,
    SetAccess,
    Unmap,
}

/// Number of calls made per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCounters {
    pub context_calls: usize,
    pub reserve_calls: usize,
    pub free_address_calls: usize,
    pub create_calls: usize,
    pub release_calls: usize,
    pub map_calls: usize,
    pub set_access_calls: usize,
    pub unmap_calls: usize,
}

/// A mapping as the simulated driver sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimMapping {
    pub size: usize,
    pub handle: PhysicalHandle,
    pub physical_offset: usize,
    pub accessible: bool,
}

#[derive(Debug, Clone, Copy)]
struct SimHandle {
    device: DeviceId,
    size: usize,
}

#[derive(Debug, Default)]
struct SimState {
    next_address: u64,
    next_handle: u64,
    reservations: BTreeMap<DeviceAddress, usize>,
    handles: HashMap<PhysicalHandle, SimHandle>,
    mappings: BTreeMap<DeviceAddress, SimMapping>,
    active_devices: HashSet<DeviceId>,
    /// Operation and number of calls to let through before failing
    pending_failures: Vec<(DriverOp, usize)>,
    counters: DriverCounters,
}

impl SimState {
    fn take_failure(&mut self, op: DriverOp) -> bool {
        let Some(idx) = self.pending_failures.iter().position(|(pending, _)| *pending == op) else {
            return false;
        };
        if self.pending_failures[idx].1 == 0 {
            self.pending_failures.remove(idx);
            true
        } else {
            self.pending_failures[idx].1 -= 1;
            false
        }
    }

    fn reservation_containing(&self, address: DeviceAddress, size: usize) -> bool {
        self.reservations
            .range(..=address)
            .next_back()
            .map(|(base, len)| address.within(size, *base, *len))
            .unwrap_or(false)
    }

    fn overlaps_mapping(&self, address: DeviceAddress, size: usize) -> bool {
        let end = address.offset(size);
        // The closest mapping starting at or before `address`, then anything
        // starting inside the range.
        let before = self
            .mappings
            .range(..=address)
            .next_back()
            .map(|(start, m)| start.offset(m.size) > address)
            .unwrap_or(false);
        before || self.mappings.range(address..end).next().is_some()
    }
}

/// In-process stand-in for the HIP VMM driver
#[derive(Debug)]
pub struct SimulatedDriver {
    granularity: usize,
    device_count: i32,
    state: Mutex<SimState>,
}

impl SimulatedDriver {
    /// Default granularity, matching the 2 MiB minimum of current AMD GPUs
    pub const DEFAULT_GRANULARITY: usize = 2 * 1024 * 1024;

    /// Single-device driver with the default granularity
    pub fn new() -> Self {
        Self::with_granularity(Self::DEFAULT_GRANULARITY)
    }

    /// Single-device driver with a custom granularity (must be a power of two)
    pub fn with_granularity(granularity: usize) -> Self {
        Self::with_devices(granularity, 1)
    }

    pub fn with_devices(granularity: usize, device_count: i32) -> Self {
        debug_assert!(granularity.is_power_of_two());
        SimulatedDriver {
            granularity,
            device_count,
            state: Mutex::new(SimState {
                next_address: ADDRESS_BASE,
                next_handle: 1,
                ..SimState::default()
            }),
        }
    }

    /// Make the next call of `op` fail with `SIM_OUT_OF_MEMORY`
    pub fn fail_next(&self, op: DriverOp) {
        self.fail_after(op, 0);
    }

    /// Let `successes` calls of `op` through, then fail the one after
    pub fn fail_after(&self, op: DriverOp, successes: usize) {
        self.inspect().pending_failures.push((op, successes));
    }

    pub fn counters(&self) -> DriverCounters {
        self.inspect().counters
    }

    /// Physical handles not yet released
    pub fn live_handles(&self) -> usize {
        self.inspect().handles.len()
    }

    /// Bytes of physical memory currently allocated
    pub fn physical_bytes(&self) -> usize {
        self.inspect().handles.values().map(|h| h.size).sum()
    }

    pub fn live_mappings(&self) -> usize {
        self.inspect().mappings.len()
    }

    pub fn reserved_bytes(&self) -> usize {
        self.inspect().reservations.values().sum()
    }

    pub fn reservation_count(&self) -> usize {
        self.inspect().reservations.len()
    }

    pub fn mapping_at(&self, address: DeviceAddress) -> Option<SimMapping> {
        self.inspect().mappings.get(&address).copied()
    }

    /// Whether two live mappings share physical bytes of the same handle
    pub fn has_physical_aliasing(&self) -> bool {
        let state = self.inspect();
        let mut by_handle: HashMap<PhysicalHandle, Vec<(usize, usize)>> = HashMap::new();
        for m in state.mappings.values() {
            by_handle
                .entry(m.handle)
                .or_default()
                .push((m.physical_offset, m.physical_offset + m.size));
        }
        by_handle.values_mut().any(|ranges| {
            ranges.sort_unstable();
            ranges.windows(2).any(|w| w[0].1 > w[1].0)
        })
    }

    pub fn is_context_active(&self, device: DeviceId) -> bool {
        self.inspect().active_devices.contains(&device)
    }

    // Accessors never fail: a poisoned simulator still has readable books.
    fn inspect(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> VmmResult<MutexGuard<'_, SimState>> {
        Ok(self.state.lock()?)
    }

    fn check_aligned(&self, op: &'static str, value: usize, what: &str) -> VmmResult<()> {
        if value % self.granularity != 0 {
            return Err(VmmError::driver(
                op,
                SIM_INVALID_VALUE,
                format!(
                    "{} {} is not a multiple of granularity {}",
                    what, value, self.granularity
                ),
            ));
        }
        Ok(())
    }

    fn injected(op: &'static str) -> VmmError {
        VmmError::driver(op, SIM_OUT_OF_MEMORY, "injected failure")
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl VmmDriver for SimulatedDriver {
    fn ensure_context(&self, device: DeviceId) -> VmmResult<()> {
        let mut state = self.lock()?;
        state.counters.context_calls += 1;
        if state.take_failure(DriverOp::Context) {
            return Err(Self::injected("hipSetDevice"));
        }
        if device < 0 || device >= self.device_count {
            return Err(VmmError::DeviceNotFound(device));
        }
        state.active_devices.insert(device);
        Ok(())
    }

    fn granularity(&self, device: DeviceId) -> VmmResult<usize> {
        if device < 0 || device >= self.device_count {
            return Err(VmmError::DeviceNotFound(device));
        }
        Ok(self.granularity)
    }

    fn reserve_address(&self, size: usize, alignment: usize) -> VmmResult<DeviceAddress> {
        const OP: &str = "hipMemAddressReserve";
        let mut state = self.lock()?;
        state.counters.reserve_calls += 1;
        if state.take_failure(DriverOp::Reserve) {
            return Err(Self::injected(OP));
        }
        if size == 0 {
            return Err(VmmError::driver(OP, SIM_INVALID_VALUE, "zero-size reservation"));
        }
        self.check_aligned(OP, size, "size")?;

        let align = alignment.max(self.granularity) as u64;
        let start = state.next_address.div_ceil(align) * align;
        // Leave a one-granule hole after every reservation so overruns are caught.
        state.next_address = start + (size + self.granularity) as u64;

        let address = DeviceAddress::new(start);
        state.reservations.insert(address, size);
        Ok(address)
    }

    fn free_address(&self, address: DeviceAddress, size: usize) -> VmmResult<()> {
        const OP: &str = "hipMemAddressFree";
        let mut state = self.lock()?;
        state.counters.free_address_calls += 1;
        if state.take_failure(DriverOp::FreeAddress) {
            return Err(Self::injected(OP));
        }
        match state.reservations.get(&address) {
            Some(reserved) if *reserved == size => {}
            Some(reserved) => {
                return Err(VmmError::driver(
                    OP,
                    SIM_INVALID_VALUE,
                    format!("reservation at {} is {} bytes, not {}", address, reserved, size),
                ))
            }
            None => {
                return Err(VmmError::driver(
                    OP,
                    SIM_INVALID_VALUE,
                    format!("no reservation at {}", address),
                ))
            }
        }
        if state.overlaps_mapping(address, size) {
            return Err(VmmError::driver(
                OP,
                SIM_INVALID_VALUE,
                format!("reservation at {} still has mappings", address),
            ));
        }
        state.reservations.remove(&address);
        Ok(())
    }

    fn create_physical(&self, device: DeviceId, size: usize) -> VmmResult<PhysicalHandle> {
        const OP: &str = "hipMemCreate";
        let mut state = self.lock()?;
        state.counters.create_calls += 1;
        if state.take_failure(DriverOp::Create) {
            return Err(Self::injected(OP));
        }
        if device < 0 || device >= self.device_count {
            return Err(VmmError::DeviceNotFound(device));
        }
        if size == 0 {
            return Err(VmmError::driver(OP, SIM_INVALID_VALUE, "zero-size allocation"));
        }
        self.check_aligned(OP, size, "size")?;

        let handle = PhysicalHandle::from_raw(state.next_handle);
        state.next_handle += 1;
        state.handles.insert(handle, SimHandle { device, size });
        Ok(handle)
    }

    fn release_physical(&self, handle: PhysicalHandle) -> VmmResult<()> {
        const OP: &str = "hipMemRelease";
        let mut state = self.lock()?;
        state.counters.release_calls += 1;
        if state.take_failure(DriverOp::Release) {
            return Err(Self::injected(OP));
        }
        // Like the real driver, memory that is still mapped stays alive until
        // its last unmap; only the handle goes away here.
        match state.handles.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(VmmError::driver(
                OP,
                SIM_INVALID_VALUE,
                format!("unknown handle {:?}", handle),
            )),
        }
    }

    fn map(
        &self,
        address: DeviceAddress,
        size: usize,
        physical_offset: usize,
        handle: PhysicalHandle,
    ) -> VmmResult<()> {
        const OP: &str = "hipMemMap";
        let mut state = self.lock()?;
        state.counters.map_calls += 1;
        if state.take_failure(DriverOp::Map) {
            return Err(Self::injected(OP));
        }
        self.check_aligned(OP, size, "size")?;
        self.check_aligned(OP, physical_offset, "offset")?;
        self.check_aligned(OP, address.as_u64() as usize, "address")?;

        let backing = state.handles.get(&handle).copied().ok_or_else(|| {
            VmmError::driver(OP, SIM_INVALID_VALUE, format!("unknown handle {:?}", handle))
        })?;
        if size == 0 || physical_offset + size > backing.size {
            return Err(VmmError::driver(
                OP,
                SIM_INVALID_VALUE,
                format!(
                    "range {}+{} exceeds handle size {}",
                    physical_offset, size, backing.size
                ),
            ));
        }
        if !state.reservation_containing(address, size) {
            return Err(VmmError::driver(
                OP,
                SIM_INVALID_VALUE,
                format!("{}+{} is not inside a reservation", address, size),
            ));
        }
        if state.overlaps_mapping(address, size) {
            return Err(VmmError::driver(
                OP,
                SIM_INVALID_VALUE,
                format!("{}+{} overlaps an existing mapping", address, size),
            ));
        }

        state.mappings.insert(
            address,
            SimMapping {
                size,
                handle,
                physical_offset,
                accessible: false,
            },
        );
        Ok(())
    }

    fn set_access(&self, address: DeviceAddress, size: usize, device: DeviceId) -> VmmResult<()> {
        const OP: &str = "hipMemSetAccess";
        let mut state = self.lock()?;
        state.counters.set_access_calls += 1;
        if state.take_failure(DriverOp::SetAccess) {
            return Err(Self::injected(OP));
        }
        if device < 0 || device >= self.device_count {
            return Err(VmmError::DeviceNotFound(device));
        }
        match state.mappings.get_mut(&address) {
            Some(mapping) if mapping.size == size => {
                mapping.accessible = true;
                Ok(())
            }
            _ => Err(VmmError::driver(
                OP,
                SIM_INVALID_VALUE,
                format!("no mapping of {} bytes at {}", size, address),
            )),
        }
    }

    fn unmap(&self, address: DeviceAddress, size: usize) -> VmmResult<()> {
        const OP: &str = "hipMemUnmap";
        let mut state = self.lock()?;
        state.counters.unmap_calls += 1;
        if state.take_failure(DriverOp::Unmap) {
            return Err(Self::injected(OP));
        }
        match state.mappings.get(&address) {
            Some(mapping) if mapping.size == size => {
                state.mappings.remove(&address);
                Ok(())
            }
            _ => Err(VmmError::driver(
                OP,
                SIM_INVALID_VALUE,
                format!("no mapping of {} bytes at {}", size, address),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: usize = 64 * 1024;

    #[test]
    fn test_reserve_and_free() {
        let driver = SimulatedDriver::with_granularity(G);
        let a = driver.reserve_address(2 * G, 0).unwrap();
        let b = driver.reserve_address(G, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_u64() % G as u64, 0);
        assert_eq!(driver.reserved_bytes(), 3 * G);

        driver.free_address(a, 2 * G).unwrap();
        assert_eq!(driver.reservation_count(), 1);
        assert!(driver.free_address(a, 2 * G).is_err());
        assert!(driver.free_address(b, 2 * G).is_err());
    }

    #[test]
    fn test_unaligned_sizes_rejected() {
        let driver = SimulatedDriver::with_granularity(G);
        assert!(driver.reserve_address(G + 1, 0).is_err());
        assert!(driver.create_physical(0, 100).is_err());
    }

    #[test]
    fn test_map_requires_reservation_and_no_overlap() {
        let driver = SimulatedDriver::with_granularity(G);
        let handle = driver.create_physical(0, 4 * G).unwrap();
        let base = driver.reserve_address(2 * G, 0).unwrap();

        driver.map(base, G, 0, handle).unwrap();
        // overlapping
        assert!(driver.map(base, G, G, handle).is_err());
        // spills past the reservation
        assert!(driver.map(base.offset(G), 2 * G, G, handle).is_err());
        // outside the handle
        assert!(driver.map(base.offset(G), G, 4 * G, handle).is_err());

        driver.map(base.offset(G), G, G, handle).unwrap();
        assert_eq!(driver.live_mappings(), 2);
        assert!(!driver.has_physical_aliasing());
    }

    #[test]
    fn test_unmap_must_match_exactly() {
        let driver = SimulatedDriver::with_granularity(G);
        let handle = driver.create_physical(0, 2 * G).unwrap();
        let base = driver.reserve_address(2 * G, 0).unwrap();
        driver.map(base, 2 * G, 0, handle).unwrap();

        assert!(driver.unmap(base, G).is_err());
        driver.unmap(base, 2 * G).unwrap();
        assert_eq!(driver.live_mappings(), 0);
    }

    #[test]
    fn test_free_address_refuses_mapped_reservation() {
        let driver = SimulatedDriver::with_granularity(G);
        let handle = driver.create_physical(0, G).unwrap();
        let base = driver.reserve_address(G, 0).unwrap();
        driver.map(base, G, 0, handle).unwrap();
        assert!(driver.free_address(base, G).is_err());
    }

    #[test]
    fn test_fault_injection_is_one_shot() {
        let driver = SimulatedDriver::with_granularity(G);
        driver.fail_next(DriverOp::Create);
        let err = driver.create_physical(0, G).unwrap_err();
        assert!(matches!(
            err,
            VmmError::Driver {
                code: SIM_OUT_OF_MEMORY,
                ..
            }
        ));
        assert!(driver.create_physical(0, G).is_ok());
        assert_eq!(driver.counters().create_calls, 2);
    }

    #[test]
    fn test_fail_after_skips_successes() {
        let driver = SimulatedDriver::with_granularity(G);
        driver.fail_after(DriverOp::Reserve, 2);
        assert!(driver.reserve_address(G, 0).is_ok());
        assert!(driver.reserve_address(G, 0).is_ok());
        assert!(driver.reserve_address(G, 0).is_err());
        assert!(driver.reserve_address(G, 0).is_ok());
    }

    #[test]
    fn test_unknown_device() {
        let driver = SimulatedDriver::with_devices(G, 2);
        assert!(driver.ensure_context(1).is_ok());
        assert!(driver.is_context_active(1));
        assert!(matches!(
            driver.ensure_context(2),
            Err(VmmError::DeviceNotFound(2))
        ));
        assert!(driver.granularity(-1).is_err());
    }
}
