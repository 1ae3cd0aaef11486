//! Device allocator: virtual ranges backed by pooled physical blocks
//!
//! `alloc` reserves (or reuses) a virtual range, finds a block with room in the
//! owned pool (or creates one) and maps the range onto it. `dealloc` unmaps the
//! range and re-indexes the block so the capacity can be reused; neither the
//! virtual range nor the block is given back to the driver.
//!
//! All bookkeeping sits behind one allocator-wide lock which is held for the
//! whole of each request, driver calls included.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::arena::BlockArena;
use super::block::{BlockId, MappedRange, PhysicalBlock};
use super::pool::{BlockRegistry, OwnedBlockPool, PoolRole};
use super::stats::AllocatorStats;
use crate::backend::{round_up, DeviceAddress, DeviceId, VmmDriver};
use crate::config::AllocatorConfig;
use crate::error::{ErrorCategory, VmmError, VmmResult};

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`DeviceAllocator`]; blocks remember the first one they join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorId(u64);

impl AllocatorId {
    /// Fresh, process-unique id
    pub fn next() -> Self {
        AllocatorId(NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocator #{}", self.0)
    }
}

/// Registry an externally created block is adopted into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    Shared,
    Exclusive,
}

impl From<AccessClass> for PoolRole {
    fn from(class: AccessClass) -> Self {
        match class {
            AccessClass::Shared => PoolRole::Shared,
            AccessClass::Exclusive => PoolRole::Exclusive,
        }
    }
}

/// Snapshot of a block's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub device: DeviceId,
    pub capacity: usize,
    pub remaining: usize,
    pub owner: Option<PoolRole>,
    pub allocator: Option<AllocatorId>,
    /// Live mappings ordered by virtual address
    pub mappings: Vec<(DeviceAddress, MappedRange)>,
}

impl BlockInfo {
    fn of(block: &PhysicalBlock) -> Self {
        BlockInfo {
            id: block.id(),
            device: block.device(),
            capacity: block.capacity(),
            remaining: block.remaining(),
            owner: block.owner(),
            allocator: block.allocator(),
            mappings: block.mappings().collect(),
        }
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

/// A block the allocator refused to adopt, handed back with the reason
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct AdoptError {
    pub error: VmmError,
    pub block: PhysicalBlock,
}

impl AdoptError {
    pub fn into_block(self) -> PhysicalBlock {
        self.block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    device: DeviceId,
    size: usize,
}

#[derive(Debug)]
struct AllocatorState {
    arena: BlockArena,
    owned: OwnedBlockPool,
    shared: BlockRegistry,
    exclusive: BlockRegistry,
    /// Virtual address -> block mapped (or last mapped) there
    allocations: BTreeMap<DeviceAddress, BlockId>,
    reservations: BTreeMap<DeviceAddress, Reservation>,
    /// Whole reservations with nothing mapped, by (device, size)
    idle: BTreeMap<(DeviceId, usize), Vec<DeviceAddress>>,
    /// Detached blocks to destroy once their last mapping is gone
    retired: HashSet<BlockId>,
    stats: AllocatorStats,
}

impl AllocatorState {
    fn new(id: AllocatorId, config: &AllocatorConfig) -> Self {
        AllocatorState {
            arena: BlockArena::new(),
            owned: OwnedBlockPool::owned(id, config.fit_policy),
            shared: BlockRegistry::registry(PoolRole::Shared, id),
            exclusive: BlockRegistry::registry(PoolRole::Exclusive, id),
            allocations: BTreeMap::new(),
            reservations: BTreeMap::new(),
            idle: BTreeMap::new(),
            retired: HashSet::new(),
            stats: AllocatorStats::default(),
        }
    }

    fn block(&self, id: BlockId) -> VmmResult<&PhysicalBlock> {
        self.arena.get(id).ok_or(VmmError::BlockNotFound(id))
    }

    fn pool_contains(&self, role: PoolRole, id: BlockId) -> bool {
        match role {
            PoolRole::Owned => self.owned.contains(id),
            PoolRole::Shared => self.shared.contains(id),
            PoolRole::Exclusive => self.exclusive.contains(id),
        }
    }

    /// Hand a held block to the pool for `role`
    fn attach(&mut self, id: BlockId, role: PoolRole) -> VmmResult<()> {
        let block = self.arena.get_mut(id).ok_or(VmmError::BlockNotFound(id))?;
        match role {
            PoolRole::Owned => self.owned.add(block),
            PoolRole::Shared => self.shared.add(block),
            PoolRole::Exclusive => self.exclusive.add(block),
        }
    }

    /// Take a held block away from whichever pool owns it
    fn detach(&mut self, id: BlockId) -> VmmResult<()> {
        let block = self.arena.get_mut(id).ok_or(VmmError::BlockNotFound(id))?;
        match block.owner() {
            Some(PoolRole::Owned) => self.owned.remove(block),
            Some(PoolRole::Shared) => self.shared.remove(block),
            Some(PoolRole::Exclusive) => self.exclusive.remove(block),
            None => Ok(()),
        }
    }

    /// Undo a registry add for a block that never made it into the arena
    fn detach_unheld(&mut self, block: &mut PhysicalBlock, role: PoolRole) -> VmmResult<()> {
        match role {
            PoolRole::Owned => self.owned.remove(block),
            PoolRole::Shared => self.shared.remove(block),
            PoolRole::Exclusive => self.exclusive.remove(block),
        }
    }

    /// Reservation containing `[address, address + length)`
    fn reservation_for(&self, address: DeviceAddress, length: usize) -> Option<(DeviceAddress, Reservation)> {
        self.reservations
            .range(..=address)
            .next_back()
            .filter(|(base, r)| address.within(length, **base, r.size))
            .map(|(base, r)| (*base, *r))
    }

    fn take_idle(&mut self, device: DeviceId, size: usize) -> Option<DeviceAddress> {
        let ranges = self.idle.get_mut(&(device, size))?;
        let address = ranges.pop();
        if ranges.is_empty() {
            self.idle.remove(&(device, size));
        }
        address
    }

    /// Park `address` for reuse if a whole reservation starts there
    fn park_if_whole(&mut self, address: DeviceAddress, length: usize) {
        if let Some(r) = self.reservations.get(&address) {
            if r.size == length {
                self.idle.entry((r.device, length)).or_default().push(address);
                tracing::trace!("Range {} ({} bytes) is idle", address, length);
            }
        }
    }

    fn forget_idle(&mut self, address: DeviceAddress) {
        self.idle.retain(|_, ranges| {
            ranges.retain(|a| *a != address);
            !ranges.is_empty()
        });
    }

    /// Destroy a retired block once nothing owns or maps it
    fn reclaim_if_retired(&mut self, id: BlockId) {
        if !self.retired.contains(&id) {
            return;
        }
        let idle = match self.arena.get(id) {
            Some(block) => block.owner().is_none() && !block.has_mappings(),
            None => {
                self.retired.remove(&id);
                return;
            }
        };
        if !idle {
            return;
        }

        self.retired.remove(&id);
        self.allocations.retain(|_, block| *block != id);
        if let Some(mut block) = self.arena.remove(id) {
            match block.destroy() {
                Ok(()) => self.stats.blocks_destroyed += 1,
                Err(e) => {
                    self.stats.cleanup_failures += 1;
                    tracing::error!("Failed to destroy retired block #{}: {}", id, e);
                }
            }
        }
    }

    fn snapshot(&self) -> AllocatorStats {
        let mut stats = self.stats.clone();
        stats.block_count = self.arena.len();
        stats.total_capacity = self.arena.total_capacity();
        stats.mapped_bytes = self.arena.mapped_bytes();
        stats.idle_ranges = self.idle.values().map(Vec::len).sum();
        stats.fragmentation = self.arena.fragmentation();
        stats
    }
}

/// Block-pool allocator for one driver
///
/// # Thread Safety
///
/// `DeviceAllocator` is `Send + Sync`. Requests from different threads are
/// serialised by an internal lock.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use rocvmm::backend::SimulatedDriver;
/// use rocvmm::memory::DeviceAllocator;
///
/// let allocator = DeviceAllocator::new(Arc::new(SimulatedDriver::new()));
/// let ptr = allocator.alloc(256 * 1024, 0)?;
/// allocator.dealloc(ptr, 256 * 1024, 0)?;
/// # Ok::<(), rocvmm::VmmError>(())
/// ```
#[derive(Debug)]
pub struct DeviceAllocator {
    id: AllocatorId,
    driver: Arc<dyn VmmDriver>,
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
}

impl DeviceAllocator {
    /// Allocator with the default configuration
    pub fn new(driver: Arc<dyn VmmDriver>) -> Self {
        Self::build(driver, AllocatorConfig::default())
    }

    /// Allocator with a custom configuration
    ///
    /// # Errors
    /// - `InvalidConfiguration` if `config` does not validate
    pub fn with_config(driver: Arc<dyn VmmDriver>, config: AllocatorConfig) -> VmmResult<Self> {
        config.validate()?;
        Ok(Self::build(driver, config))
    }

    fn build(driver: Arc<dyn VmmDriver>, config: AllocatorConfig) -> Self {
        let id = AllocatorId::next();
        tracing::info!(
            "Created {} (fit policy {}, min block {} bytes)",
            id,
            config.fit_policy,
            config.min_block_size
        );
        DeviceAllocator {
            id,
            state: Mutex::new(AllocatorState::new(id, &config)),
            driver,
            config,
        }
    }

    pub fn id(&self) -> AllocatorId {
        self.id
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn VmmDriver> {
        &self.driver
    }

    fn lock(&self) -> VmmResult<MutexGuard<'_, AllocatorState>> {
        Ok(self.state.lock()?)
    }

    /// Allocate `size` bytes on `device` and return the virtual address
    ///
    /// The mapped length is `size` rounded up to the device granularity. The
    /// address stays valid until it is passed to [`dealloc`](Self::dealloc).
    ///
    /// # Errors
    /// - `InvalidArgument` if `size` is zero
    /// - `Driver` / `DeviceNotFound` if a driver call fails
    pub fn alloc(&self, size: usize, device: DeviceId) -> VmmResult<DeviceAddress> {
        let _span = tracing::debug_span!("alloc", size, device).entered();
        if size == 0 {
            return Err(VmmError::InvalidArgument(
                "allocation size cannot be zero".to_string(),
            ));
        }

        self.driver.ensure_context(device)?;
        let granularity = self.driver.granularity(device)?;
        let length = round_up(size, granularity)?;

        let mut guard = self.lock()?;
        let state = &mut *guard;
        let address = self.acquire_range(state, device, length, granularity)?;
        let id = match self.map_into_pool(state, device, address, size, length) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Allocation of {} bytes on device {} failed: {}", size, device, e);
                self.abandon_range(state, device, address, length);
                return Err(e);
            }
        };

        state.allocations.insert(address, id);
        state.stats.record_alloc();
        tracing::debug!(
            "Allocated {} bytes ({} mapped) at {} on block #{}",
            size,
            length,
            address,
            id
        );
        Ok(address)
    }

    fn acquire_range(
        &self,
        state: &mut AllocatorState,
        device: DeviceId,
        length: usize,
        granularity: usize,
    ) -> VmmResult<DeviceAddress> {
        if self.config.reuse_address_ranges {
            if let Some(address) = state.take_idle(device, length) {
                state.stats.ranges_reused += 1;
                tracing::trace!("Reusing idle range {} ({} bytes)", address, length);
                return Ok(address);
            }
        }

        let address = self.driver.reserve_address(length, granularity)?;
        state.reservations.insert(address, Reservation { device, size: length });
        state.stats.ranges_reserved += 1;
        tracing::trace!("Reserved range {} ({} bytes)", address, length);
        Ok(address)
    }

    /// Put back a range whose allocation failed
    fn abandon_range(
        &self,
        state: &mut AllocatorState,
        device: DeviceId,
        address: DeviceAddress,
        length: usize,
    ) {
        if self.config.reuse_address_ranges {
            state.idle.entry((device, length)).or_default().push(address);
            return;
        }
        match self.driver.free_address(address, length) {
            Ok(()) => {
                state.reservations.remove(&address);
                state.stats.ranges_freed += 1;
            }
            Err(e) => {
                state.stats.cleanup_failures += 1;
                tracing::error!("Failed to free abandoned range {}: {}", address, e);
            }
        }
    }

    /// Map `[address, address + length)` onto a pooled block, creating one if needed
    ///
    /// `size` is the caller's request; best fit is judged on it, not on `length`.
    fn map_into_pool(
        &self,
        state: &mut AllocatorState,
        device: DeviceId,
        address: DeviceAddress,
        size: usize,
        length: usize,
    ) -> VmmResult<BlockId> {
        let AllocatorState {
            arena,
            owned,
            stats,
            ..
        } = state;

        let candidate = owned.find_mapping_where(size, length, |id| {
            arena.get(id).map_or(false, |block| block.device() == device)
        });
        if let Some(id) = candidate {
            let block = arena.get_mut(id).ok_or_else(|| {
                VmmError::Inconsistent(format!("indexed block #{} is not held", id))
            })?;
            let before = block.remaining();
            match block.map_range(address, length) {
                Ok(()) => {
                    stats.blocks_reused += 1;
                    return Ok(id);
                }
                Err(e) => {
                    // The index already moved the block to `before - length`.
                    owned.update(block, before.saturating_sub(length));
                    if e.category() != ErrorCategory::Capacity {
                        return Err(e);
                    }
                    tracing::debug!("Block #{} rejected {} bytes: {}", id, length, e);
                }
            }
        }

        let capacity = length.max(self.config.min_block_size);
        let mut block = PhysicalBlock::create(self.driver.clone(), device, capacity)?;
        block.map_range(address, length)?;
        owned.add(&mut block)?;
        let id = arena.insert(block).map_err(|block| {
            VmmError::Inconsistent(format!("block #{} is already held", block.id()))
        })?;
        stats.blocks_created += 1;
        Ok(id)
    }

    /// Unmap an allocation made by [`alloc`](Self::alloc)
    ///
    /// `size` is rounded up to the device granularity and must match the mapped
    /// length. The virtual range stays reserved (and becomes reusable when
    /// address reuse is on); the block stays in its pool with the capacity
    /// freed up.
    ///
    /// # Errors
    /// - `UnknownAddress` / `MappingNotFound` when `strict_release` is on and
    ///   nothing is mapped at `(address, size)`
    /// - `Driver` if the unmap call fails
    pub fn dealloc(&self, address: DeviceAddress, size: usize, device: DeviceId) -> VmmResult<()> {
        let _span = tracing::debug_span!("dealloc", %address, size, device).entered();
        self.driver.ensure_context(device)?;
        let length = round_up(size, self.driver.granularity(device)?)?;

        let mut guard = self.lock()?;
        let state = &mut *guard;
        let Some(id) = state.allocations.get(&address).copied() else {
            return self.reject_release(VmmError::UnknownAddress(address));
        };

        let block = state.arena.get_mut(id).ok_or_else(|| {
            VmmError::Inconsistent(format!("{} maps to unknown block #{}", address, id))
        })?;
        let before = block.remaining();
        if let Err(e) = block.unmap_range(address, length) {
            return match e {
                VmmError::MappingNotFound { .. } => self.reject_release(e),
                other => Err(other),
            };
        }
        state.owned.update(block, before);
        state.stats.record_dealloc();

        if self.config.reuse_address_ranges {
            state.park_if_whole(address, length);
        }
        state.reclaim_if_retired(id);
        tracing::debug!("Released {} bytes at {} from block #{}", length, address, id);
        Ok(())
    }

    fn reject_release(&self, error: VmmError) -> VmmResult<()> {
        if self.config.strict_release {
            tracing::warn!("Rejected release: {}", error);
            Err(error)
        } else {
            tracing::warn!("Ignoring release: {}", error);
            Ok(())
        }
    }

    /// Reverse lookup of the block behind `address`
    ///
    /// With `remove`, the address entry is erased and the block leaves its pool.
    /// Such a block is destroyed as soon as it has no mappings left (immediately
    /// if it has none now).
    ///
    /// # Errors
    /// - `UnknownAddress` if nothing was ever mapped at `address`
    pub fn get_allocated_block(&self, address: DeviceAddress, remove: bool) -> VmmResult<BlockInfo> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let id = state
            .allocations
            .get(&address)
            .copied()
            .ok_or(VmmError::UnknownAddress(address))?;
        let info = BlockInfo::of(state.block(id)?);

        if remove {
            state.allocations.remove(&address);
            state.detach(id)?;
            state.retired.insert(id);
            state.reclaim_if_retired(id);
            tracing::debug!("Detached block #{} found at {}", id, address);
        }
        Ok(info)
    }

    /// Reserve virtual address space on `device` without backing it
    ///
    /// Returns the address and the reserved size (rounded up to granularity).
    pub fn reserve_virtual_address(
        &self,
        requested_size: usize,
        device: DeviceId,
    ) -> VmmResult<(DeviceAddress, usize)> {
        if requested_size == 0 {
            return Err(VmmError::InvalidArgument(
                "reservation size cannot be zero".to_string(),
            ));
        }
        self.driver.ensure_context(device)?;
        let granularity = self.driver.granularity(device)?;
        let size = round_up(requested_size, granularity)?;

        let mut state = self.lock()?;
        let address = self.driver.reserve_address(size, granularity)?;
        state.reservations.insert(address, Reservation { device, size });
        state.stats.ranges_reserved += 1;
        tracing::debug!("Reserved {} bytes at {} on device {}", size, address, device);
        Ok((address, size))
    }

    /// Map `size` bytes of a held block at `address`
    ///
    /// The range must lie inside a reservation made by this allocator.
    ///
    /// # Errors
    /// - `BlockNotFound` if the block is not held
    /// - `UnknownAddress` if the range is outside every reservation
    /// - any error of [`PhysicalBlock::map_range`]
    pub fn map_block(&self, block: BlockId, address: DeviceAddress, size: usize) -> VmmResult<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let device = state.block(block)?.device();
        self.driver.ensure_context(device)?;
        let length = round_up(size, self.driver.granularity(device)?)?;

        let Some((base, _)) = state.reservation_for(address, length) else {
            tracing::warn!("Refusing to map {}+{}: not inside a reservation", address, length);
            return Err(VmmError::UnknownAddress(address));
        };

        let held = state.arena.get_mut(block).ok_or(VmmError::BlockNotFound(block))?;
        let before = held.remaining();
        held.map_range(address, length)?;
        state.owned.update(held, before);

        state.forget_idle(base);
        state.allocations.insert(address, block);
        state.stats.record_alloc();
        Ok(())
    }

    /// Tear down everything mapped in the reservation at `address` and free it
    ///
    /// The reservation's tracked size is used; a different `size` is logged.
    ///
    /// # Errors
    /// - `UnknownAddress` if no reservation starts at `address`
    /// - `Driver` if an unmap or the address free fails
    pub fn unmap_range(&self, device: DeviceId, size: usize, address: DeviceAddress) -> VmmResult<()> {
        self.driver.ensure_context(device)?;
        let requested = round_up(size, self.driver.granularity(device)?)?;

        let mut guard = self.lock()?;
        let state = &mut *guard;
        let reservation = state
            .reservations
            .get(&address)
            .copied()
            .ok_or(VmmError::UnknownAddress(address))?;
        if requested != reservation.size {
            tracing::warn!(
                "unmap_range({}): {} bytes requested, reservation is {} bytes",
                address,
                requested,
                reservation.size
            );
        }

        let mut touched = Vec::new();
        let mut result = Ok(());
        for id in state.arena.ids() {
            let Some(block) = state.arena.get_mut(id) else {
                continue;
            };
            let inside: Vec<(DeviceAddress, usize)> = block
                .mappings()
                .filter(|(a, r)| a.within(r.length, address, reservation.size))
                .map(|(a, r)| (a, r.length))
                .collect();
            if inside.is_empty() {
                continue;
            }

            let before = block.remaining();
            for (mapped_at, length) in inside {
                match block.unmap_range(mapped_at, length) {
                    Ok(()) => state.stats.record_dealloc(),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            state.owned.update(block, before);
            touched.push(id);
            if result.is_err() {
                break;
            }
        }

        if result.is_ok() {
            let end = address.offset(reservation.size);
            let stale: Vec<_> = state
                .allocations
                .range(address..end)
                .map(|(a, _)| *a)
                .collect();
            for a in stale {
                state.allocations.remove(&a);
            }
            state.forget_idle(address);
            result = self.driver.free_address(address, reservation.size);
            if result.is_ok() {
                state.reservations.remove(&address);
                state.stats.ranges_freed += 1;
                tracing::debug!("Freed range {} ({} bytes)", address, reservation.size);
            }
        }

        for id in touched {
            state.reclaim_if_retired(id);
        }
        result
    }

    /// Adopt an externally created block into the shared or exclusive registry
    ///
    /// On rejection the block is handed back inside the error.
    pub fn register_block(
        &self,
        block: PhysicalBlock,
        class: AccessClass,
    ) -> Result<BlockId, AdoptError> {
        let mut block = block;
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(e) => {
                return Err(AdoptError {
                    error: e.into(),
                    block,
                })
            }
        };
        let state = &mut *guard;

        if block.is_destroyed() {
            let error = VmmError::InvalidArgument(format!("block #{} has been destroyed", block.id()));
            return Err(AdoptError { error, block });
        }
        if state.arena.contains(block.id()) {
            let error = VmmError::Inconsistent(format!("block #{} is already held", block.id()));
            return Err(AdoptError { error, block });
        }

        let role = PoolRole::from(class);
        let added = match class {
            AccessClass::Shared => state.shared.add(&mut block),
            AccessClass::Exclusive => state.exclusive.add(&mut block),
        };
        if let Err(error) = added {
            return Err(AdoptError { error, block });
        }

        let id = block.id();
        if let Err(mut block) = state.arena.insert(block) {
            let _ = state.detach_unheld(&mut block, role);
            let error = VmmError::Inconsistent(format!("block #{} is already held", id));
            return Err(AdoptError { error, block });
        }
        tracing::debug!("Registered block #{} in the {} registry", id, role);
        Ok(id)
    }

    /// Detach a held block from its pool, leaving it held but unowned
    ///
    /// A no-op for blocks without an owner.
    pub fn release_ownership(&self, block: BlockId) -> VmmResult<()> {
        let mut state = self.lock()?;
        state.detach(block)
    }

    /// Give an unowned held block to the pool for `role`
    ///
    /// # Errors
    /// - `AlreadyOwned` if the block still has an owner
    pub fn assign(&self, block: BlockId, role: PoolRole) -> VmmResult<()> {
        let mut state = self.lock()?;
        state.attach(block, role)?;
        state.retired.remove(&block);
        Ok(())
    }

    /// Move a held block to the pool for `role`
    ///
    /// The current owner is released first. If the new pool rejects the block it
    /// goes back to its previous owner.
    pub fn transfer_block(&self, block: BlockId, role: PoolRole) -> VmmResult<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let previous = state.block(block)?.owner();
        if previous == Some(role) {
            return Ok(());
        }

        state.detach(block)?;
        if let Err(e) = state.attach(block, role) {
            if let Some(previous) = previous {
                if let Err(restore) = state.attach(block, previous) {
                    tracing::error!(
                        "Block #{} lost its {} owner: {}",
                        block,
                        previous,
                        restore
                    );
                }
            }
            return Err(e);
        }
        state.retired.remove(&block);
        tracing::debug!(
            "Block #{} moved from {:?} to the {} pool",
            block,
            previous,
            role
        );
        Ok(())
    }

    /// Hand back a held block that has no owner and no mappings
    ///
    /// # Errors
    /// - `BlockBusy` if the block is owned or still mapped
    pub fn take_block(&self, block: BlockId) -> VmmResult<PhysicalBlock> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let held = state.block(block)?;
        if let Some(owner) = held.owner() {
            return Err(VmmError::BlockBusy {
                block,
                reason: format!("owned by the {} pool", owner),
            });
        }
        if held.has_mappings() {
            return Err(VmmError::BlockBusy {
                block,
                reason: format!("{} live mapping(s)", held.mapping_count()),
            });
        }

        state.retired.remove(&block);
        state.allocations.retain(|_, id| *id != block);
        state.arena.remove(block).ok_or(VmmError::BlockNotFound(block))
    }

    pub fn block_info(&self, block: BlockId) -> VmmResult<BlockInfo> {
        let state = self.lock()?;
        state.block(block).map(BlockInfo::of)
    }

    /// Owned-pool capacity buckets, ascending
    pub fn capacity_index(&self) -> VmmResult<Vec<(usize, Vec<BlockId>)>> {
        let state = self.lock()?;
        Ok(state.owned.capacity_index().buckets())
    }

    /// Member ids of the pool for `role`, ascending
    pub fn pool_members(&self, role: PoolRole) -> VmmResult<Vec<BlockId>> {
        let state = self.lock()?;
        let members = match role {
            PoolRole::Owned => state.owned.members().collect(),
            PoolRole::Shared => state.shared.members().collect(),
            PoolRole::Exclusive => state.exclusive.members().collect(),
        };
        Ok(members)
    }

    /// Idle ranges as `(device, size, address)`
    pub fn idle_ranges(&self) -> VmmResult<Vec<(DeviceId, usize, DeviceAddress)>> {
        let state = self.lock()?;
        Ok(state
            .idle
            .iter()
            .flat_map(|((device, size), ranges)| {
                ranges.iter().map(move |a| (*device, *size, *a))
            })
            .collect())
    }

    pub fn stats(&self) -> VmmResult<AllocatorStats> {
        Ok(self.lock()?.snapshot())
    }

    /// Verify that every book the allocator keeps agrees with the others
    ///
    /// # Errors
    /// - `Inconsistent` describing the first disagreement found
    pub fn check_consistency(&self) -> VmmResult<()> {
        let state = self.lock()?;
        let fail = |msg: String| Err(VmmError::Inconsistent(msg));

        for block in state.arena.iter() {
            block.verify_accounting()?;
            if let Some(other) = block.allocator() {
                if other != self.id {
                    return fail(format!("block #{} is bound to {}", block.id(), other));
                }
            }
            let roles = [PoolRole::Owned, PoolRole::Shared, PoolRole::Exclusive];
            let containing: Vec<_> = roles
                .iter()
                .filter(|role| state.pool_contains(**role, block.id()))
                .copied()
                .collect();
            let expected: Vec<_> = block.owner().into_iter().collect();
            if containing != expected {
                return fail(format!(
                    "block #{} has owner {:?} but is a member of {:?}",
                    block.id(),
                    block.owner(),
                    containing
                ));
            }
        }

        let pools = [
            (PoolRole::Owned, state.owned.members().collect::<Vec<_>>()),
            (PoolRole::Shared, state.shared.members().collect()),
            (PoolRole::Exclusive, state.exclusive.members().collect()),
        ];
        for (role, members) in pools {
            for id in members {
                if !state.arena.contains(id) {
                    return fail(format!("{} pool member #{} is not held", role, id));
                }
            }
        }

        let index = state.owned.capacity_index();
        for id in state.owned.members() {
            let remaining = state.block(id)?.remaining();
            let expected = if remaining > 0 { vec![remaining] } else { Vec::new() };
            let positions = index.positions(id);
            if positions != expected {
                return fail(format!(
                    "block #{} with {} bytes remaining is indexed under {:?}",
                    id, remaining, positions
                ));
            }
        }
        for (capacity, ids) in index.buckets() {
            if ids.is_empty() {
                return fail(format!("empty bucket {}", capacity));
            }
            if let Some(id) = ids.iter().find(|id| !state.owned.contains(**id)) {
                return fail(format!("bucket {} indexes non-member #{}", capacity, id));
            }
        }

        for (address, id) in &state.allocations {
            if !state.arena.contains(*id) {
                return fail(format!("{} refers to released block #{}", address, id));
            }
        }

        for ((device, size), ranges) in &state.idle {
            for address in ranges {
                match state.reservations.get(address) {
                    Some(r) if r.device == *device && r.size == *size => {}
                    _ => return fail(format!("idle range {} is not a {}-byte reservation", address, size)),
                }
                if state.arena.iter().any(|b| {
                    b.mappings()
                        .any(|(a, m)| a.within(m.length, *address, *size))
                }) {
                    return fail(format!("idle range {} is still mapped", address));
                }
            }
        }

        Ok(())
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut failures = 0usize;

        for mut block in state.arena.drain() {
            let mappings: Vec<_> = block.mappings().map(|(a, r)| (a, r.length)).collect();
            for (address, length) in mappings {
                if let Err(e) = block.unmap_range(address, length) {
                    failures += 1;
                    tracing::error!("Teardown: unmap {} on block #{} failed: {}", address, block.id(), e);
                }
            }
            if let Err(e) = block.destroy() {
                failures += 1;
                tracing::error!("Teardown: release of block #{} failed: {}", block.id(), e);
            }
        }

        for (address, reservation) in std::mem::take(&mut state.reservations) {
            if let Err(e) = self.driver.free_address(address, reservation.size) {
                failures += 1;
                tracing::error!("Teardown: free of range {} failed: {}", address, e);
            }
        }

        if failures > 0 {
            tracing::warn!("{} released with {} driver failure(s)", self.id, failures);
        } else {
            tracing::debug!("{} released", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DriverOp, SimulatedDriver};
    use crate::config::FitPolicy;

    const G: usize = 64 * 1024;

    fn setup(config: AllocatorConfig) -> (Arc<SimulatedDriver>, DeviceAllocator) {
        let sim = Arc::new(SimulatedDriver::with_granularity(G));
        let allocator = DeviceAllocator::with_config(sim.clone(), config).unwrap();
        (sim, allocator)
    }

    #[test]
    fn test_alloc_zero_rejected() {
        let (sim, allocator) = setup(AllocatorConfig::default());
        assert!(matches!(allocator.alloc(0, 0), Err(VmmError::InvalidArgument(_))));
        assert_eq!(sim.counters().reserve_calls, 0);
    }

    #[test]
    fn test_alloc_rounds_and_activates_context() {
        let (sim, allocator) = setup(AllocatorConfig::default());
        let ptr = allocator.alloc(100, 0).unwrap();

        assert!(sim.is_context_active(0));
        assert_eq!(sim.mapping_at(ptr).unwrap().size, G);
        let info = allocator.get_allocated_block(ptr, false).unwrap();
        assert_eq!(info.capacity, G);
        assert_eq!(info.remaining, 0);
        assert_eq!(info.owner, Some(PoolRole::Owned));
        allocator.check_consistency().unwrap();
    }

    #[test]
    fn test_alloc_unknown_device() {
        let (_sim, allocator) = setup(AllocatorConfig::default());
        assert!(matches!(allocator.alloc(G, 3), Err(VmmError::DeviceNotFound(3))));
    }

    #[test]
    fn test_reserve_failure_propagates() {
        let (sim, allocator) = setup(AllocatorConfig::default());
        sim.fail_next(DriverOp::Reserve);
        let err = allocator.alloc(G, 0).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Driver);
        assert_eq!(sim.live_handles(), 0);
        allocator.check_consistency().unwrap();
    }

    #[test]
    fn test_create_failure_parks_range() {
        let (sim, allocator) = setup(AllocatorConfig::default());
        sim.fail_next(DriverOp::Create);
        assert!(allocator.alloc(G, 0).is_err());
        assert_eq!(allocator.idle_ranges().unwrap().len(), 1);

        // The parked range serves the retry.
        let ptr = allocator.alloc(G, 0).unwrap();
        assert_eq!(sim.counters().reserve_calls, 1);
        assert!(sim.mapping_at(ptr).is_some());
        allocator.check_consistency().unwrap();
    }

    #[test]
    fn test_create_failure_frees_range_without_reuse() {
        let (sim, allocator) =
            setup(AllocatorConfig::default().with_reuse_address_ranges(false));
        sim.fail_next(DriverOp::Create);
        assert!(allocator.alloc(G, 0).is_err());
        assert_eq!(sim.reservation_count(), 0);
        assert!(allocator.idle_ranges().unwrap().is_empty());
    }

    #[test]
    fn test_map_failure_on_existing_block_restores_index() {
        let (sim, allocator) =
            setup(AllocatorConfig::default().with_min_block_size(4 * G));
        let _first = allocator.alloc(G, 0).unwrap();
        let before = allocator.capacity_index().unwrap();

        sim.fail_next(DriverOp::Map);
        assert!(allocator.alloc(G, 0).is_err());
        assert_eq!(allocator.capacity_index().unwrap(), before);
        allocator.check_consistency().unwrap();
    }

    #[test]
    fn test_exact_policy_fills_block() {
        let (_sim, allocator) = setup(
            AllocatorConfig::default()
                .with_min_block_size(2 * G)
                .with_fit_policy(FitPolicy::AllowExact),
        );
        let a = allocator.alloc(G, 0).unwrap();
        let b = allocator.alloc(G, 0).unwrap();
        let block_a = allocator.get_allocated_block(a, false).unwrap();
        let block_b = allocator.get_allocated_block(b, false).unwrap();
        assert_eq!(block_a.id, block_b.id);
        assert_eq!(block_b.remaining, 0);
        assert!(allocator.capacity_index().unwrap().is_empty());
    }

    #[test]
    fn test_stats_track_lifecycle() {
        let (_sim, allocator) = setup(AllocatorConfig::default().with_min_block_size(4 * G));
        let a = allocator.alloc(G, 0).unwrap();
        let _b = allocator.alloc(G, 0).unwrap();
        allocator.dealloc(a, G, 0).unwrap();

        let stats = allocator.stats().unwrap();
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_deallocations, 1);
        assert_eq!(stats.live_allocations, 1);
        assert_eq!(stats.peak_allocations, 2);
        assert_eq!(stats.blocks_created, 1);
        assert_eq!(stats.blocks_reused, 1);
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.total_capacity, 4 * G);
        assert_eq!(stats.mapped_bytes, G);
        assert_eq!(stats.idle_ranges, 1);
        assert_eq!(stats.utilization(), 0.25);
    }

    #[test]
    fn test_drop_releases_everything() {
        let sim = Arc::new(SimulatedDriver::with_granularity(G));
        {
            let allocator = DeviceAllocator::new(sim.clone());
            let _a = allocator.alloc(G, 0).unwrap();
            let b = allocator.alloc(3 * G, 0).unwrap();
            allocator.dealloc(b, 3 * G, 0).unwrap();
            let (_r, _) = allocator.reserve_virtual_address(G, 0).unwrap();
        }
        assert_eq!(sim.live_handles(), 0);
        assert_eq!(sim.live_mappings(), 0);
        assert_eq!(sim.reservation_count(), 0);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_capacity_conservation_properties(
            ops in prop::collection::vec((any::<bool>(), 1usize..8, any::<prop::sample::Index>()), 1..60),
            exact in any::<bool>()
        ) {
            let policy = if exact { FitPolicy::AllowExact } else { FitPolicy::StrictlyLarger };
            let (sim, allocator) = setup(
                AllocatorConfig::default()
                    .with_min_block_size(8 * G)
                    .with_fit_policy(policy),
            );
            let mut live: Vec<(DeviceAddress, usize)> = Vec::new();

            for (is_alloc, granules, pick) in ops {
                if is_alloc || live.is_empty() {
                    let size = granules * G;
                    let ptr = allocator.alloc(size, 0).unwrap();
                    live.push((ptr, size));
                } else {
                    let (ptr, size) = live.swap_remove(pick.index(live.len()));
                    allocator.dealloc(ptr, size, 0).unwrap();
                }

                let stats = allocator.stats().unwrap();
                let expected: usize = live.iter().map(|(_, size)| size).sum();
                prop_assert_eq!(stats.mapped_bytes, expected);
                prop_assert_eq!(stats.live_allocations, live.len());
                prop_assert_eq!(sim.live_mappings(), live.len());
                prop_assert!(!sim.has_physical_aliasing());
                prop_assert!(allocator.check_consistency().is_ok());
            }
        }
    }
}
