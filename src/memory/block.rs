//! Physical blocks: fixed-size GPU allocations mapped into virtual ranges

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::allocator::AllocatorId;
use super::extents::ExtentList;
use super::pool::PoolRole;
use crate::backend::{round_up, DeviceAddress, DeviceId, PhysicalHandle, VmmDriver};
use crate::error::{VmmError, VmmResult};

/// Block identifier, unique per process
pub type BlockId = u64;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// One virtual range backed by a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// Length in bytes
    pub length: usize,
    /// Offset of the backing bytes inside the physical allocation
    pub physical_offset: usize,
}

/// A physical allocation on one device
///
/// Disjoint virtual ranges can be mapped onto a block until its capacity is used
/// up. Every mapping gets its own physical bytes, so two live ranges never alias.
///
/// The physical handle is released by [`destroy`](PhysicalBlock::destroy), or on
/// drop if the block was never destroyed explicitly.
pub struct PhysicalBlock {
    id: BlockId,
    device: DeviceId,
    capacity: usize,
    remaining: usize,
    handle: Option<PhysicalHandle>,
    mapped: BTreeMap<DeviceAddress, MappedRange>,
    extents: ExtentList,
    allocator: Option<AllocatorId>,
    owner: Option<PoolRole>,
    driver: Arc<dyn VmmDriver>,
}

impl PhysicalBlock {
    /// Allocate a block of at least `requested_size` bytes on `device`
    ///
    /// The capacity is rounded up to the device allocation granularity.
    ///
    /// # Errors
    /// - `InvalidArgument` if `requested_size` is zero
    /// - `Driver` if the granularity query or the physical allocation fails
    pub fn create(
        driver: Arc<dyn VmmDriver>,
        device: DeviceId,
        requested_size: usize,
    ) -> VmmResult<Self> {
        if requested_size == 0 {
            return Err(VmmError::InvalidArgument(
                "block size cannot be zero".to_string(),
            ));
        }

        let granularity = driver.granularity(device)?;
        let capacity = round_up(requested_size, granularity)?;
        let handle = driver.create_physical(device, capacity)?;
        let id = NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            "Created block #{} on device {}: {} bytes (requested {})",
            id,
            device,
            capacity,
            requested_size
        );

        Ok(PhysicalBlock {
            id,
            device,
            capacity,
            remaining: capacity,
            handle: Some(handle),
            mapped: BTreeMap::new(),
            extents: ExtentList::new(capacity),
            allocator: None,
            owner: None,
            driver,
        })
    }

    /// Map `length` bytes of this block at `address`
    ///
    /// The range is mapped, then made readable and writable for the block's
    /// device. On any failure the block is left as it was.
    ///
    /// # Errors
    /// - `InsufficientCapacity` if fewer than `length` bytes remain
    /// - `DuplicateMapping` if a range already starts at `address`
    /// - `Fragmented` if no contiguous physical extent of `length` bytes is free
    /// - `Driver` if mapping or granting access fails
    pub fn map_range(&mut self, address: DeviceAddress, length: usize) -> VmmResult<()> {
        if length == 0 {
            return Err(VmmError::InvalidArgument(
                "mapping length cannot be zero".to_string(),
            ));
        }
        let handle = self.live_handle()?;
        if self.remaining < length {
            return Err(VmmError::InsufficientCapacity {
                block: self.id,
                requested: length,
                remaining: self.remaining,
            });
        }
        if self.mapped.contains_key(&address) {
            return Err(VmmError::DuplicateMapping {
                block: self.id,
                address,
            });
        }

        let physical_offset = match self.extents.reserve(length) {
            Some(offset) => offset,
            None => {
                return Err(VmmError::Fragmented {
                    block: self.id,
                    requested: length,
                    largest: self.extents.largest(),
                })
            }
        };

        if let Err(e) = self.driver.map(address, length, physical_offset, handle) {
            self.extents.release(physical_offset, length);
            return Err(e);
        }
        if let Err(e) = self.driver.set_access(address, length, self.device) {
            if let Err(unmap_err) = self.driver.unmap(address, length) {
                tracing::error!(
                    "Block #{}: rollback unmap at {} failed: {}",
                    self.id,
                    address,
                    unmap_err
                );
            }
            self.extents.release(physical_offset, length);
            return Err(e);
        }

        self.remaining -= length;
        self.mapped.insert(
            address,
            MappedRange {
                length,
                physical_offset,
            },
        );
        tracing::debug!(
            "Block #{}: mapped {} bytes at {} (physical offset {}, {} remaining)",
            self.id,
            length,
            address,
            physical_offset,
            self.remaining
        );
        Ok(())
    }

    /// Unmap the range recorded at exactly `(address, length)`
    ///
    /// # Errors
    /// - `MappingNotFound` if no mapping matches both address and length
    /// - `Driver` if the unmap call fails (the mapping stays recorded)
    pub fn unmap_range(&mut self, address: DeviceAddress, length: usize) -> VmmResult<()> {
        let range = match self.mapped.get(&address) {
            Some(range) if range.length == length => *range,
            _ => {
                return Err(VmmError::MappingNotFound {
                    block: self.id,
                    address,
                    length,
                })
            }
        };

        self.driver.unmap(address, length)?;

        self.mapped.remove(&address);
        if !self.extents.release(range.physical_offset, length) {
            tracing::warn!(
                "Block #{}: physical extent {}+{} was already free",
                self.id,
                range.physical_offset,
                length
            );
        }
        self.remaining += length;
        tracing::debug!(
            "Block #{}: unmapped {} bytes at {} ({} remaining)",
            self.id,
            length,
            address,
            self.remaining
        );
        Ok(())
    }

    /// Release the physical handle
    ///
    /// Ranges still mapped are not torn down; the driver keeps their memory
    /// alive until they are unmapped. Destroying twice is a no-op.
    pub fn destroy(&mut self) -> VmmResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if !self.mapped.is_empty() {
            tracing::warn!(
                "Destroying block #{} with {} live mapping(s)",
                self.id,
                self.mapped.len()
            );
        }
        self.driver.release_physical(handle)?;
        tracing::debug!("Destroyed block #{} ({} bytes)", self.id, self.capacity);
        Ok(())
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Total capacity in bytes (a multiple of the device granularity)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unmapped capacity in bytes
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mapped.values().map(|r| r.length).sum()
    }

    pub fn mapping_count(&self) -> usize {
        self.mapped.len()
    }

    pub fn has_mappings(&self) -> bool {
        !self.mapped.is_empty()
    }

    pub fn mapping(&self, address: DeviceAddress) -> Option<MappedRange> {
        self.mapped.get(&address).copied()
    }

    /// Live mappings ordered by virtual address
    pub fn mappings(&self) -> impl Iterator<Item = (DeviceAddress, MappedRange)> + '_ {
        self.mapped.iter().map(|(addr, range)| (*addr, *range))
    }

    /// Largest contiguous unmapped physical extent
    pub fn largest_free_extent(&self) -> usize {
        self.extents.largest()
    }

    /// Fragmentation of the unmapped physical space (0.0 = contiguous)
    pub fn fragmentation(&self) -> f32 {
        self.extents.fragmentation()
    }

    pub fn handle(&self) -> Option<PhysicalHandle> {
        self.handle
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.is_none()
    }

    /// Pool currently owning this block
    pub fn owner(&self) -> Option<PoolRole> {
        self.owner
    }

    /// Allocator this block was first added to
    pub fn allocator(&self) -> Option<AllocatorId> {
        self.allocator
    }

    /// Check `remaining = capacity - sum(mapped lengths)` and the extent books
    pub fn verify_accounting(&self) -> VmmResult<()> {
        let mapped = self.mapped_bytes();
        if self.remaining + mapped != self.capacity {
            return Err(VmmError::Inconsistent(format!(
                "block #{}: remaining {} + mapped {} != capacity {}",
                self.id, self.remaining, mapped, self.capacity
            )));
        }
        if self.extents.free_bytes() != self.remaining {
            return Err(VmmError::Inconsistent(format!(
                "block #{}: free extents hold {} bytes, remaining is {}",
                self.id,
                self.extents.free_bytes(),
                self.remaining
            )));
        }
        Ok(())
    }

    pub(crate) fn bind(&mut self, allocator: AllocatorId, role: PoolRole) {
        self.allocator = Some(allocator);
        self.owner = Some(role);
    }

    pub(crate) fn unbind(&mut self) {
        self.owner = None;
    }

    fn live_handle(&self) -> VmmResult<PhysicalHandle> {
        self.handle.ok_or_else(|| {
            VmmError::InvalidArgument(format!("block #{} has been destroyed", self.id))
        })
    }
}

impl fmt::Debug for PhysicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalBlock")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("capacity", &self.capacity)
            .field("remaining", &self.remaining)
            .field("mappings", &self.mapped.len())
            .field("owner", &self.owner)
            .field("destroyed", &self.handle.is_none())
            .finish()
    }
}

impl Drop for PhysicalBlock {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::error!("Failed to release block #{} on drop: {}", self.id, e);
        }
    }
}
