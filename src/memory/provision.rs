//! Bulk pre-provisioning of equally sized blocks
//!
//! Creating physical memory is the expensive part of an allocation. A
//! `BlockReserve` creates a batch of blocks up front; callers take them one at a
//! time (typically handing them to [`DeviceAllocator::register_block`]).
//!
//! [`DeviceAllocator::register_block`]: super::DeviceAllocator::register_block

use std::sync::Arc;

use super::block::PhysicalBlock;
use crate::backend::{DeviceId, VmmDriver};
use crate::error::VmmResult;

/// Pre-provisioned blocks, handed out newest first
#[derive(Debug)]
pub struct BlockReserve {
    device: DeviceId,
    block_size: usize,
    blocks: Vec<PhysicalBlock>,
}

impl BlockReserve {
    /// Create `count` blocks of `block_size` bytes on `device`
    ///
    /// # Errors
    /// Returns the first creation failure; blocks created before it are
    /// destroyed again.
    pub fn provision(
        driver: Arc<dyn VmmDriver>,
        device: DeviceId,
        count: usize,
        block_size: usize,
    ) -> VmmResult<Self> {
        driver.ensure_context(device)?;

        let mut reserve = BlockReserve {
            device,
            block_size,
            blocks: Vec::with_capacity(count),
        };
        for _ in 0..count {
            match PhysicalBlock::create(driver.clone(), device, block_size) {
                Ok(block) => reserve.blocks.push(block),
                Err(e) => {
                    tracing::warn!(
                        "Provisioning failed after {} of {} blocks: {}",
                        reserve.blocks.len(),
                        count,
                        e
                    );
                    if let Err(cleanup) = reserve.release() {
                        tracing::error!("Cleanup after failed provisioning: {}", cleanup);
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "Provisioned {} block(s) of {} bytes on device {}",
            count,
            block_size,
            device
        );
        Ok(reserve)
    }

    /// Most recently provisioned block not yet taken
    pub fn take(&mut self) -> Option<PhysicalBlock> {
        self.blocks.pop()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Requested size of each block (capacity may be rounded up)
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Destroy every block still held, newest first
    ///
    /// All blocks are attempted; the first failure is returned.
    pub fn release(&mut self) -> VmmResult<()> {
        let mut first_error = None;
        while let Some(mut block) = self.blocks.pop() {
            if let Err(e) = block.destroy() {
                tracing::error!("Failed to release provisioned block #{}: {}", block.id(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for BlockReserve {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("BlockReserve drop: {}", e);
        }
    }
}
