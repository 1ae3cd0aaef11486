//! Id-indexed storage for the blocks an allocator knows about
//!
//! Pools refer to blocks by id only. The arena is the single place a block
//! lives while the allocator holds it, whichever pool (if any) owns it.

use std::collections::HashMap;

use super::block::{BlockId, PhysicalBlock};

/// Every block an allocator holds, keyed by id
#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: HashMap<BlockId, PhysicalBlock>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block; returns the block back if its id is already present
    pub fn insert(&mut self, block: PhysicalBlock) -> Result<BlockId, PhysicalBlock> {
        let id = block.id();
        if self.blocks.contains_key(&id) {
            return Err(block);
        }
        self.blocks.insert(id, block);
        Ok(id)
    }

    pub fn get(&self, id: BlockId) -> Option<&PhysicalBlock> {
        self.blocks.get(&id)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut PhysicalBlock> {
        self.blocks.get_mut(&id)
    }

    pub fn remove(&mut self, id: BlockId) -> Option<PhysicalBlock> {
        self.blocks.remove(&id)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block ids in ascending order
    pub fn ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<_> = self.blocks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhysicalBlock> {
        self.blocks.values()
    }

    /// Remove every block, in ascending id order
    pub fn drain(&mut self) -> Vec<PhysicalBlock> {
        let mut blocks: Vec<_> = self.blocks.drain().map(|(_, b)| b).collect();
        blocks.sort_unstable_by_key(|b| b.id());
        blocks
    }

    /// Sum of block capacities in bytes
    pub fn total_capacity(&self) -> usize {
        self.blocks.values().map(|b| b.capacity()).sum()
    }

    /// Bytes currently mapped across all blocks
    pub fn mapped_bytes(&self) -> usize {
        self.blocks.values().map(|b| b.mapped_bytes()).sum()
    }

    /// Unmapped bytes across all blocks
    pub fn remaining_capacity(&self) -> usize {
        self.blocks.values().map(|b| b.remaining()).sum()
    }

    /// Calculate fragmentation ratio (0.0 = none, 1.0 = fully fragmented)
    ///
    /// Compares the largest single unmapped extent against all unmapped bytes.
    /// A request larger than the largest extent needs a new block even when the
    /// total would suffice.
    pub fn fragmentation(&self) -> f32 {
        let free = self.remaining_capacity();
        if free == 0 {
            return 0.0;
        }
        let largest = self
            .blocks
            .values()
            .map(|b| b.largest_free_extent())
            .max()
            .unwrap_or(0);
        1.0 - (largest as f32 / free as f32)
    }
}
