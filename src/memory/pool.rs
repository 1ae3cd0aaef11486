//! Block pools: membership registries and the capacity-indexed owned pool
//!
//! Both pool kinds share one implementation, [`BlockPool`], parameterised by a
//! [`PoolIndex`]. A pool stores block ids only; the blocks themselves live in the
//! allocator's [`BlockArena`](super::BlockArena) and are passed in by reference.
//!
//! Adding a block binds it to the pool (`owner`) and to the pool's allocator. A
//! block can be owned by one pool at a time and can never move to a different
//! allocator.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::allocator::AllocatorId;
use super::block::{BlockId, PhysicalBlock};
use crate::config::FitPolicy;
use crate::error::{VmmError, VmmResult};

/// Which pool owns a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolRole {
    /// Registry for blocks shared between tensors
    Shared,
    /// Registry for blocks dedicated to one tensor
    Exclusive,
    /// Capacity-indexed pool used by `alloc`
    Owned,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRole::Shared => write!(f, "shared"),
            PoolRole::Exclusive => write!(f, "exclusive"),
            PoolRole::Owned => write!(f, "owned"),
        }
    }
}

/// Secondary index a pool keeps over its members
pub trait PoolIndex: fmt::Debug + Send {
    /// A member was added with `remaining` unmapped bytes
    fn insert(&mut self, id: BlockId, remaining: usize);

    /// A member with `remaining` unmapped bytes left the pool
    fn remove(&mut self, id: BlockId, remaining: usize);

    /// A member's remaining capacity changed from `previous` to `current`
    fn update(&mut self, id: BlockId, previous: usize, current: usize);
}

/// Membership only; nothing to index
#[derive(Debug, Default, Clone, Copy)]
pub struct Membership;

impl PoolIndex for Membership {
    fn insert(&mut self, _id: BlockId, _remaining: usize) {}
    fn remove(&mut self, _id: BlockId, _remaining: usize) {}
    fn update(&mut self, _id: BlockId, _previous: usize, _current: usize) {}
}

/// Remaining capacity -> block ids, most recently indexed last
///
/// Blocks with nothing left are not indexed and empty buckets are dropped, so
/// every key present can satisfy a request of up to its size.
#[derive(Debug, Default, Clone)]
pub struct CapacityIndex {
    buckets: BTreeMap<usize, Vec<BlockId>>,
    policy: FitPolicy,
}

impl CapacityIndex {
    pub fn new(policy: FitPolicy) -> Self {
        CapacityIndex {
            buckets: BTreeMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> FitPolicy {
        self.policy
    }

    /// Bucket contents in ascending capacity order
    pub fn buckets(&self) -> Vec<(usize, Vec<BlockId>)> {
        self.buckets
            .iter()
            .map(|(capacity, ids)| (*capacity, ids.clone()))
            .collect()
    }

    pub fn bucket(&self, capacity: usize) -> Option<&[BlockId]> {
        self.buckets.get(&capacity).map(Vec::as_slice)
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Capacities under which `id` is indexed (one entry when consistent)
    pub fn positions(&self, id: BlockId) -> Vec<usize> {
        self.buckets
            .iter()
            .flat_map(|(capacity, ids)| ids.iter().filter(move |&&i| i == id).map(move |_| *capacity))
            .collect()
    }

    /// Pick a block for a `size`-byte request mapped as `length` bytes
    ///
    /// The fit policy compares bucket keys against the raw `size`; the block must
    /// also have room for the rounded `length`, and is re-indexed under
    /// `capacity - length` as if the mapping happened. Buckets are scanned in
    /// ascending order; inside a bucket the newest entry accepted by `accept` wins.
    fn take_best_fit<F>(
        &mut self,
        size: usize,
        length: usize,
        mut accept: F,
    ) -> Option<(BlockId, usize)>
    where
        F: FnMut(BlockId) -> bool,
    {
        let found = self
            .eligible(size)
            .filter(|(capacity, _)| **capacity >= length)
            .find_map(|(capacity, ids)| {
                ids.iter()
                    .rposition(|id| accept(*id))
                    .map(|pos| (*capacity, pos))
            });
        let (capacity, pos) = found?;

        let id = self.remove_at(capacity, pos);
        let left = capacity - length;
        if left > 0 {
            self.push(left, id);
        }
        tracing::trace!(
            "Best fit for {} bytes ({} mapped): block #{} from bucket {} (now {})",
            size,
            length,
            id,
            capacity,
            left
        );
        Some((id, capacity))
    }

    fn eligible(&self, size: usize) -> Box<dyn Iterator<Item = (&usize, &Vec<BlockId>)> + '_> {
        use std::ops::Bound::{Excluded, Included, Unbounded};
        match self.policy {
            FitPolicy::StrictlyLarger => Box::new(self.buckets.range((Excluded(size), Unbounded))),
            FitPolicy::AllowExact => Box::new(self.buckets.range((Included(size), Unbounded))),
        }
    }

    fn push(&mut self, capacity: usize, id: BlockId) {
        if capacity > 0 {
            self.buckets.entry(capacity).or_default().push(id);
        }
    }

    fn remove_at(&mut self, capacity: usize, pos: usize) -> BlockId {
        let mut id = 0;
        if let Some(ids) = self.buckets.get_mut(&capacity) {
            id = ids.remove(pos);
            if ids.is_empty() {
                self.buckets.remove(&capacity);
            }
        }
        id
    }

    /// Drop `id` from the bucket for `capacity`; returns whether it was there
    fn erase(&mut self, capacity: usize, id: BlockId) -> bool {
        let pos = self
            .buckets
            .get(&capacity)
            .and_then(|ids| ids.iter().rposition(|i| *i == id));
        match pos {
            Some(pos) => {
                self.remove_at(capacity, pos);
                true
            }
            None => false,
        }
    }

    fn erase_everywhere(&mut self, id: BlockId) {
        for capacity in self.positions(id) {
            self.erase(capacity, id);
        }
    }
}

impl PoolIndex for CapacityIndex {
    fn insert(&mut self, id: BlockId, remaining: usize) {
        self.push(remaining, id);
    }

    fn remove(&mut self, id: BlockId, remaining: usize) {
        if !self.erase(remaining, id) {
            // Stale entry somewhere else; never leave a removed block indexed.
            self.erase_everywhere(id);
        }
    }

    fn update(&mut self, id: BlockId, previous: usize, current: usize) {
        self.erase(previous, id);
        self.erase(current, id);
        self.push(current, id);
        tracing::trace!("Block #{} re-indexed: {} -> {}", id, previous, current);
    }
}

/// A set of blocks owned by one pool of one allocator
#[derive(Debug)]
pub struct BlockPool<I: PoolIndex> {
    role: PoolRole,
    allocator: AllocatorId,
    members: BTreeSet<BlockId>,
    index: I,
}

/// Non-owning membership registry (shared / exclusive blocks)
pub type BlockRegistry = BlockPool<Membership>;

/// Pool owning the blocks `alloc` draws from, with the capacity index
pub type OwnedBlockPool = BlockPool<CapacityIndex>;

impl BlockRegistry {
    pub fn registry(role: PoolRole, allocator: AllocatorId) -> Self {
        BlockPool::with_index(role, allocator, Membership)
    }
}

impl OwnedBlockPool {
    pub fn owned(allocator: AllocatorId, policy: FitPolicy) -> Self {
        BlockPool::with_index(PoolRole::Owned, allocator, CapacityIndex::new(policy))
    }

    /// Best-fit block for `size` bytes
    ///
    /// The chosen block is re-indexed under `capacity - size` before it is
    /// returned, anticipating the mapping the caller is about to make. If that
    /// mapping does not happen, the caller must [`update`](Self::update) the
    /// block with `capacity - size` as the previous value.
    pub fn find_available(&mut self, size: usize) -> Option<BlockId> {
        self.find_available_where(size, |_| true)
    }

    /// [`find_available`](Self::find_available) restricted to blocks `accept` allows
    pub fn find_available_where<F>(&mut self, size: usize, accept: F) -> Option<BlockId>
    where
        F: FnMut(BlockId) -> bool,
    {
        self.find_mapping_where(size, size, accept)
    }

    /// Best-fit block for a `size`-byte request that will map `length` bytes
    ///
    /// `length` is `size` rounded up to the device granularity. The fit policy
    /// applies to `size`, so a block whose remaining capacity equals the rounded
    /// length still serves a smaller unaligned request under the strict policy.
    /// The block is re-indexed under `capacity - length`.
    pub fn find_mapping_where<F>(
        &mut self,
        size: usize,
        length: usize,
        accept: F,
    ) -> Option<BlockId>
    where
        F: FnMut(BlockId) -> bool,
    {
        if size == 0 || length < size {
            return None;
        }
        self.index.take_best_fit(size, length, accept).map(|(id, _)| id)
    }

    pub fn capacity_index(&self) -> &CapacityIndex {
        &self.index
    }
}

impl<I: PoolIndex> BlockPool<I> {
    pub fn with_index(role: PoolRole, allocator: AllocatorId, index: I) -> Self {
        BlockPool {
            role,
            allocator,
            members: BTreeSet::new(),
            index,
        }
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    pub fn allocator(&self) -> AllocatorId {
        self.allocator
    }

    /// Take ownership of `block`
    ///
    /// # Errors
    /// - `AlreadyOwned` if another pool (or this one) owns the block
    /// - `ForeignBlock` if the block is bound to a different allocator
    ///
    /// On error neither the pool nor the block changes.
    pub fn add(&mut self, block: &mut PhysicalBlock) -> VmmResult<()> {
        if let Some(owner) = block.owner() {
            tracing::warn!(
                "Rejected block #{} for the {} pool: already owned by the {} pool",
                block.id(),
                self.role,
                owner
            );
            return Err(VmmError::AlreadyOwned {
                block: block.id(),
                owner,
            });
        }
        if let Some(other) = block.allocator() {
            if other != self.allocator {
                tracing::warn!(
                    "Rejected block #{} for the {} pool: bound to {}",
                    block.id(),
                    self.role,
                    other
                );
                return Err(VmmError::ForeignBlock { block: block.id() });
            }
        }

        block.bind(self.allocator, self.role);
        self.members.insert(block.id());
        self.index.insert(block.id(), block.remaining());
        tracing::debug!(
            "Block #{} joined the {} pool ({} bytes remaining)",
            block.id(),
            self.role,
            block.remaining()
        );
        Ok(())
    }

    /// Give up ownership of `block`
    ///
    /// # Errors
    /// - `NotMember` if the block is not in this pool
    pub fn remove(&mut self, block: &mut PhysicalBlock) -> VmmResult<()> {
        if !self.members.remove(&block.id()) {
            return Err(VmmError::NotMember {
                block: block.id(),
                pool: self.role,
            });
        }
        self.index.remove(block.id(), block.remaining());
        block.unbind();
        tracing::debug!("Block #{} left the {} pool", block.id(), self.role);
        Ok(())
    }

    /// Re-index a member whose remaining capacity was `previous_remaining`
    ///
    /// No-op for blocks that are not members.
    pub fn update(&mut self, block: &PhysicalBlock, previous_remaining: usize) {
        if self.members.contains(&block.id()) {
            self.index
                .update(block.id(), previous_remaining, block.remaining());
        }
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.members.contains(&id)
    }

    /// Member ids in ascending order
    pub fn members(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.members.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedDriver, VmmDriver};
    use std::sync::Arc;

    const K: usize = 1024;

    fn driver() -> Arc<dyn VmmDriver> {
        Arc::new(SimulatedDriver::with_granularity(4 * K))
    }

    #[test]
    fn test_pool_role_display() {
        assert_eq!(PoolRole::Shared.to_string(), "shared");
        assert_eq!(PoolRole::Exclusive.to_string(), "exclusive");
        assert_eq!(PoolRole::Owned.to_string(), "owned");
    }

    #[test]
    fn test_capacity_index_lifo_within_bucket() {
        let mut index = CapacityIndex::new(FitPolicy::StrictlyLarger);
        index.insert(1, 100);
        index.insert(2, 100);
        index.insert(3, 100);
        assert_eq!(index.take_best_fit(40, 40, |_| true), Some((3, 100)));
        assert_eq!(index.bucket(100), Some(&[1, 2][..]));
        assert_eq!(index.bucket(60), Some(&[3][..]));
    }

    #[test]
    fn test_capacity_index_filter_skips_rejected() {
        let mut index = CapacityIndex::new(FitPolicy::StrictlyLarger);
        index.insert(1, 100);
        index.insert(2, 200);
        assert_eq!(index.take_best_fit(50, 50, |id| id == 2), Some((2, 200)));
        assert_eq!(index.take_best_fit(50, 50, |_| false), None);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_capacity_index_exact_leaves_nothing_indexed() {
        let mut index = CapacityIndex::new(FitPolicy::AllowExact);
        index.insert(9, 100);
        assert_eq!(index.take_best_fit(100, 100, |_| true), Some((9, 100)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_capacity_index_strict_policy_uses_raw_size() {
        let mut index = CapacityIndex::new(FitPolicy::StrictlyLarger);
        index.insert(4, 64);
        // 10 bytes rounded to 64: the 64-byte block is strictly larger than the request
        assert_eq!(index.take_best_fit(10, 64, |_| true), Some((4, 64)));
        assert!(index.is_empty());

        index.insert(4, 64);
        assert_eq!(index.take_best_fit(64, 64, |_| true), None);
        // Room for the request but not for its rounded length
        assert_eq!(index.take_best_fit(10, 128, |_| true), None);
        assert_eq!(index.positions(4), vec![64]);
    }

    #[test]
    fn test_capacity_index_update_dedupes() {
        let mut index = CapacityIndex::new(FitPolicy::StrictlyLarger);
        index.insert(5, 100);
        index.update(5, 100, 40);
        index.update(5, 100, 40);
        assert_eq!(index.positions(5), vec![40]);
        index.update(5, 40, 0);
        assert!(index.positions(5).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_add_binds_and_indexes() {
        let d = driver();
        let mut pool = OwnedBlockPool::owned(AllocatorId::next(), FitPolicy::StrictlyLarger);
        let mut block = PhysicalBlock::create(d, 0, 64 * K).unwrap();

        pool.add(&mut block).unwrap();
        assert_eq!(block.owner(), Some(PoolRole::Owned));
        assert_eq!(block.allocator(), Some(pool.allocator()));
        assert!(pool.contains(block.id()));
        assert_eq!(pool.capacity_index().bucket(64 * K), Some(&[block.id()][..]));
    }

    #[test]
    fn test_remove_unbinds_and_unindexes() {
        let d = driver();
        let mut pool = OwnedBlockPool::owned(AllocatorId::next(), FitPolicy::StrictlyLarger);
        let mut block = PhysicalBlock::create(d, 0, 64 * K).unwrap();
        pool.add(&mut block).unwrap();

        pool.remove(&mut block).unwrap();
        assert!(block.owner().is_none());
        assert!(block.allocator().is_some());
        assert!(pool.is_empty());
        assert!(pool.capacity_index().is_empty());

        assert!(matches!(
            pool.remove(&mut block),
            Err(VmmError::NotMember { pool: PoolRole::Owned, .. })
        ));
    }

    #[test]
    fn test_registry_keeps_id_order() {
        let d = driver();
        let mut registry = BlockRegistry::registry(PoolRole::Shared, AllocatorId::next());
        let mut a = PhysicalBlock::create(d.clone(), 0, 4 * K).unwrap();
        let mut b = PhysicalBlock::create(d, 0, 4 * K).unwrap();

        registry.add(&mut b).unwrap();
        registry.add(&mut a).unwrap();
        let members: Vec<_> = registry.members().collect();
        assert_eq!(members, vec![a.id(), b.id()]);
    }

    #[test]
    fn test_update_ignores_non_members() {
        let d = driver();
        let mut pool = OwnedBlockPool::owned(AllocatorId::next(), FitPolicy::StrictlyLarger);
        let block = PhysicalBlock::create(d, 0, 64 * K).unwrap();
        pool.update(&block, 32 * K);
        assert!(pool.capacity_index().is_empty());
    }

    #[test]
    fn test_find_available_zero_size() {
        let d = driver();
        let mut pool = OwnedBlockPool::owned(AllocatorId::next(), FitPolicy::AllowExact);
        let mut block = PhysicalBlock::create(d, 0, 64 * K).unwrap();
        pool.add(&mut block).unwrap();
        assert_eq!(pool.find_available(0), None);
    }
}
