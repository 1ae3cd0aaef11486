//! Allocation statistics

/// Counters and a point-in-time view of an allocator
///
/// Counters accumulate over the allocator's lifetime; the gauges (`live_*`,
/// `block_count`, byte totals, `fragmentation`) are filled in when the
/// snapshot is taken.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocatorStats {
    /// Successful `alloc` calls
    pub total_allocations: usize,
    /// Successful `dealloc` calls
    pub total_deallocations: usize,
    /// Peak number of simultaneously mapped allocations
    pub peak_allocations: usize,
    /// Allocations currently mapped
    pub live_allocations: usize,
    /// Blocks created by `alloc`
    pub blocks_created: usize,
    /// `alloc` calls served by an existing block
    pub blocks_reused: usize,
    /// Blocks whose physical memory was released
    pub blocks_destroyed: usize,
    /// Virtual ranges reserved from the driver
    pub ranges_reserved: usize,
    /// `alloc` calls served by an idle reserved range
    pub ranges_reused: usize,
    /// Virtual ranges returned to the driver
    pub ranges_freed: usize,
    /// Driver failures swallowed during cleanup (logged)
    pub cleanup_failures: usize,
    /// Blocks currently held
    pub block_count: usize,
    /// Sum of block capacities
    pub total_capacity: usize,
    /// Bytes currently mapped
    pub mapped_bytes: usize,
    /// Reserved but unmapped ranges waiting for reuse
    pub idle_ranges: usize,
    /// Unmapped-space fragmentation across blocks (0.0 = none)
    pub fragmentation: f32,
}

impl AllocatorStats {
    pub(crate) fn record_alloc(&mut self) {
        self.total_allocations += 1;
        self.live_allocations += 1;
        self.peak_allocations = self.peak_allocations.max(self.live_allocations);
    }

    pub(crate) fn record_dealloc(&mut self) {
        self.total_deallocations += 1;
        self.live_allocations = self.live_allocations.saturating_sub(1);
    }

    /// Fraction of block capacity currently mapped
    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            return 0.0;
        }
        self.mapped_bytes as f64 / self.total_capacity as f64
    }

    /// Fraction of allocations that reused an existing block
    pub fn block_reuse_ratio(&self) -> f64 {
        let served = self.blocks_created + self.blocks_reused;
        if served == 0 {
            return 0.0;
        }
        self.blocks_reused as f64 / served as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_tracking() {
        let mut stats = AllocatorStats::default();
        stats.record_alloc();
        stats.record_alloc();
        stats.record_dealloc();
        stats.record_alloc();
        assert_eq!(stats.total_allocations, 3);
        assert_eq!(stats.total_deallocations, 1);
        assert_eq!(stats.live_allocations, 2);
        assert_eq!(stats.peak_allocations, 2);
    }

    #[test]
    fn test_ratios() {
        let stats = AllocatorStats {
            total_capacity: 1000,
            mapped_bytes: 250,
            blocks_created: 1,
            blocks_reused: 3,
            ..Default::default()
        };
        assert_eq!(stats.utilization(), 0.25);
        assert_eq!(stats.block_reuse_ratio(), 0.75);
        assert_eq!(AllocatorStats::default().utilization(), 0.0);
    }
}
