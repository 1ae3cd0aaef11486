//! Free-extent bookkeeping for the physical space of one block
//!
//! A block can back several virtual ranges at once. Each mapping needs its own
//! physical bytes, so the block hands out offsets from a sorted free list:
//! best-fit on reserve, coalescing on release.

/// Unused region of a block's physical allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeExtent {
    /// Byte offset from the start of the physical allocation
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
}

impl FreeExtent {
    fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// Check if this extent ends exactly where `other` starts
    fn is_adjacent_to(&self, other: &FreeExtent) -> bool {
        self.offset + self.size == other.offset
    }

    fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Sorted, coalesced list of free extents
#[derive(Debug, Clone)]
pub(crate) struct ExtentList {
    capacity: usize,
    free: Vec<FreeExtent>,
}

impl ExtentList {
    pub fn new(capacity: usize) -> Self {
        let free = if capacity > 0 {
            vec![FreeExtent::new(0, capacity)]
        } else {
            Vec::new()
        };
        Self { capacity, free }
    }

    /// Take `size` bytes from the smallest extent that fits
    ///
    /// Returns the physical offset, or `None` when no single extent is large
    /// enough.
    pub fn reserve(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let idx = self.find_best_fit(size)?;
        let extent = self.free[idx];
        if extent.size == size {
            self.free.remove(idx);
        } else {
            self.free[idx] = FreeExtent::new(extent.offset + size, extent.size - size);
        }
        Some(extent.offset)
    }

    /// Return `[offset, offset + size)` to the free list
    ///
    /// Returns `false` (and changes nothing) if the range overlaps free space or
    /// lies outside the block.
    pub fn release(&mut self, offset: usize, size: usize) -> bool {
        if size == 0 || offset + size > self.capacity {
            return false;
        }
        let returned = FreeExtent::new(offset, size);
        let pos = self.free.partition_point(|e| e.offset < offset);
        if pos > 0 && self.free[pos - 1].end() > offset {
            return false;
        }
        if pos < self.free.len() && returned.end() > self.free[pos].offset {
            return false;
        }
        self.free.insert(pos, returned);
        self.coalesce();
        true
    }

    pub fn free_bytes(&self) -> usize {
        self.free.iter().map(|e| e.size).sum()
    }

    pub fn largest(&self) -> usize {
        self.free.iter().map(|e| e.size).max().unwrap_or(0)
    }

    pub fn fragment_count(&self) -> usize {
        self.free.len()
    }

    /// Fragmentation ratio (0.0 = one contiguous extent, towards 1.0 = scattered)
    pub fn fragmentation(&self) -> f32 {
        let free = self.free_bytes();
        if free == 0 {
            return 0.0;
        }
        1.0 - (self.largest() as f32 / free as f32)
    }

    fn find_best_fit(&self, size: usize) -> Option<usize> {
        self.free
            .iter()
            .enumerate()
            .filter(|(_, e)| e.size >= size)
            .min_by_key(|(_, e)| e.size)
            .map(|(idx, _)| idx)
    }

    /// Merge adjacent extents; the list is kept sorted by offset
    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.free.len() {
            let current = self.free[i];
            let next = self.free[i + 1];
            if current.is_adjacent_to(&next) {
                self.free[i].size += next.size;
                self.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_adjacent() {
        let a = FreeExtent::new(0, 100);
        let b = FreeExtent::new(100, 200);
        let c = FreeExtent::new(300, 100);

        assert!(a.is_adjacent_to(&b));
        assert!(b.is_adjacent_to(&c));
        assert!(!a.is_adjacent_to(&c));
    }

    #[test]
    fn test_reserve_sequential() {
        let mut list = ExtentList::new(1000);
        assert_eq!(list.reserve(300), Some(0));
        assert_eq!(list.reserve(300), Some(300));
        assert_eq!(list.free_bytes(), 400);
        assert_eq!(list.reserve(500), None);
        assert_eq!(list.reserve(0), None);
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let mut list = ExtentList::new(1000);
        let a = list.reserve(100).unwrap();
        let _b = list.reserve(100).unwrap();
        let c = list.reserve(300).unwrap();
        let _d = list.reserve(100).unwrap();
        // holes: [0,100), [200,500), [600,1000)
        assert!(list.release(a, 100));
        assert!(list.release(c, 300));
        assert_eq!(list.reserve(250), Some(200));
        assert_eq!(list.reserve(100), Some(0));
    }

    #[test]
    fn test_release_coalesces() {
        let mut list = ExtentList::new(400);
        let a = list.reserve(100).unwrap();
        let b = list.reserve(100).unwrap();
        let c = list.reserve(100).unwrap();
        assert_eq!(list.fragment_count(), 1);

        assert!(list.release(a, 100));
        assert!(list.release(c, 100));
        assert_eq!(list.fragment_count(), 2);
        assert!(list.fragmentation() > 0.0);

        assert!(list.release(b, 100));
        assert_eq!(list.fragment_count(), 1);
        assert_eq!(list.largest(), 400);
        assert_eq!(list.fragmentation(), 0.0);
    }

    #[test]
    fn test_release_rejects_overlap() {
        let mut list = ExtentList::new(400);
        let a = list.reserve(200).unwrap();
        assert!(!list.release(a + 100, 200)); // overlaps the free tail
        assert!(!list.release(300, 200)); // past the end
        assert!(list.release(a, 200));
        assert!(!list.release(a, 200)); // double release
        assert_eq!(list.free_bytes(), 400);
    }
}
