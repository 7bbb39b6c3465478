//! Best-fit, coalescing range allocator over a fixed byte range.
//!
//! The allocator never touches memory; it hands out offsets. Every range of
//! `[start, end)` is either free or used. Free ranges are indexed twice: by
//! starting offset, for neighbour merges on release, and by
//! `(size, offset)`, for the smallest-fit lookup with deterministic
//! tie-breaking. Used ranges are indexed by offset so release knows their
//! size.
//!
//! Because the lookups are deterministic, ranks that issue the same
//! sequence of requests get the same offsets back.

use crate::core::constants::ALLOC_GRANULARITY;
use crate::core::error::{Result, SymHeapError};
use crate::core::memory::utils::checked_align_up;

use std::collections::{BTreeMap, BTreeSet};

/// A `(offset, size)` range inside the managed byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    /// Starting offset
    pub offset: usize,
    /// Size in bytes (a multiple of the allocation granularity)
    pub size: usize,
}

impl MemoryRange {
    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Capacity snapshot of the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Total managed bytes
    pub total_bytes: usize,
    /// Bytes in free ranges
    pub free_bytes: usize,
    /// Bytes in used ranges
    pub used_bytes: usize,
    /// Size of the largest free range
    pub largest_free: usize,
    /// Number of free ranges
    pub free_ranges: usize,
    /// Number of live allocations
    pub allocations: usize,
}

impl HeapStats {
    /// Fraction of free bytes outside the largest free range, in `[0, 1]`.
    pub fn fragmentation(&self) -> f64 {
        if self.free_bytes == 0 {
            0.0
        } else {
            1.0 - self.largest_free as f64 / self.free_bytes as f64
        }
    }
}

/// Range allocator state. Not synchronized; the heap wraps it in a lock.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    start: usize,
    end: usize,
    free_by_offset: BTreeMap<usize, usize>,
    free_by_size: BTreeSet<(usize, usize)>,
    used: BTreeMap<usize, usize>,
}

fn round_size(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(SymHeapError::invalid_argument(
            "size",
            size,
            "must be positive",
        ));
    }
    checked_align_up(size, ALLOC_GRANULARITY)
        .ok_or_else(|| SymHeapError::invalid_argument("size", size, "overflows when rounded"))
}

impl RangeAllocator {
    /// Manage `[start, start + size)`. Both must be granularity aligned.
    pub fn new(start: usize, size: usize) -> Result<Self> {
        if start % ALLOC_GRANULARITY != 0 || size == 0 || size % ALLOC_GRANULARITY != 0 {
            return Err(SymHeapError::invalid_argument(
                "range",
                format!("[{:#x}, +{:#x})", start, size),
                format!(
                    "start and size must be positive multiples of {}",
                    ALLOC_GRANULARITY
                ),
            ));
        }
        let end = start
            .checked_add(size)
            .ok_or_else(|| SymHeapError::invalid_argument("size", size, "range overflows"))?;

        let mut allocator = RangeAllocator {
            start,
            end,
            free_by_offset: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            used: BTreeMap::new(),
        };
        allocator.insert_free(start, size);
        Ok(allocator)
    }

    /// First managed offset.
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last managed offset.
    pub fn end(&self) -> usize {
        self.end
    }

    fn insert_free(&mut self, offset: usize, size: usize) {
        debug_assert!(size > 0);
        self.free_by_offset.insert(offset, size);
        self.free_by_size.insert((size, offset));
    }

    fn remove_free(&mut self, offset: usize, size: usize) {
        self.free_by_offset.remove(&offset);
        self.free_by_size.remove(&(size, offset));
    }

    fn largest_free(&self) -> usize {
        self.free_by_size
            .iter()
            .next_back()
            .map_or(0, |&(size, _)| size)
    }

    /// Allocate `size` bytes (rounded up to the granularity) from the
    /// smallest free range that fits.
    pub fn allocate(&mut self, size: usize) -> Result<usize> {
        let rounded = round_size(size)?;

        let &(free_size, offset) = self
            .free_by_size
            .range((rounded, 0)..)
            .next()
            .ok_or_else(|| SymHeapError::out_of_memory(rounded, self.largest_free()))?;

        self.remove_free(offset, free_size);
        if free_size > rounded {
            self.insert_free(offset + rounded, free_size - rounded);
        }
        self.used.insert(offset, rounded);

        log::debug!("allocate {} (rounded {}) -> offset {:#x}", size, rounded, offset);
        Ok(offset)
    }

    /// Allocate `size` bytes at an offset that is a multiple of `alignment`.
    ///
    /// The size is rounded to the granularity first. Candidate free ranges
    /// are scanned in ascending size order; the bytes skipped to reach the
    /// aligned start go back to the free index.
    pub fn allocate_aligned(&mut self, alignment: usize, size: usize) -> Result<usize> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(SymHeapError::invalid_argument(
                "alignment",
                alignment,
                "must be a power of two",
            ));
        }
        let rounded = round_size(size)?;
        if alignment <= ALLOC_GRANULARITY {
            return self.allocate(size);
        }

        let candidate = self
            .free_by_size
            .range((rounded, 0)..)
            .find_map(|&(free_size, offset)| {
                let aligned = checked_align_up(offset, alignment)?;
                let skip = aligned - offset;
                (skip.checked_add(rounded)? <= free_size).then_some((free_size, offset, aligned))
            });

        let (free_size, offset, aligned) = candidate
            .ok_or_else(|| SymHeapError::out_of_memory(rounded, self.largest_free()))?;

        self.remove_free(offset, free_size);
        let skip = aligned - offset;
        if skip > 0 {
            self.insert_free(offset, skip);
        }
        let tail = free_size - skip - rounded;
        if tail > 0 {
            self.insert_free(aligned + rounded, tail);
        }
        self.used.insert(aligned, rounded);

        log::debug!(
            "allocate_aligned {} (align {}, rounded {}) -> offset {:#x}",
            size,
            alignment,
            rounded,
            aligned
        );
        Ok(aligned)
    }

    /// Release the allocation at `offset`, merging it with free neighbours.
    /// Returns the size that was released.
    pub fn release(&mut self, offset: usize) -> Result<usize> {
        let size = self
            .used
            .remove(&offset)
            .ok_or_else(|| SymHeapError::not_found(offset))?;
        self.insert_free_merged(offset, size);
        log::debug!("release offset {:#x} ({} bytes)", offset, size);
        Ok(size)
    }

    fn insert_free_merged(&mut self, offset: usize, size: usize) {
        let mut merged_offset = offset;
        let mut merged_size = size;

        let previous = self
            .free_by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = previous {
            if prev_offset + prev_size == offset {
                self.remove_free(prev_offset, prev_size);
                merged_offset = prev_offset;
                merged_size += prev_size;
            }
        }

        if let Some(&next_size) = self.free_by_offset.get(&(offset + size)) {
            self.remove_free(offset + size, next_size);
            merged_size += next_size;
        }

        self.insert_free(merged_offset, merged_size);
    }

    /// Size of the allocation at `offset`.
    pub fn query_size(&self, offset: usize) -> Result<usize> {
        self.used
            .get(&offset)
            .copied()
            .ok_or_else(|| SymHeapError::not_found(offset))
    }

    /// Grow or shrink the allocation at `offset` without moving it.
    ///
    /// Growth succeeds only when the range directly after the allocation is
    /// free and large enough; a shrunk tail is returned to the free index.
    pub fn resize(&mut self, offset: usize, new_size: usize) -> Result<usize> {
        let current = self.query_size(offset)?;
        let rounded = round_size(new_size)?;

        if rounded < current {
            self.used.insert(offset, rounded);
            self.insert_free_merged(offset + rounded, current - rounded);
        } else if rounded > current {
            let extra = rounded - current;
            let next = offset + current;
            let next_size = match self.free_by_offset.get(&next) {
                Some(&s) if s >= extra => s,
                _ => return Err(SymHeapError::out_of_memory(rounded, self.largest_free())),
            };
            self.remove_free(next, next_size);
            if next_size > extra {
                self.insert_free(next + extra, next_size - extra);
            }
            self.used.insert(offset, rounded);
        }

        log::debug!("resize offset {:#x}: {} -> {}", offset, current, rounded);
        Ok(rounded)
    }

    /// Capacity snapshot.
    pub fn stats(&self) -> HeapStats {
        let free_bytes: usize = self.free_by_offset.values().sum();
        let used_bytes: usize = self.used.values().sum();
        HeapStats {
            total_bytes: self.end - self.start,
            free_bytes,
            used_bytes,
            largest_free: self.largest_free(),
            free_ranges: self.free_by_offset.len(),
            allocations: self.used.len(),
        }
    }

    /// Free ranges in address order.
    pub fn free_ranges(&self) -> Vec<MemoryRange> {
        self.free_by_offset
            .iter()
            .map(|(&offset, &size)| MemoryRange { offset, size })
            .collect()
    }

    /// Used ranges in address order.
    pub fn used_ranges(&self) -> Vec<MemoryRange> {
        self.used
            .iter()
            .map(|(&offset, &size)| MemoryRange { offset, size })
            .collect()
    }

    /// Verify the structural invariants.
    ///
    /// Free and used ranges must tile `[start, end)` exactly, both free
    /// indexes must agree, and no two free ranges may touch.
    pub fn check_invariants(&self) -> Result<()> {
        if self.free_by_offset.len() != self.free_by_size.len() {
            return Err(SymHeapError::internal("free indexes disagree in length"));
        }
        for (&offset, &size) in &self.free_by_offset {
            if !self.free_by_size.contains(&(size, offset)) {
                return Err(SymHeapError::internal(format!(
                    "free range {:#x}+{} missing from size index",
                    offset, size
                )));
            }
        }

        let mut ranges: Vec<(MemoryRange, bool)> = self
            .free_ranges()
            .into_iter()
            .map(|r| (r, true))
            .chain(self.used_ranges().into_iter().map(|r| (r, false)))
            .collect();
        ranges.sort_by_key(|(r, _)| r.offset);

        let mut cursor = self.start;
        let mut previous_free = false;
        for (range, is_free) in ranges {
            if range.size == 0 || range.size % ALLOC_GRANULARITY != 0 {
                return Err(SymHeapError::internal(format!(
                    "range {:#x} has invalid size {}",
                    range.offset, range.size
                )));
            }
            if range.offset != cursor {
                return Err(SymHeapError::internal(format!(
                    "gap or overlap at {:#x} (expected {:#x})",
                    range.offset, cursor
                )));
            }
            if is_free && previous_free {
                return Err(SymHeapError::internal(format!(
                    "adjacent free ranges not coalesced at {:#x}",
                    range.offset
                )));
            }
            previous_free = is_free;
            cursor = range.end();
        }
        if cursor != self.end {
            return Err(SymHeapError::internal(format!(
                "ranges end at {:#x}, heap ends at {:#x}",
                cursor, self.end
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: usize = 1 << 20;

    #[test]
    fn test_allocate_up_to_capacity() {
        let mut heap = RangeAllocator::new(0, 4096).unwrap();
        let offset = heap.allocate(4096).unwrap();
        assert_eq!(offset, 0);
        assert!(matches!(
            heap.allocate(16),
            Err(SymHeapError::OutOfMemory { .. })
        ));

        let mut heap = RangeAllocator::new(0, 4096).unwrap();
        assert!(matches!(
            heap.allocate(4097),
            Err(SymHeapError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_rounding_to_granularity() {
        let mut heap = RangeAllocator::new(0, 1024).unwrap();
        let a = heap.allocate(1).unwrap();
        let b = heap.allocate(17).unwrap();
        assert_eq!(heap.query_size(a).unwrap(), 16);
        assert_eq!(heap.query_size(b).unwrap(), 32);
        assert_eq!(b, 16);
        assert!(heap.allocate(0).is_err());
        assert!(heap.allocate(usize::MAX).is_err());
    }

    #[test]
    fn test_fragmentation_and_coalescing() {
        let mut heap = RangeAllocator::new(0, 4 * MIB).unwrap();
        let b1 = heap.allocate(MIB).unwrap();
        let b2 = heap.allocate(MIB).unwrap();
        let b3 = heap.allocate(MIB).unwrap();
        let b4 = heap.allocate(MIB).unwrap();
        assert_eq!([b1, b2, b3, b4], [0, MIB, 2 * MIB, 3 * MIB]);

        heap.release(b2).unwrap();
        heap.release(b4).unwrap();
        assert!(matches!(
            heap.allocate(2 * MIB),
            Err(SymHeapError::OutOfMemory { .. })
        ));

        heap.release(b3).unwrap();
        heap.check_invariants().unwrap();
        assert_eq!(heap.stats().free_ranges, 1);
        assert_eq!(heap.allocate(3 * MIB).unwrap(), MIB);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_best_fit_prefers_smallest_range() {
        let mut heap = RangeAllocator::new(0, 1024).unwrap();
        let a = heap.allocate(256).unwrap();
        let _b = heap.allocate(16).unwrap();
        let c = heap.allocate(64).unwrap();
        let _d = heap.allocate(16).unwrap();
        heap.release(a).unwrap();
        heap.release(c).unwrap();

        // Both the 256-byte hole and the 64-byte hole fit; the smaller wins.
        assert_eq!(heap.allocate(48).unwrap(), c);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_equal_sizes_break_ties_by_offset() {
        let mut heap = RangeAllocator::new(0, 512).unwrap();
        let blocks: Vec<usize> = (0..8).map(|_| heap.allocate(64).unwrap()).collect();
        heap.release(blocks[5]).unwrap();
        heap.release(blocks[1]).unwrap();
        heap.release(blocks[3]).unwrap();
        assert_eq!(heap.allocate(64).unwrap(), blocks[1]);
        assert_eq!(heap.allocate(64).unwrap(), blocks[3]);
    }

    #[test]
    fn test_aligned_allocation_returns_head_skip() {
        let mut heap = RangeAllocator::new(0, 8192).unwrap();
        let _small = heap.allocate(16).unwrap();
        let aligned = heap.allocate_aligned(1024, 100).unwrap();
        assert_eq!(aligned, 1024);
        assert_eq!(heap.query_size(aligned).unwrap(), 112);

        // The skipped [16, 1024) range is free again.
        let free = heap.free_ranges();
        assert_eq!(free[0], MemoryRange { offset: 16, size: 1008 });
        heap.check_invariants().unwrap();

        heap.release(aligned).unwrap();
        heap.check_invariants().unwrap();
        assert_eq!(heap.stats().free_ranges, 1);
    }

    #[test]
    fn test_aligned_allocation_scans_candidates() {
        let mut heap = RangeAllocator::new(0, 4096).unwrap();
        let _head = heap.allocate(16).unwrap();
        let hole = heap.allocate(96).unwrap();
        let _pin = heap.allocate(16).unwrap();
        heap.release(hole).unwrap();

        // The 96-byte hole is the smallest fit by size but cannot satisfy
        // the alignment, so the larger range is used.
        let offset = heap.allocate_aligned(2048, 64).unwrap();
        assert_eq!(offset, 2048);
        assert!(heap.allocate_aligned(3, 16).is_err());
        assert!(heap.allocate_aligned(0, 16).is_err());
        assert!(matches!(
            heap.allocate_aligned(4096, 16),
            Err(SymHeapError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_release_unknown_offset() {
        let mut heap = RangeAllocator::new(0, 1024).unwrap();
        let a = heap.allocate(32).unwrap();
        assert!(matches!(heap.release(a + 16), Err(SymHeapError::NotFound { .. })));
        heap.release(a).unwrap();
        assert!(matches!(heap.release(a), Err(SymHeapError::NotFound { .. })));
        assert!(heap.query_size(a).is_err());
    }

    #[test]
    fn test_resize_in_place() {
        let mut heap = RangeAllocator::new(0, 1024).unwrap();
        let a = heap.allocate(64).unwrap();
        assert_eq!(heap.resize(a, 200).unwrap(), 208);
        assert_eq!(heap.query_size(a).unwrap(), 208);

        assert_eq!(heap.resize(a, 32).unwrap(), 32);
        heap.check_invariants().unwrap();
        assert_eq!(heap.stats().free_bytes, 1024 - 32);

        let _b = heap.allocate(16).unwrap();
        assert!(matches!(
            heap.resize(a, 64),
            Err(SymHeapError::OutOfMemory { .. })
        ));
        assert_eq!(heap.query_size(a).unwrap(), 32);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_nonzero_start() {
        let mut heap = RangeAllocator::new(12288, 4096).unwrap();
        assert_eq!(heap.allocate(16).unwrap(), 12288);
        assert_eq!(heap.allocate_aligned(4096, 16).unwrap_err().category(), "out_of_memory");
        assert!(RangeAllocator::new(8, 4096).is_err());
        assert!(RangeAllocator::new(0, 0).is_err());
    }

    #[test]
    fn test_stats() {
        let mut heap = RangeAllocator::new(0, 1024).unwrap();
        let a = heap.allocate(100).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.total_bytes, 1024);
        assert_eq!(stats.used_bytes, 112);
        assert_eq!(stats.free_bytes, 912);
        assert_eq!(stats.largest_free, 912);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.fragmentation(), 0.0);
        heap.release(a).unwrap();
        assert_eq!(heap.stats().free_bytes, 1024);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Aligned(u32, usize),
        Free(usize),
        Resize(usize, usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..2048).prop_map(Op::Alloc),
            (4u32..11, 1usize..1024).prop_map(|(shift, size)| Op::Aligned(shift, size)),
            any::<usize>().prop_map(Op::Free),
            (any::<usize>(), 1usize..2048).prop_map(|(i, size)| Op::Resize(i, size)),
        ]
    }

    proptest! {
        #[test]
        fn prop_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let mut heap = RangeAllocator::new(0, 64 * 1024).unwrap();
            let mut live: Vec<usize> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        if let Ok(offset) = heap.allocate(size) {
                            live.push(offset);
                        }
                    }
                    Op::Aligned(shift, size) => {
                        let alignment = 1usize << shift;
                        if let Ok(offset) = heap.allocate_aligned(alignment, size) {
                            prop_assert_eq!(offset % alignment, 0);
                            live.push(offset);
                        }
                    }
                    Op::Free(index) => {
                        if !live.is_empty() {
                            let offset = live.swap_remove(index % live.len());
                            heap.release(offset).unwrap();
                        }
                    }
                    Op::Resize(index, size) => {
                        if !live.is_empty() {
                            let offset = live[index % live.len()];
                            let _ = heap.resize(offset, size);
                        }
                    }
                }
                prop_assert!(heap.check_invariants().is_ok());
            }

            for offset in live.drain(..) {
                heap.release(offset).unwrap();
            }
            let stats = heap.stats();
            prop_assert_eq!(stats.free_bytes, 64 * 1024);
            prop_assert_eq!(stats.free_ranges, 1);
        }

        #[test]
        fn prop_alloc_free_round_trip(size in 1usize..65536) {
            let mut heap = RangeAllocator::new(0, 64 * 1024).unwrap();
            let before = heap.stats().free_bytes;
            let offset = heap.allocate(size).unwrap();
            heap.release(offset).unwrap();
            let again = heap.allocate(size).unwrap();
            prop_assert_eq!(again, offset);
            heap.release(again).unwrap();
            prop_assert_eq!(heap.stats().free_bytes, before);
        }
    }
}
