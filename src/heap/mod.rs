//! Symmetric heap: partition layout, allocator and address translation.
//!
//! Each rank owns one [`Partition`]. The first [`SYNC_REGION_BYTES`] bytes
//! hold the barrier counters; the user heap follows and is managed by a
//! [`RangeAllocator`] whose offsets are relative to the partition base.
//! Because every rank runs the same deterministic allocator over the same
//! range, a collective allocation lands at the same offset everywhere.

pub mod allocator;
pub mod translate;

pub use allocator::{HeapStats, MemoryRange, RangeAllocator};
pub use translate::PeerTable;

use crate::core::constants::*;
use crate::core::error::Result;
use crate::core::memory::Partition;

use parking_lot::Mutex;
use std::sync::Arc;

/// One rank's partition plus the allocator over its user heap.
#[derive(Debug)]
pub struct SymmetricHeap {
    partition: Arc<Partition>,
    allocator: Mutex<RangeAllocator>,
}

impl SymmetricHeap {
    /// Allocate a zeroed partition with `heap_bytes` of user heap.
    pub fn new(heap_bytes: usize) -> Result<Self> {
        let partition = Arc::new(Partition::allocate(USER_HEAP_OFFSET + heap_bytes)?);
        let allocator = RangeAllocator::new(USER_HEAP_OFFSET, heap_bytes)?;
        log::debug!(
            "Symmetric heap at {:#x}: sync region {} bytes, user heap {} bytes",
            partition.base(),
            SYNC_REGION_BYTES,
            heap_bytes
        );
        Ok(SymmetricHeap {
            partition,
            allocator: Mutex::new(allocator),
        })
    }

    /// Shared handle on the backing partition.
    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    /// Base address of the partition.
    pub fn base(&self) -> usize {
        self.partition.base()
    }

    /// Size of the partition, sync region included.
    pub fn size(&self) -> usize {
        self.partition.size()
    }

    /// Absolute address of the barrier counter.
    pub fn counter_addr(&self) -> usize {
        self.base() + SYNC_COUNTER_OFFSET
    }

    /// Absolute address of the slot recording the last counter observed
    /// for `rank`.
    pub fn observed_addr(&self, rank: usize) -> usize {
        self.base() + SYNC_OBSERVED_OFFSET + rank * 8
    }

    /// Run `f` with the allocator locked.
    pub fn with_allocator<R>(&self, f: impl FnOnce(&mut RangeAllocator) -> R) -> R {
        f(&mut self.allocator.lock())
    }

    /// Allocator statistics.
    pub fn stats(&self) -> HeapStats {
        self.allocator.lock().stats()
    }

    /// Forget every allocation.
    pub fn reset(&self) -> Result<()> {
        let mut allocator = self.allocator.lock();
        let fresh = RangeAllocator::new(allocator.start(), allocator.end() - allocator.start())?;
        *allocator = fresh;
        Ok(())
    }
}
