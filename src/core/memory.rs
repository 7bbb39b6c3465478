//! Memory management utilities for the symmetric heap runtime.
//!
//! This module provides the raw storage underneath the runtime: page-aligned
//! partitions that back a rank's symmetric heap, aligned byte buffers used
//! for staging, and a bounded pool that recycles staging buffers between
//! transfers.

use crate::core::constants::*;
use crate::core::error::{MemoryError, Result};
use crate::core::types::Element;
use parking_lot::{Condvar, Mutex};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe tracker of bytes held by aligned buffers and partitions.
static TOTAL_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

/// Get total memory currently held by [`AlignedBuffer`] and [`Partition`].
pub fn total_allocated_memory() -> usize {
    TOTAL_ALLOCATED.load(Ordering::Relaxed)
}

fn zeroed_layout(size: usize, alignment: usize) -> Result<Layout> {
    Layout::from_size_align(size, alignment).map_err(|_| {
        MemoryError::AlignmentViolation {
            address: 0,
            alignment,
        }
        .into()
    })
}

/// Aligned, zero-initialized, fixed-length buffer of plain-old-data.
pub struct AlignedBuffer<T: Element> {
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
    _marker: PhantomData<T>,
}

impl<T: Element> AlignedBuffer<T> {
    /// Allocate `len` zeroed elements aligned to `alignment` bytes.
    pub fn zeroed(len: usize, alignment: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self::empty());
        }

        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(MemoryError::AllocationFailed { size: usize::MAX })?;
        let layout = zeroed_layout(bytes, alignment.max(std::mem::align_of::<T>()))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) } as *mut T;
        let ptr = NonNull::new(raw).ok_or(MemoryError::AllocationFailed { size: bytes })?;

        TOTAL_ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);

        Ok(AlignedBuffer {
            ptr,
            len,
            layout,
            _marker: PhantomData,
        })
    }

    /// Create an empty buffer with no allocation.
    pub fn empty() -> Self {
        AlignedBuffer {
            ptr: NonNull::dangling(),
            len: 0,
            layout: Layout::new::<u8>(),
            _marker: PhantomData,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get a slice view of the buffer content.
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: ptr is valid for len initialized elements (or dangling with len 0).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get a mutable slice view of the buffer content.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above, and we hold the only reference.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Check the buffer's alignment.
    pub fn is_aligned_to(&self, alignment: usize) -> bool {
        self.ptr.as_ptr() as usize % alignment == 0
    }
}

// SAFETY: the buffer exclusively owns its allocation of Send + Sync elements.
unsafe impl<T: Element> Send for AlignedBuffer<T> {}
unsafe impl<T: Element> Sync for AlignedBuffer<T> {}

impl<T: Element> Drop for AlignedBuffer<T> {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: allocated in `zeroed` with this layout.
            unsafe { dealloc(self.ptr.as_ptr() as *mut u8, self.layout) };
            TOTAL_ALLOCATED.fetch_sub(self.layout.size(), Ordering::Relaxed);
        }
    }
}

impl<T: Element> std::fmt::Debug for AlignedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("alignment", &self.layout.align())
            .finish()
    }
}

/// Page-aligned memory region backing one rank's heap partition.
///
/// Peers access the region concurrently through raw addresses, so the
/// partition never hands out Rust references to its content. The region is
/// freed when the last owner drops it.
pub struct Partition {
    base: NonNull<u8>,
    layout: Layout,
}

impl Partition {
    /// Allocate a zeroed partition of `size` bytes.
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(MemoryError::AllocationFailed { size }.into());
        }
        let layout = zeroed_layout(size, PARTITION_ALIGNMENT)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(MemoryError::AllocationFailed { size })?;
        TOTAL_ALLOCATED.fetch_add(size, Ordering::Relaxed);
        log::debug!("Allocated partition of {} bytes at {:#x}", size, raw as usize);
        Ok(Partition { base, layout })
    }

    /// Base address.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Whether `[addr, addr + len)` lies inside the partition.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base()
            && addr
                .checked_add(len)
                .map_or(false, |end| end <= self.base() + self.size())
    }
}

// SAFETY: the partition is a plain byte region; synchronization of its
// content is the responsibility of the fabric and the sync engine.
unsafe impl Send for Partition {}
unsafe impl Sync for Partition {}

impl Drop for Partition {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
        TOTAL_ALLOCATED.fetch_sub(self.layout.size(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Partition {{ base: {:#x}, size: {} }}", self.base(), self.size())
    }
}

/// Bounded pool of equally sized staging buffers.
///
/// At most `capacity` buffers exist at once, checked out or idle.
/// [`get_buffer`](Self::get_buffer) waits for a return when all of them are
/// checked out; [`try_get_buffers`](Self::try_get_buffers) never waits.
#[derive(Debug)]
pub struct StagingPool {
    state: Mutex<PoolState>,
    returned: Condvar,
    buffer_bytes: usize,
    capacity: usize,
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<AlignedBuffer<u8>>,
    outstanding: usize,
}

impl PoolState {
    fn take(&mut self, buffer_bytes: usize) -> Result<AlignedBuffer<u8>> {
        let buffer = match self.idle.pop() {
            Some(buffer) => buffer,
            None => AlignedBuffer::zeroed(buffer_bytes, CACHE_LINE_SIZE)?,
        };
        self.outstanding += 1;
        Ok(buffer)
    }
}

impl StagingPool {
    /// Create a pool of at most `capacity` buffers of `buffer_bytes` bytes.
    pub fn new(buffer_bytes: usize, capacity: usize) -> Self {
        StagingPool {
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(capacity),
                outstanding: 0,
            }),
            returned: Condvar::new(),
            buffer_bytes,
            capacity: capacity.max(1),
        }
    }

    /// Size of each buffer in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Maximum number of buffers checked out at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get a buffer, waiting for one to be returned if the pool is at
    /// capacity.
    pub fn get_buffer(&self) -> Result<AlignedBuffer<u8>> {
        let mut state = self.state.lock();
        while state.outstanding >= self.capacity {
            self.returned.wait(&mut state);
        }
        state.take(self.buffer_bytes)
    }

    /// Check out `count` buffers at once, provided `reserve` more would
    /// still be left over afterwards. Returns `None` instead of waiting.
    pub fn try_get_buffers(
        &self,
        count: usize,
        reserve: usize,
    ) -> Result<Option<Vec<AlignedBuffer<u8>>>> {
        let mut state = self.state.lock();
        let wanted = count.saturating_add(reserve);
        if state.outstanding.saturating_add(wanted) > self.capacity {
            return Ok(None);
        }
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            match state.take(self.buffer_bytes) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    for buffer in buffers {
                        state.outstanding -= 1;
                        state.idle.push(buffer);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Some(buffers))
    }

    /// Return a buffer to the pool for reuse.
    pub fn return_buffer(&self, buffer: AlignedBuffer<u8>) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if buffer.len() == self.buffer_bytes {
            state.idle.push(buffer);
        }
        drop(state);
        self.returned.notify_one();
    }

    /// Number of idle buffers in the pool.
    pub fn available_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Number of buffers currently checked out.
    pub fn outstanding_count(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Drop all idle buffers.
    pub fn clear(&self) {
        self.state.lock().idle.clear();
    }
}

/// Alignment arithmetic helpers.
pub mod utils {
    /// Round up to the nearest multiple of `alignment` (a power of two).
    /// Returns `None` on overflow.
    pub fn checked_align_up(size: usize, alignment: usize) -> Option<usize> {
        debug_assert!(alignment.is_power_of_two());
        size.checked_add(alignment - 1).map(|s| s & !(alignment - 1))
    }
}
