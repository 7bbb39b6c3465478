//! System constants and partition layout for the symmetric heap runtime.
//!
//! This module defines the constants that control allocation granularity,
//! partition alignment, the reserved synchronization region layout and the
//! default configuration values used throughout the runtime.

use static_assertions::const_assert;

/// Allocation granularity in bytes.
/// Every allocation size is rounded up to a multiple of this value before
/// any caller-requested alignment is applied.
pub const ALLOC_GRANULARITY: usize = 16;

/// Alignment of every rank's heap partition base address.
/// Offset alignment implies address alignment up to this value.
pub const PARTITION_ALIGNMENT: usize = 4096;

/// Cache line size assumed for the synchronization region layout.
pub const CACHE_LINE_SIZE: usize = 64;

/// Maximum number of ranks a single world may contain.
/// Fixes the width of the per-peer observed-counter array.
pub const MAX_PES: usize = 1024;

/// Offset of the barrier generation counter inside the sync region.
pub const SYNC_COUNTER_OFFSET: usize = 0;

/// Offset of the `MAX_PES`-wide array of last observed peer counters.
pub const SYNC_OBSERVED_OFFSET: usize = CACHE_LINE_SIZE;

/// Size of the reserved synchronization region at offset 0 of every
/// partition. Never handed out by the allocator.
pub const SYNC_REGION_BYTES: usize = 3 * PARTITION_ALIGNMENT;

/// Offset at which the user-visible heap starts inside a partition.
pub const USER_HEAP_OFFSET: usize = SYNC_REGION_BYTES;

const_assert!(SYNC_OBSERVED_OFFSET >= SYNC_COUNTER_OFFSET + 8);
const_assert!(SYNC_OBSERVED_OFFSET + MAX_PES * 8 <= SYNC_REGION_BYTES);
const_assert!(SYNC_REGION_BYTES % PARTITION_ALIGNMENT == 0);
const_assert!(PARTITION_ALIGNMENT % ALLOC_GRANULARITY == 0);
const_assert!(ALLOC_GRANULARITY.is_power_of_two());

/// Default size of one staging buffer (64 KiB).
pub const DEFAULT_STAGING_BUFFER_BYTES: usize = 64 * 1024;

/// Default number of staging buffers retained by the staging pool.
pub const DEFAULT_STAGING_POOL_SIZE: usize = 4;

/// Default number of executor threads. 0 means one per available core.
pub const DEFAULT_EXECUTOR_THREADS: usize = 0;

/// Default number of busy spins before a waiting rank starts yielding.
pub const DEFAULT_SPIN_BEFORE_YIELD: u32 = 128;

/// Prefix of in-process rendezvous endpoints.
pub const LOCAL_ENDPOINT_SCHEME: &str = "local://";

/// Prefix of the environment variables read by the configuration layer.
pub const ENV_PREFIX: &str = "SYMHEAP_";

/// Library version string.
pub const SYMHEAP_VERSION: &str = env!("CARGO_PKG_VERSION");
