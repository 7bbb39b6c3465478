//! Transport layer: how bytes reach a peer's partition.
//!
//! The runtime never dereferences a peer address itself. It hands
//! `(rank, addr)` pairs to a [`Fabric`], which owns the mapping from ranks
//! to registered partitions. [`LoadStoreFabric`] is the in-process
//! implementation where every partition lives in one address space, the
//! way IPC-mapped device memory appears to a GPU.

pub mod bootstrap;
pub mod executor;

pub use bootstrap::{Bootstrap, LocalBootstrap, LocalWorld, PartitionDescriptor};
pub use executor::{DeviceExecutor, InlineExecutor, Job, PoolExecutor};

use crate::core::error::{Result, SymHeapError};
use crate::core::memory::Partition;
use crate::core::types::Rank;

use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Byte and word access to rank-tagged partition memory.
pub trait Fabric: Send + Sync + fmt::Debug {
    /// Human-readable transport name for logging.
    fn name(&self) -> &str;

    /// Make `partition` addressable as `rank`'s memory.
    fn register(&self, rank: Rank, partition: Arc<Partition>) -> Result<()>;

    /// Drop `rank`'s partition from the transport.
    fn deregister(&self, rank: Rank);

    /// Whether `from` can address `to`'s partition.
    fn reachable(&self, from: Rank, to: Rank) -> bool;

    /// Copy `src` to `[addr, addr + src.len())` in `rank`'s partition.
    fn write(&self, rank: Rank, addr: usize, src: &[u8]) -> Result<()>;

    /// Copy `[addr, addr + dst.len())` of `rank`'s partition into `dst`.
    fn read(&self, rank: Rank, addr: usize, dst: &mut [u8]) -> Result<()>;

    /// Make completed writes to `[addr, addr + len)` visible to other ranks.
    fn flush(&self, rank: Rank, addr: usize, len: usize) -> Result<()>;

    /// Atomically load a 64-bit word.
    fn atomic_load_u64(&self, rank: Rank, addr: usize) -> Result<u64>;

    /// Atomically store a 64-bit word.
    fn atomic_store_u64(&self, rank: Rank, addr: usize, value: u64) -> Result<()>;

    /// Atomically add to a 64-bit word, returning the previous value.
    fn atomic_fetch_add_u64(&self, rank: Rank, addr: usize, value: u64) -> Result<u64>;
}

/// In-process fabric: peers' partitions are plain memory in this address
/// space and transfers are `memcpy`s.
pub struct LoadStoreFabric {
    partitions: RwLock<Vec<Option<Arc<Partition>>>>,
    disconnected: RwLock<HashSet<(Rank, Rank)>>,
}

impl LoadStoreFabric {
    /// Fabric for `world_size` ranks with every pair reachable.
    pub fn new(world_size: usize) -> Self {
        LoadStoreFabric {
            partitions: RwLock::new(vec![None; world_size]),
            disconnected: RwLock::new(HashSet::new()),
        }
    }

    /// Make `a` and `b` unable to address each other.
    pub fn disconnect(&self, a: Rank, b: Rank) {
        let mut disconnected = self.disconnected.write();
        disconnected.insert((a, b));
        disconnected.insert((b, a));
        log::debug!("Fabric: ranks {} and {} disconnected", a, b);
    }

    fn partition(&self, rank: Rank, addr: usize, len: usize) -> Result<Arc<Partition>> {
        let partitions = self.partitions.read();
        let partition = partitions
            .get(rank)
            .and_then(|p| p.clone())
            .ok_or_else(|| SymHeapError::unreachable_peer(rank))?;
        if !partition.contains(addr, len) {
            return Err(SymHeapError::address_out_of_range(
                addr,
                partition.base(),
                partition.size(),
            ));
        }
        Ok(partition)
    }

    fn word(&self, rank: Rank, addr: usize) -> Result<(Arc<Partition>, &AtomicU64)> {
        if addr % std::mem::align_of::<AtomicU64>() != 0 {
            return Err(SymHeapError::invalid_argument(
                "addr",
                format!("{:#x}", addr),
                "atomic words must be 8-byte aligned",
            ));
        }
        let partition = self.partition(rank, addr, 8)?;
        // SAFETY: the word lies inside a live partition (kept alive by the
        // returned Arc, which the caller holds for the duration of the
        // access) and is 8-byte aligned.
        let word = unsafe { &*(addr as *const AtomicU64) };
        Ok((partition, word))
    }
}

impl fmt::Debug for LoadStoreFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self.partitions.read().iter().filter(|p| p.is_some()).count();
        f.debug_struct("LoadStoreFabric")
            .field("ranks", &self.partitions.read().len())
            .field("registered", &registered)
            .finish()
    }
}

impl Fabric for LoadStoreFabric {
    fn name(&self) -> &str {
        "load-store"
    }

    fn register(&self, rank: Rank, partition: Arc<Partition>) -> Result<()> {
        let mut partitions = self.partitions.write();
        let world = partitions.len();
        let slot = partitions.get_mut(rank).ok_or_else(|| {
            SymHeapError::invalid_argument("rank", rank, format!("fabric spans {} ranks", world))
        })?;
        if slot.is_some() {
            return Err(SymHeapError::fabric(format!(
                "rank {} already registered a partition",
                rank
            )));
        }
        log::debug!(
            "Fabric: rank {} registered partition {:#x} ({} bytes)",
            rank,
            partition.base(),
            partition.size()
        );
        *slot = Some(partition);
        Ok(())
    }

    fn deregister(&self, rank: Rank) {
        if let Some(slot) = self.partitions.write().get_mut(rank) {
            *slot = None;
        }
    }

    fn reachable(&self, from: Rank, to: Rank) -> bool {
        if from == to {
            return true;
        }
        let world = self.partitions.read().len();
        from < world && to < world && !self.disconnected.read().contains(&(from, to))
    }

    fn write(&self, rank: Rank, addr: usize, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let _partition = self.partition(rank, addr, src.len())?;
        // SAFETY: the destination range is inside a live partition and the
        // source is a distinct Rust slice.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len()) };
        Ok(())
    }

    fn read(&self, rank: Rank, addr: usize, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let _partition = self.partition(rank, addr, dst.len())?;
        // SAFETY: the source range is inside a live partition and the
        // destination is a distinct Rust slice.
        unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn flush(&self, rank: Rank, addr: usize, len: usize) -> Result<()> {
        self.partition(rank, addr, len)?;
        std::sync::atomic::fence(Ordering::Release);
        Ok(())
    }

    fn atomic_load_u64(&self, rank: Rank, addr: usize) -> Result<u64> {
        let (_partition, word) = self.word(rank, addr)?;
        Ok(word.load(Ordering::Acquire))
    }

    fn atomic_store_u64(&self, rank: Rank, addr: usize, value: u64) -> Result<()> {
        let (_partition, word) = self.word(rank, addr)?;
        word.store(value, Ordering::Release);
        Ok(())
    }

    fn atomic_fetch_add_u64(&self, rank: Rank, addr: usize, value: u64) -> Result<u64> {
        let (_partition, word) = self.word(rank, addr)?;
        Ok(word.fetch_add(value, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fabric_with_partitions() -> (LoadStoreFabric, Arc<Partition>, Arc<Partition>) {
        let fabric = LoadStoreFabric::new(2);
        let p0 = Arc::new(Partition::allocate(4096).unwrap());
        let p1 = Arc::new(Partition::allocate(4096).unwrap());
        fabric.register(0, p0.clone()).unwrap();
        fabric.register(1, p1.clone()).unwrap();
        (fabric, p0, p1)
    }

    #[test]
    fn test_write_then_read() {
        let (fabric, _p0, p1) = fabric_with_partitions();
        fabric.write(1, p1.base() + 100, &[1, 2, 3, 4]).unwrap();
        fabric.flush(1, p1.base() + 100, 4).unwrap();

        let mut out = [0u8; 4];
        fabric.read(1, p1.base() + 100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_bounds_are_checked() {
        let (fabric, p0, _p1) = fabric_with_partitions();
        assert!(matches!(
            fabric.write(0, p0.base() + 4094, &[0; 4]),
            Err(SymHeapError::AddressOutOfRange { .. })
        ));
        let mut out = [0u8; 2];
        assert!(fabric.read(0, p0.base() - 2, &mut out).is_err());
        assert!(fabric.write(2, p0.base(), &[1]).is_err());
        assert!(fabric.register(0, p0.clone()).is_err());
    }

    #[test]
    fn test_atomics() {
        let (fabric, p0, _p1) = fabric_with_partitions();
        let addr = p0.base() + 64;
        assert_eq!(fabric.atomic_fetch_add_u64(0, addr, 5).unwrap(), 0);
        assert_eq!(fabric.atomic_fetch_add_u64(0, addr, 1).unwrap(), 5);
        fabric.atomic_store_u64(0, addr, 42).unwrap();
        assert_eq!(fabric.atomic_load_u64(0, addr).unwrap(), 42);
        assert!(fabric.atomic_load_u64(0, addr + 4).is_err());
    }

    #[test]
    fn test_reachability() {
        let (fabric, _p0, p1) = fabric_with_partitions();
        assert!(fabric.reachable(0, 1));
        fabric.disconnect(0, 1);
        assert!(!fabric.reachable(1, 0));
        assert!(fabric.reachable(1, 1));
        assert!(!fabric.reachable(0, 5));

        fabric.deregister(1);
        assert!(matches!(
            fabric.write(1, p1.base(), &[1]),
            Err(SymHeapError::UnreachablePeer { rank: 1 })
        ));
    }
}
