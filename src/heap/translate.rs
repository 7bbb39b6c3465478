//! Address translation between the caller's partition and its peers'.
//!
//! All partitions have the same size and the allocator is deterministic, so
//! a location is identified on every rank by its offset from the partition
//! base. Translation is offset-preserving:
//! `translated = peer_base[rank] + (addr - heap_base)`.

use crate::core::error::{Result, SymHeapError};
use crate::core::types::Rank;

/// Partition bases of every rank, as seen from this rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTable {
    my_rank: Rank,
    heap_base: usize,
    heap_size: usize,
    peer_base: Vec<Option<usize>>,
}

impl PeerTable {
    /// Table for a world of `world_size` ranks where only this rank's own
    /// partition is known.
    pub fn new(my_rank: Rank, world_size: usize, heap_base: usize, heap_size: usize) -> Self {
        let mut peer_base = vec![None; world_size];
        if let Some(slot) = peer_base.get_mut(my_rank) {
            *slot = Some(heap_base);
        }
        PeerTable {
            my_rank,
            heap_base,
            heap_size,
            peer_base,
        }
    }

    /// Record the partition base of a reachable peer.
    pub fn set_peer_base(&mut self, rank: Rank, base: usize) -> Result<()> {
        let world = self.peer_base.len();
        let slot = self.peer_base.get_mut(rank).ok_or_else(|| {
            SymHeapError::invalid_argument("rank", rank, format!("world has {} ranks", world))
        })?;
        *slot = Some(base);
        Ok(())
    }

    /// Base address of this rank's partition.
    pub fn heap_base(&self) -> usize {
        self.heap_base
    }

    /// Size of every partition.
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Number of ranks.
    pub fn world_size(&self) -> usize {
        self.peer_base.len()
    }

    /// Partition base of `rank`, or `None` when it is not reachable.
    pub fn peer_base(&self, rank: Rank) -> Option<usize> {
        self.peer_base.get(rank).copied().flatten()
    }

    /// Whether `rank` has a mapped partition.
    pub fn is_reachable(&self, rank: Rank) -> bool {
        self.peer_base(rank).is_some()
    }

    /// Whether `[addr, addr + len)` lies inside this rank's partition.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.heap_base
            && addr
                .checked_add(len)
                .map_or(false, |end| end <= self.heap_base + self.heap_size)
    }

    /// Offset of `addr` from the local partition base.
    pub fn offset_of(&self, addr: usize) -> Result<usize> {
        if !self.contains(addr, 1) {
            return Err(SymHeapError::address_out_of_range(
                addr,
                self.heap_base,
                self.heap_size,
            ));
        }
        Ok(addr - self.heap_base)
    }

    /// Translate a local heap address to the equivalent address in `rank`'s
    /// partition.
    pub fn translate(&self, addr: usize, rank: Rank) -> Result<usize> {
        if rank >= self.world_size() {
            return Err(SymHeapError::invalid_argument(
                "rank",
                rank,
                format!("world has {} ranks", self.world_size()),
            ));
        }
        let offset = self.offset_of(addr)?;
        if rank == self.my_rank {
            return Ok(addr);
        }
        let base = self
            .peer_base(rank)
            .ok_or_else(|| SymHeapError::unreachable_peer(rank))?;
        Ok(base + offset)
    }

    /// Translate a byte range, checking that all of it lies in the
    /// partition.
    pub fn translate_range(&self, addr: usize, len: usize, rank: Rank) -> Result<usize> {
        if !self.contains(addr, len) {
            return Err(SymHeapError::address_out_of_range(
                addr,
                self.heap_base,
                self.heap_size,
            ));
        }
        self.translate(addr, rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PeerTable {
        let mut table = PeerTable::new(1, 4, 0x10_0000, 0x4000);
        table.set_peer_base(0, 0x20_0000).unwrap();
        table.set_peer_base(2, 0x30_0000).unwrap();
        table
    }

    #[test]
    fn test_translate_to_self_is_identity() {
        let table = table();
        for addr in [0x10_0000, 0x10_0010, 0x10_3fff] {
            assert_eq!(table.translate(addr, 1).unwrap(), addr);
        }
    }

    #[test]
    fn test_translate_preserves_offset() {
        let table = table();
        assert_eq!(table.translate(0x10_0040, 0).unwrap(), 0x20_0040);
        assert_eq!(table.translate(0x10_3ff0, 2).unwrap(), 0x30_3ff0);
    }

    #[test]
    fn test_translate_errors() {
        let mut table = table();
        assert!(matches!(
            table.translate(0x10_0040, 3),
            Err(SymHeapError::UnreachablePeer { rank: 3 })
        ));
        assert!(matches!(
            table.translate(0x10_0040, 4),
            Err(SymHeapError::InvalidArgument { .. })
        ));
        assert!(matches!(
            table.translate(0x10_4000, 0),
            Err(SymHeapError::AddressOutOfRange { .. })
        ));
        assert!(matches!(
            table.translate(0x0f_ffff, 1),
            Err(SymHeapError::AddressOutOfRange { .. })
        ));
        assert!(table.translate_range(0x10_3ff0, 32, 0).is_err());
        assert!(table.set_peer_base(9, 0).is_err());
    }

    #[test]
    fn test_reachability() {
        let table = table();
        assert!(table.is_reachable(0));
        assert!(table.is_reachable(1));
        assert!(!table.is_reachable(3));
        assert!(!table.is_reachable(100));
        assert_eq!(table.offset_of(0x10_0100).unwrap(), 0x100);
    }
}
