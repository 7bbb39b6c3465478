//! Synchronization engine: barrier, fence, quiet and word signalling.
//!
//! The barrier is a counter rendezvous inside the reserved sync region of
//! every partition. Each rank bumps its own counter to the next generation
//! and then waits until it has seen every peer's counter reach that
//! generation, recording what it saw in its own `observed` array. There is
//! no timeout; a rank that never arrives keeps the others waiting.

pub mod completion;

pub use completion::CompletionTracker;

use crate::core::constants::*;
use crate::core::error::{Result, SymHeapError};
use crate::core::types::{Cmp, Rank};
use crate::fabric::Fabric;
use crate::heap::PeerTable;

use std::sync::Arc;

/// Bounded busy spin that degrades to yielding the thread.
#[derive(Debug)]
pub(crate) struct Backoff {
    spins: u32,
    limit: u32,
}

impl Backoff {
    pub(crate) fn new(limit: u32) -> Self {
        Backoff { spins: 0, limit }
    }

    pub(crate) fn snooze(&mut self) {
        if self.spins < self.limit {
            self.spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

/// Barrier and signalling state of one rank.
#[derive(Debug)]
pub struct SyncEngine {
    rank: Rank,
    fabric: Arc<dyn Fabric>,
    completion: Arc<CompletionTracker>,
    spin_before_yield: u32,
}

fn counter_addr(base: usize) -> usize {
    base + SYNC_COUNTER_OFFSET
}

fn observed_addr(base: usize, rank: Rank) -> usize {
    base + SYNC_OBSERVED_OFFSET + rank * std::mem::size_of::<u64>()
}

impl SyncEngine {
    /// Engine for `rank`, sharing `completion` with the RMA engine.
    pub fn new(
        rank: Rank,
        fabric: Arc<dyn Fabric>,
        completion: Arc<CompletionTracker>,
        spin_before_yield: u32,
    ) -> Self {
        SyncEngine {
            rank,
            fabric,
            completion,
            spin_before_yield,
        }
    }

    /// Completion tracker shared with the RMA engine.
    pub fn completion(&self) -> &Arc<CompletionTracker> {
        &self.completion
    }

    fn spin_until(&self, mut done: impl FnMut() -> Result<bool>) -> Result<()> {
        let mut backoff = Backoff::new(self.spin_before_yield);
        while !done()? {
            backoff.snooze();
        }
        Ok(())
    }

    fn peer_base(&self, peers: &PeerTable, rank: Rank) -> Result<usize> {
        peers
            .peer_base(rank)
            .ok_or_else(|| SymHeapError::unreachable_peer(rank))
    }

    /// Counter rendezvous across every rank. Returns the generation reached.
    pub fn sync_all(&self, peers: &PeerTable) -> Result<u64> {
        let bases = (0..peers.world_size())
            .map(|rank| self.peer_base(peers, rank))
            .collect::<Result<Vec<_>>>()?;
        let own_base = bases[self.rank];

        let generation = self
            .fabric
            .atomic_fetch_add_u64(self.rank, counter_addr(own_base), 1)?
            + 1;
        log::trace!("rank {} entered barrier generation {}", self.rank, generation);

        for (peer, &base) in bases.iter().enumerate() {
            let seen = if peer == self.rank {
                generation
            } else {
                let mut seen = 0;
                self.spin_until(|| {
                    seen = self.fabric.atomic_load_u64(peer, counter_addr(base))?;
                    Ok(seen >= generation)
                })?;
                seen
            };
            self.fabric
                .atomic_store_u64(self.rank, observed_addr(own_base, peer), seen)?;
        }

        log::trace!("rank {} left barrier generation {}", self.rank, generation);
        Ok(generation)
    }

    /// Complete all outstanding operations, then rendezvous.
    ///
    /// The rendezvous happens even when `quiet` reports a failed transfer;
    /// that failure is returned afterwards.
    pub fn barrier_all(&self, peers: &PeerTable) -> Result<u64> {
        let quieted = self.quiet();
        let generation = self.sync_all(peers)?;
        quieted.map(|()| generation)
    }

    /// Order operations issued so far before later ones, per destination.
    pub fn fence(&self) {
        self.completion.fence();
    }

    /// Wait for every outstanding non-blocking operation to complete.
    pub fn quiet(&self) -> Result<()> {
        self.completion.quiet()
    }

    /// This rank's barrier counter.
    pub fn generation(&self, peers: &PeerTable) -> Result<u64> {
        self.fabric
            .atomic_load_u64(self.rank, counter_addr(peers.heap_base()))
    }

    /// Last counter value this rank observed for `peer`.
    pub fn observed(&self, peers: &PeerTable, peer: Rank) -> Result<u64> {
        if peer >= peers.world_size() {
            return Err(SymHeapError::invalid_argument(
                "peer",
                peer,
                format!("world has {} ranks", peers.world_size()),
            ));
        }
        self.fabric
            .atomic_load_u64(self.rank, observed_addr(peers.heap_base(), peer))
    }

    /// Store `value` into the word at `remote_addr` on `rank`, after
    /// everything fenced to that rank.
    pub fn signal_set(&self, rank: Rank, remote_addr: usize, value: u64) -> Result<()> {
        self.completion.wait_fence(rank);
        self.fabric.atomic_store_u64(rank, remote_addr, value)
    }

    /// Add `value` to the word at `remote_addr` on `rank`, after everything
    /// fenced to that rank. Returns the previous value.
    pub fn signal_add(&self, rank: Rank, remote_addr: usize, value: u64) -> Result<u64> {
        self.completion.wait_fence(rank);
        self.fabric.atomic_fetch_add_u64(rank, remote_addr, value)
    }

    /// Spin until the local word at `addr` satisfies `cmp` against `value`.
    pub fn wait_until(&self, addr: usize, cmp: Cmp, value: u64) -> Result<u64> {
        let mut observed = 0;
        self.spin_until(|| {
            observed = self.fabric.atomic_load_u64(self.rank, addr)?;
            Ok(cmp.holds(observed, value))
        })?;
        Ok(observed)
    }
}
