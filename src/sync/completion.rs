//! Per-destination completion counters behind `fence` and `quiet`.
//!
//! Every non-blocking operation bumps `issued` for its destination when it
//! is queued and `completed` when its last byte has landed. `fence` is
//! lazy: it only records how many operations had been issued to each
//! destination, and the next operation to that destination waits for them
//! before it is queued. `quiet` drains everything and reports the first
//! deferred operation that failed since the previous `quiet`.

use crate::core::error::{Result, SymHeapError};
use crate::core::types::Rank;
use crate::sync::Backoff;

use parking_lot::Mutex;
use std::sync::atomic::{self, AtomicU64, Ordering};

#[derive(Debug, Default)]
#[repr(align(64))]
struct PeerCounters {
    issued: AtomicU64,
    completed: AtomicU64,
    fence_mark: AtomicU64,
}

/// Issued / completed bookkeeping for one rank's outgoing operations.
#[derive(Debug)]
pub struct CompletionTracker {
    peers: Vec<PeerCounters>,
    failures: Mutex<Vec<(Rank, SymHeapError)>>,
    spin_before_yield: u32,
}

impl CompletionTracker {
    /// Tracker for a world of `world_size` destinations.
    pub fn new(world_size: usize, spin_before_yield: u32) -> Self {
        CompletionTracker {
            peers: (0..world_size).map(|_| PeerCounters::default()).collect(),
            failures: Mutex::new(Vec::new()),
            spin_before_yield,
        }
    }

    fn counters(&self, rank: Rank) -> &PeerCounters {
        &self.peers[rank]
    }

    /// Block until every operation issued to `rank` before the latest
    /// `fence` has completed.
    pub fn wait_fence(&self, rank: Rank) {
        let counters = self.counters(rank);
        let mark = counters.fence_mark.load(Ordering::Acquire);
        let mut backoff = Backoff::new(self.spin_before_yield);
        while counters.completed.load(Ordering::Acquire) < mark {
            backoff.snooze();
        }
    }

    /// Record a new non-blocking operation to `rank`.
    ///
    /// Waits on the fence gate first, so the operation cannot overtake
    /// anything fenced before it.
    pub fn issue(&self, rank: Rank) {
        self.wait_fence(rank);
        self.counters(rank).issued.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one operation to `rank` as complete.
    pub fn complete(&self, rank: Rank) {
        self.counters(rank).completed.fetch_add(1, Ordering::Release);
    }

    /// Mark one operation to `rank` as finished without its data landing.
    pub fn fail(&self, rank: Rank, error: SymHeapError) {
        log::error!("deferred operation to rank {} failed: {}", rank, error);
        self.failures.lock().push((rank, error));
        self.complete(rank);
    }

    /// Deferred failures recorded since the last `quiet`.
    pub fn failure_count(&self) -> usize {
        self.failures.lock().len()
    }

    /// Order everything issued so far before anything issued later, per
    /// destination.
    pub fn fence(&self) {
        for counters in &self.peers {
            let issued = counters.issued.load(Ordering::Acquire);
            counters.fence_mark.fetch_max(issued, Ordering::AcqRel);
        }
    }

    /// Block until every issued operation has finished, then issue a full
    /// memory fence.
    ///
    /// Fails with the first deferred failure recorded since the previous
    /// call; the rest are logged and dropped.
    pub fn quiet(&self) -> Result<()> {
        let mut backoff = Backoff::new(self.spin_before_yield);
        for counters in &self.peers {
            let issued = counters.issued.load(Ordering::Acquire);
            while counters.completed.load(Ordering::Acquire) < issued {
                backoff.snooze();
            }
        }
        atomic::fence(Ordering::SeqCst);

        let mut failures = std::mem::take(&mut *self.failures.lock());
        if failures.is_empty() {
            return Ok(());
        }
        if failures.len() > 1 {
            log::warn!("{} deferred operations failed before quiet", failures.len());
        }
        let (rank, error) = failures.swap_remove(0);
        log::warn!("quiet: reporting failed transfer to rank {}", rank);
        Err(error)
    }

    /// Operations to `rank` that have been issued but not completed.
    pub fn outstanding(&self, rank: Rank) -> u64 {
        let counters = self.counters(rank);
        let completed = counters.completed.load(Ordering::Acquire);
        counters
            .issued
            .load(Ordering::Acquire)
            .saturating_sub(completed)
    }

    /// Outstanding operations across all destinations.
    pub fn total_outstanding(&self) -> u64 {
        (0..self.peers.len()).map(|rank| self.outstanding(rank)).sum()
    }
}
