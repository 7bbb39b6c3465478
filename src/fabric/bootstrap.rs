//! Rendezvous service used once at heap creation and at teardown.
//!
//! Ranks exchange opaque descriptors through [`Bootstrap::all_gather`]. The
//! in-process implementation keys worlds by endpoint name
//! (`local://<name>`) in a process-wide registry, so threads that pass the
//! same endpoint end up sharing one rendezvous and one fabric.

use crate::core::constants::LOCAL_ENDPOINT_SCHEME;
use crate::core::error::{Result, SymHeapError};
use crate::core::types::Rank;
use crate::fabric::LoadStoreFabric;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Descriptor each rank publishes during heap creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    /// Publishing rank
    pub rank: Rank,
    /// Partition base address
    pub base: usize,
    /// Partition size in bytes
    pub size: usize,
}

impl PartitionDescriptor {
    /// Serialize for exchange.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a peer's descriptor.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Collective exchange of opaque payloads between all ranks of a world.
pub trait Bootstrap: Send + Sync + fmt::Debug {
    /// Number of participating ranks.
    fn world_size(&self) -> usize;

    /// Contribute `payload` as `rank` and return every rank's payload,
    /// indexed by rank. Blocks until all ranks have contributed.
    fn all_gather(&self, rank: Rank, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Rendezvous without data.
    fn barrier(&self, rank: Rank) -> Result<()> {
        self.all_gather(rank, Vec::new()).map(|_| ())
    }
}

#[derive(Debug, Default)]
struct Round {
    slots: Vec<Option<Vec<u8>>>,
    arrived: usize,
    departed: usize,
}

#[derive(Debug)]
struct GatherState {
    // Number of rounds each rank has entered.
    entered: Vec<u64>,
    rounds: HashMap<u64, Round>,
}

/// In-process rendezvous over a mutex and condition variable.
#[derive(Debug)]
pub struct LocalBootstrap {
    world_size: usize,
    state: Mutex<GatherState>,
    arrived: Condvar,
}

impl LocalBootstrap {
    /// Rendezvous for `world_size` ranks.
    pub fn new(world_size: usize) -> Self {
        LocalBootstrap {
            world_size,
            state: Mutex::new(GatherState {
                entered: vec![0; world_size],
                rounds: HashMap::new(),
            }),
            arrived: Condvar::new(),
        }
    }
}

impl Bootstrap for LocalBootstrap {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, rank: Rank, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        if rank >= self.world_size {
            return Err(SymHeapError::invalid_argument(
                "rank",
                rank,
                format!("rendezvous spans {} ranks", self.world_size),
            ));
        }

        let mut state = self.state.lock();
        let round_id = state.entered[rank];
        state.entered[rank] += 1;

        let world_size = self.world_size;
        let round = state.rounds.entry(round_id).or_insert_with(|| Round {
            slots: vec![None; world_size],
            ..Round::default()
        });
        round.slots[rank] = Some(payload);
        round.arrived += 1;
        if round.arrived == world_size {
            self.arrived.notify_all();
        }

        loop {
            let complete = state
                .rounds
                .get(&round_id)
                .map_or(false, |round| round.arrived == world_size);
            if complete {
                break;
            }
            self.arrived.wait(&mut state);
        }

        let round = state
            .rounds
            .get_mut(&round_id)
            .ok_or_else(|| SymHeapError::internal("rendezvous round vanished"))?;
        let gathered = round
            .slots
            .iter()
            .map(|slot| slot.clone().unwrap_or_default())
            .collect();
        round.departed += 1;
        if round.departed == world_size {
            state.rounds.remove(&round_id);
        }
        Ok(gathered)
    }
}

/// Rendezvous and fabric shared by every rank of one in-process world.
#[derive(Debug)]
pub struct LocalWorld {
    endpoint: String,
    world_size: usize,
    bootstrap: Arc<LocalBootstrap>,
    fabric: Arc<LoadStoreFabric>,
    members: Mutex<usize>,
}

static LOCAL_WORLDS: OnceLock<Mutex<HashMap<String, Arc<LocalWorld>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<LocalWorld>>> {
    LOCAL_WORLDS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl LocalWorld {
    /// Join the world named by a `local://` endpoint, creating it on first
    /// use.
    pub fn join(endpoint: &str, world_size: usize) -> Result<Arc<LocalWorld>> {
        if !endpoint.starts_with(LOCAL_ENDPOINT_SCHEME) {
            return Err(SymHeapError::config(format!(
                "unsupported rendezvous endpoint '{}', expected {}<name>",
                endpoint, LOCAL_ENDPOINT_SCHEME
            )));
        }

        let mut worlds = registry().lock();
        let world = worlds
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                log::debug!("Creating local world '{}' of {} ranks", endpoint, world_size);
                Arc::new(LocalWorld {
                    endpoint: endpoint.to_string(),
                    world_size,
                    bootstrap: Arc::new(LocalBootstrap::new(world_size)),
                    fabric: Arc::new(LoadStoreFabric::new(world_size)),
                    members: Mutex::new(0),
                })
            })
            .clone();

        if world.world_size != world_size {
            return Err(SymHeapError::bootstrap(format!(
                "endpoint '{}' hosts a world of {} ranks, not {}",
                endpoint, world.world_size, world_size
            )));
        }
        *world.members.lock() += 1;
        Ok(world)
    }

    /// Leave the world; the last member removes it from the registry.
    pub fn leave(&self) {
        let mut worlds = registry().lock();
        let mut members = self.members.lock();
        *members = members.saturating_sub(1);
        if *members == 0 {
            worlds.remove(&self.endpoint);
            log::debug!("Local world '{}' closed", self.endpoint);
        }
    }

    /// Endpoint name.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Shared rendezvous.
    pub fn bootstrap(&self) -> Arc<LocalBootstrap> {
        self.bootstrap.clone()
    }

    /// Shared fabric.
    pub fn fabric(&self) -> Arc<LoadStoreFabric> {
        self.fabric.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_descriptor_encoding() {
        let descriptor = PartitionDescriptor {
            rank: 3,
            base: 0x7f00_0000,
            size: 1 << 20,
        };
        let bytes = descriptor.encode().unwrap();
        assert_eq!(PartitionDescriptor::decode(&bytes).unwrap(), descriptor);
        assert!(PartitionDescriptor::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn test_all_gather_orders_by_rank() {
        let bootstrap = Arc::new(LocalBootstrap::new(4));
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let bootstrap = bootstrap.clone();
                thread::spawn(move || {
                    let first = bootstrap.all_gather(rank, vec![rank as u8]).unwrap();
                    let second = bootstrap.all_gather(rank, vec![10 + rank as u8]).unwrap();
                    bootstrap.barrier(rank).unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, vec![vec![0], vec![1], vec![2], vec![3]]);
            assert_eq!(second, vec![vec![10], vec![11], vec![12], vec![13]]);
        }
        assert!(bootstrap.state.lock().rounds.is_empty());
    }

    #[test]
    fn test_all_gather_rejects_bad_rank() {
        let bootstrap = LocalBootstrap::new(2);
        assert!(bootstrap.all_gather(2, Vec::new()).is_err());
    }

    #[test]
    fn test_local_world_registry() {
        let a = LocalWorld::join("local://bootstrap-registry-test", 2).unwrap();
        let b = LocalWorld::join("local://bootstrap-registry-test", 2).unwrap();
        assert!(Arc::ptr_eq(&a.fabric(), &b.fabric()));
        assert!(LocalWorld::join("local://bootstrap-registry-test", 3).is_err());
        assert!(LocalWorld::join("tcp://host:1234", 2).is_err());

        a.leave();
        b.leave();
        let c = LocalWorld::join("local://bootstrap-registry-test", 3).unwrap();
        assert_eq!(c.world_size, 3);
        c.leave();
    }
}
