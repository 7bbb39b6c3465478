//! Runtime context: one rank's view of the symmetric heap.
//!
//! A [`Context`] owns the rank's partition, its allocator, the peer table
//! filled in at initialization, and the sync and RMA engines. It replaces
//! every process-wide singleton; it is `Send + Sync`, so the lanes (threads)
//! of a rank share it by reference.
//!
//! ```rust
//! use std::thread;
//! use symheap_rust::{set_attributes, Context};
//!
//! # fn main() -> symheap_rust::Result<()> {
//! let handles: Vec<_> = (0..2)
//!     .map(|rank| {
//!         thread::spawn(move || -> symheap_rust::Result<u64> {
//!             let attrs = set_attributes(rank, 2, 64 * 1024, "local://runtime-doc")?;
//!             let ctx = Context::create(attrs)?;
//!             ctx.init()?;
//!
//!             let slot = ctx.malloc(8)?.cast::<u64>();
//!             ctx.p(slot, 40 + rank as u64, (rank + 1) % 2)?;
//!             ctx.barrier_all()?;
//!             let value = ctx.g(slot, rank)?;
//!
//!             ctx.free(slot)?;
//!             ctx.finalize()?;
//!             Ok(value)
//!         })
//!     })
//!     .collect();
//!
//! let values: Vec<u64> = handles
//!     .into_iter()
//!     .map(|h| h.join().expect("rank panicked"))
//!     .collect::<symheap_rust::Result<_>>()?;
//! assert_eq!(values, vec![41, 40]);
//! # Ok(())
//! # }
//! ```

use crate::config::attributes::Attributes;
use crate::config::core::RuntimeConfig;
use crate::core::constants::*;
use crate::core::error::{Result, SymHeapError};
use crate::core::memory::StagingPool;
use crate::core::types::{Cmp, Element, InitStatus, Rank, RemotePtr, SymPtr};
use crate::fabric::executor::executor_from_config;
use crate::fabric::{Bootstrap, DeviceExecutor, Fabric, LocalWorld, PartitionDescriptor};
use crate::heap::{HeapStats, PeerTable, SymmetricHeap};
use crate::rma::{RmaDescriptor, RmaEngine};
use crate::sync::{CompletionTracker, SyncEngine};
use crate::team::Team;

use parking_lot::{Mutex, RwLock};
use static_assertions::assert_impl_all;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// One rank's runtime state.
pub struct Context {
    attributes: Attributes,
    status: RwLock<InitStatus>,
    heap: SymmetricHeap,
    peers: OnceLock<PeerTable>,
    // Every pair of ranks can address each other; fixed at init.
    fully_connected: OnceLock<bool>,
    fabric: Arc<dyn Fabric>,
    bootstrap: Arc<dyn Bootstrap>,
    local_world: Mutex<Option<Arc<LocalWorld>>>,
    sync: SyncEngine,
    rma: RmaEngine,
}

assert_impl_all!(Context: Send, Sync);

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("rank", &self.attributes.rank())
            .field("world_size", &self.attributes.world_size())
            .field("status", &*self.status.read())
            .field("heap_base", &format_args!("{:#x}", self.heap.base()))
            .field("heap_size", &self.heap.size())
            .field("fabric", &self.fabric.name())
            .finish()
    }
}

impl Context {
    /// Create this rank's context and allocate its partition.
    ///
    /// The rendezvous endpoint selects the transport; `local://<name>`
    /// joins the in-process world of that name.
    pub fn create(attributes: Attributes) -> Result<Self> {
        let world = LocalWorld::join(attributes.endpoint(), attributes.world_size())?;
        let bootstrap: Arc<dyn Bootstrap> = world.bootstrap();
        let fabric: Arc<dyn Fabric> = world.fabric();
        match Self::create_with(attributes, bootstrap, fabric) {
            Ok(context) => {
                *context.local_world.lock() = Some(world);
                Ok(context)
            }
            Err(e) => {
                world.leave();
                Err(e)
            }
        }
    }

    /// Create a context over an explicit rendezvous service and fabric.
    pub fn create_with(
        attributes: Attributes,
        bootstrap: Arc<dyn Bootstrap>,
        fabric: Arc<dyn Fabric>,
    ) -> Result<Self> {
        let rank = attributes.rank();
        let world_size = attributes.world_size();
        if bootstrap.world_size() != world_size {
            return Err(SymHeapError::bootstrap(format!(
                "rendezvous spans {} ranks, attributes say {}",
                bootstrap.world_size(),
                world_size
            )));
        }

        let config = attributes.config().clone();
        config.validate()?;
        crate::core::init_logging(&config.log_level);

        let executor: Arc<dyn DeviceExecutor> = Arc::from(executor_from_config(&config)?);
        let heap = SymmetricHeap::new(attributes.heap_bytes())?;
        fabric.register(rank, heap.partition().clone())?;

        let pool = Arc::new(StagingPool::new(
            config.staging_buffer_bytes,
            config.staging_pool_size,
        ));
        let completion = Arc::new(CompletionTracker::new(world_size, config.spin_before_yield));
        let sync = SyncEngine::new(
            rank,
            fabric.clone(),
            completion.clone(),
            config.spin_before_yield,
        );
        let rma = RmaEngine::new(rank, fabric.clone(), executor, pool, completion);

        log::info!(
            "rank {}/{}: created {} byte partition at {:#x} over {} fabric",
            rank,
            world_size,
            heap.size(),
            heap.base(),
            fabric.name()
        );

        Ok(Context {
            attributes,
            status: RwLock::new(InitStatus::Created),
            heap,
            peers: OnceLock::new(),
            fully_connected: OnceLock::new(),
            fabric,
            bootstrap,
            local_world: Mutex::new(None),
            sync,
            rma,
        })
    }

    /// Collective heap creation: exchange partition descriptors, build the
    /// peer table and rendezvous.
    pub fn init(&self) -> Result<()> {
        let status = *self.status.read();
        if status != InitStatus::Created {
            return Err(SymHeapError::invalid_argument(
                "status",
                status,
                "init requires a freshly created context",
            ));
        }

        let rank = self.my_pe();
        let own = PartitionDescriptor {
            rank,
            base: self.heap.base(),
            size: self.heap.size(),
        };
        let gathered = self.bootstrap.all_gather(rank, own.encode()?)?;
        let descriptors = gathered
            .iter()
            .map(|bytes| PartitionDescriptor::decode(bytes))
            .collect::<Result<Vec<_>>>()?;

        let mut table = PeerTable::new(rank, self.n_pes(), own.base, own.size);
        for (index, descriptor) in descriptors.iter().enumerate() {
            if descriptor.rank != index {
                return Err(SymHeapError::bootstrap(format!(
                    "slot {} carries the descriptor of rank {}",
                    index, descriptor.rank
                )));
            }
            if descriptor.size != own.size {
                return Err(SymHeapError::invalid_argument(
                    "per_rank_heap_bytes",
                    descriptor.size.saturating_sub(SYNC_REGION_BYTES),
                    format!(
                        "rank {} partition differs from rank {} ({} bytes)",
                        descriptor.rank,
                        rank,
                        own.size - SYNC_REGION_BYTES
                    ),
                ));
            }
            if descriptor.rank == rank {
                continue;
            }
            if self.fabric.reachable(rank, descriptor.rank) {
                table.set_peer_base(descriptor.rank, descriptor.base)?;
            } else {
                log::warn!("rank {}: peer {} is unreachable over {}", rank, descriptor.rank, self.fabric.name());
            }
        }

        self.peers
            .set(table)
            .map_err(|_| SymHeapError::internal("peer table already populated"))?;
        let world = self.n_pes();
        let connected = (0..world).all(|a| (0..world).all(|b| self.fabric.reachable(a, b)));
        let _ = self.fully_connected.set(connected);
        self.bootstrap.barrier(rank)?;
        *self.status.write() = InitStatus::Initialized;
        log::info!("rank {}: symmetric heap initialized", rank);
        Ok(())
    }

    /// Complete outstanding work, rendezvous and release the heap.
    pub fn finalize(&self) -> Result<()> {
        self.initialized("finalize")?;
        let rank = self.my_pe();

        let quieted = self.sync.quiet();
        self.bootstrap.barrier(rank)?;

        *self.status.write() = InitStatus::NotInitialized;
        self.heap.reset()?;
        self.fabric.deregister(rank);
        if let Some(world) = self.local_world.lock().take() {
            world.leave();
        }
        log::info!("rank {}: finalized", rank);
        quieted
    }

    /// Current lifecycle state.
    pub fn init_status(&self) -> InitStatus {
        *self.status.read()
    }

    fn initialized(&self, operation: &str) -> Result<&PeerTable> {
        if *self.status.read() != InitStatus::Initialized {
            return Err(SymHeapError::not_initialized(operation));
        }
        self.peers
            .get()
            .ok_or_else(|| SymHeapError::not_initialized(operation))
    }

    /// This rank.
    pub fn my_pe(&self) -> Rank {
        self.attributes.rank()
    }

    /// Number of ranks.
    pub fn n_pes(&self) -> usize {
        self.attributes.world_size()
    }

    /// Attributes the context was created with.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        self.attributes.config()
    }

    /// Base address of this rank's partition.
    pub fn heap_base(&self) -> usize {
        self.heap.base()
    }

    /// Size of every rank's partition, sync region included.
    pub fn heap_size(&self) -> usize {
        self.heap.size()
    }

    /// Staging buffers currently checked out of this rank's pool.
    pub fn staging_in_use(&self) -> usize {
        self.rma.pool().outstanding_count()
    }

    // ---------------------------------------------------------------------
    // Allocation

    fn collective_barrier(&self, peers: &PeerTable) -> Result<()> {
        let quieted = self.sync.quiet();
        // Ranks must agree on the barrier flavour, so this is a world-wide property.
        if self.fully_connected.get().copied().unwrap_or(false) {
            self.sync.sync_all(peers)?;
        } else {
            self.bootstrap.barrier(self.my_pe())?;
        }
        quieted
    }

    fn collective<R>(&self, operation: &str, local: impl FnOnce() -> Result<R>) -> Result<R> {
        let peers = self.initialized(operation)?;
        let result = local();
        if let Err(e) = &result {
            log::warn!("rank {}: {} failed: {}", self.my_pe(), operation, e);
        }
        self.collective_barrier(peers)?;
        result
    }

    fn sym_ptr<T>(&self, offset: usize) -> SymPtr<T> {
        SymPtr::new(self.heap.base() + offset, offset)
    }

    /// Collectively allocate `size` bytes.
    pub fn malloc(&self, size: usize) -> Result<SymPtr<u8>> {
        self.collective("malloc", || {
            let offset = self.heap.with_allocator(|a| a.allocate(size))?;
            Ok(self.sym_ptr(offset))
        })
    }

    /// Collectively allocate `n * size` zero-filled bytes.
    pub fn calloc(&self, n: usize, size: usize) -> Result<SymPtr<u8>> {
        self.collective("calloc", || {
            let bytes = n.checked_mul(size).ok_or_else(|| {
                SymHeapError::invalid_argument("n", n, format!("n * {} overflows", size))
            })?;
            let offset = self.heap.with_allocator(|a| a.allocate(bytes))?;
            let ptr = self.sym_ptr(offset);
            if let Err(e) = self.zero_fill(ptr.addr(), bytes) {
                self.heap.with_allocator(|a| a.release(offset))?;
                return Err(e);
            }
            Ok(ptr)
        })
    }

    fn zero_fill(&self, addr: usize, bytes: usize) -> Result<()> {
        let zeros = vec![0u8; bytes.min(self.config().staging_buffer_bytes)];
        let mut done = 0;
        while done < bytes {
            let n = (bytes - done).min(zeros.len());
            self.fabric.write(self.my_pe(), addr + done, &zeros[..n])?;
            done += n;
        }
        Ok(())
    }

    /// Collectively allocate `size` bytes at an offset that is a multiple
    /// of `alignment`.
    pub fn align(&self, alignment: usize, size: usize) -> Result<SymPtr<u8>> {
        self.collective("align", || {
            let offset = self
                .heap
                .with_allocator(|a| a.allocate_aligned(alignment, size))?;
            Ok(self.sym_ptr(offset))
        })
    }

    /// Collectively release an allocation.
    pub fn free<T>(&self, ptr: SymPtr<T>) -> Result<()> {
        self.collective("free", || {
            self.heap
                .with_allocator(|a| a.release(ptr.offset()))
                .map(|_| ())
        })
    }

    /// Collectively grow or shrink an allocation in place.
    pub fn realloc<T>(&self, ptr: SymPtr<T>, new_size: usize) -> Result<SymPtr<T>> {
        self.collective("realloc", || {
            self.heap
                .with_allocator(|a| a.resize(ptr.offset(), new_size))
                .map(|_| ptr)
        })
    }

    /// Size of the allocation starting at `ptr`.
    pub fn query_size<T>(&self, ptr: SymPtr<T>) -> Result<usize> {
        self.initialized("query_size")?;
        self.heap.with_allocator(|a| a.query_size(ptr.offset()))
    }

    /// Allocator statistics of this rank.
    pub fn heap_stats(&self) -> Result<HeapStats> {
        self.initialized("heap_stats")?;
        Ok(self.heap.stats())
    }

    /// Verify the allocator's structural invariants.
    pub fn check_heap(&self) -> Result<()> {
        self.initialized("check_heap")?;
        self.heap.with_allocator(|a| a.check_invariants())
    }

    // ---------------------------------------------------------------------
    // Addresses

    /// Address of `ptr`'s location in `pe`'s partition, or `None` when the
    /// peer is unreachable or the context is not initialized.
    pub fn ptr<T>(&self, ptr: SymPtr<T>, pe: Rank) -> Option<RemotePtr<T>> {
        let peers = self.initialized("ptr").ok()?;
        peers
            .translate(ptr.addr(), pe)
            .ok()
            .map(|addr| RemotePtr::new(pe, addr))
    }

    /// Translate a raw address in this rank's partition to `pe`'s
    /// partition.
    pub fn translate_addr(&self, addr: usize, pe: Rank) -> Result<usize> {
        self.initialized("translate_addr")?.translate(addr, pe)
    }

    /// Checked conversion of a raw address in this rank's user heap.
    pub fn sym_ptr_from_addr<T>(&self, addr: usize) -> Result<SymPtr<T>> {
        let peers = self.initialized("sym_ptr_from_addr")?;
        let user_base = peers.heap_base() + USER_HEAP_OFFSET;
        let user_size = peers.heap_size() - USER_HEAP_OFFSET;
        let end = addr.checked_add(std::mem::size_of::<T>().max(1));
        if addr < user_base || end.map_or(true, |end| end > user_base + user_size) {
            return Err(SymHeapError::address_out_of_range(addr, user_base, user_size));
        }
        Ok(SymPtr::new(addr, addr - peers.heap_base()))
    }

    // ---------------------------------------------------------------------
    // Teams

    /// Team of every rank.
    pub fn team_world(&self) -> Result<Team> {
        self.initialized("team_world")?;
        Team::world(self.my_pe(), self.n_pes())
    }

    /// Strided sub-team of `parent`.
    pub fn team_split_strided(
        &self,
        parent: &Team,
        start: usize,
        stride: usize,
        size: usize,
    ) -> Result<Team> {
        self.initialized("team_split_strided")?;
        Team::split_strided(parent, start, stride, size)
    }

    // ---------------------------------------------------------------------
    // Synchronization

    /// Complete outstanding operations and rendezvous with every rank.
    pub fn barrier_all(&self) -> Result<()> {
        let peers = self.initialized("barrier_all")?;
        self.sync.barrier_all(peers).map(|_| ())
    }

    /// Rendezvous with every rank without completing outstanding
    /// operations.
    pub fn sync_all(&self) -> Result<()> {
        let peers = self.initialized("sync_all")?;
        self.sync.sync_all(peers).map(|_| ())
    }

    /// Order operations issued so far before later ones, per destination.
    pub fn fence(&self) -> Result<()> {
        self.initialized("fence")?;
        self.sync.fence();
        Ok(())
    }

    /// Wait until every outstanding operation of this rank has completed.
    pub fn quiet(&self) -> Result<()> {
        self.initialized("quiet")?;
        self.sync.quiet()
    }

    /// Number of barriers this rank has entered.
    pub fn barrier_count(&self) -> Result<u64> {
        let peers = self.initialized("barrier_count")?;
        self.sync.generation(peers)
    }

    /// Barrier counter of `peer` as last observed by this rank.
    pub fn observed_count(&self, peer: Rank) -> Result<u64> {
        let peers = self.initialized("observed_count")?;
        self.sync.observed(peers, peer)
    }

    fn signal_target(&self, operation: &str, dst: SymPtr<u64>, pe: Rank) -> Result<usize> {
        let peers = self.initialized(operation)?;
        peers.translate_range(dst.addr(), std::mem::size_of::<u64>(), pe)
    }

    /// Atomically store `value` into `dst` on `pe`, ordered after fenced
    /// operations.
    pub fn signal_set(&self, dst: SymPtr<u64>, value: u64, pe: Rank) -> Result<()> {
        let remote = self.signal_target("signal_set", dst, pe)?;
        self.sync.signal_set(pe, remote, value)
    }

    /// Atomically add `value` to `dst` on `pe`, returning the previous
    /// value.
    pub fn signal_add(&self, dst: SymPtr<u64>, value: u64, pe: Rank) -> Result<u64> {
        let remote = self.signal_target("signal_add", dst, pe)?;
        self.sync.signal_add(pe, remote, value)
    }

    /// Block until the local word `ivar` satisfies `cmp` against `value`.
    pub fn wait_until(&self, ivar: SymPtr<u64>, cmp: Cmp, value: u64) -> Result<u64> {
        let peers = self.initialized("wait_until")?;
        let addr = peers.translate_range(ivar.addr(), std::mem::size_of::<u64>(), self.my_pe())?;
        self.sync.wait_until(addr, cmp, value)
    }

    // ---------------------------------------------------------------------
    // RMA

    /// Blocking put of `src` to `dst` on `pe`.
    pub fn put<T: Element>(&self, dst: SymPtr<T>, src: &[T], pe: Rank) -> Result<()> {
        let peers = self.initialized("put")?;
        self.rma.put(peers, dst, src, pe)
    }

    /// Non-blocking put; `quiet` completes it.
    pub fn put_nbi<T: Element>(&self, dst: SymPtr<T>, src: &[T], pe: Rank) -> Result<()> {
        let peers = self.initialized("put_nbi")?;
        self.rma.put_nbi(peers, dst, src, pe)
    }

    /// Blocking strided put.
    pub fn iput<T: Element>(
        &self,
        dst: SymPtr<T>,
        src: &[T],
        descriptor: RmaDescriptor,
        pe: Rank,
    ) -> Result<()> {
        let peers = self.initialized("iput")?;
        self.rma.iput(peers, dst, src, descriptor, pe)
    }

    /// Non-blocking strided put.
    pub fn iput_nbi<T: Element>(
        &self,
        dst: SymPtr<T>,
        src: &[T],
        descriptor: RmaDescriptor,
        pe: Rank,
    ) -> Result<()> {
        let peers = self.initialized("iput_nbi")?;
        self.rma.iput_nbi(peers, dst, src, descriptor, pe)
    }

    /// Blocking get of `dst.len()` elements from `src` on `pe`.
    pub fn get<T: Element>(&self, dst: &mut [T], src: SymPtr<T>, pe: Rank) -> Result<()> {
        let peers = self.initialized("get")?;
        self.rma.get(peers, dst, src, pe)
    }

    /// Non-blocking get into this rank's own heap; `quiet` completes it.
    pub fn get_nbi<T: Element>(
        &self,
        dst: SymPtr<T>,
        src: SymPtr<T>,
        count: usize,
        pe: Rank,
    ) -> Result<()> {
        let peers = self.initialized("get_nbi")?;
        self.rma.get_nbi(peers, dst, src, count, pe)
    }

    /// Blocking strided get.
    pub fn iget<T: Element>(
        &self,
        dst: &mut [T],
        src: SymPtr<T>,
        descriptor: RmaDescriptor,
        pe: Rank,
    ) -> Result<()> {
        let peers = self.initialized("iget")?;
        self.rma.iget(peers, dst, src, descriptor, pe)
    }

    /// Blocking get into a new vector.
    pub fn get_vec<T: Element>(&self, src: SymPtr<T>, count: usize, pe: Rank) -> Result<Vec<T>> {
        let mut values = vec![T::zero(); count];
        self.get(&mut values, src, pe)?;
        Ok(values)
    }

    /// Scalar put, flushed so a later remote read observes it.
    pub fn p<T: Element>(&self, dst: SymPtr<T>, value: T, pe: Rank) -> Result<()> {
        let peers = self.initialized("p")?;
        self.rma.p(peers, dst, value, pe)
    }

    /// Scalar get.
    pub fn g<T: Element>(&self, src: SymPtr<T>, pe: Rank) -> Result<T> {
        let peers = self.initialized("g")?;
        self.rma.g(peers, src, pe)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.sync.quiet() {
            log::warn!("rank {}: dropped with a failed transfer: {}", self.my_pe(), e);
        }
        if *self.status.read() != InitStatus::NotInitialized {
            self.fabric.deregister(self.my_pe());
        }
        if let Some(world) = self.local_world.lock().take() {
            world.leave();
        }
    }
}
