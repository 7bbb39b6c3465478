//! RMA transfer engine: put and get between compute-local memory and peer
//! partitions.
//!
//! Every operation resolves its remote side through the [`PeerTable`]
//! before touching a byte, so an unreachable peer or an out-of-range
//! address fails with no partial transfer. Blocking operations return once
//! the destination holds the data. Non-blocking ones return once queued;
//! `quiet` establishes their completion.

pub mod descriptor;
pub mod staging;

pub use descriptor::{ByteLayout, RmaDescriptor};
pub use staging::{copy_staged, RemoteRegion, Sink, Source, StagedBytes};

use crate::core::error::{Result, SymHeapError};
use crate::core::memory::StagingPool;
use crate::core::types::{as_bytes, as_bytes_mut, Element, Rank, SymPtr};
use crate::fabric::{DeviceExecutor, Fabric};
use crate::heap::PeerTable;
use crate::sync::CompletionTracker;

use std::sync::Arc;

/// Data movement state of one rank.
#[derive(Debug)]
pub struct RmaEngine {
    rank: Rank,
    fabric: Arc<dyn Fabric>,
    executor: Arc<dyn DeviceExecutor>,
    pool: Arc<StagingPool>,
    completion: Arc<CompletionTracker>,
}

impl RmaEngine {
    /// Engine for `rank`, sharing `completion` with the sync engine.
    pub fn new(
        rank: Rank,
        fabric: Arc<dyn Fabric>,
        executor: Arc<dyn DeviceExecutor>,
        pool: Arc<StagingPool>,
        completion: Arc<CompletionTracker>,
    ) -> Self {
        RmaEngine {
            rank,
            fabric,
            executor,
            pool,
            completion,
        }
    }

    /// Staging pool used by this engine.
    pub fn pool(&self) -> &Arc<StagingPool> {
        &self.pool
    }

    fn layout<T: Element>(descriptor: &RmaDescriptor) -> Result<ByteLayout> {
        descriptor.byte_layout(std::mem::size_of::<T>())
    }

    fn check_local_extent(name: &str, len: usize, extent: usize) -> Result<()> {
        if extent > len {
            return Err(SymHeapError::invalid_argument(
                name,
                len,
                format!("slice too short for an extent of {} elements", extent),
            ));
        }
        Ok(())
    }

    fn region(&self, peers: &PeerTable, addr: usize, extent: usize, pe: Rank) -> Result<RemoteRegion> {
        let remote = peers.translate_range(addr, extent, pe)?;
        Ok(RemoteRegion::new(self.fabric.clone(), pe, remote, extent))
    }

    /// Blocking strided put of `src` into `dst` on `pe`.
    pub fn iput<T: Element>(
        &self,
        peers: &PeerTable,
        dst: SymPtr<T>,
        src: &[T],
        descriptor: RmaDescriptor,
        pe: Rank,
    ) -> Result<()> {
        let layout = Self::layout::<T>(&descriptor)?;
        Self::check_local_extent("src", src.len(), descriptor.src_extent()?)?;
        let mut region = self.region(peers, dst.addr(), layout.dst_extent(), pe)?;

        self.completion.wait_fence(pe);
        copy_staged(&self.pool, as_bytes(src), &mut region, &layout)?;
        log::debug!(
            "rank {} put {} bytes to rank {} at offset {:#x}",
            self.rank,
            layout.total_bytes(),
            pe,
            dst.offset()
        );
        Ok(())
    }

    /// Blocking contiguous put.
    pub fn put<T: Element>(&self, peers: &PeerTable, dst: SymPtr<T>, src: &[T], pe: Rank) -> Result<()> {
        if src.is_empty() {
            return self.check_empty(peers, dst.addr(), pe);
        }
        self.iput(peers, dst, src, RmaDescriptor::contiguous(src.len()), pe)
    }

    /// Non-blocking strided put. The source is staged before returning.
    ///
    /// Staging takes pooled buffers only while one stays free for blocking
    /// traffic; a payload that does not fit is copied synchronously instead.
    pub fn iput_nbi<T: Element>(
        &self,
        peers: &PeerTable,
        dst: SymPtr<T>,
        src: &[T],
        descriptor: RmaDescriptor,
        pe: Rank,
    ) -> Result<()> {
        let layout = Self::layout::<T>(&descriptor)?;
        Self::check_local_extent("src", src.len(), descriptor.src_extent()?)?;
        let mut region = self.region(peers, dst.addr(), layout.dst_extent(), pe)?;

        let staged = match StagedBytes::try_capture(&self.pool, as_bytes(src), &layout, 1)? {
            Some(staged) => staged,
            None => {
                log::debug!(
                    "rank {} put of {} bytes to rank {} exceeds free staging, copying now",
                    self.rank,
                    layout.total_bytes(),
                    pe
                );
                self.completion.wait_fence(pe);
                copy_staged(&self.pool, as_bytes(src), &mut region, &layout)?;
                return Ok(());
            }
        };
        self.completion.issue(pe);

        let pool = self.pool.clone();
        let completion = self.completion.clone();
        self.executor.submit(Box::new(move || {
            match staged.drain_into(&mut region, &layout) {
                Ok(_) => completion.complete(pe),
                Err(e) => completion.fail(pe, e),
            }
            staged.release(&pool);
        }));
        log::debug!(
            "rank {} queued put of {} bytes to rank {} at offset {:#x}",
            self.rank,
            layout.total_bytes(),
            pe,
            dst.offset()
        );
        Ok(())
    }

    /// Non-blocking contiguous put.
    pub fn put_nbi<T: Element>(&self, peers: &PeerTable, dst: SymPtr<T>, src: &[T], pe: Rank) -> Result<()> {
        if src.is_empty() {
            return self.check_empty(peers, dst.addr(), pe);
        }
        self.iput_nbi(peers, dst, src, RmaDescriptor::contiguous(src.len()), pe)
    }

    /// Blocking strided get of `src` on `pe` into `dst`.
    pub fn iget<T: Element>(
        &self,
        peers: &PeerTable,
        dst: &mut [T],
        src: SymPtr<T>,
        descriptor: RmaDescriptor,
        pe: Rank,
    ) -> Result<()> {
        let layout = Self::layout::<T>(&descriptor)?;
        Self::check_local_extent("dst", dst.len(), descriptor.dst_extent()?)?;
        let region = self.region(peers, src.addr(), layout.src_extent(), pe)?;

        self.completion.wait_fence(pe);
        copy_staged(&self.pool, &region, as_bytes_mut(dst), &layout)?;
        log::debug!(
            "rank {} got {} bytes from rank {} at offset {:#x}",
            self.rank,
            layout.total_bytes(),
            pe,
            src.offset()
        );
        Ok(())
    }

    /// Blocking contiguous get.
    pub fn get<T: Element>(&self, peers: &PeerTable, dst: &mut [T], src: SymPtr<T>, pe: Rank) -> Result<()> {
        if dst.is_empty() {
            return self.check_empty(peers, src.addr(), pe);
        }
        let count = dst.len();
        self.iget(peers, dst, src, RmaDescriptor::contiguous(count), pe)
    }

    /// Non-blocking contiguous get of `count` elements into this rank's own
    /// heap at `dst`.
    pub fn get_nbi<T: Element>(
        &self,
        peers: &PeerTable,
        dst: SymPtr<T>,
        src: SymPtr<T>,
        count: usize,
        pe: Rank,
    ) -> Result<()> {
        if count == 0 {
            return self.check_empty(peers, src.addr(), pe);
        }
        let layout = Self::layout::<T>(&RmaDescriptor::contiguous(count))?;
        let source = self.region(peers, src.addr(), layout.src_extent(), pe)?;
        let mut target = self.region(peers, dst.addr(), layout.dst_extent(), self.rank)?;

        self.completion.issue(pe);
        let pool = self.pool.clone();
        let completion = self.completion.clone();
        self.executor.submit(Box::new(move || {
            match copy_staged(&pool, &source, &mut target, &layout) {
                Ok(_) => completion.complete(pe),
                Err(e) => completion.fail(pe, e),
            }
        }));
        log::debug!(
            "rank {} queued get of {} bytes from rank {} at offset {:#x}",
            self.rank,
            layout.total_bytes(),
            pe,
            src.offset()
        );
        Ok(())
    }

    /// Scalar put: write directly, then flush the written location.
    pub fn p<T: Element>(&self, peers: &PeerTable, dst: SymPtr<T>, value: T, pe: Rank) -> Result<()> {
        let size = std::mem::size_of::<T>();
        let remote = peers.translate_range(dst.addr(), size, pe)?;
        self.completion.wait_fence(pe);
        self.fabric
            .write(pe, remote, as_bytes(std::slice::from_ref(&value)))?;
        self.fabric.flush(pe, remote, size)
    }

    /// Scalar get.
    pub fn g<T: Element>(&self, peers: &PeerTable, src: SymPtr<T>, pe: Rank) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let remote = peers.translate_range(src.addr(), size, pe)?;
        self.completion.wait_fence(pe);
        let mut value = T::zero();
        self.fabric
            .read(pe, remote, as_bytes_mut(std::slice::from_mut(&mut value)))?;
        Ok(value)
    }

    // Zero-length transfers move nothing but still validate their target.
    fn check_empty(&self, peers: &PeerTable, addr: usize, pe: Rank) -> Result<()> {
        peers.translate(addr, pe).map(|_| ())
    }
}
