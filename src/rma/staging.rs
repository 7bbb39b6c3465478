//! Staged copy engine.
//!
//! Every transfer, contiguous or strided, blocking or not, runs through
//! [`copy_staged`]: rows are moved one staging-buffer-sized chunk at a time,
//! first from the source into the buffer, then from the buffer into the
//! destination. A contiguous transfer is a single row.

use crate::core::error::{Result, SymHeapError};
use crate::core::memory::{AlignedBuffer, StagingPool};
use crate::core::types::Rank;
use crate::fabric::Fabric;
use crate::rma::descriptor::ByteLayout;

use std::sync::Arc;

/// Where staged bytes are read from.
pub trait Source {
    /// Fill `buf` from byte `offset` of the source region.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()>;
}

/// Where staged bytes are written to.
pub trait Sink {
    /// Write `buf` at byte `offset` of the destination region.
    fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<()>;

    /// Called once after the last chunk.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

fn slice_range(len: usize, offset: usize, count: usize) -> Result<std::ops::Range<usize>> {
    offset
        .checked_add(count)
        .filter(|&end| end <= len)
        .map(|end| offset..end)
        .ok_or_else(|| {
            SymHeapError::internal(format!(
                "staged access {}+{} beyond local buffer of {} bytes",
                offset, count, len
            ))
        })
}

impl Source for [u8] {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let range = slice_range(self.len(), offset, buf.len())?;
        buf.copy_from_slice(&self[range]);
        Ok(())
    }
}

impl Sink for [u8] {
    fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        let range = slice_range(self.len(), offset, buf.len())?;
        self[range].copy_from_slice(buf);
        Ok(())
    }
}

/// A byte region in some rank's partition, reached through the fabric.
#[derive(Debug, Clone)]
pub struct RemoteRegion {
    fabric: Arc<dyn Fabric>,
    rank: Rank,
    addr: usize,
    extent: usize,
}

impl RemoteRegion {
    /// Region `[addr, addr + extent)` of `rank`'s partition.
    pub fn new(fabric: Arc<dyn Fabric>, rank: Rank, addr: usize, extent: usize) -> Self {
        RemoteRegion {
            fabric,
            rank,
            addr,
            extent,
        }
    }
}

impl Source for RemoteRegion {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.fabric.read(self.rank, self.addr + offset, buf)
    }
}

impl Sink for RemoteRegion {
    fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        self.fabric.write(self.rank, self.addr + offset, buf)
    }

    fn finish(&mut self) -> Result<()> {
        self.fabric.flush(self.rank, self.addr, self.extent)
    }
}

/// Source bytes captured into pooled staging buffers, packed row after
/// row, so the caller's slice can be reused immediately.
///
/// Capturing never grows the pool: it only succeeds when enough buffers are
/// free.
#[derive(Debug)]
pub struct StagedBytes {
    buffers: Vec<AlignedBuffer<u8>>,
    buffer_bytes: usize,
    len: usize,
}

impl StagedBytes {
    /// Copy the rows described by `layout` out of `src` into pooled
    /// buffers, leaving at least `reserve` buffers free in the pool.
    ///
    /// Returns `Ok(None)` when the pool cannot hold the rows.
    pub fn try_capture(
        pool: &StagingPool,
        src: &[u8],
        layout: &ByteLayout,
        reserve: usize,
    ) -> Result<Option<Self>> {
        let rows = (0..layout.rows)
            .map(|row| slice_range(src.len(), row * layout.src_pitch, layout.row_bytes))
            .collect::<Result<Vec<_>>>()?;

        let buffer_bytes = pool.buffer_bytes();
        let len = layout.total_bytes();
        let buffers = match pool.try_get_buffers(len.div_ceil(buffer_bytes), reserve)? {
            Some(buffers) => buffers,
            None => return Ok(None),
        };
        let mut staged = StagedBytes {
            buffers,
            buffer_bytes,
            len,
        };
        for (row, range) in rows.into_iter().enumerate() {
            staged.write_packed(row * layout.row_bytes, &src[range]);
        }
        Ok(Some(staged))
    }

    /// Write the captured rows straight from the staging buffers into `dst`
    /// at the destination pitch of `layout`. Returns the number of chunks.
    pub fn drain_into<D>(&self, dst: &mut D, layout: &ByteLayout) -> Result<usize>
    where
        D: Sink + ?Sized,
    {
        let mut chunks = 0;
        for row in 0..layout.rows {
            let mut packed = row * layout.row_bytes;
            let mut done = 0;
            while done < layout.row_bytes {
                let index = packed / self.buffer_bytes;
                let within = packed % self.buffer_bytes;
                let n = (layout.row_bytes - done).min(self.buffer_bytes - within);
                let chunk = &self.buffers[index].as_slice()[within..within + n];
                dst.write_at(row * layout.dst_pitch + done, chunk)?;
                packed += n;
                done += n;
                chunks += 1;
            }
        }
        dst.finish()?;
        Ok(chunks)
    }

    fn write_packed(&mut self, mut offset: usize, mut data: &[u8]) {
        while !data.is_empty() {
            let index = offset / self.buffer_bytes;
            let within = offset % self.buffer_bytes;
            let n = data.len().min(self.buffer_bytes - within);
            self.buffers[index].as_mut_slice()[within..within + n].copy_from_slice(&data[..n]);
            data = &data[n..];
            offset += n;
        }
    }

    /// Number of captured bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hand the buffers back to the pool.
    pub fn release(self, pool: &StagingPool) {
        for buffer in self.buffers {
            pool.return_buffer(buffer);
        }
    }
}

/// Move the rows of `layout` from `src` to `dst` through one staging
/// buffer. Returns the number of chunks moved.
pub fn copy_staged<S, D>(pool: &StagingPool, src: &S, dst: &mut D, layout: &ByteLayout) -> Result<usize>
where
    S: Source + ?Sized,
    D: Sink + ?Sized,
{
    let mut buffer = pool.get_buffer()?;
    let result = copy_rows(buffer.as_mut_slice(), src, dst, layout);
    pool.return_buffer(buffer);
    let chunks = result?;
    dst.finish()?;
    Ok(chunks)
}

fn copy_rows<S, D>(staging: &mut [u8], src: &S, dst: &mut D, layout: &ByteLayout) -> Result<usize>
where
    S: Source + ?Sized,
    D: Sink + ?Sized,
{
    if staging.is_empty() {
        return Err(SymHeapError::internal("staging buffer has no capacity"));
    }
    let mut chunks = 0;
    for row in 0..layout.rows {
        let src_row = row * layout.src_pitch;
        let dst_row = row * layout.dst_pitch;
        let mut done = 0;
        while done < layout.row_bytes {
            let n = (layout.row_bytes - done).min(staging.len());
            let chunk = &mut staging[..n];
            src.read_at(src_row + done, chunk)?;
            dst.write_at(dst_row + done, chunk)?;
            done += n;
            chunks += 1;
        }
    }
    log::trace!(
        "staged {} bytes in {} chunks ({} rows)",
        layout.total_bytes(),
        chunks,
        layout.rows
    );
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rma::descriptor::RmaDescriptor;

    #[test]
    fn test_contiguous_copy_splits_into_chunks() {
        let pool = StagingPool::new(16, 2);
        let src: Vec<u8> = (0..100).collect();
        let mut dst = vec![0u8; 100];
        let layout = RmaDescriptor::contiguous(100).byte_layout(1).unwrap();

        let chunks = copy_staged(&pool, src.as_slice(), dst.as_mut_slice(), &layout).unwrap();
        assert_eq!(chunks, 7);
        assert_eq!(src, dst);
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_strided_copy() {
        let pool = StagingPool::new(16, 2);
        // Rows of 2 u8 taken every 3 bytes, written every 4 bytes.
        let src: Vec<u8> = (1..=9).collect();
        let mut dst = vec![0u8; 10];
        let layout = RmaDescriptor::new(3, 2, 3, 4).unwrap().byte_layout(1).unwrap();

        copy_staged(&pool, src.as_slice(), dst.as_mut_slice(), &layout).unwrap();
        assert_eq!(dst, vec![1, 2, 0, 0, 4, 5, 0, 0, 7, 8]);
    }

    #[test]
    fn test_staged_bytes_span_buffers() {
        let pool = StagingPool::new(16, 4);
        let src: Vec<u8> = (0..60).collect();
        let layout = RmaDescriptor::new(4, 10, 15, 10).unwrap().byte_layout(1).unwrap();

        let staged = StagedBytes::try_capture(&pool, &src, &layout, 1)
            .unwrap()
            .unwrap();
        assert_eq!(staged.len(), 40);
        assert_eq!(pool.outstanding_count(), 3);

        let mut dst = vec![0u8; 40];
        let chunks = staged.drain_into(dst.as_mut_slice(), &layout).unwrap();
        let expected: Vec<u8> = (0..4).flat_map(|r| r * 15..r * 15 + 10).collect();
        assert_eq!(dst, expected);
        // Rows 1 and 3 straddle a buffer boundary.
        assert_eq!(chunks, 6);

        staged.release(&pool);
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_capture_respects_pool_capacity() {
        let pool = StagingPool::new(16, 4);
        let src = vec![7u8; 1 << 20];
        let layout = RmaDescriptor::contiguous(src.len()).byte_layout(1).unwrap();
        assert!(StagedBytes::try_capture(&pool, &src, &layout, 1)
            .unwrap()
            .is_none());
        assert_eq!(pool.outstanding_count(), 0);

        // Three buffers fit while one stays in reserve; four do not.
        let fits = RmaDescriptor::contiguous(48).byte_layout(1).unwrap();
        let over = RmaDescriptor::contiguous(49).byte_layout(1).unwrap();
        assert!(StagedBytes::try_capture(&pool, &src, &over, 1)
            .unwrap()
            .is_none());
        let staged = StagedBytes::try_capture(&pool, &src, &fits, 1)
            .unwrap()
            .unwrap();
        assert!(pool.outstanding_count() <= pool.capacity());
        staged.release(&pool);
    }

    #[test]
    fn test_short_source_is_rejected() {
        let pool = StagingPool::new(16, 1);
        let src = vec![0u8; 8];
        let layout = RmaDescriptor::contiguous(9).byte_layout(1).unwrap();
        assert!(StagedBytes::try_capture(&pool, &src, &layout, 0).is_err());
        assert_eq!(pool.outstanding_count(), 0);
    }
}
