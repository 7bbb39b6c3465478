//! Shape of a strided transfer.

use crate::core::error::{Result, SymHeapError};

use serde::{Deserialize, Serialize};

/// `repeat` rows of `length` elements, consecutive rows `src_stride` /
/// `dst_stride` elements apart on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RmaDescriptor {
    /// Number of rows
    pub repeat: usize,
    /// Elements per row
    pub length: usize,
    /// Source row pitch in elements
    pub src_stride: usize,
    /// Destination row pitch in elements
    pub dst_stride: usize,
}

/// Byte-level layout derived from a descriptor and an element size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteLayout {
    /// Number of rows
    pub rows: usize,
    /// Bytes per row
    pub row_bytes: usize,
    /// Source pitch in bytes
    pub src_pitch: usize,
    /// Destination pitch in bytes
    pub dst_pitch: usize,
}

impl ByteLayout {
    /// Bytes moved in total.
    pub fn total_bytes(&self) -> usize {
        self.rows * self.row_bytes
    }

    /// Bytes spanned on the source side.
    pub fn src_extent(&self) -> usize {
        (self.rows - 1) * self.src_pitch + self.row_bytes
    }

    /// Bytes spanned on the destination side.
    pub fn dst_extent(&self) -> usize {
        (self.rows - 1) * self.dst_pitch + self.row_bytes
    }

    /// Same rows with the source packed back to back.
    pub fn packed_source(&self) -> ByteLayout {
        ByteLayout {
            src_pitch: self.row_bytes,
            ..*self
        }
    }
}

fn span(repeat: usize, stride: usize, length: usize) -> Option<usize> {
    (repeat - 1).checked_mul(stride)?.checked_add(length)
}

impl RmaDescriptor {
    /// Validated strided descriptor.
    pub fn new(repeat: usize, length: usize, src_stride: usize, dst_stride: usize) -> Result<Self> {
        let descriptor = RmaDescriptor {
            repeat,
            length,
            src_stride,
            dst_stride,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// One row of `length` elements.
    pub fn contiguous(length: usize) -> Self {
        RmaDescriptor {
            repeat: 1,
            length,
            src_stride: length,
            dst_stride: length,
        }
    }

    /// Check the shape on its own, independent of any buffer.
    pub fn validate(&self) -> Result<()> {
        if self.repeat == 0 {
            return Err(SymHeapError::invalid_argument(
                "repeat",
                self.repeat,
                "must be positive",
            ));
        }
        if self.length == 0 {
            return Err(SymHeapError::invalid_argument(
                "length",
                self.length,
                "must be positive",
            ));
        }
        if self.repeat > 1 {
            if self.src_stride < self.length {
                return Err(SymHeapError::invalid_argument(
                    "src_stride",
                    self.src_stride,
                    format!("rows of {} elements would overlap", self.length),
                ));
            }
            if self.dst_stride < self.length {
                return Err(SymHeapError::invalid_argument(
                    "dst_stride",
                    self.dst_stride,
                    format!("rows of {} elements would overlap", self.length),
                ));
            }
        }
        self.src_extent()?;
        self.dst_extent()?;
        Ok(())
    }

    /// Elements spanned on the source side.
    pub fn src_extent(&self) -> Result<usize> {
        span(self.repeat, self.src_stride, self.length).ok_or_else(|| {
            SymHeapError::invalid_argument("src_stride", self.src_stride, "extent overflows")
        })
    }

    /// Elements spanned on the destination side.
    pub fn dst_extent(&self) -> Result<usize> {
        span(self.repeat, self.dst_stride, self.length).ok_or_else(|| {
            SymHeapError::invalid_argument("dst_stride", self.dst_stride, "extent overflows")
        })
    }

    /// Elements moved.
    pub fn total_elements(&self) -> usize {
        self.repeat * self.length
    }

    /// Convert to bytes for elements of `element_size` bytes.
    pub fn byte_layout(&self, element_size: usize) -> Result<ByteLayout> {
        self.validate()?;
        let overflow =
            || SymHeapError::invalid_argument("length", self.length, "byte size overflows");
        let layout = ByteLayout {
            rows: self.repeat,
            row_bytes: self.length.checked_mul(element_size).ok_or_else(overflow)?,
            src_pitch: self.src_stride.checked_mul(element_size).ok_or_else(overflow)?,
            dst_pitch: self.dst_stride.checked_mul(element_size).ok_or_else(overflow)?,
        };
        let src_bytes = self.src_extent()?.checked_mul(element_size);
        let dst_bytes = self.dst_extent()?.checked_mul(element_size);
        if src_bytes.is_none() || dst_bytes.is_none() {
            return Err(overflow());
        }
        Ok(layout)
    }
}
