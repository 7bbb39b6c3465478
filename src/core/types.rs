//! Fundamental data types for the symmetric heap runtime.
//!
//! Heap addresses and compute-local memory live in distinct value types:
//! a [`SymPtr`] names memory in the caller's own partition, a [`RemotePtr`]
//! names the equivalent location in a peer's partition, and compute-local
//! memory is always an ordinary Rust slice. Conversions between them go
//! through checked functions on the runtime context.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Rank (PE) identity in `[0, world_size)`.
pub type Rank = usize;

/// Initialization state of a runtime context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitStatus {
    /// No heap exists; every call except `create` fails.
    NotInitialized,
    /// Attributes registered and the local partition allocated.
    Created,
    /// Collective heap creation finished; the runtime is usable.
    Initialized,
}

impl fmt::Display for InitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStatus::NotInitialized => write!(f, "NOT_INITIALIZED"),
            InitStatus::Created => write!(f, "CREATED"),
            InitStatus::Initialized => write!(f, "INITIALIZED"),
        }
    }
}

/// Element types that may be moved by RMA operations.
///
/// # Safety
/// Implementors must be plain old data: no padding bytes, no pointers or
/// drop glue, and every bit pattern must be a valid value.
pub unsafe trait Element: Copy + Send + Sync + num_traits::Zero + 'static {}

macro_rules! impl_element {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Element for $t {})*
    };
}

impl_element!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

/// View a slice of elements as raw bytes.
pub(crate) fn as_bytes<T: Element>(values: &[T]) -> &[u8] {
    // SAFETY: `Element` guarantees plain-old-data without padding.
    unsafe { std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values)) }
}

/// View a mutable slice of elements as raw bytes.
pub(crate) fn as_bytes_mut<T: Element>(values: &mut [T]) -> &mut [u8] {
    let len = std::mem::size_of_val(values);
    // SAFETY: `Element` guarantees every bit pattern is a valid value.
    unsafe { std::slice::from_raw_parts_mut(values.as_mut_ptr() as *mut u8, len) }
}

/// Typed address inside the caller's own heap partition.
///
/// Offsets are identical on every rank for collectively allocated memory,
/// so a `SymPtr` can be translated for any peer.
pub struct SymPtr<T> {
    addr: usize,
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SymPtr<T> {
    pub(crate) fn new(addr: usize, offset: usize) -> Self {
        SymPtr {
            addr,
            offset,
            _marker: PhantomData,
        }
    }

    /// Absolute address in this rank's partition.
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Offset from the partition base; identical on every rank.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Advance by `count` elements.
    ///
    /// # Panics
    ///
    /// If the byte distance or the resulting address overflows `usize`.
    /// Use [`SymPtr::checked_add`] for counts that are not known to stay
    /// inside the heap.
    pub fn add(self, count: usize) -> Self {
        self.checked_add(count).unwrap_or_else(|| {
            panic!("advancing {:?} by {} elements overflows", self, count)
        })
    }

    /// Advance by `count` elements, or `None` on overflow.
    pub fn checked_add(self, count: usize) -> Option<Self> {
        let bytes = count.checked_mul(std::mem::size_of::<T>())?;
        Some(SymPtr::new(
            self.addr.checked_add(bytes)?,
            self.offset.checked_add(bytes)?,
        ))
    }

    /// Reinterpret as a pointer to another element type.
    pub fn cast<U>(self) -> SymPtr<U> {
        SymPtr::new(self.addr, self.offset)
    }

    /// Whether the address is a multiple of `alignment`.
    pub fn is_aligned_to(&self, alignment: usize) -> bool {
        alignment != 0 && self.addr % alignment == 0
    }
}

impl<T> Clone for SymPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SymPtr<T> {}

impl<T> PartialEq for SymPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T> Eq for SymPtr<T> {}

impl<T> fmt::Debug for SymPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymPtr {{ addr: {:#x}, offset: {:#x} }}", self.addr, self.offset)
    }
}

/// Address of a location in a peer's partition.
pub struct RemotePtr<T> {
    rank: Rank,
    addr: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemotePtr<T> {
    pub(crate) fn new(rank: Rank, addr: usize) -> Self {
        RemotePtr {
            rank,
            addr,
            _marker: PhantomData,
        }
    }

    /// Rank owning the memory.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Absolute address in the peer's partition.
    pub fn addr(&self) -> usize {
        self.addr
    }
}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.addr == other.addr
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> fmt::Debug for RemotePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemotePtr {{ rank: {}, addr: {:#x} }}", self.rank, self.addr)
    }
}

/// Comparison used by point-to-point waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cmp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
}

impl Cmp {
    /// Evaluate `observed <op> expected`.
    pub fn holds(self, observed: u64, expected: u64) -> bool {
        match self {
            Cmp::Eq => observed == expected,
            Cmp::Ne => observed != expected,
            Cmp::Gt => observed > expected,
            Cmp::Ge => observed >= expected,
            Cmp::Lt => observed < expected,
            Cmp::Le => observed <= expected,
        }
    }
}
