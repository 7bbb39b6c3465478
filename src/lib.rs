//! # symheap-rust
//!
//! A partitioned global address space (PGAS) runtime core: every rank owns
//! an equally sized partition of a symmetric heap, collective allocation
//! hands out the same offset on every rank, and ranks read and write each
//! other's partitions with one-sided put/get operations.
//!
//! ## Features
//!
//! - **Symmetric allocation**: a deterministic best-fit, coalescing
//!   allocator keeps offsets identical across ranks when every rank
//!   allocates in the same order.
//! - **Address translation**: offset-preserving translation of a local
//!   heap address into any reachable peer's partition.
//! - **Teams**: affine `(start, stride, size)` subsets of the rank space.
//! - **Synchronization**: counter-based barrier, per-destination `fence`,
//!   global `quiet` and word signalling.
//! - **RMA**: blocking and non-blocking, contiguous and strided put/get
//!   staged through bounded buffers, plus scalar `p` / `g`.
//!
//! ## Quick Start
//!
//! ```rust
//! use symheap_rust::{set_attributes, Context};
//!
//! # fn main() -> symheap_rust::Result<()> {
//! let attrs = set_attributes(0, 1, 1 << 20, "local://quick-start")?;
//! let ctx = Context::create(attrs)?;
//! ctx.init()?;
//!
//! let data = ctx.malloc(4 * 8)?.cast::<u64>();
//! ctx.put(data, &[1u64, 2, 3, 4], ctx.my_pe())?;
//! ctx.quiet()?;
//! assert_eq!(ctx.get_vec(data, 4, ctx.my_pe())?, vec![1, 2, 3, 4]);
//!
//! ctx.free(data)?;
//! ctx.finalize()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: constants, error types, address-space types, raw memory
//! - [`config`]: initialization attributes and runtime tunables
//! - [`heap`]: partition layout, range allocator and peer table
//! - [`team`]: affine rank subsets
//! - [`sync`]: barrier, fence, quiet and signalling
//! - [`rma`]: staged put/get engine
//! - [`fabric`]: transport, rendezvous and copy executors
//! - [`runtime`]: the per-rank [`Context`] tying the pieces together

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]

// Core infrastructure module - always available
pub mod core;

// Configuration management module
pub mod config;

// Transport, rendezvous and executors
pub mod fabric;

// Symmetric heap allocator and address translation
pub mod heap;

// Remote memory access engine
pub mod rma;

// Runtime context
pub mod runtime;

// Barrier, fence, quiet
pub mod sync;

// Rank subsets
pub mod team;

// Re-export core functionality for convenience
pub use self::core::{
    constants::*,
    error::{Result, SymHeapError},
    init_logging,
    types::{Cmp, Element, InitStatus, Rank, RemotePtr, SymPtr},
};

// Re-export configuration functionality
pub use config::{
    attributes::{set_attributes, Attributes},
    core::{ConfigBuilder, ExecutorKind, RuntimeConfig},
};

pub use heap::HeapStats;
pub use rma::RmaDescriptor;
pub use runtime::Context;
pub use team::Team;

// Version information
pub use self::core::constants::SYMHEAP_VERSION as VERSION;
