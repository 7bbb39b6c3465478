//! Core infrastructure module for the symmetric heap runtime.
//!
//! This module provides the foundational components shared by every other
//! part of the runtime.
//!
//! # Organization
//!
//! - [`types`]: ranks, address-space value types and the RMA element trait
//! - [`constants`]: layout constants and configuration defaults
//! - [`error`]: error taxonomy and the crate-wide `Result`
//! - [`memory`]: partitions, aligned staging buffers and the staging pool
//!
//! # Usage
//!
//! ```rust
//! use symheap_rust::core::{
//!     constants::ALLOC_GRANULARITY,
//!     error::{Result, SymHeapError},
//!     memory::StagingPool,
//! };
//!
//! let pool = StagingPool::new(4 * ALLOC_GRANULARITY, 2);
//! let buffer = pool.get_buffer()?;
//! assert_eq!(buffer.len(), 64);
//! pool.return_buffer(buffer);
//! # Ok::<(), SymHeapError>(())
//! ```

pub mod constants;
pub mod error;
pub mod memory;
pub mod types;

pub use constants::*;
pub use error::{Result, SymHeapError};
pub use memory::{AlignedBuffer, Partition, StagingPool};
pub use types::*;

use std::sync::Once;

static LOGGING_INIT: Once = Once::new();

/// Install `env_logger` once for the process.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` is used.
pub fn init_logging(default_level: &str) {
    LOGGING_INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or(default_level.to_string());
        // Another logger may already be installed by the embedding program.
        let _ = env_logger::Builder::from_env(env).try_init();
        log::debug!("Logging initialized (default level {})", default_level);
    });
}
