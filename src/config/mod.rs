//! Configuration management for the symmetric heap runtime.
//!
//! [`Attributes`] carry the identity and sizing every rank must agree on;
//! [`RuntimeConfig`] carries local tunables that may differ between ranks.

pub mod attributes;
pub mod core;

pub use self::attributes::{set_attributes, Attributes};
pub use self::core::{ConfigBuilder, ExecutorKind, RuntimeConfig};

/// Default configuration file name looked up by embedding programs
pub const DEFAULT_CONFIG_FILE: &str = "symheap.toml";
