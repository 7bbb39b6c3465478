//! Per-rank initialization attributes.
//!
//! Attributes are what the bootstrap layer hands to the runtime: this rank's
//! identity, the group size, the user heap size per rank and where to
//! rendezvous with the other ranks.

use crate::config::core::RuntimeConfig;
use crate::core::constants::*;
use crate::core::error::{Result, SymHeapError};
use crate::core::types::Rank;

use serde::{Deserialize, Serialize};

/// Validated initialization attributes for one rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    rank: Rank,
    world_size: usize,
    heap_bytes: usize,
    endpoint: String,
    config: RuntimeConfig,
}

/// Register this rank's identity, group size, per-rank heap size and
/// rendezvous endpoint.
pub fn set_attributes<S: Into<String>>(
    rank: Rank,
    world_size: usize,
    per_rank_heap_bytes: usize,
    rendezvous_endpoint: S,
) -> Result<Attributes> {
    Attributes::new(rank, world_size, per_rank_heap_bytes, rendezvous_endpoint)
}

impl Attributes {
    /// Validate and build attributes with the default runtime configuration.
    pub fn new<S: Into<String>>(
        rank: Rank,
        world_size: usize,
        heap_bytes: usize,
        endpoint: S,
    ) -> Result<Self> {
        let endpoint = endpoint.into();

        if world_size == 0 || world_size > MAX_PES {
            return Err(SymHeapError::invalid_argument(
                "world_size",
                world_size,
                format!("must be in [1, {}]", MAX_PES),
            ));
        }
        if rank >= world_size {
            return Err(SymHeapError::invalid_argument(
                "rank",
                rank,
                format!("must be below world_size {}", world_size),
            ));
        }
        if heap_bytes == 0 || heap_bytes % ALLOC_GRANULARITY != 0 {
            return Err(SymHeapError::invalid_argument(
                "per_rank_heap_bytes",
                heap_bytes,
                format!("must be a positive multiple of {}", ALLOC_GRANULARITY),
            ));
        }
        if heap_bytes.checked_add(SYNC_REGION_BYTES).is_none() {
            return Err(SymHeapError::invalid_argument(
                "per_rank_heap_bytes",
                heap_bytes,
                "partition size overflows",
            ));
        }
        if endpoint.trim().is_empty() {
            return Err(SymHeapError::invalid_argument(
                "rendezvous_endpoint",
                "",
                "must not be empty",
            ));
        }

        Ok(Attributes {
            rank,
            world_size,
            heap_bytes,
            endpoint,
            config: RuntimeConfig::default(),
        })
    }

    /// Replace the runtime configuration.
    pub fn with_config(mut self, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// This rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the world.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// User-visible heap bytes per rank.
    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes
    }

    /// Total partition bytes (sync region plus user heap).
    pub fn partition_bytes(&self) -> usize {
        self.heap_bytes + SYNC_REGION_BYTES
    }

    /// Rendezvous endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::core::ConfigBuilder;

    #[test]
    fn test_valid_attributes() {
        let attrs = set_attributes(1, 4, 1 << 20, "local://attrs").unwrap();
        assert_eq!(attrs.rank(), 1);
        assert_eq!(attrs.world_size(), 4);
        assert_eq!(attrs.heap_bytes(), 1 << 20);
        assert_eq!(attrs.partition_bytes(), (1 << 20) + SYNC_REGION_BYTES);
        assert_eq!(attrs.endpoint(), "local://attrs");
    }

    #[test]
    fn test_invalid_attributes() {
        assert!(set_attributes(0, 0, 1024, "local://x").is_err());
        assert!(set_attributes(4, 4, 1024, "local://x").is_err());
        assert!(set_attributes(0, MAX_PES + 1, 1024, "local://x").is_err());
        assert!(set_attributes(0, 2, 0, "local://x").is_err());
        assert!(set_attributes(0, 2, 1000, "local://x").is_err());
        assert!(set_attributes(0, 2, 1024, "  ").is_err());

        let err = set_attributes(5, 2, 1024, "local://x").unwrap_err();
        assert_eq!(err.category(), "invalid_argument");
    }

    #[test]
    fn test_with_config() {
        let config = ConfigBuilder::new().staging_buffer_bytes(256).build().unwrap();
        let attrs = set_attributes(0, 1, 4096, "local://cfg")
            .unwrap()
            .with_config(config)
            .unwrap();
        assert_eq!(attrs.config().staging_buffer_bytes, 256);
    }
}
