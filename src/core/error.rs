//! Error handling and error types for the symmetric heap runtime.
//!
//! Allocator, translator, team and RMA failures are returned to the caller
//! and are always locally recoverable. Synchronization primitives only
//! report misuse (an uninitialized context or an unreachable peer) that is
//! detected before any shared state is touched.

use std::io;
use thiserror::Error;

/// Main error type for the runtime.
#[derive(Error, Debug)]
pub enum SymHeapError {
    /// Zero or negative size, bad alignment, malformed team parameters,
    /// rank out of range
    #[error("Invalid argument: {parameter} = {value}, {reason}")]
    InvalidArgument {
        parameter: String,
        value: String,
        reason: String,
    },

    /// No free range large enough for the request
    #[error("Out of memory: requested {requested} bytes, largest free range {largest_free} bytes")]
    OutOfMemory {
        requested: usize,
        largest_free: usize,
    },

    /// API called on a context that has not completed `init`
    #[error("Not initialized: {operation} requires an initialized context")]
    NotInitialized { operation: String },

    /// Translation requested for an address outside the caller's partition
    #[error("Address {address:#x} outside partition [{base:#x}, {base:#x} + {size:#x})")]
    AddressOutOfRange {
        address: usize,
        base: usize,
        size: usize,
    },

    /// Peer has no mapped partition over the current transport
    #[error("Peer {rank} is unreachable")]
    UnreachablePeer { rank: usize },

    /// Release or query on an offset that is not currently allocated
    #[error("No allocation at heap offset {offset:#x}")]
    NotFound { offset: usize },

    /// Configuration and validation errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Rendezvous / descriptor exchange errors
    #[error("Bootstrap error: {message}")]
    Bootstrap { message: String },

    /// Transport-level failures while moving bytes
    #[error("Fabric error: {message}")]
    Fabric { message: String },

    /// Memory management errors outside the symmetric heap
    #[error("Memory error: {message}")]
    Memory { message: String },

    /// File I/O errors
    #[error("I/O error: {source}")]
    IO {
        #[from]
        source: io::Error,
    },

    /// JSON serialization errors
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// TOML deserialization errors
    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    /// Bincode serialization errors
    #[error("Bincode error: {source}")]
    Bincode {
        #[from]
        source: bincode::Error,
    },

    /// Internal runtime errors (should not occur in normal usage)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Aligned buffer and staging memory errors
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Allocation failed: requested {size} bytes")]
    AllocationFailed { size: usize },

    #[error("Alignment constraint violated: address {address:#x}, required alignment {alignment}")]
    AlignmentViolation { address: usize, alignment: usize },
}

/// Type alias for Results using SymHeapError
pub type Result<T> = std::result::Result<T, SymHeapError>;

impl SymHeapError {
    /// Create an invalid argument error
    pub fn invalid_argument<P, V, R>(parameter: P, value: V, reason: R) -> Self
    where
        P: Into<String>,
        V: ToString,
        R: Into<String>,
    {
        SymHeapError::InvalidArgument {
            parameter: parameter.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an out of memory error
    pub fn out_of_memory(requested: usize, largest_free: usize) -> Self {
        SymHeapError::OutOfMemory {
            requested,
            largest_free,
        }
    }

    /// Create a not initialized error
    pub fn not_initialized<S: Into<String>>(operation: S) -> Self {
        SymHeapError::NotInitialized {
            operation: operation.into(),
        }
    }

    /// Create an address out of range error
    pub fn address_out_of_range(address: usize, base: usize, size: usize) -> Self {
        SymHeapError::AddressOutOfRange {
            address,
            base,
            size,
        }
    }

    /// Create an unreachable peer error
    pub fn unreachable_peer(rank: usize) -> Self {
        SymHeapError::UnreachablePeer { rank }
    }

    /// Create a not found error
    pub fn not_found(offset: usize) -> Self {
        SymHeapError::NotFound { offset }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        SymHeapError::Config {
            message: message.into(),
        }
    }

    /// Create a bootstrap error
    pub fn bootstrap<S: Into<String>>(message: S) -> Self {
        SymHeapError::Bootstrap {
            message: message.into(),
        }
    }

    /// Create a fabric error
    pub fn fabric<S: Into<String>>(message: S) -> Self {
        SymHeapError::Fabric {
            message: message.into(),
        }
    }

    /// Create a memory error
    pub fn memory<S: Into<String>>(message: S) -> Self {
        SymHeapError::Memory {
            message: message.into(),
        }
    }

    /// Create an internal error (should be used sparingly)
    pub fn internal<S: Into<String>>(message: S) -> Self {
        SymHeapError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable by the caller without tearing
    /// down the context
    pub fn is_recoverable(&self) -> bool {
        match self {
            SymHeapError::InvalidArgument { .. } => true,
            SymHeapError::OutOfMemory { .. } => true,
            SymHeapError::NotInitialized { .. } => true,
            SymHeapError::AddressOutOfRange { .. } => true,
            SymHeapError::UnreachablePeer { .. } => true,
            SymHeapError::NotFound { .. } => true,
            SymHeapError::Config { .. } => false,
            SymHeapError::Bootstrap { .. } => false,
            SymHeapError::Fabric { .. } => false,
            SymHeapError::Memory { .. } => false,
            SymHeapError::IO { .. } => false,
            SymHeapError::Json { .. } => false,
            SymHeapError::Toml { .. } => false,
            SymHeapError::Bincode { .. } => false,
            SymHeapError::Internal { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            SymHeapError::InvalidArgument { .. } => "invalid_argument",
            SymHeapError::OutOfMemory { .. } => "out_of_memory",
            SymHeapError::NotInitialized { .. } => "not_initialized",
            SymHeapError::AddressOutOfRange { .. } => "address_out_of_range",
            SymHeapError::UnreachablePeer { .. } => "unreachable_peer",
            SymHeapError::NotFound { .. } => "not_found",
            SymHeapError::Config { .. } => "config",
            SymHeapError::Bootstrap { .. } => "bootstrap",
            SymHeapError::Fabric { .. } => "fabric",
            SymHeapError::Memory { .. } => "memory",
            SymHeapError::IO { .. } => "io",
            SymHeapError::Json { .. } => "json",
            SymHeapError::Toml { .. } => "toml",
            SymHeapError::Bincode { .. } => "bincode",
            SymHeapError::Internal { .. } => "internal",
        }
    }
}

impl From<MemoryError> for SymHeapError {
    fn from(err: MemoryError) -> Self {
        SymHeapError::Memory {
            message: err.to_string(),
        }
    }
}
