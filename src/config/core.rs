//! Runtime configuration structure and builder.
//!
//! Tunables that do not affect the inter-rank contract live here: staging
//! buffer sizing, the device executor flavour, spin behaviour and logging.
//! Values can come from defaults, a `.toml`/`.json` file or `SYMHEAP_*`
//! environment variables.

use crate::core::constants::*;
use crate::core::error::{Result, SymHeapError};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Which device executor runs deferred transfer work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Jobs run synchronously on the issuing thread.
    Inline,
    /// Jobs run out of order on a thread pool.
    Pool,
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorKind::Inline => write!(f, "inline"),
            ExecutorKind::Pool => write!(f, "pool"),
        }
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = SymHeapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(ExecutorKind::Inline),
            "pool" => Ok(ExecutorKind::Pool),
            other => Err(SymHeapError::invalid_argument(
                "executor",
                other,
                "expected `inline` or `pool`",
            )),
        }
    }
}

/// Runtime tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Size of one staging buffer in bytes
    pub staging_buffer_bytes: usize,
    /// Number of idle staging buffers retained for reuse
    pub staging_pool_size: usize,
    /// Device executor flavour for non-blocking transfers
    pub executor: ExecutorKind,
    /// Executor pool threads (0 = one per core)
    pub executor_threads: usize,
    /// Busy spins before a waiting rank starts yielding
    pub spin_before_yield: u32,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            staging_buffer_bytes: DEFAULT_STAGING_BUFFER_BYTES,
            staging_pool_size: DEFAULT_STAGING_POOL_SIZE,
            executor: ExecutorKind::Pool,
            executor_threads: DEFAULT_EXECUTOR_THREADS,
            spin_before_yield: DEFAULT_SPIN_BEFORE_YIELD,
            log_level: "warn".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.staging_buffer_bytes == 0 || self.staging_buffer_bytes % ALLOC_GRANULARITY != 0 {
            return Err(SymHeapError::invalid_argument(
                "staging_buffer_bytes",
                self.staging_buffer_bytes,
                format!("must be a positive multiple of {}", ALLOC_GRANULARITY),
            ));
        }

        if self.staging_pool_size == 0 {
            return Err(SymHeapError::invalid_argument(
                "staging_pool_size",
                self.staging_pool_size,
                "must be at least 1",
            ));
        }

        match self.log_level.to_ascii_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(SymHeapError::invalid_argument(
                    "log_level",
                    &self.log_level,
                    "expected one of off, error, warn, info, debug, trace",
                ))
            }
        }

        Ok(())
    }

    /// Number of executor threads after resolving the `0 = all cores` rule
    pub fn effective_executor_threads(&self) -> usize {
        if self.executor_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.executor_threads
        }
    }

    /// Load configuration from a `.toml` or `.json` file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: RuntimeConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => {
                return Err(SymHeapError::config(
                    "Unsupported config file format. Use .json or .toml",
                ))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a `.toml` or `.json` file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| SymHeapError::config(format!("Failed to serialize to TOML: {}", e)))?,
            _ => {
                return Err(SymHeapError::config(
                    "Unsupported config file format. Use .json or .toml",
                ))
            }
        };

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from `SYMHEAP_*` environment variables
    pub fn load_from_environment() -> Result<Self> {
        let mut config = RuntimeConfig::default();
        config.apply_variables(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to an existing configuration
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_variables(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())?;
        self.validate()
    }

    fn apply_variables<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("STAGING_BUFFER_BYTES") {
            self.staging_buffer_bytes = val
                .parse()
                .map_err(|_| SymHeapError::config("Invalid SYMHEAP_STAGING_BUFFER_BYTES"))?;
        }

        if let Some(val) = lookup("STAGING_POOL_SIZE") {
            self.staging_pool_size = val
                .parse()
                .map_err(|_| SymHeapError::config("Invalid SYMHEAP_STAGING_POOL_SIZE"))?;
        }

        if let Some(val) = lookup("EXECUTOR") {
            self.executor = val.parse()?;
        }

        if let Some(val) = lookup("EXECUTOR_THREADS") {
            self.executor_threads = val
                .parse()
                .map_err(|_| SymHeapError::config("Invalid SYMHEAP_EXECUTOR_THREADS"))?;
        }

        if let Some(val) = lookup("SPIN_BEFORE_YIELD") {
            self.spin_before_yield = val
                .parse()
                .map_err(|_| SymHeapError::config("Invalid SYMHEAP_SPIN_BEFORE_YIELD"))?;
        }

        if let Some(val) = lookup("LOG_LEVEL") {
            self.log_level = val;
        }

        Ok(())
    }

    /// Flatten the configuration into name/value pairs for logging
    pub fn as_parameter_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            "staging_buffer_bytes".to_string(),
            self.staging_buffer_bytes.to_string(),
        );
        map.insert(
            "staging_pool_size".to_string(),
            self.staging_pool_size.to_string(),
        );
        map.insert("executor".to_string(), self.executor.to_string());
        map.insert(
            "executor_threads".to_string(),
            self.executor_threads.to_string(),
        );
        map.insert(
            "spin_before_yield".to_string(),
            self.spin_before_yield.to_string(),
        );
        map.insert("log_level".to_string(), self.log_level.clone());
        map
    }
}

/// Configuration builder for fluent configuration creation
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: RuntimeConfig,
    validation_errors: Vec<String>,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        ConfigBuilder {
            config: RuntimeConfig::default(),
            validation_errors: Vec::new(),
        }
    }

    /// Set the staging buffer size
    pub fn staging_buffer_bytes(mut self, bytes: usize) -> Self {
        if bytes == 0 || bytes % ALLOC_GRANULARITY != 0 {
            self.validation_errors.push(format!(
                "staging_buffer_bytes must be a positive multiple of {}",
                ALLOC_GRANULARITY
            ));
        }
        self.config.staging_buffer_bytes = bytes;
        self
    }

    /// Set the number of retained staging buffers
    pub fn staging_pool_size(mut self, size: usize) -> Self {
        if size == 0 {
            self.validation_errors
                .push("staging_pool_size must be at least 1".to_string());
        }
        self.config.staging_pool_size = size;
        self
    }

    /// Set the executor flavour
    pub fn executor(mut self, executor: ExecutorKind) -> Self {
        self.config.executor = executor;
        self
    }

    /// Set the executor pool thread count
    pub fn executor_threads(mut self, threads: usize) -> Self {
        self.config.executor_threads = threads;
        self
    }

    /// Set the busy-spin count before yielding
    pub fn spin_before_yield(mut self, spins: u32) -> Self {
        self.config.spin_before_yield = spins;
        self
    }

    /// Set the default log filter
    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<RuntimeConfig> {
        if !self.validation_errors.is_empty() {
            return Err(SymHeapError::config(format!(
                "Configuration validation failed: {}",
                self.validation_errors.join(", ")
            )));
        }

        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
