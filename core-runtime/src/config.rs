//! # Engine Configuration Module
//!
//! Provides configuration for task pools and for the engine as a whole.
//!
//! ## Overview
//!
//! A [`PoolConfig`] describes one worker pool: its registry name, its thread
//! budget and how many jobs may wait for a thread before submissions are
//! rejected. An [`EngineConfig`] groups the default pool with any additional
//! named pools plus the lifecycle event settings. Both validate eagerly so a
//! bad value fails at startup instead of at the first submission.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::{EngineConfig, PoolConfig};
//!
//! let config = EngineConfig::builder()
//!     .pool(PoolConfig::new("http").with_max_threads(8))
//!     .event_buffer_size(256)
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.pools[0].name, "http");
//! ```
//!
//! Configuration can also be loaded from JSON; missing fields take their
//! defaults:
//!
//! ```
//! use core_runtime::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(
//!     r#"{ "pools": [ { "name": "io", "max_threads": 4 } ] }"#,
//! )
//! .unwrap();
//! assert_eq!(config.pools[0].queue_capacity, 128);
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Name of the pool used for ambient submissions.
pub const DEFAULT_POOL_NAME: &str = "default";

/// Jobs that may wait for a worker thread before submissions are rejected.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Upper bound on a single pool's thread budget.
pub const MAX_THREADS_LIMIT: usize = 512;

/// Default capacity of the lifecycle event channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Default thread budget: twice the available parallelism, plus one.
pub fn default_max_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * 2 + 1
}

/// Configuration for a single task pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Registry name; also the prefix of the pool's thread names
    pub name: String,

    /// Maximum number of task bodies running at once
    pub max_threads: usize,

    /// Jobs that may wait for a free thread before new work is rejected
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_NAME)
    }
}

impl PoolConfig {
    /// Creates a pool configuration with default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_threads: default_max_threads(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Sets the thread budget
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets the waiting-job capacity
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Total jobs the executor accepts before rejecting: running plus waiting.
    pub fn capacity(&self) -> usize {
        self.max_threads.saturating_add(self.queue_capacity)
    }

    /// Name of the pool's dispatch thread.
    pub fn dispatch_thread_name(&self) -> String {
        format!("{}-dispatch", self.name)
    }

    /// Validates the configuration.
    ///
    /// This checks:
    /// - The name is not blank
    /// - The thread budget is between 1 and [`MAX_THREADS_LIMIT`]
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("Pool name cannot be empty".to_string()));
        }

        if self.max_threads == 0 {
            return Err(Error::Config(format!(
                "Pool '{}' must allow at least one thread",
                self.name
            )));
        }

        if self.max_threads > MAX_THREADS_LIMIT {
            return Err(Error::Config(format!(
                "Pool '{}' requests {} threads; the maximum is {}",
                self.name, self.max_threads, MAX_THREADS_LIMIT
            )));
        }

        Ok(())
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The pool backing ambient submissions
    pub default_pool: PoolConfig,

    /// Additional named pools created up front
    pub pools: Vec<PoolConfig>,

    /// Publish task and pool lifecycle events
    pub enable_events: bool,

    /// Capacity of the lifecycle event channel
    pub event_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_pool: PoolConfig::default(),
            pools: Vec::new(),
            enable_events: true,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl EngineConfig {
    /// Creates a new builder for constructing an `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Every configured pool, default pool first.
    pub fn all_pools(&self) -> impl Iterator<Item = &PoolConfig> {
        std::iter::once(&self.default_pool).chain(self.pools.iter())
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Every pool configuration is valid
    /// - Pool names are unique
    /// - The event buffer is non-empty when events are enabled
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for pool in self.all_pools() {
            pool.validate()?;
            if !names.insert(pool.name.as_str()) {
                return Err(Error::Config(format!(
                    "Pool name '{}' is configured more than once",
                    pool.name
                )));
            }
        }

        if self.enable_events && self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0 when events are enabled".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for constructing [`EngineConfig`] instances.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    default_pool: Option<PoolConfig>,
    pools: Vec<PoolConfig>,
    enable_events: Option<bool>,
    event_buffer_size: Option<usize>,
}

impl EngineConfigBuilder {
    /// Overrides the default pool's configuration.
    pub fn default_pool(mut self, pool: PoolConfig) -> Self {
        self.default_pool = Some(pool);
        self
    }

    /// Adds a named pool.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pools.push(pool);
        self
    }

    /// Enables or disables lifecycle events.
    pub fn enable_events(mut self, enabled: bool) -> Self {
        self.enable_events = Some(enabled);
        self
    }

    /// Sets the lifecycle event channel capacity.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            default_pool: self.default_pool.unwrap_or(defaults.default_pool),
            pools: self.pools,
            enable_events: self.enable_events.unwrap_or(defaults.enable_events),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(defaults.event_buffer_size),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.name, DEFAULT_POOL_NAME);
        assert_eq!(config.max_threads, default_max_threads());
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_max_threads_is_odd_and_positive() {
        let threads = default_max_threads();
        assert!(threads >= 3);
        assert_eq!(threads % 2, 1);
    }

    #[test]
    fn test_pool_capacity() {
        let config = PoolConfig::new("io")
            .with_max_threads(4)
            .with_queue_capacity(10);
        assert_eq!(config.capacity(), 14);
        assert_eq!(config.dispatch_thread_name(), "io-dispatch");
    }

    #[test]
    fn test_validate_rejects_blank_name() {
        let result = PoolConfig::new("  ").validate();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let result = PoolConfig::new("io").with_max_threads(0).validate();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_excessive_threads() {
        let result = PoolConfig::new("io")
            .with_max_threads(MAX_THREADS_LIMIT + 1)
            .validate();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_queue_capacity_is_allowed() {
        let config = PoolConfig::new("strict")
            .with_max_threads(1)
            .with_queue_capacity(0);
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity(), 1);
    }

    #[test]
    fn test_builder_with_pools() {
        let config = EngineConfig::builder()
            .default_pool(PoolConfig::default().with_max_threads(2))
            .pool(PoolConfig::new("http"))
            .pool(PoolConfig::new("disk"))
            .build()
            .unwrap();

        let names: Vec<_> = config.all_pools().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["default", "http", "disk"]);
        assert_eq!(config.default_pool.max_threads, 2);
    }

    #[test]
    fn test_builder_rejects_duplicate_names() {
        let result = EngineConfig::builder()
            .pool(PoolConfig::new("http"))
            .pool(PoolConfig::new("http"))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_rejects_pool_shadowing_default() {
        let result = EngineConfig::builder()
            .pool(PoolConfig::new(DEFAULT_POOL_NAME))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_event_buffer() {
        let result = EngineConfig::builder().event_buffer_size(0).build();
        assert!(result.is_err());

        let result = EngineConfig::builder()
            .enable_events(false)
            .event_buffer_size(0)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "default_pool": { "max_threads": 3 },
                "pools": [ { "name": "io", "queue_capacity": 4 } ],
                "enable_events": false
            }"#,
        )
        .unwrap();

        assert_eq!(config.default_pool.name, DEFAULT_POOL_NAME);
        assert_eq!(config.default_pool.max_threads, 3);
        assert_eq!(config.pools[0].queue_capacity, 4);
        assert_eq!(config.pools[0].max_threads, default_max_threads());
        assert!(!config.enable_events);
        assert_eq!(config.event_buffer_size, DEFAULT_EVENT_BUFFER_SIZE);
    }

    #[test]
    fn test_from_json_reports_parse_errors() {
        let result = EngineConfig::from_json_str("{ not json");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_from_json_validates() {
        let result = EngineConfig::from_json_str(r#"{ "pools": [ { "name": "" } ] }"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = EngineConfig::builder()
            .pool(PoolConfig::new("http").with_max_threads(6))
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }
}
