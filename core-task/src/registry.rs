//! Name → pool table owned by the application.
//!
//! ```rust
//! use core_task::{FnTask, PoolRegistry};
//!
//! let registry = PoolRegistry::new();
//! let io = registry.builder("io").max_threads(8).build().unwrap();
//! assert!(registry.get("io").is_some());
//!
//! // The default pool is created on first use
//! let answer = registry.execute(FnTask::new("answer", || Ok(42)));
//! assert_eq!(answer.get().unwrap(), 42);
//!
//! registry.shutdown_all();
//! assert!(io.is_shutdown());
//! ```

use crate::error::{Result, TaskError};
use crate::pool::{PoolInner, TaskPool, TaskPoolBuilder};
use crate::result::TaskResult;
use crate::task::Task;
use core_async::sync::blocking::{lock, Mutex};
use core_runtime::config::{EngineConfig, PoolConfig};
use core_runtime::events::EventBus;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of named pools with a lazily created default pool.
///
/// Cheap to clone; clones share the table. Pools built through
/// [`builder`](Self::builder) register themselves and leave the table when
/// shut down.
#[derive(Clone)]
pub struct PoolRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    pools: Mutex<HashMap<String, TaskPool>>,
    default_pool: PoolConfig,
    events: Option<EventBus>,
}

impl RegistryInner {
    pub(crate) fn contains(&self, name: &str) -> bool {
        lock(&self.pools).contains_key(name)
    }

    pub(crate) fn register(&self, pool: TaskPool) -> Result<()> {
        let mut pools = lock(&self.pools);
        if pools.contains_key(pool.name()) {
            return Err(TaskError::DuplicatePool(pool.name().to_string()));
        }
        debug!(pool = %pool.name(), "Registering task pool");
        pools.insert(pool.name().to_string(), pool);
        Ok(())
    }

    /// Removes `name` only if it still maps to `pool`.
    pub(crate) fn deregister(&self, name: &str, pool: &PoolInner) {
        let mut pools = lock(&self.pools);
        if pools.get(name).is_some_and(|registered| registered.is_same(pool)) {
            pools.remove(name);
            debug!(pool = %name, "Deregistered task pool");
        }
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::with_parts(PoolConfig::default(), None)
    }

    /// A registry whose pools publish lifecycle events on `events`.
    pub fn with_events(events: EventBus) -> Self {
        Self::with_parts(PoolConfig::default(), Some(events))
    }

    fn with_parts(default_pool: PoolConfig, events: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pools: Mutex::new(HashMap::new()),
                default_pool,
                events,
            }),
        }
    }

    /// Builds every extra pool named in `config`. The default pool is still
    /// created on first use, with `config.default_pool` sizing.
    ///
    /// # Errors
    ///
    /// [`TaskError::Config`] for an invalid configuration, or the first error
    /// raised while building a pool.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let events = config
            .enable_events
            .then(|| EventBus::new(config.event_buffer_size));
        let registry = Self::with_parts(config.default_pool.clone(), events);

        for pool in &config.pools {
            if let Err(error) = registry.builder(pool.name.clone()).config(pool).build() {
                registry.shutdown_all();
                return Err(error);
            }
        }
        info!(pools = config.pools.len(), "Task pool registry configured");
        Ok(registry)
    }

    /// Starts a pool that registers itself here on `build`.
    pub fn builder(&self, name: impl Into<String>) -> TaskPoolBuilder {
        let builder = TaskPool::builder(name).registry(Arc::clone(&self.inner));
        match &self.inner.events {
            Some(events) => builder.events(events.clone()),
            None => builder,
        }
    }

    /// Adds a pool built elsewhere.
    ///
    /// Shutting such a pool down does not remove it; use
    /// [`remove`](Self::remove).
    pub fn register(&self, pool: TaskPool) -> Result<()> {
        self.inner.register(pool)
    }

    pub fn remove(&self, name: &str) -> Option<TaskPool> {
        lock(&self.inner.pools).remove(name)
    }

    pub fn get(&self, name: &str) -> Option<TaskPool> {
        lock(&self.inner.pools).get(name).cloned()
    }

    /// The pool for ambient work, created on first call.
    pub fn default_pool(&self) -> Result<TaskPool> {
        let name = self.inner.default_pool.name.clone();
        if let Some(pool) = self.get(&name) {
            return Ok(pool);
        }

        match self
            .builder(name.clone())
            .config(&self.inner.default_pool)
            .build()
        {
            Ok(pool) => Ok(pool),
            // Another thread created it first
            Err(TaskError::DuplicatePool(_)) => self
                .get(&name)
                .ok_or_else(|| TaskError::IllegalState(format!("pool '{}' vanished", name))),
            Err(error) => Err(error),
        }
    }

    /// Runs `task` on the default pool.
    pub fn execute<T: Task>(&self, task: T) -> TaskResult<T::Output> {
        match self.default_pool() {
            Ok(pool) => pool.execute(task),
            Err(error) => TaskResult::failed(Some(task.id()), error),
        }
    }

    /// Registered pool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.pools).keys().cloned().collect();
        names.sort();
        names
    }

    fn pools(&self) -> Vec<TaskPool> {
        lock(&self.inner.pools).values().cloned().collect()
    }

    pub fn all_running_count(&self) -> usize {
        self.pools().iter().map(TaskPool::running_count).sum()
    }

    pub fn all_pending_count(&self) -> usize {
        self.pools().iter().map(TaskPool::pending_count).sum()
    }

    /// Whether any registered pool is running a task with this id.
    pub fn is_running_anywhere(&self, id: &str) -> bool {
        self.pools().iter().any(|pool| pool.is_running(id))
    }

    /// Gracefully shuts down every registered pool.
    pub fn shutdown_all(&self) {
        let pools: Vec<TaskPool> = lock(&self.inner.pools).drain().map(|(_, pool)| pool).collect();
        info!(count = pools.len(), "Shutting down all task pools");
        for pool in pools {
            pool.shutdown();
        }
    }

    pub fn events(&self) -> Option<&EventBus> {
        self.inner.events.as_ref()
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.names())
            .field("events", &self.inner.events.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_runtime::config::DEFAULT_POOL_NAME;

    #[test]
    fn test_duplicate_name_is_refused() {
        let registry = PoolRegistry::new();
        let first = registry.builder("io").max_threads(1).build().unwrap();

        let second = registry.builder("io").max_threads(1).build();
        assert!(matches!(second, Err(TaskError::DuplicatePool(name)) if name == "io"));

        // The first pool is untouched
        assert!(registry.get("io").is_some());
        assert!(!first.is_shutdown());
        registry.shutdown_all();
    }

    #[test]
    fn test_shutdown_deregisters() {
        let registry = PoolRegistry::new();
        let pool = registry.builder("short-lived").build().unwrap();
        assert_eq!(registry.names(), vec!["short-lived".to_string()]);

        pool.shutdown();
        assert!(registry.get("short-lived").is_none());

        // The name can be reused afterwards
        let again = registry.builder("short-lived").build().unwrap();
        again.shutdown_now();
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_default_pool_is_created_once() {
        let registry = PoolRegistry::new();
        let first = registry.default_pool().unwrap();
        let second = registry.default_pool().unwrap();

        assert_eq!(first.name(), DEFAULT_POOL_NAME);
        assert!(second.is_same_pool(&first));
        registry.shutdown_all();
    }

    #[test]
    fn test_from_config_builds_named_pools() {
        let config = EngineConfig::builder()
            .pool(PoolConfig::new("io").with_max_threads(3))
            .pool(PoolConfig::new("cpu").with_max_threads(2))
            .build()
            .unwrap();

        let registry = PoolRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["cpu".to_string(), "io".to_string()]);
        assert_eq!(registry.get("io").unwrap().max_threads(), 3);
        assert!(registry.events().is_some());
        registry.shutdown_all();
        assert!(registry.names().is_empty());
    }
}
