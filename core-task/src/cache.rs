//! An interceptor that answers tasks from an LRU cache of earlier outputs.
//!
//! ```rust
//! use core_task::{CacheInterceptor, FnTask, TaskPool};
//! use std::sync::Arc;
//!
//! let cache = Arc::new(CacheInterceptor::<u32>::with_capacity(64).unwrap());
//! let pool = TaskPool::builder("lookups")
//!     .shared_interceptor(cache.clone())
//!     .build()
//!     .unwrap();
//!
//! cache.insert("user-7", 7);
//!
//! // Answered by the cache; the closure never runs
//! let second = pool.execute(FnTask::new("user-7", || -> anyhow::Result<u32> { unreachable!() }));
//! assert_eq!(second.get().unwrap(), 7);
//! assert!(second.outcome().unwrap().is_cached());
//!
//! // Fresh results can populate the cache as they arrive
//! let fresh = pool.execute(FnTask::new("user-8", || Ok(8)));
//! cache.record(&fresh);
//! pool.shutdown();
//! ```

use crate::error::{Result, TaskError};
use crate::interceptor::{Interception, TaskInterceptor};
use crate::result::{Outcome, TaskResult};
use crate::task::{DynTask, Task, TaskContext};
use core_async::sync::blocking::{lock, Mutex};
use lru::LruCache;
use std::any::TypeId;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Remembers task outputs by task id and substitutes a cache hit for any
/// later task with the same id and output type.
pub struct CacheInterceptor<T> {
    entries: Mutex<LruCache<String, T>>,
    hits: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> CacheInterceptor<T> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
        }
    }

    /// # Errors
    ///
    /// [`TaskError::Config`] when `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        NonZeroUsize::new(capacity)
            .map(Self::new)
            .ok_or_else(|| TaskError::Config("cache capacity must be greater than 0".to_string()))
    }

    pub fn insert(&self, id: impl Into<String>, value: T) {
        lock(&self.entries).put(id.into(), value);
    }

    pub fn get(&self, id: &str) -> Option<T> {
        lock(&self.entries).get(id).cloned()
    }

    pub fn invalidate(&self, id: &str) -> Option<T> {
        lock(&self.entries).pop(id)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Stores the fresh value of `result` once it is delivered.
    ///
    /// Results without a task id, failures and cache hits are ignored.
    pub fn record(self: &Arc<Self>, result: &TaskResult<T>) {
        let Some(id) = result.id().map(str::to_string) else {
            return;
        };
        let cache = Arc::clone(self);
        result.link(move |outcome| {
            if let Some(Outcome::Value(value)) = outcome.map(|outcome| &**outcome) {
                cache.insert(id, value.clone());
            }
        });
    }
}

impl<T: Clone + Send + Sync + 'static> TaskInterceptor for CacheInterceptor<T> {
    fn intercept(&self, task: &dyn DynTask) -> Interception {
        if task.output_type() != TypeId::of::<T>() {
            return Interception::Proceed;
        }

        let id = task.task_id();
        match self.get(&id) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(task_id = %id, "Cache hit");
                Interception::substitute(CachedTask {
                    id,
                    value: Some(value),
                })
            }
            None => Interception::Proceed,
        }
    }
}

struct CachedTask<T> {
    id: String,
    value: Option<T>,
}

impl<T: Send + Sync + 'static> Task for CachedTask<T> {
    type Output = T;

    fn id(&self) -> String {
        self.id.clone()
    }

    fn log_key(&self) -> String {
        format!("{}#cache", self.id)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_, T>) -> anyhow::Result<()> {
        match self.value.take() {
            Some(value) => ctx.complete_from_cache(value)?,
            None => ctx.fail(TaskError::IllegalState(format!(
                "cached task '{}' already ran",
                self.id
            )))?,
        }
        Ok(())
    }
}
