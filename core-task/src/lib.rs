//! # Core Task Module
//!
//! Keyed, deduplicating, interceptable task pools.
//!
//! ## Overview
//!
//! - [`Task`]: a unit of work with a stable id
//! - [`TaskPool`]: runs tasks on a bounded set of threads, never two with the
//!   same id at once, queued ones in submission order
//! - [`TaskResult`]: single-assignment result with callbacks, forwarding,
//!   blocking and async waits, and chaining
//! - [`TaskInterceptor`]: policy hooks that may substitute or veto a task
//!   right before it runs; [`CacheInterceptor`] is the stock one
//! - [`PoolRegistry`]: the application's table of named pools
//!
//! ## Example
//!
//! ```rust
//! use core_task::{PoolRegistry, Task, TaskContext};
//!
//! struct Fetch(&'static str);
//!
//! impl Task for Fetch {
//!     type Output = String;
//!
//!     fn id(&self) -> String {
//!         format!("fetch-{}", self.0)
//!     }
//!
//!     fn run(&mut self, ctx: &mut TaskContext<'_, String>) -> anyhow::Result<()> {
//!         ctx.complete(self.0.to_uppercase())?;
//!         Ok(())
//!     }
//! }
//!
//! let registry = PoolRegistry::new();
//! let pool = registry.default_pool().unwrap();
//!
//! // Same id: the second request waits for the first instead of racing it
//! let first = pool.execute(Fetch("a"));
//! let second = pool.execute(Fetch("a"));
//! assert_eq!(first.get().unwrap(), "A");
//! assert_eq!(second.get().unwrap(), "A");
//!
//! registry.shutdown_all();
//! ```

pub mod cache;
pub mod chain;
pub mod error;
pub mod handle;
pub mod interceptor;
pub mod pool;
pub mod registry;
pub mod result;
pub mod task;

pub use cache::CacheInterceptor;
pub use error::{Result, TaskError};
pub use handle::{ContextHandle, Liveness};
pub use interceptor::{interceptor_fn, FnInterceptor, Interception, TaskInterceptor};
pub use pool::{RunningTaskInfo, TaskPool, TaskPoolBuilder};
pub use registry::PoolRegistry;
pub use result::{Delivery, Outcome, TaskResult};
pub use task::{BoxedTask, DynTask, FnTask, Interrupt, Task, TaskContext};
