//! Runtime abstraction layer for the task engine.
//!
//! The engine runs synchronous task bodies on a bounded set of OS threads and
//! hands results back through blocking and async waiters. This crate owns every
//! touch point with the underlying executor so the other crates never depend on
//! Tokio's runtime types directly.
//!
//! # Modules
//!
//! - `runtime`: Building the per-pool worker runtime
//! - `sync`: Channels plus the blocking primitives used by result waiters
//! - `time`: Durations, instants and deadlines
//!
//! # Examples
//!
//! ```rust
//! use core_async::runtime::worker_runtime;
//!
//! let runtime = worker_runtime("images", 4).expect("runtime");
//! let handle = runtime.spawn_blocking(|| 2 + 2);
//! assert_eq!(runtime.block_on(handle).unwrap(), 4);
//! ```

pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use time::{Deadline, Duration, Instant};
