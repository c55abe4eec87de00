//! Workspace umbrella crate.
//!
//! Re-exports the engine crates so a host application can depend on
//! `taskpool-workspace` alone instead of wiring each crate individually.

pub use core_async;
pub use core_runtime;
pub use core_task;
