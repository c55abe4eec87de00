//! # Core Runtime Module
//!
//! Provides the ambient infrastructure the task engine runs on:
//! - Logging and tracing infrastructure
//! - Pool and engine configuration
//! - Task and pool lifecycle events
//!
//! ## Overview
//!
//! Nothing in this crate schedules work. It establishes the configuration
//! shape, logging conventions and event broadcasting that `core-task` and its
//! callers share.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
