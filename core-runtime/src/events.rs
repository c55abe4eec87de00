//! # Event Bus System
//!
//! Broadcasts task and pool lifecycle events using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: [`TaskEvent`] and [`PoolEvent`] wrapped in [`CoreEvent`]
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     emit      ┌───────────┐
//! │ Worker      ├──────────────>│           │
//! └─────────────┘               │           │     subscribe    ┌────────────┐
//!                               │ EventBus  ├─────────────────>│ Subscriber │
//! ┌─────────────┐     emit      │           │                  └────────────┘
//! │ Dispatcher  ├──────────────>│           │
//! └─────────────┘               └───────────┘
//! ```
//!
//! Emission never blocks and never fails the emitting task. A bus with no
//! subscribers simply drops the event.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, TaskEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(CoreEvent::Task(TaskEvent::Started {
//!     pool: "io".to_string(),
//!     task_id: "fetch-A".to_string(),
//! }))
//! .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.task_id(), Some("fetch-A"));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.

use crate::config::DEFAULT_EVENT_BUFFER_SIZE;
use core_async::sync::broadcast;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use core_async::sync::broadcast::error::{RecvError, SendError};
pub use core_async::sync::broadcast::Receiver;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Per-task lifecycle
    Task(TaskEvent),
    /// Pool lifecycle
    Pool(PoolEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Task(e) => e.description(),
            CoreEvent::Pool(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Task(TaskEvent::Rejected { .. }) => EventSeverity::Warning,
            CoreEvent::Task(TaskEvent::Finished {
                succeeded: false, ..
            }) => EventSeverity::Warning,
            CoreEvent::Task(TaskEvent::Intercepted { .. })
            | CoreEvent::Task(TaskEvent::Discarded { .. }) => EventSeverity::Info,
            CoreEvent::Pool(_) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Name of the pool the event originated from.
    pub fn pool(&self) -> &str {
        match self {
            CoreEvent::Task(e) => e.pool(),
            CoreEvent::Pool(PoolEvent::Created { pool, .. })
            | CoreEvent::Pool(PoolEvent::Shutdown { pool, .. }) => pool,
        }
    }

    /// Task id for task events, `None` for pool events.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Task(e) => Some(e.task_id()),
            CoreEvent::Pool(_) => None,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Task Events
// ============================================================================

/// Events describing a single submission as it moves through a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum TaskEvent {
    /// Accepted, but another task with the same id is running.
    Queued { pool: String, task_id: String },
    /// Handed to a worker thread.
    Started { pool: String, task_id: String },
    /// An interceptor replaced the task before it ran.
    Intercepted {
        pool: String,
        task_id: String,
        /// Log key of the task that was replaced.
        original: String,
        /// Log key of the replacement.
        replacement: String,
    },
    /// An interceptor vetoed the task. No body ran.
    Discarded { pool: String, task_id: String },
    /// The body returned and its outcome is about to be delivered.
    Finished {
        pool: String,
        task_id: String,
        elapsed_ms: u64,
        succeeded: bool,
    },
    /// The pool refused the submission.
    Rejected {
        pool: String,
        task_id: String,
        reason: String,
    },
}

impl TaskEvent {
    fn description(&self) -> &str {
        match self {
            TaskEvent::Queued { .. } => "Task queued behind a running task with the same id",
            TaskEvent::Started { .. } => "Task started",
            TaskEvent::Intercepted { .. } => "Task replaced by interceptor",
            TaskEvent::Discarded { .. } => "Task discarded by interceptor",
            TaskEvent::Finished { .. } => "Task finished",
            TaskEvent::Rejected { .. } => "Task rejected",
        }
    }

    pub fn pool(&self) -> &str {
        match self {
            TaskEvent::Queued { pool, .. }
            | TaskEvent::Started { pool, .. }
            | TaskEvent::Intercepted { pool, .. }
            | TaskEvent::Discarded { pool, .. }
            | TaskEvent::Finished { pool, .. }
            | TaskEvent::Rejected { pool, .. } => pool,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Queued { task_id, .. }
            | TaskEvent::Started { task_id, .. }
            | TaskEvent::Intercepted { task_id, .. }
            | TaskEvent::Discarded { task_id, .. }
            | TaskEvent::Finished { task_id, .. }
            | TaskEvent::Rejected { task_id, .. } => task_id,
        }
    }
}

// ============================================================================
// Pool Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PoolEvent {
    /// Pool built and accepting work.
    Created { pool: String, max_threads: usize },
    /// Pool stopped accepting work.
    Shutdown {
        pool: String,
        /// `true` for `shutdown_now`, which interrupts running tasks.
        immediate: bool,
    },
}

impl PoolEvent {
    fn description(&self) -> &str {
        match self {
            PoolEvent::Created { .. } => "Pool created",
            PoolEvent::Shutdown {
                immediate: true, ..
            } => "Pool shut down immediately",
            PoolEvent::Shutdown { .. } => "Pool shutting down",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends, usable from worker threads outside the runtime
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. [`EngineConfig::validate`] rejects that
    /// value before it gets here.
    ///
    /// [`EngineConfig::validate`]: crate::config::EngineConfig::validate
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new event bus with the default buffer size.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    ///
    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.subscriber_count(), 0);
    ///
    /// let _subscriber = event_bus.subscribe();
    /// assert_eq!(event_bus.subscriber_count(), 1);
    /// ```
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let io_only = EventStream::new(event_bus.subscribe()).filter(|event| event.pool() == "io");
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without waiting.
    ///
    /// Returns `None` if no matching events are currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
