//! Time-related abstractions.
//!
//! Re-exports the executor's timers for async callers and adds [`Deadline`],
//! the monotonic cut-off used by blocking waits.
//!
//! # Examples
//!
//! ```rust
//! use core_async::time::{Deadline, Duration};
//!
//! let deadline = Deadline::after(Duration::from_secs(5));
//! assert!(!deadline.is_expired());
//! assert!(deadline.remaining().is_some());
//! ```

pub use std::time::{Duration, Instant};
pub use tokio::time::{sleep, timeout};

/// A point in monotonic time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now. Saturates instead of overflowing.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        let at = now.checked_add(timeout).unwrap_or_else(|| far_future(now));
        Self { at }
    }

    /// Time left before the deadline, or `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            None
        } else {
            Some(left)
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }
}

fn far_future(now: Instant) -> Instant {
    // Roughly thirty years; Instant arithmetic panics beyond platform limits.
    now + Duration::from_secs(86_400 * 365 * 30)
}

/// Milliseconds elapsed since `start`, clamped to `u64`.
pub fn elapsed_millis(start: Instant) -> u64 {
    start.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}
