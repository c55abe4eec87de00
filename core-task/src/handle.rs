//! Liveness-checked owner handles.
//!
//! A callback registered with a handle is told when the owner that asked for
//! the result has gone away before delivery, instead of receiving the value as
//! if nothing happened.

use crate::error::{Result, TaskError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Answers whether the owner of a callback is still around.
pub trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// A dropped `Arc` counts as a released owner.
impl<T: ?Sized + Send + Sync> Liveness for Weak<T> {
    fn is_alive(&self) -> bool {
        self.strong_count() > 0
    }
}

/// An explicitly released owner handle.
///
/// Clones share state: releasing any clone releases them all.
#[derive(Clone)]
pub struct ContextHandle {
    state: Arc<HandleState>,
}

struct HandleState {
    label: String,
    alive: AtomicBool,
    // Application-wide handles live as long as the process
    pinned: bool,
}

impl ContextHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_pinning(label.into(), false)
    }

    /// A handle for the whole application. It can never be released.
    pub fn application() -> Self {
        Self::with_pinning("application".to_string(), true)
    }

    fn with_pinning(label: String, pinned: bool) -> Self {
        Self {
            state: Arc::new(HandleState {
                label,
                alive: AtomicBool::new(true),
                pinned,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// Marks the owner as gone.
    ///
    /// # Errors
    ///
    /// [`TaskError::IllegalState`] for the application handle.
    pub fn release(&self) -> Result<()> {
        if self.state.pinned {
            return Err(TaskError::IllegalState(
                "the application handle cannot be released".to_string(),
            ));
        }
        self.state.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Marks a released owner as live again, e.g. a screen that came back.
    pub fn reattach(&self) {
        self.state.alive.store(true, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        !self.state.alive.load(Ordering::SeqCst)
    }
}

impl Liveness for ContextHandle {
    fn is_alive(&self) -> bool {
        !self.is_released()
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("label", &self.state.label)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_and_reattach() {
        let handle = ContextHandle::new("detail-screen");
        let clone = handle.clone();
        assert!(clone.is_alive());

        handle.release().unwrap();
        assert!(!clone.is_alive());

        clone.reattach();
        assert!(handle.is_alive());
    }

    #[test]
    fn test_application_handle_refuses_release() {
        let handle = ContextHandle::application();
        assert!(handle.release().unwrap_err().is_contract_violation());
        assert!(handle.is_alive());
    }

    #[test]
    fn test_weak_liveness_follows_strong_count() {
        let owner = Arc::new(String::from("screen"));
        let weak = Arc::downgrade(&owner);
        assert!(weak.is_alive());
        drop(owner);
        assert!(!weak.is_alive());
    }
}
