//! Synchronization primitives.
//!
//! Async channels come from `tokio::sync`. Result waiters and the pool
//! registry block OS threads rather than futures, so the [`blocking`] module
//! exposes the std primitives together with a poison-tolerant lock helper.
//!
//! # Examples
//!
//! ```rust
//! use core_async::sync::blocking::{lock, Mutex};
//!
//! let counter = Mutex::new(0);
//! *lock(&counter) += 1;
//! assert_eq!(*lock(&counter), 1);
//! ```

pub use tokio::sync::{broadcast, mpsc, oneshot};

/// Thread-blocking primitives.
pub mod blocking {
    pub use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

    /// Locks `mutex`, recovering the guard if a previous holder panicked.
    ///
    /// Every critical section in the engine leaves its data consistent before
    /// running user code, so a poisoned lock still guards valid state.
    pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::blocking::{lock, Mutex};
    use std::sync::Arc;

    #[test]
    fn test_lock_recovers_from_poison() {
        let shared = Arc::new(Mutex::new(vec![1]));
        let poisoner = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(shared.is_poisoned());
        lock(&shared).push(2);
        assert_eq!(*lock(&shared), vec![1, 2]);
    }
}
