//! Policy hooks consulted immediately before a task runs.

use crate::task::{BoxedTask, DynTask, Task};
use std::fmt;

/// What an interceptor decided for a task.
pub enum Interception {
    /// Run the task as is, or pass it to the next interceptor.
    Proceed,
    /// Run this task instead. It must have the same id and output type.
    Substitute(BoxedTask),
    /// Do not run anything. The task's result is discarded.
    Discard,
}

impl Interception {
    pub fn substitute<T: Task>(task: T) -> Self {
        Interception::Substitute(Box::new(task))
    }
}

impl fmt::Debug for Interception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interception::Proceed => f.write_str("Proceed"),
            Interception::Substitute(task) => {
                f.debug_tuple("Substitute").field(&task.describe()).finish()
            }
            Interception::Discard => f.write_str("Discard"),
        }
    }
}

/// Decides whether a task runs, runs as something else, or not at all.
///
/// Runs on a worker thread right before the task body, in the order the
/// interceptors were registered on the pool. Later interceptors see any
/// substitute chosen by earlier ones. Keep it quick: the worker is held
/// while it runs.
pub trait TaskInterceptor: Send + Sync {
    fn intercept(&self, task: &dyn DynTask) -> Interception;
}

/// Adapts a closure into a [`TaskInterceptor`].
pub struct FnInterceptor<F> {
    decide: F,
}

impl<F> TaskInterceptor for FnInterceptor<F>
where
    F: Fn(&dyn DynTask) -> Interception + Send + Sync,
{
    fn intercept(&self, task: &dyn DynTask) -> Interception {
        (self.decide)(task)
    }
}

/// ```rust
/// use core_task::{interceptor_fn, Interception};
///
/// let deny_admin = interceptor_fn(|task| {
///     if task.task_id().starts_with("admin-") {
///         Interception::Discard
///     } else {
///         Interception::Proceed
///     }
/// });
/// ```
pub fn interceptor_fn<F>(decide: F) -> FnInterceptor<F>
where
    F: Fn(&dyn DynTask) -> Interception + Send + Sync,
{
    FnInterceptor { decide }
}
