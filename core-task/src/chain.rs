//! Composing results into multi-step pipelines.
//!
//! ```rust
//! use core_task::{FnTask, TaskPool};
//!
//! let pool = TaskPool::builder("pipeline").build().unwrap();
//! let total = pool
//!     .execute(FnTask::new("load", || Ok(20)))
//!     .continue_with(&pool, |loaded| {
//!         let loaded = *loaded;
//!         FnTask::new("double", move || Ok(loaded * 2))
//!     });
//! assert_eq!(total.get().unwrap(), 40);
//! pool.shutdown();
//! ```

use crate::error::TaskError;
use crate::pool::TaskPool;
use crate::result::{Outcome, TaskResult};
use crate::task::Task;
use core_async::task::panic_message;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

impl<T: Send + Sync + 'static> TaskResult<T> {
    /// Runs the task built by `follow_up` on `pool` once this result holds a
    /// value. The returned result reports the follow-up's outcome, or this
    /// result's failure unchanged.
    pub fn continue_with<N, F>(&self, pool: &TaskPool, follow_up: F) -> TaskResult<N::Output>
    where
        N: Task,
        F: FnOnce(&T) -> N + Send + 'static,
    {
        chain(self, pool, follow_up, None::<fn(&TaskError) -> N>)
    }

    /// Like [`continue_with`](Self::continue_with), but a failure runs the
    /// task built by `recover` instead of propagating.
    ///
    /// A factory that panics fails the chained result with
    /// [`TaskError::Panicked`]; the pool keeps running.
    pub fn continue_with_or_else<N, F, R>(
        &self,
        pool: &TaskPool,
        follow_up: F,
        recover: R,
    ) -> TaskResult<N::Output>
    where
        N: Task,
        F: FnOnce(&T) -> N + Send + 'static,
        R: FnOnce(&TaskError) -> N + Send + 'static,
    {
        chain(self, pool, follow_up, Some(recover))
    }
}

fn chain<T, N, F, R>(
    source: &TaskResult<T>,
    pool: &TaskPool,
    follow_up: F,
    recover: Option<R>,
) -> TaskResult<N::Output>
where
    T: Send + Sync + 'static,
    N: Task,
    F: FnOnce(&T) -> N + Send + 'static,
    R: FnOnce(&TaskError) -> N + Send + 'static,
{
    let chained = TaskResult::new();
    let target = chained.clone();
    let pool = pool.clone();

    source.link(move |outcome| {
        let Some(outcome) = outcome else {
            target.discard();
            return;
        };

        let built = panic::catch_unwind(AssertUnwindSafe(|| {
            match (Arc::as_ref(outcome), recover) {
                (Outcome::Value(value) | Outcome::Cached(value), _) => Ok(follow_up(value)),
                (Outcome::Failed(error), Some(recover)) => Ok(recover(error)),
                (Outcome::Failed(error), None) => Err(error.clone()),
            }
        }));

        let failure = match built {
            Ok(Ok(next)) => return pool.execute(next).forward(&target),
            Ok(Err(error)) => error,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(pool = %pool.name(), panic = %message, "Continuation factory panicked");
                TaskError::Panicked(format!("continuation factory panicked: {}", message))
            }
        };
        if let Err(conflict) = target.set_error(failure) {
            warn!(%conflict, "Chained result was already settled");
        }
    });

    chained
}
