//! Single-assignment task results.
//!
//! A [`TaskResult`] is written once by whoever runs the task and read by any
//! number of clones. Readers can block ([`TaskResult::get_timeout`]), await
//! ([`TaskResult::wait`]) or register callbacks that fire exactly once with a
//! [`Delivery`].
//!
//! ```rust
//! use core_task::{Delivery, TaskResult};
//!
//! let result = TaskResult::new();
//! result.add_callback(|delivery| {
//!     if let Delivery::Fresh(value) = delivery {
//!         assert_eq!(*value, 7);
//!     }
//! });
//! result.set_value(7).unwrap();
//! assert_eq!(result.get().unwrap(), 7);
//! ```

use crate::error::{Result, TaskError};
use crate::handle::Liveness;
use crate::task::{ErasedOutcome, Interrupt};
use core_async::sync::blocking::{lock, Condvar, Mutex, PoisonError};
use core_async::sync::oneshot;
use core_async::time::{Deadline, Duration};
use core_async::task::panic_message;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// The stored outcome of a task.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Produced by running the task body.
    Value(T),
    /// Served from a cache instead of running the original body.
    Cached(T),
    Failed(TaskError),
}

impl<T> Outcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(value) | Outcome::Cached(value) => Some(value),
            Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Outcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Outcome::Failed(_))
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Outcome::Cached(_))
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Value(value) | Outcome::Cached(value) => Ok(value),
            Outcome::Failed(error) => Err(error),
        }
    }
}

impl<T: Clone> Outcome<T> {
    fn to_result(&self) -> Result<T> {
        self.clone().into_result()
    }
}

/// What a callback receives when a result is delivered.
#[derive(Debug)]
pub enum Delivery<'a, T> {
    Fresh(&'a T),
    Cached(&'a T),
    Failed(&'a TaskError),
    /// The owner handle passed at registration was released before delivery.
    /// The outcome is still attached for callers that want to log or clean up.
    OwnerReleased(&'a Outcome<T>),
}

impl<'a, T> Delivery<'a, T> {
    fn from_outcome(outcome: &'a Outcome<T>) -> Self {
        match outcome {
            Outcome::Value(value) => Delivery::Fresh(value),
            Outcome::Cached(value) => Delivery::Cached(value),
            Outcome::Failed(error) => Delivery::Failed(error),
        }
    }

    /// The delivered value, looking through `OwnerReleased`.
    pub fn value(&self) -> Option<&'a T> {
        match self {
            Delivery::Fresh(value) | Delivery::Cached(value) => Some(value),
            Delivery::Failed(_) => None,
            Delivery::OwnerReleased(outcome) => outcome.value(),
        }
    }

    /// The delivered failure, looking through `OwnerReleased`.
    pub fn error(&self) -> Option<&'a TaskError> {
        match self {
            Delivery::Failed(error) => Some(error),
            Delivery::Fresh(_) | Delivery::Cached(_) => None,
            Delivery::OwnerReleased(outcome) => outcome.error(),
        }
    }
}

type Observer<T> = Box<dyn FnOnce(Delivery<'_, T>) + Send>;
// Called with `None` when the result is discarded
type Link<T> = Box<dyn FnOnce(Option<&Arc<Outcome<T>>>) + Send>;

enum Callback<T> {
    Observer {
        call: Observer<T>,
        owner: Option<Arc<dyn Liveness>>,
    },
    Link(Link<T>),
}

enum State<T> {
    Pending(Vec<Callback<T>>),
    Complete(Arc<Outcome<T>>),
    Discarded,
}

struct Shared<T> {
    id: Option<String>,
    state: Mutex<State<T>>,
    ready: Condvar,
    interrupt: Interrupt,
}

/// A single-assignment future for a task's outcome.
///
/// Clones are cheap and observe the same state.
pub struct TaskResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> Default for TaskResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> TaskResult<T> {
    /// A pending result not tied to any task.
    pub fn new() -> Self {
        Self::with_id(None)
    }

    pub(crate) fn for_task(id: String) -> Self {
        Self::with_id(Some(id))
    }

    fn with_id(id: Option<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(State::Pending(Vec::new())),
                ready: Condvar::new(),
                interrupt: Interrupt::new(),
            }),
        }
    }

    /// An already-completed result.
    pub fn completed(value: T) -> Self {
        Self::settled(None, Outcome::Value(value))
    }

    pub(crate) fn failed(id: Option<String>, error: TaskError) -> Self {
        Self::settled(id, Outcome::Failed(error))
    }

    fn settled(id: Option<String>, outcome: Outcome<T>) -> Self {
        let result = Self::with_id(id);
        *lock(&result.shared.state) = State::Complete(Arc::new(outcome));
        result
    }

    /// Id of the task this result belongs to.
    pub fn id(&self) -> Option<&str> {
        self.shared.id.as_deref()
    }

    pub fn is_complete(&self) -> bool {
        matches!(*lock(&self.shared.state), State::Complete(_))
    }

    /// `true` once an interceptor vetoed the task. A discarded result never
    /// completes.
    pub fn is_discarded(&self) -> bool {
        matches!(*lock(&self.shared.state), State::Discarded)
    }

    /// Asks the task behind this result to stop.
    ///
    /// A task that has not started yet fails with [`TaskError::Interrupted`]
    /// instead of running. A running task sees the request at its next
    /// checkpoint.
    pub fn interrupt(&self) {
        self.shared.interrupt.request();
    }

    pub(crate) fn interrupt_flag(&self) -> &Interrupt {
        &self.shared.interrupt
    }

    /// Registers a callback.
    ///
    /// Fires on the calling thread before returning when the result is
    /// already complete; otherwise fires once on the delivering thread.
    /// Never fires for a discarded result.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(Delivery<'_, T>) + Send + 'static,
    {
        self.register(Callback::Observer {
            call: Box::new(callback),
            owner: None,
        });
    }

    /// Like [`add_callback`](Self::add_callback), but the callback receives
    /// [`Delivery::OwnerReleased`] if `owner` is no longer alive at delivery.
    pub fn add_callback_with_handle<F, H>(&self, callback: F, owner: H)
    where
        F: FnOnce(Delivery<'_, T>) + Send + 'static,
        H: Liveness + 'static,
    {
        self.register(Callback::Observer {
            call: Box::new(callback),
            owner: Some(Arc::new(owner)),
        });
    }

    /// Replays this result's outcome onto `target` exactly once.
    ///
    /// Immediate when this result is already complete. Discarding this
    /// result discards `target` as well.
    pub fn forward(&self, target: &TaskResult<T>) {
        let target = target.clone();
        self.register(Callback::Link(Box::new(move |outcome| match outcome {
            Some(outcome) => {
                if let Err(error) = target.settle(Arc::clone(outcome)) {
                    warn!(task_id = ?target.id(), %error, "Forward target was already settled");
                }
            }
            None => {
                target.discard();
            }
        })));
    }

    pub(crate) fn link<F>(&self, link: F)
    where
        F: FnOnce(Option<&Arc<Outcome<T>>>) + Send + 'static,
    {
        self.register(Callback::Link(Box::new(link)));
    }

    fn register(&self, callback: Callback<T>) {
        let mut state = lock(&self.shared.state);
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(callback),
            State::Complete(outcome) => {
                let outcome = Arc::clone(outcome);
                drop(state);
                fire(callback, &outcome);
            }
            State::Discarded => {
                drop(state);
                if let Callback::Link(link) = callback {
                    close_link(link);
                }
            }
        }
    }

    /// Delivers a fresh value.
    ///
    /// # Errors
    ///
    /// [`TaskError::IllegalState`] if the result was already settled; no
    /// callback runs a second time.
    pub fn set_value(&self, value: T) -> Result<()> {
        self.settle(Arc::new(Outcome::Value(value)))
    }

    /// Delivers a value that came from a cache.
    pub fn set_cached(&self, value: T) -> Result<()> {
        self.settle(Arc::new(Outcome::Cached(value)))
    }

    pub fn set_error(&self, error: TaskError) -> Result<()> {
        self.settle(Arc::new(Outcome::Failed(error)))
    }

    pub(crate) fn settle(&self, outcome: Arc<Outcome<T>>) -> Result<()> {
        let callbacks = {
            let mut state = lock(&self.shared.state);
            let previous = std::mem::replace(&mut *state, State::Complete(Arc::clone(&outcome)));
            match previous {
                State::Pending(callbacks) => callbacks,
                settled => {
                    let already = match settled {
                        State::Discarded => "discarded",
                        _ => "completed",
                    };
                    *state = settled;
                    return Err(TaskError::IllegalState(format!(
                        "result for {} was already {}",
                        self.describe(),
                        already
                    )));
                }
            }
        };

        self.shared.ready.notify_all();
        for callback in callbacks {
            fire(callback, &outcome);
        }
        Ok(())
    }

    /// Closes a pending result without a value or an error.
    pub(crate) fn discard(&self) -> bool {
        let callbacks = {
            let mut state = lock(&self.shared.state);
            if !matches!(*state, State::Pending(_)) {
                return false;
            }
            match std::mem::replace(&mut *state, State::Discarded) {
                State::Pending(callbacks) => callbacks,
                _ => Vec::new(),
            }
        };

        self.shared.ready.notify_all();
        for callback in callbacks {
            if let Callback::Link(link) = callback {
                close_link(link);
            }
        }
        true
    }

    /// The stored outcome, if complete.
    pub fn outcome(&self) -> Option<Arc<Outcome<T>>> {
        match &*lock(&self.shared.state) {
            State::Complete(outcome) => Some(Arc::clone(outcome)),
            _ => None,
        }
    }

    /// Waits for the outcome, up to `timeout` when given.
    pub fn wait_outcome(&self, timeout: Option<Duration>) -> Result<Arc<Outcome<T>>> {
        let deadline = timeout.map(|limit| (Deadline::after(limit), limit));
        let mut state = lock(&self.shared.state);
        loop {
            match &*state {
                State::Complete(outcome) => return Ok(Arc::clone(outcome)),
                State::Discarded => return Err(self.discarded_error()),
                State::Pending(_) => {}
            }

            state = match deadline {
                None => self
                    .shared
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some((deadline, limit)) => {
                    let Some(left) = deadline.remaining() else {
                        return Err(TaskError::Timeout(limit));
                    };
                    self.shared
                        .ready
                        .wait_timeout(state, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn discarded_error(&self) -> TaskError {
        TaskError::Discarded {
            id: self.shared.id.clone().unwrap_or_default(),
        }
    }

    fn describe(&self) -> String {
        match &self.shared.id {
            Some(id) => format!("task '{}'", id),
            None => "detached result".to_string(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TaskResult<T> {
    /// Blocks until the outcome arrives.
    ///
    /// Must not be called from a callback of the pool that will deliver this
    /// result; that thread is the one doing the delivering.
    pub fn get(&self) -> Result<T> {
        self.wait_outcome(None)?.to_result()
    }

    /// Blocks for at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`TaskError::Timeout`] when the deadline passes first, the stored
    /// failure when the task failed, [`TaskError::Discarded`] when vetoed.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        self.wait_outcome(Some(timeout))?.to_result()
    }

    /// Returns the outcome without waiting, or [`TaskError::NotReady`].
    pub fn try_get(&self) -> Result<T> {
        match &*lock(&self.shared.state) {
            State::Complete(outcome) => outcome.to_result(),
            State::Discarded => Err(self.discarded_error()),
            State::Pending(_) => Err(TaskError::NotReady),
        }
    }

    /// Awaits the outcome without blocking the executor.
    pub async fn wait(&self) -> Result<T> {
        let (tx, rx) = oneshot::channel::<()>();
        self.add_callback(move |_| {
            let _ = tx.send(());
        });
        // A discarded result drops the callback, which closes the channel
        let _ = rx.await;
        self.try_get()
    }
}

fn fire<T>(callback: Callback<T>, outcome: &Arc<Outcome<T>>) {
    match callback {
        Callback::Observer { call, owner } => {
            let delivery = match owner {
                Some(owner) if !owner.is_alive() => Delivery::OwnerReleased(outcome.as_ref()),
                _ => Delivery::from_outcome(outcome.as_ref()),
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| call(delivery))) {
                error!(panic = %panic_message(payload.as_ref()), "Result callback panicked");
            }
        }
        Callback::Link(link) => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| link(Some(outcome)))) {
                error!(panic = %panic_message(payload.as_ref()), "Result link panicked");
            }
        }
    }
}

fn close_link<T>(link: Link<T>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| link(None))) {
        error!(panic = %panic_message(payload.as_ref()), "Result link panicked on discard");
    }
}

impl<T> fmt::Debug for TaskResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*lock(&self.shared.state) {
            State::Pending(callbacks) => format!("Pending({} callbacks)", callbacks.len()),
            State::Complete(outcome) if outcome.is_success() => "Complete".to_string(),
            State::Complete(_) => "Failed".to_string(),
            State::Discarded => "Discarded".to_string(),
        };
        f.debug_struct("TaskResult")
            .field("id", &self.shared.id)
            .field("state", &state)
            .finish()
    }
}

/// Type-erased write side of a result, used by pools that hold jobs of
/// different output types in one queue.
pub(crate) trait ResultSink: Send {
    fn deliver(&self, outcome: ErasedOutcome);
    fn fail(&self, error: TaskError);
    fn discard(&self);
}

impl<T: Send + Sync + 'static> ResultSink for TaskResult<T> {
    fn deliver(&self, outcome: ErasedOutcome) {
        let settled = match outcome.downcast::<T>() {
            Ok(outcome) => self.settle(Arc::new(outcome)),
            Err(_) => self.settle(Arc::new(Outcome::Failed(TaskError::IllegalState(format!(
                "{} produced an output of the wrong type",
                self.describe()
            ))))),
        };
        if let Err(error) = settled {
            warn!(task_id = ?self.id(), %error, "Dropping second delivery");
        }
    }

    fn fail(&self, error: TaskError) {
        if let Err(error) = self.set_error(error) {
            warn!(task_id = ?self.id(), %error, "Dropping second delivery");
        }
    }

    fn discard(&self) {
        TaskResult::discard(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    mock! {
        Owner {}

        impl Liveness for Owner {
            fn is_alive(&self) -> bool;
        }
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> impl FnOnce(Delivery<'_, i32>) + Send {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_second_delivery_is_refused() {
        let result = TaskResult::for_task("fetch-A".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        result.add_callback(counting_callback(&calls));

        result.set_value(1).unwrap();
        let second = result.set_error(TaskError::Interrupted);

        assert!(second.unwrap_err().is_contract_violation());
        assert!(result.set_value(2).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.get().unwrap(), 1);
    }

    #[test]
    fn test_late_callback_replays_cached_variant() {
        let result = TaskResult::new();
        result.set_cached(5).unwrap();

        let (tx, rx) = mpsc::channel();
        result.add_callback(move |delivery| {
            let _ = tx.send(matches!(delivery, Delivery::Cached(5)));
        });

        // Fired synchronously, before add_callback returned
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn test_late_callback_replays_failure() {
        let result: TaskResult<i32> = TaskResult::new();
        result.set_error(TaskError::Interrupted).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        result.add_callback(move |delivery| {
            if matches!(delivery.error(), Some(TaskError::Interrupted)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forward_before_and_after_completion() {
        let source = TaskResult::new();
        let early = TaskResult::new();
        source.forward(&early);
        assert!(!early.is_complete());

        source.set_value(9).unwrap();
        let late = TaskResult::new();
        source.forward(&late);

        assert_eq!(early.try_get().unwrap(), 9);
        assert_eq!(late.try_get().unwrap(), 9);
    }

    #[test]
    fn test_forward_onto_settled_target_keeps_first_value() {
        let source = TaskResult::new();
        let target = TaskResult::completed(1);
        source.forward(&target);
        source.set_value(2).unwrap();
        assert_eq!(target.get().unwrap(), 1);
    }

    #[test]
    fn test_discard_drops_callbacks_and_wakes_waiters() {
        let result: TaskResult<i32> = TaskResult::for_task("veto".to_string());
        let calls = Arc::new(AtomicUsize::new(0));
        result.add_callback(counting_callback(&calls));
        let forwarded = TaskResult::new();
        result.forward(&forwarded);

        let waiter = {
            let result = result.clone();
            std::thread::spawn(move || result.get())
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(result.discard());

        assert!(matches!(waiter.join().unwrap(), Err(TaskError::Discarded { id }) if id == "veto"));
        assert!(result.is_discarded());
        assert!(!result.is_complete());
        assert!(forwarded.is_discarded());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(result.set_value(1).is_err());
    }

    #[test]
    fn test_released_owner_receives_owner_released() {
        let mut owner = MockOwner::new();
        owner.expect_is_alive().times(1).return_const(false);

        let result = TaskResult::new();
        let (tx, rx) = mpsc::channel();
        result.add_callback_with_handle(
            move |delivery| {
                let _ = tx.send(match delivery {
                    Delivery::OwnerReleased(outcome) => outcome.value().copied(),
                    _ => None,
                });
            },
            owner,
        );
        result.set_value(3).unwrap();

        assert_eq!(rx.recv().unwrap(), Some(3));
    }

    #[test]
    fn test_live_owner_receives_fresh_value() {
        let mut owner = MockOwner::new();
        owner.expect_is_alive().return_const(true);

        let result = TaskResult::completed(4);
        let (tx, rx) = mpsc::channel();
        result.add_callback_with_handle(
            move |delivery| {
                let _ = tx.send(matches!(delivery, Delivery::Fresh(4)));
            },
            owner,
        );
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn test_get_timeout_expires() {
        let result: TaskResult<i32> = TaskResult::new();
        let started = std::time::Instant::now();
        let error = result.get_timeout(Duration::from_millis(30)).unwrap_err();
        assert!(error.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_try_get_not_ready() {
        let result: TaskResult<i32> = TaskResult::new();
        assert!(matches!(result.try_get(), Err(TaskError::NotReady)));
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let result = TaskResult::new();
        let calls = Arc::new(AtomicUsize::new(0));
        result.add_callback(|_| panic!("callback bug"));
        result.add_callback(counting_callback(&calls));
        result.set_value(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_completes_from_another_thread() {
        let result = TaskResult::new();
        let writer = result.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            writer.set_value(String::from("done")).unwrap();
        });
        assert_eq!(result.wait().await.unwrap(), "done");
    }

    #[test]
    fn test_erased_delivery_with_wrong_type_fails() {
        let result: TaskResult<i32> = TaskResult::for_task("typed".to_string());
        let sink: Box<dyn ResultSink> = Box::new(result.clone());
        sink.deliver(ErasedOutcome::new(Outcome::Value(String::from("oops"))));
        assert!(result.try_get().unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_panicking_link_does_not_stop_delivery() {
        let result = TaskResult::new();
        let calls = Arc::new(AtomicUsize::new(0));
        result.link(|_| panic!("link bug"));
        result.add_callback(counting_callback(&calls));

        result.set_value(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let discarded: TaskResult<i32> = TaskResult::new();
        discarded.link(|_| panic!("link bug"));
        assert!(discarded.discard());
        assert!(discarded.is_discarded());
    }
}
