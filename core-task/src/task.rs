//! The [`Task`] trait and the wrapper that runs task bodies.

use crate::error::{Result, TaskError};
use crate::result::Outcome;
use core_async::sync::blocking::{lock, Mutex};
use core_async::task::panic_message;
use core_async::time::{Deadline, Duration};
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

/// A unit of work with a stable identity.
///
/// Tasks sharing an [`id`](Task::id) are one logical unit of work: a pool
/// never runs two of them at the same time and runs queued ones in
/// submission order. A task instance runs at most once; pools take it by
/// value.
///
/// `run` reports its outcome through exactly one of
/// [`TaskContext::complete`], [`TaskContext::complete_from_cache`] or
/// [`TaskContext::fail`]. Returning `Err` is the same as calling `fail`.
///
/// ```rust
/// use core_task::{Task, TaskContext};
///
/// struct Fetch {
///     key: String,
/// }
///
/// impl Task for Fetch {
///     type Output = usize;
///
///     fn id(&self) -> String {
///         format!("fetch-{}", self.key)
///     }
///
///     fn run(&mut self, ctx: &mut TaskContext<'_, usize>) -> anyhow::Result<()> {
///         ctx.checkpoint()?;
///         ctx.complete(self.key.len())?;
///         Ok(())
///     }
/// }
/// ```
pub trait Task: Send + 'static {
    type Output: Send + Sync + 'static;

    /// Deduplication key. Must be deterministic for one logical request.
    fn id(&self) -> String;

    /// How the task appears in logs and events.
    fn log_key(&self) -> String {
        self.id()
    }

    fn run(&mut self, ctx: &mut TaskContext<'_, Self::Output>) -> anyhow::Result<()>;

    /// An interceptor replaced this task before it ran.
    fn on_intercepted(&mut self) {}

    /// An interceptor vetoed this task.
    fn on_discarded(&mut self) {}

    /// The outcome of this task reached its result.
    fn on_result_delivered(&mut self) {}
}

/// Cooperative interruption flag shared by a task, its result and its pool.
#[derive(Clone, Default)]
pub struct Interrupt {
    state: Arc<InterruptState>,
}

#[derive(Default)]
struct InterruptState {
    requested: AtomicBool,
    // Worker running the body, unparked on request
    thread: Mutex<Option<Thread>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.state.requested.store(true, Ordering::SeqCst);
        if let Some(thread) = lock(&self.state.thread).as_ref() {
            thread.unpark();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    fn bind_current_thread(&self) -> ThreadBinding<'_> {
        *lock(&self.state.thread) = Some(thread::current());
        ThreadBinding { interrupt: self }
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("requested", &self.is_requested())
            .finish()
    }
}

struct ThreadBinding<'a> {
    interrupt: &'a Interrupt,
}

impl Drop for ThreadBinding<'_> {
    fn drop(&mut self) {
        *lock(&self.interrupt.state.thread) = None;
    }
}

/// Completion hooks and interruption checks handed to [`Task::run`].
pub struct TaskContext<'a, T> {
    interrupt: &'a Interrupt,
    outcome: Option<Outcome<T>>,
    completions: usize,
}

impl<'a, T> TaskContext<'a, T> {
    fn new(interrupt: &'a Interrupt) -> Self {
        Self {
            interrupt,
            outcome: None,
            completions: 0,
        }
    }

    pub fn complete(&mut self, value: T) -> Result<()> {
        self.settle(Outcome::Value(value))
    }

    pub fn complete_from_cache(&mut self, value: T) -> Result<()> {
        self.settle(Outcome::Cached(value))
    }

    pub fn fail(&mut self, error: impl Into<anyhow::Error>) -> Result<()> {
        self.settle(Outcome::Failed(TaskError::from_anyhow(error.into())))
    }

    fn settle(&mut self, outcome: Outcome<T>) -> Result<()> {
        self.completions += 1;
        if self.completions > 1 {
            return Err(TaskError::IllegalState(
                "task reported its outcome more than once".to_string(),
            ));
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_requested()
    }

    /// `Err(TaskError::Interrupted)` once an interrupt was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(TaskError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, waking early with `Err(Interrupted)` when
    /// interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Deadline::after(duration);
        loop {
            self.checkpoint()?;
            match deadline.remaining() {
                Some(left) => thread::park_timeout(left),
                None => return Ok(()),
            }
        }
    }

    fn finish(self) -> Outcome<T> {
        match (self.completions, self.outcome) {
            (1, Some(outcome)) => outcome,
            (0, _) => Outcome::Failed(TaskError::IllegalState(
                "task returned without calling complete, complete_from_cache or fail".to_string(),
            )),
            _ => Outcome::Failed(TaskError::IllegalState(
                "task reported its outcome more than once".to_string(),
            )),
        }
    }

    fn finish_with_error(self, error: anyhow::Error) -> Outcome<T> {
        match self.completions {
            0 => Outcome::Failed(TaskError::from_anyhow(error)),
            1 => Outcome::Failed(TaskError::IllegalState(format!(
                "task returned an error after completing: {}",
                error
            ))),
            _ => self.finish(),
        }
    }
}

/// Runs `task` once on the current thread, converting errors and panics into
/// a failed outcome.
pub(crate) fn run_task<T: Task>(task: &mut T, interrupt: &Interrupt) -> Outcome<T::Output> {
    if interrupt.is_requested() {
        return Outcome::Failed(TaskError::Interrupted);
    }

    let _binding = interrupt.bind_current_thread();
    let mut ctx = TaskContext::new(interrupt);
    let returned = panic::catch_unwind(AssertUnwindSafe(|| task.run(&mut ctx)));

    match returned {
        Ok(Ok(())) => ctx.finish(),
        Ok(Err(error)) => ctx.finish_with_error(error),
        Err(payload) => Outcome::Failed(TaskError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// A task outcome with its output type erased.
#[doc(hidden)]
pub struct ErasedOutcome {
    payload: Box<dyn Any + Send>,
    succeeded: bool,
}

impl ErasedOutcome {
    pub(crate) fn new<T: Send + 'static>(outcome: Outcome<T>) -> Self {
        Self {
            succeeded: outcome.is_success(),
            payload: Box::new(outcome),
        }
    }

    pub(crate) fn downcast<T: 'static>(self) -> std::result::Result<Outcome<T>, Self> {
        let succeeded = self.succeeded;
        match self.payload.downcast::<Outcome<T>>() {
            Ok(outcome) => Ok(*outcome),
            Err(payload) => Err(Self { payload, succeeded }),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }
}

/// Object-safe view of a [`Task`], as seen by interceptors and pool queues.
///
/// Implemented for every `Task`.
pub trait DynTask: Send {
    fn task_id(&self) -> String;

    fn describe(&self) -> String;

    fn output_type(&self) -> TypeId;

    fn output_type_name(&self) -> &'static str;

    /// For interceptors that inspect concrete task types.
    fn as_any(&self) -> &dyn Any;

    #[doc(hidden)]
    fn run_erased(&mut self, interrupt: &Interrupt) -> ErasedOutcome;

    fn notify_intercepted(&mut self);

    fn notify_discarded(&mut self);

    fn notify_delivered(&mut self);
}

impl<T: Task> DynTask for T {
    fn task_id(&self) -> String {
        self.id()
    }

    fn describe(&self) -> String {
        self.log_key()
    }

    fn output_type(&self) -> TypeId {
        TypeId::of::<T::Output>()
    }

    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<T::Output>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn run_erased(&mut self, interrupt: &Interrupt) -> ErasedOutcome {
        ErasedOutcome::new(run_task(self, interrupt))
    }

    fn notify_intercepted(&mut self) {
        self.on_intercepted();
    }

    fn notify_discarded(&mut self) {
        self.on_discarded();
    }

    fn notify_delivered(&mut self) {
        self.on_result_delivered();
    }
}

pub type BoxedTask = Box<dyn DynTask>;

/// A task built from a closure and an explicit id.
///
/// ```rust
/// use core_task::FnTask;
///
/// let task = FnTask::new("answer", || Ok(42));
/// ```
pub struct FnTask<T, F> {
    id: String,
    body: Option<F>,
    _output: PhantomData<fn() -> T>,
}

impl<T, F> FnTask<T, F>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    pub fn new(id: impl Into<String>, body: F) -> Self {
        Self {
            id: id.into(),
            body: Some(body),
            _output: PhantomData,
        }
    }
}

impl<T, F> Task for FnTask<T, F>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    type Output = T;

    fn id(&self) -> String {
        self.id.clone()
    }

    fn run(&mut self, ctx: &mut TaskContext<'_, T>) -> anyhow::Result<()> {
        let body = self
            .body
            .take()
            .ok_or_else(|| TaskError::IllegalState(format!("task '{}' already ran", self.id)))?;
        ctx.complete(body()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        completions: usize,
        fail_after: bool,
    }

    impl Task for Scripted {
        type Output = u8;

        fn id(&self) -> String {
            "scripted".to_string()
        }

        fn run(&mut self, ctx: &mut TaskContext<'_, u8>) -> anyhow::Result<()> {
            for _ in 0..self.completions {
                // Ignoring the second hook's error still counts as two
                let _ = ctx.complete(1);
            }
            if self.fail_after {
                anyhow::bail!("late failure");
            }
            Ok(())
        }
    }

    fn run_scripted(completions: usize, fail_after: bool) -> Outcome<u8> {
        let mut task = Scripted {
            completions,
            fail_after,
        };
        run_task(&mut task, &Interrupt::new())
    }

    #[test]
    fn test_exactly_one_completion() {
        assert!(matches!(run_scripted(1, false), Outcome::Value(1)));
    }

    #[test]
    fn test_neither_completion_is_illegal() {
        let outcome = run_scripted(0, false);
        assert!(outcome.error().unwrap().is_contract_violation());
    }

    #[test]
    fn test_both_completions_are_illegal() {
        let outcome = run_scripted(2, false);
        assert!(outcome.error().unwrap().is_contract_violation());
    }

    #[test]
    fn test_error_after_completion_is_illegal() {
        let outcome = run_scripted(1, true);
        assert!(outcome.error().unwrap().is_contract_violation());
    }

    #[test]
    fn test_body_error_becomes_execution_failure() {
        let outcome = run_scripted(0, true);
        assert!(matches!(outcome.error(), Some(TaskError::Execution(_))));
    }

    #[test]
    fn test_panic_is_captured() {
        let mut task = FnTask::new("boom", || -> anyhow::Result<u8> { panic!("kaboom") });
        let outcome = run_task(&mut task, &Interrupt::new());
        assert!(matches!(outcome.error(), Some(TaskError::Panicked(message)) if message == "kaboom"));
    }

    #[test]
    fn test_interrupt_before_start_skips_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut task = FnTask::new("skipped", move || {
            flag.store(true, Ordering::SeqCst);
            Ok(0_u8)
        });

        let interrupt = Interrupt::new();
        interrupt.request();
        let outcome = run_task(&mut task, &interrupt);

        assert!(matches!(outcome.error(), Some(TaskError::Interrupted)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sleep_wakes_on_interrupt() {
        struct Sleeper;

        impl Task for Sleeper {
            type Output = ();

            fn id(&self) -> String {
                "sleeper".to_string()
            }

            fn run(&mut self, ctx: &mut TaskContext<'_, ()>) -> anyhow::Result<()> {
                ctx.sleep(Duration::from_secs(10))?;
                ctx.complete(())?;
                Ok(())
            }
        }

        let interrupt = Interrupt::new();
        let remote = interrupt.clone();
        let worker = thread::spawn(move || run_task(&mut Sleeper, &interrupt));

        thread::sleep(Duration::from_millis(20));
        let started = std::time::Instant::now();
        remote.request();
        let outcome = worker.join().unwrap();

        assert!(matches!(outcome.error(), Some(TaskError::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_dyn_task_reports_types() {
        let task: BoxedTask = Box::new(FnTask::new("typed", || Ok(String::new())));
        assert_eq!(task.task_id(), "typed");
        assert_eq!(task.output_type(), TypeId::of::<String>());
        assert!(task.output_type_name().contains("String"));
    }

    #[test]
    fn test_fn_task_runs_once() {
        let mut task = FnTask::new("once", || Ok(3_u32));
        let interrupt = Interrupt::new();
        assert!(matches!(run_task(&mut task, &interrupt), Outcome::Value(3)));
        assert!(run_task(&mut task, &interrupt)
            .error()
            .unwrap()
            .is_contract_violation());
    }
}
