//! # Task Pool
//!
//! A bounded executor that runs at most one task per id at a time.
//!
//! ## Overview
//!
//! Every pool owns:
//! - a worker runtime whose blocking pool (capped at `max_threads`) runs task
//!   bodies,
//! - a dispatch thread (`<name>-dispatch`) that admits submissions, queues
//!   tasks whose id is busy and delivers results,
//! - an id registry: the running id set plus a FIFO of waiting jobs per id.
//!
//! ```text
//!  execute ──> dispatch thread ──> id busy? ──yes──> pending[id] (FIFO)
//!                    ^                 │no
//!                    │                 v
//!               Complete(job) <── worker: interceptors ─> body
//!                    │                 │
//!                    v                 └─> next pending[id] ──> dispatch thread
//!              deliver result
//! ```
//!
//! When a task finishes, the next job waiting on its id inherits the id
//! reservation, so a newer submission can never overtake it.
//!
//! ## Usage
//!
//! ```rust
//! use core_task::{FnTask, TaskPool};
//!
//! let pool = TaskPool::builder("images").max_threads(4).build().unwrap();
//! let result = pool.execute(FnTask::new("thumb-1", || Ok(128_u32)));
//! assert_eq!(result.get().unwrap(), 128);
//! pool.shutdown();
//! ```

use crate::error::{Result, TaskError};
use crate::interceptor::{Interception, TaskInterceptor};
use crate::registry::RegistryInner;
use crate::result::{ResultSink, TaskResult};
use crate::task::{run_task, BoxedTask, ErasedOutcome, FnTask, Interrupt, Task};
use core_async::runtime::{worker_runtime, Handle, Runtime};
use core_async::sync::blocking::{lock, Mutex};
use core_async::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};
use core_async::task::panic_message;
use core_async::time::{elapsed_millis, Instant};
use core_runtime::config::PoolConfig;
use core_runtime::events::{CoreEvent, EventBus, PoolEvent, TaskEvent};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const TERMINATED: u8 = 2;

const REASON_SHUT_DOWN: &str = "pool is shut down";
const REASON_DRAINING: &str = "pool is shutting down";
const REASON_SATURATED: &str = "pool is saturated";

/// A named, bounded, id-deduplicating executor.
///
/// Cheap to clone; clones drive the same pool.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    name: String,
    max_threads: usize,
    // Jobs the executor may hold, running or waiting for a thread
    capacity: usize,
    interceptors: Vec<Arc<dyn TaskInterceptor>>,
    ids: Mutex<IdRegistry>,
    runtime: Mutex<Option<Runtime>>,
    executor: Handle,
    dispatch_tx: UnboundedSender<Dispatch>,
    dispatcher: OnceLock<ThreadId>,
    in_flight: AtomicUsize,
    // Submitted through `execute` and not yet delivered or rejected
    outstanding: AtomicUsize,
    state: AtomicU8,
    events: Option<EventBus>,
    registry: Option<Weak<RegistryInner>>,
}

#[derive(Default)]
struct IdRegistry {
    running: HashMap<String, RunningTask>,
    pending: HashMap<String, VecDeque<Job>>,
}

struct RunningTask {
    log_key: String,
    interrupt: Interrupt,
    started_at: Instant,
}

/// A task occupying an id, as reported by [`TaskPool::running_tasks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTaskInfo {
    pub id: String,
    /// Log key of the task, or of its substitute once intercepted
    pub log_key: String,
    pub running_for: std::time::Duration,
}

enum Dispatch {
    Queue(Job),
    Complete(Finished),
    Shutdown,
}

struct Job {
    pool: String,
    events: Option<EventBus>,
    id: String,
    task: Option<BoxedTask>,
    sink: Option<Box<dyn ResultSink>>,
    interrupt: Interrupt,
    submitted_at: Instant,
    // Owns the id's running slot
    holds_id: bool,
}

impl Job {
    fn new<T: Task>(pool: &PoolInner, task: T, result: &TaskResult<T::Output>) -> Self {
        Self {
            pool: pool.name.clone(),
            events: pool.events.clone(),
            id: task.id(),
            task: Some(Box::new(task)),
            sink: Some(Box::new(result.clone())),
            interrupt: result.interrupt_flag().clone(),
            submitted_at: Instant::now(),
            holds_id: false,
        }
    }

    fn log_key(&self) -> String {
        self.task
            .as_ref()
            .map_or_else(|| self.id.clone(), |task| task.describe())
    }

    fn fail(&mut self, error: TaskError) {
        if let Some(sink) = self.sink.take() {
            sink.fail(error);
        }
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        // Dropped unsettled when the executor goes away underneath it
        if self.sink.is_none() {
            return;
        }

        warn!(pool = %self.pool, task_id = %self.id, reason = REASON_SHUT_DOWN, "Task rejected");
        if let Some(bus) = &self.events {
            let _ = bus.emit(CoreEvent::Task(TaskEvent::Rejected {
                pool: self.pool.clone(),
                task_id: self.id.clone(),
                reason: REASON_SHUT_DOWN.to_string(),
            }));
        }
        let error = TaskError::Rejected {
            pool: self.pool.clone(),
            reason: REASON_SHUT_DOWN.to_string(),
        };
        self.fail(error);
    }
}

enum Completion {
    Ran(BoxedTask, ErasedOutcome),
    Discarded(BoxedTask),
    Failed(Option<BoxedTask>, TaskError),
}

impl Completion {
    fn succeeded(&self) -> bool {
        match self {
            Completion::Ran(_, outcome) => outcome.succeeded(),
            Completion::Discarded(_) | Completion::Failed(..) => false,
        }
    }
}

struct Finished {
    sink: Option<Box<dyn ResultSink>>,
    completion: Completion,
}

impl Finished {
    fn deliver(self) {
        let Finished { sink, completion } = self;
        let Some(sink) = sink else {
            return;
        };
        match completion {
            Completion::Ran(mut task, outcome) => {
                sink.deliver(outcome);
                task.notify_delivered();
            }
            Completion::Discarded(_) => sink.discard(),
            Completion::Failed(task, error) => {
                sink.fail(error);
                if let Some(mut task) = task {
                    task.notify_delivered();
                }
            }
        }
    }
}

impl TaskPool {
    pub fn builder(name: impl Into<String>) -> TaskPoolBuilder {
        TaskPoolBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_threads(&self) -> usize {
        self.inner.max_threads
    }

    /// Schedules `task` and returns its result immediately.
    ///
    /// Never blocks. Rejection (saturated or shut down pool) is delivered
    /// through the result as [`TaskError::Rejected`].
    pub fn execute<T: Task>(&self, task: T) -> TaskResult<T::Output> {
        let result = TaskResult::for_task(task.id());
        let job = Job::new(&self.inner, task, &result);

        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.inner.state() == RUNNING {
            self.inner.dispatch(job);
        } else {
            self.inner.reject(job, REASON_SHUT_DOWN);
        }
        result
    }

    /// Schedules a closure as a task with the given id.
    pub fn execute_fn<T, F>(&self, id: impl Into<String>, body: F) -> TaskResult<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.execute(FnTask::new(id, body))
    }

    /// Runs `task` on the calling thread and returns its value.
    ///
    /// Bypasses the worker threads, the id registry and the interceptors.
    ///
    /// # Errors
    ///
    /// [`TaskError::IllegalState`] when called on this pool's dispatch
    /// thread, otherwise the task's own failure.
    pub fn execute_now<T: Task>(&self, mut task: T) -> Result<T::Output> {
        self.inner.ensure_off_dispatch_thread()?;
        let outcome = run_task(&mut task, &Interrupt::new());
        task.on_result_delivered();
        outcome.into_result()
    }

    /// Like [`execute_now`](Self::execute_now), but hands back a completed
    /// result instead of the bare value.
    pub fn execute_now_result<T: Task>(&self, mut task: T) -> Result<TaskResult<T::Output>> {
        self.inner.ensure_off_dispatch_thread()?;
        let result = TaskResult::for_task(task.id());
        let outcome = run_task(&mut task, result.interrupt_flag());
        result.settle(Arc::new(outcome))?;
        task.on_result_delivered();
        Ok(result)
    }

    /// Interrupts the running task with this id. Returns `false` if none runs.
    pub fn interrupt(&self, id: &str) -> bool {
        let interrupt = lock(&self.inner.ids)
            .running
            .get(id)
            .map(|running| running.interrupt.clone());
        match interrupt {
            Some(interrupt) => {
                debug!(pool = %self.inner.name, task_id = %id, "Interrupting task");
                interrupt.request();
                true
            }
            None => false,
        }
    }

    /// Ids currently running or reserved for their next queued task, sorted.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.ids).running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn running_count(&self) -> usize {
        lock(&self.inner.ids).running.len()
    }

    /// Jobs waiting behind a running task with the same id.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.ids).pending.values().map(VecDeque::len).sum()
    }

    pub fn is_running(&self, id: &str) -> bool {
        lock(&self.inner.ids).running.contains_key(id)
    }

    /// Snapshot of the running tasks, sorted by id.
    pub fn running_tasks(&self) -> Vec<RunningTaskInfo> {
        let mut tasks: Vec<RunningTaskInfo> = lock(&self.inner.ids)
            .running
            .iter()
            .map(|(id, running)| RunningTaskInfo {
                id: id.clone(),
                log_key: running.log_key.clone(),
                running_for: running.started_at.elapsed(),
            })
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state() != RUNNING
    }

    /// Stops accepting work. Already admitted jobs, including those queued
    /// behind a busy id, still run and deliver; then the threads stop.
    pub fn shutdown(&self) {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!(pool = %self.inner.name, "Shutting down task pool");
        self.inner.deregister();
        self.inner.emit_pool(|pool| PoolEvent::Shutdown {
            pool,
            immediate: false,
        });

        if self.inner.dispatch_tx.send(Dispatch::Shutdown).is_err() {
            self.inner.terminate();
        }
    }

    /// Stops immediately: running tasks are interrupted and queued jobs are
    /// rejected.
    pub fn shutdown_now(&self) {
        if self.inner.state.swap(TERMINATED, Ordering::SeqCst) == TERMINATED {
            return;
        }

        info!(pool = %self.inner.name, "Shutting down task pool now");
        let (interrupts, queued): (Vec<Interrupt>, Vec<Job>) = {
            let mut ids = lock(&self.inner.ids);
            let interrupts = ids
                .running
                .values()
                .map(|running| running.interrupt.clone())
                .collect();
            let queued = ids.pending.drain().flat_map(|(_, jobs)| jobs).collect();
            (interrupts, queued)
        };

        for interrupt in interrupts {
            interrupt.request();
        }
        for job in queued {
            self.inner.reject(job, REASON_SHUT_DOWN);
        }

        // Wakes the dispatch thread so it notices the new state
        let _ = self.inner.dispatch_tx.send(Dispatch::Shutdown);
        self.inner.terminate();
        self.inner.deregister();
        self.inner.emit_pool(|pool| PoolEvent::Shutdown {
            pool,
            immediate: true,
        });
    }

    /// Whether both handles drive the same pool.
    pub fn is_same_pool(&self, other: &TaskPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn is_same(&self, inner: &PoolInner) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), inner)
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.inner.name)
            .field("max_threads", &self.inner.max_threads)
            .field("running", &self.running_count())
            .field("pending", &self.pending_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl PoolInner {
    fn state(&self) -> u8 {
        self.state.load(Ordering::SeqCst)
    }

    fn on_dispatch_thread(&self) -> bool {
        self.dispatcher.get() == Some(&thread::current().id())
    }

    fn ensure_off_dispatch_thread(&self) -> Result<()> {
        if self.on_dispatch_thread() {
            return Err(TaskError::IllegalState(format!(
                "execute_now called on the dispatch thread of pool '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Hands a job to the dispatch thread. Submissions made on the dispatch
    /// thread itself are queued behind the current message.
    fn dispatch(self: &Arc<Self>, job: Job) {
        if let Err(SendError(Dispatch::Queue(job))) = self.dispatch_tx.send(Dispatch::Queue(job)) {
            self.reject(job, REASON_SHUT_DOWN);
        }
    }

    /// Admission, on the dispatch thread.
    fn submit(self: &Arc<Self>, mut job: Job) {
        match self.state() {
            TERMINATED => return self.reject(job, REASON_SHUT_DOWN),
            DRAINING if !job.holds_id => return self.reject(job, REASON_DRAINING),
            _ => {}
        }

        let mut ids = lock(&self.ids);
        if !job.holds_id && ids.running.contains_key(&job.id) {
            let id = job.id.clone();
            ids.pending.entry(id.clone()).or_default().push_back(job);
            let depth = ids.pending.get(&id).map_or(0, VecDeque::len);
            drop(ids);

            debug!(pool = %self.name, task_id = %id, depth, "Task queued behind running task");
            self.emit_task(|pool| TaskEvent::Queued { pool, task_id: id });
            return;
        }

        ids.running.insert(
            job.id.clone(),
            RunningTask {
                log_key: job.log_key(),
                interrupt: job.interrupt.clone(),
                started_at: Instant::now(),
            },
        );
        drop(ids);
        job.holds_id = true;

        if self.in_flight.load(Ordering::SeqCst) >= self.capacity {
            return self.reject(job, REASON_SATURATED);
        }

        // Only the dispatch thread increments, so check-then-add is exact
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::clone(self);
        self.executor.spawn_blocking(move || pool.run_job(job));
    }

    /// Runs on a worker thread.
    fn run_job(self: Arc<Self>, mut job: Job) {
        let started = Instant::now();
        let waited_ms = elapsed_millis(job.submitted_at);
        debug!(pool = %self.name, task_id = %job.id, waited_ms, "Running task");
        self.emit_task(|pool| TaskEvent::Started {
            pool,
            task_id: job.id.clone(),
        });

        let completion = match job.task.take() {
            Some(task) => self.intercept_and_run(&job, task),
            None => Completion::Failed(
                None,
                TaskError::IllegalState(format!("job for task '{}' has no task", job.id)),
            ),
        };

        let elapsed_ms = elapsed_millis(started);
        let succeeded = completion.succeeded();
        if !matches!(completion, Completion::Discarded(_)) {
            debug!(pool = %self.name, task_id = %job.id, elapsed_ms, succeeded, "Task finished");
            self.emit_task(|pool| TaskEvent::Finished {
                pool,
                task_id: job.id.clone(),
                elapsed_ms,
                succeeded,
            });
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        job.holds_id = false;
        let next = self.release_id(&job.id);

        // Queued ahead of the successor, so results for one id arrive in order
        let finished = Finished {
            sink: job.sink.take(),
            completion,
        };
        if let Err(SendError(Dispatch::Complete(finished))) =
            self.dispatch_tx.send(Dispatch::Complete(finished))
        {
            self.finalize(finished);
        }

        if let Some(next) = next {
            self.dispatch(next);
        }
    }

    fn intercept_and_run(&self, job: &Job, task: BoxedTask) -> Completion {
        let mut current = task;

        for interceptor in &self.interceptors {
            let decision =
                panic::catch_unwind(AssertUnwindSafe(|| interceptor.intercept(current.as_ref())));

            match decision {
                Ok(Interception::Proceed) => {}
                Ok(Interception::Substitute(replacement)) => {
                    if let Err(error) = check_substitute(current.as_ref(), replacement.as_ref()) {
                        warn!(pool = %self.name, task_id = %job.id, %error, "Rejected substitute task");
                        return Completion::Failed(Some(current), error);
                    }

                    let original = current.describe();
                    let replacement_key = replacement.describe();
                    current.notify_intercepted();
                    if let Some(running) = lock(&self.ids).running.get_mut(&job.id) {
                        running.log_key = replacement_key.clone();
                    }

                    debug!(
                        pool = %self.name,
                        task_id = %job.id,
                        original = %original,
                        replacement = %replacement_key,
                        "Task intercepted"
                    );
                    self.emit_task(|pool| TaskEvent::Intercepted {
                        pool,
                        task_id: job.id.clone(),
                        original,
                        replacement: replacement_key,
                    });
                    current = replacement;
                }
                Ok(Interception::Discard) => {
                    current.notify_discarded();
                    debug!(pool = %self.name, task_id = %job.id, "Task discarded");
                    self.emit_task(|pool| TaskEvent::Discarded {
                        pool,
                        task_id: job.id.clone(),
                    });
                    return Completion::Discarded(current);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(pool = %self.name, task_id = %job.id, panic = %message, "Interceptor panicked");
                    return Completion::Failed(
                        Some(current),
                        TaskError::Panicked(format!("interceptor panicked: {}", message)),
                    );
                }
            }
        }

        let outcome = current.run_erased(&job.interrupt);
        Completion::Ran(current, outcome)
    }

    /// Frees `id`, or hands its slot to the next job waiting on it.
    fn release_id(&self, id: &str) -> Option<Job> {
        let mut ids = lock(&self.ids);
        let next = match ids.pending.get_mut(id) {
            Some(queue) => {
                let next = queue.pop_front();
                if queue.is_empty() {
                    ids.pending.remove(id);
                }
                next
            }
            None => None,
        };

        match next {
            Some(mut job) => {
                // The slot belongs to the next job from here on, even before
                // the dispatch thread admits it
                ids.running.insert(
                    id.to_string(),
                    RunningTask {
                        log_key: job.log_key(),
                        interrupt: job.interrupt.clone(),
                        started_at: Instant::now(),
                    },
                );
                job.holds_id = true;
                Some(job)
            }
            None => {
                ids.running.remove(id);
                None
            }
        }
    }

    fn reject(self: &Arc<Self>, mut job: Job, reason: &str) {
        warn!(pool = %self.name, task_id = %job.id, reason, "Task rejected");
        self.emit_task(|pool| TaskEvent::Rejected {
            pool,
            task_id: job.id.clone(),
            reason: reason.to_string(),
        });

        let next = if job.holds_id {
            job.holds_id = false;
            self.release_id(&job.id)
        } else {
            None
        };

        job.fail(TaskError::Rejected {
            pool: self.name.clone(),
            reason: reason.to_string(),
        });
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        if let Some(next) = next {
            self.dispatch(next);
        }
    }

    fn finalize(&self, finished: Finished) {
        finished.deliver();
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    fn drained(&self) -> bool {
        self.state() == DRAINING && self.outstanding.load(Ordering::SeqCst) == 0
    }

    fn terminate(&self) {
        self.state.store(TERMINATED, Ordering::SeqCst);
        if let Some(runtime) = lock(&self.runtime).take() {
            // Never blocks, so safe from worker threads too
            runtime.shutdown_background();
            debug!(pool = %self.name, "Worker runtime stopped");
        }
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.deregister(&self.name, self);
        }
    }

    fn emit_task(&self, event: impl FnOnce(String) -> TaskEvent) {
        if let Some(bus) = &self.events {
            let _ = bus.emit(CoreEvent::Task(event(self.name.clone())));
        }
    }

    fn emit_pool(&self, event: impl FnOnce(String) -> PoolEvent) {
        if let Some(bus) = &self.events {
            let _ = bus.emit(CoreEvent::Pool(event(self.name.clone())));
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
    }
}

fn check_substitute(current: &dyn crate::task::DynTask, replacement: &dyn crate::task::DynTask) -> Result<()> {
    let (current_id, replacement_id) = (current.task_id(), replacement.task_id());
    if current_id != replacement_id {
        return Err(TaskError::IllegalState(format!(
            "interceptor replaced task '{}' with task '{}'; substitutes must keep the id",
            current_id, replacement_id
        )));
    }
    if current.output_type() != replacement.output_type() {
        return Err(TaskError::IllegalState(format!(
            "interceptor replaced task '{}' producing {} with one producing {}",
            current_id,
            current.output_type_name(),
            replacement.output_type_name()
        )));
    }
    Ok(())
}

/// The dispatch thread's loop. Holds the pool weakly so dropping every
/// handle stops it.
fn dispatch_loop(pool: Weak<PoolInner>, mut rx: UnboundedReceiver<Dispatch>) {
    while let Some(message) = rx.blocking_recv() {
        let Some(inner) = pool.upgrade() else {
            if let Dispatch::Complete(finished) = message {
                finished.deliver();
            }
            continue;
        };

        match message {
            Dispatch::Queue(job) => inner.submit(job),
            Dispatch::Complete(finished) => inner.finalize(finished),
            Dispatch::Shutdown => {}
        }

        if inner.drained() {
            inner.terminate();
        }
        if inner.state() == TERMINATED {
            debug!(pool = %inner.name, "Dispatch thread exiting");
            break;
        }
    }

    // Late completions still reach their results; late submissions are
    // rejected as they drop.
    rx.close();
    while let Ok(message) = rx.try_recv() {
        if let Dispatch::Complete(finished) = message {
            finished.deliver();
        }
    }
}

/// Builder for [`TaskPool`].
pub struct TaskPoolBuilder {
    config: PoolConfig,
    interceptors: Vec<Arc<dyn TaskInterceptor>>,
    events: Option<EventBus>,
    registry: Option<Arc<RegistryInner>>,
}

impl TaskPoolBuilder {
    fn new(name: String) -> Self {
        Self {
            config: PoolConfig::new(name),
            interceptors: Vec::new(),
            events: None,
            registry: None,
        }
    }

    /// Maximum number of task bodies running at once.
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.config.max_threads = max_threads;
        self
    }

    /// Jobs that may wait for a free thread before submissions are rejected.
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.config.queue_capacity = queue_capacity;
        self
    }

    /// Takes sizing from `config`. The pool keeps the builder's name.
    pub fn config(mut self, config: &PoolConfig) -> Self {
        self.config.max_threads = config.max_threads;
        self.config.queue_capacity = config.queue_capacity;
        self
    }

    /// Appends an interceptor. Interceptors run in the order added.
    pub fn interceptor(self, interceptor: impl TaskInterceptor + 'static) -> Self {
        self.shared_interceptor(Arc::new(interceptor))
    }

    pub fn shared_interceptor(mut self, interceptor: Arc<dyn TaskInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Publishes task and pool lifecycle events on `events`.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn registry(mut self, registry: Arc<RegistryInner>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Starts the pool's threads and, for registry-built pools, registers it.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Config`] for an invalid configuration or when the OS
    ///   refuses to start threads
    /// - [`TaskError::DuplicatePool`] when the registry already holds a pool
    ///   with this name
    pub fn build(self) -> Result<TaskPool> {
        let TaskPoolBuilder {
            config,
            interceptors,
            events,
            registry,
        } = self;
        config.validate()?;

        if let Some(registry) = &registry {
            if registry.contains(&config.name) {
                return Err(TaskError::DuplicatePool(config.name));
            }
        }

        let runtime = worker_runtime(&config.name, config.max_threads).map_err(|e| {
            TaskError::Config(format!(
                "failed to start worker runtime for pool '{}': {}",
                config.name, e
            ))
        })?;
        let executor = runtime.handle().clone();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(PoolInner {
            name: config.name.clone(),
            max_threads: config.max_threads,
            capacity: config.capacity(),
            interceptors,
            ids: Mutex::new(IdRegistry::default()),
            runtime: Mutex::new(Some(runtime)),
            executor,
            dispatch_tx,
            dispatcher: OnceLock::new(),
            in_flight: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            state: AtomicU8::new(RUNNING),
            events,
            registry: registry.as_ref().map(Arc::downgrade),
        });

        let weak = Arc::downgrade(&inner);
        let dispatcher = thread::Builder::new()
            .name(config.dispatch_thread_name())
            .spawn(move || dispatch_loop(weak, dispatch_rx))
            .map_err(|e| {
                TaskError::Config(format!(
                    "failed to start dispatch thread for pool '{}': {}",
                    config.name, e
                ))
            })?;
        let _ = inner.dispatcher.set(dispatcher.thread().id());

        let pool = TaskPool { inner };
        if let Some(registry) = &registry {
            if let Err(error) = registry.register(pool.clone()) {
                pool.inner.terminate();
                return Err(error);
            }
        }

        info!(
            pool = %config.name,
            max_threads = config.max_threads,
            queue_capacity = config.queue_capacity,
            "Task pool started"
        );
        pool.inner.emit_pool(|pool| PoolEvent::Created {
            pool,
            max_threads: config.max_threads,
        });
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct Gate {
        id: String,
        open: std_mpsc::Receiver<()>,
    }

    impl Task for Gate {
        type Output = &'static str;

        fn id(&self) -> String {
            self.id.clone()
        }

        fn run(&mut self, ctx: &mut TaskContext<'_, &'static str>) -> anyhow::Result<()> {
            self.open.recv_timeout(Duration::from_secs(5))?;
            ctx.complete("opened")?;
            Ok(())
        }
    }

    fn gate(id: &str) -> (Gate, std_mpsc::Sender<()>) {
        let (tx, rx) = std_mpsc::channel();
        (
            Gate {
                id: id.to_string(),
                open: rx,
            },
            tx,
        )
    }

    #[test]
    fn test_queued_job_keeps_id_reserved() {
        let pool = TaskPool::builder("reserve").max_threads(2).build().unwrap();
        let (first, open_first) = gate("same");
        let (second, open_second) = gate("same");

        let first = pool.execute(first);
        let second = pool.execute(second);

        // Wait until the second job is parked behind the first
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.pending_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pool.pending_count(), 1);
        assert_eq!(pool.running_ids(), vec!["same".to_string()]);

        open_first.send(()).unwrap();
        assert_eq!(first.get().unwrap(), "opened");

        // The slot passed straight to the queued job
        assert!(pool.is_running("same"));
        open_second.send(()).unwrap();
        assert_eq!(second.get().unwrap(), "opened");
        pool.shutdown();
    }

    #[test]
    fn test_substitute_with_other_id_is_illegal() {
        let pool = TaskPool::builder("mismatch")
            .interceptor(crate::interceptor::interceptor_fn(|_| {
                Interception::substitute(FnTask::new("other", || Ok(1_u8)))
            }))
            .build()
            .unwrap();

        let result = pool.execute_fn("mine", || Ok(0_u8));
        let error = result.get_timeout(Duration::from_secs(2)).unwrap_err();
        assert!(error.is_contract_violation());
        pool.shutdown();
    }

    #[test]
    fn test_substitute_with_other_type_is_illegal() {
        let pool = TaskPool::builder("mistyped")
            .interceptor(crate::interceptor::interceptor_fn(|task| {
                Interception::substitute(FnTask::new(task.task_id(), || Ok("text")))
            }))
            .build()
            .unwrap();

        let result = pool.execute_fn("mine", || Ok(0_u8));
        let error = result.get_timeout(Duration::from_secs(2)).unwrap_err();
        assert!(error.is_contract_violation());
        pool.shutdown();
    }

    #[test]
    fn test_panicking_interceptor_fails_the_task() {
        let pool = TaskPool::builder("bad-hook")
            .interceptor(crate::interceptor::interceptor_fn(|_| panic!("hook bug")))
            .build()
            .unwrap();

        let result = pool.execute_fn("a", || Ok(1_u8));
        assert!(matches!(
            result.get_timeout(Duration::from_secs(2)),
            Err(TaskError::Panicked(_))
        ));

        // The pool keeps working after the failure
        assert!(!pool.is_running("a"));
        pool.shutdown();
    }

    #[test]
    fn test_execute_now_runs_inline() {
        let pool = TaskPool::builder("inline").build().unwrap();
        let caller = thread::current().id();
        let ran_on = pool
            .execute_now(FnTask::new("where", move || Ok(thread::current().id())))
            .unwrap();
        assert_eq!(ran_on, caller);

        let result = pool
            .execute_now_result(FnTask::new("result", || Ok(5)))
            .unwrap();
        assert_eq!(result.try_get().unwrap(), 5);
        assert_eq!(result.id(), Some("result"));
        pool.shutdown();
    }

    #[test]
    fn test_graceful_shutdown_stops_dispatch_thread() {
        let pool = TaskPool::builder("drain").build().unwrap();
        let result = pool.execute_fn("slow", || {
            thread::sleep(Duration::from_millis(30));
            Ok(1)
        });
        pool.shutdown();

        // Admitted work still completes
        assert_eq!(result.get_timeout(Duration::from_secs(2)).unwrap(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.inner.state() != TERMINATED && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pool.inner.state(), TERMINATED);
    }

    #[test]
    fn test_dropped_job_is_rejected_with_event() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let pool = TaskPool::builder("orphans").events(bus).build().unwrap();

        let result = TaskResult::for_task("orphan".to_string());
        let job = Job::new(&pool.inner, FnTask::new("orphan", || Ok(1)), &result);
        drop(job);

        assert!(result.try_get().unwrap_err().is_rejected());
        let mut rejected = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Task(TaskEvent::Rejected { task_id, reason, .. }) = event {
                rejected.push((task_id, reason));
            }
        }
        assert_eq!(
            rejected,
            vec![("orphan".to_string(), REASON_SHUT_DOWN.to_string())]
        );
        pool.shutdown();
    }

    #[test]
    fn test_handoff_moves_running_entry_to_next_job() {
        let pool = TaskPool::builder("handoff").max_threads(2).build().unwrap();
        let (first, open_first) = gate("slot");
        let (second, _open_second) = gate("slot");

        let first = pool.execute(first);
        let second = pool.execute(second);
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.pending_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        // Release the slot by hand, as the worker does when the first task ends
        let next = pool.inner.release_id("slot").unwrap();
        assert!(pool.interrupt("slot"));
        assert!(next.interrupt.is_requested());
        assert!(second.interrupt_flag().is_requested());
        assert!(!first.interrupt_flag().is_requested());

        drop(next);
        assert!(second.try_get().unwrap_err().is_rejected());
        open_first.send(()).unwrap();
        assert_eq!(first.get().unwrap(), "opened");
        pool.shutdown_now();
    }
}
