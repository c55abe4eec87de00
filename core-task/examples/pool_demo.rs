//! Walks through deduplication, interception and caching on a small pool.
//!
//! Run with `cargo run -p core-task --example pool_demo`, optionally with
//! `RUST_LOG=core_task=debug` to watch the dispatch thread.

use core_runtime::events::{EventBus, EventStream};
use core_runtime::logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
use core_task::{
    interceptor_fn, CacheInterceptor, DynTask, Interception, PoolRegistry, Task, TaskContext,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

struct Fetch {
    key: &'static str,
    version: u32,
}

impl Task for Fetch {
    type Output = String;

    fn id(&self) -> String {
        format!("fetch-{}", self.key)
    }

    fn log_key(&self) -> String {
        format!("fetch-{}#v{}", self.key, self.version)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_, String>) -> anyhow::Result<()> {
        ctx.sleep(Duration::from_millis(100))?;
        ctx.complete(format!("{} v{}", self.key, self.version))?;
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    init_logging(
        LoggingConfig::default()
            .with_format(LogFormat::Compact)
            .with_level(LogLevel::Info),
    )?;

    let events = EventBus::new(256);
    let mut stream = EventStream::new(events.subscribe());
    let registry = PoolRegistry::with_events(events);

    // Duplicate requests for one key run back to back, never concurrently
    let pool = registry.builder("fetch").max_threads(4).build()?;
    let started = Instant::now();
    let first = pool.execute(Fetch { key: "A", version: 1 });
    let second = pool.execute(Fetch { key: "A", version: 2 });
    info!(
        first = %first.get()?,
        second = %second.get()?,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Duplicate fetches settled"
    );

    // Policy and caching sit in front of every task
    let cache = Arc::new(CacheInterceptor::<String>::with_capacity(32)?);
    let guarded = registry
        .builder("guarded")
        .interceptor(interceptor_fn(|task: &dyn DynTask| {
            if task.task_id() == "fetch-secret" {
                Interception::Discard
            } else {
                Interception::Proceed
            }
        }))
        .shared_interceptor(cache.clone())
        .build()?;

    let fresh = guarded.execute(Fetch { key: "B", version: 1 });
    cache.record(&fresh);
    info!(value = %fresh.get()?, "Fresh fetch");

    // Cache fills once the dispatch thread has delivered
    while cache.get("fetch-B").is_none() {
        thread::sleep(Duration::from_millis(1));
    }
    let cached = guarded.execute(Fetch { key: "B", version: 2 });
    info!(
        value = %cached.get()?,
        cached = cached.outcome().is_some_and(|outcome| outcome.is_cached()),
        "Repeat fetch"
    );

    let vetoed = guarded.execute(Fetch {
        key: "secret",
        version: 1,
    });
    info!(discarded = vetoed.get().is_err() && vetoed.is_discarded(), "Vetoed fetch");

    registry.shutdown_all();

    let mut count = 0;
    while let Some(Ok(event)) = stream.try_recv() {
        count += 1;
        info!(pool = %event.pool(), task_id = ?event.task_id(), "{}", event.description());
    }
    info!(count, "Lifecycle events observed");
    Ok(())
}
