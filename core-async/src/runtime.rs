//! Runtime utilities that abstract over the underlying executor.
//!
//! Every task pool owns one runtime. Task bodies are synchronous, so they run on
//! the runtime's blocking pool; its size is the pool's thread budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use tokio::runtime::{Builder, Handle, Runtime};

/// How long an idle worker thread lingers before it is reclaimed.
pub const WORKER_KEEP_ALIVE: Duration = Duration::from_secs(1);

/// Builds the runtime backing a task pool.
///
/// Worker threads are named `"<name> #<n>"`, and at most `max_threads`
/// blocking threads run task bodies concurrently.
///
/// # Errors
///
/// Returns the I/O error reported by the runtime builder when the OS refuses
/// to create the driver threads.
pub fn worker_runtime(name: &str, max_threads: usize) -> std::io::Result<Runtime> {
    let prefix = name.to_string();
    let counter = Arc::new(AtomicUsize::new(1));

    Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(max_threads.max(1))
        .thread_keep_alive(WORKER_KEEP_ALIVE)
        .thread_name_fn(move || {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            format!("{} #{}", prefix, n)
        })
        .enable_all()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_runtime_names_threads() {
        let runtime = worker_runtime("naming", 2).unwrap();
        let name = runtime
            .block_on(runtime.spawn_blocking(|| {
                std::thread::current().name().map(str::to_string)
            }))
            .unwrap()
            .unwrap();
        assert!(name.starts_with("naming #"), "unexpected name {name}");
    }

    #[test]
    fn test_worker_runtime_accepts_zero_threads() {
        let runtime = worker_runtime("tiny", 0).unwrap();
        let value = runtime.block_on(runtime.spawn_blocking(|| 7)).unwrap();
        assert_eq!(value, 7);
    }
}
