//! Integration tests for logging system

use core_runtime::config::EngineConfig;
use core_runtime::logging::{init_logging, LogEntry, LogFormat, LogLevel, LoggerSink, LoggingConfig};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CollectingSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl LoggerSink for CollectingSink {
    fn log(&self, entry: LogEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    fn min_level(&self) -> LogLevel {
        LogLevel::Debug
    }
}

// Logging can only be initialized once per process, so every global
// assertion lives in this one test.
#[test]
fn test_init_logging_forwards_to_sink() {
    let sink = Arc::new(CollectingSink::default());
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug)
        .with_logger_sink(sink.clone());

    init_logging(config.clone()).unwrap();

    tracing::debug!(target: "core_task::pool", pool = "io", task_id = "fetch-A", "Task queued");
    tracing::trace!(target: "core_task::pool", "filtered out by level");
    tracing::info!(target: "unrelated_crate", "filtered out by target");

    {
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "Task queued");
        assert_eq!(entries[0].fields.get("task_id").map(String::as_str), Some("fetch-A"));
    }

    // A second initialization is refused
    assert!(init_logging(config).is_err());
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Pretty)
        .with_level(LogLevel::Warn)
        .with_filter("core_task=debug")
        .with_target(false);

    assert_eq!(config.format, LogFormat::Pretty);
    assert_eq!(config.level, LogLevel::Warn);
    assert_eq!(config.filter.as_deref(), Some("core_task=debug"));
    assert!(!config.display_target);
    assert!(format!("{:?}", config).contains("LoggingConfig"));
}

#[test]
fn test_engine_config_from_json_document() {
    let config = EngineConfig::from_json_str(
        r#"{
            "default_pool": { "name": "default", "max_threads": 2 },
            "pools": [{ "name": "io", "max_threads": 8, "queue_capacity": 4 }],
            "enable_events": true
        }"#,
    )
    .unwrap();

    let names: Vec<_> = config.all_pools().map(|pool| pool.name.as_str()).collect();
    assert_eq!(names, vec!["default", "io"]);
    assert_eq!(config.pools[0].capacity(), 12);
}
