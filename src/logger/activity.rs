//! Activity logger thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Everything else holds an
//! [`ActivityLoggerHandle`] and hands entries over a bounded crossbeam channel
//! with `try_send`, so request handling never waits on disk I/O.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{MpError, Result};
use crate::logger::jsonl::{ActivityEntry, EventType, JsonlConfig, JsonlWriter, Severity};

const CHANNEL_CAPACITY: usize = 512;

enum LoggerMessage {
    Entry(Box<ActivityEntry>),
    Shutdown,
}

/// Cloneable sender side of the activity log.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Option<Sender<LoggerMessage>>,
    dropped_events: Arc<AtomicU64>,
}

impl std::fmt::Debug for ActivityLoggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLoggerHandle")
            .field("enabled", &self.tx.is_some())
            .field("dropped_events", &self.dropped_events())
            .finish()
    }
}

impl ActivityLoggerHandle {
    /// A handle that discards everything. Used by tests and one-shot CLI calls
    /// that run without an activity log.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an entry. Never blocks; a full channel drops the entry.
    pub fn send(&self, entry: ActivityEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(TrySendError::Full(_)) = tx.try_send(LoggerMessage::Entry(Box::new(entry))) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Entries lost to back-pressure and not yet reported in the log.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(LoggerMessage::Shutdown);
        }
    }
}

/// Spawn the logger thread writing through `config`.
pub fn spawn_logger(config: JsonlConfig) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded(CHANNEL_CAPACITY);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx: Some(tx),
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("mailpulse-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config, &dropped))
        .map_err(|error| MpError::Runtime {
            details: format!("failed to spawn logger thread: {error}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<LoggerMessage>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(config);

    while let Ok(message) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            writer.write_entry(
                &ActivityEntry::new(EventType::ApiError, Severity::Warning)
                    .details(format!("{lost} activity events dropped due to back-pressure")),
            );
        }

        match message {
            LoggerMessage::Entry(entry) => {
                writer.write_entry(&entry);
                if rx.is_empty() {
                    writer.flush();
                }
            }
            LoggerMessage::Shutdown => break,
        }
    }
    writer.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_reach_the_file_before_shutdown_returns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("activity.jsonl");
        let (handle, join) = spawn_logger(JsonlConfig {
            fallback_path: None,
            ..JsonlConfig::for_path(&path)
        })
        .expect("spawn logger");

        handle.send(ActivityEntry::new(EventType::ServerStart, Severity::Info));
        handle.send(
            ActivityEntry::new(EventType::ApiRequest, Severity::Info).endpoint("series_live"),
        );
        handle.shutdown();
        join.join().expect("logger thread");

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("series_live"));
    }

    #[test]
    fn dropping_all_handles_stops_the_thread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (handle, join) =
            spawn_logger(JsonlConfig::for_path(dir.path().join("a.jsonl"))).expect("spawn");
        drop(handle);
        join.join().expect("logger thread exits on disconnect");
    }

    #[test]
    fn disabled_handle_is_inert() {
        let handle = ActivityLoggerHandle::disabled();
        handle.send(ActivityEntry::new(EventType::ServerStop, Severity::Info));
        handle.shutdown();
        assert_eq!(handle.dropped_events(), 0);
    }
}
