//! Postfix queue depth from `postqueue -p`.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::config::Config;
use crate::platform::exec::CommandRunner;

/// Minimum run of uppercase hex digits that marks a queue-id line.
const QUEUE_ID_MIN_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueStatus {
    #[must_use]
    pub fn failed(reason: &str) -> Self {
        Self {
            ok: false,
            total: None,
            deferred: None,
            error: Some(reason.to_string()),
        }
    }
}

/// Count queue entries and deferred mentions in a `postqueue -p` listing.
///
/// Blank output means the listing could not be obtained.
#[must_use]
pub fn parse_listing(listing: &str) -> QueueStatus {
    if listing.trim().is_empty() {
        return QueueStatus::failed("postqueue_failed");
    }
    let mut total = 0;
    let mut deferred = 0;
    for line in listing.lines() {
        if is_queue_id_line(line) {
            total += 1;
        }
        if line.to_ascii_lowercase().contains("deferred") {
            deferred += 1;
        }
    }
    QueueStatus {
        ok: true,
        total: Some(total),
        deferred: Some(deferred),
        error: None,
    }
}

fn is_queue_id_line(line: &str) -> bool {
    let rest = line.strip_prefix('*').unwrap_or(line);
    rest.bytes()
        .take_while(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(b))
        .count()
        >= QUEUE_ID_MIN_LEN
}

pub struct QueueCollector {
    runner: Arc<dyn CommandRunner>,
    postqueue: String,
    timeout: Duration,
}

impl QueueCollector {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            postqueue: config.binaries.postqueue.display().to_string(),
            timeout: config.timeouts.queue(),
        }
    }

    pub fn collect(&self) -> QueueStatus {
        let output = self.runner.run(&[self.postqueue.as_str(), "-p"], self.timeout);
        parse_listing(&output.stdout)
    }
}
