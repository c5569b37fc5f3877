//! Lifetime delivered-message count across the rotated log set.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::config::Config;
use crate::platform::exec::CommandRunner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total_sent: u64,
}

/// Sum the per-file counts printed by `zgrep -c`.
#[must_use]
pub fn sum_counts(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|row| row.trim().parse::<u64>().ok())
        .sum()
}

pub struct TotalsCollector {
    runner: Arc<dyn CommandRunner>,
    zgrep: String,
    timeout: Duration,
}

impl TotalsCollector {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            zgrep: config.binaries.zgrep.display().to_string(),
            timeout: config.timeouts.archive_filter(),
        }
    }

    /// Count `status=sent` lines in `files`; journal mode passes none.
    pub fn collect(&self, files: &[PathBuf]) -> Totals {
        if files.is_empty() {
            return Totals::default();
        }
        let file_args: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        let mut argv = vec![self.zgrep.as_str(), "-h", "-a", "-E", "-c", "status=sent"];
        argv.extend(file_args.iter().map(String::as_str));
        let output = self.runner.run(&argv, self.timeout);
        Totals {
            total_sent: sum_counts(&output.stdout),
        }
    }
}
