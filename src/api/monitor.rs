//! The request pipeline behind every endpoint.
//!
//! [`Monitor`] wires the resolver, reader, classifier and collectors together
//! and answers each operation synchronously. Nothing in here fails outward:
//! missing sources, failed commands and unreadable files degrade to empty or
//! zero values plus warnings in the health report.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::Serialize;

use crate::collectors::queue::{QueueCollector, QueueStatus};
use crate::collectors::sessions::{SessionCollector, SessionCounts};
use crate::collectors::totals::{Totals, TotalsCollector};
use crate::core::clock::{Clock, SystemClock, unix_secs};
use crate::core::config::{Config, ThresholdsConfig};
use crate::core::errors::Result;
use crate::logger::activity::ActivityLoggerHandle;
use crate::logs::classifier::Classifier;
use crate::platform::exec::{CommandRunner, PrivilegedExecutor, running_as_root};
use crate::platform::facts::{FactsCollector, SystemFacts};
use crate::source::cache::{AggregateStamp, CacheStore};
use crate::source::reader::{LineReader, LineSource, ReadStrategy, active_plain_file};
use crate::source::resolver::{SourceDescriptor, SourceMode, SourceResolver};
use crate::stats::aggregate::{SeriesReport, TodayStats, aggregate, today_summary};
use crate::stats::talkers::{TalkerExtractor, TalkerSpan, TalkerTable};
use crate::stats::window::{TimeWindow, WindowKind};

const RECENT_SECS: i64 = 60;

/// Diagnostics served by the `health` endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub source: Option<SourceMode>,
    pub readable_files: Vec<PathBuf>,
    pub binaries: BTreeMap<String, bool>,
    /// Whether commands are wrapped in the escalation program.
    pub escalation: bool,
    pub server_tz: String,
    pub active_plain: Option<PathBuf>,
    pub strategy: &'static str,
    pub recent_60s_rows: usize,
    pub note: &'static str,
    pub warnings: Vec<&'static str>,
    /// Modification time of the active plain file, 0 when there is none.
    pub last_log_update_ts: i64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Ping {
    pub ok: bool,
    pub time: i64,
}

/// Alert thresholds the dashboard colours against.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ThresholdsReport {
    pub thresholds: ThresholdsConfig,
}

pub struct Monitor {
    config: Config,
    clock: Arc<dyn Clock>,
    caches: CacheStore,
    resolver: Arc<SourceResolver>,
    reader: LineReader,
    classifier: Arc<Classifier>,
    talkers: TalkerExtractor,
    queue: QueueCollector,
    sessions: SessionCollector,
    totals: TotalsCollector,
    facts: FactsCollector,
}

impl Monitor {
    pub fn new(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        let caches = CacheStore::new(config.paths.cache_dir.clone());
        let classifier = Arc::new(Classifier::new()?);
        let resolver = Arc::new(SourceResolver::new(
            &config,
            Arc::clone(&runner),
            Arc::clone(&clock),
            caches.clone(),
            logger,
        ));
        let reader = LineReader::new(
            &config,
            Arc::clone(&resolver),
            Arc::clone(&classifier),
            Arc::clone(&runner),
            Arc::clone(&clock),
        );
        Ok(Self {
            queue: QueueCollector::new(&config, Arc::clone(&runner)),
            sessions: SessionCollector::new(&config, Arc::clone(&runner)),
            totals: TotalsCollector::new(&config, runner),
            talkers: TalkerExtractor::new()?,
            facts: FactsCollector::default(),
            config,
            clock,
            caches,
            resolver,
            reader,
            classifier,
        })
    }

    /// Production wiring: privileged executor and the system clock.
    pub fn from_config(config: Config, logger: ActivityLoggerHandle) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(PrivilegedExecutor::from_config(&config, logger.clone()));
        Self::new(config, runner, Arc::new(SystemClock), logger)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn ping(&self) -> Ping {
        Ping {
            ok: true,
            time: self.clock.now_secs(),
        }
    }

    pub fn thresholds(&self) -> ThresholdsReport {
        ThresholdsReport {
            thresholds: self.config.thresholds.clone(),
        }
    }

    pub fn source(&self, force: bool) -> SourceDescriptor {
        self.resolver.resolve(force)
    }

    pub fn today(&self) -> TodayStats {
        let window = TimeWindow::build(WindowKind::Today, self.clock.now_secs(), &Local);
        let lines = self.reader.relevant_lines(Some(window.span().0));
        today_summary(&window, &self.classifier, lines)
    }

    pub fn series(&self, kind: WindowKind) -> SeriesReport {
        let now = self.clock.now_secs();
        let window = TimeWindow::build(kind, now, &Local);
        let lines = self.reader.relevant_lines(Some(window.span().0));
        let report = aggregate(&window, &self.classifier, lines);
        let stamp = AggregateStamp {
            updated_at: now,
            window: kind.as_str().to_string(),
        };
        if let Err(error) = self.caches.aggregate().store(&stamp) {
            eprintln!("[MP-CACHE] failed to record aggregate time: {error}");
        }
        report
    }

    pub fn top_talkers(&self, span: TalkerSpan) -> TalkerTable {
        let now = self.clock.now_secs();
        let start = span.start(now, &Local);
        let lines = self.reader.relevant_lines(Some(start));
        self.talkers
            .tally(lines, start, now, self.config.talkers.limit, &Local)
    }

    pub fn totals(&self) -> Totals {
        let descriptor = self.resolver.resolve(false);
        self.totals.collect(descriptor.files())
    }

    pub fn queue(&self) -> QueueStatus {
        self.queue.collect()
    }

    pub fn sessions(&self) -> SessionCounts {
        self.sessions.collect()
    }

    pub fn system(&self) -> SystemFacts {
        self.facts.collect()
    }

    pub fn health(&self) -> HealthReport {
        let now = self.clock.now_secs();
        let descriptor = self.resolver.resolve(false);
        let strategy = ReadStrategy::select(&descriptor);
        let active_plain = active_plain_file(&descriptor);
        let last_log_update_ts = active_plain.as_deref().map_or(0, modified_secs);
        let recent_60s_rows = self
            .reader
            .read(&strategy, Some(now - RECENT_SECS))
            .count();

        let note = match strategy {
            ReadStrategy::PlainFile(_) => "using plain file for live/today",
            ReadStrategy::ArchiveFilter(_) => "using zgrep over files",
            ReadStrategy::DaemonQuery => "journal fallback",
            ReadStrategy::None => "no log source",
        };

        let mut warnings = Vec::new();
        if descriptor.files().is_empty() && !descriptor.is_journal() {
            warnings.push("no_readable_log_files");
        }
        if !descriptor.binaries.get("zgrep").copied().unwrap_or(false) {
            warnings.push("zgrep_missing");
        }
        let stale_after = i64::try_from(self.config.thresholds.stale_log_minutes.saturating_mul(60))
            .unwrap_or(i64::MAX);
        if last_log_update_ts > 0 && now.saturating_sub(last_log_update_ts) > stale_after {
            warnings.push("log_stale");
        }

        HealthReport {
            source: descriptor.mode.clone(),
            readable_files: descriptor.files().to_vec(),
            binaries: descriptor.binaries.clone(),
            escalation: self.config.privilege.escalate && !running_as_root(),
            server_tz: descriptor.server_tz.clone(),
            active_plain,
            strategy: strategy.name(),
            recent_60s_rows,
            note,
            warnings,
            last_log_update_ts,
        }
    }
}

fn modified_secs(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_or(0, unix_secs)
}
