//! Log source discovery with a journal fallback and a TTL'd decision cache.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::clock::Clock;
use crate::core::config::{BinariesConfig, Config, SourcesConfig};
use crate::logger::activity::ActivityLoggerHandle;
use crate::logger::jsonl::{ActivityEntry, EventType, Severity};
use crate::platform::exec::CommandRunner;
use crate::source::cache::{CacheStore, IndexMeta};

/// Where mail log lines come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceMode {
    /// Files matched by the first productive glob, sorted lexicographically.
    FileGlob { pattern: String, files: Vec<PathBuf> },
    /// No files; the system journal answered the probe.
    Journal,
}

/// One line of the scan report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanEntry {
    pub pattern: String,
    pub files_found: usize,
}

/// The resolver's decision plus diagnostics, persisted as `logsource.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// `None` when neither files nor the journal are available.
    pub mode: Option<SourceMode>,
    pub decided_at: i64,
    pub scan_report: Vec<ScanEntry>,
    pub binaries: BTreeMap<String, bool>,
    pub server_tz: String,
    #[serde(default)]
    pub index_meta: IndexMeta,
    #[serde(default)]
    pub agg_ts: i64,
}

impl SourceDescriptor {
    /// Candidate files; empty in journal mode or when nothing was found.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        match &self.mode {
            Some(SourceMode::FileGlob { files, .. }) => files,
            _ => &[],
        }
    }

    #[must_use]
    pub const fn mode_name(&self) -> &'static str {
        match self.mode {
            Some(SourceMode::FileGlob { .. }) => "file_glob",
            Some(SourceMode::Journal) => "journal",
            None => "none",
        }
    }

    #[must_use]
    pub const fn is_journal(&self) -> bool {
        matches!(self.mode, Some(SourceMode::Journal))
    }

    /// Decided within the last `ttl_secs` seconds. A decision stamped in the
    /// future counts as stale.
    #[must_use]
    pub fn is_fresh(&self, now: i64, ttl_secs: u64) -> bool {
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        (0..ttl).contains(&now.saturating_sub(self.decided_at))
    }
}

/// Picks the log source and caches the decision.
pub struct SourceResolver {
    sources: SourcesConfig,
    binaries: BinariesConfig,
    escalation_program: Option<PathBuf>,
    probe_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    caches: CacheStore,
    logger: ActivityLoggerHandle,
}

impl SourceResolver {
    pub fn new(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
        caches: CacheStore,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            sources: config.sources.clone(),
            binaries: config.binaries.clone(),
            escalation_program: config
                .privilege
                .escalate
                .then(|| config.privilege.program.clone()),
            probe_timeout: config.timeouts.default_timeout(),
            runner,
            clock,
            caches,
            logger,
        }
    }

    /// Cached descriptor when fresh and not `force`d, otherwise a new scan.
    /// Never fails: an empty result is a descriptor with `mode: None`.
    pub fn resolve(&self, force: bool) -> SourceDescriptor {
        let now = self.clock.now_secs();
        if !force
            && let Some(cached) = self.caches.logsource().load()
            && cached.is_fresh(now, self.sources.detect_refresh_secs)
        {
            return cached;
        }
        self.rescan(now)
    }

    fn rescan(&self, now: i64) -> SourceDescriptor {
        let mut scan_report = Vec::with_capacity(self.sources.log_globs.len());
        let mut mode = None;
        for pattern in &self.sources.log_globs {
            let files = expand_glob(pattern);
            scan_report.push(ScanEntry {
                pattern: pattern.clone(),
                files_found: files.len(),
            });
            if !files.is_empty() {
                mode = Some(SourceMode::FileGlob {
                    pattern: pattern.clone(),
                    files,
                });
                break;
            }
        }
        if mode.is_none() && self.journal_reachable() {
            mode = Some(SourceMode::Journal);
        }

        let index_meta = IndexMeta {
            files: match &mode {
                Some(SourceMode::FileGlob { files, .. }) => files.len(),
                _ => 0,
            },
            updated: now,
        };
        if let Err(error) = self.caches.index().store(&index_meta) {
            eprintln!("[MP-CACHE] failed to write index metadata: {error}");
        }

        let descriptor = SourceDescriptor {
            mode,
            decided_at: now,
            scan_report,
            binaries: self.binaries_present(),
            server_tz: server_timezone(),
            index_meta,
            agg_ts: self
                .caches
                .aggregate()
                .load()
                .map_or(0, |stamp| stamp.updated_at),
        };
        if let Err(error) = self.caches.logsource().store(&descriptor) {
            eprintln!("[MP-CACHE] failed to persist source decision: {error}");
        }

        let mut entry = ActivityEntry::new(EventType::SourceResolved, Severity::Info)
            .source_mode(descriptor.mode_name());
        if let Some(SourceMode::FileGlob { pattern, files }) = &descriptor.mode {
            entry = entry.details(format!("{pattern} -> {} file(s)", files.len()));
        }
        self.logger.send(entry);
        descriptor
    }

    fn journal_reachable(&self) -> bool {
        if self.sources.journal_units.is_empty() {
            return false;
        }
        let journalctl = self.binaries.journalctl.to_string_lossy();
        let mut argv = vec![&*journalctl, "--no-pager", "-n", "1"];
        for unit in &self.sources.journal_units {
            argv.push("-u");
            argv.push(unit.as_str());
        }
        self.runner.run(&argv, self.probe_timeout).success()
    }

    /// Presence of every external program the probes use.
    pub fn binaries_present(&self) -> BTreeMap<String, bool> {
        let b = &self.binaries;
        let mut present: BTreeMap<String, bool> = [
            ("grep", &b.grep),
            ("zgrep", &b.zgrep),
            ("journalctl", &b.journalctl),
            ("postqueue", &b.postqueue),
            ("doveadm", &b.doveadm),
            ("ss", &b.ss),
        ]
        .into_iter()
        .map(|(name, path)| (name.to_string(), path.is_file()))
        .collect();
        if let Some(program) = &self.escalation_program {
            present.insert("escalation".to_string(), program.is_file());
        }
        present
    }
}

/// Files matching `pattern`, sorted. Unreadable directory entries are skipped.
fn expand_glob(pattern: &str) -> Vec<PathBuf> {
    let Ok(paths) = glob::glob(pattern) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    files.sort();
    files
}

/// `TZ` when set, else the zone name behind `/etc/localtime`, else `UTC`.
#[must_use]
pub fn server_timezone() -> String {
    if let Ok(tz) = env::var("TZ") {
        let tz = tz.trim().trim_start_matches(':');
        if !tz.is_empty() {
            return tz.to_string();
        }
    }
    zone_from_localtime(Path::new("/etc/localtime")).unwrap_or_else(|| "UTC".to_string())
}

fn zone_from_localtime(link: &Path) -> Option<String> {
    let target = fs::read_link(link).ok()?;
    let target = target.to_string_lossy();
    let (_, zone) = target.split_once("zoneinfo/")?;
    (!zone.is_empty()).then(|| zone.to_string())
}
