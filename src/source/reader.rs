//! Relevant-line acquisition over whichever source the resolver picked.
//!
//! The strategy is chosen per call: a readable uncompressed file is streamed
//! in-process; otherwise the rotated set is searched with `zgrep`; in journal
//! mode `journalctl` is queried. Each strategy applies the classifier's
//! pre-filter, drops lines without a parseable timestamp and honours `since`.

#![allow(missing_docs)]

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local};

use crate::core::clock::Clock;
use crate::core::config::Config;
use crate::logs::classifier::{Classifier, PREFILTER_PATTERN};
use crate::logs::timestamp;
use crate::platform::exec::CommandRunner;
use crate::source::resolver::{SourceDescriptor, SourceResolver};

/// One log line as read, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub text: String,
    /// Year to assume for classic syslog stamps; `None` means the year of
    /// the window being built.
    pub reference_year: Option<i32>,
}

impl RawLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reference_year: None,
        }
    }
}

/// Lazy sequence of relevant lines.
pub struct RelevantLines {
    inner: Box<dyn Iterator<Item = RawLine> + Send>,
}

impl RelevantLines {
    pub fn empty() -> Self {
        Self {
            inner: Box::new(std::iter::empty()),
        }
    }
}

impl Iterator for RelevantLines {
    type Item = RawLine;

    fn next(&mut self) -> Option<RawLine> {
        self.inner.next()
    }
}

impl From<Vec<RawLine>> for RelevantLines {
    fn from(lines: Vec<RawLine>) -> Self {
        Self {
            inner: Box::new(lines.into_iter()),
        }
    }
}

/// Anything that can hand out relevant lines newer than `since`.
pub trait LineSource: Send + Sync {
    fn relevant_lines(&self, since: Option<i64>) -> RelevantLines;
}

/// How lines will be acquired for the current descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStrategy {
    PlainFile(PathBuf),
    ArchiveFilter(Vec<PathBuf>),
    DaemonQuery,
    None,
}

impl ReadStrategy {
    /// Plain file when one is readable, archive filter when only other files
    /// exist, daemon query in journal mode.
    #[must_use]
    pub fn select(descriptor: &SourceDescriptor) -> Self {
        if descriptor.is_journal() {
            return Self::DaemonQuery;
        }
        if let Some(plain) = active_plain_file(descriptor) {
            return Self::PlainFile(plain);
        }
        let files = descriptor.files();
        if files.is_empty() {
            Self::None
        } else {
            Self::ArchiveFilter(files.to_vec())
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PlainFile(_) => "plain_file",
            Self::ArchiveFilter(_) => "archive_filter",
            Self::DaemonQuery => "daemon_query",
            Self::None => "none",
        }
    }
}

/// The uncompressed file live data is read from: `maillog` or `mail.log` when
/// present, else the first uncompressed candidate. Must be openable.
#[must_use]
pub fn active_plain_file(descriptor: &SourceDescriptor) -> Option<PathBuf> {
    let uncompressed: Vec<&PathBuf> = descriptor
        .files()
        .iter()
        .filter(|path| path.extension().is_none_or(|ext| ext != "gz"))
        .collect();
    let preferred = uncompressed.iter().find(|path| {
        path.file_name()
            .is_some_and(|name| name == "maillog" || name == "mail.log")
    });
    preferred
        .or_else(|| uncompressed.first())
        .filter(|path| File::open(path).is_ok())
        .map(|path| (*path).clone())
}

/// Production [`LineSource`] backed by the resolver.
pub struct LineReader {
    resolver: Arc<SourceResolver>,
    classifier: Arc<Classifier>,
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    zgrep: PathBuf,
    journalctl: PathBuf,
    journal_units: Vec<String>,
    journal_max_entries: usize,
    archive_timeout: Duration,
    journal_timeout: Duration,
}

impl LineReader {
    pub fn new(
        config: &Config,
        resolver: Arc<SourceResolver>,
        classifier: Arc<Classifier>,
        runner: Arc<dyn CommandRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resolver,
            classifier,
            runner,
            clock,
            zgrep: config.binaries.zgrep.clone(),
            journalctl: config.binaries.journalctl.clone(),
            journal_units: config.sources.journal_units.clone(),
            journal_max_entries: config.sources.journal_max_entries,
            archive_timeout: config.timeouts.archive_filter(),
            journal_timeout: config.timeouts.journal_query(),
        }
    }

    /// Strategy for the current (possibly cached) source decision.
    fn strategy(&self) -> ReadStrategy {
        ReadStrategy::select(&self.resolver.resolve(false))
    }

    /// Lines from `strategy`, filtered by relevance, parseability and `since`.
    pub fn read(&self, strategy: &ReadStrategy, since: Option<i64>) -> RelevantLines {
        match strategy {
            ReadStrategy::PlainFile(path) => self.read_plain(path, since),
            ReadStrategy::ArchiveFilter(files) => self.read_archive(files, since),
            ReadStrategy::DaemonQuery => self.read_journal(since),
            ReadStrategy::None => RelevantLines::empty(),
        }
    }

    fn read_plain(&self, path: &Path, since: Option<i64>) -> RelevantLines {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(error) => {
                eprintln!("[MP-READ] cannot open {}: {error}", path.display());
                return RelevantLines::empty();
            }
        };
        let year = file
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .map_or_else(|| self.current_year(), |mtime| DateTime::<Local>::from(mtime).year());
        RelevantLines {
            inner: Box::new(PlainFileLines {
                reader: BufReader::new(file),
                buf: Vec::with_capacity(512),
                year,
                since,
                classifier: Arc::clone(&self.classifier),
            }),
        }
    }

    fn read_archive(&self, files: &[PathBuf], since: Option<i64>) -> RelevantLines {
        let zgrep = self.zgrep.to_string_lossy();
        let file_args: Vec<String> = files
            .iter()
            .map(|f| f.to_string_lossy().into_owned())
            .collect();
        let mut argv = vec![&*zgrep, "-h", "-a", "-i", "-E", PREFILTER_PATTERN];
        argv.extend(file_args.iter().map(String::as_str));
        let output = self.runner.run(&argv, self.archive_timeout);
        if output.timed_out {
            return RelevantLines::empty();
        }
        self.filter_output(&output.stdout, since)
    }

    fn read_journal(&self, since: Option<i64>) -> RelevantLines {
        let journalctl = self.journalctl.to_string_lossy();
        let max = self.journal_max_entries.to_string();
        let mut argv = vec![&*journalctl, "--no-pager", "-o", "short-iso", "-n", max.as_str()];
        for unit in &self.journal_units {
            argv.push("-u");
            argv.push(unit.as_str());
        }
        let output = self.runner.run(&argv, self.journal_timeout);
        if output.timed_out {
            return RelevantLines::empty();
        }
        self.filter_output(&output.stdout, since)
    }

    fn filter_output(&self, stdout: &str, since: Option<i64>) -> RelevantLines {
        let year = self.current_year();
        let lines: Vec<RawLine> = stdout
            .lines()
            .filter(|line| keep_line(&self.classifier, line, year, since))
            .map(|line| RawLine {
                text: line.to_string(),
                reference_year: Some(year),
            })
            .collect();
        lines.into()
    }

    fn current_year(&self) -> i32 {
        timestamp::year_at(self.clock.now_secs(), &Local)
    }
}

impl LineSource for LineReader {
    fn relevant_lines(&self, since: Option<i64>) -> RelevantLines {
        self.read(&self.strategy(), since)
    }
}

fn keep_line(classifier: &Classifier, line: &str, year: i32, since: Option<i64>) -> bool {
    if line.is_empty() || !classifier.is_relevant(line) {
        return false;
    }
    timestamp::parse(line, year).is_some_and(|ts| since.is_none_or(|floor| ts >= floor))
}

/// Streams a plain log file line by line; invalid UTF-8 is replaced.
struct PlainFileLines {
    reader: BufReader<File>,
    buf: Vec<u8>,
    year: i32,
    since: Option<i64>,
    classifier: Arc<Classifier>,
}

impl Iterator for PlainFileLines {
    type Item = RawLine;

    fn next(&mut self) -> Option<RawLine> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            let text = String::from_utf8_lossy(&self.buf);
            let text = text.trim_end_matches(['\n', '\r']);
            if keep_line(&self.classifier, text, self.year, self.since) {
                return Some(RawLine {
                    text: text.to_string(),
                    reference_year: Some(self.year),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;

    use crate::core::clock::FixedClock;
    use crate::logger::activity::ActivityLoggerHandle;
    use crate::platform::exec::{CommandOutput, ScriptedRunner};
    use crate::source::cache::{CacheStore, IndexMeta};
    use crate::source::resolver::SourceMode;

    fn descriptor(mode: Option<SourceMode>) -> SourceDescriptor {
        SourceDescriptor {
            mode,
            decided_at: 0,
            scan_report: Vec::new(),
            binaries: BTreeMap::new(),
            server_tz: "UTC".to_string(),
            index_meta: IndexMeta::default(),
            agg_ts: 0,
        }
    }

    fn files_mode(files: Vec<PathBuf>) -> Option<SourceMode> {
        Some(SourceMode::FileGlob {
            pattern: "x*".to_string(),
            files,
        })
    }

    fn reader(config: &Config, runner: Arc<ScriptedRunner>, cache_dir: &Path) -> LineReader {
        reader_at(config, runner, cache_dir, 1_710_000_000)
    }

    fn reader_at(config: &Config, runner: Arc<ScriptedRunner>, cache_dir: &Path, now: i64) -> LineReader {
        let clock = Arc::new(FixedClock::at_secs(now));
        let resolver = Arc::new(SourceResolver::new(
            config,
            runner.clone(),
            clock.clone(),
            CacheStore::new(cache_dir),
            ActivityLoggerHandle::disabled(),
        ));
        LineReader::new(
            config,
            resolver,
            Arc::new(Classifier::new().expect("classifier")),
            runner,
            clock,
        )
    }

    /// Classic syslog prefix for `ts` in the local zone.
    fn local_stamp(ts: i64) -> String {
        DateTime::from_timestamp(ts, 0)
            .expect("valid timestamp")
            .with_timezone(&Local)
            .format("%b %e %H:%M:%S")
            .to_string()
    }

    #[test]
    fn maillog_is_preferred_over_other_plain_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files: Vec<PathBuf> = ["mail.err", "maillog", "maillog.1", "maillog.2.gz"]
            .iter()
            .map(|name| dir.path().join(name))
            .collect();
        for f in &files {
            fs::write(f, "").expect("write");
        }
        let d = descriptor(files_mode(files));
        assert_eq!(
            ReadStrategy::select(&d),
            ReadStrategy::PlainFile(dir.path().join("maillog"))
        );
    }

    #[test]
    fn first_uncompressed_file_when_no_preferred_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = vec![dir.path().join("current.log"), dir.path().join("old.log.gz")];
        for f in &files {
            fs::write(f, "").expect("write");
        }
        assert_eq!(
            active_plain_file(&descriptor(files_mode(files))),
            Some(dir.path().join("current.log"))
        );
    }

    #[test]
    fn compressed_only_selects_archive_filter() {
        let files = vec![PathBuf::from("/var/log/maillog.1.gz"), PathBuf::from("/var/log/maillog.2.gz")];
        let strategy = ReadStrategy::select(&descriptor(files_mode(files.clone())));
        assert_eq!(strategy, ReadStrategy::ArchiveFilter(files));
        assert_eq!(strategy.name(), "archive_filter");
    }

    #[test]
    fn unreadable_plain_file_falls_back_to_archive() {
        let files = vec![PathBuf::from("/nonexistent/mailpulse/maillog")];
        assert_eq!(
            ReadStrategy::select(&descriptor(files_mode(files.clone()))),
            ReadStrategy::ArchiveFilter(files)
        );
    }

    #[test]
    fn journal_and_none_modes() {
        assert_eq!(
            ReadStrategy::select(&descriptor(Some(SourceMode::Journal))),
            ReadStrategy::DaemonQuery
        );
        assert_eq!(ReadStrategy::select(&descriptor(None)), ReadStrategy::None);
    }

    #[test]
    fn plain_file_streams_relevant_lines_since_floor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("maillog");
        let mut content = String::new();
        content.push_str("Mar  9 10:00:00 mx postfix/smtp[1]: A: to=<a@x.org>, status=sent (ok)\n");
        content.push_str("Mar  9 10:05:00 mx systemd[1]: Started something.\n");
        content.push_str("garbage without stamp status=sent\n");
        content.push_str("Mar  9 11:00:00 mx postfix/smtp[1]: B: to=<b@x.org>, status=deferred\n");
        content.push_str("Mar  9 12:00:00 mx postfix/smtpd[2]: C: client=h[192.0.2.1]\r\n");
        fs::write(&path, content.as_bytes()).expect("write");
        let mtime = filetime::FileTime::from_unix_time(1_686_000_000, 0); // June 2023
        filetime::set_file_mtime(&path, mtime).expect("set mtime");

        let config = Config::default();
        let r = reader(&config, Arc::new(ScriptedRunner::new()), dir.path());

        let all: Vec<RawLine> = r.read(&ReadStrategy::PlainFile(path.clone()), None).collect();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|line| line.reference_year == Some(2023)));
        assert!(all[2].text.ends_with("client=h[192.0.2.1]"));

        let floor = timestamp::parse("Mar  9 11:00:00", 2023).expect("floor");
        let recent: Vec<RawLine> = r.read(&ReadStrategy::PlainFile(path), Some(floor)).collect();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].text.contains("status=deferred"));
    }

    #[test]
    fn plain_file_tolerates_invalid_utf8() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("maillog");
        let mut bytes = b"Mar  9 10:00:00 mx postfix/smtp[1]: to=<\xff@x>, status=sent\n".to_vec();
        bytes.extend_from_slice(b"Mar  9 10:00:01 mx postfix/cleanup[2]: D: message-id=<m@x>\n");
        fs::write(&path, bytes).expect("write");
        let r = reader(&Config::default(), Arc::new(ScriptedRunner::new()), dir.path());
        let lines: Vec<RawLine> = r.read(&ReadStrategy::PlainFile(path), None).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].text.contains('\u{FFFD}'));
    }

    #[test]
    fn archive_filter_invokes_zgrep_with_prefilter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new().respond(
            "/usr/bin/zgrep",
            CommandOutput::ok(
                "2024-03-09T10:00:00+00:00 mx postfix/smtp[1]: to=<a@x>, status=sent\n\
                 not a timestamp postfix/smtp status=sent\n\n",
            ),
        ));
        let r = reader(&Config::default(), runner.clone(), dir.path());
        let files = vec![PathBuf::from("/var/log/maillog.1.gz"), PathBuf::from("/var/log/maillog.2.gz")];
        let lines: Vec<RawLine> = r.read(&ReadStrategy::ArchiveFilter(files), None).collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].reference_year, Some(2024));

        let call = &runner.calls()[0];
        assert_eq!(&call[..6], ["/usr/bin/zgrep", "-h", "-a", "-i", "-E", PREFILTER_PATTERN]);
        assert_eq!(&call[6..], ["/var/log/maillog.1.gz", "/var/log/maillog.2.gz"]);
    }

    #[test]
    fn archive_lines_take_the_year_from_the_clock() {
        // 2030-03-10T14:02:11Z
        let now = 1_899_381_731;
        let dir = tempfile::tempdir().expect("tempdir");
        let output = format!(
            "{} mx postfix/smtp[1]: 1A: to=<a@x>, status=sent\n{} mx postfix/smtp[1]: 1B: to=<b@x>, status=sent\n",
            local_stamp(now - 600),
            local_stamp(now - 7_200),
        );
        let runner = Arc::new(ScriptedRunner::new().respond("/usr/bin/zgrep", CommandOutput::ok(output)));
        let r = reader_at(&Config::default(), runner, dir.path(), now);
        let lines: Vec<RawLine> = r
            .read(&ReadStrategy::ArchiveFilter(vec![PathBuf::from("/x.gz")]), Some(now - 3_600))
            .collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].text.contains("<a@x>"));
        assert_eq!(lines[0].reference_year, Some(2030));
    }

    #[test]
    fn archive_timeout_yields_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new().respond(
            "/usr/bin/zgrep",
            CommandOutput {
                exit_code: -1,
                stdout: "2024-03-09T10:00:00Z mx postfix/smtp[1]: status=sent\n".to_string(),
                stderr: String::new(),
                timed_out: true,
            },
        ));
        let r = reader(&Config::default(), runner, dir.path());
        let lines = r.read(&ReadStrategy::ArchiveFilter(vec![PathBuf::from("/x.gz")]), None);
        assert_eq!(lines.count(), 0);
    }

    #[test]
    fn journal_query_filters_by_since() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new().respond(
            "/usr/bin/journalctl",
            CommandOutput::ok(
                "-- Logs begin at Sat 2024-03-09 --\n\
                 2024-03-09T09:59:59+0000 mx postfix/smtp[1]: to=<a@x>, status=sent\n\
                 2024-03-09T10:00:00+0000 mx postfix/smtp[1]: to=<b@x>, status=sent\n\
                 2024-03-09T10:00:01+0000 mx postfix/anvil[3]: statistics\n",
            ),
        ));
        let r = reader(&Config::default(), runner.clone(), dir.path());
        let lines: Vec<RawLine> = r.read(&ReadStrategy::DaemonQuery, Some(1_709_978_400)).collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].text.contains("<b@x>"));
        assert_eq!(
            runner.calls()[0],
            vec![
                "/usr/bin/journalctl", "--no-pager", "-o", "short-iso", "-n", "20000", "-u",
                "postfix", "-u", "dovecot"
            ]
        );
    }

    #[test]
    fn none_strategy_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let r = reader(&Config::default(), Arc::new(ScriptedRunner::new()), dir.path());
        assert_eq!(r.read(&ReadStrategy::None, None).count(), 0);
    }
}
