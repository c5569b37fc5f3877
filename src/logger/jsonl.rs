//! Append-only JSONL activity log.
//!
//! One self-contained JSON object per line, assembled in memory and written
//! with a single `write_all` so a concurrent `tail -f` never sees half a line.
//!
//! When the primary path cannot be written the writer degrades step by step:
//! fallback path, then stderr with an `[MP-JSONL]` prefix, then discard.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{MpError, Result};

/// Severity level for activity events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SourceResolved,
    CommandTimeout,
    CommandFailed,
    ApiRequest,
    ApiError,
    ServerStart,
    ServerStop,
}

/// A single activity record. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// RFC 3339 UTC timestamp with millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Program that was run, for command events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// API endpoint name, for request events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Log source mode after resolution (`file_glob`, `journal`, `none`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ActivityEntry {
    /// New entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event,
            severity,
            program: None,
            exit_code: None,
            duration_ms: None,
            endpoint: None,
            source_mode: None,
            path: None,
            error_code: None,
            details: None,
        }
    }

    #[must_use]
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    #[must_use]
    pub const fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    #[must_use]
    pub const fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn source_mode(mut self, mode: impl Into<String>) -> Self {
        self.source_mode = Some(mode.into());
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().display().to_string());
        self
    }

    #[must_use]
    pub fn error(mut self, error: &MpError) -> Self {
        self.error_code = Some(error.code().to_string());
        self.details = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

impl WriterState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Stderr => "stderr",
            Self::Discard => "discard",
        }
    }
}

/// Settings for [`JsonlWriter`].
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would grow past this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`.
    pub max_rotated_files: u32,
}

impl JsonlConfig {
    /// Config for the given primary path with a `/tmp` fallback.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: Some(std::env::temp_dir().join("mailpulse-activity.jsonl")),
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

/// Line writer with size-based rotation and the degradation chain.
pub struct JsonlWriter {
    config: JsonlConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
}

impl JsonlWriter {
    /// Open the primary path, falling down the chain on failure.
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
        };
        match open_append(&writer.config.path) {
            Ok((file, size)) => writer.install(file, size, WriterState::Primary),
            Err(_) => writer.open_fallback(),
        }
        writer
    }

    pub fn write_entry(&mut self, entry: &ActivityEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(error) => {
                let _ = writeln!(io::stderr(), "[MP-JSONL] serialize error: {error}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }

    /// Current position in the degradation chain.
    pub fn state(&self) -> &'static str {
        self.state.as_str()
    }

    fn install(&mut self, file: File, size: u64, state: WriterState) {
        self.writer = Some(BufWriter::with_capacity(16 * 1024, file));
        self.bytes_written = size;
        self.state = state;
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.writer.is_some() && self.bytes_written + len > self.config.max_size_bytes {
            self.rotate();
        }

        match self.state {
            WriterState::Primary | WriterState::Fallback => {
                let written = self
                    .writer
                    .as_mut()
                    .is_some_and(|w| w.write_all(line.as_bytes()).is_ok());
                if written {
                    self.bytes_written += len;
                } else {
                    self.degrade();
                    self.write_line(line);
                }
            }
            WriterState::Stderr => {
                let _ = write!(io::stderr(), "[MP-JSONL] {line}");
            }
            WriterState::Discard => {}
        }
    }

    fn open_fallback(&mut self) {
        let opened = self
            .config
            .fallback_path
            .as_deref()
            .and_then(|path| open_append(path).ok().map(|handle| (path.to_path_buf(), handle)));
        if let Some((path, (file, size))) = opened {
            let _ = writeln!(
                io::stderr(),
                "[MP-JSONL] primary activity log unavailable, using {}",
                path.display()
            );
            self.install(file, size, WriterState::Fallback);
        } else {
            let _ = writeln!(
                io::stderr(),
                "[MP-JSONL] no writable activity log path, using stderr"
            );
            self.writer = None;
            self.state = WriterState::Stderr;
        }
    }

    fn degrade(&mut self) {
        self.writer = None;
        match self.state {
            WriterState::Primary => self.open_fallback(),
            WriterState::Fallback => self.state = WriterState::Stderr,
            WriterState::Stderr | WriterState::Discard => self.state = WriterState::Discard,
        }
    }

    fn rotate(&mut self) {
        self.flush();
        self.writer = None;
        let base = match self.state {
            WriterState::Primary => self.config.path.clone(),
            WriterState::Fallback => match &self.config.fallback_path {
                Some(path) => path.clone(),
                None => return,
            },
            WriterState::Stderr | WriterState::Discard => return,
        };

        let keep = self.config.max_rotated_files.max(1);
        let _ = fs::remove_file(rotated_name(&base, keep));
        for index in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, index), rotated_name(&base, index + 1));
        }
        let _ = fs::rename(&base, rotated_name(&base, 1));

        let state = self.state;
        match open_append(&base) {
            Ok((file, _)) => self.install(file, 0, state),
            Err(_) => self.degrade(),
        }
    }
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| MpError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| MpError::io(path, source))?;
    let size = file.metadata().map_or(0, |meta| meta.len());
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.2`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: PathBuf) -> JsonlConfig {
        JsonlConfig {
            path,
            fallback_path: None,
            max_size_bytes: 1024 * 1024,
            max_rotated_files: 3,
        }
    }

    #[test]
    fn entries_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("activity.jsonl");
        let mut writer = JsonlWriter::open(config(path.clone()));

        writer.write_entry(
            &ActivityEntry::new(EventType::CommandTimeout, Severity::Warning)
                .program("/usr/bin/zgrep")
                .exit_code(-1)
                .duration_ms(12_000),
        );
        writer.write_entry(&ActivityEntry::new(EventType::ServerStart, Severity::Info));
        writer.flush();

        let contents = fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["event"], "command_timeout");
        assert_eq!(first["severity"], "warning");
        assert_eq!(first["program"], "/usr/bin/zgrep");
        assert_eq!(first["exit_code"], -1);
    }

    #[test]
    fn unset_fields_are_omitted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sparse.jsonl");
        let mut writer = JsonlWriter::open(config(path.clone()));
        writer.write_entry(&ActivityEntry::new(EventType::ServerStop, Severity::Info));
        writer.flush();

        let line = fs::read_to_string(&path).expect("read log");
        assert!(!line.contains("\"program\""));
        assert!(!line.contains("\"endpoint\""));
    }

    #[test]
    fn error_fields_carry_code() {
        let entry = ActivityEntry::new(EventType::ApiError, Severity::Error).error(
            &MpError::Runtime {
                details: "boom".to_string(),
            },
        );
        assert_eq!(entry.error_code.as_deref(), Some("MP-3900"));
        assert!(entry.details.as_deref().is_some_and(|d| d.contains("boom")));
    }

    #[test]
    fn rotation_keeps_generations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rot.jsonl");
        let mut writer = JsonlWriter::open(JsonlConfig {
            max_size_bytes: 120,
            ..config(path.clone())
        });
        for _ in 0..10 {
            writer.write_entry(&ActivityEntry::new(EventType::ApiRequest, Severity::Info));
        }
        writer.flush();

        assert!(path.exists());
        assert!(rotated_name(&path, 1).exists());
        assert!(!rotated_name(&path, 4).exists());
    }

    #[test]
    fn falls_back_when_primary_unwritable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"file").expect("write blocker");
        let fallback = dir.path().join("fallback.jsonl");
        let mut writer = JsonlWriter::open(JsonlConfig {
            fallback_path: Some(fallback.clone()),
            ..config(blocker.join("activity.jsonl"))
        });

        assert_eq!(writer.state(), "fallback");
        writer.write_entry(&ActivityEntry::new(EventType::CommandFailed, Severity::Warning));
        writer.flush();
        assert!(!fs::read_to_string(&fallback).expect("read").is_empty());
    }

    #[test]
    fn stderr_when_nothing_writable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"file").expect("write blocker");
        let writer = JsonlWriter::open(config(blocker.join("activity.jsonl")));
        assert_eq!(writer.state(), "stderr");
    }
}
