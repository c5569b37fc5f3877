//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{MpError, Result};

/// Full mailpulse configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub sources: SourcesConfig,
    pub binaries: BinariesConfig,
    pub privilege: PrivilegeConfig,
    pub timeouts: TimeoutsConfig,
    pub thresholds: ThresholdsConfig,
    pub talkers: TalkersConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
}

/// Where mail log data is discovered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourcesConfig {
    /// Glob patterns in priority order; the first pattern with files wins.
    pub log_globs: Vec<String>,
    /// Service units queried when falling back to the journal.
    pub journal_units: Vec<String>,
    /// Seconds a resolved source decision stays fresh.
    pub detect_refresh_secs: u64,
    /// Number of trailing journal entries requested per query.
    pub journal_max_entries: usize,
}

/// Absolute paths of the external programs the probes run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BinariesConfig {
    pub grep: PathBuf,
    pub zgrep: PathBuf,
    pub journalctl: PathBuf,
    pub postqueue: PathBuf,
    pub doveadm: PathBuf,
    pub ss: PathBuf,
}

/// Non-interactive privilege escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrivilegeConfig {
    /// Master switch; when false commands run with the caller's privileges.
    pub escalate: bool,
    /// Escalation program, e.g. `sudo`.
    pub program: PathBuf,
    /// Arguments placed between the program and the wrapped command.
    pub args: Vec<String>,
}

/// Wall-clock bounds for every external command, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub default_secs: u64,
    pub archive_filter_secs: u64,
    pub journal_query_secs: u64,
    pub queue_secs: u64,
    pub sessions_secs: u64,
    pub socket_stats_secs: u64,
    /// Liveness polling interval of the executor.
    pub poll_interval_ms: u64,
    /// Time a terminated child gets before it is killed outright.
    pub kill_grace_ms: u64,
}

/// Alert thresholds served to the dashboard through the `config` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub auth_fail_warn: u64,
    pub auth_fail_attack: u64,
    pub queue_warn: u64,
    pub queue_high: u64,
    pub stale_log_minutes: u64,
}

/// Top-talker table settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TalkersConfig {
    pub limit: usize,
}

/// HTTP API listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

/// Filesystem paths used by mailpulse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub cache_dir: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            log_globs: vec![
                "/var/log/mail.log*".to_string(),
                "/var/log/maillog*".to_string(),
                "/var/log/mail/*.log*".to_string(),
            ],
            journal_units: vec!["postfix".to_string(), "dovecot".to_string()],
            detect_refresh_secs: 3_600,
            journal_max_entries: 20_000,
        }
    }
}

impl Default for BinariesConfig {
    fn default() -> Self {
        Self {
            grep: PathBuf::from("/usr/bin/grep"),
            zgrep: PathBuf::from("/usr/bin/zgrep"),
            journalctl: PathBuf::from("/usr/bin/journalctl"),
            postqueue: PathBuf::from("/usr/sbin/postqueue"),
            doveadm: PathBuf::from("/usr/bin/doveadm"),
            ss: PathBuf::from("/usr/bin/ss"),
        }
    }
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            escalate: true,
            program: PathBuf::from("/usr/bin/sudo"),
            args: vec!["-n".to_string()],
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            default_secs: 15,
            archive_filter_secs: 12,
            journal_query_secs: 10,
            queue_secs: 8,
            sessions_secs: 5,
            socket_stats_secs: 4,
            poll_interval_ms: 100,
            kill_grace_ms: 500,
        }
    }
}

impl TimeoutsConfig {
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_secs)
    }

    #[must_use]
    pub const fn archive_filter(&self) -> Duration {
        Duration::from_secs(self.archive_filter_secs)
    }

    #[must_use]
    pub const fn journal_query(&self) -> Duration {
        Duration::from_secs(self.journal_query_secs)
    }

    #[must_use]
    pub const fn queue(&self) -> Duration {
        Duration::from_secs(self.queue_secs)
    }

    #[must_use]
    pub const fn sessions(&self) -> Duration {
        Duration::from_secs(self.sessions_secs)
    }

    #[must_use]
    pub const fn socket_stats(&self) -> Duration {
        Duration::from_secs(self.socket_stats_secs)
    }
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            auth_fail_warn: 50,
            auth_fail_attack: 300,
            queue_warn: 20,
            queue_high: 200,
            stale_log_minutes: 15,
        }
    }
}

impl Default for TalkersConfig {
    fn default() -> Self {
        Self { limit: 10 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7878".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[MP-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("mailpulse").join("config.toml");
        let data = home_dir.join(".local").join("share").join("mailpulse");
        Self {
            config_file: cfg,
            cache_dir: data.join("cache"),
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| MpError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(MpError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the activity log.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // sources
        if let Some(raw) = lookup("MAILPULSE_LOG_GLOBS") {
            self.sources.log_globs = split_list(&raw);
        }
        if let Some(raw) = lookup("MAILPULSE_JOURNAL_UNITS") {
            self.sources.journal_units = split_list(&raw);
        }
        if let Some(raw) = lookup("MAILPULSE_DETECT_REFRESH_SECS") {
            self.sources.detect_refresh_secs = parse_env("MAILPULSE_DETECT_REFRESH_SECS", &raw)?;
        }
        if let Some(raw) = lookup("MAILPULSE_JOURNAL_MAX_ENTRIES") {
            self.sources.journal_max_entries =
                parse_env("MAILPULSE_JOURNAL_MAX_ENTRIES", &raw)?;
        }
        // privilege
        if let Some(raw) = lookup("MAILPULSE_ESCALATE") {
            self.privilege.escalate = parse_env("MAILPULSE_ESCALATE", &raw)?;
        }
        if let Some(raw) = lookup("MAILPULSE_ESCALATION_PROGRAM") {
            self.privilege.program = PathBuf::from(raw);
        }
        // timeouts
        if let Some(raw) = lookup("MAILPULSE_TIMEOUT_DEFAULT_SECS") {
            self.timeouts.default_secs = parse_env("MAILPULSE_TIMEOUT_DEFAULT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("MAILPULSE_TIMEOUT_ARCHIVE_FILTER_SECS") {
            self.timeouts.archive_filter_secs =
                parse_env("MAILPULSE_TIMEOUT_ARCHIVE_FILTER_SECS", &raw)?;
        }
        if let Some(raw) = lookup("MAILPULSE_TIMEOUT_JOURNAL_QUERY_SECS") {
            self.timeouts.journal_query_secs =
                parse_env("MAILPULSE_TIMEOUT_JOURNAL_QUERY_SECS", &raw)?;
        }
        // talkers / server / paths
        if let Some(raw) = lookup("MAILPULSE_TALKERS_LIMIT") {
            self.talkers.limit = parse_env("MAILPULSE_TALKERS_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("MAILPULSE_BIND") {
            self.server.bind = raw;
        }
        if let Some(raw) = lookup("MAILPULSE_CACHE_DIR") {
            self.paths.cache_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("MAILPULSE_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sources.log_globs.is_empty() && self.sources.journal_units.is_empty() {
            return Err(MpError::InvalidConfig {
                details: "sources.log_globs and sources.journal_units cannot both be empty"
                    .to_string(),
            });
        }
        for pattern in &self.sources.log_globs {
            glob::Pattern::new(pattern).map_err(|error| MpError::Pattern {
                pattern: pattern.clone(),
                details: error.to_string(),
            })?;
        }
        if self.sources.detect_refresh_secs == 0 {
            return Err(MpError::InvalidConfig {
                details: "sources.detect_refresh_secs must be > 0".to_string(),
            });
        }
        if self.sources.journal_max_entries == 0 {
            return Err(MpError::InvalidConfig {
                details: "sources.journal_max_entries must be > 0".to_string(),
            });
        }
        for (name, secs) in [
            ("default_secs", self.timeouts.default_secs),
            ("archive_filter_secs", self.timeouts.archive_filter_secs),
            ("journal_query_secs", self.timeouts.journal_query_secs),
            ("queue_secs", self.timeouts.queue_secs),
            ("sessions_secs", self.timeouts.sessions_secs),
            ("socket_stats_secs", self.timeouts.socket_stats_secs),
        ] {
            if secs == 0 {
                return Err(MpError::InvalidConfig {
                    details: format!("timeouts.{name} must be > 0"),
                });
            }
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err(MpError::InvalidConfig {
                details: "timeouts.poll_interval_ms must be > 0".to_string(),
            });
        }
        if self.thresholds.auth_fail_warn >= self.thresholds.auth_fail_attack {
            return Err(MpError::InvalidConfig {
                details: "thresholds.auth_fail_warn must be < thresholds.auth_fail_attack"
                    .to_string(),
            });
        }
        if self.thresholds.queue_warn >= self.thresholds.queue_high {
            return Err(MpError::InvalidConfig {
                details: "thresholds.queue_warn must be < thresholds.queue_high".to_string(),
            });
        }
        if self.talkers.limit == 0 {
            return Err(MpError::InvalidConfig {
                details: "talkers.limit must be >= 1".to_string(),
            });
        }
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(MpError::InvalidConfig {
                details: format!("server.bind {:?} is not a socket address", self.server.bind),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| MpError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

#[cfg(test)]
mod tests {
    use super::{Config, MpError};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_match_dashboard_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.sources.detect_refresh_secs, 3_600);
        assert_eq!(cfg.sources.journal_max_entries, 20_000);
        assert_eq!(cfg.sources.log_globs[0], "/var/log/mail.log*");
        assert_eq!(cfg.timeouts.archive_filter_secs, 12);
        assert_eq!(cfg.timeouts.poll_interval_ms, 100);
        assert_eq!(cfg.talkers.limit, 10);
        assert_eq!(cfg.privilege.args, vec!["-n".to_string()]);
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let hash_before = cfg.stable_hash().expect("hash should compute");
        let mut modified = Config::default();
        modified.talkers.limit += 1;
        let hash_after = modified.stable_hash().expect("hash should compute");
        assert_ne!(hash_before, hash_after);
    }

    #[test]
    fn thresholds_must_ascend() {
        let mut cfg = Config::default();
        cfg.thresholds.queue_warn = cfg.thresholds.queue_high;
        let err = cfg.validate().expect_err("expected validation error");
        assert!(err.to_string().contains("queue_warn"));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let mut cfg = Config::default();
        cfg.sources.log_globs = vec!["/var/log/[mail".to_string()];
        let err = cfg.validate().expect_err("expected glob error");
        assert_eq!(err.code(), "MP-2001");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut cfg = Config::default();
        cfg.timeouts.queue_secs = 0;
        let err = cfg.validate().expect_err("expected timeout error");
        assert!(err.to_string().contains("timeouts.queue_secs"));
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let mut cfg = Config::default();
        cfg.server.bind = "localhost".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env = vars(&[
            ("MAILPULSE_LOG_GLOBS", "/srv/log/mail*, /tmp/maillog*"),
            ("MAILPULSE_ESCALATE", "false"),
            ("MAILPULSE_TALKERS_LIMIT", "25"),
            ("MAILPULSE_CACHE_DIR", "/run/mailpulse"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .expect("overrides should parse");
        assert_eq!(
            cfg.sources.log_globs,
            vec!["/srv/log/mail*".to_string(), "/tmp/maillog*".to_string()]
        );
        assert!(!cfg.privilege.escalate);
        assert_eq!(cfg.talkers.limit, 25);
        assert_eq!(cfg.paths.cache_dir, PathBuf::from("/run/mailpulse"));
    }

    #[test]
    fn env_override_parse_failure_is_config_parse() {
        let env = vars(&[("MAILPULSE_DETECT_REFRESH_SECS", "soon")]);
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .expect_err("non-numeric refresh should fail");
        match err {
            MpError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("MAILPULSE_DETECT_REFRESH_SECS"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[thresholds]\nqueue_warn = 5\nqueue_high = 50\n\n[server]\nbind = \"0.0.0.0:9000\"\n",
        )
        .expect("write config");
        let cfg = Config::load(Some(&path)).expect("config should load");
        assert_eq!(cfg.thresholds.queue_warn, 5);
        assert_eq!(cfg.thresholds.auth_fail_warn, 50);
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn explicit_missing_path_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/mailpulse/config.toml")))
            .expect_err("missing explicit config should fail");
        assert_eq!(err.code(), "MP-1002");
    }
}
