#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_mailpulse") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) {
        "mailpulse.exe"
    } else {
        "mailpulse"
    };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve mailpulse binary path for integration test"),
    }
}

/// Run the binary with `args`, in UTC, keeping a transcript for post-mortems.
pub fn run_cli_case(case_name: &str, args: &[&str], env: &[(&str, &str)]) -> CmdResult {
    let root = std::env::temp_dir().join("mailpulse-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env("TZ", "UTC")
        .env("RUST_BACKTRACE", "1")
        .env_remove("MAILPULSE_OUTPUT_FORMAT");
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command.output().expect("execute mailpulse command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Config that reads `<dir>/mail.log*`, caches under `<dir>/cache` and never escalates.
pub fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("mailpulse.toml");
    let body = format!(
        r#"[sources]
log_globs = ["{dir}/mail.log*"]
journal_units = []

[binaries]
journalctl = "{dir}/no-journalctl"
postqueue = "{dir}/no-postqueue"
doveadm = "{dir}/no-doveadm"
ss = "{dir}/no-ss"

[privilege]
escalate = false

[paths]
cache_dir = "{dir}/cache"
activity_log = "{dir}/activity.jsonl"
"#,
        dir = dir.display()
    );
    fs::write(&path, body).expect("write config");
    path
}

/// ISO-8601 UTC prefix for `ts`, as rsyslog's high-precision format writes it.
pub fn iso_prefix(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .expect("valid timestamp")
        .format("%Y-%m-%dT%H:%M:%S%.6f+00:00")
        .to_string()
}

pub fn now_secs() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs()),
    )
    .unwrap_or(i64::MAX)
}

/// A small burst of postfix traffic stamped at `ts`.
///
/// Classifies as incoming 2, sent 1, failed_delivery 1, rejected 1 and
/// auth_fail 1. The qmgr and anvil lines are filtered out as irrelevant.
pub fn sample_traffic(ts: i64) -> String {
    let p = iso_prefix(ts);
    [
        format!("{p} mx postfix/cleanup[10]: 1A2B3C4D5E: message-id=<a@example.com>"),
        format!("{p} mx postfix/qmgr[11]: 1A2B3C4D5E: from=<Alice@Example.com>, size=900, nrcpt=1 (queue active)"),
        format!("{p} mx postfix/smtp[12]: 1A2B3C4D5E: to=<bob@example.org>, relay=mx.example.org[192.0.2.5]:25, delay=1, status=sent (250 ok)"),
        format!("{p} mx postfix/cleanup[10]: 2B3C4D5E6F: message-id=<b@example.com>"),
        format!("{p} mx postfix/smtp[12]: 2B3C4D5E6F: to=<carol@example.net>, status=bounced (user unknown)"),
        format!("{p} mx postfix/smtpd[13]: NOQUEUE: reject: RCPT from unknown[198.51.100.9]: 554 5.7.1 Service unavailable; Client host blocked using zen.spamhaus.org; from=<spam@bad.example> to=<bob@example.org> proto=ESMTP helo=<bad>"),
        format!("{p} mx postfix/smtpd[13]: warning: unknown[203.0.113.4]: SASL LOGIN authentication failed: UGFzc3dvcmQ6"),
        format!("{p} mx postfix/anvil[14]: statistics: max connection rate 1/60s"),
    ]
    .join("\n")
        + "\n"
}
