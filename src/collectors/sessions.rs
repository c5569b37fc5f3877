//! IMAP / POP3 session counts.
//!
//! `doveadm who` is authoritative when it answers. Otherwise established
//! TCP connections on the standard mail ports are counted with `ss`.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::config::Config;
use crate::platform::exec::CommandRunner;

const IMAP_PORTS: [u16; 2] = [993, 143];
const POP3_PORTS: [u16; 2] = [995, 110];

/// Which probe produced the counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionProbe {
    Doveadm,
    SocketStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub imap: u64,
    pub pop3: u64,
    pub total: u64,
    pub via: SessionProbe,
}

impl SessionCounts {
    const fn new(imap: u64, pop3: u64, via: SessionProbe) -> Self {
        Self {
            imap,
            pop3,
            total: imap + pop3,
            via,
        }
    }
}

/// Count `doveadm who` rows mentioning each protocol.
#[must_use]
pub fn parse_who(listing: &str) -> (u64, u64) {
    let mut imap = 0;
    let mut pop3 = 0;
    for line in listing.trim().lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("imap") {
            imap += 1;
        }
        if lower.contains("pop3") {
            pop3 += 1;
        }
    }
    (imap, pop3)
}

/// Connection rows in `ss -tn` output: newlines minus the header.
#[must_use]
pub fn count_socket_rows(output: &str) -> u64 {
    let newlines = output.bytes().filter(|b| *b == b'\n').count();
    u64::try_from(newlines.saturating_sub(1)).unwrap_or(0)
}

pub struct SessionCollector {
    runner: Arc<dyn CommandRunner>,
    doveadm: String,
    ss: String,
    who_timeout: Duration,
    ss_timeout: Duration,
}

impl SessionCollector {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            doveadm: config.binaries.doveadm.display().to_string(),
            ss: config.binaries.ss.display().to_string(),
            who_timeout: config.timeouts.sessions(),
            ss_timeout: config.timeouts.socket_stats(),
        }
    }

    pub fn collect(&self) -> SessionCounts {
        let who = self.runner.run(&[self.doveadm.as_str(), "who"], self.who_timeout);
        if who.success() && !who.stdout.trim().is_empty() {
            let (imap, pop3) = parse_who(&who.stdout);
            return SessionCounts::new(imap, pop3, SessionProbe::Doveadm);
        }
        let imap = IMAP_PORTS.iter().map(|port| self.established_on(*port)).sum();
        let pop3 = POP3_PORTS.iter().map(|port| self.established_on(*port)).sum();
        SessionCounts::new(imap, pop3, SessionProbe::SocketStats)
    }

    fn established_on(&self, port: u16) -> u64 {
        let sport = format!(":{port}");
        let output = self.runner.run(
            &[self.ss.as_str(), "-tn", "state", "established", "sport", "=", sport.as_str()],
            self.ss_timeout,
        );
        if output.success() {
            count_socket_rows(&output.stdout)
        } else {
            0
        }
    }
}
