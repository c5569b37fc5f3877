//! Most frequent senders and successful recipients over a day span.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, TimeZone};
use regex::{Regex, RegexBuilder};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::core::errors::{MpError, Result};
use crate::logs::timestamp;
use crate::source::reader::RawLine;
use crate::stats::window::{local_date, start_of_day};

const SENDER_PATTERN: &str = r"from=<([^>]+)>";
const RECIPIENT_PATTERN: &str = r"to=<([^>]+)>.+status=sent";

/// Span of local days to rank over, ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TalkerSpan {
    Day,
    Week,
    Month,
}

impl TalkerSpan {
    pub const ALL: [Self; 3] = [Self::Day, Self::Week, Self::Month];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    const fn days_back(self) -> u64 {
        match self {
            Self::Day => 0,
            Self::Week => 6,
            Self::Month => 29,
        }
    }

    /// Local midnight at the start of the span containing `now`.
    pub fn start<Tz: TimeZone>(self, now: i64, tz: &Tz) -> i64 {
        let today = local_date(tz, now);
        let first = today
            .checked_sub_days(Days::new(self.days_back()))
            .unwrap_or(today);
        start_of_day(tz, first)
    }
}

impl fmt::Display for TalkerSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TalkerSpan {
    type Err = MpError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|span| span.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MpError::UnknownWindow {
                name: s.to_string(),
            })
    }
}

/// Address counts, highest first. Serializes as an ordered JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankedCounts(pub Vec<(String, u64)>);

impl RankedCounts {
    #[must_use]
    pub fn get(&self, address: &str) -> Option<u64> {
        self.0.iter().find(|(a, _)| a == address).map(|(_, n)| *n)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(a, n)| (a.as_str(), *n))
    }
}

impl Serialize for RankedCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (address, count) in &self.0 {
            map.serialize_entry(address, count)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TalkerTable {
    pub senders: RankedCounts,
    pub recipients: RankedCounts,
}

/// Insertion-ordered tally; ties keep first-seen order after ranking.
#[derive(Default)]
struct Tally {
    slots: HashMap<String, usize>,
    counts: Vec<(String, u64)>,
}

impl Tally {
    fn add(&mut self, address: &str) {
        let address = address.trim().to_lowercase();
        if address.is_empty() {
            return;
        }
        if let Some(&slot) = self.slots.get(&address) {
            self.counts[slot].1 += 1;
        } else {
            self.slots.insert(address.clone(), self.counts.len());
            self.counts.push((address, 1));
        }
    }

    fn ranked(mut self, limit: usize) -> RankedCounts {
        self.counts.sort_by(|a, b| b.1.cmp(&a.1));
        self.counts.truncate(limit);
        RankedCounts(self.counts)
    }
}

/// Extracts envelope addresses from relevant lines.
#[derive(Debug, Clone)]
pub struct TalkerExtractor {
    sender: Regex,
    recipient: Regex,
}

impl TalkerExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            sender: compile(SENDER_PATTERN)?,
            recipient: compile(RECIPIENT_PATTERN)?,
        })
    }

    /// Rank addresses seen on lines stamped within `[start, now]`.
    pub fn tally<Tz, I>(&self, lines: I, start: i64, now: i64, limit: usize, tz: &Tz) -> TalkerTable
    where
        Tz: TimeZone,
        I: IntoIterator<Item = RawLine>,
    {
        let current_year = local_date(tz, now).year();
        let mut senders = Tally::default();
        let mut recipients = Tally::default();
        for line in lines {
            let year = line.reference_year.unwrap_or(current_year);
            let Some(ts) = timestamp::parse_in(&line.text, year, tz) else {
                continue;
            };
            if ts < start || ts > now {
                continue;
            }
            if let Some(caps) = self.sender.captures(&line.text) {
                senders.add(&caps[1]);
            }
            if let Some(caps) = self.recipient.captures(&line.text) {
                recipients.add(&caps[1]);
            }
        }
        TalkerTable {
            senders: senders.ranked(limit),
            recipients: recipients.ranked(limit),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|error| MpError::Pattern {
            pattern: pattern.to_string(),
            details: error.to_string(),
        })
}
