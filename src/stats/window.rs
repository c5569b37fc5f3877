//! Time windows: ordered, inclusive bucket bounds plus labels.
//!
//! All four window shapes share one type and one lookup. They differ only in
//! how the bounds are laid out and which categories they report.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::core::errors::MpError;
use crate::logs::classifier::Category;

const LIVE_SPAN_SECS: i64 = 3_600;
const LIVE_BUCKET_SECS: i64 = 300;
const LIVE_BUCKETS: usize = 12;

const MONTH_ABBR: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// The four aggregation granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Last hour in 5-minute buckets.
    Live,
    /// Current local day by hour.
    Today,
    /// Trailing 7 local days.
    Week,
    /// Trailing 30 local days.
    Month,
}

impl WindowKind {
    pub const ALL: [Self; 4] = [Self::Live, Self::Today, Self::Week, Self::Month];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Today => "today",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// Categories reported for this window, in output order.
    #[must_use]
    pub const fn categories(self) -> &'static [Category] {
        const LIVE: [Category; 7] = [
            Category::Incoming,
            Category::Sent,
            Category::FailedDelivery,
            Category::QuotaFail,
            Category::Rejected,
            Category::SpamVirus,
            Category::AuthFail,
        ];
        const DAILY: [Category; 6] = [
            Category::Incoming,
            Category::Sent,
            Category::FailedDelivery,
            Category::QuotaFail,
            Category::Rejected,
            Category::SpamVirus,
        ];
        const MONTH: [Category; 3] = [Category::Incoming, Category::Sent, Category::FailedDelivery];
        match self {
            Self::Live => &LIVE,
            Self::Today | Self::Week => &DAILY,
            Self::Month => &MONTH,
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowKind {
    type Err = MpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MpError::UnknownWindow {
                name: s.to_string(),
            })
    }
}

/// Bucketed span of time anchored at `now` in zone `Tz`.
#[derive(Debug, Clone)]
pub struct TimeWindow<Tz: TimeZone> {
    kind: WindowKind,
    labels: Vec<String>,
    bounds: Vec<(i64, i64)>,
    now: i64,
    tz: Tz,
}

impl<Tz: TimeZone> TimeWindow<Tz> {
    /// Lay out the window of `kind` ending at `now` (epoch seconds).
    pub fn build(kind: WindowKind, now: i64, tz: &Tz) -> Self {
        let (labels, bounds) = match kind {
            WindowKind::Live => live_layout(now, tz),
            WindowKind::Today => today_layout(now, tz),
            WindowKind::Week => daily_layout(now, 7, tz),
            WindowKind::Month => daily_layout(now, 30, tz),
        };
        Self {
            kind,
            labels,
            bounds,
            now,
            tz: tz.clone(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> WindowKind {
        self.kind
    }

    #[must_use]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Inclusive `(start, end)` per bucket, one per label.
    #[must_use]
    pub fn bounds(&self) -> &[(i64, i64)] {
        &self.bounds
    }

    #[must_use]
    pub const fn now(&self) -> i64 {
        self.now
    }

    #[must_use]
    pub const fn tz(&self) -> &Tz {
        &self.tz
    }

    /// First bucket start and last bucket end.
    #[must_use]
    pub fn span(&self) -> (i64, i64) {
        let start = self.bounds.first().map_or(self.now, |b| b.0);
        let end = self.bounds.last().map_or(self.now, |b| b.1);
        (start, end)
    }

    /// Calendar year of `now` in the window's zone.
    #[must_use]
    pub fn current_year(&self) -> i32 {
        to_local(&self.tz, self.now).map_or(1970, |dt| dt.year())
    }

    /// Bucket holding `ts`, or `None` outside the window.
    #[must_use]
    pub fn bucket_of(&self, ts: i64) -> Option<usize> {
        let (start, end) = self.span();
        if ts < start || ts > end {
            return None;
        }
        match self.kind {
            WindowKind::Live => {
                let idx = usize::try_from((ts - start) / LIVE_BUCKET_SECS).ok()?;
                Some(idx.min(self.bounds.len().saturating_sub(1)))
            }
            WindowKind::Today => {
                let hour = usize::try_from(to_local(&self.tz, ts)?.hour()).ok()?;
                (hour < self.bounds.len()).then_some(hour)
            }
            WindowKind::Week | WindowKind::Month => self
                .bounds
                .iter()
                .position(|(lo, hi)| (*lo..=*hi).contains(&ts)),
        }
    }
}

fn live_layout<Tz: TimeZone>(now: i64, tz: &Tz) -> (Vec<String>, Vec<(i64, i64)>) {
    let start = now - LIVE_SPAN_SECS;
    let mut labels = Vec::with_capacity(LIVE_BUCKETS);
    let mut bounds = Vec::with_capacity(LIVE_BUCKETS);
    for i in 0..LIVE_BUCKETS {
        let offset = i64::try_from(i).unwrap_or(0) * LIVE_BUCKET_SECS;
        let lo = start + offset;
        let hi = if i + 1 == LIVE_BUCKETS {
            now
        } else {
            lo + LIVE_BUCKET_SECS - 1
        };
        labels.push(
            to_local(tz, lo).map_or_else(String::new, |dt| format!("{:02}:{:02}", dt.hour(), dt.minute())),
        );
        bounds.push((lo, hi));
    }
    (labels, bounds)
}

fn today_layout<Tz: TimeZone>(now: i64, tz: &Tz) -> (Vec<String>, Vec<(i64, i64)>) {
    let today = local_date(tz, now);
    let mut starts: Vec<i64> = (0..24)
        .map(|hour| local_instant(tz, today, hour))
        .collect();
    starts.push(start_of_day(tz, today.succ_opt().unwrap_or(today)));
    // Hours skipped by a DST jump start where the next hour starts.
    for i in (0..24).rev() {
        starts[i] = starts[i].min(starts[i + 1]);
    }
    let labels = (0..24).map(|hour| format!("{hour:02}:00")).collect();
    let bounds = starts
        .windows(2)
        .map(|pair| (pair[0], (pair[1] - 1).max(pair[0])))
        .collect();
    (labels, bounds)
}

fn daily_layout<Tz: TimeZone>(now: i64, days: u64, tz: &Tz) -> (Vec<String>, Vec<(i64, i64)>) {
    let today = local_date(tz, now);
    let mut labels = Vec::new();
    let mut bounds = Vec::new();
    for back in (0..days).rev() {
        let Some(date) = today.checked_sub_days(Days::new(back)) else {
            continue;
        };
        let lo = start_of_day(tz, date);
        let hi = if back == 0 {
            now
        } else {
            start_of_day(tz, date.succ_opt().unwrap_or(date)) - 1
        };
        labels.push(day_label(date));
        bounds.push((lo, hi));
    }
    (labels, bounds)
}

/// `Mar 9` style label.
#[must_use]
pub fn day_label(date: NaiveDate) -> String {
    format!("{} {}", MONTH_ABBR[date.month0() as usize], date.day())
}

/// Local calendar date of `ts` in `tz`.
pub fn local_date<Tz: TimeZone>(tz: &Tz, ts: i64) -> NaiveDate {
    to_local(tz, ts).map_or_else(
        || DateTime::from_timestamp(ts, 0).map_or(NaiveDate::MIN, |dt| dt.date_naive()),
        |dt| dt.date_naive(),
    )
}

/// Epoch seconds of local midnight on `date`. When midnight falls into a
/// DST gap, the first existing instant of the day is used.
pub fn start_of_day<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> i64 {
    local_instant(tz, date, 0)
}

fn local_instant<Tz: TimeZone>(tz: &Tz, date: NaiveDate, hour: u32) -> i64 {
    let mut minutes = hour * 60;
    let limit = minutes + 180;
    while minutes < limit && minutes < 24 * 60 {
        if let Some(time) = NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0)
            && let Some(dt) = tz.from_local_datetime(&date.and_time(time)).earliest()
        {
            return dt.timestamp();
        }
        minutes += 15;
    }
    date.and_hms_opt(hour.min(23), 0, 0)
        .map_or(0, |naive| naive.and_utc().timestamp())
}

fn to_local<Tz: TimeZone>(tz: &Tz, ts: i64) -> Option<DateTime<Tz>> {
    tz.timestamp_opt(ts, 0).earliest()
}
