//! Bucketed category counts over a [`TimeWindow`].

#![allow(missing_docs)]

use chrono::TimeZone;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::logs::classifier::{Category, Classifier};
use crate::logs::timestamp;
use crate::source::reader::RawLine;
use crate::stats::window::{TimeWindow, WindowKind, day_label, local_date};

/// Labels plus one count vector per reported category.
///
/// Serializes flat: `{"labels": [...], "incoming": [...], "sent": [...]}`
/// with categories in window order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesReport {
    pub kind: WindowKind,
    pub labels: Vec<String>,
    pub series: Vec<(Category, Vec<u64>)>,
}

impl SeriesReport {
    /// Zeroed report shaped like `window`.
    pub fn empty<Tz: TimeZone>(window: &TimeWindow<Tz>) -> Self {
        let width = window.labels().len();
        Self {
            kind: window.kind(),
            labels: window.labels().to_vec(),
            series: window
                .kind()
                .categories()
                .iter()
                .map(|cat| (*cat, vec![0; width]))
                .collect(),
        }
    }

    #[must_use]
    pub fn counts(&self, category: Category) -> Option<&[u64]> {
        self.series
            .iter()
            .find(|(cat, _)| *cat == category)
            .map(|(_, counts)| counts.as_slice())
    }

    /// Sum over every bucket and category.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.series.iter().flat_map(|(_, c)| c.iter()).sum()
    }

    fn bump(&mut self, category: Category, bucket: usize) {
        if let Some((_, counts)) = self.series.iter_mut().find(|(cat, _)| *cat == category)
            && let Some(slot) = counts.get_mut(bucket)
        {
            *slot += 1;
        }
    }
}

impl Serialize for SeriesReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.series.len() + 1))?;
        map.serialize_entry("labels", &self.labels)?;
        for (category, counts) in &self.series {
            map.serialize_entry(category.as_str(), counts)?;
        }
        map.end()
    }
}

/// Count classified lines into the buckets of `window`.
///
/// Lines outside the window, without a timestamp, or in a category the
/// window does not report are ignored.
pub fn aggregate<Tz, I>(window: &TimeWindow<Tz>, classifier: &Classifier, lines: I) -> SeriesReport
where
    Tz: TimeZone,
    I: IntoIterator<Item = RawLine>,
{
    let mut report = SeriesReport::empty(window);
    let year = window.current_year();
    for line in lines {
        let Some(category) = classifier.classify(&line.text) else {
            continue;
        };
        let Some(ts) = line_timestamp(&line, year, window.tz()) else {
            continue;
        };
        if let Some(bucket) = window.bucket_of(ts) {
            report.bump(category, bucket);
        }
    }
    report
}

/// Every-category tally for the current local day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TodayStats {
    pub date: String,
    pub incoming: u64,
    pub sent: u64,
    pub failed_delivery: u64,
    pub rejected: u64,
    pub greylisted: u64,
    pub rbl_reject: u64,
    pub spam_virus: u64,
    pub quota_fail: u64,
    pub auth_fail: u64,
    /// `sent / max(1, incoming) * 100`, one decimal.
    pub success_rate: f64,
}

impl TodayStats {
    fn zero(date: String) -> Self {
        Self {
            date,
            incoming: 0,
            sent: 0,
            failed_delivery: 0,
            rejected: 0,
            greylisted: 0,
            rbl_reject: 0,
            spam_virus: 0,
            quota_fail: 0,
            auth_fail: 0,
            success_rate: 0.0,
        }
    }

    fn bump(&mut self, category: Category) {
        let slot = match category {
            Category::Incoming => &mut self.incoming,
            Category::Sent => &mut self.sent,
            Category::FailedDelivery => &mut self.failed_delivery,
            Category::Rejected => &mut self.rejected,
            Category::Greylisted => &mut self.greylisted,
            Category::RblReject => &mut self.rbl_reject,
            Category::SpamVirus => &mut self.spam_virus,
            Category::QuotaFail => &mut self.quota_fail,
            Category::AuthFail => &mut self.auth_fail,
        };
        *slot += 1;
    }

    #[must_use]
    pub fn count(&self, category: Category) -> u64 {
        match category {
            Category::Incoming => self.incoming,
            Category::Sent => self.sent,
            Category::FailedDelivery => self.failed_delivery,
            Category::Rejected => self.rejected,
            Category::Greylisted => self.greylisted,
            Category::RblReject => self.rbl_reject,
            Category::SpamVirus => self.spam_virus,
            Category::QuotaFail => self.quota_fail,
            Category::AuthFail => self.auth_fail,
        }
    }
}

/// Tally every category for the local day containing `window.now()`.
pub fn today_summary<Tz, I>(window: &TimeWindow<Tz>, classifier: &Classifier, lines: I) -> TodayStats
where
    Tz: TimeZone,
    I: IntoIterator<Item = RawLine>,
{
    let date = local_date(window.tz(), window.now());
    let mut stats = TodayStats::zero(day_label(date));
    let (start, end) = window.span();
    let year = window.current_year();
    for line in lines {
        let Some(category) = classifier.classify(&line.text) else {
            continue;
        };
        let Some(ts) = line_timestamp(&line, year, window.tz()) else {
            continue;
        };
        if (start..=end).contains(&ts) {
            stats.bump(category);
        }
    }
    stats.success_rate = success_rate(stats.sent, stats.incoming);
    stats
}

/// Percentage rounded half away from zero to one decimal.
#[must_use]
pub fn success_rate(sent: u64, incoming: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let ratio = sent as f64 / incoming.max(1) as f64;
    (ratio * 1_000.0).round() / 10.0
}

fn line_timestamp<Tz: TimeZone>(line: &RawLine, current_year: i32, tz: &Tz) -> Option<i64> {
    timestamp::parse_in(&line.text, line.reference_year.unwrap_or(current_year), tz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    // 2024-03-09T14:02:11Z
    const NOW: i64 = 1_709_992_931;

    fn classifier() -> Classifier {
        Classifier::new().expect("classifier")
    }

    fn lines(texts: &[&str]) -> Vec<RawLine> {
        texts.iter().map(|t| RawLine::new(*t)).collect()
    }

    #[test]
    fn live_counts_land_in_expected_buckets() {
        let window = TimeWindow::build(WindowKind::Live, NOW, &Utc);
        let input = lines(&[
            "Mar  9 13:02:11 mx postfix/smtp[1]: 1A: to=<a@b>, status=sent (250 ok)",
            "Mar  9 13:07:10 mx postfix/smtp[1]: 1B: to=<a@b>, status=sent (250 ok)",
            "Mar  9 14:02:11 mx postfix/smtp[1]: 1C: to=<a@b>, status=bounced (550)",
            "Mar  9 13:02:10 mx postfix/smtp[1]: 1D: to=<a@b>, status=sent (too old)",
            "Mar  9 13:30:00 mx dovecot: imap-login: Disconnected (auth failed, 1 attempts)",
        ]);
        let report = aggregate(&window, &classifier(), input);
        let sent = report.counts(Category::Sent).expect("sent series");
        assert_eq!(sent[0], 2);
        assert_eq!(sent.iter().sum::<u64>(), 2);
        assert_eq!(report.counts(Category::FailedDelivery).expect("fd")[11], 1);
        assert_eq!(report.counts(Category::AuthFail).expect("auth")[5], 1);
        assert_eq!(report.total(), 4);
    }

    #[test]
    fn lines_without_a_year_take_the_window_year() {
        let window = TimeWindow::build(WindowKind::Live, NOW, &Utc);
        let text = "Mar  9 13:30:00 mx postfix/smtp[1]: 1A: to=<a@b>, status=sent (250 ok)";
        let dated = RawLine {
            text: text.to_string(),
            reference_year: Some(2023),
        };
        let report = aggregate(&window, &classifier(), vec![RawLine::new(text), dated]);
        assert_eq!(report.counts(Category::Sent).expect("sent").iter().sum::<u64>(), 1);
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn categories_outside_window_set_are_ignored() {
        let window = TimeWindow::build(WindowKind::Month, NOW, &Utc);
        let input = lines(&[
            "Mar  9 10:00:00 mx dovecot: imap-login: Disconnected (auth failed, 1 attempts)",
            "Mar  9 10:00:00 mx postfix/cleanup[2]: 1A: message-id=<m@y>",
        ]);
        let report = aggregate(&window, &classifier(), input);
        assert!(report.counts(Category::AuthFail).is_none());
        assert_eq!(report.counts(Category::Incoming).expect("incoming")[29], 1);
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn serializes_flat_in_window_order() {
        let window = TimeWindow::build(WindowKind::Month, NOW, &Utc);
        let report = SeriesReport::empty(&window);
        let json = serde_json::to_string(&report).expect("json");
        let labels_at = json.find("\"labels\"").expect("labels");
        let incoming_at = json.find("\"incoming\"").expect("incoming");
        let sent_at = json.find("\"sent\"").expect("sent");
        let failed_at = json.find("\"failed_delivery\"").expect("failed");
        assert!(labels_at < incoming_at && incoming_at < sent_at && sent_at < failed_at);
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["labels"].as_array().map(Vec::len), Some(30));
    }

    #[test]
    fn today_summary_counts_all_categories() {
        let window = TimeWindow::build(WindowKind::Today, NOW, &Utc);
        let input = lines(&[
            "2024-03-09T08:00:00+00:00 mx postfix/cleanup[2]: 1A: message-id=<m@y>",
            "2024-03-09T08:00:01+00:00 mx postfix/cleanup[2]: 1B: message-id=<m@y>",
            "2024-03-09T08:00:02+00:00 mx postfix/cleanup[2]: 1C: message-id=<m@y>",
            "2024-03-09T08:01:00+00:00 mx postfix/smtp[1]: 1A: to=<a@b>, status=sent (250 ok)",
            "2024-03-09T08:01:00+00:00 mx postfix/smtp[1]: 1B: to=<a@b>, status=sent (250 ok)",
            "2024-03-09T09:00:00+00:00 mx postfix/smtpd[3]: NOQUEUE: reject: RCPT from x[1.2.3.4]: 450 4.2.0 Greylisted",
            "2024-03-08T23:59:59+00:00 mx postfix/smtp[1]: 1Z: to=<a@b>, status=sent (yesterday)",
        ]);
        let stats = today_summary(&window, &classifier(), input);
        assert_eq!(stats.date, "Mar 9");
        assert_eq!(stats.incoming, 3);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.greylisted, 1);
        assert!((stats.success_rate - 66.7).abs() < f64::EPSILON);
    }

    #[test]
    fn success_rate_guards_zero_incoming() {
        assert!((success_rate(5, 0) - 500.0).abs() < f64::EPSILON);
        assert!((success_rate(0, 0)).abs() < f64::EPSILON);
        assert!((success_rate(1, 8) - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn today_stats_serializes_fixed_key_order() {
        let window = TimeWindow::build(WindowKind::Today, NOW, &Utc);
        let stats = today_summary(&window, &classifier(), Vec::new());
        let json = serde_json::to_string(&stats).expect("json");
        assert!(json.starts_with("{\"date\":\"Mar 9\",\"incoming\":0,\"sent\":0"));
        assert!(json.ends_with("\"auth_fail\":0,\"success_rate\":0.0}"));
    }
}
