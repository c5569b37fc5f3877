//! Leading-timestamp extraction for syslog and journal lines.
//!
//! Two shapes are recognised at the very start of a line:
//! - ISO-8601 with an explicit offset (`2024-03-09T14:02:11.503+01:00`,
//!   `...+0100`, `...Z`), as written by rsyslog high-precision templates and
//!   `journalctl -o short-iso`.
//! - Classic BSD syslog (`Mar  9 14:02:11`), which carries no year and no zone.
//!   It is read in the given zone with a caller-supplied year.

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Epoch seconds of the line's leading timestamp, reading classic lines in
/// the local zone as `assumed_year`.
pub fn parse(line: &str, assumed_year: i32) -> Option<i64> {
    parse_in(line, assumed_year, &Local)
}

/// Calendar year of `ts` in `tz`, the year assumed for classic stamps.
pub fn year_at<Tz: TimeZone>(ts: i64, tz: &Tz) -> i32 {
    DateTime::from_timestamp(ts, 0)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .with_timezone(tz)
        .year()
}

/// Zone-generic form of [`parse`].
pub fn parse_in<Tz: TimeZone>(line: &str, assumed_year: i32, tz: &Tz) -> Option<i64> {
    parse_iso(line).or_else(|| parse_classic(line, assumed_year, tz))
}

fn parse_iso(line: &str) -> Option<i64> {
    if line.len() < 20 || !line.as_bytes().get(4).is_some_and(|b| *b == b'-') {
        return None;
    }
    let (naive, rest) = NaiveDateTime::parse_and_remainder(line, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    let offset = parse_offset(rest)?;
    Some(naive.and_local_timezone(offset).single()?.timestamp())
}

/// `Z`, `±HH:MM` or `±HHMM` at the start of `rest`.
fn parse_offset(rest: &str) -> Option<FixedOffset> {
    let bytes = rest.as_bytes();
    match bytes.first()? {
        b'Z' => FixedOffset::east_opt(0),
        sign @ (b'+' | b'-') => {
            let digits: Vec<u8> = if bytes.get(3) == Some(&b':') {
                [bytes.get(1..3)?, bytes.get(4..6)?].concat()
            } else {
                bytes.get(1..5)?.to_vec()
            };
            if !digits.iter().all(u8::is_ascii_digit) {
                return None;
            }
            let value = |i: usize| i32::from(digits[i] - b'0');
            let hours = value(0) * 10 + value(1);
            let minutes = value(2) * 10 + value(3);
            if minutes >= 60 {
                return None;
            }
            let secs = hours * 3_600 + minutes * 60;
            if *sign == b'+' {
                FixedOffset::east_opt(secs)
            } else {
                FixedOffset::west_opt(secs)
            }
        }
        _ => None,
    }
}

fn parse_classic<Tz: TimeZone>(line: &str, year: i32, tz: &Tz) -> Option<i64> {
    let month_name = line.get(..3)?;
    let month = MONTHS.iter().position(|m| *m == month_name)?;
    let mut fields = line.get(3..)?;
    if !fields.starts_with(char::is_whitespace) {
        return None;
    }
    fields = fields.trim_start();

    let day_len = fields.find(|c: char| !c.is_ascii_digit())?;
    if !(1..=2).contains(&day_len) {
        return None;
    }
    let day: u32 = fields[..day_len].parse().ok()?;
    fields = &fields[day_len..];
    if !fields.starts_with(char::is_whitespace) {
        return None;
    }
    fields = fields.trim_start();

    let clock = fields.get(..8)?.as_bytes();
    if clock[2] != b':' || clock[5] != b':' {
        return None;
    }
    let two = |i: usize| -> Option<u32> {
        let (a, b) = (clock[i], clock[i + 1]);
        (a.is_ascii_digit() && b.is_ascii_digit()).then(|| u32::from(a - b'0') * 10 + u32::from(b - b'0'))
    };
    let naive = NaiveDate::from_ymd_opt(year, u32::try_from(month + 1).ok()?, day)?
        .and_hms_opt(two(0)?, two(3)?, two(6)?)?;
    Some(tz.from_local_datetime(&naive).earliest()?.timestamp())
}
