// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Parses the `from`/`until` query parameters accepted by the render handlers.
//!
//! Out of scope per the core's external interfaces: the Graphite function library's own
//! relative-interval grammar (`-5min`, `-2h`, ...) used elsewhere to express durations. Here we
//! only need the small subset of that grammar that appears as a leading `-` in a date parameter.

use chrono::{Datelike, Duration, NaiveDate, TimeZone};
use chrono_tz::Tz;

/// Parse a single relative offset of the form `-<number><unit>`, where unit is one of
/// `s|min|h|d|w|mon|y`, returning the offset in seconds (negative, since these are always
/// "ago").
fn parse_relative_offset_secs(s: &str) -> Option<i64> {
    let body = s.strip_prefix('-')?;
    let split_at = body.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = body.split_at(split_at);
    let amount: i64 = digits.parse().ok()?;
    let unit_secs: i64 = match unit {
        "s" => 1,
        "min" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 86400 * 7,
        "mon" => 86400 * 30,
        "y" => 86400 * 365,
        _ => return None,
    };
    Some(-(amount * unit_secs))
}

/// midnight/noon/teatime/"HH:MM" to (hour, minute).
fn parse_time(s: &str) -> Option<(u32, u32)> {
    match s {
        "midnight" => return Some((0, 0)),
        "noon" => return Some((12, 0)),
        "teatime" => return Some((16, 0)),
        _ => {}
    }
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

const DATE_FORMATS: &[&str] = &["%Y%m%d", "%m/%d/%y"];

/// Convert a Graphite-style date/time parameter into epoch seconds.
///
/// `default_epoch` is returned verbatim whenever `s` is empty or fails to parse, mirroring the
/// original's fail-soft behavior (a malformed `from`/`until` silently falls back to the caller's
/// default rather than erroring the whole request).
pub fn date_param_to_epoch(
    s: &str,
    qtz: Option<&str>,
    default_epoch: i64,
    default_tz: Tz,
    now: chrono::DateTime<chrono::Utc>,
) -> i32 {
    if s.is_empty() {
        return default_epoch as i32;
    }

    if let Some(offset_secs) = parse_relative_offset_secs(s) {
        return (now.timestamp() + offset_secs) as i32;
    }

    match s {
        "now" => return now.timestamp() as i32,
        "midnight" | "noon" | "teatime" => {
            let (hour, minute) = parse_time(s).expect("validated above");
            let local_now = now.with_timezone(&default_tz);
            let dt = default_tz
                .with_ymd_and_hms(
                    local_now.year(),
                    local_now.month(),
                    local_now.day(),
                    hour,
                    minute,
                    0,
                )
                .single();
            return dt.map(|d| d.timestamp() as i32).unwrap_or(default_epoch as i32);
        }
        _ => {}
    }

    // A bare epoch timestamp: length > 8 distinguishes it from an 8-digit YYYYMMDD date string.
    if s.len() > 8 {
        if let Ok(epoch) = s.parse::<i64>() {
            return epoch as i32;
        }
    }

    let s = s.replacen('_', " ", 1);
    let split: Vec<&str> = s.split_whitespace().collect();
    let (time_part, date_part) = match split.len() {
        1 => (None, split[0]),
        2 => (Some(split[0]), split[1]),
        _ => return default_epoch as i32,
    };

    let tz = qtz
        .and_then(|z| z.parse::<Tz>().ok())
        .unwrap_or(default_tz);

    let local_now = now.with_timezone(&tz);
    let date = match date_part {
        "today" => local_now.date_naive(),
        "yesterday" => local_now.date_naive() - Duration::days(1),
        "tomorrow" => local_now.date_naive() + Duration::days(1),
        _ => match parse_date(date_part) {
            Some(d) => d,
            None => return default_epoch as i32,
        },
    };

    let (hour, minute) = time_part.and_then(parse_time).unwrap_or((0, 0));
    match default_tz
        .with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
        .single()
    {
        Some(dt) => dt.timestamp() as i32,
        None => default_epoch as i32,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> chrono::DateTime<chrono::Utc> {
        // 2020-06-15 12:30:00 UTC
        chrono::Utc.with_ymd_and_hms(2020, 6, 15, 12, 30, 0).unwrap()
    }

    #[test]
    fn empty_returns_default() {
        assert_eq!(date_param_to_epoch("", None, 42, Tz::UTC, fixed_now()), 42);
    }

    #[test]
    fn now_returns_current_epoch() {
        let now = fixed_now();
        assert_eq!(date_param_to_epoch("now", None, 0, Tz::UTC, now), now.timestamp() as i32);
    }

    #[test]
    fn relative_offset() {
        let now = fixed_now();
        let got = date_param_to_epoch("-1h", None, 0, Tz::UTC, now);
        assert_eq!(got as i64, now.timestamp() - 3600);
    }

    #[test]
    fn midnight_today() {
        let now = fixed_now();
        let got = date_param_to_epoch("midnight", None, 0, Tz::UTC, now);
        let expected = Tz::UTC.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();
        assert_eq!(got as i64, expected.timestamp());
    }

    #[test]
    fn yesterday_with_time() {
        let now = fixed_now();
        let got = date_param_to_epoch("10:00_yesterday", None, 0, Tz::UTC, now);
        let expected = Tz::UTC.with_ymd_and_hms(2020, 6, 14, 10, 0, 0).unwrap();
        assert_eq!(got as i64, expected.timestamp());
    }

    #[test]
    fn epoch_timestamp_passthrough() {
        // Longer than 8 chars, so treated as a raw epoch rather than YYYYMMDD.
        assert_eq!(date_param_to_epoch("1592220600", None, 0, Tz::UTC, fixed_now()), 1592220600);
    }

    #[test]
    fn yyyymmdd_date_string() {
        let got = date_param_to_epoch("20200101", None, 0, Tz::UTC, fixed_now());
        let expected = Tz::UTC.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(got as i64, expected.timestamp());
    }

    #[test]
    fn slash_date_string() {
        let got = date_param_to_epoch("01/02/06", None, 0, Tz::UTC, fixed_now());
        let expected = Tz::UTC.with_ymd_and_hms(2006, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(got as i64, expected.timestamp());
    }

    #[test]
    fn unparseable_falls_back_to_default() {
        assert_eq!(
            date_param_to_epoch("not a date", None, 99, Tz::UTC, fixed_now()),
            99
        );
    }
}
