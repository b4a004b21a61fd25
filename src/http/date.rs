//! Lenient HTTP date parsing, strict RFC 1123 output.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Parses an HTTP date in any of the formats servers actually send, returning
/// epoch milliseconds. GMT is always assumed.
///
/// The standard formats (RFC 1123, RFC 1036, ANSI C `asctime`) go through
/// `httpdate`; common non-standard variants fall back to a tolerant
/// tokenizer.
pub(crate) fn parse_millis(input: &str) -> Option<i64> {
    let input = input.trim();
    if let Ok(time) = httpdate::parse_http_date(input) {
        return Some(to_millis(time));
    }
    parse_lenient(input)
}

/// Formats epoch milliseconds as an RFC 1123 date, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
pub(crate) fn format_millis(millis: i64) -> String {
    let time = if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    };
    httpdate::fmt_http_date(time)
}

fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Accepts variants such as `06-Nov-1994 08:49:37 GMT`, missing `GMT`
/// suffixes, single-digit days, and `UTC` in place of `GMT`.
fn parse_lenient(input: &str) -> Option<i64> {
    let mut day = None;
    let mut month = None;
    let mut year = None;
    let mut time = None;

    for token in input.split(|c: char| c == ' ' || c == ',' || c == '-' || c == '/') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token.contains(':') {
            time = time.or_else(|| parse_clock(token));
            continue;
        }
        if let Some(m) = month_number(token) {
            month = month.or(Some(m));
            continue;
        }
        if let Ok(n) = token.parse::<u32>() {
            if n >= 1000 {
                year = year.or(Some(n));
            } else if n >= 70 && day.is_some() {
                // Two-digit years per RFC 1036; 70..99 means 19xx.
                year = year.or(Some(if n < 100 { 1900 + n } else { n }));
            } else if n <= 31 && day.is_none() {
                day = Some(n);
            } else if n < 70 {
                year = year.or(Some(2000 + n));
            }
        }
    }

    let (hour, minute, second) = time?;
    let (day, month, year) = (day?, month?, year?);
    if day == 0 || !(1970..=9999).contains(&year) {
        return None;
    }
    Some(civil_to_millis(year, month, day, hour, minute, second))
}

fn parse_clock(token: &str) -> Option<(u32, u32, u32)> {
    let mut parts = token.split(':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    let second: u32 = parts.next().unwrap_or("0").parse().ok()?;
    if hour > 23 || minute > 59 || second > 60 {
        return None;
    }
    Some((hour, minute, second))
}

fn month_number(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    if token.len() < 3 {
        return None;
    }
    let prefix = token[..3].to_ascii_lowercase();
    MONTHS.iter().position(|m| *m == prefix).map(|i| i as u32 + 1)
}

fn is_leap(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn civil_to_millis(year: u32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> i64 {
    const CUMULATIVE_DAYS: [u32; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    let mut days: i64 = 0;
    for y in 1970..year {
        days += if is_leap(y) { 366 } else { 365 };
    }
    days += CUMULATIVE_DAYS[(month - 1) as usize] as i64;
    if month > 2 && is_leap(year) {
        days += 1;
    }
    days += (day - 1) as i64;
    let seconds = days * 86_400 + hour as i64 * 3_600 + minute as i64 * 60 + second as i64;
    seconds * 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOV_6_1994: i64 = 784_111_777_000;

    #[test]
    fn rfc_1123() {
        assert_eq!(parse_millis("Sun, 06 Nov 1994 08:49:37 GMT"), Some(NOV_6_1994));
    }

    #[test]
    fn rfc_1036() {
        assert_eq!(parse_millis("Sunday, 06-Nov-94 08:49:37 GMT"), Some(NOV_6_1994));
    }

    #[test]
    fn asctime() {
        assert_eq!(parse_millis("Sun Nov  6 08:49:37 1994"), Some(NOV_6_1994));
    }

    #[test]
    fn lenient_variants() {
        assert_eq!(parse_millis("06 Nov 1994 08:49:37"), Some(NOV_6_1994));
        assert_eq!(parse_millis("Sun, 6 Nov 1994 08:49:37 UTC"), Some(NOV_6_1994));
        assert_eq!(parse_millis("06-Nov-1994 08:49:37 GMT"), Some(NOV_6_1994));
    }

    #[test]
    fn round_trip_format() {
        let formatted = format_millis(NOV_6_1994);
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_millis(&formatted), Some(NOV_6_1994));
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(parse_millis("not a date"), None);
        assert_eq!(parse_millis(""), None);
        assert_eq!(parse_millis("25:00:00"), None);
    }
}
