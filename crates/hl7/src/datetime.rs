//! HL7 `TS` and `DT` formatting.

use crate::{Hl7Error, Hl7Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, Utc};
use chrono_tz::Tz;
use std::fmt;

/// The zone every HL7 timestamp is rendered in.
///
/// Named zones follow their daylight-saving rules; fixed offsets never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timezone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl Timezone {
    pub fn utc() -> Self {
        Self::Fixed(Utc.fix())
    }

    /// Wall-clock time at `instant` in this zone.
    pub fn local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Fixed(offset) => instant.with_timezone(offset).naive_local(),
            Self::Named(tz) => instant.with_timezone(tz).naive_local(),
        }
    }
}

impl Default for Timezone {
    fn default() -> Self {
        Self::utc()
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(offset) => write!(f, "{offset}"),
            Self::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}

/// Formats an instant as `YYYYMMDDHHMMSS` in the given zone.
pub fn format_datetime(instant: DateTime<Utc>, zone: &Timezone) -> String {
    zone.local(instant).format("%Y%m%d%H%M%S").to_string()
}

/// Formats a date as `YYYYMMDD`.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Parses the configured message timezone.
///
/// Accepts `UTC`, `GMT`, `Z`, a fixed offset written as `+HH:MM`, `-HH:MM` or `+HHMM`, or an
/// IANA zone name such as `Europe/London`.
///
/// # Errors
///
/// Returns [`Hl7Error::InvalidTimezone`] for anything else, including offsets of a day or more.
pub fn parse_timezone(input: &str) -> Hl7Result<Timezone> {
    let trimmed = input.trim();
    if let Some(offset) = parse_fixed(trimmed) {
        return Ok(Timezone::Fixed(offset));
    }
    trimmed
        .parse::<Tz>()
        .map(Timezone::Named)
        .map_err(|_| Hl7Error::InvalidTimezone(input.to_string()))
}

fn parse_fixed(trimmed: &str) -> Option<FixedOffset> {
    if matches!(trimmed.to_ascii_uppercase().as_str(), "UTC" | "GMT" | "Z") {
        return Some(Utc.fix());
    }

    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1, &trimmed[1..]),
        Some(b'-') => (-1, &trimmed[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) || rest.len() > 5 {
        return None;
    }

    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn offset_seconds(zone: Timezone) -> i32 {
        match zone {
            Timezone::Fixed(offset) => offset.local_minus_utc(),
            Timezone::Named(tz) => panic!("expected a fixed offset, got {}", tz.name()),
        }
    }

    #[test]
    fn test_format_datetime_applies_offset() {
        let instant = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 5).unwrap();

        let utc = parse_timezone("UTC").unwrap();
        assert_eq!(format_datetime(instant, &utc), "20240301233005");

        let plus_one = parse_timezone("+01:00").unwrap();
        assert_eq!(format_datetime(instant, &plus_one), "20240302003005");
    }

    #[test]
    fn test_named_zone_follows_daylight_saving() {
        let london = parse_timezone("Europe/London").unwrap();
        assert_eq!(london, Timezone::Named(chrono_tz::Europe::London));

        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let summer = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        assert_eq!(format_datetime(winter, &london), "20240115120000");
        assert_eq!(format_datetime(summer, &london), "20240701130000");
    }

    #[test]
    fn test_format_date() {
        let date = NaiveDate::from_ymd_opt(1980, 7, 4).unwrap();
        assert_eq!(format_date(date), "19800704");
    }

    #[test]
    fn test_parse_timezone_forms() {
        assert_eq!(offset_seconds(parse_timezone("Z").unwrap()), 0);
        assert_eq!(offset_seconds(parse_timezone("gmt").unwrap()), 0);
        assert_eq!(offset_seconds(parse_timezone("-05:30").unwrap()), -19800);
        assert_eq!(offset_seconds(parse_timezone("+0200").unwrap()), 7200);
        assert_eq!(Timezone::default(), parse_timezone("UTC").unwrap());
    }

    #[test]
    fn test_parse_timezone_rejects_unknown_and_malformed() {
        for input in ["Mars/Olympus_Mons", "+1", "+01:60", "+24:00", "01:00", ""] {
            assert!(
                matches!(parse_timezone(input), Err(Hl7Error::InvalidTimezone(_))),
                "{input} should be rejected"
            );
        }
    }
}
