use chrono::{DateTime, NaiveDateTime, SecondsFormat};

use crate::split::Step;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an instant as epoch milliseconds, RFC 3339, or a naive date-time in UTC.
pub fn parse_instant(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if let Ok(millis) = s.parse::<i64>() {
        return Ok(millis);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    Err(format!(
        "`{s}` is not epoch milliseconds, RFC 3339, or YYYY-MM-DDTHH:MM:SS"
    ))
}

/// Parse a duration like `10s` or `1h 30m` (or a bare number of milliseconds).
pub fn parse_duration_ms(s: &str) -> Result<i64, String> {
    let s = s.trim();
    let millis = match s.parse::<i64>() {
        Ok(millis) => millis,
        Err(_) => {
            let duration = humantime::parse_duration(s).map_err(|e| format!("`{s}`: {e}"))?;
            i64::try_from(duration.as_millis()).map_err(|_| format!("`{s}` is too long"))?
        }
    };
    if millis <= 0 {
        return Err(format!("`{s}` must be a positive duration"));
    }
    Ok(millis)
}

pub fn parse_step(s: &str) -> Result<Step, String> {
    let millis = parse_duration_ms(s)?;
    Step::new(millis).ok_or_else(|| format!("`{s}` must be a positive duration"))
}

pub fn format_instant(millis: i64) -> String {
    match DateTime::from_timestamp_millis(millis) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instants() {
        assert_eq!(parse_instant("1644156603000"), Ok(1_644_156_603_000));
        assert_eq!(parse_instant("-1000"), Ok(-1_000));
        assert_eq!(parse_instant("2022-02-06T14:10:03Z"), Ok(1_644_156_603_000));
        assert_eq!(
            parse_instant("2022-02-06T15:10:03+01:00"),
            Ok(1_644_156_603_000)
        );
        assert_eq!(parse_instant("2022-02-06T14:10:03"), Ok(1_644_156_603_000));
        assert_eq!(parse_instant("2022-02-06 14:10:03.250"), Ok(1_644_156_603_250));
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration_ms("10s"), Ok(10_000));
        assert_eq!(parse_duration_ms("1h 30m"), Ok(5_400_000));
        assert_eq!(parse_duration_ms("250ms"), Ok(250));
        assert_eq!(parse_duration_ms("35000"), Ok(35_000));
        assert!(parse_duration_ms("0s").is_err());
        assert!(parse_duration_ms("-5").is_err());
        assert!(parse_duration_ms("soon").is_err());
    }

    #[test]
    fn parses_steps() {
        assert_eq!(parse_step("10s").map(|s| s.millis()), Ok(10_000));
        assert!(parse_step("0").is_err());
    }

    #[test]
    fn formats_instants() {
        assert_eq!(format_instant(1_644_156_603_000), "2022-02-06T14:10:03.000Z");
        assert_eq!(format_instant(i64::MAX), i64::MAX.to_string());
    }
}
