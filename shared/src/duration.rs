//! Human-readable duration parsing
//!
//! Durations appear in two places: the `interval`/`timeout` fields of the
//! configuration file and the retention string of the archive storage
//! (e.g. `"10s:1d,1m:7d"`). Both use the same compact `<number><unit>`
//! notation with units `ms`, `s`, `m`, `h`, `d`, `w`, `y`.

use std::time::Duration;

use crate::PulseError;

/// Parse a duration like `500ms`, `10s`, `1m`, `1h`, `7d`, `2w` or `1y`.
pub fn parse_duration(input: &str) -> crate::Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(PulseError::Validation("empty duration".to_string()).into());
    }

    // "ms" must be checked before the single-letter units: "500ms" also
    // ends in "s".
    let (number, multiplier_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60 * 1_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600 * 1_000)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, 86_400 * 1_000)
    } else if let Some(n) = s.strip_suffix('w') {
        (n, 7 * 86_400 * 1_000)
    } else if let Some(n) = s.strip_suffix('y') {
        (n, 365 * 86_400 * 1_000)
    } else {
        return Err(PulseError::Validation(format!(
            "invalid duration {:?} (use a number with a ms/s/m/h/d/w/y suffix)",
            input
        ))
        .into());
    };

    let value: u64 = number.trim().parse().map_err(|_| {
        PulseError::Validation(format!(
            "invalid duration {:?} (use a number with a ms/s/m/h/d/w/y suffix)",
            input
        ))
    })?;

    Ok(Duration::from_millis(value * multiplier_ms))
}

/// Format a duration in the most compact exact unit, e.g. `10s` or `500ms`.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    const UNITS: [(u128, &str); 6] = [
        (365 * 86_400_000, "y"),
        (7 * 86_400_000, "w"),
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];
    for (unit_ms, suffix) in UNITS {
        if ms > 0 && ms % unit_ms == 0 {
            return format!("{}{}", ms / unit_ms, suffix);
        }
    }
    format!("{}ms", ms)
}

/// Serde adapter for `Duration` fields stored in the compact notation.
///
/// Usage: `#[serde(with = "shared::duration::serde_duration")]`.
pub mod serde_duration {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(14 * 86_400));
        assert_eq!(
            parse_duration("1y").unwrap(),
            Duration::from_secs(365 * 86_400)
        );
        assert_eq!(parse_duration(" 90d ").unwrap(), Duration::from_secs(90 * 86_400));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("1.5s").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(86_400)), "1d");
        assert_eq!(format_duration(Duration::from_secs(90 * 86_400)), "90d");
    }

    #[test]
    fn test_round_trip() {
        for input in ["500ms", "10s", "5m", "12h", "1d", "90d"] {
            let parsed = parse_duration(input).unwrap();
            assert_eq!(format_duration(parsed), input);
        }
    }
}
