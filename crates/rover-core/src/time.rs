//! Epoch-second <-> FDSN ISO-8601 timestamp conversions shared by the
//! availability parser, the index DB, and request building.
//!
//! FDSN services exchange microsecond-precision timestamps
//! (`YYYY-MM-DDTHH:MM:SS.ffffff`); every timestamp this crate renders uses
//! that precision so availability and dataselect requests round-trip
//! exactly through the service without silently truncating sub-second data.

use anyhow::{bail, Result};
use chrono::{NaiveDateTime, TimeZone, Utc};

/// Parses an FDSN timestamp (with or without a fractional-seconds part) as
/// UTC epoch seconds.
pub fn parse_epoch(s: &str) -> Result<f64> {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp_micros() as f64 / 1_000_000.0);
        }
    }
    bail!("unrecognised timestamp: {s}")
}

/// Formats UTC epoch seconds as a microsecond-precision FDSN timestamp.
pub fn format_epoch(epoch: f64) -> String {
    let micros = (epoch * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
        .unwrap_or_else(|| "1970-01-01T00:00:00.000000".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_whole_seconds() {
        let epoch = parse_epoch("2020-01-01T00:00:00").unwrap();
        assert_eq!(format_epoch(epoch), "2020-01-01T00:00:00.000000");
    }

    #[test]
    fn roundtrips_microsecond_precision() {
        let s = "2020-01-01T00:00:00.123456";
        let epoch = parse_epoch(s).unwrap();
        assert_eq!(format_epoch(epoch), s);
    }

    #[test]
    fn parses_fractional_seconds_as_offset_from_whole() {
        let epoch = parse_epoch("2020-01-01T00:00:00.500000").unwrap();
        assert!((epoch - parse_epoch("2020-01-01T00:00:00").unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_epoch("not-a-timestamp").is_err());
    }
}
