//! Index timestamps (`last_indexed`)
//!
//! Millisecond precision: the extension tables store GeoPackage DATETIME text,
//! the metadata side store stores epoch millis.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

/// UTC timestamp (milliseconds since Unix epoch)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    millis: i64,
}

impl Timestamp {
    /// Create a timestamp from milliseconds
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Create a timestamp from seconds
    pub fn from_secs(secs: i64) -> Self {
        Self {
            millis: secs * 1000,
        }
    }

    /// Get current timestamp
    pub fn now() -> Self {
        Self {
            millis: Utc::now().timestamp_millis(),
        }
    }

    /// Get timestamp in milliseconds
    pub fn as_millis(&self) -> i64 {
        self.millis
    }

    /// Get timestamp in seconds
    pub fn as_secs(&self) -> i64 {
        self.millis.div_euclid(1000)
    }

    /// GeoPackage DATETIME text, e.g. `2024-03-01T12:00:00.000Z`
    pub fn to_datetime_string(&self) -> String {
        self.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Parse GeoPackage DATETIME text.
    ///
    /// Accepts RFC 3339 and the zone-less `YYYY-MM-DD HH:MM:SS[.fff]` form
    /// SQLite's own `datetime()` produces (read as UTC).
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self::from_millis(dt.timestamp_millis()));
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return Ok(Self::from_millis(naive.and_utc().timestamp_millis()));
            }
        }
        Err(StorageError::InvalidData(format!("Unparseable DATETIME '{}'", text)))
    }

    fn to_chrono(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis)
            .single()
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_datetime_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_creation() {
        let ts = Timestamp::from_secs(1000);
        assert_eq!(ts.as_secs(), 1000);
        assert_eq!(ts.as_millis(), 1_000_000);
    }

    #[test]
    fn test_timestamp_ordering() {
        let ts1 = Timestamp::from_secs(100);
        let ts2 = Timestamp::from_secs(200);

        assert!(ts1 < ts2);
        assert!(ts2 > ts1);
    }

    #[test]
    fn test_datetime_text() {
        let ts = Timestamp::from_millis(1_709_294_400_123);
        let text = ts.to_datetime_string();
        assert_eq!(text, "2024-03-01T12:00:00.123Z");
        assert_eq!(Timestamp::parse(&text).unwrap(), ts);
        assert_eq!(
            Timestamp::parse("2024-03-01 12:00:00").unwrap(),
            Timestamp::from_millis(1_709_294_400_000)
        );
        assert!(Timestamp::parse("yesterday").is_err());
    }

    #[test]
    fn test_timestamp_now() {
        let ts = Timestamp::now();
        assert!(ts.as_secs() > 0);
    }
}
