//! Small shared helpers for the mqttd workspace
//!
//! ## Core Features:
//! - **Counters**: lock-free current/peak counters used by broker statistics ([`Counter`])
//! - **Duration Conversion**: human readable strings such as `"1h30m"` or `"500ms"` into [`Duration`]
//! - **Timestamp Utilities**: second and millisecond unix timestamps with chrono fallbacks
//!
//! ## Usage Examples:
//! ```rust
//! use mqttd_utils::{to_duration, timestamp_millis, Counter};
//!
//! let d = to_duration("1m30s");
//! assert_eq!(d.as_secs(), 90);
//!
//! let c = Counter::new();
//! c.inc();
//! c.inc();
//! c.dec();
//! assert_eq!(c.count(), 1);
//! assert_eq!(c.max(), 2);
//!
//! assert!(timestamp_millis() > 0);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::de::{Deserialize, Deserializer};

mod counter;

pub use counter::Counter;

/// Timestamp representation in seconds since Unix epoch
pub type Timestamp = i64;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Deserialize optional Duration, an empty string maps to `None`
#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.is_empty() {
        Ok(None)
    } else {
        Ok(Some(to_duration(&v)))
    }
}

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
///
/// Unknown units and unparsable segments count as zero.
///
/// # Example:
/// ```
/// let duration = mqttd_utils::to_duration("1h30m15s");
/// assert_eq!(duration.as_secs(), 5415);
///
/// let millis = mqttd_utils::to_duration("1s500ms");
/// assert_eq!(millis.as_millis(), 1500);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    //'ms' is folded into a single marker so it is not split as 'm' + 's'
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Get current timestamp in seconds
#[inline]
pub fn timestamp_secs() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_secs() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp())
}

/// Get current timestamp in milliseconds
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Format millisecond timestamp to string, non-positive values give an empty string
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_duration() {
        assert_eq!(to_duration("15s"), Duration::from_secs(15));
        assert_eq!(to_duration("2m"), Duration::from_secs(120));
        assert_eq!(to_duration("1h"), Duration::from_secs(3600));
        assert_eq!(to_duration("1d1h"), Duration::from_secs(90000));
        assert_eq!(to_duration("250ms"), Duration::from_millis(250));
        assert_eq!(to_duration("1m250ms"), Duration::from_millis(60250));
        assert_eq!(to_duration("abc"), Duration::ZERO);
        assert_eq!(to_duration(""), Duration::ZERO);
    }

    #[test]
    fn test_format_timestamp_millis() {
        assert_eq!(format_timestamp_millis(0), "");
        assert!(!format_timestamp_millis(timestamp_millis()).is_empty());
        assert!(timestamp_secs() > 0);
    }
}
