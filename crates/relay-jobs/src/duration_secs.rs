//! Serde adapter for durations written as (possibly fractional) seconds
//!
//! ```rust,ignore
//! #[serde(with = "relay_jobs::duration_secs")]
//! pub interval: Duration,
//! ```

use serde::{de, Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize as seconds
///
/// # Errors
/// Whatever the serializer returns.
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    if value.subsec_nanos() == 0 {
        serializer.serialize_u64(value.as_secs())
    } else {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

/// Deserialize from seconds
///
/// # Errors
/// Negative, non-finite or non-numeric values.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
}
