//! Shared serialization/deserialization utilities for configuration

/// Helper module for Duration serialization as seconds
///
/// This module serializes `std::time::Duration` as a u64 representing seconds,
/// which is more human-readable in TOML configuration files.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "tk_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct RetrySection {
        #[serde(with = "duration_secs")]
        interval: Duration,
    }

    #[test]
    fn test_duration_secs_deserialize() {
        let section: RetrySection = toml::from_str("interval = 5").unwrap();
        assert_eq!(section.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_duration_secs_serialize_truncates_to_seconds() {
        let section = RetrySection {
            interval: Duration::from_millis(2500),
        };
        assert_eq!(toml::to_string(&section).unwrap().trim(), "interval = 2");
    }
}
