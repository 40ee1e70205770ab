//! Interval strings as written in config files and group policies
//! (`"1 days"`, `"15 minutes"`, `"2 hours 30 minutes"`).

use std::time::Duration;

use crate::config::ConfigError;

/// Parse an interval string into a [`Duration`].
///
/// Whitespace is insignificant, so `"1 days"` and `"1days"` are equal.
pub fn parse_interval(value: &str) -> Result<Duration, ConfigError> {
    let compact: String = value.split_whitespace().collect();
    if compact.is_empty() {
        return Err(ConfigError::InvalidInterval {
            value: value.to_string(),
            reason: "empty interval".to_string(),
        });
    }
    humantime::parse_duration(&compact).map_err(|e| ConfigError::InvalidInterval {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_postgres_style_intervals() {
        assert_eq!(parse_interval("1 days").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_interval("15 minutes").unwrap(), Duration::from_secs(900));
        assert_eq!(
            parse_interval("2 hours 30 minutes").unwrap(),
            Duration::from_secs(9_000)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_interval("").is_err());
        assert!(parse_interval("soon").is_err());
        assert!(parse_interval("5 fortnights").is_err());
    }
}
