//! Runtime configuration
//!
//! Loaded from JSON. Durations are written the way people write them
//! (`"50ms"`, `"1s 500ms"`) and parsed with humantime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use operant_core::{OperantError, OperantResult};
use operant_source::SourceConfig;
use operant_time::TimeoutConfig;

/// Output format of the tracing subscriber
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Timer settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Fires later than this past their deadline are logged
    #[serde(with = "humantime_duration")]
    pub max_jitter: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        TimeoutSettings {
            max_jitter: TimeoutConfig::default().max_jitter,
        }
    }
}

/// Source host settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSettings {
    #[serde(with = "humantime_duration")]
    pub poll_interval: Duration,
    /// Capacity of each source's command channel; unbounded when absent.
    /// Batches that do not fit wait in the task process until there is room.
    pub channel_capacity: Option<usize>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings {
            poll_interval: SourceConfig::default().poll_interval,
            channel_capacity: None,
        }
    }
}

/// Task process configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Heartbeat window: how long the reactor waits before heartbeating
    #[serde(with = "humantime_duration")]
    pub poll_timeout: Duration,
    pub timeouts: TimeoutSettings,
    pub source: SourceSettings,
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            poll_timeout: Duration::from_millis(50),
            timeouts: TimeoutSettings::default(),
            source: SourceSettings::default(),
            log_filter: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> OperantResult<Self> {
        let config: RuntimeConfig =
            serde_json::from_str(json).map_err(|e| OperantError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> OperantResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| OperantError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> OperantResult<()> {
        if self.poll_timeout.is_zero() {
            return Err(OperantError::Config("poll_timeout must be positive".into()));
        }
        if self.source.poll_interval.is_zero() {
            return Err(OperantError::Config(
                "source.poll_interval must be positive".into(),
            ));
        }
        if self.source.channel_capacity == Some(0) {
            return Err(OperantError::Config(
                "source.channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            max_jitter: self.timeouts.max_jitter,
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            poll_interval: self.source.poll_interval,
        }
    }
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.timeouts.max_jitter, Duration::from_millis(2));
        assert_eq!(config.source.poll_interval, Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json_str(
            r#"{ "poll_timeout": "20ms", "source": { "channel_capacity": 64 }, "log_format": "json" }"#,
        )
        .unwrap();
        assert_eq!(config.poll_timeout, Duration::from_millis(20));
        assert_eq!(config.source.channel_capacity, Some(64));
        assert_eq!(config.source.poll_interval, Duration::from_millis(10));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_humantime_durations() {
        let config =
            RuntimeConfig::from_json_str(r#"{ "timeouts": { "max_jitter": "1s 500ms" } }"#)
                .unwrap();
        assert_eq!(config.timeout_config().max_jitter, Duration::from_millis(1500));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = RuntimeConfig::from_json_str(r#"{ "poll_timout": "20ms" }"#).unwrap_err();
        assert!(matches!(err, OperantError::Config(_)));

        let err =
            RuntimeConfig::from_json_str(r#"{ "source": { "poll": "1ms" } }"#).unwrap_err();
        assert!(matches!(err, OperantError::Config(_)));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(RuntimeConfig::from_json_str(r#"{ "poll_timeout": "soon" }"#).is_err());
        assert!(RuntimeConfig::from_json_str(r#"{ "poll_timeout": "0s" }"#).is_err());
        assert!(
            RuntimeConfig::from_json_str(r#"{ "source": { "channel_capacity": 0 } }"#).is_err()
        );
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(RuntimeConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeConfig::from_file("/nonexistent/operant.json").unwrap_err();
        assert!(matches!(err, OperantError::Config(_)));
    }
}
