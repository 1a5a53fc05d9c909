//! Configuration types and defaults

use peerlink_core::{PeerLinkError, PeerLinkResult};
use peerlink_media::DEFAULT_POOL_DEPTH;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Slots in the shared frame pool
    pub frame_pool_depth: usize,
    /// Bound on waiting for in-flight pushes and acquisitions before destroying
    #[serde(with = "duration_ms", rename = "destroy_wait_timeout_ms")]
    pub destroy_wait_timeout: Duration,
    /// Native events dispatched per update cycle; `None` drains the queue
    pub max_events_per_cycle: Option<usize>,
    /// Logging setup
    pub logging: LoggingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_pool_depth: DEFAULT_POOL_DEPTH,
            destroy_wait_timeout: Duration::from_millis(250),
            max_events_per_cycle: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> PeerLinkResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PeerLinkError::invalid_param(format!("session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> PeerLinkResult<()> {
        if self.frame_pool_depth == 0 {
            return Err(PeerLinkError::invalid_param(
                "frame_pool_depth must be at least 1",
            ));
        }
        if self.max_events_per_cycle == Some(0) {
            return Err(PeerLinkError::invalid_param(
                "max_events_per_cycle must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub default_directive: String,
    /// Include the event target in log lines
    pub with_target: bool,
    /// Colored output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            with_target: true,
            ansi: true,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::ResultCode;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.frame_pool_depth, 3);
        assert_eq!(config.destroy_wait_timeout, Duration::from_millis(250));
        assert!(config.max_events_per_cycle.is_none());
        assert_eq!(config.logging.default_directive, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{ "frame_pool_depth": 5, "destroy_wait_timeout_ms": 100 }"#,
        )
        .unwrap();
        assert_eq!(config.frame_pool_depth, 5);
        assert_eq!(config.destroy_wait_timeout, Duration::from_millis(100));
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SessionConfig::from_json_str(r#"{ "frame_pool_depth": 0 }"#).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidParam);
        assert!(SessionConfig::from_json_str("not json").is_err());

        let config = SessionConfig {
            max_events_per_cycle: Some(0),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialize_round_trips_timeout_in_millis() {
        let json = serde_json::to_string(&SessionConfig::default()).unwrap();
        assert!(json.contains("\"destroy_wait_timeout_ms\":250"));
    }
}
