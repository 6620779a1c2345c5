use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::model::{Coordinate, CoordinateError, FALLBACK_COORDINATE};

pub const DEFAULT_CHANNEL_ENDPOINT: &str = "https://s2hbackend.zeabur.app";
pub const DEFAULT_ROUTING_BASE_URL: &str = "https://router.project-osrm.org";
pub const DEFAULT_LOCATION_EMIT_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_ROUTE_THROTTLE_MS: u64 = 10_000;
pub const DEFAULT_ANIMATION_DURATION_MS: u64 = 800;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_PROVISIONAL_CANCEL_WINDOW_MS: u64 = 120_000;
pub const DEFAULT_MAX_INCOMING_REQUESTS: usize = 20;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    ZeroInterval { field: &'static str },
    #[error("`{field}` is not a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("default coordinate is invalid: {0}")]
    Coordinate(#[from] CoordinateError),
}

/// Bounded reconnect schedule for the realtime channel.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), doubling from the base
    /// and capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(20);
        let multiplier = 1_u64 << shift;
        self.base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms.max(self.base_delay_ms))
    }

    #[must_use]
    pub const fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub channel_endpoint: String,
    pub routing_base_url: String,
    pub location_emit_interval_ms: u64,
    pub route_throttle_ms: u64,
    pub animation_duration_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub default_coordinate: Coordinate,
    pub provisional_cancel_window_ms: u64,
    pub max_incoming_requests: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            channel_endpoint: DEFAULT_CHANNEL_ENDPOINT.into(),
            routing_base_url: DEFAULT_ROUTING_BASE_URL.into(),
            location_emit_interval_ms: DEFAULT_LOCATION_EMIT_INTERVAL_MS,
            route_throttle_ms: DEFAULT_ROUTE_THROTTLE_MS,
            animation_duration_ms: DEFAULT_ANIMATION_DURATION_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            reconnect: ReconnectPolicy::default(),
            default_coordinate: FALLBACK_COORDINATE,
            provisional_cancel_window_ms: DEFAULT_PROVISIONAL_CANCEL_WINDOW_MS,
            max_incoming_requests: DEFAULT_MAX_INCOMING_REQUESTS,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("location_emit_interval_ms", self.location_emit_interval_ms),
            ("route_throttle_ms", self.route_throttle_ms),
            ("animation_duration_ms", self.animation_duration_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("provisional_cancel_window_ms", self.provisional_cancel_window_ms),
            ("reconnect.base_delay_ms", self.reconnect.base_delay_ms),
            ("max_incoming_requests", self.max_incoming_requests as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { field });
            }
        }

        for (field, value) in [
            ("channel_endpoint", &self.channel_endpoint),
            ("routing_base_url", &self.routing_base_url),
        ] {
            Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
                field,
                value: value.clone(),
            })?;
        }

        Coordinate::from_lng_lat(self.default_coordinate.lng(), self.default_coordinate.lat())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.default_coordinate.as_lng_lat(), [77.5946, 12.9716]);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"route_throttle_ms": 5000, "reconnect": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.route_throttle_ms, 5_000);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.location_emit_interval_ms, 3_000);
    }

    #[test]
    fn rejects_zero_intervals_and_bad_urls() {
        let config = CoreConfig {
            heartbeat_interval_ms: 0,
            ..CoreConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval {
                field: "heartbeat_interval_ms"
            })
        );

        let config = CoreConfig {
            routing_base_url: "not a url".into(),
            ..CoreConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { field: "routing_base_url", .. })
        ));
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), 1_000);
        assert_eq!(policy.delay_for_attempt(2), 2_000);
        assert_eq!(policy.delay_for_attempt(3), 4_000);
        assert_eq!(policy.delay_for_attempt(4), 5_000);
        assert!(!policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }
}
