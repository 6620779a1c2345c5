use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Coordinate, RequestId, UnixTimeMs};
use crate::protocol::ClientMessage;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Error)]
#[serde(rename_all = "snake_case")]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    Unavailable,
    #[error("location request timed out")]
    Timeout,
    #[error("geolocation is not supported on this device")]
    Unsupported,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LocationSample {
    pub coordinate: Coordinate,
    pub accuracy_m: Option<f64>,
    pub timestamp: UnixTimeMs,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub maximum_age_ms: u64,
    pub timeout_ms: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            maximum_age_ms: 1_000,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct WatchId(pub u64);

/// Where forwarded samples go. `request_id` is `None` while a helper is
/// online but not yet assigned.
#[derive(Clone, Debug, PartialEq)]
struct Forwarding {
    request_id: Option<RequestId>,
}

/// Wraps the device location subscription. Keeps the newest raw sample for
/// local display and forwards at most one sample per interval to the
/// channel.
#[derive(Debug)]
pub struct LocationStreamer {
    interval_ms: u64,
    next_watch_id: u64,
    watch: Option<WatchId>,
    latest: Option<LocationSample>,
    last_forwarded_at: Option<UnixTimeMs>,
    forwarding: Option<Forwarding>,
    last_error: Option<LocationError>,
}

impl Default for LocationStreamer {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_LOCATION_EMIT_INTERVAL_MS)
    }
}

impl LocationStreamer {
    #[must_use]
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            next_watch_id: 0,
            watch: None,
            latest: None,
            last_forwarded_at: None,
            forwarding: None,
            last_error: None,
        }
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval_ms = interval_ms;
    }

    /// Allocates a watch handle. Returns `None` if a watch is already running.
    pub fn start(&mut self) -> Option<WatchId> {
        if self.watch.is_some() {
            return None;
        }
        self.next_watch_id += 1;
        let id = WatchId(self.next_watch_id);
        self.watch = Some(id);
        Some(id)
    }

    /// Releases the watch handle. Forwarding stops with it.
    pub fn stop(&mut self) -> Option<WatchId> {
        self.forwarding = None;
        self.last_forwarded_at = None;
        self.watch.take()
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&LocationSample> {
        self.latest.as_ref()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&LocationError> {
        self.last_error.as_ref()
    }

    /// Latest known position, or `fallback` when the device never gave one.
    #[must_use]
    pub fn position_or(&self, fallback: Coordinate) -> Coordinate {
        self.latest.map_or(fallback, |s| s.coordinate)
    }

    pub fn enable_forwarding(&mut self, request_id: Option<RequestId>) {
        let target = Forwarding { request_id };
        if self.forwarding.as_ref() != Some(&target) {
            self.last_forwarded_at = None;
        }
        self.forwarding = Some(target);
    }

    pub fn disable_forwarding(&mut self) {
        self.forwarding = None;
        self.last_forwarded_at = None;
    }

    #[must_use]
    pub fn is_forwarding(&self) -> bool {
        self.forwarding.is_some()
    }

    /// Records a sample and returns the outbound update if one is due.
    pub fn on_sample(&mut self, sample: LocationSample) -> Option<ClientMessage> {
        if self.watch.is_none() {
            debug!("sample after watch stopped, ignoring");
            return None;
        }
        self.latest = Some(sample);
        self.last_error = None;

        let forwarding = self.forwarding.as_ref()?;
        let due = self
            .last_forwarded_at
            .map_or(true, |last| sample.timestamp.elapsed_since(last) >= self.interval_ms);
        if !due {
            return None;
        }

        self.last_forwarded_at = Some(sample.timestamp);
        Some(ClientMessage::location_update(
            forwarding.request_id.clone(),
            sample.coordinate,
        ))
    }

    /// Keeps the last good sample; never invents a position.
    pub fn on_error(&mut self, error: LocationError) {
        warn!(%error, "location unavailable");
        self.last_error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lng: f64, at: u64) -> LocationSample {
        LocationSample {
            coordinate: Coordinate::from_lng_lat(lng, 12.97).unwrap(),
            accuracy_m: Some(5.0),
            timestamp: UnixTimeMs(at),
        }
    }

    #[test]
    fn throttles_forwarding_but_keeps_latest() {
        let mut streamer = LocationStreamer::new(3_000);
        streamer.start().unwrap();
        streamer.enable_forwarding(Some(RequestId::new("r1")));

        assert!(streamer.on_sample(sample(77.0, 0)).is_some());
        assert!(streamer.on_sample(sample(77.1, 1_000)).is_none());
        assert!(streamer.on_sample(sample(77.2, 2_999)).is_none());
        assert_eq!(streamer.latest().unwrap().coordinate.lng(), 77.2);

        let forwarded = streamer.on_sample(sample(77.3, 3_000)).unwrap();
        assert_eq!(
            forwarded,
            ClientMessage::LocationUpdate {
                request_id: Some(RequestId::new("r1")),
                longitude: 77.3,
                latitude: 12.97,
            }
        );
    }

    #[test]
    fn no_forwarding_until_enabled() {
        let mut streamer = LocationStreamer::default();
        streamer.start();
        assert!(streamer.on_sample(sample(77.0, 0)).is_none());
        streamer.enable_forwarding(None);
        assert!(streamer.on_sample(sample(77.0, 100)).is_some());
    }

    #[test]
    fn error_does_not_fabricate_position() {
        let mut streamer = LocationStreamer::default();
        streamer.start();
        streamer.on_error(LocationError::PermissionDenied);
        assert!(streamer.latest().is_none());
        let fallback = Coordinate::from_lng_lat(1.0, 2.0).unwrap();
        assert_eq!(streamer.position_or(fallback), fallback);

        streamer.on_sample(sample(77.0, 0));
        streamer.on_error(LocationError::Timeout);
        assert_eq!(streamer.latest().unwrap().coordinate.lng(), 77.0);
        assert_eq!(streamer.last_error(), Some(&LocationError::Timeout));
    }

    #[test]
    fn stop_releases_handle_and_ignores_late_samples() {
        let mut streamer = LocationStreamer::default();
        let id = streamer.start().unwrap();
        assert!(streamer.start().is_none());
        assert_eq!(streamer.stop(), Some(id));
        assert!(streamer.on_sample(sample(77.0, 0)).is_none());
        assert!(streamer.latest().is_none());
        assert_ne!(streamer.start(), Some(id));
    }
}
