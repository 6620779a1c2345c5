//! Route/ETA estimation against an OSRM-compatible routing service.

use geojson::{Geometry, Value as GeoValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::countdown::Countdown;
use crate::model::{Coordinate, RequestId, UnixTimeMs};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("routing request failed: {0}")]
    Transport(String),
    #[error("routing service found no route ({0})")]
    NoRoute(String),
    #[error("routing response had no routes")]
    Empty,
    #[error("cannot build routing URL: {0}")]
    InvalidUrl(String),
}

#[derive(Deserialize, Debug)]
pub struct OsrmResponse {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub routes: Vec<OsrmRoute>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OsrmRoute {
    pub duration: f64,
    pub distance: f64,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

impl OsrmResponse {
    pub fn into_route(self) -> Result<OsrmRoute, RouteError> {
        if self.code != "Ok" {
            return Err(RouteError::NoRoute(self.message.unwrap_or(self.code)));
        }
        self.routes.into_iter().next().ok_or(RouteError::Empty)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RouteEstimate {
    pub duration_seconds: f64,
    pub distance_meters: f64,
    pub geometry: Option<Geometry>,
    pub computed_at: UnixTimeMs,
}

impl RouteEstimate {
    /// Route line as `[lng, lat]` pairs, empty when the provider sent none.
    #[must_use]
    pub fn polyline(&self) -> Vec<[f64; 2]> {
        match self.geometry.as_ref().map(|g| &g.value) {
            Some(GeoValue::LineString(points)) => points
                .iter()
                .filter(|p| p.len() >= 2)
                .map(|p| [p[0], p[1]])
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// `{base}/route/v1/driving/{lng},{lat};{lng},{lat}?overview=full&geometries=geojson`
pub fn osrm_url(base: &str, origin: Coordinate, destination: Coordinate) -> Result<Url, RouteError> {
    let path = format!(
        "route/v1/driving/{},{};{},{}",
        origin.lng(),
        origin.lat(),
        destination.lng(),
        destination.lat()
    );
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };
    let mut url = Url::parse(&base)
        .and_then(|b| b.join(&path))
        .map_err(|e| RouteError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("overview", "full")
        .append_pair("geometries", "geojson");
    Ok(url)
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteQuery {
    pub generation: u64,
    pub url: Url,
}

/// Throttled estimator. Calls are gated on the time since the previous
/// call *started*; in-flight calls are never cancelled.
#[derive(Debug)]
pub struct RouteEstimator {
    throttle_ms: u64,
    pair: Option<RequestId>,
    last_call_started_at: Option<UnixTimeMs>,
    next_generation: u64,
    pair_first_generation: u64,
    applied_generation: Option<u64>,
    estimate: Option<RouteEstimate>,
    eta: Option<Countdown>,
}

impl Default for RouteEstimator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_ROUTE_THROTTLE_MS)
    }
}

impl RouteEstimator {
    #[must_use]
    pub fn new(throttle_ms: u64) -> Self {
        Self {
            throttle_ms,
            pair: None,
            last_call_started_at: None,
            next_generation: 0,
            pair_first_generation: 0,
            applied_generation: None,
            estimate: None,
            eta: None,
        }
    }

    pub fn set_throttle(&mut self, throttle_ms: u64) {
        self.throttle_ms = throttle_ms;
    }

    #[must_use]
    pub fn estimate(&self) -> Option<&RouteEstimate> {
        self.estimate.as_ref()
    }

    /// Seconds left on the locally ticking ETA.
    #[must_use]
    pub fn eta_remaining_seconds(&self, now: UnixTimeMs) -> Option<u64> {
        self.eta.as_ref().map(|c| c.remaining_seconds(now))
    }

    /// Returns the provider call to make, or `None` while throttled. The
    /// first call for a new pair always goes out.
    pub fn request(
        &mut self,
        base_url: &str,
        pair: &RequestId,
        origin: Coordinate,
        destination: Coordinate,
        now: UnixTimeMs,
    ) -> Result<Option<RouteQuery>, RouteError> {
        if self.pair.as_ref() != Some(pair) {
            debug!(%pair, "new route pair");
            self.reset();
            self.pair = Some(pair.clone());
            self.pair_first_generation = self.next_generation;
        } else if let Some(last) = self.last_call_started_at {
            if now.elapsed_since(last) < self.throttle_ms {
                return Ok(None);
            }
        }

        let url = osrm_url(base_url, origin, destination)?;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.last_call_started_at = Some(now);
        Ok(Some(RouteQuery { generation, url }))
    }

    /// Applies a provider result. Results for an earlier pair, or older than
    /// the estimate already shown, are discarded.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn on_success(&mut self, generation: u64, route: OsrmRoute, now: UnixTimeMs) -> bool {
        if generation < self.pair_first_generation
            || self.applied_generation.is_some_and(|g| generation <= g)
        {
            debug!(generation, "discarding stale route result");
            return false;
        }

        let seconds = route.duration.max(0.0).round() as u64;
        info!(
            generation,
            duration_s = route.duration,
            distance_m = route.distance,
            "route estimate updated"
        );
        self.applied_generation = Some(generation);
        self.eta = Some(Countdown::starting_at(now, seconds.saturating_mul(1_000)));
        self.estimate = Some(RouteEstimate {
            duration_seconds: route.duration,
            distance_meters: route.distance,
            geometry: route.geometry,
            computed_at: now,
        });
        true
    }

    /// The last good estimate stays in place.
    pub fn on_failure(&mut self, generation: u64, error: &RouteError) {
        warn!(generation, %error, kept_estimate = self.estimate.is_some(), "route estimate failed");
    }

    /// Forgets the pair and every derived value.
    pub fn reset(&mut self) {
        self.pair = None;
        self.last_call_started_at = None;
        self.pair_first_generation = self.next_generation;
        self.applied_generation = None;
        self.estimate = None;
        self.eta = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE: &str = "https://router.project-osrm.org";

    fn coord(lng: f64, lat: f64) -> Coordinate {
        Coordinate::from_lng_lat(lng, lat).unwrap()
    }

    fn route(duration: f64) -> OsrmRoute {
        OsrmRoute {
            duration,
            distance: 2_345.0,
            geometry: None,
        }
    }

    #[test]
    fn builds_osrm_url() {
        let url = osrm_url(BASE, coord(77.6, 12.9), coord(77.59, 12.97)).unwrap();
        assert_eq!(
            url.as_str(),
            "https://router.project-osrm.org/route/v1/driving/77.6,12.9;77.59,12.97?overview=full&geometries=geojson"
        );
    }

    #[test]
    fn decodes_osrm_response() {
        let response: OsrmResponse = serde_json::from_value(json!({
            "code": "Ok",
            "routes": [{
                "duration": 600.4,
                "distance": 4200.0,
                "geometry": {"type": "LineString", "coordinates": [[77.6, 12.9], [77.59, 12.97]]}
            }]
        }))
        .unwrap();
        let route = response.into_route().unwrap();
        assert_eq!(route.duration, 600.4);

        let estimate = RouteEstimate {
            duration_seconds: route.duration,
            distance_meters: route.distance,
            geometry: route.geometry,
            computed_at: UnixTimeMs(0),
        };
        assert_eq!(estimate.polyline(), vec![[77.6, 12.9], [77.59, 12.97]]);

        let failed: OsrmResponse =
            serde_json::from_value(json!({"code": "NoRoute", "message": "Impossible route"})).unwrap();
        assert_eq!(
            failed.into_route(),
            Err(RouteError::NoRoute("Impossible route".into()))
        );
    }

    #[test]
    fn one_call_per_throttle_window() {
        let mut estimator = RouteEstimator::new(10_000);
        let pair = RequestId::new("r1");
        let (a, b) = (coord(77.6, 12.9), coord(77.59, 12.97));

        let first = estimator.request(BASE, &pair, a, b, UnixTimeMs(0)).unwrap();
        assert!(first.is_some());
        assert!(estimator.request(BASE, &pair, a, b, UnixTimeMs(5_000)).unwrap().is_none());
        assert!(estimator.request(BASE, &pair, a, b, UnixTimeMs(9_999)).unwrap().is_none());
        assert!(estimator.request(BASE, &pair, a, b, UnixTimeMs(10_000)).unwrap().is_some());
    }

    #[test]
    fn new_pair_is_unthrottled_and_drops_old_results() {
        let mut estimator = RouteEstimator::new(10_000);
        let (a, b) = (coord(77.6, 12.9), coord(77.59, 12.97));
        let old = estimator
            .request(BASE, &RequestId::new("r1"), a, b, UnixTimeMs(0))
            .unwrap()
            .unwrap();
        let new = estimator
            .request(BASE, &RequestId::new("r2"), a, b, UnixTimeMs(1_000))
            .unwrap()
            .unwrap();

        assert!(!estimator.on_success(old.generation, route(100.0), UnixTimeMs(1_500)));
        assert!(estimator.estimate().is_none());
        assert!(estimator.on_success(new.generation, route(300.0), UnixTimeMs(2_000)));
        assert_eq!(estimator.eta_remaining_seconds(UnixTimeMs(2_000)), Some(300));
        assert_eq!(estimator.eta_remaining_seconds(UnixTimeMs(62_000)), Some(240));
    }

    #[test]
    fn failure_keeps_last_good_estimate() {
        let mut estimator = RouteEstimator::new(10_000);
        let pair = RequestId::new("r1");
        let (a, b) = (coord(77.6, 12.9), coord(77.59, 12.97));

        let q1 = estimator.request(BASE, &pair, a, b, UnixTimeMs(0)).unwrap().unwrap();
        estimator.on_success(q1.generation, route(120.0), UnixTimeMs(100));

        let q2 = estimator.request(BASE, &pair, a, b, UnixTimeMs(10_100)).unwrap().unwrap();
        estimator.on_failure(q2.generation, &RouteError::Transport("offline".into()));
        assert_eq!(estimator.estimate().unwrap().duration_seconds, 120.0);
    }

    #[test]
    fn late_older_result_does_not_overwrite_newer() {
        let mut estimator = RouteEstimator::new(10_000);
        let pair = RequestId::new("r1");
        let (a, b) = (coord(77.6, 12.9), coord(77.59, 12.97));

        let q1 = estimator.request(BASE, &pair, a, b, UnixTimeMs(0)).unwrap().unwrap();
        let q2 = estimator.request(BASE, &pair, a, b, UnixTimeMs(10_000)).unwrap().unwrap();
        assert!(estimator.on_success(q2.generation, route(200.0), UnixTimeMs(11_000)));
        assert!(!estimator.on_success(q1.generation, route(900.0), UnixTimeMs(12_000)));
        assert_eq!(estimator.estimate().unwrap().duration_seconds, 200.0);
    }
}
