use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RequestId);
typed_id!(HelperId);
typed_id!(UserId);
typed_id!(LocalRequestId);

impl LocalRequestId {
    /// Client-side handle for a request the server has not named yet.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl RequestId {
    /// Last eight characters, as shown on outcome screens.
    #[must_use]
    pub fn short(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let start = chars.len().saturating_sub(8);
        format!("...{}", chars[start..].iter().collect::<String>())
    }
}

/// Unix timestamp in milliseconds. The core never reads the system clock;
/// every timestamp is supplied by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }
}

// --- Coordinates ---

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

/// Validated WGS84 position. The wire order is always `[longitude, latitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate", into = "RawCoordinate")]
pub struct Coordinate {
    lng: f64,
    lat: f64,
}

#[derive(Serialize, Deserialize)]
struct RawCoordinate {
    longitude: f64,
    latitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = CoordinateError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::from_lng_lat(raw.longitude, raw.latitude)
    }
}

impl From<Coordinate> for RawCoordinate {
    fn from(c: Coordinate) -> Self {
        Self {
            longitude: c.lng,
            latitude: c.lat,
        }
    }
}

/// Central Bangalore, used whenever the device cannot provide a position.
pub const FALLBACK_COORDINATE: Coordinate = Coordinate {
    lng: 77.5946,
    lat: 12.9716,
};

impl Coordinate {
    pub fn from_lng_lat(lng: f64, lat: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoordinateError::LongitudeOutOfRange(lng));
        }
        Ok(Self { lng, lat })
    }

    #[must_use]
    pub const fn lng(self) -> f64 {
        self.lng
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn as_lng_lat(self) -> [f64; 2] {
        [self.lng, self.lat]
    }

    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        haversine_distance(self, other)
    }

    /// Linear interpolation towards `to`; `t` is clamped to `[0, 1]` so the
    /// result is always a valid coordinate.
    #[must_use]
    pub fn lerp(self, to: Self, t: f64) -> Self {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 1.0 };
        Self {
            lng: self.lng + (to.lng - self.lng) * t,
            lat: self.lat + (to.lat - self.lat) * t,
        }
    }
}

impl TryFrom<[f64; 2]> for Coordinate {
    type Error = CoordinateError;

    fn try_from([lng, lat]: [f64; 2]) -> Result<Self, Self::Error> {
        Self::from_lng_lat(lng, lat)
    }
}

#[must_use]
pub fn haversine_distance(p1: Coordinate, p2: Coordinate) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.lat - p2.lat).abs() < EPSILON && (p1.lng - p2.lng).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = p1.lat.to_radians();
    let lat2_rad = p2.lat.to_radians();
    let delta_lat = (p2.lat - p1.lat).to_radians();
    let delta_lng = (p2.lng - p1.lng).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);

    EARTH_RADIUS_M * 2.0 * a.sqrt().asin()
}

// --- Roles & lifecycle vocabulary ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Seeker,
    Helper,
}

/// Who ended a request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    Seeker,
    Helper,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seeker => f.write_str("seeker"),
            Self::Helper => f.write_str("helper"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Idle,
    Searching,
    HelperFound,
    Confirming,
    EnRoute,
    Completed,
    Cancelled,
    Expired,
}

impl RequestStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// Statuses during which a cancellation window must exist.
    #[must_use]
    pub const fn has_cancel_window(self) -> bool {
        matches!(self, Self::Confirming | Self::EnRoute)
    }

    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Searching | Self::HelperFound | Self::Confirming | Self::EnRoute
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A matched helper as last reported by the server. Only `coordinate` is
/// ever refreshed after the match; everything else is replaced wholesale.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HelperMatch {
    pub helper_id: Option<HelperId>,
    pub name: String,
    pub rating: Option<f64>,
    pub coordinate: Option<Coordinate>,
}

impl HelperMatch {
    #[must_use]
    pub fn with_coordinate(&self, coordinate: Coordinate) -> Self {
        Self {
            coordinate: Some(coordinate),
            ..self.clone()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SearchForm {
    pub category: String,
    pub budget: u32,
    pub estimated_arrival_minutes: u32,
    /// Explicit search position; falls back to the latest device sample,
    /// then to the configured default.
    #[serde(default)]
    pub coordinate: Option<Coordinate>,
}

impl Default for SearchForm {
    fn default() -> Self {
        Self {
            category: "Moving Help".into(),
            budget: 50,
            estimated_arrival_minutes: 10,
            coordinate: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Request {
    pub local_id: LocalRequestId,
    /// Assigned by the server with the first `helper_found`.
    pub id: Option<RequestId>,
    pub category: String,
    pub budget: u32,
    pub estimated_arrival_minutes: u32,
    pub status: RequestStatus,
    pub seeker_coordinate: Coordinate,
    pub helper: Option<HelperMatch>,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub helpers_notified: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_rejects_out_of_range_and_non_finite() {
        assert_eq!(
            Coordinate::from_lng_lat(0.0, 91.0),
            Err(CoordinateError::LatitudeOutOfRange(91.0))
        );
        assert_eq!(
            Coordinate::from_lng_lat(-181.0, 0.0),
            Err(CoordinateError::LongitudeOutOfRange(-181.0))
        );
        assert_eq!(
            Coordinate::from_lng_lat(f64::NAN, 0.0),
            Err(CoordinateError::NonFinite)
        );
        assert!(Coordinate::from_lng_lat(77.59, 12.97).is_ok());
    }

    #[test]
    fn coordinate_serializes_with_wire_field_names() {
        let c = Coordinate::from_lng_lat(77.59, 12.97).unwrap();
        let json = serde_json::to_value(c).unwrap();
        assert_eq!(json, serde_json::json!({"longitude": 77.59, "latitude": 12.97}));

        let bad: Result<Coordinate, _> =
            serde_json::from_value(serde_json::json!({"longitude": 500.0, "latitude": 0.0}));
        assert!(bad.is_err());
    }

    #[test]
    fn lerp_clamps_progress() {
        let a = Coordinate::from_lng_lat(0.0, 0.0).unwrap();
        let b = Coordinate::from_lng_lat(10.0, 10.0).unwrap();
        assert_eq!(a.lerp(b, 0.5).as_lng_lat(), [5.0, 5.0]);
        assert_eq!(a.lerp(b, 2.0), b);
        assert_eq!(a.lerp(b, -1.0), a);
    }

    #[test]
    fn bangalore_distance_is_plausible() {
        let majestic = Coordinate::from_lng_lat(77.5713, 12.9767).unwrap();
        let mg_road = Coordinate::from_lng_lat(77.6070, 12.9756).unwrap();
        let d = majestic.distance_to(mg_road);
        assert!((3_500.0..4_200.0).contains(&d), "distance was {d}");
        assert_eq!(majestic.distance_to(majestic), 0.0);
    }

    #[test]
    fn request_id_short_form_keeps_last_eight() {
        assert_eq!(RequestId::new("65f0c2a9b1d4e7f812345678").short(), "...12345678");
        assert_eq!(RequestId::new("r1").short(), "...r1");
    }

    #[test]
    fn terminal_statuses() {
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(RequestStatus::Expired.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(!RequestStatus::EnRoute.is_terminal());
        assert!(RequestStatus::Confirming.has_cancel_window());
        assert!(!RequestStatus::HelperFound.has_cancel_window());
    }
}
