//! Realtime channel wire protocol.
//!
//! Outbound messages are a closed enum serialized as
//! `{"event": "...", "payload": {...}}`. Inbound messages arrive from the
//! shell as an event name plus a raw JSON payload and are parsed into
//! [`ServerMessage`]; anything unknown or malformed is rejected here so the
//! state machines only ever see well-formed variants.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{
    Coordinate, CoordinateError, HelperId, HelperMatch, Party, RequestId, Role, UnixTimeMs,
};

// --- Errors ---

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown server event `{0}`")]
    UnknownEvent(String),
    #[error("malformed `{event}` payload: {source}")]
    Malformed {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{event}` payload is missing {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
    #[error("`{event}` payload has an invalid coordinate: {source}")]
    Coordinate {
        event: &'static str,
        #[source]
        source: CoordinateError,
    },
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("invalid RFC 3339 timestamp `{0}`")]
    Invalid(String),
    #[error("timestamp `{0}` predates the unix epoch")]
    BeforeEpoch(String),
}

// --- Outbound ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SearchHelp {
        category: String,
        budget: u32,
        estimated_arrival_time: u32,
        longitude: f64,
        latitude: f64,
    },
    #[serde(rename_all = "camelCase")]
    ConfirmHelper { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    CancelRequest { request_id: RequestId },
    GoOnline { longitude: f64, latitude: f64 },
    GoOffline {},
    #[serde(rename_all = "camelCase")]
    AcceptRequest { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    RejectRequest {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    LocationUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        longitude: f64,
        latitude: f64,
    },
}

impl ClientMessage {
    #[must_use]
    pub fn location_update(request_id: Option<RequestId>, at: Coordinate) -> Self {
        Self::LocationUpdate {
            request_id,
            longitude: at.lng(),
            latitude: at.lat(),
        }
    }

    #[must_use]
    pub fn go_online(at: Coordinate) -> Self {
        Self::GoOnline {
            longitude: at.lng(),
            latitude: at.lat(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SearchHelp { .. } => "search_help",
            Self::ConfirmHelper { .. } => "confirm_helper",
            Self::CancelRequest { .. } => "cancel_request",
            Self::GoOnline { .. } => "go_online",
            Self::GoOffline {} => "go_offline",
            Self::AcceptRequest { .. } => "accept_request",
            Self::RejectRequest { .. } => "reject_request",
            Self::LocationUpdate { .. } => "location_update",
        }
    }
}

// --- Inbound ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServerEventKind {
    SearchStarted,
    NewRequest,
    RequestLocked,
    HelperFound,
    HelperOnTheWay,
    ConfirmRedirect,
    LocationUpdate,
    RequestCancelled,
    RequestExpired,
    CancelWindowExpired,
    RequestCompleted,
    Error,
}

impl ServerEventKind {
    const ALL: [(Self, &'static str); 12] = [
        (Self::SearchStarted, "search_started"),
        (Self::NewRequest, "new_request"),
        (Self::RequestLocked, "request_locked"),
        (Self::HelperFound, "helper_found"),
        (Self::HelperOnTheWay, "helper_on_the_way"),
        (Self::ConfirmRedirect, "confirm_redirect"),
        (Self::LocationUpdate, "location_update"),
        (Self::RequestCancelled, "request_cancelled"),
        (Self::RequestExpired, "request_expired"),
        (Self::CancelWindowExpired, "cancel_window_expired"),
        (Self::RequestCompleted, "request_completed"),
        (Self::Error, "error"),
    ];

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(_, wire)| *wire == name)
            .map(|(kind, _)| *kind)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(kind, _)| *kind == self)
            .map_or("unknown", |(_, wire)| wire)
    }

    /// Events a client of the given role listens for.
    #[must_use]
    pub fn for_role(role: Role) -> &'static [Self] {
        match role {
            Role::Seeker => &[
                Self::SearchStarted,
                Self::HelperFound,
                Self::HelperOnTheWay,
                Self::ConfirmRedirect,
                Self::LocationUpdate,
                Self::RequestCancelled,
                Self::RequestExpired,
                Self::CancelWindowExpired,
                Self::RequestCompleted,
                Self::Error,
            ],
            Role::Helper => &[
                Self::NewRequest,
                Self::RequestLocked,
                Self::ConfirmRedirect,
                Self::RequestCancelled,
                Self::CancelWindowExpired,
                Self::RequestCompleted,
                Self::Error,
            ],
        }
    }
}

/// A request offered to an online helper.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IncomingRequest {
    pub request_id: RequestId,
    pub category: String,
    pub budget: Option<f64>,
    pub estimated_arrival_minutes: Option<u32>,
    pub seeker_coordinate: Option<Coordinate>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    SearchStarted {
        helpers_notified: Option<u32>,
    },
    NewRequest(IncomingRequest),
    RequestLocked {
        request_id: Option<RequestId>,
        message: Option<String>,
    },
    HelperFound {
        request_id: RequestId,
        helper: HelperMatch,
    },
    HelperOnTheWay {
        request_id: Option<RequestId>,
        cancel_window_expires_at: Option<UnixTimeMs>,
    },
    ConfirmRedirect {
        request_id: RequestId,
        cancel_window_expires_at: Option<UnixTimeMs>,
        seeker_location: Option<Coordinate>,
        seeker_address: Option<String>,
    },
    LocationUpdate {
        request_id: Option<RequestId>,
        coordinate: Coordinate,
    },
    RequestCancelled {
        request_id: Option<RequestId>,
        reason: Option<String>,
        rejected_by: Option<Party>,
    },
    RequestExpired {
        request_id: Option<RequestId>,
    },
    CancelWindowExpired {
        request_id: Option<RequestId>,
    },
    RequestCompleted {
        request_id: Option<RequestId>,
    },
    Error {
        message: Option<String>,
    },
}

impl ServerMessage {
    /// Parses one inbound event. A `null` payload is treated as `{}`.
    pub fn from_wire(event: &str, payload: Value) -> Result<Self, ProtocolError> {
        let kind = ServerEventKind::from_name(event)
            .ok_or_else(|| ProtocolError::UnknownEvent(event.to_string()))?;
        let payload = match payload {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let name = kind.name();

        Ok(match kind {
            ServerEventKind::SearchStarted => {
                let raw: RawSearchStarted = decode(name, payload)?;
                Self::SearchStarted {
                    helpers_notified: raw.helpers_notified,
                }
            }
            ServerEventKind::NewRequest => {
                let raw: RawNewRequest = decode(name, payload)?;
                let seeker_coordinate = match raw.seeker_location {
                    Some(point) => point.resolve(name)?,
                    None => None,
                };
                Self::NewRequest(IncomingRequest {
                    request_id: raw.request_id,
                    category: raw.category.unwrap_or_default(),
                    budget: raw.budget,
                    estimated_arrival_minutes: raw.estimated_arrival_time,
                    seeker_coordinate,
                })
            }
            ServerEventKind::RequestLocked => {
                let raw: RawRequestNotice = decode(name, payload)?;
                Self::RequestLocked {
                    request_id: raw.request_id,
                    message: raw.message,
                }
            }
            ServerEventKind::HelperFound => {
                let raw: RawHelperFound = decode(name, payload)?;
                let helper = raw.helper.unwrap_or_default().into_match(name)?;
                Self::HelperFound {
                    request_id: raw.request_id,
                    helper,
                }
            }
            ServerEventKind::HelperOnTheWay => {
                let raw: RawRedirect = decode(name, payload)?;
                Self::HelperOnTheWay {
                    request_id: raw.request_id,
                    cancel_window_expires_at: raw
                        .cancel_window_expires_at
                        .map(WireTimestamp::into_unix_ms)
                        .transpose()?,
                }
            }
            ServerEventKind::ConfirmRedirect => {
                let raw: RawRedirect = decode(name, payload)?;
                let request_id = raw.request_id.ok_or(ProtocolError::MissingField {
                    event: name,
                    field: "requestId",
                })?;
                let seeker_location = match raw.seeker_location {
                    Some(point) => point.resolve(name)?,
                    None => None,
                };
                Self::ConfirmRedirect {
                    request_id,
                    cancel_window_expires_at: raw
                        .cancel_window_expires_at
                        .map(WireTimestamp::into_unix_ms)
                        .transpose()?,
                    seeker_location,
                    seeker_address: raw.seeker_address.or(raw.address),
                }
            }
            ServerEventKind::LocationUpdate => {
                let raw: RawLocationUpdate = decode(name, payload)?;
                let coordinate = raw.point.resolve(name)?.ok_or(ProtocolError::MissingField {
                    event: name,
                    field: "longitude/latitude",
                })?;
                Self::LocationUpdate {
                    request_id: raw.request_id,
                    coordinate,
                }
            }
            ServerEventKind::RequestCancelled => {
                let raw: RawCancelled = decode(name, payload)?;
                Self::RequestCancelled {
                    request_id: raw.request_id,
                    reason: raw.reason.or(raw.message),
                    rejected_by: raw.rejected_by,
                }
            }
            ServerEventKind::RequestExpired => Self::RequestExpired {
                request_id: decode::<RawRequestNotice>(name, payload)?.request_id,
            },
            ServerEventKind::CancelWindowExpired => Self::CancelWindowExpired {
                request_id: decode::<RawRequestNotice>(name, payload)?.request_id,
            },
            ServerEventKind::RequestCompleted => Self::RequestCompleted {
                request_id: decode::<RawRequestNotice>(name, payload)?.request_id,
            },
            ServerEventKind::Error => Self::Error {
                message: decode::<RawRequestNotice>(name, payload)?.message,
            },
        })
    }

    #[must_use]
    pub fn kind(&self) -> ServerEventKind {
        match self {
            Self::SearchStarted { .. } => ServerEventKind::SearchStarted,
            Self::NewRequest(_) => ServerEventKind::NewRequest,
            Self::RequestLocked { .. } => ServerEventKind::RequestLocked,
            Self::HelperFound { .. } => ServerEventKind::HelperFound,
            Self::HelperOnTheWay { .. } => ServerEventKind::HelperOnTheWay,
            Self::ConfirmRedirect { .. } => ServerEventKind::ConfirmRedirect,
            Self::LocationUpdate { .. } => ServerEventKind::LocationUpdate,
            Self::RequestCancelled { .. } => ServerEventKind::RequestCancelled,
            Self::RequestExpired { .. } => ServerEventKind::RequestExpired,
            Self::CancelWindowExpired { .. } => ServerEventKind::CancelWindowExpired,
            Self::RequestCompleted { .. } => ServerEventKind::RequestCompleted,
            Self::Error { .. } => ServerEventKind::Error,
        }
    }

    /// The request this message refers to, when it names one.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::NewRequest(incoming) => Some(&incoming.request_id),
            Self::HelperFound { request_id, .. } | Self::ConfirmRedirect { request_id, .. } => {
                Some(request_id)
            }
            Self::RequestLocked { request_id, .. }
            | Self::HelperOnTheWay { request_id, .. }
            | Self::LocationUpdate { request_id, .. }
            | Self::RequestCancelled { request_id, .. }
            | Self::RequestExpired { request_id }
            | Self::CancelWindowExpired { request_id }
            | Self::RequestCompleted { request_id } => request_id.as_ref(),
            Self::SearchStarted { .. } | Self::Error { .. } => None,
        }
    }
}

fn decode<T: DeserializeOwned>(event: &'static str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::Malformed { event, source })
}

/// `cancelWindowExpiresAt` arrives either as epoch milliseconds or as an
/// RFC 3339 string.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(u64),
    Text(String),
}

impl WireTimestamp {
    pub fn into_unix_ms(self) -> Result<UnixTimeMs, TimestampError> {
        match self {
            Self::Millis(ms) => Ok(UnixTimeMs(ms)),
            Self::Text(text) => {
                let parsed = chrono::DateTime::parse_from_rfc3339(&text)
                    .map_err(|_| TimestampError::Invalid(text.clone()))?;
                u64::try_from(parsed.timestamp_millis())
                    .map(UnixTimeMs)
                    .map_err(|_| TimestampError::BeforeEpoch(text))
            }
        }
    }
}

// --- Raw payload shapes ---

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawPoint {
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    coordinates: Option<Vec<f64>>,
}

impl RawPoint {
    fn resolve(self, event: &'static str) -> Result<Option<Coordinate>, ProtocolError> {
        let pair = match (self.longitude, self.latitude, self.coordinates) {
            (Some(lng), Some(lat), _) => Some((lng, lat)),
            (_, _, Some(c)) if c.len() >= 2 => Some((c[0], c[1])),
            _ => None,
        };
        pair.map(|(lng, lat)| Coordinate::from_lng_lat(lng, lat))
            .transpose()
            .map_err(|source| ProtocolError::Coordinate { event, source })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSearchStarted {
    #[serde(default)]
    helpers_notified: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNewRequest {
    request_id: RequestId,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    budget: Option<f64>,
    #[serde(default)]
    estimated_arrival_time: Option<u32>,
    #[serde(default)]
    seeker_location: Option<RawPoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequestNotice {
    #[serde(default)]
    request_id: Option<RequestId>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawHelper {
    #[serde(default, alias = "_id", alias = "id")]
    helper_id: Option<HelperId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    current_location: Option<RawPoint>,
}

impl RawHelper {
    fn into_match(self, event: &'static str) -> Result<HelperMatch, ProtocolError> {
        let flat = RawPoint {
            longitude: self.longitude,
            latitude: self.latitude,
            coordinates: None,
        };
        let coordinate = match flat.resolve(event)? {
            Some(c) => Some(c),
            None => match self.current_location {
                Some(point) => point.resolve(event)?,
                None => None,
            },
        };
        Ok(HelperMatch {
            helper_id: self.helper_id,
            name: self.name.unwrap_or_else(|| "Helper".to_string()),
            rating: self.rating,
            coordinate,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHelperFound {
    request_id: RequestId,
    #[serde(default)]
    helper: Option<RawHelper>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRedirect {
    #[serde(default)]
    request_id: Option<RequestId>,
    #[serde(default)]
    cancel_window_expires_at: Option<WireTimestamp>,
    #[serde(default)]
    seeker_location: Option<RawPoint>,
    #[serde(default)]
    seeker_address: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLocationUpdate {
    #[serde(default)]
    request_id: Option<RequestId>,
    #[serde(flatten)]
    point: RawPoint,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCancelled {
    #[serde(default)]
    request_id: Option<RequestId>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    rejected_by: Option<Party>,
}
