use serde::{Deserialize, Serialize};

use crate::app::Model;
use crate::channel_session::{ChannelStatus, ConnectionState};
use crate::error::{AppError, ErrorSeverity};
use crate::lifecycle::{NoticeLevel, Notice, Outcome};
use crate::model::{Coordinate, Party, RequestId, RequestStatus, Role, UnixTimeMs};
use crate::protocol::IncomingRequest;
use crate::route::RouteEstimator;
use crate::{eta_progress_percent, format_clock, format_distance_km, format_eta_text};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub connection: ConnectionView,
    pub screen: Screen,
    pub toast: Option<ToastView>,
    pub error: Option<UserFacingError>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConnectionView {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub gave_up: bool,
    pub warning: Option<String>,
}

impl From<ChannelStatus> for ConnectionView {
    fn from(status: ChannelStatus) -> Self {
        Self {
            state: status.state,
            reconnect_attempt: status.reconnect_attempt,
            gave_up: status.gave_up,
            warning: status.warning,
        }
    }
}

/// Route-derived figures; every text is `None` until the first estimate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct RouteView {
    pub eta_text: Option<String>,
    pub eta_clock: Option<String>,
    pub eta_progress_percent: u8,
    pub distance_text: Option<String>,
    pub polyline: Vec<[f64; 2]>,
}

impl RouteView {
    fn build(route: &RouteEstimator, now: UnixTimeMs) -> Self {
        let Some(estimate) = route.estimate() else {
            return Self {
                eta_progress_percent: eta_progress_percent(None, None),
                ..Self::default()
            };
        };
        let remaining = route.eta_remaining_seconds(now);
        Self {
            eta_text: Some(format_eta_text(estimate.duration_seconds)),
            eta_clock: remaining.map(|s| format_clock(i64::try_from(s).unwrap_or(i64::MAX))),
            eta_progress_percent: eta_progress_percent(Some(estimate.duration_seconds), remaining),
            distance_text: Some(format_distance_km(estimate.distance_meters)),
            polyline: estimate.polyline(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IncomingRequestView {
    pub request_id: RequestId,
    pub short_id: String,
    pub category: String,
    pub budget: Option<f64>,
    pub estimated_arrival_minutes: Option<u32>,
}

impl From<&IncomingRequest> for IncomingRequestView {
    fn from(request: &IncomingRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            short_id: request.request_id.short(),
            category: request.category.clone(),
            budget: request.budget,
            estimated_arrival_minutes: request.estimated_arrival_minutes,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Screen {
    SignedOut,
    Search {
        searching: bool,
        helpers_notified: Option<u32>,
        position: [f64; 2],
        location_error: Option<String>,
    },
    HelperReview {
        short_id: Option<String>,
        helper_name: String,
        rating: Option<f64>,
        helper_position: Option<[f64; 2]>,
        confirming: bool,
    },
    Tracking {
        short_id: Option<String>,
        status: RequestStatus,
        helper_name: Option<String>,
        helper_position: Option<[f64; 2]>,
        seeker_position: [f64; 2],
        can_cancel: bool,
        cancel_clock: Option<String>,
        route: RouteView,
    },
    Outcome {
        status: RequestStatus,
        cancelled_by: Option<Party>,
        reason: Option<String>,
        short_id: Option<String>,
    },
    HelperDashboard {
        online: bool,
        position: [f64; 2],
        incoming: Vec<IncomingRequestView>,
    },
    HelperNavigation {
        short_id: String,
        seeker_address: String,
        seeker_position: Option<[f64; 2]>,
        helper_position: [f64; 2],
        can_reject: bool,
        reject_clock: Option<String>,
        route: RouteView,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToastView {
    pub message: String,
    pub level: NoticeLevel,
}

impl From<&Notice> for ToastView {
    fn from(notice: &Notice) -> Self {
        Self {
            message: notice.message.clone(),
            level: notice.level,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserFacingError {
    pub message: String,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub error_code: String,
}

impl From<&AppError> for UserFacingError {
    fn from(e: &AppError) -> Self {
        Self {
            message: e.user_facing_message(),
            is_transient: e.severity == ErrorSeverity::Transient,
            is_retryable: e.is_retryable(),
            error_code: e.code().to_string(),
        }
    }
}

fn outcome_screen(outcome: &Outcome) -> Screen {
    Screen::Outcome {
        status: outcome.status,
        cancelled_by: outcome.cancelled_by,
        reason: outcome.reason.clone(),
        short_id: outcome.request_id.as_ref().map(RequestId::short),
    }
}

pub(crate) fn build(model: &Model) -> ViewModel {
    let screen = match model.identity.as_ref().map(|i| i.role) {
        None => Screen::SignedOut,
        Some(Role::Seeker) => seeker_screen(model),
        Some(Role::Helper) => helper_screen(model),
    };

    ViewModel {
        connection: model.session.status().into(),
        screen,
        toast: model.toast.as_ref().map(ToastView::from),
        error: model.error.as_ref().map(UserFacingError::from),
    }
}

fn own_position(model: &Model) -> Coordinate {
    model.location.position_or(model.config.default_coordinate)
}

fn seeker_screen(model: &Model) -> Screen {
    let now = model.now;
    let Some(request) = model.seeker.active() else {
        if let Some(outcome) = model.seeker.outcome() {
            return outcome_screen(outcome);
        }
        return Screen::Search {
            searching: false,
            helpers_notified: None,
            position: own_position(model).as_lng_lat(),
            location_error: model.location.last_error().map(ToString::to_string),
        };
    };

    let short_id = request.id.as_ref().map(RequestId::short);
    match request.status {
        RequestStatus::Searching | RequestStatus::Idle => Screen::Search {
            searching: request.status == RequestStatus::Searching,
            helpers_notified: request.helpers_notified,
            position: request.seeker_coordinate.as_lng_lat(),
            location_error: model.location.last_error().map(ToString::to_string),
        },
        RequestStatus::HelperFound => Screen::HelperReview {
            short_id,
            helper_name: request
                .helper
                .as_ref()
                .map_or_else(|| "Helper".to_string(), |h| h.name.clone()),
            rating: request.helper.as_ref().and_then(|h| h.rating),
            helper_position: model
                .animator
                .position_at(now)
                .map(Coordinate::as_lng_lat),
            confirming: model.seeker.is_confirming(),
        },
        status => Screen::Tracking {
            short_id,
            status,
            helper_name: request.helper.as_ref().map(|h| h.name.clone()),
            helper_position: model
                .animator
                .position_at(now)
                .map(Coordinate::as_lng_lat),
            seeker_position: request.seeker_coordinate.as_lng_lat(),
            can_cancel: model.seeker.can_cancel(now),
            cancel_clock: model
                .seeker
                .cancel_window()
                .map(|w| format_clock(i64::try_from(w.remaining_seconds(now)).unwrap_or(i64::MAX))),
            route: RouteView::build(&model.route, now),
        },
    }
}

fn helper_screen(model: &Model) -> Screen {
    let now = model.now;
    let helper_position = own_position(model).as_lng_lat();

    if let Some(assignment) = model.helper.assignment() {
        return Screen::HelperNavigation {
            short_id: assignment.request_id.short(),
            seeker_address: assignment.seeker_address.clone(),
            seeker_position: assignment.seeker_location.map(Coordinate::as_lng_lat),
            helper_position,
            can_reject: model.helper.can_reject(now),
            reject_clock: model
                .helper
                .window_remaining_seconds(now)
                .map(|s| format_clock(i64::try_from(s).unwrap_or(i64::MAX))),
            route: RouteView::build(&model.route, now),
        };
    }
    if let Some(outcome) = model.helper.outcome() {
        return outcome_screen(outcome);
    }
    Screen::HelperDashboard {
        online: model.helper.is_online(),
        position: helper_position,
        incoming: model
            .helper
            .incoming()
            .into_iter()
            .map(IncomingRequestView::from)
            .collect(),
    }
}
