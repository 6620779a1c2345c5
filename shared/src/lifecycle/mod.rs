//! Request lifecycle state machines.
//!
//! [`RequestLifecycle`] owns the seeker's single active request;
//! [`helper::HelperDuty`] owns the helper side. Both are the only writers of
//! the session snapshot: every displayable transition yields
//! [`LifecycleEffect::Persist`] and every terminal one yields
//! [`LifecycleEffect::ClearSnapshot`].

pub mod helper;

use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::channel_session::DroppedEmission;
use crate::countdown::Countdown;
use crate::error::AppError;
use crate::model::{
    Coordinate, LocalRequestId, Party, Request, RequestId, RequestStatus, SearchForm, UnixTimeMs,
};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::snapshot::{SeekerSnapshot, SessionSnapshot};

/// Outbound side of the channel as the state machines see it.
pub trait Emitter {
    fn emit(&mut self, message: ClientMessage) -> Result<(), DroppedEmission>;
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LifecycleError {
    #[error("a request is already in progress")]
    RequestActive,
    #[error("there is no active request")]
    NoActiveRequest,
    #[error("cannot {action} while the request is {status}")]
    InvalidTransition {
        action: &'static str,
        status: RequestStatus,
    },
    #[error("a confirmation is already in flight")]
    ConfirmInFlight,
    #[error("the cancellation window has closed")]
    CancelWindowClosed,
    #[error("the request has not been assigned an id yet")]
    MissingRequestId,
    #[error("invalid search: {0}")]
    InvalidSearch(&'static str),
    #[error("a reason is required")]
    ReasonRequired,
    #[error("request {0} is not on offer")]
    UnknownOffer(RequestId),
    #[error("no navigation in progress")]
    NoAssignment,
    #[error(transparent)]
    Dropped(#[from] DroppedEmission),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Transient, dismissable message for the user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// How a request ended. Kept in memory only, for the outcome screen.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Outcome {
    pub status: RequestStatus,
    pub request_id: Option<RequestId>,
    pub cancelled_by: Option<Party>,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEffect {
    Persist(SessionSnapshot),
    ClearSnapshot,
    Notice(Notice),
    /// A user-visible server rejection.
    Rejected(AppError),
    /// The remote party reported a new position.
    PeerMoved(Coordinate),
    /// Helper navigation began towards the seeker.
    NavigationStarted {
        request_id: RequestId,
        destination: Option<Coordinate>,
    },
    Finished(Outcome),
}

/// Time-bounded permission to cancel after confirmation.
#[derive(Clone, Debug, PartialEq)]
pub struct CancellationWindow {
    countdown: Countdown,
    provisional: bool,
}

impl CancellationWindow {
    #[must_use]
    pub fn expires_at(&self) -> UnixTimeMs {
        self.countdown.ends_at()
    }

    /// True until the server supplies the real deadline.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.provisional
    }

    #[must_use]
    pub fn remaining_seconds(&self, now: UnixTimeMs) -> u64 {
        self.countdown.remaining_seconds(now)
    }

    #[must_use]
    pub fn is_open(&self, now: UnixTimeMs) -> bool {
        !self.countdown.has_expired() && self.countdown.is_active(now)
    }
}

/// Finished request ids remembered so late events naming them are dropped.
const RETIRED_CAPACITY: NonZeroUsize = match NonZeroUsize::new(16) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// The seeker's request state machine.
#[derive(Debug)]
pub struct RequestLifecycle {
    active: Option<Request>,
    window: Option<CancellationWindow>,
    confirm_in_flight: bool,
    outcome: Option<Outcome>,
    retired: LruCache<RequestId, ()>,
    provisional_window_ms: u64,
}

impl Default for RequestLifecycle {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PROVISIONAL_CANCEL_WINDOW_MS)
    }
}

impl RequestLifecycle {
    #[must_use]
    pub fn new(provisional_window_ms: u64) -> Self {
        Self {
            active: None,
            window: None,
            confirm_in_flight: false,
            outcome: None,
            retired: LruCache::new(RETIRED_CAPACITY),
            provisional_window_ms,
        }
    }

    pub fn set_provisional_window(&mut self, ms: u64) {
        self.provisional_window_ms = ms;
    }

    #[must_use]
    pub fn active(&self) -> Option<&Request> {
        self.active.as_ref()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    #[must_use]
    pub fn cancel_window(&self) -> Option<&CancellationWindow> {
        self.window.as_ref()
    }

    #[must_use]
    pub fn is_confirming(&self) -> bool {
        self.confirm_in_flight
    }

    /// Active status, else the terminal status being shown, else `Idle`.
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        match (&self.active, &self.outcome) {
            (Some(request), _) => request.status,
            (None, Some(outcome)) => outcome.status,
            (None, None) => RequestStatus::Idle,
        }
    }

    #[must_use]
    pub fn can_cancel(&self, now: UnixTimeMs) -> bool {
        match &self.active {
            Some(r) if r.status.has_cancel_window() => {
                self.window.as_ref().is_some_and(|w| w.is_open(now))
            }
            Some(r) => {
                r.status.is_cancellable()
                    && (r.id.is_some() || r.status == RequestStatus::Searching)
            }
            None => false,
        }
    }

    #[instrument(skip_all, fields(category = %form.category))]
    pub fn submit_search(
        &mut self,
        form: &SearchForm,
        fallback: Coordinate,
        emitter: &mut impl Emitter,
        now: UnixTimeMs,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        if self.active.is_some() {
            return Err(LifecycleError::RequestActive);
        }
        let category = form.category.trim();
        if category.is_empty() {
            return Err(LifecycleError::InvalidSearch("category is required"));
        }
        if form.budget == 0 {
            return Err(LifecycleError::InvalidSearch("budget must be positive"));
        }
        if form.estimated_arrival_minutes == 0 {
            return Err(LifecycleError::InvalidSearch("arrival time must be positive"));
        }

        let coordinate = form.coordinate.unwrap_or(fallback);
        emitter.emit(ClientMessage::SearchHelp {
            category: category.to_string(),
            budget: form.budget,
            estimated_arrival_time: form.estimated_arrival_minutes,
            longitude: coordinate.lng(),
            latitude: coordinate.lat(),
        })?;

        info!(lng = coordinate.lng(), lat = coordinate.lat(), "search submitted");
        self.outcome = None;
        self.active = Some(Request {
            local_id: LocalRequestId::generate(),
            id: None,
            category: category.to_string(),
            budget: form.budget,
            estimated_arrival_minutes: form.estimated_arrival_minutes,
            status: RequestStatus::Searching,
            seeker_coordinate: coordinate,
            helper: None,
            created_at: now,
            helpers_notified: None,
        });
        Ok(self.persist())
    }

    #[instrument(skip_all)]
    pub fn confirm_helper(
        &mut self,
        emitter: &mut impl Emitter,
        now: UnixTimeMs,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        let request = self.active.as_ref().ok_or(LifecycleError::NoActiveRequest)?;
        if self.confirm_in_flight {
            debug!("duplicate confirm suppressed");
            return Err(LifecycleError::ConfirmInFlight);
        }
        if request.status != RequestStatus::HelperFound {
            return Err(LifecycleError::InvalidTransition {
                action: "confirm",
                status: request.status,
            });
        }
        let request_id = request.id.clone().ok_or(LifecycleError::MissingRequestId)?;

        emitter.emit(ClientMessage::ConfirmHelper {
            request_id: request_id.clone(),
        })?;

        info!(%request_id, "confirming helper");
        self.confirm_in_flight = true;
        self.set_status(RequestStatus::Confirming);
        self.window = Some(CancellationWindow {
            countdown: Countdown::starting_at(now, self.provisional_window_ms),
            provisional: true,
        });
        let mut effects = vec![LifecycleEffect::Notice(Notice::info("Confirming helper..."))];
        effects.extend(self.persist());
        Ok(effects)
    }

    #[instrument(skip_all)]
    pub fn cancel_by_user(
        &mut self,
        emitter: &mut impl Emitter,
        now: UnixTimeMs,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        let request = self.active.as_ref().ok_or(LifecycleError::NoActiveRequest)?;
        if !request.status.is_cancellable() {
            return Err(LifecycleError::InvalidTransition {
                action: "cancel",
                status: request.status,
            });
        }
        if request.status.has_cancel_window() && !self.can_cancel(now) {
            return Err(LifecycleError::CancelWindowClosed);
        }
        if request.id.is_none() && request.status == RequestStatus::Searching {
            // Nothing the server could match yet; end the search locally.
            info!("search cancelled before a request id was assigned");
            return Ok(self.finish(
                RequestStatus::Cancelled,
                Some(Party::Seeker),
                Some("You cancelled the request.".into()),
            ));
        }
        let request_id = request.id.clone().ok_or(LifecycleError::MissingRequestId)?;

        emitter.emit(ClientMessage::CancelRequest {
            request_id: request_id.clone(),
        })?;

        info!(%request_id, "cancelled by seeker");
        Ok(self.finish(
            RequestStatus::Cancelled,
            Some(Party::Seeker),
            Some("You cancelled the request.".into()),
        ))
    }

    /// Applies one server event. Events naming a request other than the
    /// active one are ignored.
    #[instrument(skip_all, fields(event = message.kind().name()))]
    pub fn handle(&mut self, message: &ServerMessage, now: UnixTimeMs) -> Vec<LifecycleEffect> {
        if let ServerMessage::Error { message } = message {
            return self.on_server_error(message.clone());
        }

        let Some(request) = self.active.as_ref() else {
            debug!("no active request, ignoring");
            return Vec::new();
        };

        match (request.id.as_ref(), message.request_id()) {
            (Some(active), Some(named)) if active != named => {
                warn!(%active, %named, "event for another request ignored");
                return Vec::new();
            }
            (None, Some(named)) if self.retired.contains(named) => {
                warn!(%named, "event for a finished request ignored");
                return Vec::new();
            }
            _ => {}
        }

        let status = request.status;
        match message {
            ServerMessage::SearchStarted { helpers_notified } if status == RequestStatus::Searching => {
                if let Some(request) = self.active.as_mut() {
                    request.helpers_notified = *helpers_notified;
                }
                let text = match helpers_notified {
                    Some(n) => format!("Searching... {n} helper(s) nearby"),
                    None => "Searching for helpers...".to_string(),
                };
                let mut effects = vec![LifecycleEffect::Notice(Notice::info(text))];
                effects.extend(self.persist());
                effects
            }

            ServerMessage::HelperFound { request_id, helper }
                if matches!(status, RequestStatus::Searching | RequestStatus::HelperFound) =>
            {
                if let Some(request) = self.active.as_mut() {
                    request.id = Some(request_id.clone());
                    request.helper = Some(helper.clone());
                    request.status = RequestStatus::HelperFound;
                }
                info!(%request_id, helper = %helper.name, "helper found");
                let mut effects = vec![LifecycleEffect::Notice(Notice::success(
                    "Helper found! Reviewing details...",
                ))];
                if let Some(at) = helper.coordinate {
                    effects.push(LifecycleEffect::PeerMoved(at));
                }
                effects.extend(self.persist());
                effects
            }

            ServerMessage::HelperOnTheWay {
                cancel_window_expires_at,
                ..
            }
            | ServerMessage::ConfirmRedirect {
                cancel_window_expires_at,
                ..
            } if matches!(status, RequestStatus::Confirming | RequestStatus::EnRoute) => {
                self.enter_en_route(*cancel_window_expires_at, now)
            }

            ServerMessage::LocationUpdate { coordinate, .. } => {
                let Some(helper) = self.active.as_ref().and_then(|r| r.helper.as_ref()) else {
                    debug!("location update before a helper match, ignoring");
                    return Vec::new();
                };
                let moved = helper.with_coordinate(*coordinate);
                if let Some(request) = self.active.as_mut() {
                    request.helper = Some(moved);
                }
                let mut effects = vec![LifecycleEffect::PeerMoved(*coordinate)];
                effects.extend(self.persist());
                effects
            }

            ServerMessage::RequestCancelled {
                reason,
                rejected_by,
                ..
            } if status.is_cancellable() => {
                let by = rejected_by.unwrap_or(Party::Seeker);
                info!(cancelled_by = %by, "request cancelled by server");
                self.finish(RequestStatus::Cancelled, Some(by), reason.clone())
            }

            ServerMessage::RequestExpired { .. }
                if matches!(status, RequestStatus::Searching | RequestStatus::HelperFound) =>
            {
                info!("request expired");
                let mut effects = vec![LifecycleEffect::Notice(Notice::info("Request has expired"))];
                effects.extend(self.finish(RequestStatus::Expired, None, None));
                effects
            }

            ServerMessage::CancelWindowExpired { .. } => {
                let Some(window) = self.window.as_mut() else {
                    return Vec::new();
                };
                if window.countdown.expire(now) {
                    info!("cancellation window closed by server");
                }
                self.persist()
            }

            ServerMessage::RequestCompleted { .. } if status == RequestStatus::EnRoute => {
                info!("request completed");
                let mut effects = vec![LifecycleEffect::Notice(Notice::success("Request completed"))];
                effects.extend(self.finish(RequestStatus::Completed, None, None));
                effects
            }

            other => {
                debug!(%status, event = other.kind().name(), "event not applicable in this state");
                Vec::new()
            }
        }
    }

    /// Advances the cancellation window. Returns a notice the first time it
    /// closes.
    pub fn tick(&mut self, now: UnixTimeMs) -> Vec<LifecycleEffect> {
        let Some(window) = self.window.as_mut() else {
            return Vec::new();
        };
        if window.countdown.tick(now).expired_now {
            info!("cancellation window elapsed");
            return vec![LifecycleEffect::Notice(Notice::info(
                "The cancellation window has closed",
            ))];
        }
        Vec::new()
    }

    /// Restores state from a snapshot written before a reload.
    pub fn resume(&mut self, snapshot: SeekerSnapshot, now: UnixTimeMs) -> Vec<LifecycleEffect> {
        if self.active.is_some() {
            debug!("request already active, snapshot ignored");
            return Vec::new();
        }
        let status = snapshot.request.status;
        if status.is_terminal() || status == RequestStatus::Idle {
            warn!(%status, "snapshot holds no live request, clearing it");
            return vec![LifecycleEffect::ClearSnapshot];
        }

        info!(%status, "resuming request");
        self.window = status.has_cancel_window().then(|| {
            let countdown = match snapshot.cancel_window_ends_at {
                Some(ends_at) => Countdown::until(ends_at),
                None => Countdown::starting_at(now, self.provisional_window_ms),
            };
            CancellationWindow {
                countdown,
                provisional: snapshot.cancel_window_provisional,
            }
        });
        self.confirm_in_flight = status == RequestStatus::Confirming && snapshot.confirm_in_flight;
        let helper_at = snapshot.request.helper.as_ref().and_then(|h| h.coordinate);
        self.active = Some(snapshot.request);
        self.outcome = None;

        let mut effects = Vec::new();
        if let Some(at) = helper_at {
            effects.push(LifecycleEffect::PeerMoved(at));
        }
        effects.extend(self.persist());
        effects
    }

    /// Leaves the outcome screen.
    pub fn dismiss_outcome(&mut self) -> bool {
        self.outcome.take().is_some()
    }

    /// Drops everything, e.g. when the identity is cleared.
    pub fn reset(&mut self) {
        self.active = None;
        self.window = None;
        self.confirm_in_flight = false;
        self.outcome = None;
        self.retired.clear();
    }

    fn on_server_error(&mut self, message: Option<String>) -> Vec<LifecycleEffect> {
        let error = AppError::server_rejection(message);
        warn!(message = %error.message, "server rejected an action");
        let mut effects = vec![LifecycleEffect::Rejected(error)];

        if self.confirm_in_flight && self.status() == RequestStatus::Confirming {
            info!("rolling confirmation back");
            self.confirm_in_flight = false;
            self.window = None;
            self.set_status(RequestStatus::HelperFound);
            effects.extend(self.persist());
        }
        effects
    }

    fn enter_en_route(
        &mut self,
        expires_at: Option<UnixTimeMs>,
        now: UnixTimeMs,
    ) -> Vec<LifecycleEffect> {
        let arriving = self.status() == RequestStatus::Confirming;
        self.confirm_in_flight = false;
        self.set_status(RequestStatus::EnRoute);

        match expires_at {
            Some(ends_at) => {
                let closed = self
                    .window
                    .as_ref()
                    .is_some_and(|w| !w.provisional && w.countdown.has_expired());
                let mut countdown = Countdown::until(ends_at);
                if closed {
                    countdown.expire(now);
                }
                self.window = Some(CancellationWindow {
                    countdown,
                    provisional: false,
                });
            }
            None if self.window.is_none() => {
                self.window = Some(CancellationWindow {
                    countdown: Countdown::starting_at(now, self.provisional_window_ms),
                    provisional: true,
                });
            }
            None => {}
        }

        let mut effects = Vec::new();
        if arriving {
            info!("helper en route");
            effects.push(LifecycleEffect::Notice(Notice::success("Helper is on the way!")));
        }
        effects.extend(self.persist());
        effects
    }

    fn finish(
        &mut self,
        status: RequestStatus,
        cancelled_by: Option<Party>,
        reason: Option<String>,
    ) -> Vec<LifecycleEffect> {
        let request_id = self.active.take().and_then(|r| r.id);
        if let Some(id) = &request_id {
            self.retired.put(id.clone(), ());
        }
        self.window = None;
        self.confirm_in_flight = false;
        let outcome = Outcome {
            status,
            request_id,
            cancelled_by,
            reason,
        };
        self.outcome = Some(outcome.clone());
        vec![LifecycleEffect::ClearSnapshot, LifecycleEffect::Finished(outcome)]
    }

    fn set_status(&mut self, status: RequestStatus) {
        if let Some(request) = self.active.as_mut() {
            request.status = status;
        }
    }

    fn snapshot(&self) -> Option<SessionSnapshot> {
        let request = self.active.clone()?;
        Some(SessionSnapshot::Seeker(SeekerSnapshot {
            request,
            confirm_in_flight: self.confirm_in_flight,
            cancel_window_ends_at: self.window.as_ref().map(CancellationWindow::expires_at),
            cancel_window_provisional: self.window.as_ref().is_some_and(|w| w.provisional),
        }))
    }

    fn persist(&self) -> Vec<LifecycleEffect> {
        self.snapshot()
            .map(LifecycleEffect::Persist)
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel_session::ConnectionState;
    use crate::model::HelperMatch;

    /// Records what would have been sent; refuses while "offline".
    #[derive(Default)]
    pub(crate) struct RecordingEmitter {
        pub offline: bool,
        pub sent: Vec<ClientMessage>,
    }

    impl Emitter for RecordingEmitter {
        fn emit(&mut self, message: ClientMessage) -> Result<(), DroppedEmission> {
            if self.offline {
                return Err(DroppedEmission {
                    event: message.name(),
                    state: ConnectionState::Disconnected,
                });
            }
            self.sent.push(message);
            Ok(())
        }
    }

    fn here() -> Coordinate {
        Coordinate::from_lng_lat(77.59, 12.97).unwrap()
    }

    fn form() -> SearchForm {
        SearchForm {
            category: "Cleaning".into(),
            budget: 40,
            estimated_arrival_minutes: 15,
            coordinate: Some(here()),
        }
    }

    fn helper_found(id: &str) -> ServerMessage {
        ServerMessage::HelperFound {
            request_id: RequestId::new(id),
            helper: HelperMatch {
                helper_id: None,
                name: "Sam".into(),
                rating: Some(4.8),
                coordinate: None,
            },
        }
    }

    fn redirect(id: &str, ends_at: u64) -> ServerMessage {
        ServerMessage::ConfirmRedirect {
            request_id: RequestId::new(id),
            cancel_window_expires_at: Some(UnixTimeMs(ends_at)),
            seeker_location: None,
            seeker_address: None,
        }
    }

    fn window_invariant(lifecycle: &RequestLifecycle) -> bool {
        lifecycle.cancel_window().is_some()
            == lifecycle.active().is_some_and(|r| r.status.has_cancel_window())
    }

    /// Searching -> HelperFound -> Confirming -> EnRoute for request "r1".
    fn en_route(emitter: &mut RecordingEmitter) -> RequestLifecycle {
        let mut lifecycle = RequestLifecycle::default();
        lifecycle.submit_search(&form(), here(), emitter, UnixTimeMs(0)).unwrap();
        lifecycle.handle(&helper_found("r1"), UnixTimeMs(1_000));
        lifecycle.confirm_helper(emitter, UnixTimeMs(2_000)).unwrap();
        lifecycle.handle(&redirect("r1", 122_000), UnixTimeMs(2_000));
        lifecycle
    }

    #[test]
    fn happy_path_reaches_en_route_with_server_window() {
        let mut emitter = RecordingEmitter::default();
        let lifecycle = en_route(&mut emitter);

        assert_eq!(lifecycle.status(), RequestStatus::EnRoute);
        let window = lifecycle.cancel_window().unwrap();
        assert_eq!(window.expires_at(), UnixTimeMs(122_000));
        assert!(!window.is_provisional());
        assert!(!lifecycle.is_confirming());
        assert_eq!(
            emitter.sent.iter().map(ClientMessage::name).collect::<Vec<_>>(),
            vec!["search_help", "confirm_helper"]
        );
        assert!(window_invariant(&lifecycle));
    }

    #[test]
    fn search_emits_form_and_coordinate() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = RequestLifecycle::default();
        let effects = lifecycle
            .submit_search(&form(), here(), &mut emitter, UnixTimeMs(0))
            .unwrap();

        assert_eq!(lifecycle.status(), RequestStatus::Searching);
        assert!(matches!(effects.as_slice(), [LifecycleEffect::Persist(_)]));
        assert_eq!(
            emitter.sent[0],
            ClientMessage::SearchHelp {
                category: "Cleaning".into(),
                budget: 40,
                estimated_arrival_time: 15,
                longitude: 77.59,
                latitude: 12.97,
            }
        );
        assert_eq!(
            lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(1)),
            Err(LifecycleError::RequestActive)
        );
    }

    #[test]
    fn search_while_offline_stays_idle() {
        let mut emitter = RecordingEmitter {
            offline: true,
            ..RecordingEmitter::default()
        };
        let mut lifecycle = RequestLifecycle::default();
        let err = lifecycle
            .submit_search(&form(), here(), &mut emitter, UnixTimeMs(0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Dropped(_)));
        assert_eq!(lifecycle.status(), RequestStatus::Idle);
    }

    #[test]
    fn search_started_only_updates_count() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = RequestLifecycle::default();
        lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(0)).unwrap();
        lifecycle.handle(
            &ServerMessage::SearchStarted {
                helpers_notified: Some(3),
            },
            UnixTimeMs(10),
        );
        assert_eq!(lifecycle.status(), RequestStatus::Searching);
        assert_eq!(lifecycle.active().unwrap().helpers_notified, Some(3));
    }

    #[test]
    fn duplicate_confirm_is_suppressed() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = RequestLifecycle::default();
        lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(0)).unwrap();
        lifecycle.handle(&helper_found("r1"), UnixTimeMs(1));

        lifecycle.confirm_helper(&mut emitter, UnixTimeMs(2)).unwrap();
        assert_eq!(
            lifecycle.confirm_helper(&mut emitter, UnixTimeMs(3)),
            Err(LifecycleError::ConfirmInFlight)
        );
        assert_eq!(emitter.sent.len(), 2);
        let window = lifecycle.cancel_window().unwrap();
        assert!(window.is_provisional());
        assert_eq!(window.expires_at(), UnixTimeMs(120_002));
    }

    #[test]
    fn server_error_while_confirming_rolls_back() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = RequestLifecycle::default();
        lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(0)).unwrap();
        lifecycle.handle(&helper_found("r1"), UnixTimeMs(1));
        lifecycle.confirm_helper(&mut emitter, UnixTimeMs(2)).unwrap();

        let effects = lifecycle.handle(
            &ServerMessage::Error {
                message: Some("Helper unavailable".into()),
            },
            UnixTimeMs(3),
        );
        assert!(matches!(&effects[0], LifecycleEffect::Rejected(e) if e.message == "Helper unavailable"));
        assert_eq!(lifecycle.status(), RequestStatus::HelperFound);
        assert!(!lifecycle.is_confirming());
        assert!(window_invariant(&lifecycle));

        // The user can retry.
        assert!(lifecycle.confirm_helper(&mut emitter, UnixTimeMs(4)).is_ok());
    }

    #[test]
    fn mismatched_request_id_is_ignored() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = en_route(&mut emitter);

        let cancelled = ServerMessage::RequestCancelled {
            request_id: Some(RequestId::new("other")),
            reason: None,
            rejected_by: Some(Party::Helper),
        };
        assert!(lifecycle.handle(&cancelled, UnixTimeMs(3_000)).is_empty());
        assert!(lifecycle
            .handle(
                &ServerMessage::RequestCompleted {
                    request_id: Some(RequestId::new("other"))
                },
                UnixTimeMs(3_000)
            )
            .is_empty());
        assert_eq!(lifecycle.status(), RequestStatus::EnRoute);
    }

    #[test]
    fn location_update_requires_a_match() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = RequestLifecycle::default();
        lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(0)).unwrap();

        let moved = ServerMessage::LocationUpdate {
            request_id: None,
            coordinate: Coordinate::from_lng_lat(77.6, 12.9).unwrap(),
        };
        assert!(lifecycle.handle(&moved, UnixTimeMs(1)).is_empty());

        lifecycle.handle(&helper_found("r1"), UnixTimeMs(2));
        let effects = lifecycle.handle(&moved, UnixTimeMs(3));
        assert!(matches!(effects[0], LifecycleEffect::PeerMoved(_)));
        let helper = lifecycle.active().unwrap().helper.as_ref().unwrap();
        assert_eq!(helper.name, "Sam");
        assert_eq!(helper.coordinate.map(Coordinate::lng), Some(77.6));
    }

    #[test]
    fn helper_rejection_ends_as_cancelled_by_helper() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = en_route(&mut emitter);
        let effects = lifecycle.handle(
            &ServerMessage::RequestCancelled {
                request_id: Some(RequestId::new("r1")),
                reason: Some("Vehicle broke down".into()),
                rejected_by: Some(Party::Helper),
            },
            UnixTimeMs(5_000),
        );

        assert!(effects.contains(&LifecycleEffect::ClearSnapshot));
        assert_eq!(lifecycle.status(), RequestStatus::Cancelled);
        assert!(lifecycle.active().is_none());
        assert!(lifecycle.cancel_window().is_none());
        let outcome = lifecycle.outcome().unwrap();
        assert_eq!(outcome.cancelled_by, Some(Party::Helper));
        assert_eq!(outcome.reason.as_deref(), Some("Vehicle broke down"));

        assert!(lifecycle.dismiss_outcome());
        assert_eq!(lifecycle.status(), RequestStatus::Idle);
    }

    #[test]
    fn user_cancel_needs_open_window() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = en_route(&mut emitter);

        assert_eq!(
            lifecycle.cancel_by_user(&mut emitter, UnixTimeMs(130_000)),
            Err(LifecycleError::CancelWindowClosed)
        );
        lifecycle.handle(
            &ServerMessage::CancelWindowExpired { request_id: None },
            UnixTimeMs(10_000),
        );
        assert_eq!(
            lifecycle.cancel_by_user(&mut emitter, UnixTimeMs(10_001)),
            Err(LifecycleError::CancelWindowClosed)
        );
        assert_eq!(lifecycle.status(), RequestStatus::EnRoute);
    }

    #[test]
    fn searching_request_without_id_cancels_locally() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = RequestLifecycle::default();
        lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(0)).unwrap();
        assert!(lifecycle.can_cancel(UnixTimeMs(500)));

        let effects = lifecycle.cancel_by_user(&mut emitter, UnixTimeMs(1_000)).unwrap();

        assert_eq!(emitter.sent.len(), 1, "only search_help went out");
        assert_eq!(effects[0], LifecycleEffect::ClearSnapshot);
        assert_eq!(lifecycle.status(), RequestStatus::Cancelled);
        let outcome = lifecycle.outcome().unwrap();
        assert_eq!(outcome.cancelled_by, Some(Party::Seeker));
        assert_eq!(outcome.request_id, None);
        assert!(lifecycle.active().is_none());
    }

    #[test]
    fn matched_request_cancel_goes_to_the_server() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = en_route(&mut emitter);
        lifecycle.cancel_by_user(&mut emitter, UnixTimeMs(3_000)).unwrap();
        lifecycle.dismiss_outcome();

        lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(4_000)).unwrap();
        lifecycle.handle(&helper_found("r2"), UnixTimeMs(5_000));
        lifecycle.cancel_by_user(&mut emitter, UnixTimeMs(6_000)).unwrap();

        assert_eq!(
            emitter.sent.last(),
            Some(&ClientMessage::CancelRequest {
                request_id: RequestId::new("r2")
            })
        );
    }

    #[test]
    fn late_events_for_a_finished_request_leave_the_new_search_alone() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = RequestLifecycle::default();
        lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(0)).unwrap();
        lifecycle.handle(&helper_found("r1"), UnixTimeMs(1_000));
        lifecycle.cancel_by_user(&mut emitter, UnixTimeMs(2_000)).unwrap();
        lifecycle.dismiss_outcome();
        lifecycle.submit_search(&form(), here(), &mut emitter, UnixTimeMs(3_000)).unwrap();

        let stale = [
            ServerMessage::RequestCancelled {
                request_id: Some(RequestId::new("r1")),
                reason: None,
                rejected_by: Some(Party::Helper),
            },
            ServerMessage::RequestExpired {
                request_id: Some(RequestId::new("r1")),
            },
            helper_found("r1"),
        ];
        for message in &stale {
            assert!(lifecycle.handle(message, UnixTimeMs(4_000)).is_empty());
        }
        assert_eq!(lifecycle.status(), RequestStatus::Searching);
        assert_eq!(lifecycle.active().unwrap().id, None);

        // A fresh id still matches the new search.
        lifecycle.handle(&helper_found("r2"), UnixTimeMs(5_000));
        assert_eq!(lifecycle.status(), RequestStatus::HelperFound);
    }

    #[test]
    fn user_cancel_while_offline_leaves_status() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = en_route(&mut emitter);
        emitter.offline = true;

        let err = lifecycle.cancel_by_user(&mut emitter, UnixTimeMs(3_000)).unwrap_err();
        assert!(matches!(err, LifecycleError::Dropped(ref d) if d.event == "cancel_request"));
        assert_eq!(lifecycle.status(), RequestStatus::EnRoute);

        emitter.offline = false;
        lifecycle.cancel_by_user(&mut emitter, UnixTimeMs(3_000)).unwrap();
        assert_eq!(lifecycle.outcome().unwrap().cancelled_by, Some(Party::Seeker));
    }

    #[test]
    fn expiry_only_before_confirmation() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = en_route(&mut emitter);
        assert!(lifecycle
            .handle(&ServerMessage::RequestExpired { request_id: None }, UnixTimeMs(1))
            .is_empty());

        let mut searching = RequestLifecycle::default();
        searching.submit_search(&form(), here(), &mut emitter, UnixTimeMs(0)).unwrap();
        searching.handle(&ServerMessage::RequestExpired { request_id: None }, UnixTimeMs(1));
        assert_eq!(searching.status(), RequestStatus::Expired);
    }

    #[test]
    fn completion_from_en_route() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = en_route(&mut emitter);
        let effects = lifecycle.handle(
            &ServerMessage::RequestCompleted { request_id: None },
            UnixTimeMs(60_000),
        );
        assert!(effects.contains(&LifecycleEffect::ClearSnapshot));
        assert_eq!(lifecycle.status(), RequestStatus::Completed);
    }

    #[test]
    fn window_tick_fires_notice_once() {
        let mut emitter = RecordingEmitter::default();
        let mut lifecycle = en_route(&mut emitter);
        assert!(lifecycle.tick(UnixTimeMs(60_000)).is_empty());
        assert_eq!(lifecycle.tick(UnixTimeMs(127_000)).len(), 1);
        assert!(lifecycle.tick(UnixTimeMs(128_000)).is_empty());
        assert!(!lifecycle.can_cancel(UnixTimeMs(128_000)));
    }

    #[test]
    fn resume_restores_state_and_window() {
        let mut emitter = RecordingEmitter::default();
        let lifecycle = en_route(&mut emitter);
        let Some(SessionSnapshot::Seeker(snapshot)) = lifecycle.snapshot() else {
            panic!("expected seeker snapshot");
        };

        let mut restored = RequestLifecycle::default();
        restored.resume(snapshot, UnixTimeMs(50_000));
        assert_eq!(restored.status(), RequestStatus::EnRoute);
        assert_eq!(restored.cancel_window().unwrap().expires_at(), UnixTimeMs(122_000));
        assert_eq!(restored.cancel_window().unwrap().remaining_seconds(UnixTimeMs(50_000)), 72);
        assert!(window_invariant(&restored));
    }

    #[test]
    fn resume_of_terminal_snapshot_clears_it() {
        let mut emitter = RecordingEmitter::default();
        let lifecycle = en_route(&mut emitter);
        let Some(SessionSnapshot::Seeker(mut snapshot)) = lifecycle.snapshot() else {
            panic!("expected seeker snapshot");
        };
        snapshot.request.status = RequestStatus::Cancelled;

        let mut restored = RequestLifecycle::default();
        assert_eq!(
            restored.resume(snapshot, UnixTimeMs(0)),
            vec![LifecycleEffect::ClearSnapshot]
        );
        assert_eq!(restored.status(), RequestStatus::Idle);
    }
}
