//! The headless core. Shell events come in through [`App::update`]; sockets,
//! location watches, timers, HTTP and storage go out as capability requests.

use tracing::{debug, info, warn};

use crate::animator::{PositionAnimator, Retarget};
use crate::capabilities::{Cadence, Capabilities, Channel, TimerId, TimerSlot, TimerSlots};
use crate::channel_session::{
    ChannelSession, Credential, DroppedEmission, SessionDirective, Subscription,
};
use crate::config::CoreConfig;
use crate::error::{AppError, ErrorKind};
use crate::event::{Event, Identity};
use crate::lifecycle::helper::HelperDuty;
use crate::lifecycle::{Emitter, LifecycleEffect, LifecycleError, Notice, RequestLifecycle};
use crate::location::{LocationStreamer, WatchOptions};
use crate::model::{Coordinate, RequestId, RequestStatus, Role, UnixTimeMs};
use crate::protocol::{ClientMessage, ServerEventKind, ServerMessage};
use crate::route::{OsrmResponse, OsrmRoute, RouteError, RouteEstimator};
use crate::snapshot::{SessionSnapshot, SessionStore, StoreCommand};
use crate::view::{self, ViewModel};

#[derive(Default)]
pub struct App;

#[derive(Debug, Default)]
pub struct Model {
    /// Latest wall-clock time reported by the shell. Never goes backwards.
    pub now: UnixTimeMs,
    pub config: CoreConfig,
    pub identity: Option<Identity>,
    pub session: ChannelSession,
    pub subscriptions: Vec<Subscription>,
    pub seeker: RequestLifecycle,
    pub helper: HelperDuty,
    pub location: LocationStreamer,
    pub animator: PositionAnimator,
    pub route: RouteEstimator,
    pub store: SessionStore,
    pub timers: TimerSlots,
    pub toast: Option<Notice>,
    pub error: Option<AppError>,
}

impl Model {
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.identity.as_ref().map(|i| i.role)
    }

    fn observe(&mut self, now: UnixTimeMs) {
        if now > self.now {
            self.now = now;
        }
    }

    fn own_position(&self) -> Coordinate {
        self.location.position_or(self.config.default_coordinate)
    }

    fn apply_config(&mut self, config: CoreConfig) {
        self.session
            .configure(config.channel_endpoint.clone(), config.reconnect);
        self.seeker
            .set_provisional_window(config.provisional_cancel_window_ms);
        self.helper.configure(
            config.max_incoming_requests,
            config.provisional_cancel_window_ms,
        );
        self.location.set_interval(config.location_emit_interval_ms);
        self.animator.set_duration(config.animation_duration_ms);
        self.route.set_throttle(config.route_throttle_ms);
        self.config = config;
    }
}

/// Lets the state machines emit through the session without owning it.
struct ChannelEmitter<'a> {
    session: &'a mut ChannelSession,
    channel: &'a Channel<Event>,
}

impl Emitter for ChannelEmitter<'_> {
    fn emit(&mut self, message: ClientMessage) -> Result<(), DroppedEmission> {
        let directive = self.session.emit(message)?;
        run_directive(self.channel, directive);
        Ok(())
    }
}

fn run_directive(channel: &Channel<Event>, directive: SessionDirective) {
    match directive {
        SessionDirective::Connect { endpoint, token } => channel.connect(endpoint, token),
        SessionDirective::Disconnect => channel.disconnect(),
        SessionDirective::Emit(message) => channel.emit(message),
    }
}

fn route_result(
    result: crux_http::Result<crux_http::Response<OsrmResponse>>,
) -> Result<OsrmRoute, RouteError> {
    let mut response = result.map_err(|e| RouteError::Transport(e.to_string()))?;
    response.take_body().ok_or(RouteError::Empty)?.into_route()
}

impl App {
    fn run_store(command: StoreCommand, caps: &Capabilities) {
        match command {
            StoreCommand::Write { key, bytes } => {
                debug!(%key, len = bytes.len(), "writing session snapshot");
                caps.key_value.set(key.clone(), bytes, move |result| Event::SnapshotWritten {
                    key: key.clone(),
                    result: result.map(|_| ()).map_err(|e| e.to_string()),
                });
            }
            StoreCommand::Delete { key } => {
                debug!(%key, "deleting session snapshot");
                caps.key_value.delete(key.clone(), move |result| Event::SnapshotWritten {
                    key: key.clone(),
                    result: result.map(|_| ()).map_err(|e| e.to_string()),
                });
            }
        }
    }

    fn arm(model: &mut Model, caps: &Capabilities, slot: TimerSlot) {
        let cadence = match slot {
            TimerSlot::Heartbeat => Cadence::Interval {
                ms: model.config.heartbeat_interval_ms,
            },
            TimerSlot::Frame => Cadence::AnimationFrame,
        };
        if let Some(timer_id) = model.timers.arm(slot) {
            caps.timer.start(timer_id, cadence);
        }
    }

    fn disarm(model: &mut Model, caps: &Capabilities, slot: TimerSlot) {
        if let Some(timer_id) = model.timers.disarm(slot) {
            caps.timer.cancel(timer_id);
        }
    }

    fn settle(
        result: Result<Vec<LifecycleEffect>, LifecycleError>,
        model: &mut Model,
        caps: &Capabilities,
    ) {
        match result {
            Ok(effects) => Self::apply_effects(effects, model, caps),
            Err(error) => {
                if matches!(
                    error,
                    LifecycleError::InvalidSearch(_)
                        | LifecycleError::ReasonRequired
                        | LifecycleError::CancelWindowClosed
                ) {
                    model.toast = Some(Notice::error(error.to_string()));
                }
                let error = AppError::from(error);
                warn!(code = error.code(), %error, "action not applied");
            }
        }
    }

    fn apply_effects(effects: Vec<LifecycleEffect>, model: &mut Model, caps: &Capabilities) {
        for effect in effects {
            match effect {
                LifecycleEffect::Persist(snapshot) => match model.store.save(snapshot) {
                    Ok(Some(command)) => Self::run_store(command, caps),
                    Ok(None) => {}
                    Err(error) => {
                        let error = AppError::from(error);
                        warn!(code = error.code(), %error, "snapshot not written");
                    }
                },
                LifecycleEffect::ClearSnapshot => {
                    if let Some(command) = model.store.clear() {
                        Self::run_store(command, caps);
                    }
                }
                LifecycleEffect::Notice(notice) => model.toast = Some(notice),
                LifecycleEffect::Rejected(error) => model.error = Some(error),
                LifecycleEffect::PeerMoved(at) => {
                    if model.animator.retarget(at, model.now) == Retarget::Animating {
                        Self::arm(model, caps, TimerSlot::Frame);
                    }
                    Self::refresh_route(model, caps);
                }
                LifecycleEffect::NavigationStarted { request_id, .. } => {
                    info!(%request_id, "navigating to seeker");
                    Self::refresh_route(model, caps);
                }
                LifecycleEffect::Finished(outcome) => {
                    info!(status = %outcome.status, cancelled_by = ?outcome.cancelled_by, "request finished");
                    model.animator.clear();
                    Self::disarm(model, caps, TimerSlot::Frame);
                    model.route.reset();
                }
            }
        }
    }

    /// The participant pair a route is computed for, if any.
    fn route_endpoints(model: &Model) -> Option<(RequestId, Coordinate, Coordinate)> {
        match model.role()? {
            Role::Seeker => {
                let request = model.seeker.active()?;
                if request.status != RequestStatus::EnRoute {
                    return None;
                }
                let helper_at = request.helper.as_ref()?.coordinate?;
                Some((request.id.clone()?, helper_at, request.seeker_coordinate))
            }
            Role::Helper => {
                let assignment = model.helper.assignment()?;
                Some((
                    assignment.request_id.clone(),
                    model.own_position(),
                    assignment.seeker_location?,
                ))
            }
        }
    }

    fn refresh_route(model: &mut Model, caps: &Capabilities) {
        let Some((pair, origin, destination)) = Self::route_endpoints(model) else {
            return;
        };
        let query = model.route.request(
            &model.config.routing_base_url,
            &pair,
            origin,
            destination,
            model.now,
        );
        match query {
            Ok(Some(query)) => {
                let generation = query.generation;
                debug!(generation, url = %query.url, "requesting route");
                caps.http
                    .get(query.url.as_str())
                    .expect_json::<OsrmResponse>()
                    .send(move |result| Event::RouteResolved {
                        generation,
                        result: Box::new(route_result(result)),
                    });
            }
            Ok(None) => {}
            Err(error) => {
                let error = AppError::from(error);
                warn!(code = error.code(), %error, "route request not built");
            }
        }
    }

    /// Re-registers the inbound events the current role listens to.
    fn subscribe_role_events(model: &mut Model) {
        for subscription in model.subscriptions.drain(..) {
            model.session.off(subscription);
        }
        let Some(role) = model.role() else {
            return;
        };
        for kind in ServerEventKind::for_role(role) {
            if let Some(subscription) = model.session.on(*kind) {
                model.subscriptions.push(subscription);
            }
        }
    }

    /// Helpers stream their position while online, tagged with the
    /// assignment once navigating. Seekers never stream.
    fn sync_forwarding(model: &mut Model) {
        let target = match (model.role(), model.helper.assignment()) {
            (Some(Role::Helper), Some(assignment)) => Some(Some(assignment.request_id.clone())),
            (Some(Role::Helper), None) if model.helper.is_online() => Some(None),
            _ => None,
        };
        match target {
            Some(request_id) => model.location.enable_forwarding(request_id),
            None if model.location.is_forwarding() => model.location.disable_forwarding(),
            None => {}
        }
    }

    /// Forgets the role state of the current identity.
    fn reset_role_state(model: &mut Model, caps: &Capabilities) {
        model.seeker.reset();
        model.helper.reset();
        model.animator.clear();
        Self::disarm(model, caps, TimerSlot::Frame);
        model.route.reset();
        model.location.disable_forwarding();
        model.toast = None;
        model.error = None;
    }

    fn sign_in(identity: Identity, model: &mut Model, caps: &Capabilities) {
        let switching = model
            .identity
            .as_ref()
            .map_or(true, |current| {
                current.user_id != identity.user_id || current.role != identity.role
            });

        if switching {
            info!(user_id = %identity.user_id, role = ?identity.role, "identity set");
            Self::reset_role_state(model, caps);
            if let Some(command) = model.store.unbind() {
                Self::run_store(command, caps);
            }
            let key = model.store.bind(&identity.user_id);
            let user_id = identity.user_id.clone();
            caps.key_value.get(key, move |result| Event::SnapshotLoaded {
                user_id: user_id.clone(),
                result: result.map_err(|e| e.to_string()),
            });
        }

        let credential = Credential {
            user_id: identity.user_id.clone(),
            token: identity.token.clone(),
        };
        model.identity = Some(identity);
        for directive in model.session.connect(credential) {
            run_directive(&caps.channel, directive);
        }
        if switching && model.session.is_connected() {
            Self::subscribe_role_events(model);
        }

        Self::arm(model, caps, TimerSlot::Heartbeat);
        if let Some(watch_id) = model.location.start() {
            caps.geolocation.start_watch(watch_id, WatchOptions::default());
        }
    }

    fn sign_out(model: &mut Model, caps: &Capabilities) {
        info!("identity cleared");
        if let Some(directive) = model.session.disconnect() {
            run_directive(&caps.channel, directive);
        }
        model.subscriptions.clear();
        Self::reset_role_state(model, caps);
        Self::disarm(model, caps, TimerSlot::Heartbeat);
        if let Some(watch_id) = model.location.stop() {
            caps.geolocation.stop_watch(watch_id);
        }
        if let Some(command) = model.store.unbind() {
            Self::run_store(command, caps);
        }
        model.identity = None;
    }

    fn on_server_message(
        event: &str,
        payload: serde_json::Value,
        model: &mut Model,
        caps: &Capabilities,
    ) {
        let Some(kind) = ServerEventKind::from_name(event) else {
            warn!(event, "unknown server event ignored");
            return;
        };
        if !model.session.accepts(kind) {
            debug!(event, "no listener for event");
            return;
        }
        let message = match ServerMessage::from_wire(event, payload) {
            Ok(message) => message,
            Err(error) => {
                let error = AppError::from(error);
                warn!(code = error.code(), %error, "malformed server event ignored");
                return;
            }
        };

        let now = model.now;
        let effects = match model.role() {
            Some(Role::Seeker) => model.seeker.handle(&message, now),
            Some(Role::Helper) => model.helper.handle(&message, now),
            None => Vec::new(),
        };
        Self::apply_effects(effects, model, caps);
    }

    fn on_snapshot_loaded(bytes: Option<Vec<u8>>, model: &mut Model, caps: &Capabilities) {
        let snapshot = match model.store.hydrate(bytes.as_deref()) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(error) => {
                let error = AppError::from(error);
                warn!(code = error.code(), %error, "stored snapshot discarded");
                if let Some(key) = model.store.key() {
                    Self::run_store(StoreCommand::Delete { key: key.to_string() }, caps);
                }
                return;
            }
        };

        let now = model.now;
        let effects = match (snapshot, model.role()) {
            (SessionSnapshot::Seeker(snapshot), Some(Role::Seeker)) => {
                model.seeker.resume(snapshot, now)
            }
            (SessionSnapshot::Helper(snapshot), Some(Role::Helper)) => {
                model.helper.resume(snapshot)
            }
            (_, role) => {
                warn!(?role, "snapshot belongs to another role, clearing it");
                vec![LifecycleEffect::ClearSnapshot]
            }
        };
        Self::apply_effects(effects, model, caps);
    }

    fn on_timer(timer_id: TimerId, model: &mut Model, caps: &Capabilities) {
        let now = model.now;
        match model.timers.slot_of(timer_id) {
            Some(TimerSlot::Heartbeat) => {
                if let Some(directive) = model.session.poll_retry(now) {
                    run_directive(&caps.channel, directive);
                }
                let effects = match model.role() {
                    Some(Role::Seeker) => model.seeker.tick(now),
                    Some(Role::Helper) => model.helper.tick(now),
                    None => Vec::new(),
                };
                Self::apply_effects(effects, model, caps);
                Self::refresh_route(model, caps);
            }
            Some(TimerSlot::Frame) => {
                model.animator.frame(now);
                if !model.animator.is_animating() {
                    Self::disarm(model, caps, TimerSlot::Frame);
                }
            }
            None => debug!(%timer_id, "fire from a cancelled timer ignored"),
        }
    }

    fn dispatch(event: Event, model: &mut Model, caps: &Capabilities) {
        match event {
            Event::AppStarted { now, config } => {
                model.observe(now);
                match config.validate() {
                    Ok(()) => model.apply_config(*config),
                    Err(error) => {
                        let error = AppError::from(error);
                        warn!(code = error.code(), %error, "invalid configuration, keeping defaults");
                    }
                }
                info!(endpoint = %model.config.channel_endpoint, "core started");
            }

            Event::IdentityChanged { identity } => match identity {
                Some(identity) => Self::sign_in(identity, model, caps),
                None => Self::sign_out(model, caps),
            },

            Event::ChannelConnected => {
                model.session.on_connected();
                if !model.session.is_connected() {
                    return;
                }
                Self::subscribe_role_events(model);
                if model.role() == Some(Role::Helper) {
                    let at = model.own_position();
                    let result = model.helper.auto_go_online(
                        at,
                        &mut ChannelEmitter {
                            session: &mut model.session,
                            channel: &caps.channel,
                        },
                    );
                    Self::settle(result, model, caps);
                }
            }

            Event::ChannelDisconnected { reason, now } => {
                model.observe(now);
                if let Some(error) = model.session.on_connection_lost(&reason, model.now) {
                    model.error = Some(error);
                }
            }

            Event::ChannelConnectFailed { message, now } => {
                model.observe(now);
                if let Some(error) = model.session.on_connect_error(&message, model.now) {
                    model.error = Some(error);
                }
            }

            Event::ChannelMessage {
                event,
                payload,
                received_at,
            } => {
                model.observe(received_at);
                Self::on_server_message(&event, payload, model, caps);
            }

            Event::LocationSampled(sample) => {
                model.observe(sample.timestamp);
                if let Some(message) = model.location.on_sample(sample) {
                    // Dropped updates are recorded on the channel status.
                    if let Ok(directive) = model.session.emit(message) {
                        run_directive(&caps.channel, directive);
                    }
                }
                if model.role() == Some(Role::Helper) {
                    Self::refresh_route(model, caps);
                }
            }

            Event::LocationFailed(error) => {
                model.location.on_error(error.clone());
                debug!(code = AppError::from(error).code(), "using fallback position");
            }

            Event::TimerFired { timer_id, now } => {
                model.observe(now);
                Self::on_timer(timer_id, model, caps);
            }

            Event::SearchSubmitted { form, now } => {
                model.observe(now);
                if model.role() != Some(Role::Seeker) {
                    debug!("search ignored outside the seeker role");
                    return;
                }
                let fallback = model.own_position();
                let result = model.seeker.submit_search(
                    &form,
                    fallback,
                    &mut ChannelEmitter {
                        session: &mut model.session,
                        channel: &caps.channel,
                    },
                    model.now,
                );
                Self::settle(result, model, caps);
            }

            Event::ConfirmHelper { now } => {
                model.observe(now);
                if model.role() != Some(Role::Seeker) {
                    return;
                }
                let result = model.seeker.confirm_helper(
                    &mut ChannelEmitter {
                        session: &mut model.session,
                        channel: &caps.channel,
                    },
                    model.now,
                );
                Self::settle(result, model, caps);
            }

            Event::CancelRequest { now } => {
                model.observe(now);
                if model.role() != Some(Role::Seeker) {
                    return;
                }
                let result = model.seeker.cancel_by_user(
                    &mut ChannelEmitter {
                        session: &mut model.session,
                        channel: &caps.channel,
                    },
                    model.now,
                );
                Self::settle(result, model, caps);
            }

            Event::DismissOutcome => {
                if !model.seeker.dismiss_outcome() && !model.helper.dismiss_outcome() {
                    debug!("no outcome to dismiss");
                }
            }

            Event::GoOnline => {
                if model.role() != Some(Role::Helper) {
                    return;
                }
                let at = model.own_position();
                let result = model.helper.go_online(
                    at,
                    &mut ChannelEmitter {
                        session: &mut model.session,
                        channel: &caps.channel,
                    },
                );
                Self::settle(result, model, caps);
            }

            Event::GoOffline => {
                if model.role() != Some(Role::Helper) {
                    return;
                }
                let result = model.helper.go_offline(&mut ChannelEmitter {
                    session: &mut model.session,
                    channel: &caps.channel,
                });
                Self::settle(result, model, caps);
            }

            Event::AcceptRequest { request_id } => {
                if model.role() != Some(Role::Helper) {
                    return;
                }
                let result = model.helper.accept(
                    &request_id,
                    &mut ChannelEmitter {
                        session: &mut model.session,
                        channel: &caps.channel,
                    },
                );
                Self::settle(result, model, caps);
            }

            Event::DeclineRequest { request_id } => {
                if model.role() != Some(Role::Helper) {
                    return;
                }
                let result = model.helper.decline(
                    &request_id,
                    &mut ChannelEmitter {
                        session: &mut model.session,
                        channel: &caps.channel,
                    },
                );
                Self::settle(result, model, caps);
            }

            Event::RejectAssignment { reason, now } => {
                model.observe(now);
                if model.role() != Some(Role::Helper) {
                    return;
                }
                let result = model.helper.reject_assignment(
                    &reason,
                    &mut ChannelEmitter {
                        session: &mut model.session,
                        channel: &caps.channel,
                    },
                    model.now,
                );
                Self::settle(result, model, caps);
            }

            Event::DismissToast => model.toast = None,
            Event::DismissError => model.error = None,

            Event::SnapshotLoaded { user_id, result } => {
                if model.identity.as_ref().map(|i| &i.user_id) != Some(&user_id) {
                    debug!(%user_id, "snapshot for a previous identity ignored");
                    return;
                }
                match result {
                    Ok(bytes) => Self::on_snapshot_loaded(bytes, model, caps),
                    Err(message) => {
                        let error = AppError::new(ErrorKind::Storage, "session snapshot unreadable")
                            .with_internal(message);
                        warn!(code = error.code(), %error, "snapshot load failed");
                    }
                }
            }

            Event::SnapshotWritten { key, result } => match result {
                Ok(()) => debug!(%key, "snapshot store updated"),
                Err(message) => {
                    let error = AppError::new(ErrorKind::Storage, "session snapshot not saved")
                        .with_internal(message)
                        .with_context("key", key);
                    warn!(code = error.code(), %error, "snapshot write failed");
                }
            },

            Event::RouteResolved { generation, result } => match *result {
                Ok(route) => {
                    model.route.on_success(generation, route, model.now);
                }
                Err(error) => model.route.on_failure(generation, &error),
            },
        }
    }
}

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = ViewModel;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        let _span = tracing::debug_span!(
            "update",
            event = event.name(),
            user = event.is_user_initiated()
        )
        .entered();

        Self::dispatch(event, model, caps);
        Self::sync_forwarding(model);
        caps.render.render();
    }

    fn view(&self, model: &Model) -> ViewModel {
        view::build(model)
    }
}
