//! Lifecycle of the single authenticated realtime connection.
//!
//! The session never talks to a socket itself. Every operation returns the
//! [`SessionDirective`]s the shell has to carry out, and the shell reports
//! back through `on_connected` / `on_connection_lost` / `on_connect_error`.
//! Connection status is published on a `tokio::sync::watch` channel so any
//! number of observers can follow it.

use std::collections::HashSet;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::ReconnectPolicy;
use crate::error::AppError;
use crate::model::{UnixTimeMs, UserId};
use crate::protocol::{ClientMessage, ServerEventKind};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
    /// Set once the retry budget is spent; cleared by the next `connect`.
    pub gave_up: bool,
    /// Last best-effort send that was dropped while offline.
    pub warning: Option<String>,
    pub dropped_emissions: u32,
}

/// An emit attempted while the channel was not connected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("dropped `{event}` while channel is {state:?}")]
pub struct DroppedEmission {
    pub event: &'static str,
    pub state: ConnectionState,
}

/// Who the connection is authenticated as.
#[derive(Clone)]
pub struct Credential {
    pub user_id: UserId,
    pub token: SecretString,
}

impl Credential {
    fn same_as(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.token.expose_secret() == other.token.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Work for the shell.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionDirective {
    Connect { endpoint: String, token: String },
    Disconnect,
    Emit(ClientMessage),
}

/// Handle returned by [`ChannelSession::on`]. Pass it to
/// [`ChannelSession::off`] to stop receiving that event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    kind: ServerEventKind,
}

impl Subscription {
    #[must_use]
    pub fn kind(&self) -> ServerEventKind {
        self.kind
    }
}

pub struct ChannelSession {
    endpoint: String,
    policy: ReconnectPolicy,
    credential: Option<Credential>,
    status: watch::Sender<ChannelStatus>,
    next_retry_at: Option<UnixTimeMs>,
    subscriptions: HashSet<Subscription>,
    next_subscription_id: u64,
}

impl Default for ChannelSession {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_CHANNEL_ENDPOINT,
            ReconnectPolicy::default(),
        )
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("endpoint", &self.endpoint)
            .field("credential", &self.credential)
            .field("status", &*self.status.borrow())
            .field("next_retry_at", &self.next_retry_at)
            .finish_non_exhaustive()
    }
}

impl ChannelSession {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ChannelStatus::default());
        Self {
            endpoint: endpoint.into(),
            policy,
            credential: None,
            status,
            next_retry_at: None,
            subscriptions: HashSet::new(),
            next_subscription_id: 0,
        }
    }

    /// Applies new settings. Takes effect on the next connect.
    pub fn configure(&mut self, endpoint: impl Into<String>, policy: ReconnectPolicy) {
        self.endpoint = endpoint.into();
        self.policy = policy;
    }

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True while a channel handle exists, whatever its connection state.
    #[must_use]
    pub fn has_channel(&self) -> bool {
        self.credential.is_some()
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn next_retry_at(&self) -> Option<UnixTimeMs> {
        self.next_retry_at
    }

    /// Opens the channel for `credential`. Connecting again with the same
    /// credential while a live handle exists does nothing; a stale handle
    /// or a different credential is torn down first.
    #[instrument(skip(self, credential), fields(user_id = %credential.user_id))]
    pub fn connect(&mut self, credential: Credential) -> Vec<SessionDirective> {
        let mut directives = Vec::new();

        if let Some(existing) = &self.credential {
            let live = self.state() != ConnectionState::Disconnected || self.next_retry_at.is_some();
            let same = existing.same_as(&credential);
            if same && live {
                debug!("channel already open, reusing it");
                return directives;
            }
            let reason = if same { "stale" } else { "identity changed" };
            info!(reason, "tearing down existing channel");
            directives.push(SessionDirective::Disconnect);
            self.subscriptions.clear();
        }

        let token = credential.token.expose_secret().to_string();
        self.credential = Some(credential);
        self.next_retry_at = None;
        self.publish(|status| {
            *status = ChannelStatus {
                state: ConnectionState::Connecting,
                ..ChannelStatus::default()
            };
        });
        directives.push(SessionDirective::Connect {
            endpoint: self.endpoint.clone(),
            token,
        });
        directives
    }

    /// Releases the channel. This is the only way to stop reconnecting.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) -> Option<SessionDirective> {
        let had_channel = self.credential.take().is_some();
        self.next_retry_at = None;
        self.subscriptions.clear();
        self.publish(|status| *status = ChannelStatus::default());
        if had_channel {
            info!("channel released");
            Some(SessionDirective::Disconnect)
        } else {
            None
        }
    }

    pub fn on_connected(&mut self) {
        if self.credential.is_none() {
            warn!("connected callback without a channel, ignoring");
            return;
        }
        info!("channel connected");
        self.next_retry_at = None;
        self.publish(|status| {
            status.state = ConnectionState::Connected;
            status.last_error = None;
            status.reconnect_attempt = 0;
            status.gave_up = false;
            status.warning = None;
        });
    }

    /// Returns a user-visible error once the retry budget is exhausted.
    pub fn on_connection_lost(&mut self, reason: &str, now: UnixTimeMs) -> Option<AppError> {
        self.schedule_retry(reason, now)
    }

    pub fn on_connect_error(&mut self, message: &str, now: UnixTimeMs) -> Option<AppError> {
        self.schedule_retry(message, now)
    }

    fn schedule_retry(&mut self, reason: &str, now: UnixTimeMs) -> Option<AppError> {
        if self.credential.is_none() {
            debug!(reason, "channel closed after release");
            return None;
        }

        let attempt = self.status.borrow().reconnect_attempt.saturating_add(1);
        if self.policy.is_exhausted(attempt) {
            warn!(attempt, reason, "reconnect attempts exhausted");
            self.next_retry_at = None;
            self.publish(|status| {
                status.state = ConnectionState::Disconnected;
                status.last_error = Some(reason.to_string());
                status.gave_up = true;
            });
            return Some(AppError::connection_lost(attempt - 1, reason));
        }

        let delay = self.policy.delay_for_attempt(attempt);
        warn!(attempt, delay_ms = delay, reason, "channel down, scheduling reconnect");
        self.next_retry_at = Some(now.add_millis(delay));
        self.publish(|status| {
            status.state = ConnectionState::Disconnected;
            status.last_error = Some(reason.to_string());
            status.reconnect_attempt = attempt;
        });
        None
    }

    /// Issues the pending reconnect once its delay has passed.
    pub fn poll_retry(&mut self, now: UnixTimeMs) -> Option<SessionDirective> {
        let due = self.next_retry_at.filter(|at| !now.is_before(*at))?;
        let credential = self.credential.as_ref()?;
        debug!(due = due.as_millis(), "reconnecting");
        let token = credential.token.expose_secret().to_string();
        self.next_retry_at = None;
        self.publish(|status| status.state = ConnectionState::Connecting);
        Some(SessionDirective::Connect {
            endpoint: self.endpoint.clone(),
            token,
        })
    }

    /// Best-effort send. Nothing is queued: a message emitted while offline
    /// is dropped and recorded as a warning on the status.
    pub fn emit(&mut self, message: ClientMessage) -> Result<SessionDirective, DroppedEmission> {
        let state = self.state();
        if state == ConnectionState::Connected {
            debug!(event = message.name(), "emit");
            return Ok(SessionDirective::Emit(message));
        }

        let dropped = DroppedEmission {
            event: message.name(),
            state,
        };
        warn!(event = dropped.event, ?state, "emit dropped, channel not connected");
        self.publish(|status| {
            status.warning = Some(dropped.to_string());
            status.dropped_emissions = status.dropped_emissions.saturating_add(1);
        });
        Err(dropped)
    }

    /// Registers interest in one server event. Without an active channel
    /// this is a no-op that logs a warning.
    pub fn on(&mut self, kind: ServerEventKind) -> Option<Subscription> {
        if self.credential.is_none() {
            warn!(event = kind.name(), "subscribe without an active channel");
            return None;
        }
        self.next_subscription_id += 1;
        let subscription = Subscription {
            id: self.next_subscription_id,
            kind,
        };
        self.subscriptions.insert(subscription);
        Some(subscription)
    }

    pub fn off(&mut self, subscription: Subscription) -> bool {
        self.subscriptions.remove(&subscription)
    }

    /// Whether inbound events of `kind` currently have a listener.
    #[must_use]
    pub fn accepts(&self, kind: ServerEventKind) -> bool {
        self.subscriptions.iter().any(|s| s.kind == kind)
    }

    fn publish(&self, change: impl FnOnce(&mut ChannelStatus)) {
        self.status.send_modify(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::RequestId;

    fn credential(user: &str) -> Credential {
        Credential {
            user_id: UserId::new(user),
            token: SecretString::new(format!("token-{user}")),
        }
    }

    fn cancel() -> ClientMessage {
        ClientMessage::CancelRequest {
            request_id: RequestId::new("r1"),
        }
    }

    #[test]
    fn connect_is_idempotent_for_a_live_handle() {
        let mut session = ChannelSession::default();
        let first = session.connect(credential("u1"));
        assert!(matches!(first.as_slice(), [SessionDirective::Connect { .. }]));
        assert_eq!(session.state(), ConnectionState::Connecting);

        assert!(session.connect(credential("u1")).is_empty());
        session.on_connected();
        assert!(session.connect(credential("u1")).is_empty());
    }

    #[test]
    fn changing_identity_forces_disconnect_then_connect() {
        let mut session = ChannelSession::default();
        session.connect(credential("u1"));
        session.on_connected();

        let directives = session.connect(credential("u2"));
        assert!(matches!(
            directives.as_slice(),
            [SessionDirective::Disconnect, SessionDirective::Connect { token, .. }] if token == "token-u2"
        ));
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn stale_handle_is_torn_down_before_reconnect() {
        let policy = ReconnectPolicy {
            max_attempts: 1,
            ..ReconnectPolicy::default()
        };
        let mut session = ChannelSession::new("https://example.test", policy);
        session.connect(credential("u1"));
        session.on_connect_error("refused", UnixTimeMs(0));
        assert!(session.on_connect_error("refused", UnixTimeMs(10)).is_some());
        assert!(session.status().gave_up);

        let directives = session.connect(credential("u1"));
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0], SessionDirective::Disconnect);
        assert!(!session.status().gave_up);
    }

    #[test]
    fn bounded_reconnect_then_persistent_error() {
        let mut session = ChannelSession::default();
        session.connect(credential("u1"));
        session.on_connected();

        let mut now = UnixTimeMs(1_000);
        for attempt in 1..=5 {
            assert!(session.on_connection_lost("transport close", now).is_none());
            assert_eq!(session.status().reconnect_attempt, attempt);
            let retry_at = session.next_retry_at().unwrap();
            assert!(session.poll_retry(UnixTimeMs(retry_at.as_millis() - 1)).is_none());
            assert!(matches!(
                session.poll_retry(retry_at),
                Some(SessionDirective::Connect { .. })
            ));
            now = retry_at;
        }

        let err = session.on_connection_lost("transport close", now).unwrap();
        assert_eq!(err.kind, ErrorKind::Connectivity);
        assert!(err.is_user_visible());
        assert!(session.status().gave_up);
        assert_eq!(session.next_retry_at(), None);
        assert!(session.poll_retry(UnixTimeMs(u64::MAX)).is_none());
    }

    #[test]
    fn emit_while_disconnected_is_dropped_with_warning() {
        let mut session = ChannelSession::default();
        session.connect(credential("u1"));

        let err = session.emit(cancel()).unwrap_err();
        assert_eq!(err.event, "cancel_request");
        assert_eq!(err.state, ConnectionState::Connecting);
        let status = session.status();
        assert_eq!(status.dropped_emissions, 1);
        assert!(status.warning.is_some());

        session.on_connected();
        assert_eq!(session.emit(cancel()), Ok(SessionDirective::Emit(cancel())));
    }

    #[test]
    fn subscribe_without_channel_is_a_noop() {
        let mut session = ChannelSession::default();
        assert!(session.on(ServerEventKind::HelperFound).is_none());

        session.connect(credential("u1"));
        let sub = session.on(ServerEventKind::HelperFound).unwrap();
        assert!(session.accepts(ServerEventKind::HelperFound));
        assert!(session.off(sub));
        assert!(!session.accepts(ServerEventKind::HelperFound));
    }

    #[test]
    fn disconnect_resets_everything() {
        let mut session = ChannelSession::default();
        session.connect(credential("u1"));
        session.on(ServerEventKind::Error);
        session.on_connected();

        assert_eq!(session.disconnect(), Some(SessionDirective::Disconnect));
        assert_eq!(session.status(), ChannelStatus::default());
        assert!(!session.accepts(ServerEventKind::Error));
        assert_eq!(session.disconnect(), None);
        // A late close from the shell must not start reconnecting.
        assert!(session.on_connection_lost("io client disconnect", UnixTimeMs(0)).is_none());
        assert_eq!(session.next_retry_at(), None);
    }

    #[tokio::test]
    async fn status_is_observable_by_many_subscribers() {
        let mut session = ChannelSession::default();
        let mut first = session.subscribe_status();
        let mut second = session.subscribe_status();

        session.connect(credential("u1"));
        session.on_connected();

        first.changed().await.unwrap();
        second.changed().await.unwrap();
        assert_eq!(first.borrow().state, ConnectionState::Connected);
        assert_eq!(second.borrow().state, ConnectionState::Connected);
    }
}
