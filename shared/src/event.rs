use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::TimerId;
use crate::config::CoreConfig;
use crate::location::{LocationError, LocationSample};
use crate::model::{RequestId, Role, SearchForm, UnixTimeMs, UserId};
use crate::route::{OsrmRoute, RouteError};

/// Who is signed in. The token only ever leaves the core inside a
/// channel `Connect` operation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    #[serde(skip_serializing)]
    pub token: SecretString,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role, token: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            role,
            token: SecretString::new(token.into()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Event {
    // Lifecycle & identity
    AppStarted {
        now: UnixTimeMs,
        #[serde(default)]
        config: Box<CoreConfig>,
    },
    IdentityChanged {
        identity: Option<Identity>,
    },

    // Channel, reported by the shell
    ChannelConnected,
    ChannelDisconnected {
        reason: String,
        now: UnixTimeMs,
    },
    ChannelConnectFailed {
        message: String,
        now: UnixTimeMs,
    },
    ChannelMessage {
        event: String,
        #[serde(default)]
        payload: Value,
        received_at: UnixTimeMs,
    },

    // Device
    LocationSampled(LocationSample),
    LocationFailed(LocationError),
    TimerFired {
        timer_id: TimerId,
        now: UnixTimeMs,
    },

    // Seeker actions
    SearchSubmitted {
        form: SearchForm,
        now: UnixTimeMs,
    },
    ConfirmHelper {
        now: UnixTimeMs,
    },
    CancelRequest {
        now: UnixTimeMs,
    },
    DismissOutcome,

    // Helper actions
    GoOnline,
    GoOffline,
    AcceptRequest {
        request_id: RequestId,
    },
    DeclineRequest {
        request_id: RequestId,
    },
    RejectAssignment {
        reason: String,
        now: UnixTimeMs,
    },

    DismissToast,
    DismissError,

    // Capability responses, never sent by the shell
    #[serde(skip)]
    SnapshotLoaded {
        user_id: UserId,
        result: Result<Option<Vec<u8>>, String>,
    },
    #[serde(skip)]
    SnapshotWritten {
        key: String,
        result: Result<(), String>,
    },
    #[serde(skip)]
    RouteResolved {
        generation: u64,
        result: Box<Result<OsrmRoute, RouteError>>,
    },
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AppStarted { .. } => "app_started",
            Self::IdentityChanged { .. } => "identity_changed",
            Self::ChannelConnected => "channel_connected",
            Self::ChannelDisconnected { .. } => "channel_disconnected",
            Self::ChannelConnectFailed { .. } => "channel_connect_failed",
            Self::ChannelMessage { .. } => "channel_message",
            Self::LocationSampled(_) => "location_sampled",
            Self::LocationFailed(_) => "location_failed",
            Self::TimerFired { .. } => "timer_fired",
            Self::SearchSubmitted { .. } => "search_submitted",
            Self::ConfirmHelper { .. } => "confirm_helper",
            Self::CancelRequest { .. } => "cancel_request",
            Self::DismissOutcome => "dismiss_outcome",
            Self::GoOnline => "go_online",
            Self::GoOffline => "go_offline",
            Self::AcceptRequest { .. } => "accept_request",
            Self::DeclineRequest { .. } => "decline_request",
            Self::RejectAssignment { .. } => "reject_assignment",
            Self::DismissToast => "dismiss_toast",
            Self::DismissError => "dismiss_error",
            Self::SnapshotLoaded { .. } => "snapshot_loaded",
            Self::SnapshotWritten { .. } => "snapshot_written",
            Self::RouteResolved { .. } => "route_resolved",
        }
    }

    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            Self::SearchSubmitted { .. }
                | Self::ConfirmHelper { .. }
                | Self::CancelRequest { .. }
                | Self::DismissOutcome
                | Self::GoOnline
                | Self::GoOffline
                | Self::AcceptRequest { .. }
                | Self::DeclineRequest { .. }
                | Self::RejectAssignment { .. }
                | Self::DismissToast
                | Self::DismissError
        )
    }
}
