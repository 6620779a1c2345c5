use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::channel_session::DroppedEmission;
use crate::config::ConfigError;
use crate::lifecycle::LifecycleError;
use crate::location::LocationError;
use crate::model::CoordinateError;
use crate::protocol::{ProtocolError, TimestampError};
use crate::route::RouteError;
use crate::snapshot::SnapshotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Connectivity,
    DroppedEmission,
    ServerRejection,
    ProviderFailure,
    LocationUnavailable,
    Storage,
    Protocol,
    InvalidState,
    Configuration,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Connectivity => "CONNECTIVITY_ERROR",
            Self::DroppedEmission => "DROPPED_EMISSION",
            Self::ServerRejection => "SERVER_REJECTION",
            Self::ProviderFailure => "PROVIDER_FAILURE",
            Self::LocationUnavailable => "LOCATION_UNAVAILABLE",
            Self::Storage => "STORAGE_ERROR",
            Self::Protocol => "PROTOCOL_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Configuration => "CONFIGURATION_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Connectivity
            | Self::DroppedEmission
            | Self::ServerRejection
            | Self::ProviderFailure
            | Self::LocationUnavailable
            | Self::Storage => ErrorSeverity::Transient,

            Self::Protocol | Self::InvalidState | Self::Configuration => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Connectivity | Self::ServerRejection | Self::ProviderFailure | Self::Storage
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    /// Only server rejections and a connection that has stopped retrying
    /// reach the user. Everything else degrades quietly.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        match self.kind {
            ErrorKind::ServerRejection => true,
            ErrorKind::Connectivity => !matches!(self.severity, ErrorSeverity::Transient),
            _ => false,
        }
    }

    /// Connection failure after the retry budget is spent.
    #[must_use]
    pub fn connection_lost(attempts: u32, last_reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connectivity, "Connection lost. Please refresh.")
            .with_severity(ErrorSeverity::Permanent)
            .with_internal(last_reason)
            .with_context("attempts", attempts.to_string())
    }

    #[must_use]
    pub fn server_rejection(message: Option<String>) -> Self {
        Self::new(
            ErrorKind::ServerRejection,
            message.unwrap_or_else(|| "Something went wrong".to_string()),
        )
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::ServerRejection => self.message.clone(),
            ErrorKind::Connectivity => {
                if self.is_user_visible() {
                    "Connection lost. Please check your internet connection and refresh.".into()
                } else {
                    "Reconnecting...".into()
                }
            }
            ErrorKind::DroppedEmission => {
                "You're offline. The action was not sent.".into()
            }
            ErrorKind::ProviderFailure => "Route information is unavailable right now.".into(),
            ErrorKind::LocationUnavailable => {
                "Unable to determine your location. Using an approximate position.".into()
            }
            ErrorKind::Storage => "Unable to save your session on this device.".into(),
            ErrorKind::Protocol => "Received an unexpected update from the server.".into(),
            ErrorKind::InvalidState => self.message.clone(),
            ErrorKind::Configuration => "The app is misconfigured. Please contact support.".into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " ({})", internal)?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<CoordinateError> for AppError {
    fn from(err: CoordinateError) -> Self {
        Self::new(ErrorKind::Protocol, "Invalid coordinates").with_internal(err.to_string())
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        Self::new(ErrorKind::Protocol, "Malformed server event").with_internal(err.to_string())
    }
}

impl From<TimestampError> for AppError {
    fn from(err: TimestampError) -> Self {
        Self::new(ErrorKind::Protocol, "Malformed timestamp").with_internal(err.to_string())
    }
}

impl From<DroppedEmission> for AppError {
    fn from(err: DroppedEmission) -> Self {
        Self::new(ErrorKind::DroppedEmission, "Not connected")
            .with_internal(err.to_string())
            .with_context("event", err.event)
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::Dropped(dropped) => dropped.into(),
            other => Self::new(ErrorKind::InvalidState, other.to_string()),
        }
    }
}

impl From<RouteError> for AppError {
    fn from(err: RouteError) -> Self {
        Self::new(ErrorKind::ProviderFailure, "Route estimate failed")
            .with_internal(err.to_string())
    }
}

impl From<SnapshotError> for AppError {
    fn from(err: SnapshotError) -> Self {
        Self::new(ErrorKind::Storage, "Session snapshot unavailable")
            .with_internal(err.to_string())
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, "Invalid configuration").with_internal(err.to_string())
    }
}

impl From<LocationError> for AppError {
    fn from(err: LocationError) -> Self {
        Self::new(ErrorKind::LocationUnavailable, "Location unavailable")
            .with_internal(err.to_string())
    }
}
