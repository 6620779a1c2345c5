#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod animator;
pub mod app;
pub mod capabilities;
pub mod channel_session;
pub mod config;
pub mod countdown;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod location;
pub mod model;
pub mod protocol;
pub mod route;
pub mod snapshot;
pub mod view;

pub use app::{App, Model};
pub use capabilities::{Capabilities, Effect};
pub use config::CoreConfig;
pub use crux_core::App as CruxApp;
pub use error::{AppError, AppResult, ErrorKind, ErrorSeverity};
pub use event::{Event, Identity};
pub use view::{Screen, ViewModel};

/// `MM:SS`, or `00:00` at or below zero.
#[must_use]
pub fn format_clock(total_seconds: i64) -> String {
    if total_seconds <= 0 {
        return "00:00".into();
    }
    format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
}

#[must_use]
pub fn format_eta_text(duration_seconds: f64) -> String {
    if !duration_seconds.is_finite() || duration_seconds < 0.0 {
        return "Unknown".into();
    }
    let minutes = (duration_seconds / 60.0).round();
    format!("Arriving in {minutes:.0} minutes")
}

#[must_use]
pub fn format_distance_km(meters: f64) -> String {
    if !meters.is_finite() || meters < 0.0 {
        return "Unknown".into();
    }
    format!("{:.2} km", meters / 1000.0)
}

/// Share of the ETA already elapsed, as a whole percent. 10 when either
/// side is unknown.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn eta_progress_percent(eta_seconds: Option<f64>, remaining_seconds: Option<u64>) -> u8 {
    match (eta_seconds, remaining_seconds) {
        (Some(eta), Some(remaining)) if eta.is_finite() && eta > 0.0 => {
            ((eta - remaining as f64) / eta * 100.0).clamp(0.0, 100.0).round() as u8
        }
        _ => 10,
    }
}
