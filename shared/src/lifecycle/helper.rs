use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{Emitter, LifecycleEffect, LifecycleError, Notice, Outcome};
use crate::countdown::Countdown;
use crate::error::AppError;
use crate::model::{Coordinate, Party, RequestId, RequestStatus, UnixTimeMs};
use crate::protocol::{ClientMessage, IncomingRequest, ServerMessage};
use crate::snapshot::{HelperSnapshot, SessionSnapshot};

/// The request a helper is navigating to.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Assignment {
    pub request_id: RequestId,
    pub seeker_location: Option<Coordinate>,
    pub seeker_address: String,
    pub window_ends_at: UnixTimeMs,
    pub started_at: UnixTimeMs,
}

/// Helper-side state: availability, offers and the current assignment.
#[derive(Debug)]
pub struct HelperDuty {
    online: bool,
    auto_onlined: bool,
    incoming: LruCache<RequestId, IncomingRequest>,
    assignment: Option<Assignment>,
    window: Option<Countdown>,
    outcome: Option<Outcome>,
    provisional_window_ms: u64,
}

impl Default for HelperDuty {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_INCOMING_REQUESTS,
            crate::config::DEFAULT_PROVISIONAL_CANCEL_WINDOW_MS,
        )
    }
}

impl HelperDuty {
    #[must_use]
    pub fn new(max_incoming: usize, provisional_window_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(max_incoming).unwrap_or(NonZeroUsize::MIN);
        Self {
            online: false,
            auto_onlined: false,
            incoming: LruCache::new(capacity),
            assignment: None,
            window: None,
            outcome: None,
            provisional_window_ms,
        }
    }

    pub fn configure(&mut self, max_incoming: usize, provisional_window_ms: u64) {
        let capacity = NonZeroUsize::new(max_incoming).unwrap_or(NonZeroUsize::MIN);
        self.incoming.resize(capacity);
        self.provisional_window_ms = provisional_window_ms;
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Offers, newest first.
    #[must_use]
    pub fn incoming(&self) -> Vec<&IncomingRequest> {
        self.incoming.iter().map(|(_, request)| request).collect()
    }

    #[must_use]
    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    #[must_use]
    pub fn window_remaining_seconds(&self, now: UnixTimeMs) -> Option<u64> {
        self.window.as_ref().map(|w| w.remaining_seconds(now))
    }

    #[must_use]
    pub fn can_reject(&self, now: UnixTimeMs) -> bool {
        self.window
            .as_ref()
            .is_some_and(|w| !w.has_expired() && w.is_active(now))
    }

    #[instrument(skip_all)]
    pub fn go_online(
        &mut self,
        at: Coordinate,
        emitter: &mut impl Emitter,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        emitter.emit(ClientMessage::go_online(at))?;
        info!(lng = at.lng(), lat = at.lat(), "helper online");
        self.online = true;
        Ok(vec![LifecycleEffect::Notice(Notice::success("You are now online!"))])
    }

    /// Goes online the first time the channel connects for this identity.
    pub fn auto_go_online(
        &mut self,
        at: Coordinate,
        emitter: &mut impl Emitter,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        if self.auto_onlined || self.online {
            return Ok(Vec::new());
        }
        self.go_online(at, emitter)?;
        self.auto_onlined = true;
        Ok(Vec::new())
    }

    #[instrument(skip_all)]
    pub fn go_offline(
        &mut self,
        emitter: &mut impl Emitter,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        emitter.emit(ClientMessage::GoOffline {})?;
        info!("helper offline");
        self.online = false;
        self.incoming.clear();
        Ok(vec![LifecycleEffect::Notice(Notice::info("You are now offline"))])
    }

    pub fn accept(
        &mut self,
        request_id: &RequestId,
        emitter: &mut impl Emitter,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        if !self.incoming.contains(request_id) {
            return Err(LifecycleError::UnknownOffer(request_id.clone()));
        }
        emitter.emit(ClientMessage::AcceptRequest {
            request_id: request_id.clone(),
        })?;
        info!(%request_id, "offer accepted, awaiting lock");
        Ok(Vec::new())
    }

    pub fn decline(
        &mut self,
        request_id: &RequestId,
        emitter: &mut impl Emitter,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        if !self.incoming.contains(request_id) {
            return Err(LifecycleError::UnknownOffer(request_id.clone()));
        }
        emitter.emit(ClientMessage::RejectRequest {
            request_id: request_id.clone(),
            reason: None,
        })?;
        self.incoming.pop(request_id);
        Ok(vec![LifecycleEffect::Notice(Notice::info("Request rejected"))])
    }

    /// Backs out of an assignment while the rejection window is open.
    #[instrument(skip_all)]
    pub fn reject_assignment(
        &mut self,
        reason: &str,
        emitter: &mut impl Emitter,
        now: UnixTimeMs,
    ) -> Result<Vec<LifecycleEffect>, LifecycleError> {
        let assignment = self.assignment.as_ref().ok_or(LifecycleError::NoAssignment)?;
        if !self.can_reject(now) {
            return Err(LifecycleError::CancelWindowClosed);
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LifecycleError::ReasonRequired);
        }
        let request_id = assignment.request_id.clone();

        emitter.emit(ClientMessage::RejectRequest {
            request_id: request_id.clone(),
            reason: Some(reason.to_string()),
        })?;

        info!(%request_id, "assignment rejected by helper");
        Ok(self.finish(
            RequestStatus::Cancelled,
            Some(Party::Helper),
            Some(reason.to_string()),
        ))
    }

    #[instrument(skip_all, fields(event = message.kind().name()))]
    pub fn handle(&mut self, message: &ServerMessage, now: UnixTimeMs) -> Vec<LifecycleEffect> {
        if let (Some(assignment), Some(named)) = (&self.assignment, message.request_id()) {
            let about_offer = matches!(
                message,
                ServerMessage::NewRequest(_) | ServerMessage::RequestLocked { .. }
            );
            if !about_offer && &assignment.request_id != named {
                warn!(active = %assignment.request_id, %named, "event for another request ignored");
                return Vec::new();
            }
        }

        match message {
            ServerMessage::NewRequest(offer) => {
                if self.incoming.contains(&offer.request_id) {
                    debug!(request_id = %offer.request_id, "duplicate offer");
                    return Vec::new();
                }
                self.incoming.put(offer.request_id.clone(), offer.clone());
                let text = match offer.budget {
                    Some(budget) => format!("New request: {} (${budget})", offer.category),
                    None => format!("New request: {}", offer.category),
                };
                vec![LifecycleEffect::Notice(Notice::info(text))]
            }

            ServerMessage::RequestLocked {
                request_id,
                message,
            } => {
                if let Some(id) = request_id {
                    self.incoming.pop(id);
                }
                vec![LifecycleEffect::Notice(Notice::success(
                    message.clone().unwrap_or_else(|| "Request accepted!".into()),
                ))]
            }

            ServerMessage::ConfirmRedirect {
                request_id,
                cancel_window_expires_at,
                seeker_location,
                seeker_address,
            } => {
                if self.assignment.is_some() {
                    debug!("assignment already active");
                    return Vec::new();
                }
                self.incoming.pop(request_id);
                let ends_at = cancel_window_expires_at
                    .unwrap_or_else(|| now.add_millis(self.provisional_window_ms));
                self.window = Some(Countdown::until(ends_at));
                self.outcome = None;
                self.assignment = Some(Assignment {
                    request_id: request_id.clone(),
                    seeker_location: *seeker_location,
                    seeker_address: seeker_address
                        .clone()
                        .unwrap_or_else(|| "Seeker location".into()),
                    window_ends_at: ends_at,
                    started_at: now,
                });
                info!(%request_id, "navigation started");

                let mut effects = vec![
                    LifecycleEffect::NavigationStarted {
                        request_id: request_id.clone(),
                        destination: *seeker_location,
                    },
                    LifecycleEffect::Notice(Notice::success("Seeker confirmed. Head to the pickup point.")),
                ];
                effects.extend(self.persist());
                effects
            }

            ServerMessage::RequestCancelled {
                request_id,
                reason,
                rejected_by,
            } => {
                if self.assignment.is_some() {
                    let by = rejected_by.unwrap_or(Party::Seeker);
                    info!(cancelled_by = %by, "assignment cancelled");
                    return self.finish(RequestStatus::Cancelled, Some(by), reason.clone());
                }
                if let Some(id) = request_id {
                    if self.incoming.pop(id).is_some() {
                        return vec![LifecycleEffect::Notice(Notice::info(
                            "A request was withdrawn",
                        ))];
                    }
                }
                Vec::new()
            }

            ServerMessage::CancelWindowExpired { .. } => {
                let (Some(window), Some(assignment)) = (self.window.as_mut(), self.assignment.as_mut())
                else {
                    return Vec::new();
                };
                if window.expire(now) {
                    info!("rejection window closed by server");
                }
                assignment.window_ends_at = window.ends_at();
                self.persist()
            }

            ServerMessage::RequestCompleted { .. } if self.assignment.is_some() => {
                let mut effects = vec![LifecycleEffect::Notice(Notice::success("Job completed"))];
                effects.extend(self.finish(RequestStatus::Completed, None, None));
                effects
            }

            ServerMessage::Error { message } => {
                let error = AppError::server_rejection(message.clone());
                warn!(message = %error.message, "server rejected an action");
                vec![LifecycleEffect::Rejected(error)]
            }

            other => {
                debug!(event = other.kind().name(), "not applicable to helper");
                Vec::new()
            }
        }
    }

    pub fn tick(&mut self, now: UnixTimeMs) -> Vec<LifecycleEffect> {
        let Some(window) = self.window.as_mut() else {
            return Vec::new();
        };
        if !window.tick(now).expired_now {
            return Vec::new();
        }
        info!("rejection window elapsed");
        vec![LifecycleEffect::Notice(Notice::info("The rejection window has closed"))]
    }

    pub fn resume(&mut self, snapshot: HelperSnapshot) -> Vec<LifecycleEffect> {
        if self.assignment.is_some() {
            return Vec::new();
        }
        let assignment = snapshot.assignment;
        info!(request_id = %assignment.request_id, "resuming navigation");
        self.window = Some(Countdown::until(assignment.window_ends_at));
        let effects = vec![LifecycleEffect::NavigationStarted {
            request_id: assignment.request_id.clone(),
            destination: assignment.seeker_location,
        }];
        self.assignment = Some(assignment);
        self.outcome = None;
        effects
    }

    pub fn dismiss_outcome(&mut self) -> bool {
        self.outcome.take().is_some()
    }

    /// Forgets everything, including the auto-online latch.
    pub fn reset(&mut self) {
        self.online = false;
        self.auto_onlined = false;
        self.incoming.clear();
        self.assignment = None;
        self.window = None;
        self.outcome = None;
    }

    fn finish(
        &mut self,
        status: RequestStatus,
        cancelled_by: Option<Party>,
        reason: Option<String>,
    ) -> Vec<LifecycleEffect> {
        let request_id = self.assignment.take().map(|a| a.request_id);
        self.window = None;
        let outcome = Outcome {
            status,
            request_id,
            cancelled_by,
            reason,
        };
        self.outcome = Some(outcome.clone());
        vec![LifecycleEffect::ClearSnapshot, LifecycleEffect::Finished(outcome)]
    }

    fn persist(&self) -> Vec<LifecycleEffect> {
        self.assignment
            .clone()
            .map(|assignment| LifecycleEffect::Persist(SessionSnapshot::Helper(HelperSnapshot { assignment })))
            .into_iter()
            .collect()
    }
}
