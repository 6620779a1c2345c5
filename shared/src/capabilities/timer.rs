use std::fmt;

use crux_core::capability::{CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum Cadence {
    /// Repeats every `ms` milliseconds until cancelled.
    Interval { ms: u64 },
    /// Fires once per display frame until cancelled.
    AnimationFrame,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", content = "data")]
pub enum TimerOperation {
    Start { timer_id: TimerId, cadence: Cadence },
    Cancel { timer_id: TimerId },
}

impl Operation for TimerOperation {
    type Output = ();
}

/// Repeating timers driven by the shell, which reports each fire as
/// `Event::TimerFired { timer_id, now }`.
#[derive(crux_core::macros::Capability)]
pub struct Timer<Ev> {
    context: CapabilityContext<TimerOperation, Ev>,
}

impl<Ev> Timer<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn start(&self, timer_id: TimerId, cadence: Cadence) {
        self.notify(TimerOperation::Start { timer_id, cadence });
    }

    pub fn cancel(&self, timer_id: TimerId) {
        self.notify(TimerOperation::Cancel { timer_id });
    }

    fn notify(&self, operation: TimerOperation) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            ctx.notify_shell(operation).await;
        });
    }
}

/// Hands out timer ids and remembers which ones are live, so fires from a
/// cancelled timer can be told apart.
#[derive(Debug, Default)]
pub struct TimerSlots {
    next_id: u64,
    heartbeat: Option<TimerId>,
    frame: Option<TimerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSlot {
    Heartbeat,
    Frame,
}

impl TimerSlots {
    /// Allocates an id for `slot` unless one is already running.
    pub fn arm(&mut self, slot: TimerSlot) -> Option<TimerId> {
        let entry = self.entry(slot);
        if entry.is_some() {
            return None;
        }
        self.next_id += 1;
        let id = TimerId(self.next_id);
        *self.entry(slot) = Some(id);
        Some(id)
    }

    pub fn disarm(&mut self, slot: TimerSlot) -> Option<TimerId> {
        self.entry(slot).take()
    }

    #[must_use]
    pub fn slot_of(&self, timer_id: TimerId) -> Option<TimerSlot> {
        if self.heartbeat == Some(timer_id) {
            Some(TimerSlot::Heartbeat)
        } else if self.frame == Some(timer_id) {
            Some(TimerSlot::Frame)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_armed(&self, slot: TimerSlot) -> bool {
        match slot {
            TimerSlot::Heartbeat => self.heartbeat.is_some(),
            TimerSlot::Frame => self.frame.is_some(),
        }
    }

    fn entry(&mut self, slot: TimerSlot) -> &mut Option<TimerId> {
        match slot {
            TimerSlot::Heartbeat => &mut self.heartbeat,
            TimerSlot::Frame => &mut self.frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearming_issues_fresh_ids() {
        let mut slots = TimerSlots::default();
        let first = slots.arm(TimerSlot::Frame).unwrap();
        assert!(slots.arm(TimerSlot::Frame).is_none());
        assert_eq!(slots.slot_of(first), Some(TimerSlot::Frame));

        assert_eq!(slots.disarm(TimerSlot::Frame), Some(first));
        assert_eq!(slots.slot_of(first), None);

        let second = slots.arm(TimerSlot::Frame).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn slots_are_independent() {
        let mut slots = TimerSlots::default();
        let heartbeat = slots.arm(TimerSlot::Heartbeat).unwrap();
        let frame = slots.arm(TimerSlot::Frame).unwrap();
        assert_eq!(slots.slot_of(heartbeat), Some(TimerSlot::Heartbeat));
        assert_eq!(slots.slot_of(frame), Some(TimerSlot::Frame));
        slots.disarm(TimerSlot::Heartbeat);
        assert!(slots.is_armed(TimerSlot::Frame));
        assert!(!slots.is_armed(TimerSlot::Heartbeat));
    }

    #[test]
    fn cadence_wire_shape() {
        let op = TimerOperation::Start {
            timer_id: TimerId(1),
            cadence: Cadence::Interval { ms: 1_000 },
        };
        let json = serde_json::to_value(op).unwrap();
        assert_eq!(json["data"]["cadence"]["type"], "Interval");
        assert_eq!(json["data"]["cadence"]["data"]["ms"], 1_000);
    }
}
