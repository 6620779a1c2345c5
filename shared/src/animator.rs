use tracing::debug;

use crate::model::{Coordinate, UnixTimeMs};

#[derive(Clone, Copy, Debug, PartialEq)]
struct Interpolation {
    from: Coordinate,
    to: Coordinate,
    started_at: UnixTimeMs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retarget {
    /// Nothing was displayed yet; the marker moved straight to the target.
    Jumped,
    /// A new interpolation started. The caller should drive frames.
    Animating,
}

/// Smooths a remote actor's reported positions into per-frame values.
#[derive(Clone, Debug)]
pub struct PositionAnimator {
    duration_ms: u64,
    displayed: Option<Coordinate>,
    active: Option<Interpolation>,
}

impl Default for PositionAnimator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_ANIMATION_DURATION_MS)
    }
}

/// Fraction of `duration_ms` elapsed since `started_at`, clamped to `[0, 1]`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress(started_at: UnixTimeMs, now: UnixTimeMs, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 1.0;
    }
    (now.elapsed_since(started_at) as f64 / duration_ms as f64).clamp(0.0, 1.0)
}

impl PositionAnimator {
    #[must_use]
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            displayed: None,
            active: None,
        }
    }

    pub fn set_duration(&mut self, duration_ms: u64) {
        self.duration_ms = duration_ms;
    }

    #[must_use]
    pub fn displayed(&self) -> Option<Coordinate> {
        self.displayed
    }

    #[must_use]
    pub fn is_animating(&self) -> bool {
        self.active.is_some()
    }

    /// Points the marker at `target`. A running interpolation is superseded
    /// and the new one starts from wherever the marker currently is.
    pub fn retarget(&mut self, target: Coordinate, now: UnixTimeMs) -> Retarget {
        let Some(current) = self.position_at(now) else {
            self.displayed = Some(target);
            self.active = None;
            return Retarget::Jumped;
        };
        if self.active.is_some() {
            debug!("superseding running interpolation");
        }
        self.displayed = Some(current);
        self.active = Some(Interpolation {
            from: current,
            to: target,
            started_at: now,
        });
        Retarget::Animating
    }

    #[must_use]
    pub fn position_at(&self, now: UnixTimeMs) -> Option<Coordinate> {
        match self.active {
            Some(anim) => Some(
                anim.from
                    .lerp(anim.to, progress(anim.started_at, now, self.duration_ms)),
            ),
            None => self.displayed,
        }
    }

    /// Advances one display frame. The interpolation finishes itself once
    /// progress reaches 1.
    pub fn frame(&mut self, now: UnixTimeMs) -> Option<Coordinate> {
        let anim = self.active?;
        let p = progress(anim.started_at, now, self.duration_ms);
        let position = anim.from.lerp(anim.to, p);
        self.displayed = Some(position);
        if p >= 1.0 {
            self.active = None;
        }
        Some(position)
    }

    /// Stops the running interpolation, leaving the marker where it was last
    /// drawn. Returns whether anything was running.
    pub fn cancel(&mut self) -> bool {
        self.active.take().is_some()
    }

    /// Tears down the animator along with its owning view.
    pub fn clear(&mut self) {
        self.active = None;
        self.displayed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(lng: f64, lat: f64) -> Coordinate {
        Coordinate::from_lng_lat(lng, lat).unwrap()
    }

    fn close(a: Coordinate, b: [f64; 2]) -> bool {
        (a.lng() - b[0]).abs() < 1e-9 && (a.lat() - b[1]).abs() < 1e-9
    }

    #[test]
    fn first_target_jumps() {
        let mut animator = PositionAnimator::new(800);
        assert_eq!(animator.retarget(at(3.0, 4.0), UnixTimeMs(0)), Retarget::Jumped);
        assert_eq!(animator.displayed(), Some(at(3.0, 4.0)));
        assert!(!animator.is_animating());
    }

    #[test]
    fn midpoint_is_halfway() {
        let mut animator = PositionAnimator::new(800);
        animator.retarget(at(0.0, 0.0), UnixTimeMs(0));
        assert_eq!(animator.retarget(at(10.0, 10.0), UnixTimeMs(1_000)), Retarget::Animating);

        let mid = animator.frame(UnixTimeMs(1_400)).unwrap();
        assert!(close(mid, [5.0, 5.0]));

        let end = animator.frame(UnixTimeMs(2_000)).unwrap();
        assert!(close(end, [10.0, 10.0]));
        assert!(!animator.is_animating());
        assert!(animator.frame(UnixTimeMs(2_100)).is_none());
    }

    #[test]
    fn retarget_mid_flight_starts_from_interpolated_point() {
        let mut animator = PositionAnimator::new(800);
        animator.retarget(at(0.0, 0.0), UnixTimeMs(0));
        animator.retarget(at(10.0, 10.0), UnixTimeMs(0));

        animator.retarget(at(20.0, 0.0), UnixTimeMs(400));
        let start = animator.position_at(UnixTimeMs(400)).unwrap();
        assert!(close(start, [5.0, 5.0]));

        let mid = animator.frame(UnixTimeMs(800)).unwrap();
        assert!(close(mid, [12.5, 2.5]));
    }

    #[test]
    fn cancel_freezes_last_drawn_frame() {
        let mut animator = PositionAnimator::new(800);
        animator.retarget(at(0.0, 0.0), UnixTimeMs(0));
        animator.retarget(at(8.0, 0.0), UnixTimeMs(0));
        animator.frame(UnixTimeMs(200));
        assert!(animator.cancel());
        assert!(!animator.cancel());
        assert!(close(animator.displayed().unwrap(), [2.0, 0.0]));

        animator.clear();
        assert_eq!(animator.displayed(), None);
    }

    proptest! {
        #[test]
        fn progress_is_clamped(start in 0u64..1_000_000, now in 0u64..2_000_000, duration in 0u64..10_000) {
            let p = progress(UnixTimeMs(start), UnixTimeMs(now), duration);
            prop_assert!((0.0..=1.0).contains(&p));
        }
    }
}
