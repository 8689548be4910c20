//! Adaptive frame-rate controller.
//!
//! Drawing on a tablet alternates between bursts of activity and long
//! idle stretches. When the capture source reports no changes for a
//! quiet window the controller drops the target rate to `min_fps`; the
//! first changed frame snaps it back to `max_fps` and requests one
//! keyframe so the client resynchronises immediately.

use std::time::{Duration, Instant};

/// Outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpsUpdate {
    pub fps: u32,
    /// True exactly once per ramp-up transition.
    pub request_keyframe: bool,
}

#[derive(Debug)]
pub struct AdaptiveFps {
    min_fps: u32,
    max_fps: u32,
    ramp_down: Duration,
    current: u32,
    quiet_since: Option<Instant>,
}

impl AdaptiveFps {
    pub fn new(min_fps: u32, max_fps: u32, ramp_down: Duration) -> Self {
        let min_fps = min_fps.clamp(1, max_fps);
        Self { min_fps, max_fps, ramp_down, current: max_fps, quiet_since: None }
    }

    pub fn current_fps(&self) -> u32 {
        self.current
    }

    /// Effective tick interval at the current rate.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.current as u64)
    }

    /// Feed one tick's "did anything change" observation.
    pub fn observe(&mut self, changed: bool, now: Instant) -> FpsUpdate {
        if changed {
            self.quiet_since = None;
            if self.current != self.max_fps {
                self.current = self.max_fps;
                return FpsUpdate { fps: self.current, request_keyframe: true };
            }
            return FpsUpdate { fps: self.current, request_keyframe: false };
        }

        match self.quiet_since {
            None => self.quiet_since = Some(now),
            Some(since) if now.duration_since(since) >= self.ramp_down => {
                self.current = self.min_fps;
            }
            Some(_) => {}
        }
        FpsUpdate { fps: self.current, request_keyframe: false }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const RAMP: Duration = Duration::from_millis(1000);

    #[test]
    fn holds_max_while_active() {
        let mut fps = AdaptiveFps::new(10, 60, RAMP);
        let t0 = Instant::now();
        for i in 0..10 {
            let update = fps.observe(true, t0 + Duration::from_millis(i * 16));
            assert_eq!(update.fps, 60);
            assert!(!update.request_keyframe);
        }
    }

    #[test]
    fn ramps_down_after_quiet_window() {
        let mut fps = AdaptiveFps::new(10, 60, RAMP);
        let t0 = Instant::now();

        // Quiet, but not long enough yet.
        assert_eq!(fps.observe(false, t0).fps, 60);
        assert_eq!(fps.observe(false, t0 + Duration::from_millis(999)).fps, 60);

        // The quiet window elapses.
        let update = fps.observe(false, t0 + Duration::from_millis(1000));
        assert_eq!(update.fps, 10);
        assert!(!update.request_keyframe);
        assert_eq!(fps.interval(), Duration::from_micros(100_000));
    }

    #[test]
    fn change_restores_max_and_requests_one_keyframe() {
        let mut fps = AdaptiveFps::new(10, 60, RAMP);
        let t0 = Instant::now();
        fps.observe(false, t0);
        fps.observe(false, t0 + RAMP);
        assert_eq!(fps.current_fps(), 10);

        // The very next change snaps back and asks for exactly one
        // keyframe.
        let update = fps.observe(true, t0 + RAMP + Duration::from_millis(1));
        assert_eq!(update.fps, 60);
        assert!(update.request_keyframe);

        let update = fps.observe(true, t0 + RAMP + Duration::from_millis(17));
        assert!(!update.request_keyframe);
    }

    #[test]
    fn activity_restarts_the_quiet_window() {
        let mut fps = AdaptiveFps::new(10, 60, RAMP);
        let t0 = Instant::now();
        fps.observe(false, t0);
        fps.observe(true, t0 + Duration::from_millis(900));
        // 900 ms of the old window don't count any more.
        assert_eq!(fps.observe(false, t0 + Duration::from_millis(1800)).fps, 60);
        assert_eq!(fps.observe(false, t0 + Duration::from_millis(2799)).fps, 60);
        assert_eq!(fps.observe(false, t0 + Duration::from_millis(2800)).fps, 10);
    }

    #[test]
    fn min_is_clamped_to_max() {
        let fps = AdaptiveFps::new(90, 60, RAMP);
        assert_eq!(fps.current_fps(), 60);
    }
}
