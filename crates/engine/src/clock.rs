//! Fixed-timestep frame clock.
//!
//! The frame loop runs updates at a fixed rate and renders at whatever rate
//! the swapchain allows. [`FrameClock`] owns that split: real elapsed time
//! accumulates into a lag counter, [`FrameClock::step`] hands it out in
//! fixed `delta` quanta, and whatever fraction remains becomes the render
//! interpolation factor.

use std::time::Instant;

/// Upper bound on buffered update steps.
///
/// After a long stall (debugger, window drag) the accumulator would
/// otherwise demand hundreds of catch-up updates and the loop would fall
/// further behind each frame. Excess lag beyond this many steps is
/// discarded.
const MAX_PENDING_STEPS: f64 = 8.0;

/// Accumulating clock for the fixed-timestep update loop.
pub struct FrameClock {
    delta: f64,
    previous: Instant,
    lag: f64,
}

impl FrameClock {
    /// Creates a clock running updates at `update_hz`.
    pub fn new(update_hz: u32) -> Self {
        Self {
            delta: 1.0 / update_hz.max(1) as f64,
            previous: Instant::now(),
            lag: 0.0,
        }
    }

    /// The fixed update timestep in seconds.
    #[inline]
    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Folds the wall-clock time since the last call into the accumulator.
    ///
    /// Call once per loop iteration, before draining steps.
    pub fn advance(&mut self) {
        let now = Instant::now();
        self.accumulate((now - self.previous).as_secs_f64());
        self.previous = now;
    }

    /// Consumes one fixed step if enough time has accumulated.
    ///
    /// Drain with `while clock.step() { update(clock.delta()) }`.
    pub fn step(&mut self) -> bool {
        if self.lag >= self.delta {
            self.lag -= self.delta;
            true
        } else {
            false
        }
    }

    /// Interpolation factor for rendering: the un-consumed fraction of a
    /// step, in `[0, 1)` once steps are drained.
    #[inline]
    pub fn alpha(&self) -> f64 {
        self.lag / self.delta
    }

    fn accumulate(&mut self, elapsed: f64) {
        self.lag = (self.lag + elapsed).min(self.delta * MAX_PENDING_STEPS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock_with_lag(update_hz: u32, lag: f64) -> FrameClock {
        let mut clock = FrameClock::new(update_hz);
        clock.accumulate(lag);
        clock
    }

    #[test]
    fn test_steps_consume_fixed_quanta() {
        // 3.5 steps worth of lag at 10 Hz: three updates, half a step left.
        let mut clock = clock_with_lag(10, 0.35);
        let mut steps = 0;
        while clock.step() {
            steps += 1;
        }
        assert_eq!(steps, 3);
        assert!((clock.alpha() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_is_a_fraction_after_draining() {
        let mut clock = clock_with_lag(60, 0.1);
        while clock.step() {}
        assert!(clock.alpha() >= 0.0);
        assert!(clock.alpha() < 1.0);
    }

    #[test]
    fn test_no_step_before_a_full_delta() {
        let mut clock = clock_with_lag(30, 0.01);
        assert!(!clock.step());
        // The partial lag is kept for the next iteration.
        assert!(clock.alpha() > 0.0);
    }

    #[test]
    fn test_stall_is_capped() {
        // A 10-second stall at 60 Hz must not demand 600 catch-up updates.
        let mut clock = clock_with_lag(60, 10.0);
        let mut steps = 0;
        while clock.step() {
            steps += 1;
        }
        assert_eq!(steps as f64, MAX_PENDING_STEPS);
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        let clock = FrameClock::new(0);
        assert_eq!(clock.delta(), 1.0);
    }
}
