//! Frame timing
//!
//! [`FrameClock`] measures wall-clock time between frames and
//! [`FixedTimestep`] turns it into a whole number of fixed updates.

use std::time::{Duration, Instant};

/// Accumulator that converts variable frame time into fixed-size steps.
///
/// Time that does not fill a step carries over to the next frame. When more
/// than `max_updates` steps are pending the backlog is dropped and only the
/// leftover fraction kept, so a long stall cannot snowball into ever longer
/// frames.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    step: Duration,
    accumulator: Duration,
    max_updates: u32,
}

impl FixedTimestep {
    pub fn new(step: Duration, max_updates: u32) -> Self {
        debug_assert!(!step.is_zero(), "fixed step must be non-zero");
        debug_assert!(max_updates > 0, "at least one update per frame is required");
        Self {
            step,
            accumulator: Duration::ZERO,
            max_updates,
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Step length in seconds, as handed to `update`
    pub fn step_secs(&self) -> f32 {
        self.step.as_secs_f32()
    }

    /// Time accumulated towards the next step
    pub fn pending(&self) -> Duration {
        self.accumulator
    }

    /// Fraction of a step accumulated, useful for render interpolation
    pub fn alpha(&self) -> f32 {
        self.accumulator.as_secs_f32() / self.step.as_secs_f32()
    }

    /// Add one frame's worth of time and return how many updates to run
    pub fn advance(&mut self, frame_dt: Duration) -> u32 {
        self.accumulator += frame_dt;

        let mut updates = 0;
        while self.accumulator >= self.step && updates < self.max_updates {
            self.accumulator -= self.step;
            updates += 1;
        }

        if self.accumulator >= self.step {
            let dropped = self.accumulator.as_nanos() / self.step.as_nanos();
            log::debug!("Fixed timestep fell behind, dropping {} updates", dropped);
            let remainder = self.accumulator.as_nanos() % self.step.as_nanos();
            self.accumulator = Duration::from_nanos(remainder as u64);
        }

        updates
    }

    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
    }
}

/// Frame timing snapshot.
#[derive(Debug, Copy, Clone)]
pub struct FrameTime {
    /// Time elapsed since the previous tick, clamped
    pub dt: Duration,
    pub now: Instant,
    /// Monotonic frame counter
    pub frame_index: u64,
}

/// Wall clock producing clamped frame deltas.
///
/// The upper clamp keeps a debugger pause or a minimized window from
/// arriving as one enormous frame.
#[derive(Debug, Clone)]
pub struct FrameClock {
    last: Instant,
    frame_index: u64,
    dt_min: Duration,
    dt_max: Duration,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::with_clamps(Duration::from_micros(100), Duration::from_millis(250))
    }

    pub fn with_clamps(dt_min: Duration, dt_max: Duration) -> Self {
        debug_assert!(dt_min <= dt_max);
        Self {
            last: Instant::now(),
            frame_index: 0,
            dt_min,
            dt_max,
        }
    }

    /// Restart measuring from now, e.g. after the window was restored
    pub fn reset(&mut self) {
        self.last = Instant::now();
    }

    pub fn tick(&mut self) -> FrameTime {
        let now = Instant::now();
        let dt = now
            .saturating_duration_since(self.last)
            .clamp(self.dt_min, self.dt_max);
        self.last = now;

        let time = FrameTime {
            dt,
            now,
            frame_index: self.frame_index,
        };
        self.frame_index = self.frame_index.wrapping_add(1);
        time
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_leftover_time_carries_over() {
        let mut timestep = FixedTimestep::new(ms(250), 5);
        assert_eq!(timestep.advance(ms(600)), 2);
        assert_eq!(timestep.pending(), ms(100));
        assert_eq!(timestep.advance(ms(150)), 1);
        assert_eq!(timestep.pending(), Duration::ZERO);
    }

    #[rstest]
    #[case::short_frame(ms(5), 0)]
    #[case::exact_step(ms(10), 1)]
    #[case::several_steps(ms(35), 3)]
    #[case::clamped(ms(500), 4)]
    fn test_update_count(#[case] frame_dt: Duration, #[case] expected: u32) {
        let mut timestep = FixedTimestep::new(ms(10), 4);
        assert_eq!(timestep.advance(frame_dt), expected);
    }

    #[test]
    fn test_backlog_is_dropped_when_clamped() {
        let mut timestep = FixedTimestep::new(ms(10), 2);
        assert_eq!(timestep.advance(ms(105)), 2);
        assert_eq!(timestep.pending(), ms(5));
        assert_eq!(timestep.advance(ms(0)), 0);
    }

    #[test]
    fn test_frame_clock_counts_frames() {
        let mut clock = FrameClock::with_clamps(ms(1), ms(50));
        let first = clock.tick();
        let second = clock.tick();
        assert_eq!(first.frame_index, 0);
        assert_eq!(second.frame_index, 1);
        assert!(second.dt >= ms(1) && second.dt <= ms(50));
    }
}
