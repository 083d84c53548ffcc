//! Dequeue pacing strategies that do not rely on a clock-offset estimate.
//!
//! Both answer the same question as time alignment: how long until the next
//! frame should be taken from the jitter buffer.

use moq_playout_common::Ticks;
use std::time::Duration;

/// Computes the wait before the next dequeue attempt.
pub trait VideoDequeuer: Send {
    /// Seconds to wait from `from`; may be negative when behind.
    fn calculate_wait_time(&mut self, from: Ticks) -> f64;
}

/// Drives the jitter buffer towards a target depth by speeding up or slowing
/// down the dequeue rate.
#[derive(Debug, Clone)]
pub struct PidDequeuer {
    // ---
    /// Input: the jitter buffer depth, updated before each call.
    pub current_depth: Duration,
    target_depth: f64,
    frame_duration: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    last_error: f64,
}

impl PidDequeuer {
    // ---
    pub fn new(target_depth: Duration, frame_duration: Duration, kp: f64, ki: f64, kd: f64) -> Self {
        // ---
        Self {
            current_depth: Duration::ZERO,
            target_depth: target_depth.as_secs_f64(),
            frame_duration: frame_duration.as_secs_f64(),
            kp,
            ki,
            kd,
            integral: 0.0,
            last_error: 0.0,
        }
    }
}

impl VideoDequeuer for PidDequeuer {
    fn calculate_wait_time(&mut self, _from: Ticks) -> f64 {
        // ---
        // Too shallow gives a positive error and a longer wait.
        let error = self.target_depth - self.current_depth.as_secs_f64();
        self.integral += error;
        let derivative = error - self.last_error;
        self.last_error = error;
        self.frame_duration + self.kp * error + self.ki * self.integral + self.kd * derivative
    }
}

/// Reconstructs the original frame cadence from the first arrival: frame N
/// is due at `first_write + min_depth + N * frame_duration`.
#[derive(Debug, Clone)]
pub struct IntervalDequeuer {
    /// Input: frames dequeued so far.
    pub dequeued_count: u64,
    min_depth: Duration,
    frame_duration: Duration,
    first_write: Ticks,
}

impl IntervalDequeuer {
    pub fn new(min_depth: Duration, frame_duration: Duration, first_write: Ticks) -> Self {
        Self {
            dequeued_count: 0,
            min_depth,
            frame_duration,
            first_write,
        }
    }

    /// When frame number `dequeued_count` is due.
    pub fn expected_time(&self) -> Ticks {
        // ---
        let offset = self.min_depth.as_secs_f64()
            + self.frame_duration.as_secs_f64() * self.dequeued_count as f64;
        self.first_write.adding_time_interval(offset)
    }
}

impl VideoDequeuer for IntervalDequeuer {
    fn calculate_wait_time(&mut self, from: Ticks) -> f64 {
        self.expected_time().time_interval_since(from)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const FRAME: Duration = Duration::from_millis(33);

    #[test]
    fn pid_at_target_waits_one_frame() {
        // ---
        let mut pid = PidDequeuer::new(Duration::from_millis(100), FRAME, 0.5, 0.1, 0.1);
        pid.current_depth = Duration::from_millis(100);
        let wait = pid.calculate_wait_time(Ticks::ZERO);
        assert!((wait - 0.033).abs() < 1e-9);
    }

    #[test]
    fn pid_slows_down_when_shallow_and_speeds_up_when_deep() {
        // ---
        let mut pid = PidDequeuer::new(Duration::from_millis(100), FRAME, 0.5, 0.0, 0.0);
        pid.current_depth = Duration::from_millis(50);
        assert!(pid.calculate_wait_time(Ticks::ZERO) > 0.033);

        pid.current_depth = Duration::from_millis(200);
        assert!(pid.calculate_wait_time(Ticks::ZERO) < 0.033);
    }

    #[test]
    fn pid_integral_accumulates() {
        // ---
        let mut pid = PidDequeuer::new(Duration::from_millis(100), FRAME, 0.0, 1.0, 0.0);
        pid.current_depth = Duration::from_millis(90);
        let first = pid.calculate_wait_time(Ticks::ZERO);
        let second = pid.calculate_wait_time(Ticks::ZERO);
        assert!((first - (0.033 + 0.01)).abs() < 1e-9);
        assert!((second - (0.033 + 0.02)).abs() < 1e-9);
    }

    #[test]
    fn interval_follows_frame_cadence() {
        // ---
        let first_write = Ticks::from_secs_f64(10.0);
        let mut dequeuer = IntervalDequeuer::new(Duration::from_millis(200), FRAME, first_write);

        assert!((dequeuer.calculate_wait_time(first_write) - 0.2).abs() < 1e-6);

        dequeuer.dequeued_count = 3;
        let from = first_write.adding_time_interval(0.25);
        assert!((dequeuer.calculate_wait_time(from) - 0.049).abs() < 1e-6);

        // Behind schedule.
        let late = first_write.adding_time_interval(1.0);
        assert!(dequeuer.calculate_wait_time(late) < 0.0);
    }
}
