//! Single-axis PID controller.
//!
//! One instance drives one servo axis. The controller measures `dt` from the
//! wall clock between successive updates, so the correction it produces is a
//! function of how often frames arrive as well as of the error itself.

use std::time::Instant;

/// Anti-windup bound on the accumulated integral, in error-units·seconds.
pub const INTEGRAL_LIMIT: f64 = 50.0;

/// Substituted when the measured `dt` is zero or negative.
pub const MIN_DT_SECS: f64 = 0.001;

/// Proportional, integral and derivative gains for one axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self::new(0.15, 0.01, 0.08)
    }
}

/// Stateful error-to-correction transform for one axis.
///
/// Not shared between axes and not meant to be driven from more than one
/// thread; the tracking loop owns both instances outright.
#[derive(Clone, Debug)]
pub struct PidController {
    gains: PidGains,
    integral: f64,
    last_error: f64,
    last_time: Instant,
}

impl PidController {
    pub fn new(gains: PidGains) -> Self {
        Self::new_at(gains, Instant::now())
    }

    /// Construct with an explicit initial timestamp.
    pub fn new_at(gains: PidGains, now: Instant) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: 0.0,
            last_time: now,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    /// Feed one error sample and return the correction.
    pub fn update(&mut self, error: f64) -> f64 {
        self.update_at(error, Instant::now())
    }

    /// Same as [`update`](Self::update) with the sample time supplied by the caller.
    pub fn update_at(&mut self, error: f64, now: Instant) -> f64 {
        let mut dt = now
            .checked_duration_since(self.last_time)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        if dt <= 0.0 {
            dt = MIN_DT_SECS;
        }

        let p = self.gains.kp * error;

        self.integral = (self.integral + error * dt).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
        let i = self.gains.ki * self.integral;

        let d = self.gains.kd * (error - self.last_error) / dt;

        self.last_error = error;
        self.last_time = now;

        p + i + d
    }

    /// Drop accumulated state so reacquisition starts without a step response.
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&mut self, now: Instant) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_time = now;
    }
}
