//! Pixel error to pan/tilt angle conversion.
//!
//! Angles are logical degrees tracked purely in software. There is no servo
//! position feedback: the state is dead-reckoned from what was commanded,
//! and the actuator is trusted to have reached it.

use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::{PixelOffset, PixelPoint};
use crate::pid::PidController;

/// Inclusive mechanical range of one axis, in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisRange {
    min: f64,
    max: f64,
}

impl AxisRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() {
            return Err(anyhow!("axis range bounds must be finite"));
        }
        if min > max {
            return Err(anyhow!("axis range is inverted: min {} > max {}", min, max));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn clamp(&self, angle: f64) -> f64 {
        angle.clamp(self.min, self.max)
    }

    pub fn contains(&self, angle: f64) -> bool {
        (self.min..=self.max).contains(&angle)
    }
}

/// Per-axis pixel band around the frame center treated as "centered".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadzone {
    pub x: i32,
    pub y: i32,
}

impl Deadzone {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Zero each component strictly inside the band; each axis independently.
    pub fn apply(&self, error: PixelOffset) -> PixelOffset {
        PixelOffset {
            x: if (error.x as i64).abs() < self.x as i64 { 0 } else { error.x },
            y: if (error.y as i64).abs() < self.y as i64 { 0 } else { error.y },
        }
    }
}

/// Where the mount is believed to point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AngleState {
    pub pan: f64,
    pub tilt: f64,
}

impl AngleState {
    pub const fn new(pan: f64, tilt: f64) -> Self {
        Self { pan, tilt }
    }
}

/// Everything one calculation produced, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AngleUpdate {
    pub angles: AngleState,
    /// Target center minus frame center.
    pub raw_error: PixelOffset,
    /// `raw_error` after deadzone suppression; what the PIDs saw.
    pub error: PixelOffset,
    /// Rate-limited corrections, degrees this frame.
    pub pan_adjustment: f64,
    pub tilt_adjustment: f64,
}

/// Immutable limits and smoothing applied on every frame with a target.
#[derive(Clone, Copy, Debug)]
pub struct AngleCalculator {
    pan_range: AxisRange,
    tilt_range: AxisRange,
    max_speed: f64,
    deadzone: Deadzone,
    smoothing_factor: f64,
}

impl AngleCalculator {
    pub fn new(
        pan_range: AxisRange,
        tilt_range: AxisRange,
        max_speed: f64,
        deadzone: Deadzone,
        smoothing_factor: f64,
    ) -> Result<Self> {
        if !(max_speed.is_finite() && max_speed > 0.0) {
            return Err(anyhow!("max_speed must be > 0 (got {})", max_speed));
        }
        if !(smoothing_factor > 0.0 && smoothing_factor <= 1.0) {
            return Err(anyhow!(
                "smoothing_factor must be within (0, 1] (got {})",
                smoothing_factor
            ));
        }
        if deadzone.x < 0 || deadzone.y < 0 {
            return Err(anyhow!("deadzone must be non-negative"));
        }
        Ok(Self {
            pan_range,
            tilt_range,
            max_speed,
            deadzone,
            smoothing_factor,
        })
    }

    pub fn pan_range(&self) -> AxisRange {
        self.pan_range
    }

    pub fn tilt_range(&self) -> AxisRange {
        self.tilt_range
    }

    pub fn deadzone(&self) -> Deadzone {
        self.deadzone
    }

    pub fn compute(
        &self,
        target_center: PixelPoint,
        frame_center: PixelPoint,
        state: AngleState,
        pid_pan: &mut PidController,
        pid_tilt: &mut PidController,
    ) -> AngleUpdate {
        self.compute_at(
            target_center,
            frame_center,
            state,
            pid_pan,
            pid_tilt,
            Instant::now(),
        )
    }

    /// Deadzone, PID, rate limit, range clamp, then exponential smoothing.
    pub fn compute_at(
        &self,
        target_center: PixelPoint,
        frame_center: PixelPoint,
        state: AngleState,
        pid_pan: &mut PidController,
        pid_tilt: &mut PidController,
        now: Instant,
    ) -> AngleUpdate {
        let raw_error = target_center.offset_from(frame_center);
        let error = self.deadzone.apply(raw_error);

        let pan_adjustment = pid_pan
            .update_at(error.x as f64, now)
            .clamp(-self.max_speed, self.max_speed);
        let tilt_adjustment = pid_tilt
            .update_at(error.y as f64, now)
            .clamp(-self.max_speed, self.max_speed);

        // Mirrored mounting: positive x error steers pan down, positive y error
        // steers tilt up.
        let candidate_pan = self.pan_range.clamp(state.pan - pan_adjustment);
        let candidate_tilt = self.tilt_range.clamp(state.tilt + tilt_adjustment);

        let pan = state.pan + (candidate_pan - state.pan) * self.smoothing_factor;
        let tilt = state.tilt + (candidate_tilt - state.tilt) * self.smoothing_factor;

        AngleUpdate {
            // The smoothing step is convex; these clamps only absorb rounding at
            // the bounds.
            angles: AngleState::new(self.pan_range.clamp(pan), self.tilt_range.clamp(tilt)),
            raw_error,
            error,
            pan_adjustment,
            tilt_adjustment,
        }
    }
}
