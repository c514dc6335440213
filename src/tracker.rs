//! Per-frame tracking orchestration.
//!
//! The loop is re-evaluated from scratch on every sampled frame: a target
//! found puts it in TRACKING, no target puts it in SEARCHING. There is no
//! hold-over between the two beyond the PID integral. Losing the target
//! never moves the mount; only an explicit center command does.

use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::angles::{AngleCalculator, AngleState, AngleUpdate};
use crate::command::OperatorCommand;
use crate::detect::{Detection, PixelOffset, PixelPoint};
use crate::pid::{PidController, PidGains};
use crate::select::{self, SelectionPolicy};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingState {
    #[default]
    Searching,
    Tracking,
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Searching => write!(f, "SEARCHING"),
            Self::Tracking => write!(f, "TRACKING"),
        }
    }
}

/// Angle record handed to the actuator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AngleCommand {
    pub pan: f64,
    pub tilt: f64,
    pub tracking: bool,
    pub target_label: Option<String>,
    pub confidence: f32,
    /// Raw pixel error of the followed target; zero when not tracking.
    pub error: PixelOffset,
}

/// Static parameters of a [`TrackingLoop`].
#[derive(Clone, Debug)]
pub struct TrackerSettings {
    pub calculator: AngleCalculator,
    pub pan_gains: PidGains,
    pub tilt_gains: PidGains,
    pub center: AngleState,
    pub detection_interval: u64,
    pub confidence_threshold: f32,
    pub policy: SelectionPolicy,
    pub target_label: Option<String>,
}

/// What happened on one frame.
#[derive(Clone, Debug)]
pub struct FrameOutcome {
    pub frame_index: u64,
    /// False when the detection interval skipped this frame.
    pub sampled: bool,
    pub state: TrackingState,
    pub angles: AngleState,
    pub detections: Vec<Detection>,
    pub target: Option<Detection>,
    pub update: Option<AngleUpdate>,
    pub target_label: Option<String>,
}

impl FrameOutcome {
    pub fn is_tracking(&self) -> bool {
        self.state == TrackingState::Tracking
    }

    /// Index into `detections` of the followed detection.
    pub fn target_index(&self) -> Option<usize> {
        let target = self.target.as_ref()?;
        self.detections.iter().position(|d| d == target)
    }

    pub fn command(&self) -> AngleCommand {
        AngleCommand {
            pan: self.angles.pan,
            tilt: self.angles.tilt,
            tracking: self.is_tracking(),
            target_label: self.target_label.clone(),
            confidence: self.target.as_ref().map_or(0.0, |t| t.confidence),
            error: self.update.map_or(PixelOffset::ZERO, |u| u.raw_error),
        }
    }
}

/// Cross-frame tracking state: current angles, both PID axes, the requested
/// identity and the frame counter.
pub struct TrackingLoop {
    calculator: AngleCalculator,
    pid_pan: PidController,
    pid_tilt: PidController,
    center: AngleState,
    angles: AngleState,
    detection_interval: u64,
    confidence_threshold: f32,
    policy: SelectionPolicy,
    target_label: Option<String>,
    last_target_center: Option<PixelPoint>,
    frame_count: u64,
    state: TrackingState,
}

impl TrackingLoop {
    pub fn new(settings: TrackerSettings) -> Result<Self> {
        Self::new_at(settings, Instant::now())
    }

    pub fn new_at(settings: TrackerSettings, now: Instant) -> Result<Self> {
        if settings.detection_interval == 0 {
            return Err(anyhow!("detection_interval must be >= 1"));
        }
        let calc = &settings.calculator;
        if !calc.pan_range().contains(settings.center.pan) {
            return Err(anyhow!(
                "pan center {} outside pan range",
                settings.center.pan
            ));
        }
        if !calc.tilt_range().contains(settings.center.tilt) {
            return Err(anyhow!(
                "tilt center {} outside tilt range",
                settings.center.tilt
            ));
        }
        Ok(Self {
            calculator: settings.calculator,
            pid_pan: PidController::new_at(settings.pan_gains, now),
            pid_tilt: PidController::new_at(settings.tilt_gains, now),
            center: settings.center,
            angles: settings.center,
            detection_interval: settings.detection_interval,
            confidence_threshold: settings.confidence_threshold,
            policy: settings.policy,
            target_label: normalize_label(settings.target_label),
            last_target_center: None,
            frame_count: 0,
            state: TrackingState::Searching,
        })
    }

    pub fn angles(&self) -> AngleState {
        self.angles
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn target_label(&self) -> Option<&str> {
        self.target_label.as_deref()
    }

    pub fn last_target_center(&self) -> Option<PixelPoint> {
        self.last_target_center
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Whether the next call to `process_frame` will run the detector.
    pub fn next_frame_is_sampled(&self) -> bool {
        self.frame_count % self.detection_interval == 0
    }

    pub fn process_frame<F>(&mut self, frame_center: PixelPoint, detect: F) -> FrameOutcome
    where
        F: FnOnce() -> Result<Vec<Detection>>,
    {
        self.process_frame_at(frame_center, detect, Instant::now())
    }

    /// Run one frame. `detect` is only called on sampled frames; its failure
    /// counts as "no target".
    pub fn process_frame_at<F>(
        &mut self,
        frame_center: PixelPoint,
        detect: F,
        now: Instant,
    ) -> FrameOutcome
    where
        F: FnOnce() -> Result<Vec<Detection>>,
    {
        let frame_index = self.frame_count;
        self.frame_count += 1;

        if frame_index % self.detection_interval != 0 {
            return FrameOutcome {
                frame_index,
                sampled: false,
                state: self.state,
                angles: self.angles,
                detections: Vec::new(),
                target: None,
                update: None,
                target_label: self.target_label.clone(),
            };
        }

        let detections = match detect() {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!("detector failed on frame {}: {}", frame_index, e);
                Vec::new()
            }
        };

        let target = select::select(
            self.policy,
            &detections,
            self.target_label.as_deref(),
            self.confidence_threshold,
        )
        .cloned();

        let (next_state, update) = match &target {
            Some(target) => {
                let update = self.calculator.compute_at(
                    target.center(),
                    frame_center,
                    self.angles,
                    &mut self.pid_pan,
                    &mut self.pid_tilt,
                    now,
                );
                self.angles = update.angles;
                self.last_target_center = Some(target.center());
                log::debug!(
                    "frame {}: error=({}, {}) pan={:.1} tilt={:.1}",
                    frame_index,
                    update.raw_error.x,
                    update.raw_error.y,
                    update.angles.pan,
                    update.angles.tilt
                );
                (TrackingState::Tracking, Some(update))
            }
            None => (TrackingState::Searching, None),
        };

        if next_state != self.state {
            log::info!("{} -> {} (frame {})", self.state, next_state, frame_index);
            self.state = next_state;
        }

        let target_label = target
            .as_ref()
            .and_then(|t| t.label.clone())
            .or_else(|| self.target_label.clone());

        FrameOutcome {
            frame_index,
            sampled: true,
            state: self.state,
            angles: self.angles,
            detections,
            target,
            update,
            target_label,
        }
    }

    /// Drop both PID histories and the last target center. Angles stay put.
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&mut self, now: Instant) {
        self.pid_pan.reset_at(now);
        self.pid_tilt.reset_at(now);
        self.last_target_center = None;
    }

    /// Jump straight to the configured center, bypassing PID and smoothing.
    pub fn center(&mut self) -> AngleCommand {
        self.angles = self.center;
        self.idle_command()
    }

    /// Change the followed identity. Returns whether it actually changed;
    /// a change resets both PIDs.
    pub fn set_target(&mut self, label: Option<String>) -> bool {
        self.set_target_at(label, Instant::now())
    }

    pub fn set_target_at(&mut self, label: Option<String>, now: Instant) -> bool {
        let label = normalize_label(label);
        let unchanged = match (&self.target_label, &label) {
            (Some(current), Some(new)) => current.eq_ignore_ascii_case(new),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return false;
        }
        log::info!(
            "target changed: {} -> {}",
            self.target_label.as_deref().unwrap_or("none"),
            label.as_deref().unwrap_or("none")
        );
        self.target_label = label;
        self.reset_at(now);
        true
    }

    /// Apply an operator command. Centering returns the command that must be
    /// sent right away; `Quit` is left to the caller.
    pub fn apply_command(&mut self, command: &OperatorCommand) -> Option<AngleCommand> {
        self.apply_command_at(command, Instant::now())
    }

    pub fn apply_command_at(
        &mut self,
        command: &OperatorCommand,
        now: Instant,
    ) -> Option<AngleCommand> {
        match command {
            OperatorCommand::Center => {
                self.reset_at(now);
                Some(self.center())
            }
            OperatorCommand::Reset => {
                self.reset_at(now);
                None
            }
            OperatorCommand::SetTarget(label) => {
                self.set_target_at(label.clone(), now);
                None
            }
            OperatorCommand::Quit => None,
        }
    }

    /// Current angles as a non-tracking command.
    pub fn idle_command(&self) -> AngleCommand {
        AngleCommand {
            pan: self.angles.pan,
            tilt: self.angles.tilt,
            tracking: false,
            target_label: self.target_label.clone(),
            confidence: 0.0,
            error: PixelOffset::ZERO,
        }
    }
}

fn normalize_label(label: Option<String>) -> Option<String> {
    label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("none"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::angles::{AxisRange, Deadzone};
    use crate::detect::BoundingBox;
    use std::cell::Cell;
    use std::time::Duration;

    const FRAME_CENTER: PixelPoint = PixelPoint::new(320, 240);

    fn settings(interval: u64, label: Option<&str>) -> TrackerSettings {
        TrackerSettings {
            calculator: AngleCalculator::new(
                AxisRange::new(0.0, 180.0).unwrap(),
                AxisRange::new(30.0, 150.0).unwrap(),
                5.0,
                Deadzone::new(20, 20),
                0.3,
            )
            .unwrap(),
            pan_gains: PidGains::default(),
            tilt_gains: PidGains::default(),
            center: AngleState::new(90.0, 90.0),
            detection_interval: interval,
            confidence_threshold: 0.85,
            policy: SelectionPolicy::Labeled,
            target_label: label.map(str::to_string),
        }
    }

    // 40x40 box centered on (cx, cy).
    fn face(label: &str, confidence: f32, cx: i32, cy: i32) -> Detection {
        Detection::labeled(BoundingBox::new(cx - 20, cy - 20, 40, 40), confidence, label)
    }

    #[test]
    fn no_label_keeps_searching_and_holds_angles() {
        let t0 = Instant::now();
        let mut tracker = TrackingLoop::new_at(settings(1, None), t0).unwrap();
        let outcome = tracker.process_frame_at(
            FRAME_CENTER,
            || Ok(vec![face("laura", 0.99, 500, 100)]),
            t0 + Duration::from_millis(33),
        );
        assert!(outcome.sampled);
        assert_eq!(outcome.state, TrackingState::Searching);
        assert_eq!(outcome.detections.len(), 1);
        assert!(outcome.target.is_none());
        assert_eq!(tracker.angles(), AngleState::new(90.0, 90.0));
        let cmd = outcome.command();
        assert!(!cmd.tracking);
        assert_eq!(cmd.confidence, 0.0);
        assert_eq!(cmd.error, PixelOffset::ZERO);
    }

    #[test]
    fn target_right_of_center_pans_down() {
        let t0 = Instant::now();
        let mut tracker = TrackingLoop::new_at(settings(1, Some("laura")), t0).unwrap();
        let outcome = tracker.process_frame_at(
            FRAME_CENTER,
            || Ok(vec![face("laura", 0.95, 420, 240)]),
            t0 + Duration::from_millis(100),
        );
        assert!(outcome.is_tracking());
        assert_eq!(outcome.target_index(), Some(0));
        // Saturated at max_speed 5, then smoothed by 0.3.
        assert!((outcome.angles.pan - 88.5).abs() < 1e-9);
        assert_eq!(outcome.angles.tilt, 90.0);
        assert_eq!(tracker.last_target_center(), Some(PixelPoint::new(420, 240)));

        let cmd = outcome.command();
        assert!(cmd.tracking);
        assert_eq!(cmd.target_label.as_deref(), Some("laura"));
        assert_eq!(cmd.confidence, 0.95);
        assert_eq!(cmd.error, PixelOffset { x: 100, y: 0 });
    }

    #[test]
    fn losing_the_target_holds_position() {
        let t0 = Instant::now();
        let mut tracker = TrackingLoop::new_at(settings(1, Some("tuta")), t0).unwrap();
        let tracked = tracker.process_frame_at(
            FRAME_CENTER,
            || Ok(vec![face("tuta", 0.97, 100, 400)]),
            t0 + Duration::from_millis(50),
        );
        assert!(tracked.is_tracking());

        let lost = tracker.process_frame_at(
            FRAME_CENTER,
            || Ok(vec![face("laura", 0.99, 320, 240)]),
            t0 + Duration::from_millis(100),
        );
        assert_eq!(lost.state, TrackingState::Searching);
        assert_eq!(lost.angles, tracked.angles);
        assert_eq!(tracker.state(), TrackingState::Searching);
    }

    #[test]
    fn detector_failure_counts_as_no_target() {
        let mut tracker = TrackingLoop::new(settings(1, Some("laura"))).unwrap();
        let outcome = tracker.process_frame(FRAME_CENTER, || Err(anyhow!("model crashed")));
        assert!(outcome.sampled);
        assert_eq!(outcome.state, TrackingState::Searching);
        assert!(outcome.detections.is_empty());
        assert_eq!(tracker.angles(), AngleState::new(90.0, 90.0));
    }

    #[test]
    fn interval_skips_detection_between_samples() {
        let mut tracker = TrackingLoop::new(settings(3, Some("laura"))).unwrap();
        let calls = Cell::new(0);
        let mut sampled = Vec::new();
        for _ in 0..7 {
            assert_eq!(tracker.next_frame_is_sampled(), tracker.frame_count() % 3 == 0);
            let outcome = tracker.process_frame(FRAME_CENTER, || {
                calls.set(calls.get() + 1);
                Ok(Vec::new())
            });
            if outcome.sampled {
                sampled.push(outcome.frame_index);
            }
        }
        assert_eq!(sampled, vec![0, 3, 6]);
        assert_eq!(calls.get(), 3);
        assert_eq!(tracker.frame_count(), 7);
    }

    #[test]
    fn skipped_frames_keep_previous_state() {
        let t0 = Instant::now();
        let mut tracker = TrackingLoop::new_at(settings(2, Some("laura")), t0).unwrap();
        let first = tracker.process_frame_at(
            FRAME_CENTER,
            || Ok(vec![face("laura", 0.95, 420, 240)]),
            t0 + Duration::from_millis(100),
        );
        let skipped = tracker.process_frame_at(
            FRAME_CENTER,
            || panic!("detector must not run on skipped frames"),
            t0 + Duration::from_millis(133),
        );
        assert!(!skipped.sampled);
        assert_eq!(skipped.state, TrackingState::Tracking);
        assert_eq!(skipped.angles, first.angles);
    }

    #[test]
    fn set_target_ignores_case_only_changes() {
        let mut tracker = TrackingLoop::new(settings(1, Some("Laura"))).unwrap();
        assert!(!tracker.set_target(Some("laura".into())));
        assert!(tracker.set_target(Some("tuta".into())));
        assert_eq!(tracker.target_label(), Some("tuta"));
        assert!(tracker.set_target(Some("  ".into())));
        assert_eq!(tracker.target_label(), None);
        assert!(!tracker.set_target(None));
    }

    #[test]
    fn target_change_drops_last_center() {
        let mut tracker = TrackingLoop::new(settings(1, Some("laura"))).unwrap();
        tracker.process_frame(FRAME_CENTER, || Ok(vec![face("laura", 0.95, 400, 200)]));
        assert!(tracker.last_target_center().is_some());
        tracker.apply_command(&OperatorCommand::SetTarget(Some("tuta".into())));
        assert!(tracker.last_target_center().is_none());
        assert_eq!(tracker.target_label(), Some("tuta"));
    }

    #[test]
    fn center_command_returns_to_center() {
        let t0 = Instant::now();
        let mut tracker = TrackingLoop::new_at(settings(1, Some("laura")), t0).unwrap();
        tracker.process_frame_at(
            FRAME_CENTER,
            || Ok(vec![face("laura", 0.95, 600, 460)]),
            t0 + Duration::from_millis(100),
        );
        assert_ne!(tracker.angles(), AngleState::new(90.0, 90.0));

        let cmd = tracker.apply_command(&OperatorCommand::Center).unwrap();
        assert_eq!((cmd.pan, cmd.tilt), (90.0, 90.0));
        assert!(!cmd.tracking);
        assert_eq!(tracker.angles(), AngleState::new(90.0, 90.0));
        assert!(tracker.last_target_center().is_none());
    }

    // Integral-only gains so a stale integral shows up directly in the angles.
    fn integral_only(label: &str, center: AngleState) -> TrackerSettings {
        let mut s = settings(1, Some(label));
        s.pan_gains = PidGains::new(0.0, 1.0, 0.0);
        s.tilt_gains = PidGains::new(0.0, 1.0, 0.0);
        s.center = center;
        s
    }

    #[test]
    fn commands_clear_pid_history_before_reacquisition() {
        let t0 = Instant::now();
        let ms = Duration::from_millis;
        for command in [
            OperatorCommand::Reset,
            OperatorCommand::Center,
            OperatorCommand::SetTarget(Some("tuta".into())),
        ] {
            let label = match &command {
                OperatorCommand::SetTarget(Some(label)) => label.clone(),
                _ => "laura".to_string(),
            };
            let mut tracker =
                TrackingLoop::new_at(integral_only("laura", AngleState::new(90.0, 90.0)), t0)
                    .unwrap();
            for k in 1..=4 {
                tracker.process_frame_at(
                    FRAME_CENTER,
                    || Ok(vec![face("laura", 0.95, 345, 265)]),
                    t0 + ms(10 * k),
                );
            }

            let reset_at = t0 + ms(50);
            let step_at = reset_at + ms(10);
            tracker.apply_command_at(&command, reset_at);
            let from = tracker.angles();
            let after = tracker
                .process_frame_at(
                    FRAME_CENTER,
                    || Ok(vec![face(&label, 0.95, 345, 265)]),
                    step_at,
                )
                .angles;

            let mut fresh = TrackingLoop::new_at(integral_only(&label, from), reset_at).unwrap();
            let expected = fresh
                .process_frame_at(
                    FRAME_CENTER,
                    || Ok(vec![face(&label, 0.95, 345, 265)]),
                    step_at,
                )
                .angles;
            assert_eq!(after, expected, "{command:?}");
            // One 10 ms step of a 25 px error, smoothed by 0.3.
            assert!((from.pan - after.pan - 0.25 * 0.3).abs() < 1e-9, "{command:?}");
        }
    }

    #[test]
    fn reset_and_quit_emit_nothing() {
        let mut tracker = TrackingLoop::new(settings(1, None)).unwrap();
        assert!(tracker.apply_command(&OperatorCommand::Reset).is_none());
        assert!(tracker.apply_command(&OperatorCommand::Quit).is_none());
        assert_eq!(tracker.angles(), AngleState::new(90.0, 90.0));
    }

    #[test]
    fn largest_policy_tracks_without_label() {
        let mut s = settings(1, None);
        s.policy = SelectionPolicy::Largest;
        s.confidence_threshold = 0.5;
        let mut tracker = TrackingLoop::new(s).unwrap();
        let outcome = tracker.process_frame(FRAME_CENTER, || {
            Ok(vec![
                Detection::new(BoundingBox::new(0, 0, 10, 10), 0.9, None),
                Detection::new(BoundingBox::new(300, 200, 80, 80), 0.6, None),
            ])
        });
        assert!(outcome.is_tracking());
        assert_eq!(outcome.target_index(), Some(1));
        assert_eq!(outcome.command().target_label, None);
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(TrackingLoop::new(settings(0, None)).is_err());
        let mut s = settings(1, None);
        s.center = AngleState::new(90.0, 10.0);
        assert!(TrackingLoop::new(s).is_err());
        let mut s = settings(1, None);
        s.center = AngleState::new(200.0, 90.0);
        assert!(TrackingLoop::new(s).is_err());
    }
}
