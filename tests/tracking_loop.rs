use std::io::Cursor;
use std::time::{Duration, Instant};

use facetrack::actuator::{ActuatorSink, SerialLink};
use facetrack::detect::{DetectionSource, ReplaySource};
use facetrack::{
    AngleCalculator, AngleState, AxisRange, Deadzone, OperatorCommand, PidGains, PixelPoint,
    SelectionPolicy, TrackerSettings, TrackingLoop, TrackingState,
};

fn settings(interval: u64, target: Option<&str>) -> TrackerSettings {
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
        target_label: target.map(str::to_string),
    }
}

fn replay(lines: &[String]) -> ReplaySource {
    ReplaySource::from_reader(Box::new(Cursor::new(lines.join("\n").into_bytes())))
}

fn frame_with_face(label: &str, confidence: f32, cx: i32, cy: i32) -> String {
    format!(
        r#"{{"width":640,"height":480,"detections":[{{"bbox":[{},{},40,40],"confidence":{},"label":"{}"}}]}}"#,
        cx - 20,
        cy - 20,
        confidence,
        label
    )
}

#[test]
fn stationary_face_converges_and_stays_in_range() {
    let lines: Vec<String> = (0..200)
        .map(|_| frame_with_face("laura", 0.95, 520, 100))
        .collect();
    let mut source = replay(&lines);
    let t0 = Instant::now();
    let mut tracker = TrackingLoop::new_at(settings(1, Some("laura")), t0).unwrap();

    let mut previous = tracker.angles();
    let mut frames = 0u64;
    while let Some(frame) = source.next_frame().unwrap() {
        frames += 1;
        let now = t0 + Duration::from_millis(33 * frames);
        let outcome = tracker.process_frame_at(frame.center(), || source.detect(&frame), now);
        assert_eq!(outcome.state, TrackingState::Tracking);

        let angles = outcome.angles;
        assert!((0.0..=180.0).contains(&angles.pan));
        assert!((30.0..=150.0).contains(&angles.tilt));
        // Face is right of and above center: pan never increases, tilt never
        // increases.
        assert!(angles.pan <= previous.pan + 1e-9);
        assert!(angles.tilt <= previous.tilt + 1e-9);
        // Rate limit bounds each step by max_speed times smoothing.
        assert!((angles.pan - previous.pan).abs() <= 5.0 * 0.3 + 1e-9);
        previous = angles;
    }
    assert_eq!(frames, 200);
    // The mount keeps pushing toward the face and pins at the range edges.
    assert!(previous.pan < 30.0);
    assert!(previous.tilt < 60.0);
}

#[test]
fn observation_only_until_target_is_set() {
    let lines: Vec<String> = (0..6)
        .map(|_| frame_with_face("tuta", 0.97, 400, 240))
        .collect();
    let mut source = replay(&lines);
    let mut tracker = TrackingLoop::new(settings(1, None)).unwrap();
    let mut link = SerialLink::new(Vec::new(), "buffer");

    let mut states = Vec::new();
    let mut index = 0;
    while let Some(frame) = source.next_frame().unwrap() {
        if index == 3 {
            tracker.apply_command(&"t tuta".parse::<OperatorCommand>().unwrap());
        }
        let outcome = tracker.process_frame(frame.center(), || source.detect(&frame));
        link.send(&outcome.command()).unwrap();
        states.push(outcome.state);
        index += 1;
    }

    assert_eq!(
        states,
        vec![
            TrackingState::Searching,
            TrackingState::Searching,
            TrackingState::Searching,
            TrackingState::Tracking,
            TrackingState::Tracking,
            TrackingState::Tracking,
        ]
    );
    let written = String::from_utf8(link.into_inner()).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "90.0,90.0");
    assert_eq!(lines[2], "90.0,90.0");
    assert_eq!(lines[3], "88.5,90.0");
}

#[test]
fn malformed_and_empty_frames_hold_position() {
    let lines = vec![
        frame_with_face("laura", 0.95, 600, 240),
        "{ not json".to_string(),
        r#"{"width":640,"height":480}"#.to_string(),
        frame_with_face("laura", 0.50, 600, 240),
    ];
    let mut source = replay(&lines);
    let mut tracker = TrackingLoop::new(settings(1, Some("laura"))).unwrap();

    let mut outcomes = Vec::new();
    while let Some(frame) = source.next_frame().unwrap() {
        outcomes.push(tracker.process_frame(frame.center(), || source.detect(&frame)));
    }
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes[0].is_tracking());
    for outcome in &outcomes[1..] {
        assert_eq!(outcome.state, TrackingState::Searching);
        assert_eq!(outcome.angles, outcomes[0].angles);
    }
}

#[test]
fn center_after_tracking_restores_configured_center() {
    let lines: Vec<String> = (0..10)
        .map(|_| frame_with_face("laura", 0.99, 100, 400))
        .collect();
    let mut source = replay(&lines);
    let mut tracker = TrackingLoop::new(settings(2, Some("laura"))).unwrap();

    let mut sampled = 0;
    while let Some(frame) = source.next_frame().unwrap() {
        if tracker
            .process_frame(frame.center(), || source.detect(&frame))
            .sampled
        {
            sampled += 1;
        }
    }
    assert_eq!(sampled, 5);
    assert_ne!(tracker.angles(), AngleState::new(90.0, 90.0));
    assert_eq!(tracker.last_target_center(), Some(PixelPoint::new(100, 400)));

    let center = tracker.apply_command(&OperatorCommand::Center).unwrap();
    assert_eq!((center.pan, center.tilt), (90.0, 90.0));
    assert!(!center.tracking);
    assert_eq!(tracker.last_target_center(), None);
}
