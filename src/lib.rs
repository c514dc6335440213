//! Pan/tilt face tracking.
//!
//! A camera sits on a two-axis mount. Every sampled frame, the detector's
//! faces are filtered down to one target, the target's pixel offset from the
//! frame center is fed through one PID controller per axis, and the result is
//! rate-limited, clamped and smoothed into the next pair of mount angles.
//!
//! # Architecture
//!
//! The control loop is synchronous and single-threaded. Everything around it
//! (operator input, MQTT sessions) runs on helper threads and talks to the
//! loop over channels, so the tracking state has exactly one writer.
//!
//! # Module Structure
//!
//! - `pid`: per-axis PID controller
//! - `detect`: frames, detections and the sources that produce them
//! - `select`: target selection policies
//! - `angles`: error to angle conversion (deadzone, rate limit, smoothing)
//! - `tracker`: the per-frame loop and its `AngleCommand` output
//! - `command`: operator commands and their parsing
//! - `actuator`: serial, MQTT and file sinks plus send throttling
//! - `observe`: detection log and statistics over it
//! - `transport`: MQTT endpoint, TLS, session and connection-thread helpers
//! - `config`: layered configuration

pub mod actuator;
pub mod angles;
pub mod command;
pub mod config;
pub mod detect;
pub mod observe;
pub mod pid;
pub mod select;
pub mod tracker;
pub mod transport;

pub use actuator::{ActuatorKind, ActuatorSink, Dispatcher, SendThrottle};
pub use angles::{AngleCalculator, AngleState, AngleUpdate, AxisRange, Deadzone};
pub use command::OperatorCommand;
pub use config::{SourceKind, TrackerConfig};
pub use detect::{BoundingBox, Detection, DetectionSource, Frame, PixelOffset, PixelPoint};
pub use pid::{PidController, PidGains};
pub use select::{select_largest, select_target, SelectionPolicy};
pub use tracker::{AngleCommand, FrameOutcome, TrackerSettings, TrackingLoop, TrackingState};
