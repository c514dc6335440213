//! Actuator sinks: where angle commands go once the loop has computed them.
//!
//! Sends are fire-and-forget. A failing sink is logged and the loop moves on
//! to the next frame; nothing is retried.

use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::tracker::AngleCommand;

mod file;
mod mqtt;
mod serial;

pub use file::{PositionFile, PositionRecord};
pub(crate) use file::now_millis;
pub use mqtt::{command_topic, MqttActuator, MqttAnglePayload};
pub use serial::{format_serial_line, SerialLink};

pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(50);

/// Receives angle commands.
pub trait ActuatorSink: Send {
    /// Stable name for logs and summaries.
    fn name(&self) -> &'static str;

    fn send(&mut self, command: &AngleCommand) -> Result<()>;

    /// Flush and release the underlying resource.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActuatorKind {
    #[default]
    None,
    Serial,
    Mqtt,
    File,
}

impl FromStr for ActuatorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "serial" => Ok(Self::Serial),
            "mqtt" => Ok(Self::Mqtt),
            "file" => Ok(Self::File),
            other => Err(anyhow!(
                "unknown actuator '{}': expected none, serial, mqtt or file",
                other
            )),
        }
    }
}

impl std::fmt::Display for ActuatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Serial => "serial",
            Self::Mqtt => "mqtt",
            Self::File => "file",
        };
        f.write_str(name)
    }
}

/// Sink for observation-only runs; commands are only logged.
#[derive(Debug, Default)]
pub struct NullSink;

impl ActuatorSink for NullSink {
    fn name(&self) -> &'static str {
        "none"
    }

    fn send(&mut self, command: &AngleCommand) -> Result<()> {
        log::debug!(
            "pan={:.1} tilt={:.1} tracking={}",
            command.pan,
            command.tilt,
            command.tracking
        );
        Ok(())
    }
}

/// Minimum spacing between two sends.
#[derive(Clone, Debug)]
pub struct SendThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl SendThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True (and records `now`) when at least `interval` has passed since the
    /// last accepted send. A clock that went backwards counts as ready.
    pub fn ready_at(&mut self, now: Instant) -> bool {
        let ready = match self.last {
            None => true,
            Some(last) => now
                .checked_duration_since(last)
                .map_or(true, |elapsed| elapsed >= self.interval),
        };
        if ready {
            self.last = Some(now);
        }
        ready
    }

    /// Count the next send as immediate.
    pub fn mark_at(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// One sink plus its throttle and counters.
pub struct Dispatcher {
    sink: Box<dyn ActuatorSink>,
    throttle: SendThrottle,
    sent: u64,
    throttled: u64,
    failed: u64,
}

impl Dispatcher {
    pub fn new(sink: Box<dyn ActuatorSink>, interval: Duration) -> Self {
        Self {
            sink,
            throttle: SendThrottle::new(interval),
            sent: 0,
            throttled: 0,
            failed: 0,
        }
    }

    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn throttled(&self) -> u64 {
        self.throttled
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Throttled send. Returns whether the sink accepted the command.
    pub fn emit(&mut self, command: &AngleCommand) -> bool {
        self.emit_at(command, Instant::now())
    }

    pub fn emit_at(&mut self, command: &AngleCommand, now: Instant) -> bool {
        if !self.throttle.ready_at(now) {
            self.throttled += 1;
            return false;
        }
        self.deliver(command)
    }

    /// Unthrottled send for centering and shutdown.
    pub fn emit_now(&mut self, command: &AngleCommand) -> bool {
        self.throttle.mark_at(Instant::now());
        self.deliver(command)
    }

    pub fn close(&mut self) -> Result<()> {
        log::info!(
            "Closing {} actuator (sent: {}, throttled: {}, failed: {})",
            self.sink.name(),
            self.sent,
            self.throttled,
            self.failed
        );
        self.sink.close()
    }

    fn deliver(&mut self, command: &AngleCommand) -> bool {
        match self.sink.send(command) {
            Ok(()) => {
                self.sent += 1;
                true
            }
            Err(e) => {
                self.failed += 1;
                log::warn!("{} send failed: {}", self.sink.name(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PixelOffset;
    use std::sync::{Arc, Mutex};

    fn command(pan: f64) -> AngleCommand {
        AngleCommand {
            pan,
            tilt: 90.0,
            tracking: true,
            target_label: None,
            confidence: 0.9,
            error: PixelOffset::ZERO,
        }
    }

    struct Recording {
        seen: Arc<Mutex<Vec<f64>>>,
        fail: bool,
    }

    impl ActuatorSink for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn send(&mut self, command: &AngleCommand) -> Result<()> {
            if self.fail {
                return Err(anyhow!("link down"));
            }
            self.seen.lock().unwrap().push(command.pan);
            Ok(())
        }
    }

    #[test]
    fn throttle_spaces_sends() {
        let t0 = Instant::now();
        let mut throttle = SendThrottle::new(Duration::from_millis(50));
        assert!(throttle.ready_at(t0));
        assert!(!throttle.ready_at(t0 + Duration::from_millis(49)));
        assert!(throttle.ready_at(t0 + Duration::from_millis(50)));
        assert!(!throttle.ready_at(t0 + Duration::from_millis(60)));
    }

    #[test]
    fn dispatcher_drops_throttled_commands() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Recording {
            seen: seen.clone(),
            fail: false,
        };
        let mut dispatcher = Dispatcher::new(Box::new(sink), Duration::from_millis(50));
        let t0 = Instant::now();
        assert!(dispatcher.emit_at(&command(1.0), t0));
        assert!(!dispatcher.emit_at(&command(2.0), t0 + Duration::from_millis(10)));
        assert!(dispatcher.emit_at(&command(3.0), t0 + Duration::from_millis(60)));
        assert!(dispatcher.emit_now(&command(4.0)));
        assert_eq!(*seen.lock().unwrap(), vec![1.0, 3.0, 4.0]);
        assert_eq!(dispatcher.sent(), 3);
        assert_eq!(dispatcher.throttled(), 1);
    }

    #[test]
    fn dispatcher_counts_failures_without_error() {
        let sink = Recording {
            seen: Arc::default(),
            fail: true,
        };
        let mut dispatcher = Dispatcher::new(Box::new(sink), Duration::ZERO);
        assert!(!dispatcher.emit(&command(1.0)));
        assert_eq!(dispatcher.failed(), 1);
        assert!(dispatcher.close().is_ok());
    }

    #[test]
    fn actuator_kind_parses() {
        assert_eq!("Serial".parse::<ActuatorKind>().unwrap(), ActuatorKind::Serial);
        assert_eq!("none".parse::<ActuatorKind>().unwrap(), ActuatorKind::None);
        assert!("gpio".parse::<ActuatorKind>().is_err());
    }
}
