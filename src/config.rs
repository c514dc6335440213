use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::actuator::{ActuatorKind, DEFAULT_SEND_INTERVAL};
use crate::angles::{AngleCalculator, AngleState, AxisRange, Deadzone};
use crate::detect::StubConfig;
use crate::observe::DEFAULT_LOG_INTERVAL;
use crate::pid::PidGains;
use crate::select::SelectionPolicy;
use crate::tracker::TrackerSettings;
use crate::transport::{MqttEndpoint, MqttSession, TlsMaterials};

const DEFAULT_FRAME_WIDTH: u32 = 640;
const DEFAULT_FRAME_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_PAN_CENTER: f64 = 90.0;
const DEFAULT_TILT_CENTER: f64 = 90.0;
const DEFAULT_PAN_RANGE: (f64, f64) = (0.0, 180.0);
const DEFAULT_TILT_RANGE: (f64, f64) = (30.0, 150.0);
const DEFAULT_MAX_SPEED: f64 = 5.0;
const DEFAULT_DETECTION_INTERVAL: u64 = 1;
const DEFAULT_SMOOTHING: f64 = 0.3;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.90;
const DEFAULT_DEADZONE: i32 = 20;
const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_TOPIC: &str = "facetracking/servo";
const DEFAULT_DETECTIONS_TOPIC: &str = "facetracking/detections";
const DEFAULT_CLIENT_ID: &str = "facetrackd";
const DEFAULT_POSITION_FILE: &str = "servo_position.json";
const DEFAULT_DETECTION_LOG: &str = "detection_log.jsonl";

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    camera: Option<CameraConfigFile>,
    servo: Option<ServoConfigFile>,
    tracking: Option<TrackingConfigFile>,
    pid: Option<PidConfigFile>,
    deadzone: Option<DeadzoneConfigFile>,
    source: Option<SourceConfigFile>,
    actuator: Option<ActuatorConfigFile>,
    serial: Option<SerialConfigFile>,
    mqtt: Option<MqttConfigFile>,
    position_file: Option<PathBuf>,
    detection_log: Option<DetectionLogConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ServoConfigFile {
    pan_center: Option<f64>,
    tilt_center: Option<f64>,
    pan_range: Option<(f64, f64)>,
    tilt_range: Option<(f64, f64)>,
    max_speed: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    detection_interval: Option<u64>,
    smoothing_factor: Option<f64>,
    confidence_threshold: Option<f32>,
    target: Option<String>,
    policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PidConfigFile {
    pan: Option<GainsConfigFile>,
    tilt: Option<GainsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct GainsConfigFile {
    kp: Option<f64>,
    ki: Option<f64>,
    kd: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DeadzoneConfigFile {
    x: Option<i32>,
    y: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    kind: Option<String>,
    replay_path: Option<PathBuf>,
    mqtt_topic: Option<String>,
    labels: Option<Vec<String>>,
    seed: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ActuatorConfigFile {
    kind: Option<String>,
    send_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SerialConfigFile {
    port: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    allow_remote: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionLogConfigFile {
    enabled: Option<bool>,
    path: Option<PathBuf>,
    interval_ms: Option<u64>,
}

/// Where frames come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceKind {
    #[default]
    Stub,
    Replay,
    Mqtt,
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stub" => Ok(Self::Stub),
            "replay" => Ok(Self::Replay),
            "mqtt" => Ok(Self::Mqtt),
            other => Err(anyhow!(
                "unknown source '{}': expected stub, replay[:path] or mqtt",
                other
            )),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stub => "stub",
            Self::Replay => "replay",
            Self::Mqtt => "mqtt",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub camera: CameraSettings,
    pub servo: ServoSettings,
    pub tracking: TrackingSettings,
    pub pid_pan: PidGains,
    pub pid_tilt: PidGains,
    pub source: SourceSettings,
    pub actuator: ActuatorSettings,
    pub serial_port: String,
    pub mqtt: MqttSettings,
    pub position_file: PathBuf,
    pub detection_log: DetectionLogSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct ServoSettings {
    pub pan_center: f64,
    pub tilt_center: f64,
    pub pan_range: (f64, f64),
    pub tilt_range: (f64, f64),
    pub max_speed: f64,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub detection_interval: u64,
    pub smoothing_factor: f64,
    pub confidence_threshold: f32,
    pub target_label: Option<String>,
    pub policy: SelectionPolicy,
    pub deadzone: Deadzone,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub kind: SourceKind,
    /// JSON lines file for `replay`; `-` reads stdin.
    pub replay_path: Option<PathBuf>,
    pub mqtt_topic: String,
    pub labels: Vec<String>,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct ActuatorSettings {
    pub kind: ActuatorKind,
    pub send_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub allow_remote: bool,
}

#[derive(Debug, Clone)]
pub struct DetectionLogSettings {
    pub enabled: bool,
    pub path: PathBuf,
    pub interval: Duration,
}

impl TrackerConfig {
    /// Defaults, then the file named by `FACETRACK_CONFIG`, then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FACETRACK_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrackerConfigFile) -> Result<Self> {
        let camera = file.camera.unwrap_or_default();
        let servo = file.servo.unwrap_or_default();
        let tracking = file.tracking.unwrap_or_default();
        let pid = file.pid.unwrap_or_default();
        let deadzone = file.deadzone.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let actuator = file.actuator.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let detection_log = file.detection_log.unwrap_or_default();

        let policy = match tracking.policy.as_deref() {
            Some(policy) => policy.parse()?,
            None => SelectionPolicy::default(),
        };
        let source_kind = match source.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => SourceKind::default(),
        };
        let actuator_kind = match actuator.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => ActuatorKind::default(),
        };
        let stub = StubConfig::default();

        Ok(Self {
            camera: CameraSettings {
                width: camera.width.unwrap_or(DEFAULT_FRAME_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_FPS),
            },
            servo: ServoSettings {
                pan_center: servo.pan_center.unwrap_or(DEFAULT_PAN_CENTER),
                tilt_center: servo.tilt_center.unwrap_or(DEFAULT_TILT_CENTER),
                pan_range: servo.pan_range.unwrap_or(DEFAULT_PAN_RANGE),
                tilt_range: servo.tilt_range.unwrap_or(DEFAULT_TILT_RANGE),
                max_speed: servo.max_speed.unwrap_or(DEFAULT_MAX_SPEED),
            },
            tracking: TrackingSettings {
                detection_interval: tracking
                    .detection_interval
                    .unwrap_or(DEFAULT_DETECTION_INTERVAL),
                smoothing_factor: tracking.smoothing_factor.unwrap_or(DEFAULT_SMOOTHING),
                confidence_threshold: tracking
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                target_label: tracking.target,
                policy,
                deadzone: Deadzone::new(
                    deadzone.x.unwrap_or(DEFAULT_DEADZONE),
                    deadzone.y.unwrap_or(DEFAULT_DEADZONE),
                ),
            },
            pid_pan: gains(pid.pan),
            pid_tilt: gains(pid.tilt),
            source: SourceSettings {
                kind: source_kind,
                replay_path: source.replay_path,
                mqtt_topic: source
                    .mqtt_topic
                    .unwrap_or_else(|| DEFAULT_DETECTIONS_TOPIC.to_string()),
                labels: source.labels.unwrap_or(stub.labels),
                seed: source.seed.unwrap_or(stub.seed),
            },
            actuator: ActuatorSettings {
                kind: actuator_kind,
                send_interval: actuator
                    .send_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_SEND_INTERVAL),
            },
            serial_port: file
                .serial
                .and_then(|serial| serial.port)
                .unwrap_or_else(|| DEFAULT_SERIAL_PORT.to_string()),
            mqtt: MqttSettings {
                broker_addr: mqtt
                    .broker_addr
                    .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                topic: mqtt.topic.unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
                tls_ca_path: mqtt.tls_ca_path,
                tls_client_cert_path: mqtt.tls_client_cert_path,
                tls_client_key_path: mqtt.tls_client_key_path,
                allow_remote: mqtt.allow_remote.unwrap_or(false),
            },
            position_file: file
                .position_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_POSITION_FILE)),
            detection_log: DetectionLogSettings {
                enabled: detection_log.enabled.unwrap_or(false),
                path: detection_log
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DETECTION_LOG)),
                interval: detection_log
                    .interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_LOG_INTERVAL),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(target) = std::env::var("FACETRACK_TARGET") {
            if !target.trim().is_empty() {
                self.tracking.target_label = Some(target);
            }
        }
        if let Ok(source) = std::env::var("FACETRACK_SOURCE") {
            if !source.trim().is_empty() {
                self.apply_source_spec(&source)?;
            }
        }
        if let Ok(actuator) = std::env::var("FACETRACK_ACTUATOR") {
            if !actuator.trim().is_empty() {
                self.actuator.kind = actuator.parse()?;
            }
        }
        if let Ok(port) = std::env::var("FACETRACK_SERIAL_PORT") {
            if !port.trim().is_empty() {
                self.serial_port = port;
            }
        }
        if let Ok(addr) = std::env::var("FACETRACK_MQTT_BROKER") {
            if !addr.trim().is_empty() {
                self.mqtt.broker_addr = addr;
            }
        }
        if let Ok(topic) = std::env::var("FACETRACK_MQTT_TOPIC") {
            if !topic.trim().is_empty() {
                self.mqtt.topic = topic;
            }
        }
        if let Ok(interval) = std::env::var("FACETRACK_DETECTION_INTERVAL") {
            if !interval.trim().is_empty() {
                self.tracking.detection_interval = interval.trim().parse().map_err(|_| {
                    anyhow!("FACETRACK_DETECTION_INTERVAL must be a positive integer")
                })?;
            }
        }
        Ok(())
    }

    /// Accepts `stub`, `mqtt`, `replay` or `replay:<path>`.
    pub fn apply_source_spec(&mut self, spec: &str) -> Result<()> {
        let spec = spec.trim();
        match spec.split_once(':') {
            Some((kind, path)) if kind.eq_ignore_ascii_case("replay") => {
                if path.is_empty() {
                    return Err(anyhow!("replay source needs a path (use '-' for stdin)"));
                }
                self.source.kind = SourceKind::Replay;
                self.source.replay_path = Some(PathBuf::from(path));
            }
            _ => self.source.kind = spec.parse()?,
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        let pan_range = AxisRange::new(self.servo.pan_range.0, self.servo.pan_range.1)
            .map_err(|e| anyhow!("servo.pan_range: {}", e))?;
        let tilt_range = AxisRange::new(self.servo.tilt_range.0, self.servo.tilt_range.1)
            .map_err(|e| anyhow!("servo.tilt_range: {}", e))?;
        if !pan_range.contains(self.servo.pan_center) {
            return Err(anyhow!(
                "servo.pan_center {} is outside pan_range",
                self.servo.pan_center
            ));
        }
        if !tilt_range.contains(self.servo.tilt_center) {
            return Err(anyhow!(
                "servo.tilt_center {} is outside tilt_range",
                self.servo.tilt_center
            ));
        }
        if !(self.servo.max_speed.is_finite() && self.servo.max_speed > 0.0) {
            return Err(anyhow!("servo.max_speed must be greater than zero"));
        }
        let smoothing = self.tracking.smoothing_factor;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            return Err(anyhow!("tracking.smoothing_factor must be within (0, 1]"));
        }
        if self.tracking.detection_interval == 0 {
            return Err(anyhow!("tracking.detection_interval must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.tracking.confidence_threshold) {
            return Err(anyhow!("tracking.confidence_threshold must be within [0, 1]"));
        }
        if self.tracking.deadzone.x < 0 || self.tracking.deadzone.y < 0 {
            return Err(anyhow!("deadzone must be non-negative"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be non-zero"));
        }
        if self.camera.fps == 0 {
            return Err(anyhow!("camera.fps must be non-zero"));
        }
        if self.actuator.send_interval.is_zero() {
            return Err(anyhow!("actuator.send_interval_ms must be non-zero"));
        }
        if self.source.kind == SourceKind::Replay && self.source.replay_path.is_none() {
            return Err(anyhow!("replay source requires source.replay_path"));
        }
        self.tracking.target_label = self
            .tracking
            .target_label
            .take()
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty() && !label.eq_ignore_ascii_case("none"));
        Ok(())
    }

    pub fn frame_center(&self) -> crate::detect::PixelPoint {
        crate::detect::PixelPoint::new(
            (self.camera.width / 2) as i32,
            (self.camera.height / 2) as i32,
        )
    }

    pub fn center(&self) -> AngleState {
        AngleState::new(self.servo.pan_center, self.servo.tilt_center)
    }

    pub fn tracker_settings(&self) -> Result<TrackerSettings> {
        let calculator = AngleCalculator::new(
            AxisRange::new(self.servo.pan_range.0, self.servo.pan_range.1)?,
            AxisRange::new(self.servo.tilt_range.0, self.servo.tilt_range.1)?,
            self.servo.max_speed,
            self.tracking.deadzone,
            self.tracking.smoothing_factor,
        )?;
        Ok(TrackerSettings {
            calculator,
            pan_gains: self.pid_pan,
            tilt_gains: self.pid_tilt,
            center: self.center(),
            detection_interval: self.tracking.detection_interval,
            confidence_threshold: self.tracking.confidence_threshold,
            policy: self.tracking.policy,
            target_label: self.tracking.target_label.clone(),
        })
    }

    pub fn stub_config(&self) -> StubConfig {
        StubConfig {
            width: self.camera.width,
            height: self.camera.height,
            fps: self.camera.fps,
            labels: self.source.labels.clone(),
            seed: self.source.seed,
            ..StubConfig::default()
        }
    }

    /// Broker session for this process. Non-loopback brokers need
    /// `mqtt.allow_remote`.
    pub fn mqtt_session(&self, client_id: &str) -> Result<MqttSession> {
        let endpoint = MqttEndpoint::parse(&self.mqtt.broker_addr, self.mqtt.use_tls)?;
        if self.mqtt.allow_remote {
            log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
        } else {
            endpoint.require_loopback()?;
        }
        let tls = TlsMaterials::load(
            self.mqtt.tls_ca_path.as_ref(),
            self.mqtt.tls_client_cert_path.as_ref(),
            self.mqtt.tls_client_key_path.as_ref(),
        )?;
        Ok(MqttSession {
            endpoint,
            tls,
            client_id: client_id.to_string(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            availability_topic: None,
        })
    }
}

fn gains(file: Option<GainsConfigFile>) -> PidGains {
    let defaults = PidGains::default();
    let file = file.unwrap_or_default();
    PidGains::new(
        file.kp.unwrap_or(defaults.kp),
        file.ki.unwrap_or(defaults.ki),
        file.kd.unwrap_or(defaults.kd),
    )
}

fn read_config_file(path: &Path) -> Result<TrackerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
