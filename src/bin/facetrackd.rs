//! facetrackd - pan/tilt face tracking daemon
//!
//! Per frame:
//! 1. Drains pending operator commands (stdin, MQTT, Ctrl-C)
//! 2. Captures the next frame from the configured source
//! 3. Runs detection on sampled frames and updates the tracking loop
//! 4. Sends the resulting angles to the actuator, throttled
//!
//! On exit the mount is centered and the actuator closed.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use facetrack::actuator::{
    ActuatorKind, ActuatorSink, Dispatcher, MqttActuator, NullSink, PositionFile, SerialLink,
};
use facetrack::detect::{DetectionSource, MqttSource, ReplaySource, StubSource};
use facetrack::observe::DetectionLogger;
use facetrack::{OperatorCommand, SourceKind, TrackerConfig, TrackingLoop};

#[path = "../ui.rs"]
mod ui;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about = "Pan/tilt face tracking daemon")]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "FACETRACK_CONFIG")]
    config: Option<PathBuf>,

    /// Identity to follow ("none" for observation only).
    #[arg(long)]
    target: Option<String>,

    /// Frame source: stub, mqtt, replay:<path> (replay:- reads stdin).
    #[arg(long)]
    source: Option<String>,

    /// Actuator: none, serial, mqtt, file.
    #[arg(long)]
    actuator: Option<String>,

    /// Selection policy: labeled or largest.
    #[arg(long)]
    policy: Option<String>,

    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,

    /// Write the detection log regardless of configuration.
    #[arg(long)]
    log_detections: bool,

    /// Do not read operator commands from stdin.
    #[arg(long)]
    no_stdin: bool,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Default)]
struct RunStats {
    frames: u64,
    sampled: u64,
    tracked: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::detect(Some(&args.ui));

    let cfg = {
        let _stage = ui.stage("Load configuration");
        load_config(&args)?
    };
    log_config(&cfg);

    let (tx, rx) = mpsc::channel::<OperatorCommand>();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(OperatorCommand::Quit);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let mut source = {
        let _stage = ui.stage("Open frame source");
        let mut source = open_source(&cfg)?;
        source.warm_up()?;
        source
    };

    let mut dispatcher = {
        let _stage = ui.stage("Connect actuator");
        let sink = open_actuator(&cfg, tx.clone())?;
        Dispatcher::new(sink, cfg.actuator.send_interval)
    };

    let stdin_is_frames = cfg.source.kind == SourceKind::Replay
        && cfg.source.replay_path.as_deref() == Some(std::path::Path::new("-"));
    if !args.no_stdin && !stdin_is_frames {
        facetrack::command::spawn_stdin_reader(tx.clone());
        log::info!("Commands: c=center, r=reset, t <label>=target, q=quit");
    }
    drop(tx);

    let mut logger = if cfg.detection_log.enabled || args.log_detections {
        Some(DetectionLogger::create(
            &cfg.detection_log.path,
            cfg.detection_log.interval,
            cfg.tracking.target_label.as_deref(),
        )?)
    } else {
        None
    };

    let mut tracker = TrackingLoop::new(cfg.tracker_settings()?)?;
    dispatcher.emit_now(&tracker.center());

    let started = Instant::now();
    let stats = run(
        &mut tracker,
        source.as_mut(),
        &mut dispatcher,
        logger.as_mut(),
        &rx,
        args.frames,
        &ui,
    )?;

    {
        let _stage = ui.stage("Center and close actuator");
        dispatcher.emit_now(&tracker.center());
        if let Err(e) = dispatcher.close() {
            log::warn!("actuator close failed: {}", e);
        }
    }

    let elapsed = started.elapsed();
    println!("facetrackd summary");
    println!("  source:         {}", source.name());
    println!("  actuator:       {}", dispatcher.sink_name());
    println!("  frames:         {}", stats.frames);
    println!("  sampled:        {}", stats.sampled);
    println!("  tracked:        {}", stats.tracked);
    println!("  commands sent:  {}", dispatcher.sent());
    println!("  send failures:  {}", dispatcher.failed());
    println!("  final angles:   pan={:.1} tilt={:.1}", tracker.angles().pan, tracker.angles().tilt);
    println!("  elapsed:        {}", ui::format_duration(elapsed));
    Ok(())
}

fn load_config(args: &Args) -> Result<TrackerConfig> {
    let mut cfg = TrackerConfig::load_from(args.config.as_deref())?;
    if let Some(target) = &args.target {
        cfg.tracking.target_label = Some(target.clone());
    }
    if let Some(source) = &args.source {
        cfg.apply_source_spec(source)?;
    }
    if let Some(actuator) = &args.actuator {
        cfg.actuator.kind = actuator.parse()?;
    }
    if let Some(policy) = &args.policy {
        cfg.tracking.policy = policy.parse()?;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn log_config(cfg: &TrackerConfig) {
    log::info!(
        "frame {}x{} @ {} fps, detection every {} frame(s)",
        cfg.camera.width,
        cfg.camera.height,
        cfg.camera.fps,
        cfg.tracking.detection_interval
    );
    log::info!(
        "pan {:?} center {}, tilt {:?} center {}, max {}°/frame, smoothing {}",
        cfg.servo.pan_range,
        cfg.servo.pan_center,
        cfg.servo.tilt_range,
        cfg.servo.tilt_center,
        cfg.servo.max_speed,
        cfg.tracking.smoothing_factor
    );
    log::info!(
        "policy={} target={} threshold={:.2} source={} actuator={}",
        cfg.tracking.policy,
        cfg.tracking.target_label.as_deref().unwrap_or("none"),
        cfg.tracking.confidence_threshold,
        cfg.source.kind,
        cfg.actuator.kind
    );
}

fn open_source(cfg: &TrackerConfig) -> Result<Box<dyn DetectionSource>> {
    let source: Box<dyn DetectionSource> = match cfg.source.kind {
        SourceKind::Stub => Box::new(StubSource::new(cfg.stub_config())?),
        SourceKind::Replay => {
            let path = cfg
                .source
                .replay_path
                .as_ref()
                .ok_or_else(|| anyhow!("replay source requires a path"))?;
            Box::new(ReplaySource::open(&path.to_string_lossy())?)
        }
        SourceKind::Mqtt => {
            let session = cfg.mqtt_session(&format!("{}-detections", cfg.mqtt.client_id))?;
            Box::new(MqttSource::connect(
                &session,
                &cfg.source.mqtt_topic,
                (cfg.camera.width, cfg.camera.height),
            )?)
        }
    };
    log::info!("frame source: {}", source.name());
    Ok(source)
}

fn open_actuator(cfg: &TrackerConfig, commands: Sender<OperatorCommand>) -> Result<Box<dyn ActuatorSink>> {
    let sink: Box<dyn ActuatorSink> = match cfg.actuator.kind {
        ActuatorKind::None => Box::new(NullSink),
        ActuatorKind::Serial => Box::new(
            SerialLink::open(&cfg.serial_port)
                .with_context(|| "serial actuator unavailable")?,
        ),
        ActuatorKind::Mqtt => {
            let session = cfg.mqtt_session(&cfg.mqtt.client_id)?;
            Box::new(MqttActuator::connect(&session, &cfg.mqtt.topic, Some(commands))?)
        }
        ActuatorKind::File => {
            let file = PositionFile::new(&cfg.position_file);
            file.initialize(cfg.center())?;
            Box::new(file)
        }
    };
    Ok(sink)
}

fn run(
    tracker: &mut TrackingLoop,
    source: &mut dyn DetectionSource,
    dispatcher: &mut Dispatcher,
    mut logger: Option<&mut DetectionLogger>,
    commands: &Receiver<OperatorCommand>,
    max_frames: Option<u64>,
    ui: &ui::Ui,
) -> Result<RunStats> {
    let mut stats = RunStats::default();
    let live = ui.live();
    let mut last_health_log = Instant::now();
    let mut window_frames = 0u64;

    'frames: loop {
        if max_frames.is_some_and(|max| stats.frames >= max) {
            log::info!("frame limit reached");
            break;
        }

        loop {
            match commands.try_recv() {
                Ok(OperatorCommand::Quit) => {
                    log::info!("quit requested");
                    break 'frames;
                }
                Ok(command) => apply_command(tracker, dispatcher, logger.as_deref_mut(), &command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("frame source ended");
                break;
            }
            Err(e) => {
                log::error!("frame capture failed: {}", e);
                break;
            }
        };

        let outcome = tracker.process_frame(frame.center(), || source.detect(&frame));
        stats.frames += 1;
        window_frames += 1;

        if outcome.sampled {
            stats.sampled += 1;
            if outcome.is_tracking() {
                stats.tracked += 1;
            }
            dispatcher.emit(&outcome.command());
            if let Some(logger) = logger.as_deref_mut() {
                if let Err(e) = logger.log_frame(&outcome) {
                    log::warn!("detection log write failed: {}", e);
                }
            }
        }

        live.update(|| {
            format!(
                "{} pan={:.1} tilt={:.1} target={}",
                outcome.state,
                outcome.angles.pan,
                outcome.angles.tilt,
                tracker.target_label().unwrap_or("none")
            )
        });

        let since = last_health_log.elapsed();
        if since >= HEALTH_LOG_INTERVAL {
            log::info!(
                "health frames={} fps={:.1} state={} sent={} failed={}",
                stats.frames,
                window_frames as f64 / since.as_secs_f64(),
                tracker.state(),
                dispatcher.sent(),
                dispatcher.failed()
            );
            last_health_log = Instant::now();
            window_frames = 0;
        }
    }

    live.finish();
    Ok(stats)
}

fn apply_command(
    tracker: &mut TrackingLoop,
    dispatcher: &mut Dispatcher,
    logger: Option<&mut DetectionLogger>,
    command: &OperatorCommand,
) {
    let previous = tracker.target_label().map(str::to_string);
    if let Some(center) = tracker.apply_command(command) {
        log::info!("centering mount");
        dispatcher.emit_now(&center);
    }
    match command {
        OperatorCommand::Reset => log::info!("PID state reset"),
        OperatorCommand::SetTarget(_) if previous.as_deref() != tracker.target_label() => {
            if let Some(logger) = logger {
                if let Err(e) = logger.log_target_change(previous.as_deref(), tracker.target_label()) {
                    log::warn!("detection log write failed: {}", e);
                }
            }
        }
        _ => {}
    }
}
