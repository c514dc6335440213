//! position_bridge - republish the position file over MQTT.
//!
//! For setups where facetrackd runs with the file actuator and another
//! process owns the broker connection:
//! 1. Polls the JSON position file (default every 50 ms)
//! 2. Publishes `{pan, tilt, tracking, confidence}` whenever its timestamp changes
//! 3. Announces availability with a retained status and a last will

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use facetrack::actuator::{PositionFile, PositionRecord};
use facetrack::transport::MqttLink;
use facetrack::TrackerConfig;

#[path = "../ui.rs"]
mod ui;

const BRIDGE_NAME: &str = "position_bridge";

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish servo positions from the position file to MQTT")]
struct Args {
    /// Configuration file (.toml or .json).
    #[arg(long, env = "FACETRACK_CONFIG")]
    config: Option<PathBuf>,

    /// Position file to watch (overrides configuration).
    #[arg(long)]
    position_file: Option<PathBuf>,

    /// Topic to publish on (overrides configuration).
    #[arg(long)]
    topic: Option<String>,

    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 50)]
    poll_ms: u64,

    /// MQTT client identifier.
    #[arg(long, default_value = BRIDGE_NAME)]
    client_id: String,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

#[derive(Debug, PartialEq, Serialize)]
struct BridgePayload {
    pan: f64,
    tilt: f64,
    tracking: bool,
    confidence: f32,
}

impl From<&PositionRecord> for BridgePayload {
    fn from(record: &PositionRecord) -> Self {
        Self {
            pan: record.pan,
            tilt: record.tilt,
            tracking: record.tracking,
            confidence: record.confidence,
        }
    }
}

/// Tracks the last published timestamp so each record goes out once.
#[derive(Default)]
struct ChangeDetector {
    last_timestamp: Option<u64>,
}

impl ChangeDetector {
    fn is_new(&mut self, record: &PositionRecord) -> bool {
        if self.last_timestamp == Some(record.timestamp_ms) {
            return false;
        }
        self.last_timestamp = Some(record.timestamp_ms);
        true
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::detect(Some(&args.ui));

    let cfg = TrackerConfig::load_from(args.config.as_deref())?;
    let position_file = PositionFile::new(
        args.position_file
            .clone()
            .unwrap_or_else(|| cfg.position_file.clone()),
    );
    let topic = args.topic.clone().unwrap_or_else(|| cfg.mqtt.topic.clone());
    let availability = format!("{}/status", topic);
    if args.poll_ms == 0 {
        return Err(anyhow!("--poll-ms must be greater than zero"));
    }
    let poll = Duration::from_millis(args.poll_ms);

    let mut link = {
        let _stage = ui.stage("Connect to MQTT broker");
        let mut session = cfg.mqtt_session(&args.client_id)?;
        session.availability_topic = Some(availability);
        let link = MqttLink::publisher(&session)?;
        link.announce(true)?;
        link
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "Watching {} every {} ms, publishing to {}",
        position_file.path().display(),
        args.poll_ms,
        topic
    );

    let mut detector = ChangeDetector::default();
    let mut published = 0u64;
    let mut read_errors = 0u64;
    let mut last_error: Option<String> = None;

    loop {
        match position_file.read() {
            Ok(record) => {
                last_error = None;
                if detector.is_new(&record) {
                    let payload = serde_json::to_vec(&BridgePayload::from(&record))?;
                    match link.publish(&topic, payload, false) {
                        Ok(()) => {
                            published += 1;
                            log::debug!(
                                "published pan={:.1} tilt={:.1} tracking={}",
                                record.pan,
                                record.tilt,
                                record.tracking
                            );
                        }
                        Err(e) => log::warn!("publish failed: {}", e),
                    }
                }
            }
            Err(e) => {
                read_errors += 1;
                // Log once per distinct failure instead of every poll.
                let message = format!("{:#}", e);
                if last_error.as_deref() != Some(message.as_str()) {
                    log::warn!("{}", message);
                    last_error = Some(message);
                }
            }
        }

        match rx.recv_timeout(poll) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    link.close()?;
    println!("position_bridge summary");
    println!("  published:   {}", published);
    println!("  read errors: {}", read_errors);
    Ok(())
}
