use std::sync::mpsc::Sender;

use anyhow::Result;
use rumqttc::v5::mqttbytes::QoS;
use serde::Serialize;

use crate::actuator::ActuatorSink;
use crate::command::{parse_command_payload, OperatorCommand};
use crate::tracker::AngleCommand;
use crate::transport::{MqttLink, MqttSession};

const AVAILABILITY_SUFFIX: &str = "status";
const COMMAND_SUFFIX: &str = "command";

/// Angle message published on the servo topic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MqttAnglePayload {
    pub pan: f64,
    pub tilt: f64,
    pub tracking: bool,
    pub confidence: f64,
    pub target: Option<String>,
}

impl MqttAnglePayload {
    /// Angles rounded to 2 decimals, confidence to 4.
    pub fn from_command(command: &AngleCommand) -> Self {
        Self {
            pan: round_to(command.pan, 2),
            tilt: round_to(command.tilt, 2),
            tracking: command.tracking,
            confidence: round_to(command.confidence as f64, 4),
            target: command.target_label.clone(),
        }
    }
}

pub fn command_topic(topic: &str) -> String {
    format!("{}/{}", topic, COMMAND_SUFFIX)
}

fn availability_topic(topic: &str) -> String {
    format!("{}/{}", topic, AVAILABILITY_SUFFIX)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Publishes angle commands to a broker.
///
/// Availability is announced on `<topic>/status` (retained, with a last
/// will). When a command sender is given, messages on `<topic>/command` are
/// parsed and forwarded to it.
pub struct MqttActuator {
    link: MqttLink,
    topic: String,
}

impl MqttActuator {
    pub fn connect(
        session: &MqttSession,
        topic: &str,
        commands: Option<Sender<OperatorCommand>>,
    ) -> Result<Self> {
        let mut session = session.clone();
        session.availability_topic = Some(availability_topic(topic));

        let forward = commands.is_some();
        let link = MqttLink::start(&session, move |publish| {
            let Some(tx) = commands.as_ref() else {
                return true;
            };
            match parse_command_payload(&publish.payload) {
                Ok(cmd) => {
                    log::info!("MQTT command: {:?}", cmd);
                    tx.send(cmd).is_ok()
                }
                Err(e) => {
                    log::warn!("Ignoring MQTT command: {}", e);
                    true
                }
            }
        })?;
        if forward {
            link.subscribe(&command_topic(topic), QoS::AtLeastOnce)?;
        }
        link.announce(true)?;

        log::info!(
            "Publishing angles to {} (commands: {})",
            topic,
            if forward { "on" } else { "off" }
        );
        Ok(Self {
            link,
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl ActuatorSink for MqttActuator {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn send(&mut self, command: &AngleCommand) -> Result<()> {
        let payload = serde_json::to_vec(&MqttAnglePayload::from_command(command))?;
        self.link
            .client()
            .try_publish(self.topic.clone(), QoS::AtMostOnce, false, payload)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.link.close()
    }
}
