//! Transport plumbing for the MQTT link.

pub mod mqtt;

pub use mqtt::{
    MqttEndpoint, MqttLink, MqttSession, TlsMaterials, PAYLOAD_OFFLINE, PAYLOAD_ONLINE,
};
