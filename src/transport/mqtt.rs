//! MQTT connection plumbing shared by the actuator, the MQTT detection source
//! and the position bridge.
//!
//! Endpoints accept `host:port`, `mqtt://`, `tcp://` (plain) and `mqtts://`,
//! `ssl://` (TLS). TLS uses rustls through rumqttc with either the bundled
//! web roots or a caller-provided CA, plus optional client certificates.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::{LastWill, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::Transport;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Broker address after scheme parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// PEM material for TLS connections.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// CA certificate. When `None`, the bundled web roots are used.
    pub ca: Option<Vec<u8>>,
    /// Client certificate and key for mutual TLS, always together.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!(
                        "failed to read MQTT TLS client cert '{}'",
                        cert_path.display()
                    )
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client cert provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// Build the rumqttc transport for `endpoint`.
    pub fn build_transport(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled (use mqtts:// or set use_tls)"
                ));
            }
            return Ok(Transport::tcp());
        }

        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }

        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

/// Everything needed to open one broker session.
#[derive(Clone, Debug)]
pub struct MqttSession {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic that receives a retained `offline` if the session drops.
    pub availability_topic: Option<String>,
}

impl MqttSession {
    pub fn connect(&self) -> Result<(Client, Connection)> {
        let mut options =
            MqttOptions::new(self.client_id.clone(), self.endpoint.host.clone(), self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = &self.username {
            options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        if let Some(topic) = &self.availability_topic {
            let will = LastWill::new(
                topic.clone(),
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
                None,
            );
            options.set_last_will(will);
        }
        options.set_transport(self.tls.build_transport(&self.endpoint)?);

        let (client, connection) = Client::new(options, 10);
        log::info!(
            "MQTT session to {}:{} (TLS: {}, auth: {})",
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.use_tls,
            self.username.is_some()
        );
        Ok((client, connection))
    }
}

impl MqttEndpoint {
    /// Parse `[scheme://]host[:port]`. IPv6 hosts go in brackets. A missing
    /// port defaults to 1883, or 8883 for TLS.
    pub fn parse(addr: &str, force_tls: bool) -> Result<Self> {
        let addr = addr.trim();
        let (scheme_tls, authority) = match addr.split_once("://") {
            None => (false, addr),
            Some(("mqtt" | "tcp", rest)) => (false, rest),
            Some(("mqtts" | "ssl", rest)) => (true, rest),
            Some((scheme, _)) => return Err(anyhow!("unsupported MQTT scheme: {}", scheme)),
        };
        let use_tls = force_tls || scheme_tls;

        let (host, port) = match authority.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or_else(|| anyhow!("unterminated IPv6 host in {}", addr))?;
                let port = match tail {
                    "" => None,
                    _ => Some(
                        tail.strip_prefix(':')
                            .ok_or_else(|| anyhow!("unexpected '{}' after host in {}", tail, addr))?,
                    ),
                };
                (host, port)
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };
        if host.is_empty() {
            return Err(anyhow!("missing MQTT host in {}", addr));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
            None if use_tls => 8883,
            None => 1883,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            use_tls,
        })
    }

    pub fn is_loopback(&self) -> bool {
        self.host.eq_ignore_ascii_case("localhost")
            || self
                .host
                .parse::<std::net::IpAddr>()
                .is_ok_and(|ip| ip.is_loopback())
    }

    /// Refuse non-loopback brokers unless the operator opted in.
    pub fn require_loopback(&self) -> Result<()> {
        if self.is_loopback() {
            return Ok(());
        }
        Err(anyhow!(
            "MQTT broker {}:{} is not loopback (set mqtt.allow_remote to override)",
            self.host,
            self.port
        ))
    }
}

/// One broker session with its event loop on a background thread.
///
/// Incoming publishes go to the handler given at start; the loop stops when
/// the handler returns `false` or the connection fails. If the session has an
/// availability topic, [`announce`](Self::announce) publishes the retained
/// status there and [`close`](Self::close) sends `offline` before
/// disconnecting.
pub struct MqttLink {
    client: Client,
    availability: Option<String>,
    handle: Option<JoinHandle<()>>,
}

impl MqttLink {
    pub fn start<F>(session: &MqttSession, mut on_publish: F) -> Result<Self>
    where
        F: FnMut(&Publish) -> bool + Send + 'static,
    {
        let (client, mut connection) = session.connect()?;
        let handle = std::thread::spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if !on_publish(&publish) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("MQTT connection error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client,
            availability: session.availability_topic.clone(),
            handle: Some(handle),
        })
    }

    /// Event loop that ignores incoming messages; for publish-only sessions.
    pub fn publisher(session: &MqttSession) -> Result<Self> {
        Self::start(session, |_| true)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.client.subscribe(topic, qos)?;
        Ok(())
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)?;
        Ok(())
    }

    /// Retained availability status; no-op without an availability topic.
    pub fn announce(&self, online: bool) -> Result<()> {
        let Some(topic) = &self.availability else {
            return Ok(());
        };
        let payload = if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        self.publish(topic, payload.as_bytes().to_vec(), true)
    }

    /// Announce `offline`, disconnect and wait for the event loop. Safe to
    /// call more than once.
    pub fn close(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let result = self.announce(false).and_then(|()| {
            self.client.disconnect()?;
            Ok(())
        });
        if result.is_err() {
            // The event loop may still be running; a second disconnect stops it.
            let _ = self.client.disconnect();
        }
        let _ = handle.join();
        result
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
