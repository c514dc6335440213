use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use anyhow::Result;
use rumqttc::v5::mqttbytes::QoS;

use crate::detect::result::{Frame, FrameRecord};
use crate::detect::source::DetectionSource;
use crate::transport::{MqttLink, MqttSession};

/// Silence on the feed longer than this yields an empty frame.
pub const DEFAULT_IDLE_FRAME: Duration = Duration::from_millis(250);

/// Turns a channel of frame records into frames.
///
/// When nothing arrives within the idle window the feed reports an empty
/// frame of the last known size, so the caller keeps polling its own inputs.
struct FrameFeed {
    frames: Receiver<FrameRecord>,
    idle: Duration,
    last_size: (u32, u32),
    sequence: u64,
}

impl FrameFeed {
    fn next_frame(&mut self) -> Option<Frame> {
        let sequence = self.sequence;
        let frame = match self.frames.recv_timeout(self.idle) {
            Ok(record) => {
                self.last_size = (record.width, record.height);
                record.into_frame(sequence)
            }
            Err(RecvTimeoutError::Timeout) => {
                let (width, height) = self.last_size;
                Frame::new(sequence, width, height, Vec::new())
            }
            Err(RecvTimeoutError::Disconnected) => return None,
        };
        self.sequence += 1;
        Some(frame)
    }
}

/// Receives frame records published by an external detector process.
///
/// Each message on the topic is one frame. The session runs on its own
/// thread; the stream ends when the connection fails.
pub struct MqttSource {
    feed: FrameFeed,
    _link: MqttLink,
}

impl MqttSource {
    /// `frame_size` is reported for idle frames until the first record arrives.
    pub fn connect(session: &MqttSession, topic: &str, frame_size: (u32, u32)) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let link = MqttLink::start(session, move |publish| {
            match serde_json::from_slice::<FrameRecord>(&publish.payload) {
                Ok(record) => tx.send(record).is_ok(),
                Err(e) => {
                    log::warn!("Skipping malformed detection payload: {}", e);
                    true
                }
            }
        })?;
        link.subscribe(topic, QoS::AtMostOnce)?;
        log::info!("Subscribed to detections on {}", topic);

        Ok(Self {
            feed: FrameFeed {
                frames: rx,
                idle: DEFAULT_IDLE_FRAME,
                last_size: frame_size,
                sequence: 0,
            },
            _link: link,
        })
    }
}

impl DetectionSource for MqttSource {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.feed.next_frame())
    }
}
