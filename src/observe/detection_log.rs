use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::actuator::now_millis;
use crate::detect::{Detection, PixelPoint};
use crate::tracker::FrameOutcome;

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// One detection as recorded in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggedDetection {
    pub label: Option<String>,
    pub confidence: f32,
    pub center: PixelPoint,
}

impl From<&Detection> for LoggedDetection {
    fn from(d: &Detection) -> Self {
        Self {
            label: d.label.clone(),
            confidence: d.confidence,
            center: d.center(),
        }
    }
}

/// A line of the detection log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    SessionStart {
        timestamp_ms: u64,
        target: Option<String>,
    },
    Frame {
        timestamp_ms: u64,
        frame_index: u64,
        target: Option<String>,
        /// Index into `detections` of the followed face.
        #[serde(default)]
        followed: Option<usize>,
        #[serde(default)]
        detections: Vec<LoggedDetection>,
    },
    TargetChange {
        timestamp_ms: u64,
        from: Option<String>,
        to: Option<String>,
    },
}

/// Appends [`LogEntry`] JSON lines, at most one frame entry per interval.
pub struct DetectionLogger<W: Write = BufWriter<File>> {
    writer: W,
    interval: Duration,
    last_frame: Option<Instant>,
    written: u64,
}

impl DetectionLogger {
    /// Truncate `path` and start a session.
    pub fn create(path: impl AsRef<Path>, interval: Duration, target: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("create detection log {}", path.display()))?;
        log::info!("Detection log: {}", path.display());
        Self::start(BufWriter::new(file), interval, target)
    }
}

impl<W: Write> DetectionLogger<W> {
    pub fn start(writer: W, interval: Duration, target: Option<&str>) -> Result<Self> {
        let mut logger = Self {
            writer,
            interval,
            last_frame: None,
            written: 0,
        };
        logger.write_entry(&LogEntry::SessionStart {
            timestamp_ms: now_millis(),
            target: target.map(str::to_string),
        })?;
        Ok(logger)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn log_frame(&mut self, outcome: &FrameOutcome) -> Result<bool> {
        self.log_frame_at(outcome, Instant::now())
    }

    /// Record a sampled frame unless one was recorded less than `interval`
    /// ago. Returns whether an entry was written.
    pub fn log_frame_at(&mut self, outcome: &FrameOutcome, now: Instant) -> Result<bool> {
        if !outcome.sampled {
            return Ok(false);
        }
        if let Some(last) = self.last_frame {
            if now.saturating_duration_since(last) < self.interval {
                return Ok(false);
            }
        }
        self.last_frame = Some(now);
        self.write_entry(&LogEntry::Frame {
            timestamp_ms: now_millis(),
            frame_index: outcome.frame_index,
            target: outcome.target_label.clone(),
            followed: outcome.target_index(),
            detections: outcome.detections.iter().map(LoggedDetection::from).collect(),
        })?;
        Ok(true)
    }

    pub fn log_target_change(&mut self, from: Option<&str>, to: Option<&str>) -> Result<()> {
        self.write_entry(&LogEntry::TargetChange {
            timestamp_ms: now_millis(),
            from: from.map(str::to_string),
            to: to.map(str::to_string),
        })
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_entry(&mut self, entry: &LogEntry) -> Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }
}
