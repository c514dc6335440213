use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::actuator::ActuatorSink;
use crate::angles::AngleState;
use crate::detect::PixelOffset;
use crate::tracker::AngleCommand;

/// Last commanded position, as shared with other processes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub pan: f64,
    pub tilt: f64,
    #[serde(default)]
    pub tracking: bool,
    #[serde(default)]
    pub target: Option<String>,
    /// Milliseconds since the Unix epoch; readers poll on changes.
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub error: PixelOffset,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub confidence: f32,
}

impl PositionRecord {
    pub fn from_command(command: &AngleCommand, timestamp_ms: u64) -> Self {
        Self {
            pan: command.pan,
            tilt: command.tilt,
            tracking: command.tracking,
            target: command.target_label.clone(),
            timestamp_ms,
            error: command.error,
            distance: command.error.distance(),
            confidence: command.confidence,
        }
    }

    pub fn centered(center: AngleState, timestamp_ms: u64) -> Self {
        Self {
            pan: center.pan,
            tilt: center.tilt,
            tracking: false,
            target: None,
            timestamp_ms,
            error: PixelOffset::ZERO,
            distance: 0.0,
            confidence: 0.0,
        }
    }
}

/// JSON position file, replaced atomically on every write so readers never
/// see a partial record.
#[derive(Clone, Debug)]
pub struct PositionFile {
    path: PathBuf,
}

impl PositionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, record: &PositionRecord) -> Result<()> {
        let tmp = self.tmp_path()?;
        let body = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn read(&self) -> Result<PositionRecord> {
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        serde_json::from_slice(&raw)
            .map_err(|e| anyhow!("parse {}: {}", self.path.display(), e))
    }

    /// Write a centered record unless the file already exists. Returns whether
    /// a record was written.
    pub fn initialize(&self, center: AngleState) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        self.write(&PositionRecord::centered(center, now_millis()))?;
        log::info!("Initialized position file {}", self.path.display());
        Ok(true)
    }

    fn tmp_path(&self) -> Result<PathBuf> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("position file path has no file name"))?;
        let mut tmp_name = name.to_os_string();
        tmp_name.push(".tmp");
        Ok(self.path.with_file_name(tmp_name))
    }
}

impl ActuatorSink for PositionFile {
    fn name(&self) -> &'static str {
        "file"
    }

    fn send(&mut self, command: &AngleCommand) -> Result<()> {
        self.write(&PositionRecord::from_command(command, now_millis()))
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
