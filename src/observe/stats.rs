use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};

use crate::observe::detection_log::LogEntry;

const HIGH_CONFIDENCE: f32 = 0.90;
const MEDIUM_CONFIDENCE: f32 = 0.70;
const UNKNOWN_LABEL: &str = "unknown";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfidenceBuckets {
    /// `>= 0.90`
    pub high: u64,
    /// `0.70 ..< 0.90`
    pub medium: u64,
    /// `< 0.70`
    pub low: u64,
}

impl ConfidenceBuckets {
    fn record(&mut self, confidence: f32) {
        if confidence >= HIGH_CONFIDENCE {
            self.high += 1;
        } else if confidence >= MEDIUM_CONFIDENCE {
            self.medium += 1;
        } else {
            self.low += 1;
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabelStats {
    pub count: u64,
    pub min: f32,
    pub max: f32,
    sum: f64,
    pub buckets: ConfidenceBuckets,
}

impl LabelStats {
    fn new() -> Self {
        Self {
            count: 0,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            sum: 0.0,
            buckets: ConfidenceBuckets::default(),
        }
    }

    fn record(&mut self, confidence: f32) {
        self.count += 1;
        self.min = self.min.min(confidence);
        self.max = self.max.max(confidence);
        self.sum += confidence as f64;
        self.buckets.record(confidence);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetChange {
    pub timestamp_ms: u64,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Aggregates over a detection log.
#[derive(Clone, Debug, Default)]
pub struct LogStats {
    pub sessions: u64,
    pub frames: u64,
    /// Frame entries in which a face was being followed.
    pub followed_frames: u64,
    pub malformed_lines: u64,
    pub labels: BTreeMap<String, LabelStats>,
    pub target_changes: Vec<TargetChange>,
}

impl LogStats {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("open detection log {}", path.display()))?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Blank lines are skipped; lines that are not UTF-8 or do not parse
    /// are counted.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut stats = Self::default();
        for line in reader.split(b'\n') {
            let line = line.context("read detection log")?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let parsed = std::str::from_utf8(&line)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    serde_json::from_str::<LogEntry>(text).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(entry) => stats.record(entry),
                Err(e) => {
                    log::debug!("skipping malformed log line: {}", e);
                    stats.malformed_lines += 1;
                }
            }
        }
        Ok(stats)
    }

    pub fn total_detections(&self) -> u64 {
        self.labels.values().map(|s| s.count).sum()
    }

    fn record(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::SessionStart { .. } => self.sessions += 1,
            LogEntry::Frame {
                followed,
                detections,
                ..
            } => {
                self.frames += 1;
                if followed.is_some() {
                    self.followed_frames += 1;
                }
                for detection in detections {
                    let label = detection
                        .label
                        .filter(|l| !l.trim().is_empty())
                        .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
                    self.labels
                        .entry(label)
                        .or_insert_with(LabelStats::new)
                        .record(detection.confidence);
                }
            }
            LogEntry::TargetChange {
                timestamp_ms,
                from,
                to,
            } => self.target_changes.push(TargetChange {
                timestamp_ms,
                from,
                to,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"{"type":"session_start","timestamp_ms":1,"target":null}
{"type":"frame","timestamp_ms":2,"frame_index":0,"target":"laura","followed":0,"detections":[{"label":"laura","confidence":0.95,"center":[10,10]},{"label":null,"confidence":0.5,"center":[50,50]}]}

this is not json
{"type":"target_change","timestamp_ms":3,"from":"laura","to":"tuta"}
{"type":"frame","timestamp_ms":4,"frame_index":30,"target":"tuta","detections":[{"label":"laura","confidence":0.75,"center":[12,10]}]}
"#;

    #[test]
    fn aggregates_per_label() {
        let stats = LogStats::from_reader(LOG.as_bytes()).expect("stats");
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.followed_frames, 1);
        assert_eq!(stats.malformed_lines, 1);
        assert_eq!(stats.total_detections(), 3);

        let laura = &stats.labels["laura"];
        assert_eq!(laura.count, 2);
        assert!((laura.mean() - 0.85).abs() < 1e-6);
        assert_eq!(laura.min, 0.75);
        assert_eq!(laura.max, 0.95);
        assert_eq!(laura.buckets, ConfidenceBuckets { high: 1, medium: 1, low: 0 });

        assert_eq!(stats.labels["unknown"].buckets.low, 1);
        assert_eq!(stats.target_changes.len(), 1);
        assert_eq!(stats.target_changes[0].to.as_deref(), Some("tuta"));
    }

    #[test]
    fn non_utf8_line_is_counted_and_skipped() {
        let mut bytes = b"\xff\xfe\n".to_vec();
        bytes.extend_from_slice(LOG.as_bytes());
        let stats = LogStats::from_reader(bytes.as_slice()).expect("stats");
        assert_eq!(stats.malformed_lines, 2);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.target_changes.len(), 1);
    }

    #[test]
    fn empty_log_is_empty() {
        let stats = LogStats::from_reader("".as_bytes()).expect("stats");
        assert_eq!(stats.total_detections(), 0);
        assert!(stats.labels.is_empty());
    }
}
