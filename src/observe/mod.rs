//! Detection log and offline statistics over it.

mod detection_log;
mod stats;

pub use detection_log::{DetectionLogger, LogEntry, LoggedDetection, DEFAULT_LOG_INTERVAL};
pub use stats::{ConfidenceBuckets, LabelStats, LogStats, TargetChange};
