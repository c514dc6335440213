//! tracking_stats - summarize a facetrackd detection log.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use facetrack::observe::LogStats;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Summarize a detection log written by facetrackd")]
struct Args {
    /// Detection log (JSON lines).
    #[arg(default_value = "detection_log.jsonl")]
    log: PathBuf,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::detect(Some(&args.ui));

    let stats = {
        let _stage = ui.stage("Read detection log");
        LogStats::from_path(&args.log)?
    };
    print!("{}", render(&stats));
    Ok(())
}

fn render(stats: &LogStats) -> String {
    let mut out = String::new();
    out.push_str("Detection statistics\n");
    out.push_str(&format!("  sessions:        {}\n", stats.sessions));
    out.push_str(&format!("  frames logged:   {}\n", stats.frames));
    out.push_str(&format!("  frames followed: {}\n", stats.followed_frames));
    out.push_str(&format!("  detections:      {}\n", stats.total_detections()));
    if stats.malformed_lines > 0 {
        out.push_str(&format!("  malformed lines: {}\n", stats.malformed_lines));
    }

    if stats.labels.is_empty() {
        out.push_str("\nNo detections recorded.\n");
    }
    for (label, s) in &stats.labels {
        out.push_str(&format!("\n{}\n", label.to_uppercase()));
        out.push_str(&format!("  detections: {}\n", s.count));
        out.push_str(&format!(
            "  confidence: mean {:.2}%  min {:.2}%  max {:.2}%\n",
            s.mean() * 100.0,
            s.min * 100.0,
            s.max * 100.0
        ));
        out.push_str(&format!(
            "  high (>=90%): {}  medium (70-90%): {}  low (<70%): {}\n",
            s.buckets.high, s.buckets.medium, s.buckets.low
        ));
    }

    if !stats.target_changes.is_empty() {
        out.push_str(&format!("\nTarget changes ({})\n", stats.target_changes.len()));
        for change in &stats.target_changes {
            out.push_str(&format!(
                "  {}  {} -> {}\n",
                change.timestamp_ms,
                change.from.as_deref().unwrap_or("none"),
                change.to.as_deref().unwrap_or("none")
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_labels_and_changes() {
        let log = concat!(
            r#"{"type":"frame","timestamp_ms":2,"frame_index":0,"target":null,"detections":[{"label":"tuta","confidence":0.8,"center":[1,1]}]}"#,
            "\n",
            r#"{"type":"target_change","timestamp_ms":3,"from":null,"to":"tuta"}"#,
            "\n"
        );
        let stats = LogStats::from_reader(log.as_bytes()).expect("stats");
        let text = render(&stats);
        assert!(text.contains("TUTA"));
        assert!(text.contains("medium (70-90%): 1"));
        assert!(text.contains("none -> tuta"));
    }

    #[test]
    fn render_empty_log() {
        let stats = LogStats::from_reader("".as_bytes()).expect("stats");
        assert!(render(&stats).contains("No detections recorded."));
    }
}
