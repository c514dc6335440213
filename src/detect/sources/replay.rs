use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use crate::detect::result::{Frame, FrameRecord};
use crate::detect::source::DetectionSource;

/// Replays recorded detector output, one JSON frame record per line.
///
/// Blank lines are skipped. A line that fails to parse is logged and
/// delivered as an empty frame so frame numbering stays aligned with the
/// recording.
pub struct ReplaySource {
    reader: Box<dyn BufRead + Send>,
    sequence: u64,
    line_no: usize,
    last_size: (u32, u32),
}

impl ReplaySource {
    /// Open a recording; `-` reads from stdin.
    pub fn open(path: &str) -> Result<Self> {
        let reader: Box<dyn BufRead + Send> = if path == "-" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            let file = File::open(Path::new(path))
                .with_context(|| format!("failed to open replay file {}", path))?;
            Box::new(BufReader::new(file))
        };
        Ok(Self::from_reader(reader))
    }

    pub fn from_reader(reader: Box<dyn BufRead + Send>) -> Self {
        Self {
            reader,
            sequence: 0,
            line_no: 0,
            last_size: (640, 480),
        }
    }
}

impl DetectionSource for ReplaySource {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut line)
                .context("failed to read replay line")?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if !line.iter().all(u8::is_ascii_whitespace) {
                break;
            }
        }

        let sequence = self.sequence;
        self.sequence += 1;
        let parsed = std::str::from_utf8(&line)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                serde_json::from_str::<FrameRecord>(text.trim()).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(record) => {
                self.last_size = (record.width, record.height);
                Ok(Some(record.into_frame(sequence)))
            }
            Err(e) => {
                log::warn!("replay line {} skipped: {}", self.line_no, e);
                let (width, height) = self.last_size;
                Ok(Some(Frame::new(sequence, width, height, Vec::new())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(text: &'static str) -> ReplaySource {
        ReplaySource::from_reader(Box::new(Cursor::new(text.as_bytes())))
    }

    #[test]
    fn replays_frames_in_order() {
        let mut replay = source(
            "{\"width\":640,\"height\":480,\"detections\":[{\"bbox\":[300,200,40,40],\"confidence\":0.9,\"label\":\"laura\"}]}\n\
             \n\
             {\"width\":640,\"height\":480,\"detections\":[]}\n",
        );
        let first = replay.next_frame().unwrap().unwrap();
        let found = replay.detect(&first).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].matches_label("LAURA"));

        let second = replay.next_frame().unwrap().unwrap();
        assert_eq!(second.sequence, 1);
        assert!(replay.detect(&second).unwrap().is_empty());

        assert!(replay.next_frame().unwrap().is_none());
    }

    #[test]
    fn malformed_line_becomes_empty_frame() {
        let mut replay = source("{\"width\":320,\"height\":240}\nnot json\n");
        replay.next_frame().unwrap().unwrap();
        let bad = replay.next_frame().unwrap().unwrap();
        assert_eq!((bad.width, bad.height), (320, 240));
        assert!(replay.detect(&bad).unwrap().is_empty());
    }

    #[test]
    fn invalid_utf8_line_becomes_empty_frame() {
        let mut bytes = b"{\"width\":320,\"height\":240}\n".to_vec();
        bytes.extend_from_slice(b"\xff\xfe garbage\n");
        bytes.extend_from_slice(b"{\"width\":320,\"height\":240}\n");
        let mut replay = ReplaySource::from_reader(Box::new(Cursor::new(bytes)));

        replay.next_frame().unwrap().unwrap();
        let bad = replay.next_frame().unwrap().unwrap();
        assert_eq!(bad.sequence, 1);
        assert_eq!((bad.width, bad.height), (320, 240));
        assert!(replay.detect(&bad).unwrap().is_empty());
        assert_eq!(replay.next_frame().unwrap().unwrap().sequence, 2);
        assert!(replay.next_frame().unwrap().is_none());
    }

    #[test]
    fn out_of_range_box_becomes_empty_frame() {
        let mut replay = source(
            "{\"width\":640,\"height\":480,\"detections\":[{\"bbox\":[2147483600,0,200,40],\"confidence\":0.9,\"label\":\"laura\"}]}\n",
        );
        let frame = replay.next_frame().unwrap().unwrap();
        assert!(replay.detect(&frame).unwrap().is_empty());
    }
}
