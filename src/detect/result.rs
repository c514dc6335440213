use serde::{Deserialize, Serialize};

/// Integer pixel coordinate, origin top-left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

impl PixelPoint {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Signed offset of `self` from `origin`.
    pub fn offset_from(self, origin: PixelPoint) -> PixelOffset {
        PixelOffset {
            x: self.x.saturating_sub(origin.x),
            y: self.y.saturating_sub(origin.y),
        }
    }
}

impl From<[i32; 2]> for PixelPoint {
    fn from([x, y]: [i32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<PixelPoint> for [i32; 2] {
    fn from(point: PixelPoint) -> Self {
        [point.x, point.y]
    }
}

/// Signed pixel displacement, e.g. target center minus frame center.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelOffset {
    pub x: i32,
    pub y: i32,
}

impl PixelOffset {
    pub const ZERO: PixelOffset = PixelOffset { x: 0, y: 0 };

    pub fn distance(&self) -> f64 {
        (self.x as f64).hypot(self.y as f64)
    }
}

/// Axis-aligned box in pixels: top-left corner plus size.
///
/// Serialized as `[x, y, width, height]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> PixelPoint {
        PixelPoint::new(
            self.x.saturating_add(self.width / 2),
            self.y.saturating_add(self.height / 2),
        )
    }

    /// Center without saturation; `None` when it falls outside `i32`.
    pub fn checked_center(&self) -> Option<PixelPoint> {
        Some(PixelPoint::new(
            self.x.checked_add(self.width / 2)?,
            self.y.checked_add(self.height / 2)?,
        ))
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x, y, width, height]: [i32; 4]) -> Self {
        Self::new(x, y, width, height)
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(bbox: BoundingBox) -> Self {
        [bbox.x, bbox.y, bbox.width, bbox.height]
    }
}

/// Wire shape accepted on input. Any `center` present is ignored and
/// recomputed from the box.
#[derive(Deserialize)]
struct DetectionRecord {
    bbox: BoundingBox,
    confidence: f32,
    #[serde(default)]
    label: Option<String>,
}

impl TryFrom<DetectionRecord> for Detection {
    type Error = String;

    fn try_from(record: DetectionRecord) -> Result<Self, Self::Error> {
        let bbox = record.bbox;
        if bbox.width < 0 || bbox.height < 0 {
            return Err(format!(
                "bbox size must be non-negative, got {}x{}",
                bbox.width, bbox.height
            ));
        }
        let center = bbox
            .checked_center()
            .ok_or_else(|| format!("bbox {:?} is out of pixel range", <[i32; 4]>::from(bbox)))?;
        if !(0.0..=1.0).contains(&record.confidence) {
            return Err(format!(
                "confidence must be within [0, 1], got {}",
                record.confidence
            ));
        }
        Ok(Self {
            bbox,
            center,
            confidence: record.confidence,
            label: record.label,
        })
    }
}

/// One face/person observed in a single frame.
///
/// Produced fresh per frame and never carried past it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DetectionRecord")]
pub struct Detection {
    pub bbox: BoundingBox,
    center: PixelPoint,
    pub confidence: f32,
    /// `None` means the detector could not name the subject.
    pub label: Option<String>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, label: Option<String>) -> Self {
        Self {
            bbox,
            center: bbox.center(),
            confidence,
            label,
        }
    }

    pub fn labeled(bbox: BoundingBox, confidence: f32, label: &str) -> Self {
        Self::new(bbox, confidence, Some(label.to_string()))
    }

    pub fn center(&self) -> PixelPoint {
        self.center
    }

    pub fn area(&self) -> i64 {
        self.bbox.area()
    }

    pub fn label_or_unknown(&self) -> &str {
        self.label.as_deref().unwrap_or("unknown")
    }

    pub fn matches_label(&self, label: &str) -> bool {
        self.label
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(label))
    }
}

/// One captured frame as seen by the tracking core: geometry plus whatever the
/// source already knows about its contents. The contents are only surfaced
/// through [`DetectionSource::detect`](super::DetectionSource::detect).
#[derive(Clone, Debug)]
pub struct Frame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    observations: Vec<Detection>,
}

impl Frame {
    pub fn new(sequence: u64, width: u32, height: u32, observations: Vec<Detection>) -> Self {
        Self {
            sequence,
            width,
            height,
            observations,
        }
    }

    pub fn center(&self) -> PixelPoint {
        PixelPoint::new((self.width / 2) as i32, (self.height / 2) as i32)
    }

    pub(crate) fn observations(&self) -> &[Detection] {
        &self.observations
    }
}

/// Frame record as published by an external detector process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameRecord {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl FrameRecord {
    pub fn into_frame(self, sequence: u64) -> Frame {
        Frame::new(sequence, self.width, self.height, self.detections)
    }
}
