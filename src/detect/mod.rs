mod result;
mod source;
pub mod sources;

pub use result::{BoundingBox, Detection, Frame, FrameRecord, PixelOffset, PixelPoint};
pub use source::DetectionSource;
pub use sources::{MqttSource, ReplaySource, StubConfig, StubSource};
