use anyhow::Result;

use crate::detect::result::{Detection, Frame};

/// Camera + face detector collaborator.
///
/// The tracking core treats both halves as opaque synchronous calls: it
/// waits on [`next_frame`](Self::next_frame) for every frame and calls
/// [`detect`](Self::detect) only on frames selected by the detection interval.
pub trait DetectionSource: Send {
    /// Source identifier.
    fn name(&self) -> &'static str;

    /// Block until the next frame is available. `Ok(None)` ends the stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Run the detector on a captured frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(frame.observations().to_vec())
    }

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
