use anyhow::Result;

use crate::detect::result::{BoundingBox, Detection, Embedding};
use crate::frame::Image;

/// Object/face detector backend.
///
/// # Model Boundary
///
/// The detector is treated as an opaque, deterministic-enough function of the
/// frame. Implementations must not retain the image beyond the call. Errors are
/// absorbed by the processing stage: a failing call means "no detections".
pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a full frame. Boxes are in frame pixel coordinates.
    fn detect(&mut self, image: &Image) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Face embedding backend used for recognition against the gallery.
pub trait FaceEmbedder: Send {
    fn name(&self) -> &'static str;

    /// Embed a face crop. Vectors from one embedder are comparable with
    /// `cosine_similarity`.
    fn embed(&mut self, face: &Image) -> Result<Embedding>;
}

/// Secondary face and eye locator used for gaze estimation.
pub trait GazeLocator: Send {
    fn name(&self) -> &'static str;

    /// Face regions in frame coordinates.
    fn faces(&mut self, image: &Image) -> Result<Vec<BoundingBox>>;

    /// Eye regions inside `face`, in frame coordinates.
    fn eyes(&mut self, image: &Image, face: &BoundingBox) -> Result<Vec<BoundingBox>>;
}
