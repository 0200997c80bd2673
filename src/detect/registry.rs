use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::detect::backend::{FaceEmbedder, GazeLocator, ObjectDetector};
use crate::detect::backends::StubBackend;
use crate::detect::result::{BoundingBox, Detection, Embedding};
use crate::error::PipelineError;
use crate::frame::Image;

/// Backends shared between the supervisor and the processing worker.
///
/// Wrapped in `Mutex` because every backend call takes `&mut self`. The
/// processing stage is the only caller while a run is active; the supervisor
/// touches it only for gallery loading and warm-up while idle.
pub type SharedBackends = Arc<Mutex<VisionBackends>>;

/// The three model boundaries the processing stage calls into.
pub struct VisionBackends {
    detector: Box<dyn ObjectDetector>,
    embedder: Box<dyn FaceEmbedder>,
    locator: Box<dyn GazeLocator>,
}

impl VisionBackends {
    pub fn new<D, E, L>(detector: D, embedder: E, locator: L) -> Self
    where
        D: ObjectDetector + 'static,
        E: FaceEmbedder + 'static,
        L: GazeLocator + 'static,
    {
        Self {
            detector: Box::new(detector),
            embedder: Box::new(embedder),
            locator: Box::new(locator),
        }
    }

    /// Synthetic backends matching the `stub://` camera scenes.
    pub fn stub() -> Self {
        Self::new(StubBackend::new(), StubBackend::new(), StubBackend::new())
    }

    pub fn into_shared(self) -> SharedBackends {
        Arc::new(Mutex::new(self))
    }

    /// Backend names as `detector/embedder/locator`.
    pub fn describe(&self) -> String {
        format!(
            "{}/{}/{}",
            self.detector.name(),
            self.embedder.name(),
            self.locator.name()
        )
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.detector.warm_up()
    }

    pub fn detect(&mut self, image: &Image) -> Result<Vec<Detection>, PipelineError> {
        let backend = self.detector.name();
        self.detector
            .detect(image)
            .map_err(|e| PipelineError::inference(backend, e))
    }

    pub fn embed(&mut self, face: &Image) -> Result<Embedding, PipelineError> {
        let backend = self.embedder.name();
        self.embedder
            .embed(face)
            .map_err(|e| PipelineError::inference(backend, e))
    }

    pub fn faces(&mut self, image: &Image) -> Result<Vec<BoundingBox>, PipelineError> {
        let backend = self.locator.name();
        self.locator
            .faces(image)
            .map_err(|e| PipelineError::inference(backend, e))
    }

    pub fn eyes(
        &mut self,
        image: &Image,
        face: &BoundingBox,
    ) -> Result<Vec<BoundingBox>, PipelineError> {
        let backend = self.locator.name();
        self.locator
            .eyes(image, face)
            .map_err(|e| PipelineError::inference(backend, e))
    }
}

impl Default for VisionBackends {
    fn default() -> Self {
        Self::stub()
    }
}

/// Lock shared backends, mapping poisoning to an error.
pub fn lock_backends(shared: &SharedBackends) -> Result<MutexGuard<'_, VisionBackends>> {
    shared
        .lock()
        .map_err(|_| anyhow!("vision backend lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingDetector;

    impl ObjectDetector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _image: &Image) -> Result<Vec<Detection>> {
            Err(anyhow!("model exploded"))
        }
    }

    #[test]
    fn backend_errors_become_inference_failures() {
        let mut backends =
            VisionBackends::new(FailingDetector, StubBackend::new(), StubBackend::new());
        let err = backends
            .detect(&Image::filled(8, 8, [0, 0, 0]))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ModelInferenceFailed {
                backend: "failing",
                ..
            }
        ));
        assert_eq!(backends.describe(), "failing/stub/stub");
    }

    #[test]
    fn shared_backends_lock() {
        let shared = VisionBackends::stub().into_shared();
        let guard = lock_backends(&shared).unwrap();
        assert_eq!(guard.describe(), "stub/stub/stub");
    }
}
