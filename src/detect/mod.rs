//! Model boundaries: object/face detection, face embedding, gaze location,
//! and the known-face gallery.

mod backend;
pub mod backends;
mod gallery;
mod registry;
mod result;

pub use backend::{FaceEmbedder, GazeLocator, ObjectDetector};
pub use backends::StubBackend;
pub use gallery::{cosine_similarity, identity_from_stem, Gallery, GalleryEntry};
pub use registry::{lock_backends, SharedBackends, VisionBackends};
pub use result::{
    BoundingBox, Detection, Embedding, RecognitionMatch, FACE_LABEL, UNKNOWN_IDENTITY,
};
