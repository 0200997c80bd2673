use serde::Serialize;

/// Identity reported when no gallery entry clears the recognition threshold.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Label the detectors use for face detections.
pub const FACE_LABEL: &str = "face";

/// Face embedding vector produced by a `FaceEmbedder`.
pub type Embedding = Vec<f32>;

/// Axis-aligned box in pixel coordinates, `(x1, y1)` inclusive, `(x2, y2)` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Centre point, rounded towards the top-left.
    pub fn center(&self) -> (i32, i32) {
        (self.x1 + self.width() / 2, self.y1 + self.height() / 2)
    }

    /// Intersect with a `width x height` canvas. `None` when nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let w = width.min(i32::MAX as u32) as i32;
        let h = height.min(i32::MAX as u32) as i32;
        let clipped = BoundingBox {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        };
        if clipped.width() == 0 || clipped.height() == 0 {
            None
        } else {
            Some(clipped)
        }
    }
}

/// One detector output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    /// Score in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
        }
    }

    pub fn is_face(&self) -> bool {
        self.label.eq_ignore_ascii_case(FACE_LABEL)
    }
}

/// Best gallery match for one detected face.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecognitionMatch {
    pub identity: String,
    pub similarity: f32,
    pub bbox: BoundingBox,
}

impl RecognitionMatch {
    pub fn is_known(&self) -> bool {
        self.identity != UNKNOWN_IDENTITY
    }
}
