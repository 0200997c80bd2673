//! Gaze estimation and debouncing.
//!
//! `classify` turns one face box plus its eye boxes into an instantaneous
//! `GazeObservation`. `GazeDebouncer` folds observations into the debounced
//! `looking_at_screen` flag with a hysteresis counter, so a single bad frame
//! cannot toggle the verdict.

use serde::Serialize;

use crate::detect::BoundingBox;

/// Debounced "looking" requires the counter to reach this value.
pub const LOOKING_THRESHOLD: u32 = 2;

/// Upper bound on the hysteresis counter. Keeps the time needed to flip back
/// to "not looking" short after a long attentive stretch.
pub const HYSTERESIS_CAP: u32 = 4;

/// Geometry thresholds for the two-eye classification.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GazeParams {
    /// Maximum `|dy| / dx` between the two eyes.
    pub slope_threshold: f32,
    /// Minimum face area as a fraction of frame area.
    pub min_face_ratio: f32,
    /// Face box must lie within `[margin, 1 - margin]` of frame width.
    pub center_margin: f32,
    /// Minimum horizontal eye separation in pixels.
    pub min_eye_distance: f32,
    /// With a single eye, the face centre must lie within this band of frame width.
    pub single_eye_band: (f32, f32),
}

impl Default for GazeParams {
    fn default() -> Self {
        Self {
            slope_threshold: 0.4,
            min_face_ratio: 0.01,
            center_margin: 0.1,
            min_eye_distance: 10.0,
            single_eye_band: (0.25, 0.75),
        }
    }
}

/// Instantaneous gaze classification for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GazeObservation {
    NoFace,
    /// A face was found but no eyes inside it.
    NoEyes,
    SingleEye { centered: bool },
    TwoEyes { aligned: bool },
}

impl GazeObservation {
    pub fn eye_count(&self) -> u8 {
        match self {
            Self::NoFace | Self::NoEyes => 0,
            Self::SingleEye { .. } => 1,
            Self::TwoEyes { .. } => 2,
        }
    }

    pub fn face_present(&self) -> bool {
        !matches!(self, Self::NoFace)
    }
}

/// Per-frame gaze summary carried in results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GazeSample {
    pub looking_at_screen: bool,
    pub eye_count: u8,
    pub face_present: bool,
}

/// Classify a face and its eyes against the frame geometry.
pub fn classify(
    frame_width: u32,
    frame_height: u32,
    face: Option<&BoundingBox>,
    eyes: &[BoundingBox],
    params: &GazeParams,
) -> GazeObservation {
    let Some(face) = face else {
        return GazeObservation::NoFace;
    };
    let fw = frame_width as f32;
    let fh = frame_height as f32;

    match eyes.len() {
        0 => GazeObservation::NoEyes,
        1 => {
            let (cx, _) = face.center();
            let (lo, hi) = params.single_eye_band;
            let cx = cx as f32;
            GazeObservation::SingleEye {
                centered: cx > fw * lo && cx < fw * hi,
            }
        }
        _ => {
            let mut centers: Vec<(f32, f32)> = eyes
                .iter()
                .map(|eye| {
                    let (x, y) = eye.center();
                    (x as f32, y as f32)
                })
                .collect();
            centers.sort_by(|a, b| a.0.total_cmp(&b.0));
            let (left, right) = (centers[0], centers[1]);

            let eye_distance = right.0 - left.0;
            let slope = (right.1 - left.1).abs() / (eye_distance + 0.01);

            let face_ratio = if fw * fh > 0.0 {
                face.area() as f32 / (fw * fh)
            } else {
                0.0
            };
            let face_centered = face.x1 as f32 > fw * params.center_margin
                && (face.x2 as f32) < fw * (1.0 - params.center_margin);

            GazeObservation::TwoEyes {
                aligned: slope < params.slope_threshold
                    && face_ratio > params.min_face_ratio
                    && face_centered
                    && eye_distance > params.min_eye_distance,
            }
        }
    }
}

/// Hysteresis debouncer for the `looking_at_screen` flag.
#[derive(Clone, Debug, Default)]
pub struct GazeDebouncer {
    counter: u32,
    looking: bool,
}

impl GazeDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn looking(&self) -> bool {
        self.looking
    }

    /// Fold one observation in and return the debounced flag.
    ///
    /// - aligned eyes: counter +1
    /// - misaligned eyes / off-centre single eye: counter -1
    /// - no eyes: counter -2
    /// - no face: counter reset, not looking
    /// - centred single eye: looking for this frame, counter unchanged
    pub fn observe(&mut self, observation: GazeObservation) -> bool {
        match observation {
            GazeObservation::NoFace => {
                self.counter = 0;
                self.looking = false;
                return self.looking;
            }
            GazeObservation::SingleEye { centered: true } => {
                self.looking = true;
                return self.looking;
            }
            GazeObservation::TwoEyes { aligned: true } => {
                self.counter = (self.counter + 1).min(HYSTERESIS_CAP);
            }
            GazeObservation::TwoEyes { aligned: false }
            | GazeObservation::SingleEye { centered: false } => {
                self.counter = self.counter.saturating_sub(1);
            }
            GazeObservation::NoEyes => {
                self.counter = self.counter.saturating_sub(2);
            }
        }
        self.looking = self.counter >= LOOKING_THRESHOLD;
        self.looking
    }

    /// Fold a bare looking/not-looking classification (two-eye case).
    pub fn observe_instant(&mut self, looking: bool) -> bool {
        self.observe(GazeObservation::TwoEyes { aligned: looking })
    }
}
