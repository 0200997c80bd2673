use anyhow::{anyhow, Result};

use crate::detect::backend::{FaceEmbedder, GazeLocator, ObjectDetector};
use crate::detect::result::{BoundingBox, Detection, Embedding, FACE_LABEL};
use crate::frame::Image;

/// Palette shared with the synthetic camera scenes.
pub const BACKGROUND_COLOR: [u8; 3] = [30, 30, 30];
pub const FACE_COLOR: [u8; 3] = [224, 172, 105];
pub const EYE_COLOR: [u8; 3] = [40, 40, 160];
pub const PHONE_COLOR: [u8; 3] = [10, 200, 10];

/// Label the stub detector reports for `PHONE_COLOR` regions.
pub const PHONE_LABEL: &str = "cell phone";

/// Grid used by the stub embedder (cells per side).
const EMBED_GRID: u32 = 4;

/// Stub backend for testing and demos.
///
/// Finds exact palette colours instead of running a model: `FACE_COLOR`
/// regions are faces, `EYE_COLOR` column runs inside a face are eyes,
/// `PHONE_COLOR` regions are phones. The embedder averages colour over a
/// coarse grid, so crops with the same painted markings compare close to 1.0.
#[derive(Default)]
pub struct StubBackend {
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backend calls served (all capabilities).
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl ObjectDetector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &Image) -> Result<Vec<Detection>> {
        self.calls += 1;
        let mut detections = Vec::new();
        if let Some(face) = color_bbox(image, FACE_COLOR) {
            detections.push(Detection::new(FACE_LABEL, 0.92, face));
        }
        if let Some(phone) = color_bbox(image, PHONE_COLOR) {
            detections.push(Detection::new(PHONE_LABEL, 0.81, phone));
        }
        Ok(detections)
    }
}

impl FaceEmbedder for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn embed(&mut self, face: &Image) -> Result<Embedding> {
        self.calls += 1;
        if face.width() < EMBED_GRID || face.height() < EMBED_GRID {
            return Err(anyhow!(
                "face crop {}x{} too small to embed",
                face.width(),
                face.height()
            ));
        }

        let cell_w = face.width() / EMBED_GRID;
        let cell_h = face.height() / EMBED_GRID;
        let mut embedding = Vec::with_capacity((EMBED_GRID * EMBED_GRID * 3) as usize);
        for gy in 0..EMBED_GRID {
            for gx in 0..EMBED_GRID {
                let mut sums = [0u64; 3];
                for y in gy * cell_h..(gy + 1) * cell_h {
                    for x in gx * cell_w..(gx + 1) * cell_w {
                        if let Some(px) = face.pixel(x, y) {
                            for (sum, v) in sums.iter_mut().zip(px) {
                                *sum += v as u64;
                            }
                        }
                    }
                }
                let n = (cell_w as u64 * cell_h as u64).max(1);
                embedding.extend(sums.iter().map(|s| (*s as f32 / n as f32) / 255.0));
            }
        }

        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            embedding.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(embedding)
    }
}

impl GazeLocator for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn faces(&mut self, image: &Image) -> Result<Vec<BoundingBox>> {
        self.calls += 1;
        Ok(color_bbox(image, FACE_COLOR).into_iter().collect())
    }

    fn eyes(&mut self, image: &Image, face: &BoundingBox) -> Result<Vec<BoundingBox>> {
        self.calls += 1;
        let Some(region) = face.clamp_to(image.width(), image.height()) else {
            return Ok(Vec::new());
        };

        // Group eye-coloured columns into runs; each run is one eye.
        let mut eyes: Vec<BoundingBox> = Vec::new();
        let mut current: Option<BoundingBox> = None;
        for x in region.x1..region.x2 {
            let mut column: Option<(i32, i32)> = None;
            for y in region.y1..region.y2 {
                if image.pixel(x as u32, y as u32) == Some(EYE_COLOR) {
                    column = Some(match column {
                        Some((top, _)) => (top, y),
                        None => (y, y),
                    });
                }
            }
            match column {
                Some((top, bottom)) => {
                    if let Some(eye) = current.as_mut() {
                        eye.x2 = x + 1;
                        eye.y1 = eye.y1.min(top);
                        eye.y2 = eye.y2.max(bottom + 1);
                    } else {
                        current = Some(BoundingBox::new(x, top, x + 1, bottom + 1));
                    }
                }
                None => {
                    if let Some(eye) = current.take() {
                        eyes.push(eye);
                    }
                }
            }
        }
        if let Some(eye) = current.take() {
            eyes.push(eye);
        }
        Ok(eyes)
    }
}

/// Bounding box of every pixel exactly matching `rgb`.
fn color_bbox(image: &Image, rgb: [u8; 3]) -> Option<BoundingBox> {
    let mut found: Option<BoundingBox> = None;
    for y in 0..image.height() as i32 {
        for x in 0..image.width() as i32 {
            if image.pixel(x as u32, y as u32) != Some(rgb) {
                continue;
            }
            found = Some(match found {
                Some(b) => BoundingBox::new(
                    b.x1.min(x),
                    b.y1.min(y),
                    b.x2.max(x + 1),
                    b.y2.max(y + 1),
                ),
                None => BoundingBox::new(x, y, x + 1, y + 1),
            });
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::cosine_similarity;

    fn face_image() -> Image {
        let mut image = Image::filled(100, 80, BACKGROUND_COLOR);
        image.fill_rect(&BoundingBox::new(30, 20, 70, 70), FACE_COLOR);
        image.fill_rect(&BoundingBox::new(38, 35, 46, 40), EYE_COLOR);
        image.fill_rect(&BoundingBox::new(54, 35, 62, 40), EYE_COLOR);
        image
    }

    #[test]
    fn stub_backend_finds_face_and_eyes() {
        let mut backend = StubBackend::new();
        let image = face_image();

        let detections = ObjectDetector::detect(&mut backend, &image).unwrap();
        assert_eq!(detections.len(), 1);
        assert!(detections[0].is_face());
        assert_eq!(detections[0].bbox, BoundingBox::new(30, 20, 70, 70));

        let faces = backend.faces(&image).unwrap();
        let eyes = backend.eyes(&image, &faces[0]).unwrap();
        assert_eq!(
            eyes,
            vec![
                BoundingBox::new(38, 35, 46, 40),
                BoundingBox::new(54, 35, 62, 40)
            ]
        );
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn stub_backend_reports_phones() {
        let mut backend = StubBackend::new();
        let mut image = Image::filled(50, 50, BACKGROUND_COLOR);
        image.fill_rect(&BoundingBox::new(5, 5, 15, 25), PHONE_COLOR);

        let detections = ObjectDetector::detect(&mut backend, &image).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, PHONE_LABEL);
    }

    #[test]
    fn stub_embeddings_are_stable_for_identical_crops() {
        let mut backend = StubBackend::new();
        let image = face_image();
        let crop = image.crop(&BoundingBox::new(30, 20, 70, 70)).unwrap();

        let a = backend.embed(&crop).unwrap();
        let b = backend.embed(&crop).unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);

        let tiny = Image::filled(2, 2, FACE_COLOR);
        assert!(backend.embed(&tiny).is_err());
    }
}
