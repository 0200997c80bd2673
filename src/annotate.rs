//! Frame annotation for display and emission.

use crate::detect::{BoundingBox, Detection, RecognitionMatch};
use crate::frame::Image;

pub const KNOWN_FACE_COLOR: [u8; 3] = [0, 200, 0];
pub const UNKNOWN_FACE_COLOR: [u8; 3] = [220, 0, 0];
pub const OBJECT_COLOR: [u8; 3] = [0, 200, 0];
pub const EYE_MARKER_COLOR: [u8; 3] = [255, 230, 0];

const BOX_THICKNESS: i32 = 2;
const EYE_MARKER_RADIUS: i32 = 2;

/// Everything drawn onto one frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct Overlay<'a> {
    pub detections: &'a [Detection],
    pub matches: &'a [RecognitionMatch],
    pub eyes: &'a [BoundingBox],
    pub is_cheating: bool,
}

/// Draw `overlay` in place.
///
/// Faces are outlined from their recognition match (green when known, red
/// when not); a face detection without a match is drawn as unknown. Other
/// detections are green. Eyes get a filled marker at their centre, and a
/// cheating verdict adds a red frame border.
pub fn annotate(image: &mut Image, overlay: &Overlay<'_>) {
    for detection in overlay.detections.iter().filter(|d| !d.is_face()) {
        outline(image, &detection.bbox, OBJECT_COLOR, BOX_THICKNESS);
    }

    for detection in overlay.detections.iter().filter(|d| d.is_face()) {
        let matched = overlay.matches.iter().find(|m| m.bbox == detection.bbox);
        let color = match matched {
            Some(m) if m.is_known() => KNOWN_FACE_COLOR,
            _ => UNKNOWN_FACE_COLOR,
        };
        outline(image, &detection.bbox, color, BOX_THICKNESS);
    }

    for eye in overlay.eyes {
        let (cx, cy) = eye.center();
        let marker = BoundingBox::new(
            cx - EYE_MARKER_RADIUS,
            cy - EYE_MARKER_RADIUS,
            cx + EYE_MARKER_RADIUS + 1,
            cy + EYE_MARKER_RADIUS + 1,
        );
        image.fill_rect(&marker, EYE_MARKER_COLOR);
    }

    if overlay.is_cheating {
        let border = BoundingBox::new(0, 0, image.width() as i32, image.height() as i32);
        outline(image, &border, UNKNOWN_FACE_COLOR, BOX_THICKNESS * 2);
    }
}

/// Rectangle outline drawn inside `bbox`.
pub fn outline(image: &mut Image, bbox: &BoundingBox, rgb: [u8; 3], thickness: i32) {
    let t = thickness.max(1);
    let BoundingBox { x1, y1, x2, y2 } = *bbox;
    image.fill_rect(&BoundingBox::new(x1, y1, x2, (y1 + t).min(y2)), rgb);
    image.fill_rect(&BoundingBox::new(x1, (y2 - t).max(y1), x2, y2), rgb);
    image.fill_rect(&BoundingBox::new(x1, y1, (x1 + t).min(x2), y2), rgb);
    image.fill_rect(&BoundingBox::new((x2 - t).max(x1), y1, x2, y2), rgb);
}
