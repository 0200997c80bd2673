//! Synthetic exam scenes for `stub://` cameras.
//!
//! Frames are painted with the stub backend palette so the whole pipeline can
//! run end to end without models or cameras.

use crate::detect::backends::stub::{BACKGROUND_COLOR, EYE_COLOR, FACE_COLOR, PHONE_COLOR};
use crate::detect::BoundingBox;
use crate::frame::Image;

/// What the synthetic exam-taker is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scene {
    /// Centred face, two level eyes.
    Attentive,
    /// Face turned towards the frame edge, eyes tilted.
    LookingAway,
    /// Nobody in front of the camera.
    Absent,
    /// Attentive, with a phone visible on the desk.
    Phone,
}

impl Scene {
    pub fn parse(value: &str) -> Option<Scene> {
        match value.trim().to_ascii_lowercase().as_str() {
            "attentive" => Some(Scene::Attentive),
            "away" | "looking_away" => Some(Scene::LookingAway),
            "absent" => Some(Scene::Absent),
            "phone" => Some(Scene::Phone),
            _ => None,
        }
    }
}

/// Scene selection for a synthetic camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneScript {
    Fixed(Scene),
    /// Attentive for 60 frames, away for 45, absent for 15, repeating.
    Cycle,
}

impl SceneScript {
    pub fn scene_at(&self, frame_count: u64) -> Scene {
        match self {
            SceneScript::Fixed(scene) => *scene,
            SceneScript::Cycle => match frame_count % 120 {
                0..=59 => Scene::Attentive,
                60..=104 => Scene::LookingAway,
                _ => Scene::Absent,
            },
        }
    }
}

/// Paint one frame of `scene`.
pub fn render(scene: Scene, width: u32, height: u32) -> Image {
    let mut image = Image::filled(width, height, BACKGROUND_COLOR);
    let w = width as i32;
    let h = height as i32;

    match scene {
        Scene::Absent => {}
        Scene::Attentive | Scene::Phone => {
            let face = BoundingBox::new(w * 35 / 100, h * 20 / 100, w * 65 / 100, h * 75 / 100);
            paint_face(&mut image, &face, 0);
            if scene == Scene::Phone {
                let phone =
                    BoundingBox::new(w * 80 / 100, h * 70 / 100, w * 90 / 100, h * 95 / 100);
                image.fill_rect(&phone, PHONE_COLOR);
            }
        }
        Scene::LookingAway => {
            let face = BoundingBox::new(w * 2 / 100, h * 25 / 100, w * 24 / 100, h * 70 / 100);
            paint_face(&mut image, &face, face.height() / 6);
        }
    }
    image
}

/// Face with two eyes; `tilt` lowers the right eye by that many pixels.
fn paint_face(image: &mut Image, face: &BoundingBox, tilt: i32) {
    image.fill_rect(face, FACE_COLOR);

    let eye_w = (face.width() / 6).max(2);
    let eye_h = (face.height() / 12).max(2);
    let eye_y = face.y1 + face.height() * 35 / 100;
    let left_x = face.x1 + face.width() * 25 / 100;
    let right_x = face.x1 + face.width() * 75 / 100 - eye_w;

    image.fill_rect(
        &BoundingBox::new(left_x, eye_y, left_x + eye_w, eye_y + eye_h),
        EYE_COLOR,
    );
    image.fill_rect(
        &BoundingBox::new(right_x, eye_y + tilt, right_x + eye_w, eye_y + tilt + eye_h),
        EYE_COLOR,
    );
}
