//! Captured media types.
//!
//! - `Image`: owned RGB8 pixel buffer with crop support for face embedding.
//! - `Frame`: one captured image tagged with camera id, per-camera sequence and
//!   capture time. Frames are immutable once captured and are moved (never
//!   cloned) through the frame channel into the processing stage.

use anyhow::{anyhow, Result};
use std::time::SystemTime;

use crate::detect::BoundingBox;
use crate::CameraId;

/// Bytes per pixel for the only layout the pipeline carries (packed RGB8).
pub const CHANNELS: usize = 3;

/// Owned RGB8 image.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel payloads are large; never dump them into logs.
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Image {
    /// Wrap an RGB8 buffer. Fails when the length does not match the dimensions.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
            .ok_or_else(|| anyhow!("image dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Solid-colour image.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel area in square pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        self.data[idx..idx + CHANNELS].copy_from_slice(&rgb);
    }

    /// Fill an axis-aligned region, clipped to the image.
    pub fn fill_rect(&mut self, bbox: &BoundingBox, rgb: [u8; 3]) {
        let Some(clipped) = bbox.clamp_to(self.width, self.height) else {
            return;
        };
        for y in clipped.y1..clipped.y2 {
            for x in clipped.x1..clipped.x2 {
                self.set_pixel(x as u32, y as u32, rgb);
            }
        }
    }

    /// Copy out a region. Returns `None` when the box misses the image entirely.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<Image> {
        let clipped = bbox.clamp_to(self.width, self.height)?;
        let w = clipped.width() as usize;
        let h = clipped.height() as usize;
        let row_bytes = self.width as usize * CHANNELS;
        let mut data = Vec::with_capacity(w * h * CHANNELS);
        for y in clipped.y1 as usize..clipped.y2 as usize {
            let start = y * row_bytes + clipped.x1 as usize * CHANNELS;
            data.extend_from_slice(&self.data[start..start + w * CHANNELS]);
        }
        Some(Image {
            width: w as u32,
            height: h as u32,
            data,
        })
    }

    pub fn into_rgb(self) -> Vec<u8> {
        self.data
    }
}

/// One captured frame.
///
/// No `Clone`: ownership moves from the camera to the channel to the
/// processing stage, which holds it exclusively for the duration of analysis.
#[derive(Debug)]
pub struct Frame {
    pub camera_id: CameraId,
    /// Monotonic per camera, starting at 1. Dropped frames leave gaps.
    pub sequence: u64,
    pub captured_at: SystemTime,
    image: Image,
}

impl Frame {
    pub fn new(camera_id: CameraId, sequence: u64, image: Image) -> Self {
        Self {
            camera_id,
            sequence,
            captured_at: SystemTime::now(),
            image,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    /// Release the pixels for annotation once analysis is finished.
    pub fn into_image(self) -> Image {
        self.image
    }
}
