//! Frame ingestion sources.
//!
//! This module provides the camera side of the pipeline:
//! - `FrameSource`: the capture boundary (connect, read, release)
//! - `RtspSource`: RTSP streams via GStreamer (feature: rtsp-gstreamer), with a
//!   synthetic backend for `stub://` URLs
//! - `CameraWorker` / `CameraHandle`: the per-camera capture loop that pushes
//!   frames into the shared frame channel, reconnecting with backoff
//!
//! Camera failures stay inside the camera: they are logged and at worst mark
//! that camera stopped. Nothing here can abort the rest of the pipeline.

pub mod camera;
pub mod rtsp;
pub mod synthetic;

use thiserror::Error;

use crate::frame::Image;

pub use camera::{
    CameraCounters, CameraHandle, CameraSettings, CameraState, CameraStats, CameraWorker,
};
pub use rtsp::{RtspConfig, RtspSource};
pub use synthetic::Scene;

/// Errors a source reports while reading frames.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// One bad frame; the stream is still usable.
    #[error("frame decode failed: {0}")]
    Decode(#[source] anyhow::Error),
    /// The stream is gone; the camera loop reconnects.
    #[error("stream disconnected: {0}")]
    Disconnected(#[source] anyhow::Error),
}

/// Capture boundary for one camera.
///
/// `next_frame` may block on external I/O, but implementations must return
/// within a bounded time (a read timeout or one frame interval) so that a stop
/// request is observed promptly.
pub trait FrameSource: Send {
    /// Location used in logs (URL or device path).
    fn location(&self) -> String;

    /// Open the underlying stream.
    fn connect(&mut self) -> anyhow::Result<()>;

    /// Capture the next frame.
    fn next_frame(&mut self) -> Result<Image, CaptureError>;

    /// Release the underlying stream. Must be safe to call when not connected.
    fn disconnect(&mut self);
}

/// Open the source for a camera URL.
///
/// Construction never touches the network; connection problems surface from
/// `connect()` inside the camera loop.
pub fn open_source(url: &str, template: &RtspConfig) -> Box<dyn FrameSource> {
    let config = RtspConfig {
        url: url.to_string(),
        ..template.clone()
    };
    Box::new(RtspSource::new(config))
}
