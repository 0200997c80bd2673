//! Pipeline error taxonomy.
//!
//! Every variant here is recoverable at a narrow scope (one frame, one camera,
//! one `start()` call). None of them is allowed to take the supervisor down.

use thiserror::Error;

use crate::CameraId;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Camera stream could not be opened. The camera is marked stopped.
    #[error("failed to connect to camera source {url:?}: {reason}")]
    ConnectFailed { url: String, reason: String },

    /// A single frame could not be decoded. The frame is skipped.
    #[error("failed to decode frame from camera {camera_id}: {reason}")]
    DecodeFailed { camera_id: CameraId, reason: String },

    /// The stream went away after a successful connect. Triggers a reconnect.
    #[error("camera {camera_id} disconnected: {reason}")]
    Disconnected { camera_id: CameraId, reason: String },

    /// A detector, locator or embedder failed. The frame has zero detections.
    #[error("model inference failed in {backend}: {source}")]
    ModelInferenceFailed {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Rejected configuration or lifecycle request (e.g. start with no cameras).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Lifecycle request that requires `Idle` was made while `Running`.
    #[error("pipeline is already running")]
    AlreadyRunning,
}

impl PipelineError {
    pub fn connect_failed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn inference(backend: &'static str, source: anyhow::Error) -> Self {
        Self::ModelInferenceFailed { backend, source }
    }

    /// True for errors the camera loop answers with a reconnect.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}
