//! Exam Sentinel
//!
//! Real-time, multi-camera exam monitoring: live frames are analysed for face
//! detection, recognition against a known-student gallery and gaze direction,
//! and a debounced integrity verdict ("is this exam-taker looking away, absent
//! or replaced?") is produced per camera together with annotated frames.
//!
//! # Architecture
//!
//! ```text
//! cameras ──► frame channel ──► processing ──► result channel ──► distribution ──► sinks
//! (thread     (bounded,          (one thread)   (bounded,          (one thread)
//!  each)       drop-newest)                      drop-newest)
//! ```
//!
//! The pipeline enforces these properties by construction:
//!
//! 1. **Bounded memory**: both channels have a fixed capacity; producers never
//!    block, and when a channel is full the item being pushed is dropped and
//!    counted.
//! 2. **Isolation**: a camera failing to connect, decode or stay connected
//!    never affects other cameras; a failing sink never affects other sinks;
//!    a failing model leaves the frame with no detections.
//! 3. **Debounced verdicts**: gaze is smoothed by a hysteresis counter and the
//!    cheating flag by a consecutive-check counter, so single bad frames never
//!    flip a verdict.
//! 4. **Scoped lifecycle**: `stop()` leaves no threads or open sources behind,
//!    and scoped usage guarantees it runs.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (RTSP, synthetic `stub://`) and camera workers
//! - `channel`, `frame`: the bounded drop-newest channel and captured media
//! - `detect`: model boundaries, synthetic backends, known-face gallery
//! - `gaze`, `monitor`: gaze classification, hysteresis, cheating state
//! - `process`: the processing stage
//! - `annotate`, `sink`: frame annotation and result distribution
//! - `pipeline`: the supervisor
//! - `config`: `SentinelConfig` (file + environment)

pub mod annotate;
pub mod channel;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod gaze;
pub mod ingest;
pub mod monitor;
pub mod pipeline;
pub mod process;
pub mod sink;

/// Camera identifier, unique within a pipeline.
pub type CameraId = u32;

pub use channel::{ChannelStats, PushOutcome};
pub use config::SentinelConfig;
pub use detect::{
    BoundingBox, Detection, Gallery, RecognitionMatch, StubBackend, VisionBackends,
};
pub use error::PipelineError;
pub use frame::{Frame, Image};
pub use gaze::{GazeDebouncer, GazeObservation, GazeSample};
pub use ingest::{
    CameraState, CameraStats, CaptureError, FrameSource, RtspConfig, RtspSource,
};
pub use monitor::{CheatingInterval, CheatingSnapshot, CheatingState, MonitorSession};
pub use pipeline::{CameraInfo, Pipeline, PipelineGuard, PipelineSettings};
pub use process::{AnalysisResult, ProcessingStats};
pub use sink::{DisplayBoard, DisplaySink, EmitSink, ResultSink};
