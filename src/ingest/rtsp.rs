//! Network camera source.
//!
//! `RtspSource` opens an exam-room IP camera and yields packed RGB8 images.
//! Real streams go through GStreamer (feature `rtsp-gstreamer`); without the
//! feature, `connect()` on an `rtsp://` URL fails and the camera worker
//! eventually marks that camera failed.
//!
//! URLs starting with `stub://` are served by a synthetic backend that paints
//! exam scenes (see `synthetic`). Query parameters select the behaviour:
//! `stub://front?scene=away`, `stub://front?fail=connect`,
//! `stub://front?disconnect_after=40`.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;

use super::synthetic::{self, Scene, SceneScript};
use super::{CaptureError, FrameSource};
use crate::frame::Image;

/// Per-camera stream settings.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Stream URL, `rtsp://...` or `stub://...`.
    pub url: String,
    /// Target frame rate (frames per second). Synthetic streams are paced to it.
    pub target_fps: u32,
    /// Frame width (for synthetic frames).
    pub width: u32,
    /// Frame height (for synthetic frames).
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic backend for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
    /// No decoder compiled in for this URL; every connect fails.
    #[cfg(not(feature = "rtsp-gstreamer"))]
    Unavailable { url: String },
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Self {
        if config.url.starts_with("stub://") {
            return Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            };
        }

        #[cfg(feature = "rtsp-gstreamer")]
        {
            Self {
                backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)),
            }
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Self {
                backend: RtspBackend::Unavailable { url: config.url },
            }
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> RtspStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            RtspBackend::Unavailable { url } => RtspStats {
                frames_captured: 0,
                url: url.clone(),
            },
        }
    }
}

impl FrameSource for RtspSource {
    fn location(&self) -> String {
        self.stats().url
    }

    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            RtspBackend::Unavailable { url } => Err(anyhow!(
                "cannot open {}: RTSP requires the rtsp-gstreamer feature",
                url
            )),
        }
    }

    fn next_frame(&mut self) -> Result<Image, CaptureError> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            RtspBackend::Unavailable { .. } => Err(CaptureError::Disconnected(anyhow!(
                "source was never connected"
            ))),
        }
    }

    fn disconnect(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.disconnect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.disconnect(),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            RtspBackend::Unavailable { .. } => {}
        }
    }
}

/// Capture counters of one source.
#[derive(Clone, Debug)]
pub struct RtspStats {
    pub frames_captured: u64,
    pub url: String,
}

// stub:// scenes

struct SyntheticRtspSource {
    config: RtspConfig,
    script: SceneScript,
    fail_connect: bool,
    disconnect_after: Option<u64>,
    connected: bool,
    frame_count: u64,
    frames_since_connect: u64,
    next_due: Option<Instant>,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        let mut script = SceneScript::Cycle;
        let mut fail_connect = false;
        let mut disconnect_after = None;
        for (key, value) in query_pairs(&config.url) {
            match key {
                "scene" => match Scene::parse(value) {
                    Some(scene) => script = SceneScript::Fixed(scene),
                    None => log::warn!("RtspSource: unknown synthetic scene {:?}", value),
                },
                "fail" => fail_connect = value == "connect",
                "disconnect_after" => disconnect_after = value.parse().ok(),
                _ => {}
            }
        }
        Self {
            config,
            script,
            fail_connect,
            disconnect_after,
            connected: false,
            frame_count: 0,
            frames_since_connect: 0,
            next_due: None,
        }
    }

    /// Connect to the synthetic stream.
    fn connect(&mut self) -> Result<()> {
        if self.fail_connect {
            return Err(anyhow!("synthetic connect failure for {}", self.config.url));
        }
        self.connected = true;
        self.frames_since_connect = 0;
        self.next_due = None;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Image, CaptureError> {
        if !self.connected {
            return Err(CaptureError::Disconnected(anyhow!("not connected")));
        }
        if self
            .disconnect_after
            .is_some_and(|limit| self.frames_since_connect >= limit)
        {
            self.connected = false;
            return Err(CaptureError::Disconnected(anyhow!(
                "synthetic stream dropped after {} frames",
                self.frames_since_connect
            )));
        }

        self.pace();
        let scene = self.script.scene_at(self.frame_count);
        self.frame_count += 1;
        self.frames_since_connect += 1;
        Ok(synthetic::render(scene, self.config.width, self.config.height))
    }

    /// Sleep until the next frame is due, like a real camera's capture cadence.
    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_secs(1) / self.config.target_fps;
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);
    }

    fn disconnect(&mut self) {
        if self.connected {
            log::info!("RtspSource: released {} (synthetic)", self.config.url);
        }
        self.connected = false;
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

fn query_pairs(url: &str) -> impl Iterator<Item = (&str, &str)> {
    url.split_once('?')
        .map(|(_, query)| query)
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
}

// GStreamer

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    frame_count: u64,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            pipeline: None,
            frame_count: 0,
        }
    }

    /// Build and start: rtspsrc ! decodebin ! videoconvert ! appsink (RGB).
    fn connect(&mut self) -> Result<()> {
        gstreamer::init().context("gstreamer init failed")?;
        self.disconnect();

        let launch = format!(
            "rtspsrc location={url} latency=0 ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=frames sync=false max-buffers=1 drop=true",
            url = self.config.url
        );
        let pipeline = gstreamer::parse::launch(&launch)
            .with_context(|| format!("cannot build capture pipeline for {}", self.config.url))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline has unexpected type"))?;

        let appsink = pipeline
            .by_name("frames")
            .context("capture pipeline has no appsink")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("camera stream {} refused to play", self.config.url))?;
        self.pipeline = Some((pipeline, appsink));
        log::info!("camera stream {} playing", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Image, CaptureError> {
        let timeout = self.frame_timeout();
        let Some((pipeline, appsink)) = self.pipeline.as_ref() else {
            return Err(CaptureError::Disconnected(anyhow!("not connected")));
        };
        if let Some(reason) = poll_bus(pipeline) {
            return Err(CaptureError::Disconnected(anyhow!(reason)));
        }

        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| {
                CaptureError::Disconnected(anyhow!("no frame within the read timeout"))
            })?;
        let image = sample_to_image(&sample).map_err(CaptureError::Decode)?;
        self.frame_count += 1;
        Ok(image)
    }

    fn disconnect(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("failed to release camera stream {}: {}", self.config.url, e);
            }
        }
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn poll_bus(pipeline: &gstreamer::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Error(err) => {
                return Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
            MessageView::Eos(..) => return Some("gstreamer reached EOS".to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<Image> {
    let buffer = sample.buffer().context("sample without buffer")?;
    let caps = sample.caps().context("sample without caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("sample caps are not raw video")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("buffer not readable")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Image::from_rgb(width, height, data.to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("row exceeds buffer")?);
    }
    Image::from_rgb(width, height, pixels)
}
