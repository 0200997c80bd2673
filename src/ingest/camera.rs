//! Per-camera capture loop.
//!
//! Each registered camera gets one `CameraWorker` thread per pipeline run. The
//! worker connects (retrying with exponential backoff), pushes every captured
//! frame into the shared frame channel without blocking, and reconnects when
//! the stream drops. Stop is signalled by dropping the handle's shutdown
//! sender, which also wakes a worker sleeping between connection attempts.

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{CaptureError, FrameSource};
use crate::channel::{Producer, PushOutcome};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::CameraId;

/// Frames a session must deliver before its retry budget is refilled.
pub const STABLE_SESSION_FRAMES: u64 = 30;

/// Back-to-back decode failures treated as a dropped stream.
pub const DECODE_ERROR_LIMIT: u32 = 10;

#[derive(Clone, Debug)]
pub struct CameraSettings {
    /// Consecutive failed connects or early drops tolerated before the
    /// camera gives up.
    pub reconnect_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// How long `CameraHandle::stop` waits for the worker thread.
    pub stop_timeout: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl CameraSettings {
    /// Delay before retry number `attempt` (0-based), with up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .backoff_initial
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.backoff_max);
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CameraState {
    Idle = 0,
    Connecting = 1,
    Streaming = 2,
    Reconnecting = 3,
    Stopped = 4,
    /// Retries exhausted; the camera stays down until the next start.
    Failed = 5,
}

impl CameraState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Reconnecting,
            4 => Self::Stopped,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Counters shared between a camera worker and whoever monitors it.
#[derive(Debug, Default)]
pub struct CameraCounters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
    state: AtomicU8,
}

impl CameraCounters {
    pub fn state(&self) -> CameraState {
        CameraState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: CameraState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CameraStats {
        CameraStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            state: self.state(),
        }
    }
}

/// Point-in-time view of a camera's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CameraStats {
    pub frames_captured: u64,
    /// Frames discarded because the frame channel was full.
    pub frames_dropped: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
    pub state: CameraState,
}

impl CameraStats {
    pub fn is_healthy(&self) -> bool {
        self.state == CameraState::Streaming
    }
}

pub struct CameraWorker {
    camera_id: CameraId,
    source: Box<dyn FrameSource>,
    frames: Producer<Frame>,
    shutdown: Receiver<()>,
    settings: CameraSettings,
    counters: Arc<CameraCounters>,
}

impl CameraWorker {
    /// Run until stopped, the frame channel closes, or retries are exhausted.
    ///
    /// Connect failures and stream drops share one retry budget; it is only
    /// refilled once a session has delivered `STABLE_SESSION_FRAMES` frames.
    /// Returns the source, released, so it can be reused by the next run.
    pub fn run(mut self) -> Box<dyn FrameSource> {
        let location = self.source.location();
        let mut sequence: u64 = 0;
        let mut failures: u32 = 0;

        'session: loop {
            if !self.connect_with_backoff(&location, &mut failures) {
                break;
            }
            let mut session_frames: u64 = 0;
            let mut decode_streak: u32 = 0;

            loop {
                if self.stop_requested() {
                    break 'session;
                }
                let drop_reason = match self.source.next_frame() {
                    Ok(image) => {
                        // A worker detached by `stop` must not refill drained channels.
                        if self.stop_requested() {
                            break 'session;
                        }
                        decode_streak = 0;
                        session_frames += 1;
                        if session_frames == STABLE_SESSION_FRAMES {
                            failures = 0;
                        }
                        sequence += 1;
                        self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
                        match self.frames.push(Frame::new(self.camera_id, sequence, image)) {
                            PushOutcome::Queued => {}
                            PushOutcome::Dropped => {
                                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                                log::debug!(
                                    "camera {}: frame {} dropped, queue full",
                                    self.camera_id,
                                    sequence
                                );
                            }
                            PushOutcome::Closed => break 'session,
                        }
                        continue;
                    }
                    Err(CaptureError::Decode(err)) => {
                        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                        let err = PipelineError::DecodeFailed {
                            camera_id: self.camera_id,
                            reason: format!("{:#}", err),
                        };
                        log::warn!("{}", err);
                        decode_streak += 1;
                        if decode_streak < DECODE_ERROR_LIMIT {
                            continue;
                        }
                        format!("{} consecutive undecodable frames", decode_streak)
                    }
                    Err(CaptureError::Disconnected(err)) => format!("{:#}", err),
                };

                let err = PipelineError::Disconnected {
                    camera_id: self.camera_id,
                    reason: drop_reason,
                };
                self.source.disconnect();
                failures += 1;
                if failures > self.settings.reconnect_attempts {
                    log::error!(
                        "camera {}: {} (giving up after {} failed attempts)",
                        self.camera_id,
                        err,
                        failures
                    );
                    self.counters.set_state(CameraState::Failed);
                    break 'session;
                }
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                self.counters.set_state(CameraState::Reconnecting);
                let delay = self.settings.backoff(failures - 1);
                log::warn!("{}; reconnecting in {:?}", err, delay);
                if !self.pause(delay) {
                    break 'session;
                }
                continue 'session;
            }
        }

        self.source.disconnect();
        if self.counters.state() != CameraState::Failed {
            self.counters.set_state(CameraState::Stopped);
        }
        log::info!("camera {} ({}) capture loop exited", self.camera_id, location);
        self.source
    }

    fn stop_requested(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `delay` unless stopped first. Returns false when stopped.
    fn pause(&self, delay: Duration) -> bool {
        matches!(
            self.shutdown.recv_timeout(delay),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn connect_with_backoff(&mut self, location: &str, failures: &mut u32) -> bool {
        loop {
            if self.stop_requested() {
                return false;
            }
            if self.counters.state() != CameraState::Reconnecting {
                self.counters.set_state(CameraState::Connecting);
            }
            let err = match self.source.connect() {
                Ok(()) => {
                    self.counters.set_state(CameraState::Streaming);
                    log::info!("camera {} streaming from {}", self.camera_id, location);
                    return true;
                }
                Err(err) => PipelineError::connect_failed(location, format!("{:#}", err)),
            };

            *failures += 1;
            if *failures > self.settings.reconnect_attempts {
                log::error!(
                    "camera {}: {} (giving up after {} failed attempts)",
                    self.camera_id,
                    err,
                    failures
                );
                self.counters.set_state(CameraState::Failed);
                return false;
            }
            let delay = self.settings.backoff(*failures - 1);
            log::warn!("camera {}: {}; retrying in {:?}", self.camera_id, err, delay);
            if !self.pause(delay) {
                return false;
            }
        }
    }
}

/// Owner-side handle to a running camera worker.
pub struct CameraHandle {
    camera_id: CameraId,
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<Box<dyn FrameSource>>>,
}

impl CameraHandle {
    /// Spawn the capture thread for `source`.
    pub fn spawn(
        camera_id: CameraId,
        source: Box<dyn FrameSource>,
        frames: Producer<Frame>,
        settings: CameraSettings,
        counters: Arc<CameraCounters>,
    ) -> Result<CameraHandle> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        counters.set_state(CameraState::Connecting);
        let worker = CameraWorker {
            camera_id,
            source,
            frames,
            shutdown: shutdown_rx,
            settings,
            counters,
        };
        let join = std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || worker.run())
            .map_err(|e| anyhow!("spawn capture thread for camera {}: {}", camera_id, e))?;
        Ok(CameraHandle {
            camera_id,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Signal the worker without waiting for it.
    pub fn request_stop(&mut self) {
        self.shutdown.take();
    }

    /// Signal the worker and wait up to `timeout` for it to exit.
    ///
    /// Returns the released source, or `None` if the worker did not finish in
    /// time (it is left detached) or panicked.
    pub fn stop(mut self, timeout: Duration) -> Option<Box<dyn FrameSource>> {
        self.request_stop();
        let join = self.join.take()?;
        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "camera {} did not stop within {:?}; detaching",
                    self.camera_id,
                    timeout
                );
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        match join.join() {
            Ok(source) => Some(source),
            Err(_) => {
                log::error!("camera {} capture thread panicked", self.camera_id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::frame::Image;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        connects: u32,
        disconnects: u32,
        frames: u32,
    }

    /// Source whose behaviour is driven by a closure over the frame count.
    struct ScriptedSource {
        script: Arc<Mutex<Script>>,
        fail_connects: u32,
        on_frame: fn(u32) -> Result<Image, CaptureError>,
    }

    impl FrameSource for ScriptedSource {
        fn location(&self) -> String {
            "scripted://test".to_string()
        }

        fn connect(&mut self) -> anyhow::Result<()> {
            let mut script = self.script.lock().unwrap();
            script.connects += 1;
            if script.connects <= self.fail_connects {
                return Err(anyhow!("refused"));
            }
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Image, CaptureError> {
            let n = {
                let mut script = self.script.lock().unwrap();
                script.frames += 1;
                script.frames
            };
            std::thread::sleep(Duration::from_millis(1));
            (self.on_frame)(n)
        }

        fn disconnect(&mut self) {
            self.script.lock().unwrap().disconnects += 1;
        }
    }

    fn fast_settings() -> CameraSettings {
        CameraSettings {
            reconnect_attempts: 2,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn frames_flow_with_increasing_sequence_and_stop_releases_once() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script: script.clone(),
            fail_connects: 0,
            on_frame: |_| Ok(Image::filled(4, 4, [0, 0, 0])),
        };
        let (tx, rx) = channel::bounded(64);
        let counters = Arc::new(CameraCounters::default());
        let handle =
            CameraHandle::spawn(7, Box::new(source), tx, fast_settings(), counters.clone())
                .unwrap();

        wait_for(|| rx.len() >= 3);
        assert!(handle.stop(Duration::from_secs(2)).is_some());

        let frames: Vec<Frame> = std::iter::from_fn(|| rx.try_pop()).collect();
        assert!(frames.len() >= 3);
        assert!(frames.iter().all(|f| f.camera_id == 7));
        assert!(frames.windows(2).all(|w| w[1].sequence > w[0].sequence));
        assert_eq!(frames[0].sequence, 1);

        let script = script.lock().unwrap();
        assert_eq!(script.connects, 1);
        assert_eq!(script.disconnects, 1);
        assert_eq!(counters.state(), CameraState::Stopped);
    }

    #[test]
    fn full_queue_counts_drops_without_blocking() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script,
            fail_connects: 0,
            on_frame: |_| Ok(Image::filled(2, 2, [0, 0, 0])),
        };
        let (tx, rx) = channel::bounded(2);
        let counters = Arc::new(CameraCounters::default());
        let handle =
            CameraHandle::spawn(1, Box::new(source), tx, fast_settings(), counters.clone())
                .unwrap();

        wait_for(|| counters.snapshot().frames_dropped >= 3);
        handle.stop(Duration::from_secs(2));
        assert_eq!(rx.len(), 2);
        let kept: Vec<u64> = std::iter::from_fn(|| rx.try_pop()).map(|f| f.sequence).collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn decode_errors_skip_and_disconnects_reconnect() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script: script.clone(),
            fail_connects: 0,
            on_frame: |n| match n {
                2 => Err(CaptureError::Decode(anyhow!("corrupt"))),
                4 => Err(CaptureError::Disconnected(anyhow!("eof"))),
                _ => Ok(Image::filled(2, 2, [0, 0, 0])),
            },
        };
        let (tx, rx) = channel::bounded(64);
        let counters = Arc::new(CameraCounters::default());
        let handle =
            CameraHandle::spawn(3, Box::new(source), tx, fast_settings(), counters.clone())
                .unwrap();

        wait_for(|| rx.len() >= 4);
        handle.stop(Duration::from_secs(2));

        let stats = counters.snapshot();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.reconnects, 1);
        let script = script.lock().unwrap();
        assert_eq!(script.connects, 2);
        // One release for the dropped stream, one at exit.
        assert_eq!(script.disconnects, 2);
    }

    #[test]
    fn exhausted_retries_mark_camera_failed() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script: script.clone(),
            fail_connects: u32::MAX,
            on_frame: |_| Ok(Image::filled(2, 2, [0, 0, 0])),
        };
        let (tx, rx) = channel::bounded(4);
        let counters = Arc::new(CameraCounters::default());
        let handle =
            CameraHandle::spawn(9, Box::new(source), tx, fast_settings(), counters.clone())
                .unwrap();

        wait_for(|| counters.state() == CameraState::Failed);
        assert!(handle.stop(Duration::from_secs(2)).is_some());
        assert!(rx.is_empty());
        assert_eq!(script.lock().unwrap().connects, 3);
        assert_eq!(counters.state(), CameraState::Failed);
    }

    #[test]
    fn stop_interrupts_backoff_sleep() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script,
            fail_connects: u32::MAX,
            on_frame: |_| Ok(Image::filled(2, 2, [0, 0, 0])),
        };
        let settings = CameraSettings {
            reconnect_attempts: 10,
            backoff_initial: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(2),
        };
        let (tx, _rx) = channel::bounded(4);
        let counters = Arc::new(CameraCounters::default());
        let handle = CameraHandle::spawn(2, Box::new(source), tx, settings, counters).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        assert!(handle.stop(Duration::from_secs(2)).is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stream_dropping_right_after_connect_backs_off_then_fails() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script: script.clone(),
            fail_connects: 0,
            on_frame: |_| Err(CaptureError::Disconnected(anyhow!("reset by peer"))),
        };
        let settings = CameraSettings {
            reconnect_attempts: 2,
            backoff_initial: Duration::from_millis(40),
            backoff_max: Duration::from_millis(200),
            stop_timeout: Duration::from_secs(2),
        };
        let (tx, rx) = channel::bounded(4);
        let counters = Arc::new(CameraCounters::default());
        let started = Instant::now();
        let handle = CameraHandle::spawn(4, Box::new(source), tx, settings, counters.clone())
            .unwrap();

        wait_for(|| counters.state() == CameraState::Failed);
        // Two reconnect delays: 40ms, then 80ms (jitter only adds).
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert!(handle.stop(Duration::from_secs(2)).is_some());

        assert!(rx.is_empty());
        let stats = counters.snapshot();
        assert_eq!(stats.reconnects, 2);
        assert_eq!(stats.state, CameraState::Failed);
        let script = script.lock().unwrap();
        assert_eq!(script.connects, 3);
        assert_eq!(script.frames, 3);
    }

    #[test]
    fn stable_session_refills_the_retry_budget() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script: script.clone(),
            fail_connects: 0,
            // Drops after every 40 good frames, so each session is stable.
            on_frame: |n| {
                if n % 41 == 0 {
                    Err(CaptureError::Disconnected(anyhow!("eof")))
                } else {
                    Ok(Image::filled(2, 2, [0, 0, 0]))
                }
            },
        };
        let (tx, _rx) = channel::bounded(4);
        let counters = Arc::new(CameraCounters::default());
        let handle =
            CameraHandle::spawn(5, Box::new(source), tx, fast_settings(), counters.clone())
                .unwrap();

        wait_for(|| counters.snapshot().reconnects >= 4);
        assert_ne!(counters.state(), CameraState::Failed);
        assert!(handle.stop(Duration::from_secs(2)).is_some());
        assert_eq!(counters.state(), CameraState::Stopped);
    }

    #[test]
    fn persistent_decode_errors_count_as_a_dropped_stream() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script: script.clone(),
            fail_connects: 0,
            on_frame: |_| Err(CaptureError::Decode(anyhow!("garbled"))),
        };
        let settings = CameraSettings {
            reconnect_attempts: 1,
            ..fast_settings()
        };
        let (tx, _rx) = channel::bounded(4);
        let counters = Arc::new(CameraCounters::default());
        let handle =
            CameraHandle::spawn(6, Box::new(source), tx, settings, counters.clone()).unwrap();

        wait_for(|| counters.state() == CameraState::Failed);
        handle.stop(Duration::from_secs(2));
        let stats = counters.snapshot();
        assert_eq!(stats.decode_errors, 2 * DECODE_ERROR_LIMIT as u64);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(script.lock().unwrap().connects, 2);
    }

    #[test]
    fn frame_read_after_stop_is_not_pushed() {
        let script = Arc::new(Mutex::new(Script::default()));
        let source = ScriptedSource {
            script,
            fail_connects: 0,
            // Slower than the stop timeout below, so the worker gets detached.
            on_frame: |_| {
                std::thread::sleep(Duration::from_millis(150));
                Ok(Image::filled(2, 2, [0, 0, 0]))
            },
        };
        let (tx, rx) = channel::bounded(4);
        let counters = Arc::new(CameraCounters::default());
        let handle =
            CameraHandle::spawn(8, Box::new(source), tx, fast_settings(), counters.clone())
                .unwrap();

        wait_for(|| counters.state() == CameraState::Streaming);
        std::thread::sleep(Duration::from_millis(20));
        assert!(handle.stop(Duration::from_millis(10)).is_none());
        rx.drain();

        wait_for(|| counters.state() == CameraState::Stopped);
        assert!(rx.is_empty());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let settings = CameraSettings {
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(500),
            ..CameraSettings::default()
        };
        let first = settings.backoff(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = settings.backoff(2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let capped = settings.backoff(10);
        assert!(capped >= Duration::from_millis(500) && capped <= Duration::from_millis(625));
    }
}
