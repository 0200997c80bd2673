use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use exam_sentinel::channel;
use exam_sentinel::{
    AnalysisResult, CameraState, CaptureError, DisplaySink, FrameSource, Image, Pipeline,
    PipelineError, PipelineSettings, PushOutcome, ResultSink,
};

static PIPELINE_LOCK: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    PIPELINE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.rtsp.target_fps = 100;
    settings.rtsp.width = 160;
    settings.rtsp.height = 120;
    settings.camera.reconnect_attempts = 1;
    settings.camera.backoff_initial = Duration::from_millis(1);
    settings.camera.backoff_max = Duration::from_millis(2);
    settings
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct SourceLog {
    connects: AtomicU32,
    disconnects: AtomicU32,
}

/// Blank frames at a fixed cadence, recording lifecycle calls.
struct RecordingSource {
    log: Arc<SourceLog>,
}

impl FrameSource for RecordingSource {
    fn location(&self) -> String {
        "recording://desk".to_string()
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Image, CaptureError> {
        thread::sleep(Duration::from_millis(1));
        Ok(Image::filled(64, 48, [30, 30, 30]))
    }

    fn disconnect(&mut self) {
        self.log.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink that blocks until released, so the result channel fills up.
struct StallingSink {
    gate: Arc<Mutex<()>>,
}

impl ResultSink for StallingSink {
    fn name(&self) -> &str {
        "stalling"
    }

    fn accept(&mut self, _result: &AnalysisResult) -> anyhow::Result<()> {
        let _open = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        Ok(())
    }
}

#[test]
fn start_with_zero_cameras_returns_false_and_stays_idle() {
    let _serial = serial();
    let mut pipeline = Pipeline::new(settings());
    assert!(!pipeline.start());
    assert!(!pipeline.is_running());
}

#[test]
fn second_start_returns_false_and_keeps_running() {
    let _serial = serial();
    let mut pipeline = Pipeline::new(settings());
    pipeline.add_camera("stub://hall?scene=attentive", None, None).unwrap();

    assert!(pipeline.start());
    assert!(!pipeline.start());
    assert!(pipeline.is_running());
    pipeline.stop();
    assert!(!pipeline.is_running());
}

#[test]
fn stop_drains_channels_and_releases_each_source_once() {
    let _serial = serial();
    let mut settings = settings();
    settings.queue_size = 4;
    let mut pipeline = Pipeline::new(settings);

    let logs: Vec<Arc<SourceLog>> = (0..3).map(|_| Arc::new(SourceLog::default())).collect();
    for log in &logs {
        pipeline
            .add_source(Box::new(RecordingSource { log: log.clone() }), None, None)
            .unwrap();
    }
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();
    pipeline.add_sink(Box::new(StallingSink { gate: gate.clone() }));

    assert!(pipeline.start());
    // The stalled sink backs up the result channel; processing keeps going
    // and drops the newest results instead of blocking.
    wait_until("result channel to fill", || pipeline.pending_results() == 4);
    wait_until("results to be dropped", || {
        pipeline.processing_stats().results_dropped > 0
    });

    drop(held);
    pipeline.stop();

    assert!(!pipeline.is_running());
    assert_eq!(pipeline.pending_frames(), 0);
    assert_eq!(pipeline.pending_results(), 0);
    for log in &logs {
        assert_eq!(log.connects.load(Ordering::SeqCst), 1);
        assert_eq!(log.disconnects.load(Ordering::SeqCst), 1);
    }
    for info in pipeline.cameras() {
        assert_eq!(info.stats.state, CameraState::Stopped);
        assert!(info.stats.frames_captured > 0);
    }
}

#[test]
fn camera_ids_auto_assign_around_explicit_ones() {
    let mut pipeline = Pipeline::new(settings());
    let auto: Vec<u32> = (0..3)
        .map(|_| pipeline.add_camera("stub://row", None, None).unwrap())
        .collect();
    assert_eq!(auto, vec![0, 1, 2]);
    assert_eq!(pipeline.add_camera("stub://row", Some(5), None).unwrap(), 5);

    let more: Vec<u32> = (0..3)
        .map(|_| pipeline.add_camera("stub://row", None, None).unwrap())
        .collect();
    assert_eq!(more, vec![3, 4, 6]);
    assert_eq!(pipeline.camera_ids(), vec![0, 1, 2, 3, 4, 5, 6]);
}

#[test]
fn cameras_cannot_be_added_while_running() {
    let _serial = serial();
    let mut pipeline = Pipeline::new(settings());
    pipeline.add_camera("stub://a", None, None).unwrap();
    assert!(pipeline.start());
    let err = pipeline.add_camera("stub://b", None, None).unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyRunning));
    pipeline.stop();
    assert_eq!(pipeline.add_camera("stub://b", None, None).unwrap(), 1);
}

#[test]
fn bounded_channel_keeps_first_items_without_blocking() {
    let (tx, rx) = channel::bounded::<u32>(2);
    let started = Instant::now();
    let outcomes: Vec<PushOutcome> = (1..=5).map(|n| tx.push(n)).collect();
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(
        outcomes,
        vec![
            PushOutcome::Queued,
            PushOutcome::Queued,
            PushOutcome::Dropped,
            PushOutcome::Dropped,
            PushOutcome::Dropped,
        ]
    );
    assert_eq!(rx.len(), 2);
    assert_eq!(rx.try_pop(), Some(1));
    assert_eq!(rx.try_pop(), Some(2));
    assert_eq!(rx.try_pop(), None);
    assert_eq!(tx.stats().dropped, 3);
}

#[test]
fn failing_camera_does_not_affect_the_others() {
    let _serial = serial();
    let mut pipeline = Pipeline::new(settings());
    let broken = pipeline
        .add_camera("stub://broken?fail=connect", None, Some("Broken"))
        .unwrap();
    let healthy = pipeline
        .add_camera("stub://ok?scene=attentive", None, Some("Healthy"))
        .unwrap();
    let display = DisplaySink::new();
    let board = display.board();
    pipeline.add_sink(Box::new(display));

    assert!(pipeline.start());
    wait_until("broken camera to give up", || {
        pipeline.camera_stats(broken).map(|s| s.state) == Some(CameraState::Failed)
    });
    wait_until("healthy camera results", || board.latest(healthy).is_some());
    assert!(pipeline.camera_stats(healthy).unwrap().is_healthy());
    assert!(board.latest(broken).is_none());

    pipeline.stop();
    assert_eq!(
        pipeline.camera_stats(broken).map(|s| s.state),
        Some(CameraState::Failed)
    );
}

#[test]
fn scoped_usage_always_ends_idle() {
    let _serial = serial();
    let mut pipeline = Pipeline::new(settings());
    pipeline.add_camera("stub://scope", None, None).unwrap();

    let ok: anyhow::Result<u32> = pipeline.scoped(|p| {
        assert!(p.start());
        Ok(7)
    });
    assert_eq!(ok.unwrap(), 7);
    assert!(!pipeline.is_running());

    let failed: anyhow::Result<()> = pipeline.scoped(|p| {
        assert!(p.start());
        Err(anyhow::anyhow!("proctor dashboard disconnected"))
    });
    assert!(failed.is_err());
    assert!(!pipeline.is_running());

    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pipeline.scoped(|p| {
            assert!(p.start());
            panic!("viewer crashed");
        })
    }));
    assert!(panicked.is_err());
    assert!(!pipeline.is_running());

    // Dropping a running pipeline stops it too, freeing the process-wide slot.
    assert!(pipeline.start());
    drop(pipeline);
    let mut next = Pipeline::new(settings());
    next.add_camera("stub://after", None, None).unwrap();
    assert!(next.start());
    next.stop();
}
