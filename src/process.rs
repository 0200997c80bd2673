//! Processing stage.
//!
//! One worker thread pulls frames from the frame channel, analyses them and
//! pushes an `AnalysisResult` per frame into the result channel. All
//! per-camera monitoring state lives in `FrameProcessor` and is only ever
//! touched by that thread.
//!
//! Per frame:
//! 1. the camera's `MonitorSession` decides whether the frame is detailed
//! 2. detailed frames run detection, recognition and gaze location
//! 3. the gaze observation feeds the hysteresis debouncer and the cheating
//!    state machine
//! 4. the frame is annotated and wrapped in an `AnalysisResult`
//!
//! Backend failures are logged and the frame is treated as having no
//! detections. Nothing in here ends the stage except shutdown.

use anyhow::{anyhow, Result};
use crossbeam_channel::{select, Receiver, TryRecvError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use crate::annotate::{annotate, Overlay};
use crate::channel::{Consumer, Producer, PushOutcome};
use crate::detect::{
    lock_backends, BoundingBox, Detection, Gallery, RecognitionMatch, SharedBackends,
    VisionBackends,
};
use crate::frame::{Frame, Image};
use crate::gaze::{classify, GazeObservation, GazeParams, GazeSample};
use crate::monitor::{
    CheatingSnapshot, MonitorSession, SamplingPolicy, VerdictChange, DEFAULT_CHEATING_AFTER,
};
use crate::CameraId;

#[derive(Clone, Debug)]
pub struct ProcessingSettings {
    /// Minimum cosine similarity (exclusive) for a gallery match.
    pub threshold: f32,
    /// Detections below this confidence are discarded.
    pub score_threshold: f32,
    /// Detections kept per frame, highest confidence first.
    pub max_results: usize,
    pub sampling: SamplingPolicy,
    /// Consecutive not-looking checks tolerated before flagging.
    pub cheating_after: u32,
    pub gaze: GazeParams,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            score_threshold: 0.5,
            max_results: 5,
            sampling: SamplingPolicy::default(),
            cheating_after: DEFAULT_CHEATING_AFTER,
            gaze: GazeParams::default(),
        }
    }
}

/// Detection labels to ignore, shared with the supervisor so they can be
/// changed while a run is active. Stored lowercased.
#[derive(Clone, Debug, Default)]
pub struct ExcludedCategories {
    inner: Arc<RwLock<Vec<String>>>,
}

impl ExcludedCategories {
    pub fn new<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let excluded = Self::default();
        excluded.set(categories);
        excluded
    }

    pub fn set<I, S>(&self, categories: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized: Vec<String> = categories
            .into_iter()
            .map(|c| c.as_ref().trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        match self.inner.write() {
            Ok(mut guard) => *guard = normalized,
            Err(poisoned) => *poisoned.into_inner() = normalized,
        }
    }

    pub fn contains(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        match self.inner.read() {
            Ok(guard) => guard.iter().any(|c| *c == label),
            Err(poisoned) => poisoned.into_inner().iter().any(|c| *c == label),
        }
    }

    pub fn list(&self) -> Vec<String> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Output of the processing stage for one frame.
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub camera_id: CameraId,
    pub sequence: u64,
    /// 1-based index within the camera's session.
    pub frame_index: u64,
    /// Annotated frame.
    pub image: Image,
    pub detections: Vec<Detection>,
    pub matches: Vec<RecognitionMatch>,
    pub gaze: GazeSample,
    pub cheating: CheatingSnapshot,
    /// Whether inference ran on this frame.
    pub detailed: bool,
}

impl AnalysisResult {
    /// Identities recognised in this frame, `unknown` included.
    pub fn names(&self) -> Vec<String> {
        self.matches.iter().map(|m| m.identity.clone()).collect()
    }

    pub fn is_cheating(&self) -> bool {
        self.cheating.is_cheating
    }
}

#[derive(Debug, Default)]
pub struct ProcessingCounters {
    frames_processed: AtomicU64,
    detailed_checks: AtomicU64,
    inference_failures: AtomicU64,
    results_dropped: AtomicU64,
}

impl ProcessingCounters {
    pub fn snapshot(&self) -> ProcessingStats {
        ProcessingStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            detailed_checks: self.detailed_checks.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessingStats {
    pub frames_processed: u64,
    pub detailed_checks: u64,
    pub inference_failures: u64,
    /// Results discarded because the result channel was full.
    pub results_dropped: u64,
}

struct CameraSession {
    monitor: MonitorSession,
    last_gaze: GazeSample,
}

/// Everything one detailed pass found.
#[derive(Default)]
struct Findings {
    detections: Vec<Detection>,
    matches: Vec<RecognitionMatch>,
    eyes: Vec<BoundingBox>,
    observation: Option<GazeObservation>,
}

pub struct FrameProcessor {
    settings: ProcessingSettings,
    excluded: ExcludedCategories,
    backends: SharedBackends,
    gallery: Arc<Gallery>,
    sessions: HashMap<CameraId, CameraSession>,
    counters: Arc<ProcessingCounters>,
}

impl FrameProcessor {
    pub fn new(
        settings: ProcessingSettings,
        excluded: ExcludedCategories,
        backends: SharedBackends,
        gallery: Arc<Gallery>,
        counters: Arc<ProcessingCounters>,
    ) -> Self {
        Self {
            settings,
            excluded,
            backends,
            gallery,
            sessions: HashMap::new(),
            counters,
        }
    }

    pub fn monitor(&self, camera_id: CameraId) -> Option<&MonitorSession> {
        self.sessions.get(&camera_id).map(|s| &s.monitor)
    }

    /// Analyse one frame and update its camera's session.
    pub fn process(&mut self, frame: Frame) -> AnalysisResult {
        let camera_id = frame.camera_id;
        let sequence = frame.sequence;
        let mut image = frame.into_image();

        let (frame_index, detailed) = self.session_mut(camera_id).monitor.begin_frame();

        let findings = if detailed {
            self.counters.detailed_checks.fetch_add(1, Ordering::Relaxed);
            self.analyze(&image)
        } else {
            Findings::default()
        };

        let session = self.session_mut(camera_id);
        let gaze = match findings.observation {
            Some(observation) => {
                let step = session.monitor.complete_detailed(frame_index, observation);
                match step.change {
                    VerdictChange::Flagged => log::warn!(
                        "camera {}: cheating suspected at frame {}",
                        camera_id,
                        frame_index
                    ),
                    VerdictChange::Cleared => log::info!(
                        "camera {}: attention restored at frame {}",
                        camera_id,
                        frame_index
                    ),
                    VerdictChange::Unchanged => {}
                }
                GazeSample {
                    looking_at_screen: step.looking_at_screen,
                    eye_count: observation.eye_count(),
                    face_present: observation.face_present(),
                }
            }
            None => {
                let step = session.monitor.complete_passthrough(frame_index);
                GazeSample {
                    looking_at_screen: step.looking_at_screen,
                    ..session.last_gaze
                }
            }
        };
        session.last_gaze = gaze;
        let cheating = session.monitor.snapshot();

        annotate(
            &mut image,
            &Overlay {
                detections: &findings.detections,
                matches: &findings.matches,
                eyes: &findings.eyes,
                is_cheating: cheating.is_cheating,
            },
        );
        self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);

        AnalysisResult {
            camera_id,
            sequence,
            frame_index,
            image,
            detections: findings.detections,
            matches: findings.matches,
            gaze,
            cheating,
            detailed,
        }
    }

    fn session_mut(&mut self, camera_id: CameraId) -> &mut CameraSession {
        let sampling = self.settings.sampling;
        let cheating_after = self.settings.cheating_after;
        self.sessions.entry(camera_id).or_insert_with(|| {
            log::info!("camera {}: monitoring session started", camera_id);
            CameraSession {
                monitor: MonitorSession::new(sampling, cheating_after),
                last_gaze: GazeSample::default(),
            }
        })
    }

    fn analyze(&self, image: &Image) -> Findings {
        let mut backends = match lock_backends(&self.backends) {
            Ok(backends) => backends,
            Err(err) => {
                self.inference_failed(err);
                return Findings {
                    observation: Some(GazeObservation::NoFace),
                    ..Findings::default()
                };
            }
        };

        let detections = match backends.detect(image) {
            Ok(raw) => self.filter_detections(raw),
            Err(err) => {
                self.inference_failed(err);
                Vec::new()
            }
        };
        let matches = self.recognize(&mut backends, image, &detections);
        let (face, eyes) = self.locate_gaze(&mut backends, image);
        let observation = classify(
            image.width(),
            image.height(),
            face.as_ref(),
            &eyes,
            &self.settings.gaze,
        );

        Findings {
            detections,
            matches,
            eyes,
            observation: Some(observation),
        }
    }

    fn filter_detections(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        detections.retain(|d| {
            d.confidence >= self.settings.score_threshold && !self.excluded.contains(&d.label)
        });
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        detections.truncate(self.settings.max_results);
        detections
    }

    fn recognize(
        &self,
        backends: &mut VisionBackends,
        image: &Image,
        detections: &[Detection],
    ) -> Vec<RecognitionMatch> {
        let mut matches = Vec::new();
        for face in detections.iter().filter(|d| d.is_face()) {
            let Some(crop) = image.crop(&face.bbox) else {
                continue;
            };
            match backends.embed(&crop) {
                Ok(embedding) => matches.push(self.gallery.best_match(
                    &embedding,
                    self.settings.threshold,
                    face.bbox,
                )),
                Err(err) => self.inference_failed(err),
            }
        }
        matches
    }

    /// Largest face from the gaze locator and the eyes found inside it.
    fn locate_gaze(
        &self,
        backends: &mut VisionBackends,
        image: &Image,
    ) -> (Option<BoundingBox>, Vec<BoundingBox>) {
        let face = match backends.faces(image) {
            Ok(faces) => faces.into_iter().max_by_key(|f| f.area()),
            Err(err) => {
                self.inference_failed(err);
                None
            }
        };
        let Some(face) = face else {
            return (None, Vec::new());
        };
        let eyes = match backends.eyes(image, &face) {
            Ok(eyes) => eyes,
            Err(err) => {
                self.inference_failed(err);
                Vec::new()
            }
        };
        (Some(face), eyes)
    }

    fn inference_failed(&self, err: impl std::fmt::Display) {
        self.counters
            .inference_failures
            .fetch_add(1, Ordering::Relaxed);
        log::warn!("{}; treating frame as having no detections", err);
    }
}

/// Spawn the processing thread.
///
/// The thread exits when `shutdown`'s sender is dropped or every frame
/// producer is gone. Sessions live as long as the thread.
pub fn spawn_processing_worker(
    mut processor: FrameProcessor,
    frames: Consumer<Frame>,
    results: Producer<AnalysisResult>,
    shutdown: Receiver<()>,
) -> Result<JoinHandle<()>> {
    let counters = processor.counters.clone();
    std::thread::Builder::new()
        .name("processing".to_string())
        .spawn(move || {
            log::info!("processing stage started");
            loop {
                let next = select! {
                    recv(frames.receiver()) -> msg => msg.ok(),
                    recv(shutdown) -> _ => None,
                };
                let Some(frame) = next else { break };
                let result = processor.process(frame);
                // Stopped while analysing: the channels may already be drained.
                if matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
                    break;
                }
                if results.push(result) == PushOutcome::Dropped {
                    counters.results_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            log::info!(
                "processing stage stopped after {} frames",
                counters.snapshot().frames_processed
            );
        })
        .map_err(|e| anyhow!("spawn processing thread: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::detect::{Embedding, FaceEmbedder, GazeLocator, ObjectDetector, StubBackend};
    use crate::ingest::synthetic::{render, Scene};
    use std::time::Duration;

    fn processor_with(backends: VisionBackends, gallery: Gallery) -> FrameProcessor {
        FrameProcessor::new(
            ProcessingSettings::default(),
            ExcludedCategories::default(),
            backends.into_shared(),
            Arc::new(gallery),
            Arc::new(ProcessingCounters::default()),
        )
    }

    fn frame(camera_id: CameraId, sequence: u64, scene: Scene) -> Frame {
        Frame::new(camera_id, sequence, render(scene, 320, 240))
    }

    fn gallery_of(scene: Scene, name: &str) -> Gallery {
        let image = render(scene, 320, 240);
        let mut backend = StubBackend::new();
        let face = backend
            .detect(&image)
            .unwrap()
            .into_iter()
            .find(|d| d.is_face())
            .unwrap();
        let embedding = backend.embed(&image.crop(&face.bbox).unwrap()).unwrap();
        let mut gallery = Gallery::new();
        gallery.insert(name, embedding);
        gallery
    }

    #[test]
    fn attentive_frame_is_recognised_and_looking_after_two_checks() {
        let mut processor =
            processor_with(VisionBackends::stub(), gallery_of(Scene::Attentive, "Ada"));

        let first = processor.process(frame(1, 1, Scene::Attentive));
        assert!(first.detailed);
        assert_eq!(first.frame_index, 1);
        assert_eq!(first.names(), vec!["Ada".to_string()]);
        assert_eq!(first.gaze.eye_count, 2);
        assert!(!first.gaze.looking_at_screen);

        let second = processor.process(frame(1, 2, Scene::Attentive));
        assert!(second.gaze.looking_at_screen);
        assert_eq!(second.cheating.looking_hysteresis_counter, 2);
    }

    #[test]
    fn exclusions_score_threshold_and_max_results_filter_detections() {
        let mut processor = processor_with(VisionBackends::stub(), Gallery::new());
        let result = processor.process(frame(1, 1, Scene::Phone));
        let labels: Vec<&str> = result.detections.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["face", "cell phone"]);
        assert_eq!(result.names(), vec!["unknown".to_string()]);

        processor.excluded.set(["Cell Phone"]);
        let result = processor.process(frame(1, 2, Scene::Phone));
        assert!(result.detections.iter().all(|d| d.is_face()));

        processor.excluded.set(Vec::<String>::new());
        processor.settings.score_threshold = 0.85;
        let result = processor.process(frame(1, 3, Scene::Phone));
        assert_eq!(result.detections.len(), 1);

        processor.settings.score_threshold = 0.0;
        processor.settings.max_results = 1;
        let result = processor.process(frame(1, 4, Scene::Phone));
        assert_eq!(result.detections.len(), 1);
        assert!(result.detections[0].is_face());
    }

    #[test]
    fn looking_away_flags_cheating_per_camera() {
        let mut processor = processor_with(VisionBackends::stub(), Gallery::new());
        let mut last = None;
        for sequence in 1..=6 {
            last = Some(processor.process(frame(4, sequence, Scene::LookingAway)));
            // The attentive camera is unaffected.
            let other = processor.process(frame(5, sequence, Scene::Attentive));
            assert!(!other.is_cheating());
        }
        let last = last.unwrap();
        assert!(last.is_cheating());
        assert_eq!(last.cheating.history.len(), 1);
        assert_eq!(last.cheating.history[0].start_frame, 1);
        assert_eq!(last.cheating.history[0].end_frame, 6);
        assert_eq!(processor.monitor(4).unwrap().frames_seen(), 6);
    }

    #[test]
    fn passthrough_frames_carry_gaze_and_skip_inference() {
        let mut processor = processor_with(VisionBackends::stub(), Gallery::new());
        processor.settings.sampling = SamplingPolicy {
            warmup_frames: 2,
            every: 3,
        };
        let results: Vec<AnalysisResult> = (1..=4)
            .map(|n| processor.process(frame(1, n, Scene::Attentive)))
            .collect();

        assert!(results[2].detailed);
        assert!(!results[3].detailed);
        assert!(results[3].detections.is_empty());
        assert!(results[3].gaze.looking_at_screen);
        assert_eq!(results[3].gaze.eye_count, 2);
        assert_eq!(processor.counters.snapshot().detailed_checks, 3);
    }

    struct BrokenModel;

    impl ObjectDetector for BrokenModel {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn detect(&mut self, _image: &Image) -> Result<Vec<Detection>> {
            Err(anyhow!("tensor shape mismatch"))
        }
    }

    impl FaceEmbedder for BrokenModel {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn embed(&mut self, _face: &Image) -> Result<Embedding> {
            Err(anyhow!("embedder offline"))
        }
    }

    impl GazeLocator for BrokenModel {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn faces(&mut self, _image: &Image) -> Result<Vec<BoundingBox>> {
            Err(anyhow!("cascade missing"))
        }

        fn eyes(&mut self, _image: &Image, _face: &BoundingBox) -> Result<Vec<BoundingBox>> {
            Err(anyhow!("cascade missing"))
        }
    }

    #[test]
    fn backend_failures_yield_empty_results() {
        let backends = VisionBackends::new(BrokenModel, BrokenModel, BrokenModel);
        let mut processor = processor_with(backends, Gallery::new());
        let result = processor.process(frame(1, 1, Scene::Attentive));

        assert!(result.detailed);
        assert!(result.detections.is_empty());
        assert!(result.matches.is_empty());
        assert!(!result.gaze.face_present);
        assert_eq!(processor.counters.snapshot().inference_failures, 2);
    }

    #[test]
    fn worker_processes_until_shutdown() {
        let counters = Arc::new(ProcessingCounters::default());
        let processor = FrameProcessor::new(
            ProcessingSettings::default(),
            ExcludedCategories::default(),
            VisionBackends::stub().into_shared(),
            Arc::new(Gallery::new()),
            counters.clone(),
        );
        let (frame_tx, frame_rx) = channel::bounded(8);
        let (result_tx, result_rx) = channel::bounded(8);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let join = spawn_processing_worker(processor, frame_rx, result_tx, shutdown_rx).unwrap();

        for n in 1..=3 {
            frame_tx.push(frame(2, n, Scene::Absent));
        }
        let mut received = Vec::new();
        while received.len() < 3 {
            let result = result_rx
                .receiver()
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            received.push(result.sequence);
        }
        assert_eq!(received, vec![1, 2, 3]);

        drop(shutdown_tx);
        join.join().unwrap();
        assert_eq!(counters.snapshot().frames_processed, 3);
    }

    #[test]
    fn excluded_categories_are_case_insensitive() {
        let excluded = ExcludedCategories::new([" Person ", "BOOK", ""]);
        assert!(excluded.contains("person"));
        assert!(excluded.contains("Book"));
        assert!(!excluded.contains("face"));
        assert_eq!(excluded.list(), vec!["person".to_string(), "book".to_string()]);
    }
}
