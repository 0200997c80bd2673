//! Pipeline supervisor.
//!
//! `Pipeline` owns the registered cameras, the vision backends, the gallery
//! and the result sinks, and drives the Idle ⇄ Running lifecycle:
//!
//! - `start()` creates fresh frame/result channels, then starts the camera
//!   workers, the processing stage and the distribution stage, in that order
//! - `stop()` stops the cameras (bounded wait each), then the processing and
//!   distribution stages, drains both channels and returns to Idle
//!
//! At most one pipeline per process is Running. `Pipeline` stops itself on
//! drop; `scoped` and `PipelineGuard` give the same guarantee for a shorter
//! region, including when the body fails or panics.

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::{self, ChannelStats, Consumer};
use crate::detect::{lock_backends, Gallery, SharedBackends, VisionBackends};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::{
    open_source, CameraCounters, CameraHandle, CameraSettings, CameraStats, FrameSource,
    RtspConfig,
};
use crate::process::{
    spawn_processing_worker, AnalysisResult, ExcludedCategories, FrameProcessor,
    ProcessingCounters, ProcessingSettings, ProcessingStats,
};
use crate::sink::{
    lock_distributor, spawn_distribution_worker, Distributor, ResultSink, SharedDistributor,
};
use crate::CameraId;

/// Default capacity of both pipeline channels.
pub const DEFAULT_QUEUE_SIZE: usize = 30;

/// Set while any pipeline in the process is Running.
static ACTIVE_PIPELINE: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Capacity of the frame channel and of the result channel.
    pub queue_size: usize,
    pub camera: CameraSettings,
    pub processing: ProcessingSettings,
    /// Template for sources created by `add_camera`; the URL is replaced.
    pub rtsp: RtspConfig,
    pub exclude_categories: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            camera: CameraSettings::default(),
            processing: ProcessingSettings::default(),
            rtsp: RtspConfig::default(),
            exclude_categories: Vec::new(),
        }
    }
}

/// Registered camera, as reported by `Pipeline::cameras`.
#[derive(Clone, Debug)]
pub struct CameraInfo {
    pub id: CameraId,
    pub name: String,
    pub location: String,
    pub stats: CameraStats,
}

struct CameraEntry {
    name: String,
    location: String,
    /// `None` while the camera's worker holds it, or if it was lost to a
    /// worker that never stopped.
    source: Option<Box<dyn FrameSource>>,
    counters: Arc<CameraCounters>,
}

/// Threads and signals of one run.
struct RunState {
    cameras: Vec<CameraHandle>,
    processing: Option<JoinHandle<()>>,
    distribution: Option<JoinHandle<()>>,
    /// Dropped to stop the processing and distribution stages.
    workers_shutdown: Option<Sender<()>>,
}

pub struct Pipeline {
    settings: PipelineSettings,
    cameras: BTreeMap<CameraId, CameraEntry>,
    backends: SharedBackends,
    gallery: Arc<Gallery>,
    excluded: ExcludedCategories,
    distributor: SharedDistributor,
    processing_counters: Arc<ProcessingCounters>,
    frames: Option<Consumer<Frame>>,
    results: Option<Consumer<AnalysisResult>>,
    run: Option<RunState>,
}

impl Pipeline {
    /// Pipeline with the synthetic vision backends.
    pub fn new(settings: PipelineSettings) -> Self {
        Self::with_backends(settings, VisionBackends::stub())
    }

    pub fn with_backends(settings: PipelineSettings, backends: VisionBackends) -> Self {
        let excluded = ExcludedCategories::new(&settings.exclude_categories);
        Self {
            settings,
            cameras: BTreeMap::new(),
            backends: backends.into_shared(),
            gallery: Arc::new(Gallery::new()),
            excluded,
            distributor: Arc::new(Mutex::new(Distributor::new())),
            processing_counters: Arc::new(ProcessingCounters::default()),
            frames: None,
            results: None,
            run: None,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Register a camera by URL. Idle only.
    ///
    /// An explicit id is used when free; otherwise the smallest unused id is
    /// assigned.
    pub fn add_camera(
        &mut self,
        url: &str,
        id: Option<CameraId>,
        name: Option<&str>,
    ) -> Result<CameraId, PipelineError> {
        let source = open_source(url, &self.settings.rtsp);
        self.add_source(source, id, name)
    }

    /// Register any frame source. Idle only.
    pub fn add_source(
        &mut self,
        source: Box<dyn FrameSource>,
        id: Option<CameraId>,
        name: Option<&str>,
    ) -> Result<CameraId, PipelineError> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }

        let id = match id {
            Some(requested) if !self.cameras.contains_key(&requested) => requested,
            Some(requested) => {
                let assigned = self.next_free_id()?;
                log::warn!(
                    "camera id {} already registered; assigning {}",
                    requested,
                    assigned
                );
                assigned
            }
            None => self.next_free_id()?,
        };
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Camera {}", id));
        let location = source.location();
        log::info!("camera {} ({}) registered: {}", id, name, location);

        self.cameras.insert(
            id,
            CameraEntry {
                name,
                location,
                source: Some(source),
                counters: Arc::new(CameraCounters::default()),
            },
        );
        Ok(id)
    }

    fn next_free_id(&self) -> Result<CameraId, PipelineError> {
        (0..=CameraId::MAX)
            .find(|candidate| !self.cameras.contains_key(candidate))
            .ok_or_else(|| PipelineError::InvalidConfiguration("camera ids exhausted".into()))
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.keys().copied().collect()
    }

    pub fn cameras(&self) -> Vec<CameraInfo> {
        self.cameras
            .iter()
            .map(|(id, entry)| CameraInfo {
                id: *id,
                name: entry.name.clone(),
                location: entry.location.clone(),
                stats: entry.counters.snapshot(),
            })
            .collect()
    }

    pub fn camera_stats(&self, id: CameraId) -> Option<CameraStats> {
        self.cameras.get(&id).map(|entry| entry.counters.snapshot())
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        self.processing_counters.snapshot()
    }

    /// Frames waiting in the current (or last) run's frame channel.
    pub fn pending_frames(&self) -> usize {
        self.frames.as_ref().map_or(0, |c| c.len())
    }

    /// Results waiting in the current (or last) run's result channel.
    pub fn pending_results(&self) -> usize {
        self.results.as_ref().map_or(0, |c| c.len())
    }

    pub fn frame_channel_stats(&self) -> ChannelStats {
        self.frames.as_ref().map(|c| c.stats()).unwrap_or_default()
    }

    /// Replace the excluded detection categories. Takes effect on the next
    /// detailed frame, also while running.
    pub fn set_exclude_categories<I, S>(&self, categories: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excluded.set(categories);
        log::info!("excluded categories: {:?}", self.excluded.list());
    }

    pub fn exclude_categories(&self) -> Vec<String> {
        self.excluded.list()
    }

    /// Register a result sink. Sinks persist across runs.
    pub fn add_sink(&self, sink: Box<dyn ResultSink>) {
        lock_distributor(&self.distributor).add(sink);
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Replace the known-face gallery. Idle only.
    pub fn set_gallery(&mut self, gallery: Gallery) -> Result<(), PipelineError> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }
        self.gallery = Arc::new(gallery);
        Ok(())
    }

    /// Build the gallery from `students_dir` with this pipeline's backends.
    pub fn load_gallery(&mut self, students_dir: &Path) -> Result<usize> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let gallery = {
            let mut backends = lock_backends(&self.backends)?;
            Gallery::load_dir(students_dir, &mut backends)?
        };
        let count = gallery.len();
        self.gallery = Arc::new(gallery);
        Ok(count)
    }

    /// Start all stages. Returns `false`, without changing state, when the
    /// pipeline is already running, has no cameras, or another pipeline in
    /// this process is running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            log::warn!("start rejected: {}", PipelineError::AlreadyRunning);
            return false;
        }
        if self.cameras.is_empty() {
            log::warn!(
                "start rejected: {}",
                PipelineError::InvalidConfiguration("no cameras registered".into())
            );
            return false;
        }
        if ACTIVE_PIPELINE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("start rejected: another pipeline is running in this process");
            return false;
        }

        match self.launch() {
            Ok(()) => {
                log::info!(
                    "pipeline running: {} cameras, queue size {}, backends {}",
                    self.cameras.len(),
                    self.settings.queue_size,
                    lock_backends(&self.backends)
                        .map(|b| b.describe())
                        .unwrap_or_default()
                );
                true
            }
            Err(err) => {
                log::error!("pipeline failed to start: {:#}", err);
                self.stop();
                ACTIVE_PIPELINE.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn launch(&mut self) -> Result<()> {
        lock_backends(&self.backends)?
            .warm_up()
            .context("vision backend warm-up failed")?;

        let (frame_tx, frame_rx) = channel::bounded::<Frame>(self.settings.queue_size);
        let (result_tx, result_rx) = channel::bounded::<AnalysisResult>(self.settings.queue_size);
        let (workers_shutdown, workers_signal) = crossbeam_channel::bounded::<()>(0);
        self.frames = Some(frame_rx.clone());
        self.results = Some(result_rx.clone());
        let run = self.run.insert(RunState {
            cameras: Vec::new(),
            processing: None,
            distribution: None,
            workers_shutdown: Some(workers_shutdown),
        });

        for (id, entry) in self.cameras.iter_mut() {
            let Some(source) = entry.source.take() else {
                log::warn!("camera {} has no source (lost in a previous stop); skipping", id);
                continue;
            };
            let handle = CameraHandle::spawn(
                *id,
                source,
                frame_tx.clone(),
                self.settings.camera.clone(),
                entry.counters.clone(),
            )
            .with_context(|| format!("start camera {}", id))?;
            run.cameras.push(handle);
        }
        if run.cameras.is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "no camera has a usable source".into(),
            )
            .into());
        }
        drop(frame_tx);

        let processor = FrameProcessor::new(
            self.settings.processing.clone(),
            self.excluded.clone(),
            self.backends.clone(),
            self.gallery.clone(),
            self.processing_counters.clone(),
        );
        run.processing = Some(spawn_processing_worker(
            processor,
            frame_rx,
            result_tx,
            workers_signal.clone(),
        )?);
        run.distribution = Some(spawn_distribution_worker(
            self.distributor.clone(),
            result_rx,
            workers_signal,
        )?);
        Ok(())
    }

    /// Stop all stages and return to Idle. No-op when Idle.
    pub fn stop(&mut self) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        log::info!("pipeline stopping");
        let timeout = self.settings.camera.stop_timeout;

        for handle in &mut run.cameras {
            handle.request_stop();
        }
        for handle in run.cameras.drain(..) {
            let id = handle.camera_id();
            let source = handle.stop(timeout);
            if let Some(entry) = self.cameras.get_mut(&id) {
                if source.is_none() {
                    log::warn!("camera {} source was not returned; it will not restart", id);
                }
                entry.source = source;
            }
        }

        run.workers_shutdown.take();
        if let Some(join) = run.processing.take() {
            join_with_timeout("processing", join, timeout);
        }
        if let Some(join) = run.distribution.take() {
            join_with_timeout("distribution", join, timeout);
        }

        let drained_frames = self.frames.as_ref().map_or(0, |c| c.drain());
        let drained_results = self.results.as_ref().map_or(0, |c| c.drain());
        if drained_frames + drained_results > 0 {
            log::info!(
                "discarded {} queued frames and {} queued results",
                drained_frames,
                drained_results
            );
        }

        ACTIVE_PIPELINE.store(false, Ordering::SeqCst);
        log::info!("pipeline stopped");
    }

    /// Log one health line per camera plus the processing counters.
    pub fn log_health(&self) {
        for info in self.cameras() {
            log::info!(
                "health: camera {} ({}) {} captured={} dropped={} decode_errors={} reconnects={}",
                info.id,
                info.name,
                info.stats.state.as_str(),
                info.stats.frames_captured,
                info.stats.frames_dropped,
                info.stats.decode_errors,
                info.stats.reconnects
            );
        }
        let stats = self.processing_stats();
        log::info!(
            "health: processed={} detailed={} inference_failures={} results_dropped={} queued={}",
            stats.frames_processed,
            stats.detailed_checks,
            stats.inference_failures,
            stats.results_dropped,
            self.pending_frames()
        );
    }

    /// Guard that stops the pipeline when dropped.
    pub fn guard(&mut self) -> PipelineGuard<'_> {
        PipelineGuard { pipeline: self }
    }

    /// Run `body` and stop the pipeline afterwards, whether the body returns
    /// normally, returns an error, or panics.
    pub fn scoped<T, F>(&mut self, body: F) -> T
    where
        F: FnOnce(&mut Pipeline) -> T,
    {
        let mut guard = self.guard();
        body(&mut *guard)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stops the borrowed pipeline on drop.
pub struct PipelineGuard<'a> {
    pipeline: &'a mut Pipeline,
}

impl Deref for PipelineGuard<'_> {
    type Target = Pipeline;

    fn deref(&self) -> &Pipeline {
        self.pipeline
    }
}

impl DerefMut for PipelineGuard<'_> {
    fn deref_mut(&mut self) -> &mut Pipeline {
        self.pipeline
    }
}

impl Drop for PipelineGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.stop();
    }
}

fn join_with_timeout(stage: &str, join: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !join.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("{} stage did not stop within {:?}; detaching", stage, timeout);
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    if join.join().is_err() {
        log::error!("{} stage panicked", stage);
    }
}
