//! Per-camera exam monitoring state.
//!
//! `MonitorSession` is the explicit per-session state object the processing
//! stage threads through every frame: the sampling counter, the gaze
//! debouncer and the cheating state machine. Sessions are created on a
//! camera's first frame in a run and dropped when the run ends.

use serde::Serialize;

use crate::gaze::{GazeDebouncer, GazeObservation};

pub const DEFAULT_WARMUP_FRAMES: u64 = 30;
pub const DEFAULT_DETAILED_EVERY: u64 = 3;
pub const DEFAULT_CHEATING_AFTER: u32 = 5;

/// Which frames get full detection + recognition + gaze inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingPolicy {
    /// Every frame up to and including this index is detailed.
    pub warmup_frames: u64,
    /// After warm-up, every `every`-th frame is detailed.
    pub every: u64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            every: DEFAULT_DETAILED_EVERY,
        }
    }
}

impl SamplingPolicy {
    /// `frame_index` is 1-based within the session.
    pub fn is_detailed(&self, frame_index: u64) -> bool {
        frame_index <= self.warmup_frames || frame_index % self.every.max(1) == 0
    }
}

/// Closed or still-open span of detailed frames flagged as cheating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CheatingInterval {
    pub start_frame: u64,
    pub end_frame: u64,
}

/// Verdict change produced by one detailed check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerdictChange {
    Unchanged,
    Flagged,
    Cleared,
}

/// Debounced cheating state machine.
///
/// Only detailed checks feed it. `consecutive_not_looking` rises by one per
/// not-looking check and, once past `trigger`, raises `is_cheating` and
/// saturates at `trigger`. Looking checks lower it by two; at one or below the
/// flag clears.
#[derive(Clone, Debug)]
pub struct CheatingState {
    trigger: u32,
    consecutive_not_looking: u32,
    is_cheating: bool,
    history: Vec<CheatingInterval>,
    streak_start: Option<u64>,
    last_detailed: Option<u64>,
}

impl Default for CheatingState {
    fn default() -> Self {
        Self::new(DEFAULT_CHEATING_AFTER)
    }
}

impl CheatingState {
    pub fn new(trigger: u32) -> Self {
        Self {
            trigger,
            consecutive_not_looking: 0,
            is_cheating: false,
            history: Vec::new(),
            streak_start: None,
            last_detailed: None,
        }
    }

    pub fn is_cheating(&self) -> bool {
        self.is_cheating
    }

    pub fn consecutive_not_looking(&self) -> u32 {
        self.consecutive_not_looking
    }

    pub fn history(&self) -> &[CheatingInterval] {
        &self.history
    }

    /// Apply one detailed check at `frame_index`.
    pub fn record(&mut self, frame_index: u64, looking_at_screen: bool) -> VerdictChange {
        let previous = self.last_detailed.replace(frame_index);
        let was_cheating = self.is_cheating;

        if looking_at_screen {
            self.consecutive_not_looking = self.consecutive_not_looking.saturating_sub(2);
            if self.consecutive_not_looking <= 1 {
                self.is_cheating = false;
            }
            if self.consecutive_not_looking == 0 || (was_cheating && !self.is_cheating) {
                self.streak_start = None;
            }
        } else {
            self.streak_start.get_or_insert(frame_index);
            self.consecutive_not_looking += 1;
            if self.consecutive_not_looking > self.trigger {
                self.is_cheating = true;
                self.extend_history(frame_index, previous);
                self.consecutive_not_looking = self.trigger;
            }
        }

        match (was_cheating, self.is_cheating) {
            (false, true) => VerdictChange::Flagged,
            (true, false) => VerdictChange::Cleared,
            _ => VerdictChange::Unchanged,
        }
    }

    fn extend_history(&mut self, frame_index: u64, previous: Option<u64>) {
        if let Some(last) = self.history.last_mut() {
            if previous.is_some() && Some(last.end_frame) == previous {
                last.end_frame = frame_index;
                return;
            }
        }
        let start_frame = self.streak_start.unwrap_or(frame_index);
        self.history.push(CheatingInterval {
            start_frame,
            end_frame: frame_index,
        });
    }
}

/// Immutable copy of the monitoring state attached to each result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CheatingSnapshot {
    pub consecutive_not_looking: u32,
    pub looking_hysteresis_counter: u32,
    pub is_cheating: bool,
    pub history: Vec<CheatingInterval>,
}

/// Outcome of feeding one frame into a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionStep {
    pub frame_index: u64,
    pub detailed: bool,
    pub looking_at_screen: bool,
    pub change: VerdictChange,
}

/// All mutable monitoring state for one camera in one run.
#[derive(Clone, Debug)]
pub struct MonitorSession {
    sampling: SamplingPolicy,
    frames_seen: u64,
    gaze: GazeDebouncer,
    cheating: CheatingState,
}

impl MonitorSession {
    pub fn new(sampling: SamplingPolicy, cheating_after: u32) -> Self {
        Self {
            sampling,
            frames_seen: 0,
            gaze: GazeDebouncer::new(),
            cheating: CheatingState::new(cheating_after),
        }
    }

    /// Advance the frame counter and report whether the new frame is detailed.
    pub fn begin_frame(&mut self) -> (u64, bool) {
        self.frames_seen += 1;
        (self.frames_seen, self.sampling.is_detailed(self.frames_seen))
    }

    /// Finish a detailed frame with its gaze observation.
    pub fn complete_detailed(
        &mut self,
        frame_index: u64,
        observation: GazeObservation,
    ) -> SessionStep {
        let looking_at_screen = self.gaze.observe(observation);
        let change = self.cheating.record(frame_index, looking_at_screen);
        SessionStep {
            frame_index,
            detailed: true,
            looking_at_screen,
            change,
        }
    }

    /// Finish a pass-through frame: gaze is carried, cheating state untouched.
    pub fn complete_passthrough(&self, frame_index: u64) -> SessionStep {
        SessionStep {
            frame_index,
            detailed: false,
            looking_at_screen: self.gaze.looking(),
            change: VerdictChange::Unchanged,
        }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn looking_at_screen(&self) -> bool {
        self.gaze.looking()
    }

    pub fn cheating(&self) -> &CheatingState {
        &self.cheating
    }

    pub fn snapshot(&self) -> CheatingSnapshot {
        CheatingSnapshot {
            consecutive_not_looking: self.cheating.consecutive_not_looking,
            looking_hysteresis_counter: self.gaze.counter(),
            is_cheating: self.cheating.is_cheating,
            history: self.cheating.history.clone(),
        }
    }
}
