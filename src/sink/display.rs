use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::ResultSink;
use crate::process::AnalysisResult;
use crate::CameraId;

/// Latest result per camera, readable by a viewer while the pipeline runs.
#[derive(Clone, Default)]
pub struct DisplayBoard {
    latest: Arc<Mutex<BTreeMap<CameraId, AnalysisResult>>>,
}

impl DisplayBoard {
    pub fn latest(&self, camera_id: CameraId) -> Option<AnalysisResult> {
        self.latest.lock().ok()?.get(&camera_id).cloned()
    }

    pub fn cameras(&self) -> Vec<CameraId> {
        self.latest
            .lock()
            .map(|board| board.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Cameras whose latest result carries a cheating verdict.
    pub fn flagged(&self) -> Vec<CameraId> {
        self.latest
            .lock()
            .map(|board| {
                board
                    .values()
                    .filter(|r| r.is_cheating())
                    .map(|r| r.camera_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut board) = self.latest.lock() {
            board.clear();
        }
    }
}

/// Display consumer: keeps the newest frame of every camera on a board and
/// logs verdict transitions.
#[derive(Default)]
pub struct DisplaySink {
    board: DisplayBoard,
}

impl DisplaySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn board(&self) -> DisplayBoard {
        self.board.clone()
    }
}

impl ResultSink for DisplaySink {
    fn name(&self) -> &str {
        "display"
    }

    fn accept(&mut self, result: &AnalysisResult) -> Result<()> {
        let mut board = self
            .board
            .latest
            .lock()
            .map_err(|_| anyhow!("display board lock poisoned"))?;

        let was_cheating = board
            .get(&result.camera_id)
            .map(|r| r.is_cheating())
            .unwrap_or(false);
        match (was_cheating, result.is_cheating()) {
            (false, true) => log::warn!(
                "display: camera {} flagged (frame {}, names {:?})",
                result.camera_id,
                result.frame_index,
                result.names()
            ),
            (true, false) => log::info!("display: camera {} cleared", result.camera_id),
            _ => {}
        }

        board.insert(result.camera_id, result.clone());
        Ok(())
    }
}
