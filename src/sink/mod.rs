//! Result distribution.
//!
//! The distribution thread drains the result channel and hands every
//! `AnalysisResult` to each registered `ResultSink`. Sinks are isolated from
//! each other: a failing sink is logged (with its consecutive error count)
//! and the remaining sinks still receive the result.

mod display;
mod emit;

pub use display::{DisplayBoard, DisplaySink};
pub use emit::{encode_jpeg, jpeg_data_url, EmitPayload, EmitSink, DEFAULT_JPEG_QUALITY};

use anyhow::{anyhow, Result};
use crossbeam_channel::{select, Receiver};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::channel::Consumer;
use crate::process::AnalysisResult;

/// Consumer of analysis results (display, network emitter, recorder...).
pub trait ResultSink: Send {
    fn name(&self) -> &str;

    fn accept(&mut self, result: &AnalysisResult) -> Result<()>;
}

struct SinkSlot {
    sink: Box<dyn ResultSink>,
    consecutive_errors: u64,
    total_errors: u64,
}

/// Fan-out of results to every registered sink.
#[derive(Default)]
pub struct Distributor {
    slots: Vec<SinkSlot>,
}

/// Sinks outlive individual runs, so the distributor is shared with the
/// distribution thread rather than moved into it.
pub type SharedDistributor = Arc<Mutex<Distributor>>;

impl Distributor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Box<dyn ResultSink>) {
        log::info!("result sink registered: {}", sink.name());
        self.slots.push(SinkSlot {
            sink,
            consecutive_errors: 0,
            total_errors: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.sink.name().to_string()).collect()
    }

    /// Total failures recorded for the sink called `name`.
    pub fn errors(&self, name: &str) -> Option<u64> {
        self.slots
            .iter()
            .find(|s| s.sink.name() == name)
            .map(|s| s.total_errors)
    }

    /// Deliver `result` to every sink. Returns how many accepted it.
    ///
    /// An error or a panic in one sink is counted against that sink only.
    pub fn dispatch(&mut self, result: &AnalysisResult) -> usize {
        let mut delivered = 0;
        for slot in &mut self.slots {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| slot.sink.accept(result)))
                .unwrap_or_else(|payload| {
                    Err(anyhow!("sink panicked: {}", panic_message(&*payload)))
                });
            match outcome {
                Ok(()) => {
                    if slot.consecutive_errors > 0 {
                        log::info!(
                            "result sink {} recovered after {} consecutive errors",
                            slot.sink.name(),
                            slot.consecutive_errors
                        );
                    }
                    slot.consecutive_errors = 0;
                    delivered += 1;
                }
                Err(err) => {
                    slot.consecutive_errors += 1;
                    slot.total_errors += 1;
                    log::warn!(
                        "result sink {} failed for camera {} frame {} ({} consecutive): {:#}",
                        slot.sink.name(),
                        result.camera_id,
                        result.sequence,
                        slot.consecutive_errors,
                        err
                    );
                }
            }
        }
        delivered
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Lock the shared distributor. A poisoned lock is recovered: sinks are
/// isolated by `dispatch`, so the slots are still consistent.
pub fn lock_distributor(shared: &SharedDistributor) -> MutexGuard<'_, Distributor> {
    shared.lock().unwrap_or_else(|poisoned| {
        log::warn!("result distributor lock was poisoned; recovering");
        poisoned.into_inner()
    })
}

/// Spawn the distribution thread.
///
/// Exits when `shutdown`'s sender is dropped or the result producer is gone.
pub fn spawn_distribution_worker(
    distributor: SharedDistributor,
    results: Consumer<AnalysisResult>,
    shutdown: Receiver<()>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("distribution".to_string())
        .spawn(move || {
            log::info!("distribution stage started");
            let mut forwarded: u64 = 0;
            loop {
                let next = select! {
                    recv(results.receiver()) -> msg => msg.ok(),
                    recv(shutdown) -> _ => None,
                };
                let Some(result) = next else { break };
                lock_distributor(&distributor).dispatch(&result);
                forwarded += 1;
            }
            log::info!("distribution stage stopped after {} results", forwarded);
        })
        .map_err(|e| anyhow!("spawn distribution thread: {}", e))
}
