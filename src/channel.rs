//! Bounded drop-newest channel.
//!
//! Both pipeline queues (cameras → processing, processing → distribution) use
//! this primitive. Producers never block: when the queue is full the item being
//! pushed is discarded and counted, and the producer returns immediately. Items
//! already queued are never evicted, so a full queue keeps its oldest entries.
//!
//! The consumer side is a plain crossbeam `Receiver`, so workers can block on
//! it inside `select!` together with the shutdown signal.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of a non-blocking push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the pushed item was discarded.
    Dropped,
    /// Consumer side is gone (pipeline stopping); the item was discarded.
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of channel counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub queued: u64,
    pub dropped: u64,
}

/// Create a bounded channel with the drop-newest policy.
///
/// A capacity of zero is raised to one; a rendezvous channel would turn every
/// push into a drop whenever the consumer is busy.
pub fn bounded<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let counters = Arc::new(Counters::default());
    (
        Producer {
            tx,
            counters: counters.clone(),
            capacity,
        },
        Consumer {
            rx,
            counters,
            capacity,
        },
    )
}

pub struct Producer<T> {
    tx: Sender<T>,
    counters: Arc<Counters>,
    capacity: usize,
}

// Manual impl: `T` itself need not be `Clone`.
impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            counters: self.counters.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> Producer<T> {
    /// Push without blocking.
    pub fn push(&self, item: T) -> PushOutcome {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        stats_of(&self.counters)
    }
}

pub struct Consumer<T> {
    rx: Receiver<T>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            counters: self.counters.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> Consumer<T> {
    /// Underlying receiver, for use in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Discard everything currently queued. Returns the number of items removed.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        stats_of(&self.counters)
    }
}

fn stats_of(counters: &Counters) -> ChannelStats {
    ChannelStats {
        queued: counters.queued.load(Ordering::Relaxed),
        dropped: counters.dropped.load(Ordering::Relaxed),
    }
}
