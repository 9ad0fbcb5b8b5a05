//! Bounded single-consumer handoff from the frame context to the
//! persistence context (spec §4.4).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::lap::FinalizedLap;

/// Matches the capacity named in the spec: persistence falling behind by
/// more than this many laps is a catastrophic-lag scenario, not steady
/// state, and should fall back to direct save instead of growing further.
pub const DEFAULT_CAPACITY: usize = 100;

/// Producer handle. Cheap to clone (an `mpsc::Sender` plus a shared
/// counter) so both the Indexer's emit path and the retry path can hold one.
#[derive(Clone)]
pub struct SaveQueue {
    tx: mpsc::Sender<FinalizedLap>,
    pending: Arc<AtomicUsize>,
}

/// Consumer handle, owned by the Lap Saver worker task.
pub struct SaveQueueReceiver {
    rx: mpsc::Receiver<FinalizedLap>,
    pending: Arc<AtomicUsize>,
}

impl SaveQueue {
    pub fn new(capacity: usize) -> (Self, SaveQueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                pending: pending.clone(),
            },
            SaveQueueReceiver { rx, pending },
        )
    }

    pub fn with_default_capacity() -> (Self, SaveQueueReceiver) {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Non-blocking enqueue. On failure (queue full, or the worker side
    /// has been dropped) the lap is handed back so the caller can fall
    /// through to direct-save (spec §4.4, §4.5.4b).
    pub fn try_enqueue(&self, lap: FinalizedLap) -> Result<(), FinalizedLap> {
        match self.tx.try_send(lap) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(lap)) => Err(lap),
            Err(mpsc::error::TrySendError::Closed(lap)) => Err(lap),
        }
    }

    /// Snapshot of how many laps are currently queued, used by the
    /// Supervisor's health probe (queue size < 20 check).
    pub fn pending_len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl SaveQueueReceiver {
    pub async fn recv(&mut self) -> Option<FinalizedLap> {
        let lap = self.rx.recv().await;
        if lap.is_some() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        lap
    }

    /// Drain whatever is currently buffered without waiting, used on
    /// shutdown to flush laps left after the bounded drain wait (spec
    /// §4.7).
    pub fn drain(&mut self) -> Vec<FinalizedLap> {
        let mut drained = Vec::new();
        while let Ok(lap) = self.rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            drained.push(lap);
        }
        drained
    }
}
