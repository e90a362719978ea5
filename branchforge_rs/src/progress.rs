use std::sync::Mutex;
use std::sync::mpsc::Sender;

use serde::Serialize;
use tracing::info;

use crate::job::{JobId, JobStatus};

/// Point-in-time view of a running job, published at worker cadence.
/// `completed`, `passing` and `errored` are monotonic within a job;
/// `errored` branches are included in `completed`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub completed: u64,
    pub total: u64,
    pub passing: u64,
    pub errored: u64,
    pub status: JobStatus,
}

/// Injected observer for progress snapshots. Transports (SSE, polling)
/// live behind this trait outside the core.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, snapshot: &ProgressSnapshot);
}

/// Discards snapshots.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn publish(&self, _snapshot: &ProgressSnapshot) {}
}

/// Logs snapshots as structured tracing events.
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        info!(
            job_id = snapshot.job_id,
            completed = snapshot.completed,
            total = snapshot.total,
            passing = snapshot.passing,
            errored = snapshot.errored,
            status = ?snapshot.status,
            "job progress"
        );
    }
}

/// Forwards snapshots over a channel; used by tests and embedding callers
/// that drive their own transport.
pub struct ChannelProgressSink {
    sender: Mutex<Sender<ProgressSnapshot>>,
}

impl ChannelProgressSink {
    pub fn new(sender: Sender<ProgressSnapshot>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ProgressSink for ChannelProgressSink {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        if let Ok(sender) = self.sender.lock() {
            // Receiver may be gone after cancellation; dropping the
            // snapshot is fine.
            let _ = sender.send(*snapshot);
        }
    }
}

/// Worker-local publish cadence: counts branches since the last publication
/// and signals when a delta is due.
#[derive(Debug)]
pub struct PublishCadence {
    every: u64,
    pending: u64,
}

pub const DEFAULT_PUBLISH_EVERY: u64 = 500;

impl PublishCadence {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            pending: 0,
        }
    }

    /// Record one completed branch; true when a publication is due.
    pub fn record(&mut self) -> bool {
        self.record_many(1)
    }

    /// Record a block of completed branches at once (e.g. a skipped
    /// ticker's whole shard slice).
    pub fn record_many(&mut self, count: u64) -> bool {
        self.pending += count;
        self.pending >= self.every
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// Take the accumulated delta, resetting the counter.
    pub fn take(&mut self) -> u64 {
        std::mem::take(&mut self.pending)
    }
}
