//! Per-request status reporting.
//!
//! Filter sessions report start, progress, and exactly one terminal outcome
//! per request. Where those reports go (UI counters, telemetry) is up to
//! the embedding application.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use streamguard_common::{MediaKind, Outcome, RequestId};

pub trait StatusSink: Send + Sync {
    fn started(&self, request_id: &RequestId, kind: MediaKind);

    /// A scan round passed and its window was released.
    fn progress(&self, request_id: &RequestId);

    /// Terminal outcome. Called at most once per request.
    fn completed(&self, request_id: &RequestId, kind: MediaKind, outcome: Outcome);
}

/// Counters over every reported request.
#[derive(Debug, Default)]
pub struct StatusCounters {
    started: AtomicU64,
    progress: AtomicU64,
    passed: AtomicU64,
    blocked: AtomicU64,
    errored: AtomicU64,
    images: AtomicU64,
    videos: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub started: u64,
    pub progress: u64,
    pub passed: u64,
    pub blocked: u64,
    pub errored: u64,
    pub images: u64,
    pub videos: u64,
}

impl StatusSnapshot {
    pub fn in_flight(&self) -> u64 {
        self.started
            .saturating_sub(self.passed + self.blocked + self.errored)
    }
}

impl StatusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            started: self.started.load(Ordering::Relaxed),
            progress: self.progress.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            images: self.images.load(Ordering::Relaxed),
            videos: self.videos.load(Ordering::Relaxed),
        }
    }
}

impl StatusSink for StatusCounters {
    fn started(&self, request_id: &RequestId, kind: MediaKind) {
        self.started.fetch_add(1, Ordering::Relaxed);
        match kind {
            MediaKind::Image => self.images.fetch_add(1, Ordering::Relaxed),
            MediaKind::Video => self.videos.fetch_add(1, Ordering::Relaxed),
        };
        tracing::debug!(request_id = %request_id, kind = %kind, "Filtering started");
    }

    fn progress(&self, request_id: &RequestId) {
        self.progress.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(request_id = %request_id, "Scan window released");
    }

    fn completed(&self, request_id: &RequestId, kind: MediaKind, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Pass => &self.passed,
            Outcome::Block => &self.blocked,
            Outcome::Error => &self.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::info!(request_id = %request_id, kind = %kind, outcome = %outcome, "Filtering complete");
    }
}
