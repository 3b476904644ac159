//! Messages exchanged with scoring engines.
//!
//! Every message is a closed, internally tagged enum so a reply that does
//! not fit one of the known shapes fails to decode instead of being
//! half-handled.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use streamguard_common::{MediaKind, RequestId, Zone};

/// Messages sent to a scoring engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    /// Open a single-item stream (used by the liveness probe).
    Start {
        request_id: RequestId,
        mime_type: String,
        url: String,
        threshold: f64,
    },
    /// Payload bytes for a stream opened with `Start`.
    OnData { request_id: RequestId, data: Bytes },
    /// End of a stream opened with `Start`.
    OnStop { request_id: RequestId },
    /// Score a batch of buffers in one round.
    ChunkScan(ScanRequest),
    /// Zone threshold changed.
    ThresholdChange { threshold: f64 },
    /// Full settings, sent when an engine registers.
    Settings(EngineSettings),
}

/// One scan round submitted by a filter session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub request_id: RequestId,
    /// Groups the rounds of one logical media stream.
    pub video_chain_id: String,
    pub kind: MediaKind,
    pub url: String,
    pub mime_type: String,
    pub buffers: Vec<Bytes>,
    /// Media time of the first frame to sample.
    pub scan_start: f64,
    /// Seconds between sampled frames.
    pub scan_step: f64,
    pub scan_max_steps: u32,
    /// The engine stops early after this many blocked frames.
    pub scan_block_bail_count: u32,
}

impl ScanRequest {
    pub fn payload_len(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }
}

/// Scores for one sampled frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameScore {
    pub time: f64,
    pub score: f64,
    pub blocked: bool,
}

/// Result of a `ChunkScan` round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_count: u32,
    pub block_count: u32,
    #[serde(default)]
    pub frames: Vec<FrameScore>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-item outcome reported after an engine finishes an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatResult {
    Pass,
    Block,
    Tiny,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub threshold: f64,
    pub zone: Zone,
}

/// Messages received from a scoring engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineReply {
    /// Class scores of a single-item stream.
    Scan {
        request_id: RequestId,
        scores: Vec<f64>,
    },
    ChunkScan {
        request_id: RequestId,
        result: ScanResult,
    },
    Stat {
        request_id: RequestId,
        result: StatResult,
    },
    Registration {
        processor_id: String,
        backend: String,
    },
}
