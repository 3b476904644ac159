//! Scoring engine connections.
//!
//! Engines run outside this crate (worker processes, GPU hosts, in-process
//! models). Each one is reached through a [`ScoringEngine`] handle that
//! accepts [`EngineMessage`]s; replies come back as [`EngineReply`]s and are
//! routed by request id.

pub mod messages;
mod pending;
mod registry;

pub use messages::{
    EngineMessage, EngineReply, EngineSettings, FrameScore, ScanRequest, ScanResult, StatResult,
};
pub use pending::PendingScans;
pub use registry::{EngineInfo, EngineRegistry};

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no scoring engine available for backend {0:?}")]
    Unavailable(Option<String>),

    #[error("engine {engine} rejected message: {reason}")]
    DispatchFailed { engine: String, reason: String },

    #[error("reply for request {0} was dropped")]
    ReplyDropped(String),
}

/// Handle to one scoring engine.
pub trait ScoringEngine: Send + Sync {
    /// Stable identifier of this engine connection.
    fn id(&self) -> &str;

    /// Queue a message for the engine. Must not block.
    fn post(&self, message: EngineMessage) -> Result<(), EngineError>;
}

/// Engine reached over an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelEngine {
    id: String,
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl ChannelEngine {
    /// Create an engine handle and the receiving end the engine reads from.
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<EngineMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }
}

impl ScoringEngine for ChannelEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn post(&self, message: EngineMessage) -> Result<(), EngineError> {
        self.tx.send(message).map_err(|_| EngineError::DispatchFailed {
            engine: self.id.clone(),
            reason: "engine channel closed".to_string(),
        })
    }
}
