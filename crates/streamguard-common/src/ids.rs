//! Typed identifier wrappers.
//!
//! Request and correlation ids are opaque strings handed to us by the
//! interception layer; stream ids are minted locally for each rendition that
//! gets indexed. Wrapping them keeps a correlation id from being passed where
//! a request id is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix reserved for synthetic requests injected by the liveness probe.
const LIVENESS_PREFIX: &str = "crash-detection-";

/// Identifier of one physical intercepted request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an id supplied by the interception layer.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Synthetic id used by the `n`th liveness probe tick.
    pub fn liveness_probe(n: u64) -> Self {
        Self(format!("{LIVENESS_PREFIX}{n}"))
    }

    /// Whether this id belongs to a liveness probe request.
    pub fn is_liveness_probe(&self) -> bool {
        self.0.starts_with(LIVENESS_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by every physical request of one logical playback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one indexed rendition within a correlation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a new random stream ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for StreamId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_probe_ids() {
        let id = RequestId::liveness_probe(7);
        assert_eq!(id.as_str(), "crash-detection-7");
        assert!(id.is_liveness_probe());
        assert!(!RequestId::new("4211").is_liveness_probe());
    }

    #[test]
    fn test_request_id_serialization() {
        let id = RequestId::new("req-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"req-1\"");
        let back: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_stream_id_creation() {
        let id1 = StreamId::new();
        let id2 = StreamId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_correlation_id_display() {
        let id = CorrelationId::from("cpn-abc");
        assert_eq!(format!("{}", id), "cpn-abc");
    }
}
