use dashmap::DashMap;
use streamguard_common::RequestId;
use tokio::sync::oneshot;

use super::ScanResult;

/// Scan rounds waiting for their engine reply, keyed by request id.
#[derive(Debug, Default)]
pub struct PendingScans {
    waiting: DashMap<RequestId, oneshot::Sender<ScanResult>>,
}

impl PendingScans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a round and get the receiver its reply will arrive on.
    ///
    /// A request id has at most one round in flight; registering again
    /// drops the earlier waiter.
    pub fn register(&self, request_id: RequestId) -> oneshot::Receiver<ScanResult> {
        let (tx, rx) = oneshot::channel();
        if self.waiting.insert(request_id.clone(), tx).is_some() {
            tracing::warn!(request_id = %request_id, "Replaced pending scan round");
        }
        rx
    }

    /// Deliver a reply. Returns false when nobody is waiting for it.
    pub fn resolve(&self, request_id: &RequestId, result: ScanResult) -> bool {
        match self.waiting.remove(request_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => {
                tracing::debug!(request_id = %request_id, "Reply for unknown scan round");
                false
            }
        }
    }

    pub fn cancel(&self, request_id: &RequestId) {
        self.waiting.remove(request_id);
    }

    /// Drop every waiter; their receivers see the reply as dropped.
    pub fn clear(&self) -> usize {
        let count = self.waiting.len();
        self.waiting.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
