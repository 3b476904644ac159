use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::{EngineError, EngineMessage, ScoringEngine};

/// Public view of a connected engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub id: String,
    /// Backend announced at registration; `None` until the engine registers.
    pub backend: Option<String>,
    pub connected_at: DateTime<Utc>,
}

struct Entry {
    engine: Arc<dyn ScoringEngine>,
    info: EngineInfo,
}

/// Connected scoring engines and backend selection.
///
/// Only engines running the first preferred backend are ever selected.
/// An in-process variant of that backend (`inproc` prefix) counts as the
/// same backend.
pub struct EngineRegistry {
    engines: DashMap<String, Entry>,
    preference: Vec<String>,
}

impl EngineRegistry {
    pub fn new(preference: Vec<String>) -> Self {
        Self {
            engines: DashMap::new(),
            preference,
        }
    }

    pub fn primary_backend(&self) -> Option<&str> {
        self.preference.first().map(String::as_str)
    }

    /// Add an engine connection. It is not selectable until it registers.
    pub fn connect(&self, engine: Arc<dyn ScoringEngine>) {
        let id = engine.id().to_string();
        tracing::info!(engine = %id, "Scoring engine connected");
        let info = EngineInfo {
            id: id.clone(),
            backend: None,
            connected_at: Utc::now(),
        };
        self.engines.insert(id, Entry { engine, info });
    }

    /// Record the backend an engine announced. Returns false for unknown engines.
    pub fn register(&self, id: &str, backend: &str) -> bool {
        match self.engines.get_mut(id) {
            Some(mut entry) => {
                tracing::info!(engine = %id, backend = %backend, "Scoring engine registered");
                entry.info.backend = Some(backend.to_string());
                true
            }
            None => {
                tracing::warn!(engine = %id, backend = %backend, "Registration from unknown engine");
                false
            }
        }
    }

    pub fn disconnect(&self, id: &str) -> bool {
        let removed = self.engines.remove(id).is_some();
        if removed {
            tracing::info!(engine = %id, "Scoring engine disconnected");
        }
        removed
    }

    /// Drop every connection. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let count = self.engines.len();
        self.engines.clear();
        count
    }

    /// The engine that scans go to.
    ///
    /// When several engines run the primary backend the one with the
    /// lowest id wins, so selection is stable across calls.
    pub fn primary(&self) -> Result<Arc<dyn ScoringEngine>, EngineError> {
        let unavailable = || EngineError::Unavailable(self.primary_backend().map(str::to_string));
        let preferred = self.primary_backend().ok_or_else(unavailable)?;

        self.engines
            .iter()
            .filter(|entry| {
                entry
                    .info
                    .backend
                    .as_deref()
                    .is_some_and(|backend| backend_matches(preferred, backend))
            })
            .min_by(|a, b| a.key().cmp(b.key()))
            .map(|entry| Arc::clone(&entry.engine))
            .ok_or_else(unavailable)
    }

    pub fn post_to(&self, id: &str, message: EngineMessage) -> Result<(), EngineError> {
        let engine = self
            .engines
            .get(id)
            .map(|entry| Arc::clone(&entry.engine))
            .ok_or_else(|| EngineError::Unavailable(None))?;
        engine.post(message)
    }

    /// Send a message to every connected engine. Returns how many accepted it.
    pub fn broadcast(&self, message: &EngineMessage) -> usize {
        let engines: Vec<Arc<dyn ScoringEngine>> = self
            .engines
            .iter()
            .map(|entry| Arc::clone(&entry.engine))
            .collect();

        engines
            .into_iter()
            .filter(|engine| match engine.post(message.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(engine = %engine.id(), error = %e, "Broadcast failed");
                    false
                }
            })
            .count()
    }

    pub fn list(&self) -> Vec<EngineInfo> {
        let mut infos: Vec<EngineInfo> = self.engines.iter().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

fn backend_matches(preferred: &str, backend: &str) -> bool {
    fn base(name: &str) -> &str {
        name.strip_prefix("inproc").unwrap_or(name)
    }
    base(preferred) == base(backend)
}
