//! Known-answer probing of the scoring engine.
//!
//! Every tick pushes the same payload through the primary engine under a
//! synthetic request id. Once warmed up, the first answer becomes the
//! baseline; answers that drift from it, or ticks that find no engine at
//! all, eventually restart the pipeline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use streamguard_common::RequestId;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::LivenessConfig;
use crate::engine::{EngineError, EngineMessage, EngineRegistry};
use crate::zone::ZoneThresholdManager;

/// Sent when no probe payload file is configured.
const DEFAULT_PROBE_PAYLOAD: &[u8] = b"streamguard-liveness-probe-v1";

const PROBE_MIME: &str = "image/jpeg";

/// Reports how long the host has been without user or network activity.
#[async_trait]
pub trait IdleDetector: Send + Sync {
    async fn idle_for(&self) -> Duration;
}

/// Idle time measured from the last intercepted response.
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdleDetector for ActivityClock {
    async fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    NoEngine,
    Mismatch,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEngine => write!(f, "no scoring engine"),
            Self::Mismatch => write!(f, "liveness mismatch"),
        }
    }
}

/// Tears the pipeline down and brings it back up.
pub trait RestartHandle: Send + Sync {
    fn restart(&self, reason: RestartReason);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Sent(RequestId),
    NoEngine { consecutive: u32 },
    Restarted(RestartReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Warmup { remaining: u32 },
    BaselineSet,
    Matched,
    Mismatch { count: u32 },
    Restarted,
}

#[derive(Debug, Default)]
struct ProbeState {
    sequence: u64,
    no_engine: u32,
    mismatches: u32,
    warmups_seen: u32,
    expected: Option<Vec<f64>>,
}

impl ProbeState {
    fn reset(&mut self) {
        *self = Self {
            sequence: self.sequence,
            ..Default::default()
        };
    }
}

pub struct CrashLivenessProbe {
    config: LivenessConfig,
    engines: Arc<EngineRegistry>,
    zones: Arc<ZoneThresholdManager>,
    payload: Bytes,
    idle: Arc<dyn IdleDetector>,
    restart: Arc<dyn RestartHandle>,
    state: Mutex<ProbeState>,
}

impl CrashLivenessProbe {
    pub fn new(
        config: LivenessConfig,
        engines: Arc<EngineRegistry>,
        zones: Arc<ZoneThresholdManager>,
        payload: Bytes,
        idle: Arc<dyn IdleDetector>,
        restart: Arc<dyn RestartHandle>,
    ) -> Self {
        let payload = if payload.is_empty() {
            Bytes::from_static(DEFAULT_PROBE_PAYLOAD)
        } else {
            payload
        };
        Self {
            config,
            engines,
            zones,
            payload,
            idle,
            restart,
            state: Mutex::new(ProbeState::default()),
        }
    }

    /// Run one probe round.
    pub async fn tick(&self) -> TickOutcome {
        let idle = self.idle.idle_for().await;
        if idle >= self.config.idle_threshold() {
            tracing::trace!(idle_secs = idle.as_secs(), "Skipping liveness probe while idle");
            return TickOutcome::Idle;
        }

        let request_id = {
            let mut state = self.state.lock();
            state.sequence += 1;
            RequestId::liveness_probe(state.sequence)
        };

        match self.send(&request_id) {
            Ok(()) => {
                self.state.lock().no_engine = 0;
                tracing::debug!(request_id = %request_id, "Liveness probe sent");
                TickOutcome::Sent(request_id)
            }
            Err(e) => self.no_engine(&e),
        }
    }

    fn send(&self, request_id: &RequestId) -> Result<(), EngineError> {
        let engine = self.engines.primary()?;
        engine.post(EngineMessage::Start {
            request_id: request_id.clone(),
            mime_type: PROBE_MIME.to_string(),
            url: request_id.to_string(),
            threshold: self.zones.threshold(),
        })?;
        engine.post(EngineMessage::OnData {
            request_id: request_id.clone(),
            data: self.payload.clone(),
        })?;
        engine.post(EngineMessage::OnStop {
            request_id: request_id.clone(),
        })
    }

    fn no_engine(&self, error: &EngineError) -> TickOutcome {
        let consecutive = {
            let mut state = self.state.lock();
            state.no_engine += 1;
            if state.no_engine >= self.config.no_engine_restart_threshold {
                state.reset();
                None
            } else {
                Some(state.no_engine)
            }
        };

        match consecutive {
            Some(consecutive) => {
                tracing::warn!(error = %error, consecutive, "Liveness probe found no engine");
                TickOutcome::NoEngine { consecutive }
            }
            None => {
                tracing::error!(error = %error, "No scoring engine for too long; restarting");
                self.restart.restart(RestartReason::NoEngine);
                TickOutcome::Restarted(RestartReason::NoEngine)
            }
        }
    }

    /// Compare a probe answer against the baseline.
    pub fn handle_result(&self, request_id: &RequestId, scores: &[f64]) -> ProbeVerdict {
        let verdict = {
            let mut state = self.state.lock();
            if state.warmups_seen < self.config.warmup_ticks {
                state.warmups_seen += 1;
                return ProbeVerdict::Warmup {
                    remaining: self.config.warmup_ticks - state.warmups_seen,
                };
            }

            let Some(expected) = state.expected.clone() else {
                tracing::info!(request_id = %request_id, ?scores, "Liveness baseline recorded");
                state.expected = Some(scores.to_vec());
                return ProbeVerdict::BaselineSet;
            };

            if within_tolerance(&expected, scores, self.config.tolerance) {
                return ProbeVerdict::Matched;
            }

            state.mismatches += 1;
            tracing::error!(
                request_id = %request_id,
                ?expected,
                actual = ?scores,
                mismatches = state.mismatches,
                "Liveness probe mismatch"
            );
            if state.mismatches >= self.config.mismatch_restart_threshold {
                state.reset();
                ProbeVerdict::Restarted
            } else {
                ProbeVerdict::Mismatch {
                    count: state.mismatches,
                }
            }
        };

        if verdict == ProbeVerdict::Restarted {
            self.restart.restart(RestartReason::Mismatch);
        }
        verdict
    }

    /// Probe on the configured interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }
            tracing::debug!("Liveness probe stopped");
        })
    }
}

fn within_tolerance(expected: &[f64], actual: &[f64], tolerance: f64) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(e, a)| (a - e).abs() < tolerance)
}
