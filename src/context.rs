//! Shared pipeline state handed to every component.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::engine::{
    EngineError, EngineMessage, EngineRegistry, EngineReply, EngineSettings, PendingScans,
    ScanRequest, ScanResult, StatResult,
};
use crate::liveness::{ActivityClock, CrashLivenessProbe, RestartHandle, RestartReason};
use crate::status::StatusSink;
use crate::streams::ContainerStreamArena;
use crate::whitelist::UrlWhitelist;
use crate::zone::ZoneThresholdManager;

/// Everything sessions, the watchdog and the probe share.
pub struct PipelineContext {
    pub config: Config,
    pub engines: Arc<EngineRegistry>,
    pub pending: PendingScans,
    pub zones: Arc<ZoneThresholdManager>,
    pub streams: ContainerStreamArena,
    pub status: Arc<dyn StatusSink>,
    pub activity: Arc<ActivityClock>,
    pub whitelist: UrlWhitelist,
    /// Written in place of a blocked response.
    pub placeholder: Bytes,
}

impl PipelineContext {
    pub fn new(config: Config, status: Arc<dyn StatusSink>, placeholder: Bytes) -> Self {
        let engines = Arc::new(EngineRegistry::new(
            config.engine.backend_preference.clone(),
        ));
        let zones = Arc::new(ZoneThresholdManager::new(
            config.zone.clone(),
            Arc::clone(&engines),
        ));
        let whitelist = UrlWhitelist::from_config(&config.filter);
        Self {
            config,
            engines,
            pending: PendingScans::new(),
            zones,
            streams: ContainerStreamArena::new(),
            status,
            activity: Arc::new(ActivityClock::new()),
            whitelist,
            placeholder,
        }
    }

    /// Submit a scan round to the primary engine and wait for its result.
    pub async fn scan(&self, request: ScanRequest) -> Result<ScanResult, EngineError> {
        let engine = self.engines.primary()?;
        let request_id = request.request_id.clone();
        let reply = self.pending.register(request_id.clone());

        tracing::debug!(
            request_id = %request_id,
            engine = %engine.id(),
            buffers = request.buffers.len(),
            bytes = request.payload_len(),
            scan_start = request.scan_start,
            scan_step = request.scan_step,
            "Submitting scan round"
        );
        if let Err(e) = engine.post(EngineMessage::ChunkScan(request)) {
            self.pending.cancel(&request_id);
            return Err(e);
        }

        reply
            .await
            .map_err(|_| EngineError::ReplyDropped(request_id.to_string()))
    }

    fn settings(&self) -> EngineSettings {
        EngineSettings {
            threshold: self.zones.threshold(),
            zone: self.zones.zone(),
        }
    }

    /// Route one engine reply to whoever is waiting for it.
    pub fn handle_reply(&self, reply: EngineReply, probe: Option<&CrashLivenessProbe>) {
        match reply {
            EngineReply::ChunkScan { request_id, result } => {
                if let Some(error) = &result.error {
                    tracing::warn!(request_id = %request_id, error = %error, "Engine reported scan error");
                }
                self.pending.resolve(&request_id, result);
            }
            EngineReply::Scan { request_id, scores } => {
                if !request_id.is_liveness_probe() {
                    tracing::debug!(request_id = %request_id, "Ignoring single-item scan reply");
                    return;
                }
                match probe {
                    Some(probe) => {
                        probe.handle_result(&request_id, &scores);
                    }
                    None => tracing::debug!(request_id = %request_id, "No liveness probe running"),
                }
            }
            EngineReply::Stat { request_id, result } => {
                tracing::trace!(request_id = %request_id, result = ?result, "Engine stat");
                match result {
                    StatResult::Pass => {
                        self.zones.record_outcome(false);
                    }
                    StatResult::Block => {
                        self.zones.record_outcome(true);
                    }
                    StatResult::Tiny | StatResult::Error => {}
                }
            }
            EngineReply::Registration {
                processor_id,
                backend,
            } => {
                if self.engines.register(&processor_id, &backend) {
                    let settings = self.settings();
                    if let Err(e) = self
                        .engines
                        .post_to(&processor_id, EngineMessage::Settings(settings))
                    {
                        tracing::warn!(engine = %processor_id, error = %e, "Failed to send settings");
                    }
                }
            }
        }
    }

    /// Drain engine replies until every sender is gone.
    pub fn spawn_reply_router(
        self: &Arc<Self>,
        mut replies: mpsc::UnboundedReceiver<EngineReply>,
        probe: Option<Arc<CrashLivenessProbe>>,
    ) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                ctx.handle_reply(reply, probe.as_deref());
            }
            tracing::debug!("Engine reply channel closed");
        })
    }
}

/// Called after engine state is dropped so the embedder can respawn engines.
pub type RespawnHook = Arc<dyn Fn(RestartReason) + Send + Sync>;

/// Full pipeline restart: drop every engine connection, every pending scan
/// and all stream state, then ask the embedder to bring engines back.
///
/// A session whose scan was dropped counts it as a failed scan; one whose
/// stream went quiet as well is left to the watchdog.
pub struct PipelineRestart {
    ctx: Arc<PipelineContext>,
    respawn: Option<RespawnHook>,
}

impl PipelineRestart {
    pub fn new(ctx: Arc<PipelineContext>, respawn: Option<RespawnHook>) -> Self {
        Self { ctx, respawn }
    }
}

impl RestartHandle for PipelineRestart {
    fn restart(&self, reason: RestartReason) {
        let engines = self.ctx.engines.clear();
        let pending = self.ctx.pending.clear();
        let groups = self.ctx.streams.clear();
        tracing::error!(reason = %reason, engines, pending, groups, "Restarting pipeline");
        if let Some(respawn) = &self.respawn {
            respawn(reason);
        }
    }
}
