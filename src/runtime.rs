//! A running pipeline: context, controller, and the background tasks.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{load_payload, validate_config, Config};
use crate::context::{PipelineContext, PipelineRestart, RespawnHook};
use crate::engine::{EngineReply, ScoringEngine};
use crate::filter::StreamFilterController;
use crate::liveness::{CrashLivenessProbe, IdleDetector};
use crate::status::StatusSink;
use crate::watchdog::WatchdogMonitor;

pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    controller: Arc<StreamFilterController>,
    watchdog: Arc<WatchdogMonitor>,
    probe: Arc<CrashLivenessProbe>,
    replies: mpsc::UnboundedSender<EngineReply>,
    reply_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineReply>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build a pipeline from validated config. Nothing runs until [`start`].
    ///
    /// [`start`]: Pipeline::start
    pub fn new(
        config: Config,
        status: Arc<dyn StatusSink>,
        respawn: Option<RespawnHook>,
    ) -> Result<Self> {
        validate_config(&config)?;
        let placeholder = load_payload(config.filter.placeholder_path.as_deref())?;
        let probe_payload = load_payload(config.liveness.probe_path.as_deref())?;

        let ctx = Arc::new(PipelineContext::new(config, status, placeholder));
        let controller = Arc::new(StreamFilterController::new(Arc::clone(&ctx)));
        let watchdog = Arc::new(WatchdogMonitor::new(
            ctx.config.watchdog.clone(),
            controller.tables(),
        ));

        let idle: Arc<dyn IdleDetector> = ctx.activity.clone();
        let restart = Arc::new(PipelineRestart::new(Arc::clone(&ctx), respawn));
        let probe = Arc::new(CrashLivenessProbe::new(
            ctx.config.liveness.clone(),
            Arc::clone(&ctx.engines),
            Arc::clone(&ctx.zones),
            probe_payload,
            idle,
            restart,
        ));

        let (replies, reply_rx) = mpsc::unbounded_channel();
        Ok(Self {
            ctx,
            controller,
            watchdog,
            probe,
            replies,
            reply_rx: Mutex::new(Some(reply_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn controller(&self) -> &Arc<StreamFilterController> {
        &self.controller
    }

    pub fn watchdog(&self) -> &Arc<WatchdogMonitor> {
        &self.watchdog
    }

    pub fn probe(&self) -> &Arc<CrashLivenessProbe> {
        &self.probe
    }

    /// Where engines send their replies.
    pub fn reply_sender(&self) -> mpsc::UnboundedSender<EngineReply> {
        self.replies.clone()
    }

    /// Attach an engine. It takes scans once its registration reply arrives.
    pub fn connect_engine(&self, engine: Arc<dyn ScoringEngine>) {
        self.ctx.engines.connect(engine);
    }

    /// Spawn the reply router, the watchdog and the liveness probe.
    ///
    /// Returns false when the pipeline was already started.
    pub fn start(&self) -> bool {
        let Some(reply_rx) = self.reply_rx.lock().take() else {
            tracing::warn!("Pipeline already started");
            return false;
        };

        let router = self
            .ctx
            .spawn_reply_router(reply_rx, Some(Arc::clone(&self.probe)));
        let watchdog = Arc::clone(&self.watchdog).spawn(self.shutdown.clone());
        let probe = Arc::clone(&self.probe).spawn(self.shutdown.clone());
        self.tasks.lock().extend([router, watchdog, probe]);

        tracing::info!(
            zone = %self.ctx.zones.zone(),
            threshold = self.ctx.zones.threshold(),
            backend = ?self.ctx.engines.primary_backend(),
            "Pipeline started"
        );
        true
    }

    /// Stop the background tasks. Running sessions are left to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            // The router only ends when every reply sender is gone.
            task.abort();
            let _ = task.await;
        }
        tracing::info!("Pipeline stopped");
    }
}
