//! Response interception.
//!
//! [`StreamFilterController`] decides which responses are filtered and
//! spawns one session task per filtered response. The session buffers
//! body chunks, submits scan rounds to the scoring engine, and releases,
//! replaces or passes bytes through the caller's [`ResponseFilter`].

pub mod request;
mod session;
pub mod verdict;

use std::sync::Arc;

use bytes::Bytes;
use streamguard_common::{CorrelationId, MediaKind, Outcome, RequestId, StreamStatus};
use streamguard_media::ContainerFamily;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::VideoMode;
use crate::context::PipelineContext;
use crate::watchdog::OpenFilterTable;

pub use request::{QueryCorrelation, ResponseDetails};
pub use session::SessionState;
pub use verdict::{is_this_scan_block, is_total_scan_block, ScanCounts};

use session::{FragmentPlan, Output, ScanPlan, ScanSession};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Response stream already closed")]
    Closed,

    #[error("Response write failed: {0}")]
    Write(String),
}

/// Outbound side of an intercepted response.
pub trait ResponseFilter: Send + 'static {
    fn write(&mut self, data: Bytes) -> Result<(), FilterError>;

    /// Finish the response with what was written.
    fn close(&mut self);

    /// Stop filtering; the remaining original bytes flow through untouched.
    fn disconnect(&mut self);
}

/// Signals from the stream source.
#[derive(Debug)]
pub enum FilterEvent {
    Data(Bytes),
    Stop,
    Error(String),
}

/// Feeds one filtered response.
#[derive(Debug)]
pub struct SessionHandle {
    request_id: RequestId,
    events: mpsc::UnboundedSender<FilterEvent>,
    task: JoinHandle<Option<Outcome>>,
}

impl SessionHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Deliver a body chunk. Returns false once the session has finished.
    pub fn data(&self, chunk: Bytes) -> bool {
        self.events.send(FilterEvent::Data(chunk)).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.events.send(FilterEvent::Stop).is_ok()
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.events.send(FilterEvent::Error(reason.into())).is_ok()
    }

    /// Wait for the session. `None` means the watchdog ended it.
    pub async fn finished(self) -> Option<Outcome> {
        drop(self.events);
        self.task.await.ok().flatten()
    }
}

/// Which flow handles a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Ignore,
    Image,
    Video,
    Fragmented {
        family: ContainerFamily,
        correlation: CorrelationId,
        range_start: u64,
    },
}

impl Route {
    pub fn kind(&self) -> Option<MediaKind> {
        match self {
            Self::Ignore => None,
            Self::Image => Some(MediaKind::Image),
            Self::Video | Self::Fragmented { .. } => Some(MediaKind::Video),
        }
    }
}

pub struct StreamFilterController {
    ctx: Arc<PipelineContext>,
    images: Arc<OpenFilterTable>,
    videos: Arc<OpenFilterTable>,
}

impl StreamFilterController {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let images = Self::table(&ctx, "image", MediaKind::Image);
        let videos = Self::table(&ctx, "video", MediaKind::Video);
        Self {
            ctx,
            images,
            videos,
        }
    }

    fn table(ctx: &Arc<PipelineContext>, name: &'static str, kind: MediaKind) -> Arc<OpenFilterTable> {
        let status = Arc::clone(&ctx.status);
        Arc::new(OpenFilterTable::new(
            name,
            Arc::new(move |request_id: &RequestId, outcome: Outcome| {
                status.completed(request_id, kind, outcome)
            }),
        ))
    }

    /// Open-session tables for the watchdog.
    pub fn tables(&self) -> Vec<Arc<OpenFilterTable>> {
        vec![Arc::clone(&self.images), Arc::clone(&self.videos)]
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn route(&self, details: &ResponseDetails) -> Route {
        if self.ctx.whitelist.is_whitelisted(&details.url) || !details.is_success() {
            return Route::Ignore;
        }
        match details.media_kind() {
            Some(MediaKind::Image) => Route::Image,
            Some(MediaKind::Video) => {
                if self.ctx.config.filter.video_mode == VideoMode::Disabled {
                    return Route::Ignore;
                }
                // Without a byte range the chunk cannot be placed in the file.
                match (&details.correlation, details.container_family(), details.range_start) {
                    (Some(correlation), Some(family), Some(range_start)) => Route::Fragmented {
                        family,
                        correlation: correlation.clone(),
                        range_start,
                    },
                    _ => Route::Video,
                }
            }
            None => Route::Ignore,
        }
    }

    /// Take over a response. Returns `None` when the response needs no
    /// session: it was ignored, or answered from a blocked stream group.
    pub fn intercept<F: ResponseFilter>(
        &self,
        details: ResponseDetails,
        mut filter: F,
    ) -> Option<SessionHandle> {
        self.ctx.activity.touch();
        let details = details.with_query_correlation();
        let route = self.route(&details);
        tracing::debug!(
            request_id = %details.request_id,
            mime_type = %details.mime_type,
            route = ?route,
            "Intercepted response"
        );

        let kind = route.kind();
        let plan = match route {
            Route::Ignore => {
                filter.disconnect();
                return None;
            }
            Route::Image | Route::Video => ScanPlan::Plain,
            Route::Fragmented {
                family,
                correlation,
                range_start,
            } => {
                if self.ctx.streams.group_status(&correlation) == Some(StreamStatus::Block) {
                    self.answer_blocked(&details, filter);
                    return None;
                }
                ScanPlan::Fragmented(FragmentPlan {
                    family,
                    correlation,
                    range_start,
                    data_start: None,
                })
            }
        };

        let kind = kind.unwrap_or(MediaKind::Video);
        Some(self.spawn_session(details, kind, plan, filter))
    }

    fn answer_blocked<F: ResponseFilter>(&self, details: &ResponseDetails, filter: F) {
        self.ctx.status.started(&details.request_id, MediaKind::Video);
        let mut output = Output::new(filter);
        output.block(&self.ctx.placeholder, true, details.content_length);
        tracing::info!(
            request_id = %details.request_id,
            correlation = ?details.correlation,
            "Stream group blocked; answered with placeholder"
        );
        self.ctx
            .status
            .completed(&details.request_id, MediaKind::Video, Outcome::Block);
    }

    fn spawn_session<F: ResponseFilter>(
        &self,
        details: ResponseDetails,
        kind: MediaKind,
        plan: ScanPlan,
        filter: F,
    ) -> SessionHandle {
        let table = match kind {
            MediaKind::Image => Arc::clone(&self.images),
            MediaKind::Video => Arc::clone(&self.videos),
        };
        let request_id = details.request_id.clone();
        let cancel = table.open(request_id.clone());
        self.ctx.status.started(&request_id, kind);

        let (events, rx) = mpsc::unbounded_channel();
        let session = ScanSession::new(Arc::clone(&self.ctx), details, kind, plan, table, filter);
        let task = tokio::spawn(session.run(rx, cancel));
        SessionHandle {
            request_id,
            events,
            task,
        }
    }
}
