//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds a full [`Pipeline`] with a
//! placeholder file, a scripted [`FakeEngine`] that is already registered,
//! and a [`RecordingStatus`] sink. Responses are fed through
//! [`RecordingFilter`]s so tests can inspect exactly what was written.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use streamguard::config::Config;
use streamguard::engine::{ChannelEngine, EngineMessage, EngineReply, ScanRequest, ScanResult};
use streamguard::filter::{FilterError, ResponseDetails, ResponseFilter, SessionHandle};
use streamguard::liveness::RestartReason;
use streamguard::status::StatusSink;
use streamguard::Pipeline;
use streamguard_common::{MediaKind, Outcome, RequestId};

pub const PLACEHOLDER: &[u8] = b"PLACEHOLDER-IMAGE";
pub const ENGINE_ID: &str = "engine-1";

/// What the fake engine does with the next chunk scan.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(ScanResult),
    /// Never answer.
    Silent,
}

pub fn counts(scan_count: u32, block_count: u32) -> Reply {
    Reply::Result(ScanResult {
        scan_count,
        block_count,
        ..Default::default()
    })
}

pub fn scan_error(message: &str) -> Reply {
    Reply::Result(ScanResult {
        error: Some(message.to_string()),
        ..Default::default()
    })
}

/// Scoring engine answering chunk scans from a script.
///
/// Unscripted scans pass with one scanned frame. Liveness probes are
/// answered with [`FakeEngine::set_probe_scores`].
pub struct FakeEngine {
    script: Arc<Mutex<VecDeque<Reply>>>,
    probe_scores: Arc<Mutex<Vec<f64>>>,
    seen: mpsc::UnboundedReceiver<ScanRequest>,
}

impl FakeEngine {
    fn spawn(
        mut rx: mpsc::UnboundedReceiver<EngineMessage>,
        replies: mpsc::UnboundedSender<EngineReply>,
    ) -> Self {
        let script: Arc<Mutex<VecDeque<Reply>>> = Arc::default();
        let probe_scores = Arc::new(Mutex::new(vec![0.05, 0.95]));
        let (seen_tx, seen) = mpsc::unbounded_channel();

        let task_script = Arc::clone(&script);
        let task_scores = Arc::clone(&probe_scores);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    EngineMessage::ChunkScan(request) => {
                        let reply = task_script.lock().pop_front().unwrap_or(counts(1, 0));
                        let request_id = request.request_id.clone();
                        let _ = seen_tx.send(request);
                        if let Reply::Result(result) = reply {
                            let _ = replies.send(EngineReply::ChunkScan { request_id, result });
                        }
                    }
                    EngineMessage::OnStop { request_id } => {
                        let scores = task_scores.lock().clone();
                        let _ = replies.send(EngineReply::Scan { request_id, scores });
                    }
                    _ => {}
                }
            }
        });

        Self {
            script,
            probe_scores,
            seen,
        }
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.script.lock().extend(replies);
    }

    pub fn set_probe_scores(&self, scores: Vec<f64>) {
        *self.probe_scores.lock() = scores;
    }

    /// Wait for the next chunk scan the engine received.
    pub async fn next_request(&mut self) -> ScanRequest {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.seen.recv())
            .await
            .expect("engine saw no scan request")
            .expect("engine task ended")
    }

    /// Chunk scans received so far that were not yet taken.
    pub fn drain_requests(&mut self) -> Vec<ScanRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.seen.try_recv() {
            requests.push(request);
        }
        requests
    }
}

#[derive(Debug, Default)]
pub struct FilterLog {
    pub written: Vec<u8>,
    pub writes: usize,
    pub closed: bool,
    pub disconnected: bool,
}

/// Response filter that records everything done to it.
#[derive(Clone, Default)]
pub struct RecordingFilter {
    log: Arc<Mutex<FilterLog>>,
}

impl RecordingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<u8> {
        self.log.lock().written.clone()
    }

    pub fn closed(&self) -> bool {
        self.log.lock().closed
    }

    pub fn disconnected(&self) -> bool {
        self.log.lock().disconnected
    }
}

impl ResponseFilter for RecordingFilter {
    fn write(&mut self, data: Bytes) -> Result<(), FilterError> {
        let mut log = self.log.lock();
        if log.closed || log.disconnected {
            return Err(FilterError::Closed);
        }
        log.written.extend_from_slice(&data);
        log.writes += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().closed = true;
    }

    fn disconnect(&mut self) {
        self.log.lock().disconnected = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Started(RequestId, MediaKind),
    Progress(RequestId),
    Completed(RequestId, MediaKind, Outcome),
}

#[derive(Default)]
pub struct RecordingStatus {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingStatus {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().clone()
    }

    pub fn completions(&self, request_id: &RequestId) -> Vec<Outcome> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StatusEvent::Completed(id, _, outcome) if id == request_id => Some(*outcome),
                _ => None,
            })
            .collect()
    }

    pub fn progress_count(&self, request_id: &RequestId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, StatusEvent::Progress(id) if id == request_id))
            .count()
    }
}

impl StatusSink for RecordingStatus {
    fn started(&self, request_id: &RequestId, kind: MediaKind) {
        self.events
            .lock()
            .push(StatusEvent::Started(request_id.clone(), kind));
    }

    fn progress(&self, request_id: &RequestId) {
        self.events.lock().push(StatusEvent::Progress(request_id.clone()));
    }

    fn completed(&self, request_id: &RequestId, kind: MediaKind, outcome: Outcome) {
        self.events
            .lock()
            .push(StatusEvent::Completed(request_id.clone(), kind, outcome));
    }
}

/// Test harness wrapping a started [`Pipeline`] with one registered engine.
pub struct TestHarness {
    pub pipeline: Pipeline,
    pub engine: FakeEngine,
    pub status: Arc<RecordingStatus>,
    pub restarts: Arc<Mutex<Vec<RestartReason>>>,
    _placeholder: NamedTempFile,
}

impl TestHarness {
    /// Create a new harness with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a new harness with a custom configuration.
    pub fn with_config(mut config: Config) -> Self {
        let mut placeholder = NamedTempFile::new().expect("failed to create placeholder file");
        placeholder
            .write_all(PLACEHOLDER)
            .expect("failed to write placeholder");
        config.filter.placeholder_path = Some(placeholder.path().to_path_buf());

        let status = Arc::new(RecordingStatus::default());
        let restarts: Arc<Mutex<Vec<RestartReason>>> = Arc::default();
        let restart_log = Arc::clone(&restarts);
        let pipeline = Pipeline::new(
            config,
            status.clone(),
            Some(Arc::new(move |reason: RestartReason| restart_log.lock().push(reason))),
        )
        .expect("failed to build pipeline");

        let (channel, rx) = ChannelEngine::new(ENGINE_ID);
        let engine = FakeEngine::spawn(rx, pipeline.reply_sender());
        pipeline.connect_engine(Arc::new(channel));
        pipeline.context().handle_reply(
            EngineReply::Registration {
                processor_id: ENGINE_ID.into(),
                backend: "webgl".into(),
            },
            None,
        );
        pipeline.start();

        Self {
            pipeline,
            engine,
            status,
            restarts,
            _placeholder: placeholder,
        }
    }

    /// Intercept a response and return its session with the filter it writes to.
    pub fn open(&self, details: ResponseDetails) -> (Option<SessionHandle>, RecordingFilter) {
        let filter = RecordingFilter::new();
        let handle = self.pipeline.controller().intercept(details, filter.clone());
        (handle, filter)
    }
}

pub fn image(id: &str) -> ResponseDetails {
    ResponseDetails::new(RequestId::new(id), format!("https://img.example/{id}.jpg"), "image/jpeg")
}

pub fn video(id: &str) -> ResponseDetails {
    ResponseDetails::new(RequestId::new(id), format!("https://cdn.example/{id}.mp4"), "video/mp4")
}

/// A fragmented video range request carrying its correlation in the URL.
pub fn range_request(id: &str, cpn: &str, start: usize, end: usize) -> ResponseDetails {
    ResponseDetails::new(
        RequestId::new(id),
        format!("https://cdn.example/videoplayback?cpn={cpn}&range={start}-{end}&itag=137"),
        "video/mp4",
    )
}

pub fn chunk(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

fn fragment(total: usize) -> Vec<u8> {
    let moof = boxed(b"moof", &[0u8; 16]);
    let mdat = boxed(b"mdat", &vec![0x5A; total - moof.len() - 8]);
    [moof, mdat].concat()
}

fn sidx(refs: &[u32]) -> Vec<u8> {
    let mut payload = vec![0, 0, 0, 0];
    payload.extend_from_slice(&1u32.to_be_bytes());
    payload.extend_from_slice(&1000u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&(refs.len() as u16).to_be_bytes());
    for &size in refs {
        payload.extend_from_slice(&size.to_be_bytes());
        payload.extend_from_slice(&2000u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
    }
    boxed(b"sidx", &payload)
}

/// A fragmented MP4 rendition and the offset its first fragment starts at.
///
/// A width of zero gives an audio-only rendition.
pub fn rendition(width: u32, sizes: &[u32]) -> (Vec<u8>, usize) {
    let mut tkhd = vec![0u8; 84];
    tkhd[76..80].copy_from_slice(&(width << 16).to_be_bytes());
    tkhd[80..84].copy_from_slice(&((width * 9 / 16) << 16).to_be_bytes());
    let moov = boxed(b"moov", &boxed(b"trak", &boxed(b"tkhd", &tkhd)));
    let mut file = [boxed(b"ftyp", b"dash\0\0\0\0"), moov, sidx(sizes)].concat();
    let data_start = file.len();
    for &size in sizes {
        file.extend(fragment(size as usize));
    }
    (file, data_start)
}
