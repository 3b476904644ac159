//! Per-response scan state machine.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use streamguard_common::{CorrelationId, MediaKind, Outcome, StreamId, StreamStatus};
use streamguard_media::{ContainerFamily, ContainerIndex, Fragment};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::request::ResponseDetails;
use super::verdict::{is_this_scan_block, is_total_scan_block, ScanCounts};
use super::{FilterEvent, ResponseFilter};
use crate::config::VideoMode;
use crate::context::PipelineContext;
use crate::engine::ScanRequest;
use crate::scheduler::AdaptiveScanScheduler;
use crate::streams::StreamMatch;
use crate::watchdog::OpenFilterTable;

const PAD_CHUNK: usize = 1024;
static ZEROS: [u8; PAD_CHUNK] = [0; PAD_CHUNK];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    PassSoFar,
    Scanning,
    Pass,
    Block,
    Error,
}

impl SessionState {
    pub fn outcome(self) -> Option<Outcome> {
        match self {
            Self::Pass => Some(Outcome::Pass),
            Self::Block => Some(Outcome::Block),
            Self::Error => Some(Outcome::Error),
            Self::PassSoFar | Self::Scanning => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.outcome().is_some()
    }
}

/// Outbound side of a filtered response. Nothing is written once it is
/// closed or disconnected.
pub(crate) struct Output<F> {
    filter: F,
    written: u64,
    finished: bool,
}

impl<F: ResponseFilter> Output<F> {
    pub(crate) fn new(filter: F) -> Self {
        Self {
            filter,
            written: 0,
            finished: false,
        }
    }

    pub(crate) fn write(&mut self, data: Bytes) {
        if self.finished || data.is_empty() {
            return;
        }
        let len = data.len() as u64;
        match self.filter.write(data) {
            Ok(()) => self.written += len,
            Err(e) => {
                tracing::warn!(error = %e, "Response write failed; dropping output");
                self.finished = true;
            }
        }
    }

    fn write_all(&mut self, buffers: &[Bytes]) {
        for buffer in buffers {
            self.write(buffer.clone());
        }
    }

    pub(crate) fn close(&mut self) {
        if !self.finished {
            self.finished = true;
            self.filter.close();
        }
    }

    pub(crate) fn disconnect(&mut self) {
        if !self.finished {
            self.finished = true;
            self.filter.disconnect();
        }
    }

    /// Replace the rest of the response.
    ///
    /// The placeholder goes out only when nothing was released yet; zero
    /// padding then fills the output up to the declared length.
    pub(crate) fn block(&mut self, placeholder: &Bytes, first_flush: bool, content_length: Option<u64>) {
        if first_flush {
            let data = match content_length {
                Some(len) if (placeholder.len() as u64) > len => placeholder.slice(..len as usize),
                _ => placeholder.clone(),
            };
            self.write(data);
        }
        if let Some(len) = content_length {
            let mut remaining = len.saturating_sub(self.written);
            while remaining > 0 && !self.finished {
                let n = remaining.min(PAD_CHUNK as u64) as usize;
                self.write(Bytes::from_static(&ZEROS[..n]));
                remaining -= n as u64;
            }
        }
        self.close();
    }
}

/// How a session turns buffered bytes into scan rounds.
#[derive(Debug, Clone)]
pub(crate) enum ScanPlan {
    /// Scan the whole prefix received so far.
    Plain,
    /// Scan only the container fragments found in each new window.
    Fragmented(FragmentPlan),
}

#[derive(Debug, Clone)]
pub(crate) struct FragmentPlan {
    pub family: ContainerFamily,
    pub correlation: CorrelationId,
    pub range_start: u64,
    /// Where payload starts, once this session indexed the stream itself.
    pub data_start: Option<u64>,
}

struct FragmentTarget {
    correlation: CorrelationId,
    stream_id: StreamId,
    fragments: Vec<Fragment>,
    duration_secs: Option<f64>,
}

enum ScanUnit {
    Scan {
        request: ScanRequest,
        target: Option<FragmentTarget>,
    },
    /// Release the window without scanning it.
    Skip(&'static str),
    /// Let the rest of the response through untouched.
    PassThrough(&'static str),
    Blocked,
}

fn concat(buffers: &[Bytes]) -> Bytes {
    if let [single] = buffers {
        return single.clone();
    }
    let mut out = BytesMut::with_capacity(buffers.iter().map(Bytes::len).sum());
    for buffer in buffers {
        out.extend_from_slice(buffer);
    }
    out.freeze()
}

pub(crate) struct ScanSession<F> {
    ctx: Arc<PipelineContext>,
    details: ResponseDetails,
    kind: MediaKind,
    plan: ScanPlan,
    table: Arc<OpenFilterTable>,
    output: Output<F>,
    state: SessionState,
    buffers: Vec<Bytes>,
    total_size: u64,
    /// Buffers `flush_start..flush_end` form the window being decided.
    flush_start: usize,
    flush_end: usize,
    /// Bytes in `buffers[..flush_end]`.
    scanned_size: u64,
    counts: ScanCounts,
    errors: u32,
    scheduler: AdaptiveScanScheduler,
    input_closed: bool,
    deferred: Option<FilterEvent>,
}

impl<F: ResponseFilter> ScanSession<F> {
    pub(crate) fn new(
        ctx: Arc<PipelineContext>,
        details: ResponseDetails,
        kind: MediaKind,
        plan: ScanPlan,
        table: Arc<OpenFilterTable>,
        filter: F,
    ) -> Self {
        let scheduler = AdaptiveScanScheduler::new(
            ctx.config.scheduler.clone(),
            ctx.config.filter.scan_start_secs,
        );
        Self {
            ctx,
            details,
            kind,
            plan,
            table,
            output: Output::new(filter),
            state: SessionState::PassSoFar,
            buffers: Vec::new(),
            total_size: 0,
            flush_start: 0,
            flush_end: 0,
            scanned_size: 0,
            counts: ScanCounts::default(),
            errors: 0,
            scheduler,
            input_closed: false,
            deferred: None,
        }
    }

    /// Drive the session to its outcome, or until the watchdog cancels it.
    ///
    /// Returns `None` when cancelled; the watchdog has then reported the
    /// outcome already.
    pub(crate) async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<FilterEvent>,
        cancel: CancellationToken,
    ) -> Option<Outcome> {
        let request_id = self.details.request_id.clone();
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = self.drive(&mut events) => Some(outcome),
        };

        match finished {
            Some(outcome) => {
                if self.table.close(&request_id) {
                    self.ctx.status.completed(&request_id, self.kind, outcome);
                }
                tracing::info!(
                    request_id = %request_id,
                    kind = %self.kind,
                    outcome = %outcome,
                    bytes = self.total_size,
                    scans = self.counts.scan_count,
                    blocks = self.counts.block_count,
                    errors = self.errors,
                    "Filter finished"
                );
                Some(outcome)
            }
            None => {
                self.ctx.pending.cancel(&request_id);
                self.output.disconnect();
                tracing::warn!(
                    request_id = %request_id,
                    state = ?self.state,
                    "Filter abandoned after watchdog expiry"
                );
                None
            }
        }
    }

    async fn drive(&mut self, events: &mut mpsc::UnboundedReceiver<FilterEvent>) -> Outcome {
        loop {
            let event = match self.deferred.take() {
                Some(event) => event,
                None if self.input_closed => FilterEvent::Stop,
                None => events.recv().await.unwrap_or(FilterEvent::Stop),
            };

            match event {
                FilterEvent::Data(chunk) => {
                    self.push(chunk);
                    // Chunks taken in during a round can fill the next window.
                    let threshold = self.ctx.config.filter.scan_threshold_bytes;
                    while !self.state.is_terminal() && self.total_size - self.scanned_size >= threshold {
                        self.scan_round(events).await;
                    }
                }
                FilterEvent::Stop => {
                    self.input_closed = true;
                    if self.flush_end < self.buffers.len() {
                        self.scan_round(events).await;
                    }
                    if !self.state.is_terminal() {
                        // Windows are released by their own rounds.
                        self.output.write_all(&self.buffers[self.flush_end..]);
                        self.output.close();
                        self.state = SessionState::Pass;
                    }
                }
                FilterEvent::Error(reason) => {
                    self.input_closed = true;
                    tracing::warn!(
                        request_id = %self.details.request_id,
                        reason = %reason,
                        "Response stream failed"
                    );
                    self.output.disconnect();
                    self.state = SessionState::Error;
                }
            }

            if let Some(outcome) = self.state.outcome() {
                return outcome;
            }
        }
    }

    fn push(&mut self, chunk: Bytes) {
        self.total_size += chunk.len() as u64;
        self.table.touch(&self.details.request_id);
        self.ctx.activity.touch();
        tracing::trace!(
            request_id = %self.details.request_id,
            len = chunk.len(),
            total = self.total_size,
            "Buffered chunk"
        );
        self.buffers.push(chunk);
    }

    async fn scan_round(&mut self, events: &mut mpsc::UnboundedReceiver<FilterEvent>) {
        self.state = SessionState::Scanning;
        self.flush_start = self.flush_end;
        self.flush_end = self.buffers.len();
        let window_offset = self.scanned_size;
        self.scanned_size = self.total_size;

        let unit = if matches!(self.plan, ScanPlan::Plain) {
            self.plain_unit()
        } else {
            self.fragment_unit(window_offset)
        };

        match unit {
            ScanUnit::Skip(reason) => {
                tracing::debug!(request_id = %self.details.request_id, reason, "Window released unscanned");
                self.release_window();
            }
            ScanUnit::PassThrough(reason) => {
                tracing::info!(request_id = %self.details.request_id, reason, "Passing rest of response");
                self.finish_open(SessionState::Pass);
            }
            ScanUnit::Blocked => {
                tracing::info!(request_id = %self.details.request_id, "Stream already blocked");
                self.block();
            }
            ScanUnit::Scan { request, target } => self.submit(request, target, events).await,
        }
    }

    fn plain_unit(&self) -> ScanUnit {
        let filter = &self.ctx.config.filter;
        let (max_steps, bail) = match (self.kind, filter.video_mode) {
            (MediaKind::Image, _) => (filter.scan_max_steps, filter.image_block_bail_count),
            (MediaKind::Video, VideoMode::Enabled) => {
                (filter.scan_max_steps, filter.scan_block_bail_count)
            }
            (MediaKind::Video, _) => (filter.fragment_scan_max_steps, filter.scan_block_bail_count),
        };
        ScanUnit::Scan {
            request: ScanRequest {
                request_id: self.details.request_id.clone(),
                video_chain_id: self.details.request_id.to_string(),
                kind: self.kind,
                url: self.details.url.clone(),
                mime_type: self.details.mime_type.clone(),
                buffers: self.buffers[..self.flush_end].to_vec(),
                scan_start: self.scheduler.next_start(),
                scan_step: self.scheduler.step(),
                scan_max_steps: max_steps,
                scan_block_bail_count: bail,
            },
            target: None,
        }
    }

    fn fragment_unit(&mut self, window_offset: u64) -> ScanUnit {
        let ScanPlan::Fragmented(plan) = &mut self.plan else {
            return ScanUnit::Skip("not fragmented");
        };
        let request_id = &self.details.request_id;

        if plan.range_start == 0 && plan.data_start.is_none() {
            let prefix = concat(&self.buffers[..self.flush_end]);
            let family = ContainerFamily::sniff(&prefix).unwrap_or(plan.family);
            match ContainerIndex::build(family, &prefix) {
                Ok(index) => {
                    plan.family = family;
                    plan.data_start = Some(index.data_start() as u64);
                    self.ctx.streams.add_stream(
                        &plan.correlation,
                        index,
                        self.details.rendition.clone(),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        correlation = %plan.correlation,
                        error = %e,
                        "Container index not built"
                    );
                    return ScanUnit::Skip("index not built");
                }
            }
        }

        let window = concat(&self.buffers[self.flush_start..self.flush_end]);
        let file_offset = plan.range_start + window_offset;
        // The init segment of an offset-zero response is not a fragment.
        let skip = plan
            .data_start
            .map_or(0, |start| start.saturating_sub(file_offset))
            .min(window.len() as u64) as usize;
        let fragments = plan
            .family
            .extract_fragments(&window[skip..], file_offset + skip as u64);
        if fragments.is_empty() {
            return ScanUnit::Skip("no fragments");
        }

        match self.ctx.streams.match_fragments(&plan.correlation, fragments) {
            StreamMatch::NoGroup => ScanUnit::Skip("unknown correlation"),
            StreamMatch::NoMatch => ScanUnit::Skip("no matching rendition"),
            StreamMatch::AudioOnly(_) => ScanUnit::PassThrough("audio-only stream"),
            StreamMatch::Blocked(_) => ScanUnit::Blocked,
            StreamMatch::Matched { fresh, .. } if fresh.is_empty() => {
                ScanUnit::Skip("fragments already claimed")
            }
            StreamMatch::Matched {
                stream_id,
                init_segment,
                fresh,
                duration_secs,
            } => {
                let filter = &self.ctx.config.filter;
                let mut buffers = Vec::with_capacity(fresh.len() + 1);
                buffers.push(init_segment);
                buffers.extend(fresh.iter().map(|f| f.payload.clone()));
                ScanUnit::Scan {
                    request: ScanRequest {
                        request_id: request_id.clone(),
                        video_chain_id: format!("{}:{}", plan.correlation, stream_id),
                        kind: MediaKind::Video,
                        url: self.details.url.clone(),
                        mime_type: self.details.mime_type.clone(),
                        buffers,
                        scan_start: filter.scan_start_secs,
                        scan_step: self.scheduler.step(),
                        scan_max_steps: filter.fragment_scan_max_steps,
                        scan_block_bail_count: filter.fragment_block_bail_count,
                    },
                    target: Some(FragmentTarget {
                        correlation: plan.correlation.clone(),
                        stream_id,
                        fragments: fresh,
                        duration_secs,
                    }),
                }
            }
        }
    }

    async fn submit(
        &mut self,
        request: ScanRequest,
        target: Option<FragmentTarget>,
        events: &mut mpsc::UnboundedReceiver<FilterEvent>,
    ) {
        let bail = request.scan_block_bail_count;
        let step = request.scan_step;
        let ctx = Arc::clone(&self.ctx);
        let started = Instant::now();

        let scan = ctx.scan(request);
        tokio::pin!(scan);
        // Keep taking chunks while the engine works so nothing is lost if
        // the verdict fails open.
        let result = loop {
            tokio::select! {
                result = &mut scan => break result,
                event = events.recv(), if !self.input_closed => match event {
                    Some(FilterEvent::Data(chunk)) => self.push(chunk),
                    Some(other) => {
                        self.input_closed = true;
                        self.deferred = Some(other);
                    }
                    None => self.input_closed = true,
                },
            }
        };
        let elapsed = started.elapsed();

        let round = match result {
            Ok(result) => {
                if result.error.is_some() {
                    self.errors += 1;
                }
                Some(result)
            }
            Err(e) => {
                self.errors += 1;
                tracing::warn!(
                    request_id = %self.details.request_id,
                    error = %e,
                    errors = self.errors,
                    "Scan round failed"
                );
                None
            }
        };

        let mut block = false;
        if let Some(result) = &round {
            let counts = ScanCounts::from(result);
            self.counts.add(counts);
            block = is_this_scan_block(counts, bail) || is_total_scan_block(self.counts);

            let covered = target
                .as_ref()
                .and_then(|t| t.duration_secs)
                .unwrap_or(result.scan_count as f64 * step);
            self.scheduler.advance(covered);

            if let Some(target) = &target {
                let streams = &self.ctx.streams;
                if let Some(totals) = streams.record_round(&target.correlation, target.stream_id, counts) {
                    block = block
                        || is_total_scan_block(totals.stream)
                        || is_total_scan_block(totals.group);
                }
                let status = if block { StreamStatus::Block } else { StreamStatus::Pass };
                streams.settle(&target.correlation, target.stream_id, &target.fragments, status);
            }

            tracing::debug!(
                request_id = %self.details.request_id,
                scan_count = counts.scan_count,
                block_count = counts.block_count,
                total_scans = self.counts.scan_count,
                total_blocks = self.counts.block_count,
                elapsed_ms = elapsed.as_millis() as u64,
                block,
                "Scan round complete"
            );
        }

        let filter = &self.ctx.config.filter;
        if block {
            self.block();
        } else if self.errors >= filter.error_limit {
            tracing::warn!(
                request_id = %self.details.request_id,
                errors = self.errors,
                "Too many scan errors; failing open"
            );
            self.finish_open(SessionState::Error);
        } else if self.scanned_size >= filter.full_pass_bytes
            || self.scheduler.covered_secs() >= filter.full_pass_duration_secs as f64
        {
            tracing::info!(
                request_id = %self.details.request_id,
                bytes = self.scanned_size,
                covered_secs = self.scheduler.covered_secs(),
                "Full pass reached"
            );
            self.finish_open(SessionState::Pass);
        } else {
            self.release_window();
            if let Some(result) = &round {
                self.scheduler.record_latency(elapsed, result.scan_count);
            }
        }
    }

    fn release_window(&mut self) {
        self.output
            .write_all(&self.buffers[self.flush_start..self.flush_end]);
        self.state = SessionState::PassSoFar;
        self.ctx.status.progress(&self.details.request_id);
    }

    /// Write everything not yet released and stop filtering.
    fn finish_open(&mut self, state: SessionState) {
        self.output.write_all(&self.buffers[self.flush_start..]);
        self.output.disconnect();
        self.state = state;
    }

    fn block(&mut self) {
        self.output.block(
            &self.ctx.placeholder,
            self.flush_start == 0,
            self.details.content_length,
        );
        self.state = SessionState::Block;
    }
}
