//! Shared state of fragmented media streams.
//!
//! One logical playback issues many range requests, often for several
//! renditions at once. Their filter sessions meet here, grouped by
//! correlation id. A group's lock is held across match-then-claim so two
//! chunks of the same stream never both claim the same fragment.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use streamguard_common::{CorrelationId, StreamId, StreamStatus};
use streamguard_media::{ContainerIndex, Fragment};

use crate::filter::verdict::ScanCounts;

/// A fragment some session has taken responsibility for scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmedFragment {
    pub range: Range<u64>,
    pub status: StreamStatus,
}

/// One rendition of a logical stream.
#[derive(Debug)]
pub struct ContainerStream {
    pub id: StreamId,
    pub rendition: Option<String>,
    pub index: ContainerIndex,
    /// Keyed by start offset; ranges never overlap.
    fragments: BTreeMap<u64, ConfirmedFragment>,
    pub counts: ScanCounts,
    pub status: StreamStatus,
}

impl ContainerStream {
    fn new(index: ContainerIndex, rendition: Option<String>) -> Self {
        Self {
            id: StreamId::new(),
            rendition,
            index,
            fragments: BTreeMap::new(),
            counts: ScanCounts::default(),
            status: StreamStatus::Unknown,
        }
    }

    pub fn fragments(&self) -> impl Iterator<Item = &ConfirmedFragment> {
        self.fragments.values()
    }

    fn overlapping(&self, range: &Range<u64>) -> impl Iterator<Item = &ConfirmedFragment> + '_ {
        let start = range.start;
        self.fragments
            .range(..range.end)
            .rev()
            .map(|(_, f)| f)
            .take_while(move |f| f.range.end > start)
    }

    /// Take every fragment not already confirmed. Returns the fresh ones
    /// and whether any already-confirmed overlap was blocked.
    fn claim(&mut self, fragments: Vec<Fragment>) -> (Vec<Fragment>, bool) {
        let mut fresh = Vec::new();
        let mut known_block = false;
        for fragment in fragments {
            let (overlapped, blocked) = {
                let mut overlaps = self.overlapping(&fragment.range).peekable();
                let overlapped = overlaps.peek().is_some();
                (overlapped, overlaps.any(|f| f.status == StreamStatus::Block))
            };
            if overlapped {
                known_block |= blocked;
                continue;
            }
            self.fragments.insert(
                fragment.range.start,
                ConfirmedFragment {
                    range: fragment.range.clone(),
                    status: StreamStatus::Unknown,
                },
            );
            fresh.push(fragment);
        }
        (fresh, known_block)
    }
}

/// Every rendition sharing one correlation id.
#[derive(Debug)]
pub struct StreamGroup {
    pub correlation: CorrelationId,
    pub status: StreamStatus,
    pub counts: ScanCounts,
    pub streams: Vec<ContainerStream>,
}

impl StreamGroup {
    fn new(correlation: CorrelationId) -> Self {
        Self {
            correlation,
            status: StreamStatus::Unknown,
            counts: ScanCounts::default(),
            streams: Vec::new(),
        }
    }

    fn stream_mut(&mut self, id: StreamId) -> Option<&mut ContainerStream> {
        self.streams.iter_mut().find(|s| s.id == id)
    }
}

/// Result of matching a chunk's fragments against a group.
#[derive(Debug)]
pub enum StreamMatch {
    /// No stream was ever indexed under this correlation id.
    NoGroup,
    /// No rendition in the group recognises the fragments.
    NoMatch,
    /// The matched rendition carries no video.
    AudioOnly(StreamId),
    /// The group, the rendition, or an overlapping fragment is already blocked.
    Blocked(StreamId),
    Matched {
        stream_id: StreamId,
        init_segment: Bytes,
        /// Fragments this caller now owns; may be empty when every
        /// fragment was already claimed.
        fresh: Vec<Fragment>,
        /// Media time the fresh fragments cover, when the index knows it.
        duration_secs: Option<f64>,
    },
}

/// Totals after a scan round was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTotals {
    pub stream: ScanCounts,
    pub group: ScanCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub id: String,
    pub family: String,
    pub rendition: Option<String>,
    pub status: StreamStatus,
    pub fragments: usize,
    pub counts: ScanCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub correlation: String,
    pub status: StreamStatus,
    pub counts: ScanCounts,
    pub streams: Vec<StreamSummary>,
}

/// Stream groups keyed by correlation id.
#[derive(Debug, Default)]
pub struct ContainerStreamArena {
    groups: DashMap<CorrelationId, Arc<Mutex<StreamGroup>>>,
}

impl ContainerStreamArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&self, correlation: &CorrelationId) -> Option<Arc<Mutex<StreamGroup>>> {
        self.groups.get(correlation).map(|g| Arc::clone(g.value()))
    }

    /// Register a freshly indexed rendition.
    pub fn add_stream(
        &self,
        correlation: &CorrelationId,
        index: ContainerIndex,
        rendition: Option<String>,
    ) -> StreamId {
        let group = self
            .groups
            .entry(correlation.clone())
            .or_insert_with(|| Arc::new(Mutex::new(StreamGroup::new(correlation.clone()))))
            .clone();

        let stream = ContainerStream::new(index, rendition);
        let id = stream.id;
        tracing::info!(
            correlation = %correlation,
            stream_id = %id,
            family = %stream.index.family(),
            entries = stream.index.entry_count(),
            audio_only = stream.index.is_audio_only(),
            "Indexed container stream"
        );
        group.lock().streams.push(stream);
        id
    }

    pub fn group_status(&self, correlation: &CorrelationId) -> Option<StreamStatus> {
        self.group(correlation).map(|g| g.lock().status)
    }

    /// Find the rendition the fragments belong to and claim the new ones.
    pub fn match_fragments(&self, correlation: &CorrelationId, fragments: Vec<Fragment>) -> StreamMatch {
        let Some(group) = self.group(correlation) else {
            return StreamMatch::NoGroup;
        };
        let mut group = group.lock();
        let group_blocked = group.status == StreamStatus::Block;

        let Some(stream) = group.streams.iter_mut().find(|s| s.index.matches(&fragments)) else {
            tracing::debug!(
                correlation = %correlation,
                fragments = fragments.len(),
                "No rendition matched"
            );
            return StreamMatch::NoMatch;
        };

        if stream.index.is_audio_only() {
            return StreamMatch::AudioOnly(stream.id);
        }
        if group_blocked || stream.status == StreamStatus::Block {
            return StreamMatch::Blocked(stream.id);
        }

        let (fresh, known_block) = stream.claim(fragments);
        if known_block && fresh.is_empty() {
            return StreamMatch::Blocked(stream.id);
        }
        StreamMatch::Matched {
            stream_id: stream.id,
            init_segment: stream.index.init_segment().clone(),
            duration_secs: stream.index.duration_secs(&fresh),
            fresh,
        }
    }

    /// Add a round's counts to its stream and group.
    pub fn record_round(
        &self,
        correlation: &CorrelationId,
        stream_id: StreamId,
        round: ScanCounts,
    ) -> Option<RoundTotals> {
        let group = self.group(correlation)?;
        let mut group = group.lock();
        group.counts.add(round);
        let group_counts = group.counts;
        let stream = group.stream_mut(stream_id)?;
        stream.counts.add(round);
        Some(RoundTotals {
            stream: stream.counts,
            group: group_counts,
        })
    }

    /// Record the verdict for fragments scanned in one round.
    ///
    /// A block verdict also blocks the stream and its whole group, so
    /// later requests for any rendition are refused without scanning.
    pub fn settle(
        &self,
        correlation: &CorrelationId,
        stream_id: StreamId,
        fragments: &[Fragment],
        status: StreamStatus,
    ) {
        let Some(group) = self.group(correlation) else {
            return;
        };
        let mut group = group.lock();
        if status == StreamStatus::Block {
            group.status = StreamStatus::Block;
        }
        let Some(stream) = group.stream_mut(stream_id) else {
            return;
        };
        for fragment in fragments {
            if let Some(confirmed) = stream.fragments.get_mut(&fragment.range.start) {
                confirmed.status = status;
            }
        }
        stream.index.mark(fragments, status);
        if status == StreamStatus::Block {
            stream.status = StreamStatus::Block;
            tracing::info!(correlation = %correlation, stream_id = %stream_id, "Stream blocked");
        }
    }

    pub fn summaries(&self) -> Vec<GroupSummary> {
        let groups: Vec<Arc<Mutex<StreamGroup>>> =
            self.groups.iter().map(|g| Arc::clone(g.value())).collect();
        let mut summaries: Vec<GroupSummary> = groups
            .iter()
            .map(|group| {
                let group = group.lock();
                GroupSummary {
                    correlation: group.correlation.to_string(),
                    status: group.status,
                    counts: group.counts,
                    streams: group
                        .streams
                        .iter()
                        .map(|s| StreamSummary {
                            id: s.id.to_string(),
                            family: s.index.family().to_string(),
                            rendition: s.rendition.clone(),
                            status: s.status,
                            fragments: s.fragments.len(),
                            counts: s.counts,
                        })
                        .collect(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.correlation.cmp(&b.correlation));
        summaries
    }

    pub fn clear(&self) -> usize {
        let count = self.groups.len();
        self.groups.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamguard_media::fmp4::extract_fragments;
    use streamguard_media::ContainerFamily;

    fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    fn rendition(width: u32, sizes: &[u32]) -> Vec<u8> {
        let mut tkhd = vec![0u8; 84];
        tkhd[76..80].copy_from_slice(&(width << 16).to_be_bytes());
        tkhd[80..84].copy_from_slice(&(width << 15).to_be_bytes());
        let moov = boxed(b"moov", &boxed(b"trak", &boxed(b"tkhd", &tkhd)));

        let mut sidx = vec![0u8; 4];
        sidx.extend_from_slice(&1u32.to_be_bytes());
        sidx.extend_from_slice(&1000u32.to_be_bytes());
        sidx.extend_from_slice(&[0u8; 8]);
        sidx.extend_from_slice(&0u16.to_be_bytes());
        sidx.extend_from_slice(&(sizes.len() as u16).to_be_bytes());
        for &size in sizes {
            sidx.extend_from_slice(&size.to_be_bytes());
            sidx.extend_from_slice(&1000u32.to_be_bytes());
            sidx.extend_from_slice(&0u32.to_be_bytes());
        }

        let mut file = [boxed(b"ftyp", b"dash\0\0\0\0"), moov, boxed(b"sidx", &sidx)].concat();
        for &size in sizes {
            let moof = boxed(b"moof", &[0u8; 16]);
            let mdat = boxed(b"mdat", &vec![7u8; size as usize - moof.len() - 8]);
            file.extend(moof);
            file.extend(mdat);
        }
        file
    }

    fn indexed(arena: &ContainerStreamArena, id: &CorrelationId, file: &[u8]) -> (StreamId, usize) {
        let index = ContainerIndex::build(ContainerFamily::Mp4, file).unwrap();
        let data_start = index.data_start();
        (arena.add_stream(id, index, None), data_start)
    }

    #[test]
    fn test_unknown_correlation() {
        let arena = ContainerStreamArena::new();
        let outcome = arena.match_fragments(&CorrelationId::new("nope"), Vec::new());
        assert!(matches!(outcome, StreamMatch::NoGroup));
        assert_eq!(arena.group_status(&CorrelationId::new("nope")), None);
    }

    #[test]
    fn test_matches_correct_rendition_and_claims_once() {
        let arena = ContainerStreamArena::new();
        let cpn = CorrelationId::new("cpn1");
        let low = rendition(640, &[300, 320, 340]);
        let high = rendition(1920, &[900, 950, 1000]);
        let (_, _) = indexed(&arena, &cpn, &low);
        let (high_id, start) = indexed(&arena, &cpn, &high);

        let fragments = extract_fragments(&high[start..], start as u64, false);
        match arena.match_fragments(&cpn, fragments.clone()) {
            StreamMatch::Matched { stream_id, fresh, init_segment, duration_secs } => {
                assert_eq!(duration_secs, Some(3.0));
                assert_eq!(stream_id, high_id);
                assert_eq!(fresh.len(), 3);
                assert!(!init_segment.is_empty());
            }
            other => panic!("unexpected match: {:?}", other),
        }

        // The same bytes requested again claim nothing new.
        match arena.match_fragments(&cpn, fragments) {
            StreamMatch::Matched { fresh, .. } => assert!(fresh.is_empty()),
            other => panic!("unexpected match: {:?}", other),
        }
    }

    #[test]
    fn test_foreign_fragments_do_not_match() {
        let arena = ContainerStreamArena::new();
        let cpn = CorrelationId::new("cpn2");
        indexed(&arena, &cpn, &rendition(640, &[300, 320]));

        let other = rendition(640, &[500, 520]);
        let start = ContainerIndex::build(ContainerFamily::Mp4, &other)
            .unwrap()
            .data_start();
        let fragments = extract_fragments(&other[start..], start as u64, false);
        assert!(matches!(arena.match_fragments(&cpn, fragments), StreamMatch::NoMatch));
    }

    #[test]
    fn test_block_propagates_to_group() {
        let arena = ContainerStreamArena::new();
        let cpn = CorrelationId::new("cpn3");
        let file = rendition(1280, &[400, 400, 400]);
        let (id, start) = indexed(&arena, &cpn, &file);

        let fragments = extract_fragments(&file[start..], start as u64, false);
        let StreamMatch::Matched { fresh, .. } = arena.match_fragments(&cpn, fragments.clone()) else {
            panic!("expected a match");
        };

        let totals = arena.record_round(&cpn, id, ScanCounts::new(10, 4)).unwrap();
        assert_eq!(totals.stream, ScanCounts::new(10, 4));
        assert_eq!(totals.group, ScanCounts::new(10, 4));

        arena.settle(&cpn, id, &fresh, StreamStatus::Block);
        assert_eq!(arena.group_status(&cpn), Some(StreamStatus::Block));
        assert!(matches!(arena.match_fragments(&cpn, fragments), StreamMatch::Blocked(_)));

        let summary = &arena.summaries()[0];
        assert_eq!(summary.streams[0].fragments, 3);
        assert_eq!(summary.streams[0].status, StreamStatus::Block);
    }

    #[test]
    fn test_overlap_with_blocked_fragment_is_blocked() {
        let mut stream = ContainerStream::new(
            ContainerIndex::build(ContainerFamily::Mp4, &rendition(640, &[300])).unwrap(),
            None,
        );
        stream.fragments.insert(
            100,
            ConfirmedFragment {
                range: 100..200,
                status: StreamStatus::Block,
            },
        );
        let fragment = Fragment {
            range: 150..250,
            payload: Bytes::from_static(b"x"),
            complete: true,
            fallback: false,
        };
        let (fresh, known_block) = stream.claim(vec![fragment]);
        assert!(fresh.is_empty());
        assert!(known_block);
    }
}
