//! Container-independent view of indexed streams and their fragments.

use std::ops::Range;

use bytes::Bytes;
use serde::Serialize;
use streamguard_common::StreamStatus;

use crate::ebml::{self, WebmIndex};
use crate::fmp4::{self, FragmentedMp4Index};
use crate::mp4::AtomType;
use crate::Result;

/// Container families that can be split into independent fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFamily {
    /// ISO-BMFF boxes (`moof`/`mdat` fragments).
    Mp4,
    /// EBML elements (Matroska/WebM clusters).
    Webm,
}

impl ContainerFamily {
    /// Detect the family from a `Content-Type` value.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "video/mp4" | "audio/mp4" | "video/iso.segment" => Some(Self::Mp4),
            "video/webm" | "audio/webm" | "video/x-matroska" => Some(Self::Webm),
            _ => None,
        }
    }

    /// Detect the family from the first bytes of a file.
    pub fn sniff(buf: &[u8]) -> Option<Self> {
        if buf.get(4..8) == Some(&AtomType::FTYP.0[..]) {
            Some(Self::Mp4)
        } else if buf.starts_with(&ebml::EBML_MAGIC) {
            Some(Self::Webm)
        } else {
            None
        }
    }

    /// Split a chunk into fragments when no index of the stream is at hand.
    ///
    /// MP4 chunks without a `moof` fall back to a single `mdat` fragment.
    pub fn extract_fragments(self, chunk: &[u8], file_offset: u64) -> Vec<Fragment> {
        match self {
            Self::Mp4 => fmp4::extract_fragments(chunk, file_offset, true),
            Self::Webm => ebml::extract_clusters(chunk, file_offset),
        }
    }
}

impl std::fmt::Display for ContainerFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mp4 => write!(f, "mp4"),
            Self::Webm => write!(f, "webm"),
        }
    }
}

/// A self-contained unit cut out of a chunk.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Absolute file byte-range covered by `payload`.
    pub range: Range<u64>,
    /// Raw fragment bytes, possibly truncated at the chunk end.
    pub payload: Bytes,
    /// Whether the whole unit was present in the chunk.
    pub complete: bool,
    /// Whole chunk taken as one unit because no fragment header was found.
    pub fallback: bool,
}

impl Fragment {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Structural descriptor used to match the fragment against an index.
    pub fn signature(&self) -> FragmentSignature {
        FragmentSignature {
            offset: self.range.start,
            length: self.len(),
            complete: self.complete,
        }
    }

    /// Whether two fragments share any byte.
    pub fn overlaps(&self, other: &Range<u64>) -> bool {
        self.range.start < other.end && other.start < self.range.end
    }
}

/// What is compared when deciding which indexed stream a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FragmentSignature {
    pub offset: u64,
    pub length: u64,
    pub complete: bool,
}

/// Index built from the offset-zero chunk of a stream.
#[derive(Debug, Clone)]
pub enum ContainerIndex {
    Mp4(FragmentedMp4Index),
    Webm(WebmIndex),
}

impl ContainerIndex {
    /// Parse container metadata up to the first payload unit.
    pub fn build(family: ContainerFamily, first_chunk: &[u8]) -> Result<Self> {
        match family {
            ContainerFamily::Mp4 => FragmentedMp4Index::build(first_chunk).map(Self::Mp4),
            ContainerFamily::Webm => WebmIndex::build(first_chunk).map(Self::Webm),
        }
    }

    pub fn family(&self) -> ContainerFamily {
        match self {
            Self::Mp4(_) => ContainerFamily::Mp4,
            Self::Webm(_) => ContainerFamily::Webm,
        }
    }

    /// Bytes that must prefix any fragment to form a decodable file.
    pub fn init_segment(&self) -> &Bytes {
        match self {
            Self::Mp4(index) => &index.init_segment,
            Self::Webm(index) => &index.init_segment,
        }
    }

    /// Offset of the first payload unit within the offset-zero chunk.
    pub fn data_start(&self) -> usize {
        match self {
            Self::Mp4(index) => index.data_start,
            Self::Webm(index) => index.data_start,
        }
    }

    pub fn is_audio_only(&self) -> bool {
        match self {
            Self::Mp4(index) => index.audio_only,
            Self::Webm(_) => false,
        }
    }

    /// Number of byte ranges the index knows about.
    pub fn entry_count(&self) -> usize {
        match self {
            Self::Mp4(index) => index.sidx.as_ref().map_or(0, |s| s.len()),
            Self::Webm(index) => index.cues.len(),
        }
    }

    /// Split a chunk that starts at `file_offset` into fragments.
    pub fn extract(&self, chunk: &[u8], file_offset: u64) -> Vec<Fragment> {
        match self {
            // Without a sidx this is likely a plain MP4 fetched by range.
            Self::Mp4(index) => fmp4::extract_fragments(chunk, file_offset, index.sidx.is_none()),
            Self::Webm(_) => ebml::extract_clusters(chunk, file_offset),
        }
    }

    /// Extract the fragments that follow the init segment in the
    /// offset-zero chunk this index was built from.
    pub fn extract_after_init(&self, first_chunk: &[u8]) -> Vec<Fragment> {
        let start = self.data_start().min(first_chunk.len());
        self.extract(&first_chunk[start..], start as u64)
    }

    /// Whether freshly extracted fragments belong to this stream.
    pub fn matches(&self, fragments: &[Fragment]) -> bool {
        match self {
            Self::Mp4(index) => index.matches(fragments),
            Self::Webm(index) => index.matches(fragments),
        }
    }

    /// Record a verdict on the index entries the fragments map to.
    pub fn mark(&mut self, fragments: &[Fragment], status: StreamStatus) {
        match self {
            Self::Mp4(index) => index.mark(fragments, status),
            Self::Webm(index) => index.mark(fragments, status),
        }
    }

    /// Media duration covered by the fragments, when the index records it.
    pub fn duration_secs(&self, fragments: &[Fragment]) -> Option<f64> {
        match self {
            Self::Mp4(index) => index.duration_secs(fragments),
            Self::Webm(_) => None,
        }
    }
}
