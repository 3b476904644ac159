//! EBML (Matroska/WebM) element parsing and cluster extraction.

mod varint;
mod webm;

pub use varint::{decode, encode_size, unknown_size, Varint};
pub use webm::WebmIndex;

use bytes::Bytes;

use crate::fragment::Fragment;
use crate::{Error, Result};

/// Element IDs, stored with their length marker as read from the stream.
pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const SEGMENT: u32 = 0x1853_8067;
    pub const INFO: u32 = 0x1549_A966;
    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
    pub const CUE_RELATIVE_POSITION: u32 = 0xF0;
    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
}

/// First four bytes of every EBML document.
pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

const CLUSTER_MAGIC: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

/// Human-readable name of a known element ID.
pub fn element_name(id: u32) -> Option<&'static str> {
    Some(match id {
        ids::EBML => "EBML",
        ids::SEGMENT => "Segment",
        ids::INFO => "Info",
        ids::SEEK_HEAD => "SeekHead",
        ids::TRACKS => "Tracks",
        ids::CUES => "Cues",
        ids::CUE_POINT => "CuePoint",
        ids::CUE_TRACK_POSITIONS => "CueTrackPositions",
        ids::CUE_CLUSTER_POSITION => "CueClusterPosition",
        ids::CUE_RELATIVE_POSITION => "CueRelativePosition",
        ids::CLUSTER => "Cluster",
        ids::SIMPLE_BLOCK => "SimpleBlock",
        ids::BLOCK_GROUP => "BlockGroup",
        _ => return None,
    })
}

/// One parsed element and, when requested, its children.
#[derive(Debug, Clone)]
pub struct Element {
    pub id: u32,
    /// Offset of the ID within the buffer.
    pub start: usize,
    /// Offset of the element body within the buffer.
    pub data_start: usize,
    /// Body length; for unknown-size elements, the rest of the parent.
    pub len: u64,
    pub unknown_size: bool,
    pub children: Vec<Element>,
}

impl Element {
    /// Offset one past the end of the body.
    pub fn end(&self) -> u64 {
        self.data_start as u64 + self.len
    }

    /// First direct child with the given ID.
    pub fn child(&self, id: u32) -> Option<&Element> {
        self.children.iter().find(|c| c.id == id)
    }

    /// Direct children with the given ID.
    pub fn children_with(&self, id: u32) -> impl Iterator<Item = &Element> {
        self.children.iter().filter(move |c| c.id == id)
    }

    /// Read the body as a big-endian unsigned integer.
    pub fn read_uint(&self, buf: &[u8]) -> Result<u64> {
        if self.len > 8 {
            return Err(Error::invalid_ebml(format!(
                "unsigned element {:#x} is {} bytes wide",
                self.id, self.len
            )));
        }
        let end = self.data_start + self.len as usize;
        let body = buf.get(self.data_start..end).ok_or(Error::BufferUnderflow {
            need: end,
            have: buf.len(),
        })?;
        Ok(body.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }
}

/// Parse the sibling elements in `buf[start..start + len]`.
///
/// `recurse` selects which elements get their children parsed. Parsing
/// stops quietly at the first header that cannot be decoded, keeping what
/// was read so far.
pub fn parse_elements<F>(buf: &[u8], start: usize, len: usize, recurse: &F) -> Vec<Element>
where
    F: Fn(u32) -> bool,
{
    let end = start.saturating_add(len).min(buf.len());
    let mut elements = Vec::new();
    let mut i = start;

    while i < end {
        let header = decode(buf, i).and_then(|id| {
            if id.len > 4 {
                return Err(Error::invalid_ebml(format!("element ID at {} is {} bytes", i, id.len)));
            }
            let size = decode(buf, i + id.len)?;
            Ok((id, size))
        });
        let (id, size) = match header {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(offset = i, error = %e, "Stopped parsing EBML");
                break;
            }
        };

        let data_start = i + id.len + size.len;
        let unknown_size = size.is_unknown();
        let body_len = if unknown_size {
            end.saturating_sub(data_start) as u64
        } else {
            size.value
        };

        let children = if recurse(id.unmasked as u32) {
            let child_len = body_len.min(end.saturating_sub(data_start) as u64) as usize;
            parse_elements(buf, data_start, child_len, recurse)
        } else {
            Vec::new()
        };

        elements.push(Element {
            id: id.unmasked as u32,
            start: i,
            data_start,
            len: body_len,
            unknown_size,
            children,
        });

        match usize::try_from(data_start as u64 + body_len) {
            Ok(next) => i = next,
            Err(_) => break,
        }
    }
    elements
}

/// Probe whether a Cluster ID starts at `index`.
///
/// A following zero byte would be an invalid size, so it rules the match
/// out when present.
pub fn is_likely_cluster(buf: &[u8], index: usize) -> bool {
    buf.get(index..index + 4) == Some(&CLUSTER_MAGIC[..])
        && buf.get(index + 4).map_or(true, |&b| b != 0)
}

/// Extract every Cluster from a chunk starting at `file_offset`.
///
/// Scanning starts at the first likely Cluster ID; the last Cluster may
/// be truncated.
pub fn extract_clusters(buf: &[u8], file_offset: u64) -> Vec<Fragment> {
    let Some(first) = (0..buf.len()).find(|&i| is_likely_cluster(buf, i)) else {
        tracing::debug!(len = buf.len(), "No cluster found in chunk");
        return Vec::new();
    };

    parse_elements(buf, first, buf.len() - first, &|_| false)
        .into_iter()
        .filter(|e| e.id == ids::CLUSTER)
        .map(|cluster| {
            let end = cluster.end();
            let complete = !cluster.unknown_size && end <= buf.len() as u64;
            let payload_end = end.min(buf.len() as u64) as usize;
            Fragment {
                range: file_offset.saturating_add(cluster.start as u64)
                    ..file_offset.saturating_add(payload_end as u64),
                payload: Bytes::copy_from_slice(&buf[cluster.start..payload_end]),
                complete,
                fallback: false,
            }
        })
        .collect()
}

/// Build an element with a known size, for tests and tools.
pub fn encode_element(id: u32, body: &[u8]) -> Vec<u8> {
    let id_bytes = id.to_be_bytes();
    let skip = id_bytes.iter().take_while(|&&b| b == 0).count().min(3);
    let mut out = id_bytes[skip..].to_vec();
    out.extend(encode_size(body.len() as u64));
    out.extend_from_slice(body);
    out
}
