//! WebM init segment and Cues index.

use std::collections::BTreeMap;

use bytes::Bytes;
use streamguard_common::StreamStatus;

use super::{decode, ids, parse_elements, unknown_size, Element};
use crate::fragment::Fragment;
use crate::{Error, Result};

/// Init segment and Cluster index of one WebM rendition.
#[derive(Debug, Clone)]
pub struct WebmIndex {
    /// Header, Segment start, Info and Tracks, with the Segment size
    /// rewritten to unknown so clusters can be appended.
    pub init_segment: Bytes,
    /// Offset of the Segment body; Cue positions are relative to it.
    pub segment_data_start: usize,
    /// Offset of the first Cluster, or the end of the init segment.
    pub data_start: usize,
    /// Absolute Cluster offsets listed in Cues.
    pub cues: BTreeMap<u64, StreamStatus>,
}

impl WebmIndex {
    pub fn build(buf: &[u8]) -> Result<Self> {
        let recurse = |id: u32| {
            matches!(
                id,
                ids::SEGMENT | ids::CUES | ids::CUE_POINT | ids::CUE_TRACK_POSITIONS
            )
        };
        let elements = parse_elements(buf, 0, buf.len(), &recurse);

        let segment = elements
            .iter()
            .find(|e| e.id == ids::SEGMENT)
            .ok_or(Error::Missing("Segment"))?;
        let info = segment.child(ids::INFO).ok_or(Error::Missing("Info"))?;
        let tracks = segment.child(ids::TRACKS).ok_or(Error::Missing("Tracks"))?;

        let init_end = info.end().max(tracks.end());
        if init_end > buf.len() as u64 {
            return Err(Error::BufferUnderflow {
                need: init_end as usize,
                have: buf.len(),
            });
        }
        let init_end = init_end as usize;

        let mut init = buf[..init_end].to_vec();
        let id = decode(buf, segment.start)?;
        let size_index = segment.start + id.len;
        let size = decode(buf, size_index)?;
        init[size_index..size_index + size.len].copy_from_slice(&unknown_size(size.len));

        let cues = cue_offsets(buf, segment);
        let data_start = segment
            .child(ids::CLUSTER)
            .map_or(init_end, |cluster| cluster.start);

        tracing::debug!(
            init_len = init_end,
            cue_count = cues.len(),
            data_start,
            "Built WebM index"
        );

        Ok(Self {
            init_segment: Bytes::from(init),
            segment_data_start: segment.data_start,
            data_start,
            cues,
        })
    }

    /// Cues do not list every Cluster, so a reduced rule applies: at least
    /// two indexed clusters, or every cluster indexed, or one indexed
    /// cluster among at most three.
    pub fn matches(&self, fragments: &[Fragment]) -> bool {
        if fragments.is_empty() {
            return false;
        }
        let matched = fragments
            .iter()
            .filter(|f| self.cues.contains_key(&f.range.start))
            .count();
        tracing::debug!(matched, total = fragments.len(), "WebM fragment match");
        matched >= 2 || matched == fragments.len() || (matched >= 1 && fragments.len() <= 3)
    }

    pub fn mark(&mut self, fragments: &[Fragment], status: StreamStatus) {
        for fragment in fragments {
            if let Some(entry) = self.cues.get_mut(&fragment.range.start) {
                *entry = status;
            }
        }
    }
}

fn cue_offsets(buf: &[u8], segment: &Element) -> BTreeMap<u64, StreamStatus> {
    let mut cues = BTreeMap::new();
    let positions = segment
        .children_with(ids::CUES)
        .flat_map(|c| c.children_with(ids::CUE_POINT))
        .flat_map(|p| p.children_with(ids::CUE_TRACK_POSITIONS))
        .filter_map(|t| t.child(ids::CUE_CLUSTER_POSITION));

    for position in positions {
        match position.read_uint(buf) {
            Ok(relative) => {
                cues.insert(segment.data_start as u64 + relative, StreamStatus::Unknown);
            }
            Err(e) => tracing::debug!(error = %e, "Skipping unreadable cue position"),
        }
    }
    cues
}

#[cfg(test)]
mod tests {
    use super::super::{encode_element, extract_clusters};
    use super::*;

    fn cluster(fill: u8, len: usize) -> Vec<u8> {
        encode_element(ids::CLUSTER, &encode_element(ids::SIMPLE_BLOCK, &vec![fill; len]))
    }

    fn cue_point(relative: u64) -> Vec<u8> {
        let position = encode_element(ids::CUE_CLUSTER_POSITION, &relative.to_be_bytes()[4..]);
        let ctp = encode_element(ids::CUE_TRACK_POSITIONS, &position);
        encode_element(ids::CUE_POINT, &ctp)
    }

    /// Returns the file and the absolute offsets of its clusters.
    fn webm_file(cluster_lens: &[usize]) -> (Vec<u8>, Vec<u64>) {
        let header = encode_element(ids::EBML, &[0x42, 0x86, 0x81, 0x01]);
        let info = encode_element(ids::INFO, &[0x2A, 0xD7, 0xB1, 0x83, 0x0F, 0x42, 0x40]);
        let tracks = encode_element(ids::TRACKS, &[0xAE, 0x80]);
        let clusters: Vec<Vec<u8>> = cluster_lens
            .iter()
            .enumerate()
            .map(|(i, &len)| cluster(i as u8, len))
            .collect();

        // Cue positions are relative to the segment body; compute them
        // assuming the cues element has a fixed size.
        let cue_probe: Vec<u8> = (0..clusters.len()).flat_map(|_| cue_point(0)).collect();
        let cues_len = encode_element(ids::CUES, &cue_probe).len();
        let mut relative = (info.len() + tracks.len() + cues_len) as u64;
        let mut cue_body = Vec::new();
        let mut relatives = Vec::new();
        for c in &clusters {
            cue_body.extend(cue_point(relative));
            relatives.push(relative);
            relative += c.len() as u64;
        }
        let cues = encode_element(ids::CUES, &cue_body);

        let mut body = [info, tracks, cues].concat();
        for c in &clusters {
            body.extend(c);
        }
        // 8-byte size so the Segment header width is fixed.
        let mut segment = ids::SEGMENT.to_be_bytes().to_vec();
        segment.push(0x01);
        segment.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
        let segment_data_start = (header.len() + segment.len()) as u64;
        segment.extend(body);

        let file = [header, segment].concat();
        let offsets = relatives.iter().map(|r| segment_data_start + r).collect();
        (file, offsets)
    }

    #[test]
    fn test_build_webm_index() {
        let (file, offsets) = webm_file(&[30, 40, 50]);
        let index = WebmIndex::build(&file).unwrap();
        let cue_offsets: Vec<u64> = index.cues.keys().copied().collect();
        assert_eq!(cue_offsets, offsets);
        assert_eq!(index.data_start as u64, offsets[0]);
        assert!(index.init_segment.len() < offsets[0] as usize);

        // Segment size rewritten to the 8-byte unknown marker.
        let size_at = index.segment_data_start - 8;
        assert_eq!(&index.init_segment[size_at..size_at + 8], &unknown_size(8)[..]);
    }

    #[test]
    fn test_build_requires_tracks() {
        let header = encode_element(ids::EBML, &[]);
        let segment = encode_element(ids::SEGMENT, &encode_element(ids::INFO, &[0x80]));
        let file = [header, segment].concat();
        assert!(matches!(WebmIndex::build(&file), Err(Error::Missing("Tracks"))));
    }

    #[test]
    fn test_reduced_match_rule() {
        let (file, offsets) = webm_file(&[30, 40, 50, 60, 70]);
        let index = WebmIndex::build(&file).unwrap();

        let start = offsets[1] as usize;
        let fragments = extract_clusters(&file[start..], start as u64);
        assert_eq!(fragments.len(), 4);
        assert!(index.matches(&fragments));

        // One indexed cluster among few fragments still matches.
        let single = extract_clusters(&file[start..offsets[2] as usize], start as u64);
        assert!(index.matches(&single));

        // Shifted offsets match nothing.
        let shifted = extract_clusters(&file[start..], start as u64 + 1);
        assert!(!index.matches(&shifted));
    }

    #[test]
    fn test_mark_cues() {
        let (file, offsets) = webm_file(&[30, 40]);
        let mut index = WebmIndex::build(&file).unwrap();
        let start = offsets[0] as usize;
        let fragments = extract_clusters(&file[start..], start as u64);
        index.mark(&fragments, StreamStatus::Block);
        assert!(index.cues.values().all(|s| *s == StreamStatus::Block));
    }
}
