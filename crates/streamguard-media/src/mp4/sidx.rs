//! Segment index (`sidx`) parsing.
//!
//! Each reference in the box becomes an [`IndexEntry`] keyed by its absolute
//! file offset. The first reference starts `first_offset` bytes after the
//! end of the `sidx` box itself.

use std::collections::BTreeMap;

use serde::Serialize;
use streamguard_common::StreamStatus;

use super::atoms::{read_atom, read_u16, read_u24, read_u32, read_u64, AtomType};
use crate::{Error, Result};

/// One referenced subsegment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    /// Absolute file offset of the subsegment (its `moof`).
    pub offset: u64,
    /// Referenced size in bytes.
    pub size: u32,
    /// Duration in timescale units.
    pub duration: u32,
    /// Verdict recorded for this subsegment.
    pub status: StreamStatus,
}

/// Parsed `sidx` box.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentIndex {
    pub version: u8,
    pub flags: u32,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_pts: u64,
    pub first_offset: u64,
    pub entries: BTreeMap<u64, IndexEntry>,
}

impl SegmentIndex {
    /// Parse the `sidx` box whose header starts at `atom_offset`.
    pub fn parse(buf: &[u8], atom_offset: usize) -> Result<Self> {
        let atom = read_atom(buf, atom_offset)?;
        if atom.atom_type != AtomType::SIDX {
            return Err(Error::invalid_mp4(format!(
                "expected sidx at {}, found {}",
                atom_offset, atom.atom_type
            )));
        }

        let mut i = atom_offset + atom.header_size as usize;
        let version = *buf.get(i).ok_or(Error::BufferUnderflow {
            need: i + 1,
            have: buf.len(),
        })?;
        i += 1;
        let flags = read_u24(buf, i)?;
        i += 3;
        let reference_id = read_u32(buf, i)?;
        i += 4;
        let timescale = read_u32(buf, i)?;
        i += 4;

        let (earliest_pts, first_offset) = if version == 0 {
            let pts = read_u32(buf, i)? as u64;
            let first = read_u32(buf, i + 4)? as u64;
            i += 8;
            (pts, first)
        } else {
            let pts = read_u64(buf, i)?;
            let first = read_u64(buf, i + 8)?;
            i += 16;
            (pts, first)
        };

        // reserved
        i += 2;
        let entry_count = read_u16(buf, i)?;
        i += 2;

        let mut entries = BTreeMap::new();
        let overflow = || Error::invalid_mp4("sidx references past the addressable range");
        let mut offset = atom.end().checked_add(first_offset).ok_or_else(overflow)?;
        for _ in 0..entry_count {
            // The top bit of the size word is the reference type.
            let size = read_u32(buf, i)? & 0x7FFF_FFFF;
            let duration = read_u32(buf, i + 4)?;
            // SAP flags are unused.
            i += 12;

            entries.insert(
                offset,
                IndexEntry {
                    offset,
                    size,
                    duration,
                    status: StreamStatus::Unknown,
                },
            );
            offset = offset.checked_add(size as u64).ok_or_else(overflow)?;
        }

        Ok(Self {
            version,
            flags,
            reference_id,
            timescale,
            earliest_pts,
            first_offset,
            entries,
        })
    }

    pub fn entry(&self, offset: u64) -> Option<&IndexEntry> {
        self.entries.get(&offset)
    }

    /// Record a verdict on the entry at `offset`, if it exists.
    pub fn mark(&mut self, offset: u64, status: StreamStatus) -> bool {
        match self.entries.get_mut(&offset) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Duration of an entry in seconds.
    pub fn duration_secs(&self, entry: &IndexEntry) -> f64 {
        if self.timescale == 0 {
            0.0
        } else {
            entry.duration as f64 / self.timescale as f64
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::super::atoms::test_boxes::{boxed, sidx};
    use super::*;

    #[test]
    fn test_parse_sidx_offsets_follow_box_end() {
        let mut buf = vec![0u8; 100];
        let sidx_box = sidx(1000, 0, &[(400, 2000), (500, 2000), (300, 1000)]);
        let sidx_len = sidx_box.len() as u64;
        buf.extend(sidx_box);

        let index = SegmentIndex::parse(&buf, 100).unwrap();
        assert_eq!(index.timescale, 1000);
        assert_eq!(index.reference_id, 1);
        let offsets: Vec<u64> = index.entries.keys().copied().collect();
        let start = 100 + sidx_len;
        assert_eq!(offsets, vec![start, start + 400, start + 900]);

        let second = index.entry(start + 400).unwrap();
        assert_eq!(second.size, 500);
        assert_eq!(index.duration_secs(second), 2.0);
    }

    #[test]
    fn test_first_offset_shifts_entries() {
        let buf = sidx(90_000, 64, &[(1000, 90_000)]);
        let index = SegmentIndex::parse(&buf, 0).unwrap();
        let expected = buf.len() as u64 + 64;
        assert!(index.entry(expected).is_some());
    }

    #[test]
    fn test_mark_entries() {
        let buf = sidx(1000, 0, &[(10, 1), (10, 1)]);
        let mut index = SegmentIndex::parse(&buf, 0).unwrap();
        let first = buf.len() as u64;
        assert!(index.mark(first, StreamStatus::Block));
        assert!(!index.mark(first + 1, StreamStatus::Block));
        assert_eq!(index.entry(first).unwrap().status, StreamStatus::Block);
        assert_eq!(index.entry(first + 10).unwrap().status, StreamStatus::Unknown);
    }

    #[test]
    fn test_first_offset_past_addressable_range_is_error() {
        let mut payload = vec![1, 0, 0, 0];
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&1000u32.to_be_bytes());
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(&u64::MAX.to_be_bytes());
        payload.extend_from_slice(&[0, 0, 0, 1]);
        payload.extend_from_slice(&10u32.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        let buf = boxed(b"sidx", &payload);
        assert!(matches!(SegmentIndex::parse(&buf, 0), Err(Error::InvalidMp4(_))));
    }

    #[test]
    fn test_truncated_sidx_is_error() {
        let buf = sidx(1000, 0, &[(10, 1), (10, 1)]);
        assert!(SegmentIndex::parse(&buf[..buf.len() - 4], 0).is_err());
        assert!(SegmentIndex::parse(&buf, 4).is_err());
    }
}
