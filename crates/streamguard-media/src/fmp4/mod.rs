//! Fragmented MP4 indexing and `moof`/`mdat` extraction.
//!
//! The offset-zero chunk of a fragmented MP4 carries `ftyp`, `moov` and
//! usually a `sidx`. The `ftyp`+`moov` prefix is kept as the init segment so
//! that any later `moof`+`mdat` pair can be appended to it to form a file
//! the scoring engine can decode on its own.

use bytes::Bytes;
use streamguard_common::StreamStatus;

use crate::fragment::Fragment;
use crate::mp4::{self, find_probable_atom, read_atom, read_type, AtomType, SegmentIndex};
use crate::{Error, Result};

/// Init segment and byte-range table of one fragmented MP4 rendition.
#[derive(Debug, Clone)]
pub struct FragmentedMp4Index {
    /// `ftyp` through the end of `moov`, including any `free`/`mdat` between.
    pub init_segment: Bytes,
    /// Offset of the first byte after the index boxes.
    pub data_start: usize,
    /// Segment index, when the file carries one.
    pub sidx: Option<SegmentIndex>,
    /// All tracks report zero width and height.
    pub audio_only: bool,
}

impl FragmentedMp4Index {
    /// Build the index from the first chunk of a file.
    pub fn build(buf: &[u8]) -> Result<Self> {
        let ftyp = read_atom(buf, 0)?;
        if ftyp.atom_type != AtomType::FTYP {
            return Err(Error::invalid_mp4(format!(
                "expected ftyp at start, found {}",
                ftyp.atom_type
            )));
        }

        let mut offset = to_offset(ftyp.end())?;
        let moov = loop {
            let atom = read_atom(buf, offset)?;
            match atom.atom_type {
                AtomType::MOOV => break atom,
                AtomType::FREE | AtomType::SKIP | AtomType::MDAT => {
                    tracing::debug!(
                        atom = %atom.atom_type,
                        size = atom.size,
                        "Folding box between ftyp and moov into init segment"
                    );
                    offset = to_offset(atom.end())?;
                }
                other => {
                    return Err(Error::invalid_mp4(format!(
                        "expected moov or free at {}, found {}",
                        offset, other
                    )));
                }
            }
        };

        if !moov.is_complete_in(buf.len()) {
            return Err(Error::BufferUnderflow {
                need: to_offset(moov.end())?,
                have: buf.len(),
            });
        }
        let moov_end = to_offset(moov.end())?;
        let audio_only = mp4::is_audio_only(&buf[moov.offset..moov_end]);

        let (sidx, data_start) = match read_type(buf, moov_end + 4) {
            Ok(AtomType::SIDX) => {
                let sidx = SegmentIndex::parse(buf, moov_end)?;
                let sidx_end = to_offset(read_atom(buf, moov_end)?.end())?;
                (Some(sidx), sidx_end)
            }
            _ => (None, moov_end),
        };

        Ok(Self {
            init_segment: Bytes::copy_from_slice(&buf[..moov_end]),
            data_start,
            sidx,
            audio_only,
        })
    }

    /// Every fragment must start at an indexed offset; complete fragments
    /// must also span exactly the referenced size.
    ///
    /// Without a `sidx` any fragment is accepted.
    pub fn matches(&self, fragments: &[Fragment]) -> bool {
        if fragments.is_empty() {
            return false;
        }
        let Some(sidx) = &self.sidx else {
            return true;
        };
        let matched = fragments
            .iter()
            .filter(|f| {
                sidx.entry(f.range.start)
                    .is_some_and(|entry| !f.complete || entry.size as u64 == f.len())
            })
            .count();
        tracing::debug!(
            matched,
            total = fragments.len(),
            "MP4 fragment match"
        );
        matched == fragments.len()
    }

    pub fn mark(&mut self, fragments: &[Fragment], status: StreamStatus) {
        if let Some(sidx) = &mut self.sidx {
            for fragment in fragments {
                sidx.mark(fragment.range.start, status);
            }
        }
    }

    /// Sum of the indexed durations of the fragments.
    pub fn duration_secs(&self, fragments: &[Fragment]) -> Option<f64> {
        let sidx = self.sidx.as_ref()?;
        Some(
            fragments
                .iter()
                .filter_map(|f| sidx.entry(f.range.start))
                .map(|entry| sidx.duration_secs(entry))
                .sum(),
        )
    }
}

fn to_offset(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::invalid_mp4(format!("offset {} out of range", value)))
}

/// Extract every `moof`+`mdat` pair from a chunk starting at `file_offset`.
///
/// Extraction begins at the first probable `moof` and stops at the first
/// pair whose `moof` is incomplete or is not followed by an `mdat`. The last
/// pair may have a truncated `mdat`.
///
/// When no `moof` is found and `allow_mdat_fallback` is set, a chunk that
/// contains a probable `mdat` is returned whole as a single fragment.
pub fn extract_fragments(buf: &[u8], file_offset: u64, allow_mdat_fallback: bool) -> Vec<Fragment> {
    if buf.is_empty() {
        return Vec::new();
    }

    let Some(mut offset) = find_probable_atom(buf, AtomType::MOOF, false) else {
        return mdat_fallback(buf, file_offset, allow_mdat_fallback);
    };

    let mut fragments = Vec::new();
    while offset + 8 <= buf.len() {
        let Ok(moof) = read_atom(buf, offset) else {
            break;
        };
        if moof.atom_type != AtomType::MOOF {
            tracing::warn!(offset, found = %moof.atom_type, "Expected moof");
            break;
        }
        let Some(mdat_offset) = usize::try_from(moof.end())
            .ok()
            .filter(|o| o.checked_add(8).is_some_and(|header_end| header_end <= buf.len()))
        else {
            break;
        };
        let Ok(mdat) = read_atom(buf, mdat_offset) else {
            break;
        };
        if mdat.atom_type != AtomType::MDAT {
            tracing::warn!(offset = mdat_offset, found = %mdat.atom_type, "Expected mdat");
            break;
        }

        let end = mdat.end();
        let complete = end <= buf.len() as u64;
        let payload_end = end.min(buf.len() as u64) as usize;
        fragments.push(Fragment {
            range: file_offset.saturating_add(offset as u64)..file_offset.saturating_add(payload_end as u64),
            payload: Bytes::copy_from_slice(&buf[offset..payload_end]),
            complete,
            fallback: false,
        });
        if !complete {
            break;
        }
        offset = payload_end;
    }
    fragments
}

fn mdat_fallback(buf: &[u8], file_offset: u64, allowed: bool) -> Vec<Fragment> {
    if !allowed {
        tracing::debug!(len = buf.len(), "No moof found and mdat fallback not allowed");
        return Vec::new();
    }
    let Some(offset) = find_probable_atom(buf, AtomType::MDAT, true) else {
        tracing::debug!(len = buf.len(), "No moof or mdat found");
        return Vec::new();
    };
    let complete = read_atom(buf, offset).is_ok_and(|mdat| mdat.is_complete_in(buf.len()));
    tracing::debug!(
        offset,
        complete,
        "Falling back to whole chunk as a single fragment"
    );
    // The whole chunk is kept so that boxes preceding the mdat stay
    // consistent with the moov's offsets.
    vec![Fragment {
        range: file_offset..file_offset.saturating_add(buf.len() as u64),
        payload: Bytes::copy_from_slice(buf),
        complete,
        fallback: true,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::test_boxes::*;

    fn fmp4_file(fragment_sizes: &[usize]) -> (Vec<u8>, usize) {
        let ftyp = boxed(b"ftyp", b"dash\0\0\0\0");
        let moov = moov_with_tracks(&[(1920 << 16, 1080 << 16)]);
        let refs: Vec<(u32, u32)> = fragment_sizes.iter().map(|&s| (s as u32, 1000)).collect();
        let sidx = sidx(1000, 0, &refs);
        let mut file = [ftyp, moov, sidx].concat();
        let data_start = file.len();
        for &size in fragment_sizes {
            file.extend(fragment(size));
        }
        (file, data_start)
    }

    #[test]
    fn test_build_index() {
        let (file, data_start) = fmp4_file(&[100, 120]);
        let index = FragmentedMp4Index::build(&file).unwrap();
        assert_eq!(index.data_start, data_start);
        assert!(!index.audio_only);
        let sidx = index.sidx.as_ref().unwrap();
        assert_eq!(sidx.len(), 2);
        assert!(sidx.entry(data_start as u64).is_some());
        assert!(index.init_segment.starts_with(&file[..8]));
        assert_eq!(&index.init_segment[4..8], b"ftyp");
    }

    #[test]
    fn test_build_folds_free_before_moov() {
        let ftyp = boxed(b"ftyp", b"isom\0\0\0\0");
        let free = boxed(b"free", &[0u8; 12]);
        let moov = moov_with_tracks(&[(0, 0)]);
        let file = [ftyp.clone(), free.clone(), moov.clone(), fragment(64)].concat();
        let index = FragmentedMp4Index::build(&file).unwrap();
        assert_eq!(index.init_segment.len(), ftyp.len() + free.len() + moov.len());
        assert!(index.sidx.is_none());
        assert!(index.audio_only);
        assert_eq!(index.data_start, index.init_segment.len());
    }

    #[test]
    fn test_build_rejects_non_ftyp() {
        let file = [boxed(b"moov", &[]), fragment(64)].concat();
        assert!(matches!(
            FragmentedMp4Index::build(&file),
            Err(Error::InvalidMp4(_))
        ));
    }

    #[test]
    fn test_build_rejects_truncated_moov() {
        let ftyp = boxed(b"ftyp", b"isom\0\0\0\0");
        let moov = moov_with_tracks(&[(1, 1)]);
        let file = [ftyp, moov[..moov.len() - 10].to_vec()].concat();
        assert!(matches!(
            FragmentedMp4Index::build(&file),
            Err(Error::BufferUnderflow { .. })
        ));
    }

    #[test]
    fn test_extract_marks_incomplete_tail() {
        let chunk = [fragment(100), fragment(200)].concat();
        let truncated = &chunk[..250];
        let fragments = extract_fragments(truncated, 5000, false);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].range, 5000..5100);
        assert!(fragments[0].complete);
        assert_eq!(fragments[1].range, 5100..5250);
        assert!(!fragments[1].complete);
        assert_eq!(fragments[1].payload.len(), 150);
    }

    #[test]
    fn test_extract_skips_leading_garbage() {
        let mut chunk = vec![0x11u8; 7];
        chunk.extend(fragment(80));
        chunk.extend(fragment(80));
        let fragments = extract_fragments(&chunk, 0, false);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].range.start, 7);
    }

    #[test]
    fn test_extract_mdat_fallback() {
        let chunk = [boxed(b"free", &[0u8; 4]), boxed(b"mdat", &[7u8; 40])].concat();
        assert!(extract_fragments(&chunk, 900, false).is_empty());

        let fragments = extract_fragments(&chunk, 900, true);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].fallback);
        assert!(fragments[0].complete);
        assert_eq!(fragments[0].range, 900..900 + chunk.len() as u64);
    }

    #[test]
    fn test_matches_requires_every_fragment_indexed() {
        let (file, data_start) = fmp4_file(&[100, 120, 140]);
        let index = FragmentedMp4Index::build(&file).unwrap();

        let second_and_third = &file[data_start + 100..];
        let fragments = extract_fragments(second_and_third, (data_start + 100) as u64, false);
        assert_eq!(fragments.len(), 2);
        assert!(index.matches(&fragments));

        let shifted = extract_fragments(second_and_third, (data_start + 101) as u64, false);
        assert!(!index.matches(&shifted));
        assert!(!index.matches(&[]));
    }

    #[test]
    fn test_matches_checks_complete_length() {
        let (file, data_start) = fmp4_file(&[100, 120]);
        let index = FragmentedMp4Index::build(&file).unwrap();

        // Same offsets but a rendition with different fragment sizes.
        let other = [fragment(100), fragment(90)].concat();
        let fragments = extract_fragments(&other, data_start as u64, false);
        assert!(!index.matches(&fragments));
    }

    #[test]
    fn test_mark_and_duration() {
        let (file, data_start) = fmp4_file(&[100, 120]);
        let mut index = FragmentedMp4Index::build(&file).unwrap();
        let fragments = extract_fragments(&file[data_start..], data_start as u64, false);

        assert_eq!(index.duration_secs(&fragments), Some(2.0));
        index.mark(&fragments[..1], StreamStatus::Pass);
        let sidx = index.sidx.as_ref().unwrap();
        assert_eq!(sidx.entry(data_start as u64).unwrap().status, StreamStatus::Pass);
        assert_eq!(
            sidx.entry(data_start as u64 + 100).unwrap().status,
            StreamStatus::Unknown
        );
    }
}
