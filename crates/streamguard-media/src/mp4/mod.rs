//! ISO-BMFF (MP4) box parsing.
//!
//! Only the boxes needed to split a fragmented stream are understood:
//! `ftyp`/`moov` for the init segment, `sidx` for the byte-range table,
//! `tkhd` for track dimensions, and `moof`/`mdat` pairs for fragments.

mod atoms;
mod sidx;

pub use atoms::{
    find_probable_atom, is_probable_atom, is_probable_atom_of_type, read_atom, read_type,
    read_u16, read_u24, read_u32, read_u64, walk_atoms, Atom, AtomType,
};
pub use sidx::{IndexEntry, SegmentIndex};

#[cfg(test)]
pub(crate) use atoms::test_boxes;

/// Dimensions reported by one track header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackDimensions {
    /// Width as 16.16 fixed point.
    pub width: u32,
    /// Height as 16.16 fixed point.
    pub height: u32,
}

impl TrackDimensions {
    pub fn is_zero(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

/// Collect the width/height of every `tkhd` found inside a `moov` box.
///
/// The box tree is not walked; any probable `tkhd` header is accepted,
/// which tolerates unusual nesting.
pub fn track_dimensions(moov: &[u8]) -> Vec<TrackDimensions> {
    let mut dims = Vec::new();
    for i in 0..moov.len() {
        if !is_probable_atom_of_type(moov, i, AtomType::TKHD, true) {
            continue;
        }
        let Ok(length) = read_u32(moov, i) else {
            continue;
        };
        // Version 1 headers carry 64-bit times, shifting the size fields.
        let base = match moov.get(i + 8) {
            Some(1) => 88,
            _ => 76,
        };
        if (length as usize) < 8 + base + 8 {
            tracing::warn!(offset = i, length, "tkhd too short for dimensions");
            continue;
        }
        if let (Ok(width), Ok(height)) = (read_u32(moov, i + 8 + base), read_u32(moov, i + 8 + base + 4)) {
            dims.push(TrackDimensions { width, height });
        }
    }
    dims
}

/// A `moov` whose track headers all report zero size carries no video.
pub fn is_audio_only(moov: &[u8]) -> bool {
    let dims = track_dimensions(moov);
    !dims.is_empty() && dims.iter().all(TrackDimensions::is_zero)
}
