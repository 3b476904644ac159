//! ISO-BMFF box definitions and bounds-checked readers.

use crate::{Error, Result};

/// Four-character box type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomType(pub [u8; 4]);

impl AtomType {
    pub const FTYP: Self = Self(*b"ftyp");
    pub const MOOV: Self = Self(*b"moov");
    pub const SIDX: Self = Self(*b"sidx");
    pub const MOOF: Self = Self(*b"moof");
    pub const MDAT: Self = Self(*b"mdat");
    pub const FREE: Self = Self(*b"free");
    pub const SKIP: Self = Self(*b"skip");
    pub const TRAK: Self = Self(*b"trak");
    pub const TKHD: Self = Self(*b"tkhd");

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Get the 4-char code as a string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl std::fmt::Display for AtomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parsed box header located within a buffer.
#[derive(Debug, Clone)]
pub struct Atom {
    /// Box type code.
    pub atom_type: AtomType,
    /// Offset of the header within the buffer.
    pub offset: usize,
    /// Box size including header.
    pub size: u64,
    /// Size of the header (8 or 16 bytes).
    pub header_size: u8,
}

impl Atom {
    /// Offset one past the end of the box.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size
    }

    /// Whether the whole box lies inside a buffer of `len` bytes.
    pub fn is_complete_in(&self, len: usize) -> bool {
        self.end() <= len as u64
    }
}

fn slice<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    let end = offset.checked_add(N).ok_or(Error::BufferUnderflow {
        need: usize::MAX,
        have: buf.len(),
    })?;
    buf.get(offset..end)
        .and_then(|s| s.try_into().ok())
        .ok_or(Error::BufferUnderflow {
            need: end,
            have: buf.len(),
        })
}

pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    slice::<2>(buf, offset).map(u16::from_be_bytes)
}

pub fn read_u24(buf: &[u8], offset: usize) -> Result<u32> {
    slice::<3>(buf, offset).map(|b| u32::from_be_bytes([0, b[0], b[1], b[2]]))
}

pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    slice::<4>(buf, offset).map(u32::from_be_bytes)
}

pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    slice::<8>(buf, offset).map(u64::from_be_bytes)
}

pub fn read_type(buf: &[u8], offset: usize) -> Result<AtomType> {
    slice::<4>(buf, offset).map(AtomType::from_bytes)
}

/// Read the box header at `offset`.
///
/// A 32-bit size of 1 selects the 64-bit extended size; a size of 0 means
/// the box runs to the end of the buffer.
pub fn read_atom(buf: &[u8], offset: usize) -> Result<Atom> {
    let size = read_u32(buf, offset)? as u64;
    let atom_type = read_type(buf, offset + 4)?;

    let (size, header_size) = match size {
        1 => (read_u64(buf, offset + 8)?, 16u8),
        0 => ((buf.len() - offset) as u64, 8u8),
        n => (n, 8u8),
    };

    if size < header_size as u64 {
        return Err(Error::invalid_mp4(format!(
            "box {} at {} declares size {} smaller than its header",
            atom_type, offset, size
        )));
    }
    // `Atom::end` relies on this.
    if (offset as u64).checked_add(size).is_none() {
        return Err(Error::invalid_mp4(format!(
            "box {} at {} declares size {} past the addressable range",
            atom_type, offset, size
        )));
    }

    Ok(Atom {
        atom_type,
        offset,
        size,
        header_size,
    })
}

fn probable_length(buf: &[u8], offset: usize, allow_invalid_length: bool) -> Option<u32> {
    if offset + 8 >= buf.len() {
        return None;
    }
    let length = read_u32(buf, offset).ok()?;
    if offset as u64 + length as u64 >= buf.len() as u64 && !allow_invalid_length {
        return None;
    }
    Some(length)
}

/// Heuristic check for a box header with a lowercase ASCII type at `offset`.
///
/// Unless `allow_invalid_length` is set, the declared box must end before
/// the end of the buffer.
pub fn is_probable_atom(buf: &[u8], offset: usize, allow_invalid_length: bool) -> bool {
    probable_length(buf, offset, allow_invalid_length).is_some()
        && buf[offset + 4..offset + 8]
            .iter()
            .all(|b| b.is_ascii_lowercase())
}

/// Same as [`is_probable_atom`] but requires a specific type.
pub fn is_probable_atom_of_type(
    buf: &[u8],
    offset: usize,
    atom_type: AtomType,
    allow_invalid_length: bool,
) -> bool {
    probable_length(buf, offset, allow_invalid_length).is_some()
        && buf[offset + 4..offset + 8] == atom_type.0
}

/// Scan forward for the first probable box of `atom_type`.
pub fn find_probable_atom(
    buf: &[u8],
    atom_type: AtomType,
    allow_invalid_length: bool,
) -> Option<usize> {
    (0..buf.len().saturating_sub(7))
        .find(|&offset| is_probable_atom_of_type(buf, offset, atom_type, allow_invalid_length))
}

/// Walk sibling boxes starting at the first probable box header.
///
/// Stops at the first header that cannot be read; the last box may extend
/// past the end of the buffer.
pub fn walk_atoms(buf: &[u8]) -> Vec<Atom> {
    let Some(mut offset) = (0..buf.len().saturating_sub(7)).find(|&o| is_probable_atom(buf, o, true))
    else {
        return Vec::new();
    };

    let mut atoms = Vec::new();
    while buf.len().saturating_sub(offset) >= 8 {
        let Ok(atom) = read_atom(buf, offset) else {
            break;
        };
        let Ok(next) = usize::try_from(atom.end()) else {
            atoms.push(atom);
            break;
        };
        atoms.push(atom);
        offset = next;
    }
    atoms
}
