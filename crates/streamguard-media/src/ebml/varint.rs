//! EBML variable-length integers.
//!
//! The number of leading zero bits in the first byte gives the total width
//! (1 to 8 bytes). Element IDs keep the length marker bit; sizes do not.

use crate::{Error, Result};

/// A decoded variable-length integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Varint {
    /// Encoded width in bytes.
    pub len: usize,
    /// Value with the length marker removed.
    pub value: u64,
    /// Raw big-endian value including the length marker.
    pub unmasked: u64,
}

impl Varint {
    /// Whether all value bits are set, which encodes an unknown size.
    pub fn is_unknown(&self) -> bool {
        self.value == value_mask(self.len)
    }
}

fn value_mask(len: usize) -> u64 {
    (1u64 << (7 * len)) - 1
}

/// Decode the varint starting at `index`.
pub fn decode(buf: &[u8], index: usize) -> Result<Varint> {
    let first = *buf.get(index).ok_or(Error::BufferUnderflow {
        need: index + 1,
        have: buf.len(),
    })?;
    if first == 0 {
        return Err(Error::invalid_ebml(format!(
            "varint at {} is wider than 8 bytes",
            index
        )));
    }

    let len = first.leading_zeros() as usize + 1;
    let bytes = buf.get(index..index + len).ok_or(Error::BufferUnderflow {
        need: index + len,
        have: buf.len(),
    })?;
    let unmasked = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);

    Ok(Varint {
        len,
        value: unmasked & value_mask(len),
        unmasked,
    })
}

/// The encoding of an unknown size in `len` bytes.
pub fn unknown_size(len: usize) -> Vec<u8> {
    let mut out = vec![0xFF; len.clamp(1, 8)];
    out[0] = 0xFF >> (out.len() - 1);
    out
}

/// Encode `value` as a size varint in the smallest width that fits.
pub fn encode_size(value: u64) -> Vec<u8> {
    let len = (1..=8)
        .find(|&len| value < value_mask(len))
        .unwrap_or(8);
    let marked = value | (1u64 << (7 * len));
    marked.to_be_bytes()[8 - len..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_widths() {
        let one = decode(&[0x81], 0).unwrap();
        assert_eq!((one.len, one.value, one.unmasked), (1, 1, 0x81));

        let two = decode(&[0x40, 0x02], 0).unwrap();
        assert_eq!((two.len, two.value), (2, 2));

        let id = decode(&[0x1A, 0x45, 0xDF, 0xA3, 0x00], 0).unwrap();
        assert_eq!(id.len, 4);
        assert_eq!(id.unmasked, 0x1A45_DFA3);
        assert_eq!(id.value, 0x0A45_DFA3);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode(&[0x00, 0x81], 0), Err(Error::InvalidEbml(_))));
        assert!(matches!(
            decode(&[0x10, 0x00], 0),
            Err(Error::BufferUnderflow { need: 4, have: 2 })
        ));
        assert!(decode(&[], 0).is_err());
    }

    #[test]
    fn test_unknown_size() {
        assert_eq!(unknown_size(1), vec![0xFF]);
        assert_eq!(unknown_size(8), vec![0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        for len in 1..=8 {
            let encoded = unknown_size(len);
            assert!(decode(&encoded, 0).unwrap().is_unknown());
        }
    }

    #[test]
    fn test_encode_size() {
        assert_eq!(encode_size(5), vec![0x85]);
        assert_eq!(encode_size(127), vec![0x40, 0x7F]);
        assert_eq!(decode(&encode_size(300), 0).unwrap().value, 300);
    }
}
