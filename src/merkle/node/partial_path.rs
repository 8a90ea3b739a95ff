// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

use bitflags::bitflags;
use std::fmt::{self, Debug};

bitflags! {
    // the header nibble of the compact encoding
    struct Flags: u8 {
        const TERMINAL = 0b0010;
        const ODD_LEN  = 0b0001;
    }
}

/// PartialPath keeps a list of nibbles to represent a path on the trie.
/// The terminator nibble is never stored; whether a path ends in a value
/// is carried by the node variant and the compact-encoding leaf flag.
#[derive(PartialEq, Eq, Clone)]
pub struct PartialPath(pub Vec<u8>);

impl Debug for PartialPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        for nib in self.0.iter() {
            write!(f, "{:x}", *nib & 0xf)?;
        }
        Ok(())
    }
}

impl std::ops::Deref for PartialPath {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PartialPath {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for PartialPath {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl PartialPath {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    /// Compact (hex-prefix) encoding of the path. The header nibble packs
    /// the leaf flag and the length parity; odd paths place their first
    /// nibble in the low half of the header byte, and the remaining
    /// nibbles pack two per byte, high first.
    pub(crate) fn encode(&self, is_terminal: bool) -> Vec<u8> {
        let mut flags = Flags::empty();

        if is_terminal {
            flags.insert(Flags::TERMINAL);
        }

        let mut out = Vec::with_capacity(self.0.len() / 2 + 1);

        let body = if self.0.len() & 1 == 1 {
            flags.insert(Flags::ODD_LEN);
            out.push((flags.bits() << 4) | self.0[0]);
            &self.0[1..]
        } else {
            out.push(flags.bits() << 4);
            &self.0[..]
        };

        out.extend(body.chunks_exact(2).map(|pair| (pair[0] << 4) | pair[1]));
        out
    }

    /// Decodes a compact-encoded path. Returns the nibbles and whether the
    /// path is terminal, or `None` if the header uses reserved flag bits.
    pub(crate) fn decode(raw: &[u8]) -> Option<(Self, bool)> {
        let header = *raw.first()?;
        let flags = Flags::from_bits(header >> 4)?;

        let mut nibbles = Vec::with_capacity(raw.len() * 2);
        if flags.contains(Flags::ODD_LEN) {
            nibbles.push(header & 0xf);
        }
        for byte in &raw[1..] {
            nibbles.push(byte >> 4);
            nibbles.push(byte & 0xf);
        }

        Some((Self(nibbles), flags.contains(Flags::TERMINAL)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&[1, 2, 3, 4], true)]
    #[test_case(&[1, 2, 3], false)]
    #[test_case(&[0, 1, 2], false)]
    #[test_case(&[1, 2], true)]
    #[test_case(&[1], true)]
    #[test_case(&[], false)]
    #[test_case(&[], true)]
    fn round_trip(steps: &[u8], term: bool) {
        let path = PartialPath(steps.to_vec());
        let encoded = path.encode(term);

        let (decoded, decoded_term) = PartialPath::decode(&encoded).unwrap();

        assert_eq!(&*decoded, steps);
        assert_eq!(decoded_term, term);
    }

    // reference vectors from the hex-prefix specification
    #[test_case(&[1, 2, 3, 4, 5], false, &[0x11, 0x23, 0x45])]
    #[test_case(&[0, 1, 2, 3, 4, 5], false, &[0x00, 0x01, 0x23, 0x45])]
    #[test_case(&[0, 15, 1, 12, 11, 8], true, &[0x20, 0x0f, 0x1c, 0xb8])]
    #[test_case(&[15, 1, 12, 11, 8], true, &[0x3f, 0x1c, 0xb8])]
    fn reference_vectors(steps: &[u8], term: bool, expected: &[u8]) {
        assert_eq!(PartialPath(steps.to_vec()).encode(term), expected);
    }

    #[test]
    fn reserved_header_bits_rejected() {
        assert!(PartialPath::decode(&[0x40]).is_none());
        assert!(PartialPath::decode(&[0x31, 0x23]).is_some());
    }

    #[test]
    fn empty_input_rejected() {
        assert!(PartialPath::decode(&[]).is_none());
    }
}
