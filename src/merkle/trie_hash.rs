// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

use sha3::{Digest, Keccak256};
use std::fmt::{self, Debug, Display};

pub const TRIE_HASH_LEN: usize = 32;

/// The Keccak-256 digest of a node's canonical RLP serialization. A trie
/// hash uniquely identifies a node blob in the database; the hash of the
/// root node commits to the entire mapping.
#[derive(PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct TrieHash(pub [u8; TRIE_HASH_LEN]);

/// Hash of the empty trie: the Keccak-256 of the RLP empty string. Never
/// stored; every boundary treats it as the absent-root sentinel.
pub const EMPTY_ROOT: TrieHash = TrieHash([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
]);

impl TrieHash {
    pub const ZERO: TrieHash = TrieHash([0; TRIE_HASH_LEN]);

    /// True for the two values that stand for "no root": the all-zero hash
    /// and the empty-trie hash.
    #[must_use]
    pub fn is_empty_root(&self) -> bool {
        *self == EMPTY_ROOT || *self == Self::ZERO
    }
}

impl std::ops::Deref for TrieHash {
    type Target = [u8; TRIE_HASH_LEN];
    fn deref(&self) -> &[u8; TRIE_HASH_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for TrieHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; TRIE_HASH_LEN]> for TrieHash {
    fn from(value: [u8; TRIE_HASH_LEN]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for TrieHash {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        value.try_into().map(Self)
    }
}

impl Debug for TrieHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Display for TrieHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        Debug::fmt(self, f)
    }
}

/// Keccak-256 of `data` as a [`TrieHash`].
#[must_use]
pub fn keccak256(data: &[u8]) -> TrieHash {
    TrieHash(Keccak256::digest(data).into())
}
