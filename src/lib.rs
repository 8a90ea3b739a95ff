// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! # Hashwood: Hash-Addressed Merkle-Patricia Trie
//!
//! Hashwood is an authenticated, persistent, radix-16 key-value map. Every
//! subtree is identified by the Keccak-256 hash of its canonical RLP
//! serialization, so a single 32-byte root hash commits to the entire
//! mapping. Keys are byte strings, values are opaque byte blobs.
//!
//! The crate is split into three layers:
//!
//! - [`merkle`]: the trie engine itself. [`merkle::Merkle`] supports get,
//!   insert and remove over nibble paths, lazily computes subtree hashes,
//!   and collapses itself into content-addressed blobs on commit. Preorder
//!   node iteration and ordered key-value iteration live in
//!   [`merkle::stream`], including resumable iteration across transient
//!   missing-node failures.
//! - [`db`]: the node database. [`db::Db`] fronts a backing store with two
//!   tiers: a dirty tier holding committed-but-unflushed nodes (reference
//!   counted, flushed FIFO) and a byte-budgeted clean LRU of flushed blobs.
//! - [`storage`]: the backing-store capability. Any ordered key-value store
//!   implementing the [`storage::KeyValueStore`] traits can hold node
//!   blobs; [`storage::MemDb`] is the in-memory implementation used by
//!   tests and ephemeral deployments.
//!
//! A trie is opened from a root hash and a database handle. Mutations stage
//! new node instances and only replace the root on success, so a failed
//! operation leaves the trie untouched. `commit` hashes the dirty subtree
//! bottom-up and registers every node whose encoding reaches 32 bytes with
//! the database; shorter nodes are embedded inline in their parents.
//!
//! A trie instance is single-writer. Concurrent readers each open their own
//! [`merkle::Merkle`] over the shared [`db::Db`], which is safe for
//! concurrent lookups.

pub mod db;
pub mod logger;
pub mod merkle;
pub mod nibbles;
pub mod storage;

pub use crate::db::{Db, DbConfig};
pub use crate::merkle::{
    Merkle, MerkleError, MissingNodeError, TrieHash, EMPTY_ROOT, TRIE_HASH_LEN,
};
pub use crate::storage::{DatabaseError, KeyValueStore, MemDb};
