// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Backing-store capability traits.
//!
//! The node database treats its backing store as an opaque, ordered
//! key-value capability: point reads and writes, atomic batches, and
//! ordered iteration. Node blobs are stored under their 32-byte hashes;
//! the store may host other keyspaces as long as they cannot collide with
//! node hashes (prefix discipline is the caller's concern).

use thiserror::Error;

mod memdb;

pub use memdb::MemDb;

/// Errors surfaced by a backing store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// The store has been closed.
    #[error("database closed")]
    Closed,

    /// The requested key was not found.
    #[error("not found")]
    NotFound,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// The store returned bytes that fail validation.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl From<std::io::Error> for DatabaseError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// A key-value reader.
pub trait KeyValueReader: Send + Sync {
    /// Returns whether the key exists in the store.
    fn has(&self, key: &[u8]) -> Result<bool>;

    /// Gets the value for the given key, or `Ok(None)` if absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// A key-value writer.
pub trait KeyValueWriter: Send + Sync {
    /// Sets the value for the given key.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// A key-value deleter.
pub trait KeyValueDeleter: Send + Sync {
    /// Deletes the value for the given key; absent keys are a no-op.
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Batch creation interface.
pub trait Batcher: Send + Sync {
    /// Creates a new batch for atomic writes.
    fn new_batch(&self) -> Box<dyn Batch>;
}

/// Iterator creation interface. Iteration order is ascending by key.
pub trait Iteratee: Send + Sync {
    /// Creates an iterator over all key-value pairs.
    fn new_iterator(&self) -> Box<dyn DbIterator>;

    /// Creates an iterator positioned at the first key `>= start`.
    fn new_iterator_with_start(&self, start: &[u8]) -> Box<dyn DbIterator>;

    /// Creates an iterator over keys sharing the given prefix.
    fn new_iterator_with_prefix(&self, prefix: &[u8]) -> Box<dyn DbIterator>;

    /// Creates an iterator over keys sharing `prefix`, positioned at the
    /// first such key `>= start`.
    fn new_iterator_with_start_and_prefix(&self, start: &[u8], prefix: &[u8])
        -> Box<dyn DbIterator>;
}

/// The full backing-store contract required by the node database.
pub trait KeyValueStore:
    KeyValueReader + KeyValueWriter + KeyValueDeleter + Batcher + Iteratee
{
}

impl<T> KeyValueStore for T where
    T: KeyValueReader + KeyValueWriter + KeyValueDeleter + Batcher + Iteratee
{
}

/// A buffered set of writes applied atomically by [`Batch::write`].
pub trait Batch: Send {
    /// Queues a key-value insertion.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Queues a key deletion.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// The byte size of the queued operations.
    fn size(&self) -> usize;

    /// Applies the queued operations to the store.
    fn write(&mut self) -> Result<()>;

    /// Discards the queued operations for reuse.
    fn reset(&mut self);
}

/// An iterator over key-value pairs.
pub trait DbIterator: Send {
    /// Moves to the next pair; `false` when exhausted.
    fn next(&mut self) -> bool;

    /// Returns any accumulated error.
    fn error(&self) -> Option<&DatabaseError>;

    /// The current key. Only valid after `next()` returned `true`.
    fn key(&self) -> &[u8];

    /// The current value. Only valid after `next()` returned `true`.
    fn value(&self) -> &[u8];

    /// Releases resources held by the iterator.
    fn release(&mut self);
}
