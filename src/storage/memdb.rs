// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! In-memory backing store over a `BTreeMap`, for tests and ephemeral
//! deployments. Thread-safe; values are cloned on the way in and out.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{
    Batch, Batcher, DatabaseError, DbIterator, Iteratee, KeyValueDeleter, KeyValueReader,
    KeyValueWriter, Result,
};

type Store = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// An in-memory key-value store.
#[derive(Debug, Default)]
pub struct MemDb {
    data: Store,
    closed: Arc<AtomicBool>,
}

impl MemDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Marks the store closed; every subsequent operation fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }
}

impl KeyValueReader for MemDb {
    fn has(&self, key: &[u8]) -> Result<bool> {
        self.check_closed()?;
        Ok(self.data.read().contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_closed()?;
        Ok(self.data.read().get(key).cloned())
    }
}

impl KeyValueWriter for MemDb {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl KeyValueDeleter for MemDb {
    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_closed()?;
        self.data.write().remove(key);
        Ok(())
    }
}

impl Batcher for MemDb {
    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(MemBatch {
            data: self.data.clone(),
            closed: self.closed.clone(),
            ops: Vec::new(),
            size: 0,
        })
    }
}

impl Iteratee for MemDb {
    fn new_iterator(&self) -> Box<dyn DbIterator> {
        self.new_iterator_with_start_and_prefix(&[], &[])
    }

    fn new_iterator_with_start(&self, start: &[u8]) -> Box<dyn DbIterator> {
        self.new_iterator_with_start_and_prefix(start, &[])
    }

    fn new_iterator_with_prefix(&self, prefix: &[u8]) -> Box<dyn DbIterator> {
        self.new_iterator_with_start_and_prefix(&[], prefix)
    }

    fn new_iterator_with_start_and_prefix(
        &self,
        start: &[u8],
        prefix: &[u8],
    ) -> Box<dyn DbIterator> {
        let from = if start > prefix { start } else { prefix };
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .read()
            .range(from.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(MemIterator { entries, pos: None })
    }
}

enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

struct MemBatch {
    data: Store,
    closed: Arc<AtomicBool>,
    ops: Vec<BatchOp>,
    size: usize,
}

impl Batch for MemBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.size += key.len();
        self.ops.push(BatchOp::Delete { key: key.to_vec() });
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn write(&mut self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed);
        }
        let mut data = self.data.write();
        for op in self.ops.drain(..) {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        self.size = 0;
        Ok(())
    }

    fn reset(&mut self) {
        self.ops.clear();
        self.size = 0;
    }
}

struct MemIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
}

impl DbIterator for MemIterator {
    fn next(&mut self) -> bool {
        let next = self.pos.map_or(0, |p| p + 1);
        if next >= self.entries.len() {
            return false;
        }
        self.pos = Some(next);
        true
    }

    fn error(&self) -> Option<&DatabaseError> {
        None
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos.expect("next() not called")].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos.expect("next() not called")].1
    }

    fn release(&mut self) {
        self.entries.clear();
        self.pos = None;
    }
}
