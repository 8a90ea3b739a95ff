// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The node database: an intermediate layer between the trie and its
//! backing store.
//!
//! Nodes committed by a trie land in the **dirty tier**, a reference
//! counted map from hash to blob threaded onto an intrusive FIFO list in
//! insertion order. [`Db::commit`] flushes the dirty subtree of a root to
//! the backing store oldest-first, so children always reach disk with (or
//! before) their parents, and moves the flushed blobs into the **clean
//! tier**, a byte-budgeted LRU. [`Db::dereference`] walks a retired root's
//! subtree dropping dirty nodes whose last referencing parent disappeared;
//! nodes already flushed are never deleted here, pruning persisted state
//! is the caller's job.
//!
//! Lookups search the dirty tier, then the clean tier, then the backing
//! store. The empty-trie
//! hash is a reserved sentinel: it is never stored and always reports
//! "not found", which lets callers distinguish an absent root from a
//! genuinely missing blob.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lru::LruCache;
use metrics::counter;
use parking_lot::Mutex;
use typed_builder::TypedBuilder;

use crate::logger::{debug, trace};
use crate::merkle::TrieHash;
use crate::storage::{DatabaseError, KeyValueStore};

/// Write batches against the backing store are flushed whenever they grow
/// past this size.
const IDEAL_BATCH_SIZE: usize = 100 * 1024;

/// Key prefix under which preimages are persisted in the backing store.
const PREIMAGE_PREFIX: &[u8] = b"preimage-";

/// Node database configuration.
#[derive(Clone, Debug, TypedBuilder)]
pub struct DbConfig {
    /// Byte budget of the clean-blob LRU. Zero disables the clean tier.
    #[builder(default = 0)]
    pub clean_cache_bytes: usize,
    /// Whether to retain key preimages handed to
    /// [`Db::insert_preimage`] and persist them on commit.
    #[builder(default = false)]
    pub preimages: bool,
}

/// A committed-but-unflushed node in the dirty tier. `parents` counts the
/// hash references other dirty nodes (and retained roots) hold to it;
/// `flush_prev`/`flush_next` thread the insertion-order flush list.
struct CachedNode {
    blob: Arc<[u8]>,
    parents: u32,
    children: Vec<TrieHash>,
    flush_prev: Option<TrieHash>,
    flush_next: Option<TrieHash>,
}

#[derive(Default)]
struct DirtyCache {
    nodes: HashMap<TrieHash, CachedNode>,
    oldest: Option<TrieHash>,
    newest: Option<TrieHash>,
    size: usize,
}

impl DirtyCache {
    fn push_newest(&mut self, hash: TrieHash, blob: Arc<[u8]>, children: Vec<TrieHash>) {
        let node = CachedNode {
            blob,
            parents: 0,
            children,
            flush_prev: self.newest,
            flush_next: None,
        };
        self.size += node.blob.len() + std::mem::size_of::<TrieHash>();
        match self.newest {
            Some(prev) => {
                self.nodes
                    .get_mut(&prev)
                    .expect("flush list points at live nodes")
                    .flush_next = Some(hash);
            }
            None => self.oldest = Some(hash),
        }
        self.newest = Some(hash);
        self.nodes.insert(hash, node);
    }

    fn unlink(&mut self, prev: Option<TrieHash>, next: Option<TrieHash>) {
        match prev {
            Some(prev) => {
                self.nodes
                    .get_mut(&prev)
                    .expect("flush list points at live nodes")
                    .flush_next = next;
            }
            None => self.oldest = next,
        }
        match next {
            Some(next) => {
                self.nodes
                    .get_mut(&next)
                    .expect("flush list points at live nodes")
                    .flush_prev = prev;
            }
            None => self.newest = prev,
        }
    }

    fn remove(&mut self, hash: &TrieHash) -> Option<CachedNode> {
        let node = self.nodes.remove(hash)?;
        self.unlink(node.flush_prev, node.flush_next);
        self.size -= node.blob.len() + std::mem::size_of::<TrieHash>();
        Some(node)
    }
}

struct CleanCache {
    cache: LruCache<TrieHash, Arc<[u8]>>,
    bytes: usize,
    budget: usize,
}

impl CleanCache {
    fn new(budget: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            bytes: 0,
            budget,
        }
    }

    fn get(&mut self, hash: &TrieHash) -> Option<Arc<[u8]>> {
        self.cache.get(hash).cloned()
    }

    fn insert(&mut self, hash: TrieHash, blob: Arc<[u8]>) {
        self.bytes += blob.len();
        if let Some(evicted) = self.cache.put(hash, blob) {
            self.bytes -= evicted.len();
        }
        while self.bytes > self.budget {
            match self.cache.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.len(),
                None => break,
            }
        }
    }
}

/// The node database. Cheap to share behind an [`Arc`]; all tiers are
/// internally synchronized, so concurrent readers may resolve nodes while
/// a single committer inserts, flushes or dereferences.
pub struct Db {
    disk: Arc<dyn KeyValueStore>,
    dirties: Mutex<DirtyCache>,
    cleans: Option<Mutex<CleanCache>>,
    preimages: Option<Mutex<HashMap<TrieHash, Vec<u8>>>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dirty_count", &self.dirty_count())
            .field("dirty_size", &self.dirty_size())
            .finish()
    }
}

impl Db {
    pub fn new<S: KeyValueStore + 'static>(disk: Arc<S>, config: DbConfig) -> Self {
        Self {
            disk,
            dirties: Mutex::new(DirtyCache::default()),
            cleans: (config.clean_cache_bytes > 0)
                .then(|| Mutex::new(CleanCache::new(config.clean_cache_bytes))),
            preimages: config.preimages.then(|| Mutex::new(HashMap::new())),
        }
    }

    /// Retrieves the blob of the node stored under `hash`, searching the
    /// dirty tier, then the clean tier, then the backing store. The empty
    /// hash is never stored and always reports [`DatabaseError::NotFound`].
    pub fn node(&self, hash: &TrieHash) -> Result<Arc<[u8]>, DatabaseError> {
        if hash.is_empty_root() {
            return Err(DatabaseError::NotFound);
        }
        if let Some(node) = self.dirties.lock().nodes.get(hash) {
            counter!("hashwood.cache.node", "tier" => "dirty").increment(1);
            return Ok(node.blob.clone());
        }
        if let Some(cleans) = &self.cleans {
            if let Some(blob) = cleans.lock().get(hash) {
                counter!("hashwood.cache.node", "tier" => "clean").increment(1);
                return Ok(blob);
            }
        }
        counter!("hashwood.cache.node", "tier" => "miss").increment(1);
        match self.disk.get(&hash.0)? {
            Some(blob) => {
                counter!("hashwood.read_node", "from" => "disk").increment(1);
                let blob: Arc<[u8]> = blob.into();
                if let Some(cleans) = &self.cleans {
                    cleans.lock().insert(*hash, blob.clone());
                }
                Ok(blob)
            }
            None => Err(DatabaseError::NotFound),
        }
    }

    /// Registers a freshly hashed node in the dirty tier and records one
    /// reference edge to each child that is itself still dirty. Inserting
    /// a hash that is already present is a no-op.
    pub fn insert(&self, hash: TrieHash, blob: Vec<u8>, children: Vec<TrieHash>) {
        let mut dirties = self.dirties.lock();
        if dirties.nodes.contains_key(&hash) {
            return;
        }
        trace!("dirty insert {hash:?} ({} bytes)", blob.len());
        dirties.push_newest(hash, blob.into(), children.clone());
        for child in children {
            if let Some(child) = dirties.nodes.get_mut(&child) {
                child.parents += 1;
            }
        }
    }

    /// Removes one reference from the subtree rooted at `root`, dropping
    /// every dirty node whose reference count reaches zero. Flushed nodes
    /// are untouched.
    pub fn dereference(&self, root: &TrieHash) {
        let mut dirties = self.dirties.lock();
        let mut pending = vec![*root];
        while let Some(hash) = pending.pop() {
            let Some(node) = dirties.nodes.get_mut(&hash) else {
                continue;
            };
            if node.parents > 0 {
                node.parents -= 1;
            }
            if node.parents == 0 {
                let node = dirties
                    .remove(&hash)
                    .expect("node was just looked up under the lock");
                pending.extend(node.children);
            }
        }
    }

    /// Flushes the dirty subtree rooted at `root` to the backing store,
    /// oldest node first, moving flushed blobs into the clean tier.
    /// Committing a root that is not dirty (including a re-commit) is a
    /// no-op. On error the dirty tier is left intact and the commit can be
    /// retried.
    pub fn commit(&self, root: &TrieHash) -> Result<(), DatabaseError> {
        let mut dirties = self.dirties.lock();
        if !dirties.nodes.contains_key(root) {
            return Ok(());
        }

        let mut batch = self.disk.new_batch();

        if let Some(preimages) = &self.preimages {
            for (hash, key) in preimages.lock().iter() {
                let mut store_key = PREIMAGE_PREFIX.to_vec();
                store_key.extend_from_slice(&hash.0);
                batch.put(&store_key, key)?;
            }
        }

        // The membership set: every dirty node reachable from `root`.
        let mut reachable = HashSet::new();
        let mut pending = vec![*root];
        while let Some(hash) = pending.pop() {
            if let Some(node) = dirties.nodes.get(&hash) {
                if reachable.insert(hash) {
                    pending.extend(node.children.iter().copied());
                }
            }
        }

        // Flush in insertion order; children entered the tier before their
        // parents, so they reach disk first.
        let mut flushed = Vec::with_capacity(reachable.len());
        let mut cursor = dirties.oldest;
        while let Some(hash) = cursor {
            let node = &dirties.nodes[&hash];
            cursor = node.flush_next;
            if !reachable.contains(&hash) {
                continue;
            }
            batch.put(&hash.0, &node.blob)?;
            flushed.push(hash);
            if batch.size() >= IDEAL_BATCH_SIZE {
                trace!("flushing batch of {} bytes", batch.size());
                batch.write()?;
                batch.reset();
            }
        }
        batch.write()?;
        if let Some(preimages) = &self.preimages {
            preimages.lock().clear();
        }

        debug!(
            "committed {root:?}: {} nodes flushed, {} dirty remain",
            flushed.len(),
            dirties.nodes.len() - flushed.len()
        );

        for hash in flushed {
            let node = dirties
                .remove(&hash)
                .expect("flushed hashes come from the dirty tier");
            if let Some(cleans) = &self.cleans {
                cleans.lock().insert(hash, node.blob);
            }
        }
        Ok(())
    }

    /// Records the preimage of a hashed key for debugging; retained only
    /// when the database was built with `preimages` enabled.
    pub fn insert_preimage(&self, hash: TrieHash, key: &[u8]) {
        if let Some(preimages) = &self.preimages {
            preimages.lock().insert(hash, key.to_vec());
        }
    }

    /// Looks up a previously recorded preimage, consulting unflushed
    /// entries first and the backing store second.
    pub fn preimage(&self, hash: &TrieHash) -> Option<Vec<u8>> {
        if let Some(preimages) = &self.preimages {
            if let Some(key) = preimages.lock().get(hash) {
                return Some(key.clone());
            }
        }
        let mut store_key = PREIMAGE_PREFIX.to_vec();
        store_key.extend_from_slice(&hash.0);
        self.disk.get(&store_key).ok().flatten()
    }

    /// The number of nodes currently in the dirty tier.
    pub fn dirty_count(&self) -> usize {
        self.dirties.lock().nodes.len()
    }

    /// The approximate byte size of the dirty tier.
    pub fn dirty_size(&self) -> usize {
        self.dirties.lock().size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::{keccak256, EMPTY_ROOT};
    use crate::storage::{KeyValueDeleter, KeyValueReader, MemDb};

    fn new_db(clean_cache_bytes: usize) -> (Arc<MemDb>, Db) {
        let disk = Arc::new(MemDb::new());
        let db = Db::new(
            disk.clone(),
            DbConfig::builder()
                .clean_cache_bytes(clean_cache_bytes)
                .build(),
        );
        (disk, db)
    }

    #[test]
    fn empty_root_fetch_is_missing() {
        let (_, db) = new_db(0);
        assert_eq!(db.node(&EMPTY_ROOT), Err(DatabaseError::NotFound));
        assert_eq!(db.node(&TrieHash::ZERO), Err(DatabaseError::NotFound));
    }

    #[test]
    fn lookup_order_dirty_then_disk() {
        let (disk, db) = new_db(1024);
        let blob = vec![0xaa; 40];
        let hash = keccak256(&blob);

        db.insert(hash, blob.clone(), vec![]);
        assert_eq!(&*db.node(&hash).unwrap(), blob.as_slice());
        assert!(!disk.has(&hash.0).unwrap());

        db.commit(&hash).unwrap();
        assert_eq!(disk.get(&hash.0).unwrap(), Some(blob.clone()));
        // served from the clean tier even after disk deletion
        disk.delete(&hash.0).unwrap();
        assert_eq!(&*db.node(&hash).unwrap(), blob.as_slice());
    }

    #[test]
    fn commit_is_idempotent_and_fifo() {
        let (disk, db) = new_db(0);
        let child = vec![0xbb; 40];
        let child_hash = keccak256(&child);
        let parent = vec![0xcc; 40];
        let parent_hash = keccak256(&parent);

        db.insert(child_hash, child, vec![]);
        db.insert(parent_hash, parent, vec![child_hash]);
        db.commit(&parent_hash).unwrap();

        assert_eq!(db.dirty_count(), 0);
        assert!(disk.has(&child_hash.0).unwrap());
        assert!(disk.has(&parent_hash.0).unwrap());

        // nothing new written on the second call
        let before = disk.len();
        db.commit(&parent_hash).unwrap();
        assert_eq!(disk.len(), before);
    }

    #[test]
    fn commit_skips_unrelated_subtrees() {
        let (disk, db) = new_db(0);
        let a = vec![0x01; 40];
        let a_hash = keccak256(&a);
        let b = vec![0x02; 40];
        let b_hash = keccak256(&b);

        db.insert(a_hash, a, vec![]);
        db.insert(b_hash, b, vec![]);
        db.commit(&a_hash).unwrap();

        assert!(disk.has(&a_hash.0).unwrap());
        assert!(!disk.has(&b_hash.0).unwrap());
        assert_eq!(db.dirty_count(), 1);
    }

    #[test]
    fn dereference_prunes_unreferenced_subtree() {
        let (_, db) = new_db(0);
        let shared = vec![0x03; 40];
        let shared_hash = keccak256(&shared);
        let root1 = vec![0x04; 40];
        let root1_hash = keccak256(&root1);
        let root2 = vec![0x05; 40];
        let root2_hash = keccak256(&root2);

        db.insert(shared_hash, shared, vec![]);
        db.insert(root1_hash, root1, vec![shared_hash]);
        db.insert(root2_hash, root2, vec![shared_hash]);
        assert_eq!(db.dirty_count(), 3);

        // the shared child survives while one parent still references it
        db.dereference(&root1_hash);
        assert_eq!(db.dirty_count(), 2);
        assert!(db.node(&shared_hash).is_ok());

        db.dereference(&root2_hash);
        assert_eq!(db.dirty_count(), 0);
    }

    #[test]
    fn flushed_nodes_survive_dereference() {
        let (disk, db) = new_db(0);
        let blob = vec![0x06; 40];
        let hash = keccak256(&blob);
        db.insert(hash, blob, vec![]);
        db.commit(&hash).unwrap();

        db.dereference(&hash);
        assert!(disk.has(&hash.0).unwrap());
    }

    #[test]
    fn clean_tier_respects_byte_budget() {
        let (disk, db) = new_db(100);
        let mut hashes = Vec::new();
        for i in 0..8u8 {
            let blob = vec![i; 40];
            let hash = keccak256(&blob);
            db.insert(hash, blob, vec![]);
            db.commit(&hash).unwrap();
            hashes.push(hash);
        }
        // all blobs are on disk regardless of cache churn
        for hash in &hashes {
            assert!(disk.has(&hash.0).unwrap());
        }
        let cleans = db.cleans.as_ref().unwrap().lock();
        assert!(cleans.bytes <= 100);
    }

    #[test]
    fn preimages_roundtrip_through_commit() {
        let disk = Arc::new(MemDb::new());
        let db = Db::new(disk.clone(), DbConfig::builder().preimages(true).build());

        let key = b"some account key";
        let key_hash = keccak256(key);
        db.insert_preimage(key_hash, key);
        assert_eq!(db.preimage(&key_hash), Some(key.to_vec()));

        let blob = vec![0x07; 40];
        let root = keccak256(&blob);
        db.insert(root, blob, vec![]);
        db.commit(&root).unwrap();

        // flushed to disk, still resolvable
        assert_eq!(db.preimage(&key_hash), Some(key.to_vec()));
        let mut store_key = PREIMAGE_PREFIX.to_vec();
        store_key.extend_from_slice(&key_hash.0);
        assert!(disk.has(&store_key).unwrap());
    }
}
