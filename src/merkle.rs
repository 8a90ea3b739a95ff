// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The trie engine: a radix-16 Merkle-Patricia trie over nibble paths.
//!
//! [`Merkle`] holds the in-memory root of one trie. Mutations stage
//! replacement node instances along the touched path and only swap the
//! root on success, so any error leaves the previous mapping observable.
//! Unchanged subtrees are shared by reference and keep their memoized
//! hashes, which makes re-hashing after a mutation proportional to the
//! touched path rather than the trie size.

use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;

use crate::db::Db;
use crate::logger::trace;
use crate::nibbles::{prefix_len, Nibbles};
use crate::storage::DatabaseError;

mod node;
pub mod stream;
mod trie_hash;

pub use node::{BranchNode, Data, ExtNode, LeafNode, Node, NodeRef, NodeType, PartialPath};
pub use stream::{Key, MerkleKeyValueIter, MerkleNodeIter};
pub use trie_hash::{keccak256, TrieHash, EMPTY_ROOT, TRIE_HASH_LEN};

/// A hash reference could not be resolved by the database. Recoverable:
/// once the caller repairs the store (say, by fetching the blob from a
/// peer), the failed operation can simply be retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("missing trie node {hash} (owner {owner}) at path {path:x?}")]
pub struct MissingNodeError {
    /// Root hash of the trie the lookup started from.
    pub owner: TrieHash,
    /// The unresolvable hash.
    pub hash: TrieHash,
    /// Absolute nibble path at which the reference was encountered.
    pub path: Vec<u8>,
}

#[derive(Debug, Error, Clone)]
pub enum MerkleError {
    #[error(transparent)]
    MissingNode(#[from] MissingNodeError),
    /// A malformed blob came out of the database; the store is corrupt.
    #[error("decode error: {0}")]
    Decode(#[from] rlp::DecoderError),
    /// The operation does not accept an empty key.
    #[error("invalid key")]
    InvalidKey,
    #[error("trie invariant violated: {0}")]
    InvariantViolation(&'static str),
    #[error("backing store error: {0}")]
    Database(#[from] DatabaseError),
}

fn new_leaf(path: Vec<u8>, value: Data) -> NodeRef {
    NodeRef::Inline(Rc::new(Node::new(NodeType::Leaf(LeafNode {
        path: PartialPath(path),
        value,
    }))))
}

fn new_extension(path: Vec<u8>, child: NodeRef) -> NodeRef {
    NodeRef::Inline(Rc::new(Node::new(NodeType::Extension(ExtNode {
        path: PartialPath(path),
        child,
    }))))
}

fn new_branch(branch: BranchNode) -> NodeRef {
    NodeRef::Inline(Rc::new(Node::new(NodeType::Branch(Box::new(branch)))))
}

/// One Merkle-Patricia trie, rooted at a single hash. Single-writer: the
/// caller serializes mutations and commits. Readers wanting concurrency
/// open their own instance over the shared database.
pub struct Merkle {
    root: Option<NodeRef>,
    owner: TrieHash,
    db: Arc<Db>,
}

impl std::fmt::Debug for Merkle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merkle").field("owner", &self.owner).finish()
    }
}

impl Merkle {
    /// A trie with no entries.
    pub fn empty(db: Arc<Db>) -> Self {
        Self {
            root: None,
            owner: EMPTY_ROOT,
            db,
        }
    }

    /// Opens the trie committed under `root`. The empty (or zero) hash
    /// yields an empty trie; any other root is resolved eagerly so a
    /// dangling root hash fails here rather than on first use.
    pub fn new(root: TrieHash, db: Arc<Db>) -> Result<Self, MerkleError> {
        if root.is_empty_root() {
            return Ok(Self::empty(db));
        }
        let trie = Self {
            root: None,
            owner: root,
            db,
        };
        let node = trie.resolve(&root, &[])?;
        Ok(Self {
            root: Some(NodeRef::Inline(node)),
            ..trie
        })
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Fetches and decodes the node stored under `hash`. `path` is the
    /// absolute nibble position of the reference, for error reporting.
    pub(crate) fn resolve(&self, hash: &TrieHash, path: &[u8]) -> Result<Rc<Node>, MerkleError> {
        match self.db.node(hash) {
            Ok(blob) => Ok(Rc::new(Node::from_blob(&blob, Some(*hash))?)),
            Err(DatabaseError::NotFound) => Err(MissingNodeError {
                owner: self.owner,
                hash: *hash,
                path: path.to_vec(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn root_ref(&self) -> Option<&NodeRef> {
        self.root.as_ref()
    }

    /// Looks up the value stored under `key`, descending from the root and
    /// resolving hash references through the database as encountered.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MerkleError> {
        let path: Vec<u8> = Nibbles::new(key).into_iter().collect();
        let mut consumed = 0;
        let mut cur = match &self.root {
            None => return Ok(None),
            Some(root) => root.clone(),
        };
        loop {
            let rest = &path[consumed..];
            let node = match cur {
                NodeRef::Hash(hash) => self.resolve(&hash, &path[..consumed])?,
                NodeRef::Inline(node) => node,
            };
            match node.inner() {
                NodeType::Leaf(leaf) => {
                    return Ok((rest == &*leaf.path).then(|| leaf.value.to_vec()));
                }
                NodeType::Extension(ext) => {
                    if rest.len() < ext.path.len() || !rest.starts_with(&ext.path) {
                        return Ok(None);
                    }
                    consumed += ext.path.len();
                    cur = ext.child.clone();
                }
                NodeType::Branch(branch) => match rest.split_first() {
                    None => return Ok(branch.value.as_ref().map(|v| v.to_vec())),
                    Some((&nib, _)) => match &branch.children[nib as usize] {
                        None => return Ok(None),
                        Some(child) => {
                            consumed += 1;
                            cur = child.clone();
                        }
                    },
                },
            }
        }
    }

    /// Maps `key` to `value`. Writing an empty value deletes the key.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), MerkleError> {
        if key.is_empty() {
            return Err(MerkleError::InvalidKey);
        }
        if value.is_empty() {
            return self.remove(key);
        }
        let path: Vec<u8> = Nibbles::new(key).into_iter().collect();
        let mut prefix = Vec::with_capacity(path.len());
        let (new_root, _) =
            self.insert_at(self.root.clone(), &mut prefix, &path, Data(value.to_vec()))?;
        self.root = Some(new_root);
        Ok(())
    }

    /// `(node, dirty)` recursion for [`Self::insert`]. `prefix` is the
    /// absolute path already descended (error reporting only); `rest` is
    /// what remains of the key. A `false` dirty bit hands the caller back
    /// its original reference so memoized hashes survive.
    fn insert_at(
        &self,
        node: Option<NodeRef>,
        prefix: &mut Vec<u8>,
        rest: &[u8],
        value: Data,
    ) -> Result<(NodeRef, bool), MerkleError> {
        let Some(node_ref) = node else {
            return Ok((new_leaf(rest.to_vec(), value), true));
        };
        let node = match &node_ref {
            NodeRef::Hash(hash) => self.resolve(hash, prefix)?,
            NodeRef::Inline(node) => node.clone(),
        };
        match node.inner() {
            NodeType::Leaf(leaf) => {
                let cp = prefix_len(&leaf.path, rest);
                if cp == leaf.path.len() && cp == rest.len() {
                    if leaf.value == value {
                        return Ok((node_ref, false));
                    }
                    return Ok((new_leaf(rest.to_vec(), value), true));
                }
                // keys diverge: fan out through a branch
                let mut branch = BranchNode::default();
                if cp == leaf.path.len() {
                    branch.value = Some(leaf.value.clone());
                } else {
                    branch.children[leaf.path[cp] as usize] =
                        Some(new_leaf(leaf.path[cp + 1..].to_vec(), leaf.value.clone()));
                }
                if cp == rest.len() {
                    branch.value = Some(value);
                } else {
                    branch.children[rest[cp] as usize] =
                        Some(new_leaf(rest[cp + 1..].to_vec(), value));
                }
                let mut split = new_branch(branch);
                if cp > 0 {
                    split = new_extension(rest[..cp].to_vec(), split);
                }
                Ok((split, true))
            }
            NodeType::Extension(ext) => {
                let cp = prefix_len(&ext.path, rest);
                if cp == ext.path.len() {
                    prefix.extend_from_slice(&rest[..cp]);
                    let (child, dirty) =
                        self.insert_at(Some(ext.child.clone()), prefix, &rest[cp..], value)?;
                    prefix.truncate(prefix.len() - cp);
                    if !dirty {
                        return Ok((node_ref, false));
                    }
                    return Ok((new_extension(ext.path.to_vec(), child), true));
                }
                // the new key leaves the extension's path partway through
                let mut branch = BranchNode::default();
                branch.children[ext.path[cp] as usize] = Some(if cp + 1 == ext.path.len() {
                    ext.child.clone()
                } else {
                    new_extension(ext.path[cp + 1..].to_vec(), ext.child.clone())
                });
                if cp == rest.len() {
                    branch.value = Some(value);
                } else {
                    branch.children[rest[cp] as usize] =
                        Some(new_leaf(rest[cp + 1..].to_vec(), value));
                }
                let mut split = new_branch(branch);
                if cp > 0 {
                    split = new_extension(rest[..cp].to_vec(), split);
                }
                Ok((split, true))
            }
            NodeType::Branch(branch) => {
                let Some((&nib, tail)) = rest.split_first() else {
                    if branch.value.as_ref() == Some(&value) {
                        return Ok((node_ref, false));
                    }
                    let mut updated = (**branch).clone();
                    updated.value = Some(value);
                    return Ok((new_branch(updated), true));
                };
                prefix.push(nib);
                let (child, dirty) = self.insert_at(
                    branch.children[nib as usize].clone(),
                    prefix,
                    tail,
                    value,
                )?;
                prefix.pop();
                if !dirty {
                    return Ok((node_ref, false));
                }
                let mut updated = (**branch).clone();
                updated.children[nib as usize] = Some(child);
                Ok((new_branch(updated), true))
            }
        }
    }

    /// Unmaps `key`. Absent keys are a no-op. Branches left with a single
    /// occupant collapse on unwind so the unique-shape invariant holds at
    /// every observation point.
    pub fn remove(&mut self, key: &[u8]) -> Result<(), MerkleError> {
        if key.is_empty() {
            return Err(MerkleError::InvalidKey);
        }
        let path: Vec<u8> = Nibbles::new(key).into_iter().collect();
        let mut prefix = Vec::with_capacity(path.len());
        let (new_root, dirty) = self.remove_at(self.root.clone(), &mut prefix, &path)?;
        if dirty {
            self.root = new_root;
        }
        Ok(())
    }

    fn remove_at(
        &self,
        node: Option<NodeRef>,
        prefix: &mut Vec<u8>,
        rest: &[u8],
    ) -> Result<(Option<NodeRef>, bool), MerkleError> {
        let Some(node_ref) = node else {
            return Ok((None, false));
        };
        let node = match &node_ref {
            NodeRef::Hash(hash) => self.resolve(hash, prefix)?,
            NodeRef::Inline(node) => node.clone(),
        };
        match node.inner() {
            NodeType::Leaf(leaf) => {
                if rest == &*leaf.path {
                    Ok((None, true))
                } else {
                    Ok((Some(node_ref), false))
                }
            }
            NodeType::Extension(ext) => {
                if rest.len() < ext.path.len() || !rest.starts_with(&ext.path) {
                    return Ok((Some(node_ref), false));
                }
                prefix.extend_from_slice(&ext.path);
                let (child, dirty) =
                    self.remove_at(Some(ext.child.clone()), prefix, &rest[ext.path.len()..])?;
                prefix.truncate(prefix.len() - ext.path.len());
                if !dirty {
                    return Ok((Some(node_ref), false));
                }
                let Some(child) = child else {
                    return Ok((None, true));
                };
                // a collapsed child merges into this extension's path
                let merged = match &child {
                    NodeRef::Inline(c) => match c.inner() {
                        NodeType::Leaf(sub) => {
                            let mut path = ext.path.to_vec();
                            path.extend_from_slice(&sub.path);
                            new_leaf(path, sub.value.clone())
                        }
                        NodeType::Extension(sub) => {
                            let mut path = ext.path.to_vec();
                            path.extend_from_slice(&sub.path);
                            new_extension(path, sub.child.clone())
                        }
                        NodeType::Branch(_) => new_extension(ext.path.to_vec(), child.clone()),
                    },
                    NodeRef::Hash(_) => new_extension(ext.path.to_vec(), child.clone()),
                };
                Ok((Some(merged), true))
            }
            NodeType::Branch(branch) => {
                let Some((&nib, tail)) = rest.split_first() else {
                    if branch.value.is_none() {
                        return Ok((Some(node_ref), false));
                    }
                    let mut updated = (**branch).clone();
                    updated.value = None;
                    return Ok((Some(self.collapse_branch(updated, prefix)?), true));
                };
                prefix.push(nib);
                let (child, dirty) =
                    self.remove_at(branch.children[nib as usize].clone(), prefix, tail)?;
                prefix.pop();
                if !dirty {
                    return Ok((Some(node_ref), false));
                }
                let mut updated = (**branch).clone();
                updated.children[nib as usize] = child;
                Ok((Some(self.collapse_branch(updated, prefix)?), true))
            }
        }
    }

    /// Restores the branch invariants after a removal. A branch keeping
    /// two or more occupants stands; one with only its value left becomes
    /// a leaf; one with a single child merges into that child, resolving
    /// it if needed to learn whether paths concatenate.
    fn collapse_branch(
        &self,
        branch: BranchNode,
        prefix: &[u8],
    ) -> Result<NodeRef, MerkleError> {
        let occupied = branch.child_count() + usize::from(branch.value.is_some());
        if occupied >= 2 {
            return Ok(new_branch(branch));
        }
        if let Some(value) = branch.value {
            return Ok(new_leaf(Vec::new(), value));
        }
        let nib = branch.single_child_index().ok_or(MerkleError::InvariantViolation(
            "branch left with no children and no value",
        ))?;
        let child_ref = branch.children[nib as usize]
            .clone()
            .expect("single_child_index returned an occupied slot");
        let child = match &child_ref {
            NodeRef::Hash(hash) => {
                let mut path = prefix.to_vec();
                path.push(nib);
                self.resolve(hash, &path)?
            }
            NodeRef::Inline(node) => node.clone(),
        };
        Ok(match child.inner() {
            NodeType::Leaf(sub) => {
                let mut path = vec![nib];
                path.extend_from_slice(&sub.path);
                new_leaf(path, sub.value.clone())
            }
            NodeType::Extension(sub) => {
                let mut path = vec![nib];
                path.extend_from_slice(&sub.path);
                new_extension(path, sub.child.clone())
            }
            // branches hang off a one-nibble extension; keep the original
            // reference so an already-hashed child stays by hash
            NodeType::Branch(_) => new_extension(vec![nib], child_ref),
        })
    }

    /// The root hash of the current mapping. Pure: memoizes subtree hashes
    /// but persists nothing.
    pub fn hash(&self) -> TrieHash {
        match &self.root {
            None => EMPTY_ROOT,
            Some(NodeRef::Hash(hash)) => *hash,
            Some(NodeRef::Inline(node)) => {
                hash_subtree(node, true, None).expect("a forced root always hashes")
            }
        }
    }

    /// Hashes the trie and registers every node whose encoding reaches 32
    /// bytes (and the root, regardless of size) with the database's dirty
    /// tier. Returns the new root hash. Re-committing an unchanged trie
    /// writes nothing.
    pub fn commit(&mut self) -> Result<TrieHash, MerkleError> {
        let root_hash = match &self.root {
            None => EMPTY_ROOT,
            Some(NodeRef::Hash(hash)) => *hash,
            Some(NodeRef::Inline(node)) => {
                hash_subtree(node, true, Some(&self.db)).expect("a forced root always hashes")
            }
        };
        trace!("committed trie {root_hash:?}");
        self.owner = root_hash;
        Ok(root_hash)
    }

    /// Preorder iterator over the physical node graph.
    pub fn node_iter(&self) -> MerkleNodeIter<'_> {
        MerkleNodeIter::new(self, &[])
    }

    /// Preorder iterator positioned at the first entry with key `>= key`.
    pub fn node_iter_from_key(&self, key: &[u8]) -> MerkleNodeIter<'_> {
        MerkleNodeIter::new(self, key)
    }

    /// Ascending iterator over the key-value pairs of the trie.
    pub fn key_value_iter(&self) -> MerkleKeyValueIter<'_> {
        MerkleKeyValueIter::from(self.node_iter())
    }

    /// Ascending key-value iteration starting at the first key `>= key`.
    pub fn key_value_iter_from_key(&self, key: &[u8]) -> MerkleKeyValueIter<'_> {
        MerkleKeyValueIter::from(self.node_iter_from_key(key))
    }
}

/// Post-order hashing pass. Children hash before their parent encodes a
/// reference to them; with `db` set, every dirty node that materializes
/// (32-byte encoding or a forced root) is registered together with its
/// child hash edges, oldest first. Returns the node's hash, or `None` for
/// nodes that stay inline in their parent.
fn hash_subtree(node: &Rc<Node>, force: bool, db: Option<&Db>) -> Option<TrieHash> {
    if let Some(hash) = node.cached_hash() {
        if db.is_none() || !node.is_dirty() {
            return Some(hash);
        }
    }
    match node.inner() {
        NodeType::Branch(branch) => {
            for child in branch.children.iter().flatten() {
                if let NodeRef::Inline(child) = child {
                    hash_subtree(child, false, db);
                }
            }
        }
        NodeType::Extension(ext) => {
            if let NodeRef::Inline(child) = &ext.child {
                hash_subtree(child, false, db);
            }
        }
        NodeType::Leaf(_) => {}
    }
    if !node.rlp_long() && !force {
        if db.is_some() {
            node.set_clean();
        }
        return None;
    }
    let hash = *node.compute_hash();
    if let Some(db) = db {
        if node.is_dirty() {
            db.insert(hash, node.encoded().to_vec(), node.child_hashes());
            node.set_clean();
        }
    }
    Some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbConfig;
    use crate::storage::{KeyValueDeleter, KeyValueWriter, MemDb};
    use hex_literal::hex;

    fn new_env() -> (Arc<MemDb>, Arc<Db>) {
        let disk = Arc::new(MemDb::new());
        let db = Arc::new(Db::new(
            disk.clone(),
            DbConfig::builder().clean_cache_bytes(256 * 1024).build(),
        ));
        (disk, db)
    }

    fn new_trie() -> Merkle {
        Merkle::empty(new_env().1)
    }

    #[test]
    fn empty_trie_hash() {
        assert_eq!(new_trie().hash(), EMPTY_ROOT);
    }

    #[test]
    fn insert_reference_roots() {
        // reference vectors from the Ethereum trie test suite
        let mut trie = new_trie();
        trie.insert(b"doe", b"reindeer").unwrap();
        trie.insert(b"dog", b"puppy").unwrap();
        trie.insert(b"dogglesworth", b"cat").unwrap();
        assert_eq!(
            trie.hash(),
            TrieHash(hex!(
                "8aad789dff2f538bca5d8ea56e8abe10f4c7ba3a5dea95fea4cd6e7c3a1168d3"
            ))
        );

        let mut trie = new_trie();
        trie.insert(b"A", b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .unwrap();
        assert_eq!(
            trie.hash(),
            TrieHash(hex!(
                "d23786fb4a010da3ce639d66d5e904a11dbc02746d1ce25029e53290cabf28ab"
            ))
        );
    }

    #[test]
    fn get_round_trips() {
        let mut trie = new_trie();
        trie.insert(b"do", b"verb").unwrap();
        trie.insert(b"dog", b"puppy").unwrap();
        trie.insert(b"doge", b"coin").unwrap();

        assert_eq!(trie.get(b"do").unwrap(), Some(b"verb".to_vec()));
        assert_eq!(trie.get(b"dog").unwrap(), Some(b"puppy".to_vec()));
        assert_eq!(trie.get(b"doge").unwrap(), Some(b"coin".to_vec()));
        assert_eq!(trie.get(b"d").unwrap(), None);
        assert_eq!(trie.get(b"dogs").unwrap(), None);
        assert_eq!(trie.get(b"").unwrap(), None);

        trie.insert(b"dog", b"hound").unwrap();
        assert_eq!(trie.get(b"dog").unwrap(), Some(b"hound".to_vec()));
    }

    #[test]
    fn root_hash_is_insertion_order_independent() {
        let vals: [(&[u8], &[u8]); 7] = [
            (b"do", b"verb"),
            (b"ether", b"wookiedoo"),
            (b"horse", b"stallion"),
            (b"shaman", b"horse"),
            (b"doge", b"coin"),
            (b"dog", b"puppy"),
            (b"somethingveryoddindeedthis is", b"myothernodedata"),
        ];
        let mut forward = new_trie();
        for (k, v) in vals {
            forward.insert(k, v).unwrap();
        }
        let mut reverse = new_trie();
        for (k, v) in vals.iter().rev() {
            reverse.insert(k, v).unwrap();
        }
        assert_eq!(forward.hash(), reverse.hash());
    }

    #[test]
    fn empty_value_deletes() {
        let mut trie = new_trie();
        trie.insert(b"key", b"value").unwrap();
        trie.insert(b"key", b"").unwrap();
        assert_eq!(trie.get(b"key").unwrap(), None);
        assert_eq!(trie.hash(), EMPTY_ROOT);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut trie = new_trie();
        trie.insert(b"alpha", b"1").unwrap();
        trie.insert(b"beta", b"2").unwrap();

        trie.remove(b"alpha").unwrap();
        let hash = trie.hash();
        trie.remove(b"alpha").unwrap();
        assert_eq!(trie.hash(), hash);
        assert_eq!(trie.get(b"beta").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn empty_keys_are_rejected() {
        let mut trie = new_trie();
        assert!(matches!(
            trie.insert(b"", b"value"),
            Err(MerkleError::InvalidKey)
        ));
        assert!(matches!(trie.remove(b""), Err(MerkleError::InvalidKey)));
    }

    #[test]
    fn delete_collapses_branch_to_leaf() {
        let mut trie = new_trie();
        trie.insert(b"ab", b"1").unwrap();
        trie.insert(b"ac", b"2").unwrap();
        trie.remove(b"ac").unwrap();

        let mut fresh = new_trie();
        fresh.insert(b"ab", b"1").unwrap();
        assert_eq!(trie.hash(), fresh.hash());
    }

    #[test]
    fn deletion_restores_prior_roots() {
        let mut trie = new_trie();
        trie.insert(b"do", b"verb").unwrap();
        trie.insert(b"horse", b"stallion").unwrap();
        let two = trie.hash();

        trie.insert(b"doge", b"coin").unwrap();
        trie.insert(b"dog", b"puppy").unwrap();
        trie.remove(b"dog").unwrap();
        trie.remove(b"doge").unwrap();
        assert_eq!(trie.hash(), two);

        trie.remove(b"horse").unwrap();
        trie.remove(b"do").unwrap();
        assert_eq!(trie.hash(), EMPTY_ROOT);
    }

    #[test]
    fn hash_does_not_persist() {
        let (_, db) = new_env();
        let mut trie = Merkle::empty(db.clone());
        trie.insert(b"doe", b"reindeer").unwrap();
        let _ = trie.hash();
        assert_eq!(db.dirty_count(), 0);

        trie.commit().unwrap();
        assert!(db.dirty_count() > 0);
    }

    #[test]
    fn commit_is_idempotent() {
        let (_, db) = new_env();
        let mut trie = Merkle::empty(db.clone());
        trie.insert(b"doe", b"reindeer").unwrap();
        trie.insert(b"dog", b"puppy").unwrap();

        let root = trie.commit().unwrap();
        let count = db.dirty_count();
        assert_eq!(trie.commit().unwrap(), root);
        assert_eq!(db.dirty_count(), count);
        assert_eq!(trie.hash(), root);
    }

    #[test]
    fn reopen_from_committed_root() {
        let (_, db) = new_env();
        let mut trie = Merkle::empty(db.clone());
        trie.insert(b"doe", b"reindeer").unwrap();
        trie.insert(b"dog", b"puppy").unwrap();
        trie.insert(b"dogglesworth", b"cat").unwrap();
        let root = trie.commit().unwrap();

        let reopened = Merkle::new(root, db.clone()).unwrap();
        assert_eq!(reopened.get(b"doe").unwrap(), Some(b"reindeer".to_vec()));
        assert_eq!(reopened.get(b"dog").unwrap(), Some(b"puppy".to_vec()));
        assert_eq!(
            reopened.get(b"dogglesworth").unwrap(),
            Some(b"cat".to_vec())
        );
        assert_eq!(reopened.hash(), root);
    }

    #[test]
    fn reopen_survives_disk_round_trip() {
        let (disk, db) = new_env();
        let mut trie = Merkle::empty(db.clone());
        for (k, v) in [(&b"barb"[..], &b"ba"[..]), (b"bard", b"bc"), (b"bars", b"bb")] {
            trie.insert(k, v).unwrap();
        }
        let root = trie.commit().unwrap();
        db.commit(&root).unwrap();

        // a database with no clean tier must read through to disk
        let cold = Arc::new(Db::new(disk, DbConfig::builder().build()));
        let reopened = Merkle::new(root, cold).unwrap();
        assert_eq!(reopened.get(b"bard").unwrap(), Some(b"bc".to_vec()));
        assert_eq!(reopened.hash(), root);
    }

    #[test]
    fn dangling_root_is_missing_node() {
        let (_, db) = new_env();
        let bogus = keccak256(b"nothing stored here");
        match Merkle::new(bogus, db) {
            Err(MerkleError::MissingNode(e)) => {
                assert_eq!(e.hash, bogus);
                assert_eq!(e.owner, bogus);
                assert!(e.path.is_empty());
            }
            other => panic!("expected MissingNode, got {other:?}"),
        }
    }

    #[test]
    fn missing_interior_node_surfaces_hash_and_path() {
        let (disk, db) = new_env();
        let mut trie = Merkle::empty(db.clone());
        // two long values force both leaves out of line under the branch
        trie.insert(b"abc", &[0x11; 40]).unwrap();
        trie.insert(b"abd", &[0x22; 40]).unwrap();
        let root = trie.commit().unwrap();
        db.commit(&root).unwrap();

        // drop one non-root node from disk and read through a cold database
        let (victim_hash, victim_blob) =
            victim_other_than(&disk, &root).expect("trie should persist more than the root");
        disk.delete(&victim_hash.0).unwrap();

        let cold = Arc::new(Db::new(disk.clone(), DbConfig::builder().build()));
        let reopened = Merkle::new(root, cold).unwrap();
        let missing = [b"abc".as_slice(), b"abd".as_slice()]
            .into_iter()
            .find_map(|key| match reopened.get(key) {
                Err(MerkleError::MissingNode(e)) => Some(e),
                _ => None,
            })
            .expect("one lookup must cross the deleted node");
        assert_eq!(missing.hash, victim_hash);
        assert_eq!(missing.owner, root);
        // repair and retry: the same lookup now succeeds
        disk.put(&victim_hash.0, &victim_blob).unwrap();
        assert!(reopened.get(b"abc").unwrap().is_some());
    }

    /// Some stored node hash other than `root`, with its blob.
    fn victim_other_than(disk: &MemDb, root: &TrieHash) -> Option<(TrieHash, Vec<u8>)> {
        use crate::storage::{DbIterator as _, Iteratee as _};
        let mut iter = disk.new_iterator();
        while iter.next() {
            if iter.key().len() == TRIE_HASH_LEN && iter.key() != root.as_ref() {
                let hash = TrieHash::try_from(iter.key()).ok()?;
                return Some((hash, iter.value().to_vec()));
            }
        }
        None
    }
}
