// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Preorder traversal over the physical node graph, and ordered key-value
//! iteration layered on top.
//!
//! [`MerkleNodeIter`] keeps an explicit stack of frames, one per node on
//! the path from the root to the cursor. A frame records the resolved
//! node, its hash (when materialized), the hash of its nearest
//! materialized ancestor, and how far its children have been emitted.
//! Because a failed hash resolution leaves the stack and the child cursor
//! of the failing frame untouched, the caller can repair the database and
//! call [`MerkleNodeIter::next`] again: the resolution is retried at the
//! same frame and no position is ever visited twice.
//!
//! Value positions are frames of their own whose nibble path ends in the
//! terminator, so a branch's value and a leaf's value iterate uniformly.
//! The terminator ranks below every nibble in path comparisons, which
//! makes preorder emission equal to ascending byte-key order (a key sorts
//! before all of its extensions).

use std::cmp::Ordering;
use std::rc::Rc;

use smallvec::SmallVec;

use super::{BranchNode, Data, Merkle, MerkleError, Node, NodeRef, NodeType, TrieHash};
use crate::nibbles::{from_nibbles, Nibbles, TERMINATOR};

/// A byte key reassembled from a nibble path.
pub type Key = Box<[u8]>;

type NibblePath = SmallVec<[u8; 64]>;

/// What the cursor rests on: a resolved node, or the value held at a
/// terminated position.
enum IterNode {
    Full(Rc<Node>),
    Value(Data),
}

struct IterFrame {
    node: IterNode,
    /// The node's own hash, when it is materialized in the database.
    hash: Option<TrieHash>,
    /// Hash of the nearest materialized ancestor.
    parent: Option<TrieHash>,
    /// Progress through the node's child positions; -1 before the first.
    index: i32,
    /// Length of the iterator path before this frame extended it.
    path_len: usize,
}

enum IterError {
    /// Traversal is complete; not an error for callers.
    End,
    /// Advancing failed; retried by the next call to `next`.
    Node(MerkleError),
    /// Seeking failed; the whole seek is retried by the next call.
    Seek { key: NibblePath, err: MerkleError },
}

enum SeekFailure {
    End,
    Failed(MerkleError),
}

/// Ranks the terminator below every nibble so that path order agrees with
/// byte-key order.
fn compare_paths(a: &[u8], b: &[u8]) -> Ordering {
    fn rank(nibble: u8) -> i16 {
        if nibble == TERMINATOR {
            -1
        } else {
            i16::from(nibble)
        }
    }
    for (x, y) in a.iter().zip(b.iter()) {
        match rank(*x).cmp(&rank(*y)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// A stateful preorder cursor over the trie's nodes.
pub struct MerkleNodeIter<'a> {
    merkle: &'a Merkle,
    stack: Vec<IterFrame>,
    path: NibblePath,
    err: Option<IterError>,
    started: bool,
}

impl<'a> MerkleNodeIter<'a> {
    /// A cursor positioned before the first entry with key `>= start`.
    /// An empty `start` iterates everything.
    pub(super) fn new(merkle: &'a Merkle, start: &[u8]) -> Self {
        let mut iter = Self {
            merkle,
            stack: Vec::new(),
            path: SmallVec::new(),
            err: None,
            started: false,
        };
        if !start.is_empty() {
            let key: NibblePath = Nibbles::new(start).into_iter().collect();
            iter.run_seek(key);
        }
        iter
    }

    /// Advances to the next node in preorder; with `descend` false the
    /// current subtree is skipped. Returns `false` at the end of the trie
    /// or on error; a successful retry after a repaired error picks up
    /// exactly where the failure happened.
    pub fn next(&mut self, descend: bool) -> bool {
        match &self.err {
            Some(IterError::End) => return false,
            Some(IterError::Seek { key, .. }) => {
                let key = key.clone();
                self.run_seek(key);
                if self.err.is_some() {
                    return false;
                }
            }
            _ => {}
        }
        match self.peek(descend) {
            Ok(Some((frame, path))) => {
                self.push(frame, path);
                self.err = None;
                true
            }
            Ok(None) => {
                self.err = Some(IterError::End);
                false
            }
            Err(e) => {
                self.err = Some(IterError::Node(e));
                false
            }
        }
    }

    /// The current node's hash; `None` for inline and value positions.
    pub fn hash(&self) -> Option<TrieHash> {
        self.stack.last()?.hash
    }

    /// Hash of the nearest materialized ancestor of the current node.
    pub fn parent(&self) -> Option<TrieHash> {
        self.stack.last()?.parent
    }

    /// Absolute nibble path of the cursor; value positions end in the
    /// terminator nibble.
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// The key-value pair when the cursor is on a value position.
    pub fn leaf(&self) -> Option<(Key, &[u8])> {
        match &self.stack.last()?.node {
            IterNode::Value(value) => {
                let nibbles = &self.path[..self.path.len() - 1];
                let key: Key = from_nibbles(nibbles).collect();
                Some((key, value))
            }
            IterNode::Full(_) => None,
        }
    }

    /// The sticky error of the last failed advance, if any. Cleared by a
    /// successful `next`; exhaustion is not an error.
    pub fn error(&self) -> Option<&MerkleError> {
        match &self.err {
            Some(IterError::Node(e)) | Some(IterError::Seek { err: e, .. }) => Some(e),
            _ => None,
        }
    }

    fn run_seek(&mut self, key: NibblePath) {
        match self.seek_to(&key) {
            Ok(()) => self.err = None,
            Err(SeekFailure::End) => self.err = Some(IterError::End),
            Err(SeekFailure::Failed(err)) => self.err = Some(IterError::Seek { key, err }),
        }
    }

    /// Descends toward `key`, stopping with the cursor just before the
    /// first position `>= key`. Progress survives a failure, so retrying
    /// the seek resumes the descent rather than rewinding.
    fn seek_to(&mut self, key: &[u8]) -> Result<(), SeekFailure> {
        loop {
            let descend = key.starts_with(&self.path);
            match self.peek(descend) {
                Ok(Some((frame, path))) => {
                    if compare_paths(&path, key) != Ordering::Less {
                        // leave the candidate unpushed; the next advance
                        // re-discovers it
                        return Ok(());
                    }
                    self.push(frame, path);
                }
                Ok(None) => return Err(SeekFailure::End),
                Err(e) => return Err(SeekFailure::Failed(e)),
            }
        }
    }

    /// Computes the next frame in preorder without committing it. On
    /// success the only state change is the parent's child cursor parking
    /// just before the found child, so a failed resolution is retried at
    /// the same position.
    fn peek(&mut self, descend: bool) -> Result<Option<(IterFrame, NibblePath)>, MerkleError> {
        if !self.started {
            let Some(root) = self.merkle.root_ref() else {
                self.started = true;
                return Ok(None);
            };
            let root_hash = self.merkle.hash();
            let node = match root {
                NodeRef::Hash(hash) => self.merkle.resolve(hash, &[])?,
                NodeRef::Inline(node) => node.clone(),
            };
            self.started = true;
            let frame = IterFrame {
                node: IterNode::Full(node),
                hash: Some(root_hash),
                parent: None,
                index: -1,
                path_len: 0,
            };
            return Ok(Some((frame, SmallVec::new())));
        }
        if !descend {
            self.pop();
        }
        while !self.stack.is_empty() {
            match self.next_child()? {
                Some(found) => return Ok(Some(found)),
                None => self.pop(),
            }
        }
        Ok(None)
    }

    /// The next unvisited child of the top frame. Branches emit their
    /// value position first, then children in nibble order; extensions
    /// and leaves have a single descendant.
    fn next_child(&mut self) -> Result<Option<(IterFrame, NibblePath)>, MerkleError> {
        let (node, index, ancestor) = {
            let top = self.stack.last().expect("caller checked a non-empty stack");
            let node = match &top.node {
                IterNode::Value(_) => return Ok(None),
                IterNode::Full(node) => node.clone(),
            };
            (node, top.index, top.hash.or(top.parent))
        };
        let path_len = self.path.len();
        match node.inner() {
            NodeType::Branch(branch) => {
                // logical position 0 is the value slot, position 1 + n is
                // the child at nibble n
                for pos in (index + 1)..=(BranchNode::MAX_CHILDREN as i32) {
                    if pos == 0 {
                        let Some(value) = &branch.value else { continue };
                        self.top_index(pos - 1);
                        let mut path = self.path.clone();
                        path.push(TERMINATOR);
                        let frame = IterFrame {
                            node: IterNode::Value(value.clone()),
                            hash: None,
                            parent: ancestor,
                            index: -1,
                            path_len,
                        };
                        return Ok(Some((frame, path)));
                    }
                    let nib = (pos - 1) as usize;
                    let Some(child_ref) = &branch.children[nib] else {
                        continue;
                    };
                    self.top_index(pos - 1);
                    let mut path = self.path.clone();
                    path.push(nib as u8);
                    let (child, hash) = self.resolve_ref(child_ref, &path)?;
                    let frame = IterFrame {
                        node: IterNode::Full(child),
                        hash,
                        parent: ancestor,
                        index: -1,
                        path_len,
                    };
                    return Ok(Some((frame, path)));
                }
                Ok(None)
            }
            NodeType::Extension(ext) => {
                if index >= 0 {
                    return Ok(None);
                }
                let mut path = self.path.clone();
                path.extend_from_slice(&ext.path);
                let (child, hash) = self.resolve_ref(&ext.child, &path)?;
                let frame = IterFrame {
                    node: IterNode::Full(child),
                    hash,
                    parent: ancestor,
                    index: -1,
                    path_len,
                };
                Ok(Some((frame, path)))
            }
            NodeType::Leaf(leaf) => {
                if index >= 0 {
                    return Ok(None);
                }
                let mut path = self.path.clone();
                path.extend_from_slice(&leaf.path);
                path.push(TERMINATOR);
                let frame = IterFrame {
                    node: IterNode::Value(leaf.value.clone()),
                    hash: None,
                    parent: ancestor,
                    index: -1,
                    path_len,
                };
                Ok(Some((frame, path)))
            }
        }
    }

    fn resolve_ref(
        &self,
        child: &NodeRef,
        path: &[u8],
    ) -> Result<(Rc<Node>, Option<TrieHash>), MerkleError> {
        match child {
            NodeRef::Hash(hash) => Ok((self.merkle.resolve(hash, path)?, Some(*hash))),
            NodeRef::Inline(node) => Ok((node.clone(), node.cached_hash())),
        }
    }

    fn top_index(&mut self, index: i32) {
        self.stack
            .last_mut()
            .expect("caller checked a non-empty stack")
            .index = index;
    }

    fn push(&mut self, frame: IterFrame, path: NibblePath) {
        self.path = path;
        self.stack.push(frame);
        let len = self.stack.len();
        if len >= 2 {
            self.stack[len - 2].index += 1;
        }
    }

    fn pop(&mut self) {
        if let Some(top) = self.stack.pop() {
            self.path.truncate(top.path_len);
        }
    }
}

/// Ascending key-value iteration over the trie. A yielded error is
/// retriable: repair the database and call `next` again; iteration
/// continues from where it stopped without repeating pairs.
pub struct MerkleKeyValueIter<'a> {
    nodes: MerkleNodeIter<'a>,
}

impl<'a> From<MerkleNodeIter<'a>> for MerkleKeyValueIter<'a> {
    fn from(nodes: MerkleNodeIter<'a>) -> Self {
        Self { nodes }
    }
}

impl<'a> Iterator for MerkleKeyValueIter<'a> {
    type Item = Result<(Key, Vec<u8>), MerkleError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.nodes.next(true) {
            if let Some((key, value)) = self.nodes.leaf() {
                let value = value.to_vec();
                return Some(Ok((key, value)));
            }
        }
        match self.nodes.error() {
            Some(e) => Some(Err(e.clone())),
            None => None,
        }
    }
}
