// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

use enum_as_inner::EnumAsInner;
use rlp::{DecoderError, Rlp, RlpStream};
use std::{
    cell::{Cell, OnceCell},
    fmt::{self, Debug},
    rc::Rc,
};

mod partial_path;

pub use partial_path::PartialPath;

use super::{keccak256, MerkleError, TrieHash, TRIE_HASH_LEN};

/// An opaque value blob held by a leaf or a branch's value slot.
#[derive(PartialEq, Eq, Clone)]
pub struct Data(pub(crate) Vec<u8>);

impl std::ops::Deref for Data {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Data {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl Data {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

/// A reference from a node to one of its children: either the child's
/// 32-byte hash, standing in for a node in the database, or the child
/// itself when it is held in memory. Inline children whose encoding stays
/// under [`TRIE_HASH_LEN`] bytes are embedded raw in the parent's
/// serialization; everything else serializes as its hash.
#[derive(PartialEq, Eq, Clone)]
pub enum NodeRef {
    Hash(TrieHash),
    Inline(Rc<Node>),
}

impl NodeRef {
    /// Appends this reference to an in-progress node serialization.
    fn append_to(&self, stream: &mut RlpStream) {
        match self {
            NodeRef::Hash(hash) => {
                stream.append(&&hash.0[..]);
            }
            NodeRef::Inline(node) => {
                if node.rlp_long() {
                    stream.append(&&node.compute_hash().0[..]);
                } else {
                    stream.append_raw(node.encoded(), 1);
                }
            }
        }
    }
}

impl Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            NodeRef::Hash(hash) => write!(f, "<{hash:?}>"),
            NodeRef::Inline(node) => node.inner.fmt(f),
        }
    }
}

/// A branch fans out over the next nibble of the key. The value slot is
/// occupied when a key terminates exactly at this node.
#[derive(PartialEq, Eq, Clone)]
pub struct BranchNode {
    pub children: [Option<NodeRef>; Self::MAX_CHILDREN],
    pub value: Option<Data>,
}

impl Debug for BranchNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[Branch")?;
        for (i, c) in self.children.iter().enumerate() {
            if let Some(c) = c {
                write!(f, " ({i:x} {c:?})")?;
            }
        }
        write!(
            f,
            " v={}]",
            match &self.value {
                Some(v) => hex::encode(&**v),
                None => "nil".to_string(),
            }
        )
    }
}

impl Default for BranchNode {
    fn default() -> Self {
        Self {
            children: std::array::from_fn(|_| None),
            value: None,
        }
    }
}

impl BranchNode {
    pub const MAX_CHILDREN: usize = 16;

    /// The branch's value slot, addressed as child index 16 by the
    /// iterators.
    pub const VALUE_INDEX: usize = 16;

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }

    /// Returns the index of the only occupied child slot, if there is
    /// exactly one.
    pub fn single_child_index(&self) -> Option<u8> {
        let mut found = None;
        for (i, child) in self.children.iter().enumerate() {
            if child.is_some() {
                if found.is_some() {
                    return None;
                }
                found = Some(i as u8);
            }
        }
        found
    }

    fn encode_rlp(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(Self::MAX_CHILDREN + 1);
        for child in self.children.iter() {
            match child {
                Some(child) => child.append_to(&mut stream),
                None => {
                    stream.append_empty_data();
                }
            }
        }
        match &self.value {
            Some(value) => stream.append(&value.0),
            None => stream.append_empty_data(),
        };
        stream.out().into()
    }
}

/// An extension prepends a shared nibble run to a single child, which is
/// always a branch (or the hash of one); trie normalization forbids
/// extension-of-extension and extension-of-leaf shapes.
#[derive(PartialEq, Eq, Clone)]
pub struct ExtNode {
    pub path: PartialPath,
    pub child: NodeRef,
}

impl Debug for ExtNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[Extension {:?} {:?}]", self.path, self.child)
    }
}

impl ExtNode {
    fn encode_rlp(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(2);
        stream.append(&self.path.encode(false));
        self.child.append_to(&mut stream);
        stream.out().into()
    }
}

/// A leaf carries the remaining nibble suffix of its key and the value.
#[derive(PartialEq, Eq, Clone)]
pub struct LeafNode {
    pub path: PartialPath,
    pub value: Data,
}

impl Debug for LeafNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[Leaf {:?} {}]", self.path, hex::encode(&*self.value))
    }
}

impl LeafNode {
    fn encode_rlp(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(2);
        stream.append(&self.path.encode(true));
        stream.append(&self.value.0);
        stream.out().into()
    }
}

#[derive(PartialEq, Eq, Clone, Debug, EnumAsInner)]
pub enum NodeType {
    Branch(Box<BranchNode>),
    Leaf(LeafNode),
    Extension(ExtNode),
}

impl NodeType {
    fn encode_rlp(&self) -> Vec<u8> {
        match self {
            NodeType::Branch(n) => n.encode_rlp(),
            NodeType::Leaf(n) => n.encode_rlp(),
            NodeType::Extension(n) => n.encode_rlp(),
        }
    }

    /// Decodes a canonical node serialization, dispatching on the list
    /// arity and the compact-path leaf flag.
    pub(crate) fn decode(rlp: &Rlp<'_>) -> Result<NodeType, MerkleError> {
        match rlp.item_count()? {
            2 => {
                let (path, terminal) = PartialPath::decode(rlp.at(0)?.data()?)
                    .ok_or(DecoderError::Custom("invalid compact path header"))?;
                if terminal {
                    Ok(NodeType::Leaf(LeafNode {
                        path,
                        value: Data(rlp.at(1)?.data()?.to_vec()),
                    }))
                } else {
                    let child = decode_child(&rlp.at(1)?)?.ok_or(
                        MerkleError::InvariantViolation("extension with an empty child"),
                    )?;
                    Ok(NodeType::Extension(ExtNode { path, child }))
                }
            }
            17 => {
                let mut children: [Option<NodeRef>; BranchNode::MAX_CHILDREN] =
                    std::array::from_fn(|_| None);
                for (i, slot) in children.iter_mut().enumerate() {
                    *slot = decode_child(&rlp.at(i)?)?;
                }
                let value = match rlp.at(BranchNode::VALUE_INDEX)?.data()? {
                    [] => None,
                    data => Some(Data(data.to_vec())),
                };
                let branch = BranchNode { children, value };
                if branch.child_count() == 0 && branch.value.is_none() {
                    return Err(MerkleError::InvariantViolation(
                        "branch with no children and no value",
                    ));
                }
                Ok(NodeType::Branch(Box::new(branch)))
            }
            _ => Err(DecoderError::Custom("invalid node list arity").into()),
        }
    }
}

fn decode_child(item: &Rlp<'_>) -> Result<Option<NodeRef>, MerkleError> {
    if item.is_list() {
        // an embedded inline node
        let inner = NodeType::decode(item)?;
        return Ok(Some(NodeRef::Inline(Rc::new(Node::new_clean(inner)))));
    }
    let data = item.data()?;
    match data.len() {
        0 => Ok(None),
        TRIE_HASH_LEN => Ok(Some(NodeRef::Hash(
            TrieHash::try_from(data).map_err(|_| DecoderError::Custom("bad hash reference"))?,
        ))),
        _ => Err(DecoderError::Custom("invalid child reference length").into()),
    }
}

/// An in-memory trie node. The canonical serialization and the subtree
/// hash are computed lazily and memoized; `dirty` tracks whether the node
/// has been registered with the database since it was last mutated. Nodes
/// are immutable once built, so mutations stage replacement instances and
/// unchanged subtrees keep their memoized state.
pub struct Node {
    hash: OnceCell<TrieHash>,
    encoded: OnceCell<Vec<u8>>,
    dirty: Cell<bool>,
    inner: NodeType,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for Node {}

impl Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        self.inner.fmt(f)
    }
}

impl Node {
    /// A freshly built, not-yet-hashed node.
    pub(crate) fn new(inner: NodeType) -> Self {
        Self {
            hash: OnceCell::new(),
            encoded: OnceCell::new(),
            dirty: Cell::new(true),
            inner,
        }
    }

    /// A node rebuilt from its stored form; clean until mutated around.
    pub(crate) fn new_clean(inner: NodeType) -> Self {
        Self {
            hash: OnceCell::new(),
            encoded: OnceCell::new(),
            dirty: Cell::new(false),
            inner,
        }
    }

    /// Decodes a blob fetched from the database. The blob is retained as
    /// the memoized encoding and `hash`, when known from the fetch key,
    /// pre-fills the hash cache.
    pub(crate) fn from_blob(blob: &[u8], hash: Option<TrieHash>) -> Result<Self, MerkleError> {
        let inner = NodeType::decode(&Rlp::new(blob))?;
        let node = Self::new_clean(inner);
        let _ = node.encoded.set(blob.to_vec());
        if let Some(hash) = hash {
            let _ = node.hash.set(hash);
        }
        Ok(node)
    }

    pub fn inner(&self) -> &NodeType {
        &self.inner
    }

    /// The canonical RLP serialization of this node, with hash references
    /// for children whose own encodings reach 32 bytes.
    pub(crate) fn encoded(&self) -> &[u8] {
        self.encoded.get_or_init(|| self.inner.encode_rlp())
    }

    /// Whether this node serializes to 32 bytes or more and therefore
    /// lives in the database under its hash rather than inline.
    pub(crate) fn rlp_long(&self) -> bool {
        self.encoded().len() >= TRIE_HASH_LEN
    }

    /// Computes (and memoizes) the Keccak-256 of the canonical encoding.
    /// Only materialized nodes and forced roots should reach this.
    pub(crate) fn compute_hash(&self) -> &TrieHash {
        self.hash.get_or_init(|| keccak256(self.encoded()))
    }

    /// The memoized subtree hash, if one has been computed. Inline nodes
    /// have none.
    pub fn cached_hash(&self) -> Option<TrieHash> {
        self.hash.get().copied()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub(crate) fn set_clean(&self) {
        self.dirty.set(false);
    }

    /// Hashes of every child this node references by hash, plus inline
    /// children that have been materialized. Inline children below the
    /// hash threshold cannot themselves hold references (a reference alone
    /// would push them over it), so only direct children are inspected.
    pub(crate) fn child_hashes(&self) -> Vec<TrieHash> {
        let mut out = Vec::new();
        {
            let mut push = |r: &NodeRef| match r {
                NodeRef::Hash(hash) => out.push(*hash),
                NodeRef::Inline(node) => {
                    if let Some(hash) = node.cached_hash() {
                        out.push(hash);
                    }
                }
            };
            match &self.inner {
                NodeType::Branch(n) => n.children.iter().flatten().for_each(&mut push),
                NodeType::Extension(n) => push(&n.child),
                NodeType::Leaf(_) => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn leaf(path: &[u8], value: &[u8]) -> Node {
        Node::new(NodeType::Leaf(LeafNode {
            path: PartialPath(path.to_vec()),
            value: Data(value.to_vec()),
        }))
    }

    #[test]
    fn leaf_reference_encoding() {
        // "dog" -> "puppy": two-item list of the compact path and the value
        let node = leaf(&[0x6, 0x4, 0x6, 0xf, 0x6, 0x7], b"puppy");
        assert_eq!(node.encoded(), hex!("cb8420646f67857075707079").as_slice());
    }

    #[test]
    fn short_nodes_stay_inline() {
        let node = leaf(&[0x1], b"v");
        assert!(!node.rlp_long());
        assert!(node.cached_hash().is_none());
    }

    #[test]
    fn long_nodes_materialize() {
        let node = leaf(&[0x1, 0x2, 0x3], &[0xaa; 40]);
        assert!(node.rlp_long());
        assert_eq!(*node.compute_hash(), keccak256(node.encoded()));
    }

    #[test]
    fn decode_dispatch() {
        let node = leaf(&[0x6, 0x4], b"x");
        let decoded = Node::from_blob(node.encoded(), None).unwrap();
        assert!(decoded.inner().is_leaf());

        let ext = Node::new(NodeType::Extension(ExtNode {
            path: PartialPath(vec![0x6, 0x4]),
            child: NodeRef::Hash(keccak256(b"child")),
        }));
        let decoded = Node::from_blob(ext.encoded(), None).unwrap();
        assert!(decoded.inner().is_extension());
        assert_eq!(decoded.encoded(), ext.encoded());

        let mut branch = BranchNode::default();
        branch.children[3] = Some(NodeRef::Hash(keccak256(b"child")));
        branch.value = Some(Data(b"v".to_vec()));
        let branch = Node::new(NodeType::Branch(Box::new(branch)));
        let decoded = Node::from_blob(branch.encoded(), None).unwrap();
        assert!(decoded.inner().is_branch());
        assert_eq!(decoded.encoded(), branch.encoded());
    }

    #[test]
    fn inline_children_embed_raw() {
        let mut branch = BranchNode::default();
        branch.children[0] = Some(NodeRef::Inline(Rc::new(leaf(&[0x2], b"v"))));
        branch.children[7] = Some(NodeRef::Inline(Rc::new(leaf(&[0x9], &[0xbb; 64]))));
        let node = Node::new(NodeType::Branch(Box::new(branch)));

        let decoded = Node::from_blob(node.encoded(), None).unwrap();
        let decoded_branch = decoded.inner().as_branch().unwrap();
        // the short child comes back inline, the long one as its hash
        assert!(matches!(
            decoded_branch.children[0],
            Some(NodeRef::Inline(_))
        ));
        assert!(matches!(decoded_branch.children[7], Some(NodeRef::Hash(_))));
        assert_eq!(decoded.encoded(), node.encoded());
    }

    #[test]
    fn corrupt_blobs_rejected() {
        assert!(Node::from_blob(&hex!("c3010203"), None).is_err());
        // branch with neither children nor value
        let empty = Node::new(NodeType::Branch(Box::default()));
        assert!(matches!(
            Node::from_blob(empty.encoded(), None),
            Err(MerkleError::InvariantViolation(_))
        ));
        // extension whose child reference has a bogus length
        assert!(Node::from_blob(&hex!("c9820064854141414141"), None).is_err());
    }

    #[test]
    fn from_blob_keeps_fetched_state() {
        let node = leaf(&[0x1, 0x2, 0x3], &[0xcc; 40]);
        let hash = *node.compute_hash();
        let decoded = Node::from_blob(node.encoded(), Some(hash)).unwrap();
        assert_eq!(decoded.cached_hash(), Some(hash));
        assert!(!decoded.is_dirty());
    }
}
