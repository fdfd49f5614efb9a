//! Merkle radix trie over [`SyncId`]s.
//!
//! The trie keeps a [`Digest`](crate::Digest) and an item count at every node, so equality
//! of two subtrees is testable with a single hash comparison and "everything
//! outside this prefix" compresses into a [`TrieSnapshot`]. It is rebuilt
//! from the message store at startup and never persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::sync_id::SyncId;

mod node;

use self::node::TrieNode;

/// A compact certificate of everything a trie contains outside a prefix.
///
/// `excluded_hashes[i]` is the digest (lowercase hex) over all children at
/// level `i` of the walk other than the one the prefix selects, and
/// `num_messages` the total item count excluded along the way. If the trie
/// ends before the requested prefix does, `prefix` is the portion actually
/// walked; callers must treat it as authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrieSnapshot {
    /// The path walked.
    pub prefix: Vec<u8>,
    /// Per-level digests of the non-selected siblings.
    pub excluded_hashes: Vec<String>,
    /// Total number of messages excluded along the walk.
    pub num_messages: u64,
}

/// One level of trie structure, as served to peers: a node plus its direct
/// children. Child entries have empty `children` maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Path of this node from the root.
    pub prefix: Vec<u8>,
    /// Number of messages in the subtree.
    pub num_messages: u64,
    /// Subtree digest, lowercase hex.
    pub hash: String,
    /// Direct children by branch byte.
    pub children: BTreeMap<u8, NodeMetadata>,
}

/// The merkle radix trie. Owns the root node and exposes the operations the
/// sync engine and the wire surface need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleTrie {
    root: TrieNode,
}

impl MerkleTrie {
    /// An empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a sync id. Returns true iff it was not present before.
    pub fn insert(&mut self, id: &SyncId) -> Result<bool, HubError> {
        self.root.insert(id, 0)
    }

    /// Delete a sync id. Returns true iff it was present.
    pub fn delete(&mut self, id: &SyncId) -> Result<bool, HubError> {
        self.root.delete(id, 0)
    }

    /// Whether a sync id is present.
    pub fn exists(&self, id: &SyncId) -> Result<bool, HubError> {
        self.root.exists(id, 0)
    }

    /// Total number of sync ids stored.
    pub fn items(&self) -> usize {
        self.root.items()
    }

    /// Root digest as lowercase hex, or the empty string for an empty trie.
    pub fn root_hash(&self) -> String {
        if self.root.items() == 0 {
            String::new()
        } else {
            self.root.hash().to_hex()
        }
    }

    /// Snapshot of everything outside `prefix`. See [`TrieSnapshot`].
    pub fn get_snapshot(&self, prefix: &[u8]) -> TrieSnapshot {
        self.root.get_snapshot(prefix, 0)
    }

    /// The node at `prefix` with one level of children, for RPC
    /// serialization. `None` if the trie does not extend to `prefix`.
    pub fn get_node_metadata(&self, prefix: &[u8]) -> Option<NodeMetadata> {
        let node = self.root.get_node(prefix)?;
        let mut children = BTreeMap::new();
        for (byte, child) in node.children() {
            let mut child_prefix = Vec::with_capacity(prefix.len() + 1);
            child_prefix.extend_from_slice(prefix);
            child_prefix.push(byte);
            children.insert(
                byte,
                NodeMetadata {
                    prefix: child_prefix,
                    num_messages: child.items() as u64,
                    hash: child.hash().to_hex(),
                    children: BTreeMap::new(),
                },
            );
        }
        Some(NodeMetadata {
            prefix: prefix.to_vec(),
            num_messages: node.items() as u64,
            hash: node.hash().to_hex(),
            children,
        })
    }

    /// All sync ids under `prefix`, in trie (= time) order.
    pub fn get_all_values(&self, prefix: &[u8]) -> Vec<SyncId> {
        match self.root.get_node(prefix) {
            Some(node) => node.get_all_values(),
            None => Vec::new(),
        }
    }

    /// The shortest prefix at which this trie and a peer's snapshot disagree.
    ///
    /// Walks the local excluded hashes for `prefix` against the peer's,
    /// returning `prefix` truncated to the first index where they differ. If
    /// every compared level matches, the shorter of the two walks wins. An
    /// empty peer list yields an empty prefix.
    pub fn get_divergence_prefix(&self, prefix: &[u8], their_excluded: &[String]) -> Vec<u8> {
        let ours = self.get_snapshot(prefix).excluded_hashes;
        for (i, hash) in ours.iter().enumerate() {
            if their_excluded.get(i) != Some(hash) {
                return prefix[..i].to_vec();
            }
        }
        prefix[..ours.len().min(prefix.len())].to_vec()
    }

    /// Recompute every hash bottom-up and return the root hash. Only needed
    /// after a bulk load that bypassed the incremental path.
    pub fn recalculate_hash(&mut self) -> String {
        self.root.recalculate_hash();
        self.root_hash()
    }
}
