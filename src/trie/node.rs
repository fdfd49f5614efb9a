//! A single node of the merkle radix trie.

use std::collections::BTreeMap;

use crate::digest::{Digest, DIGEST_LENGTH};
use crate::error::HubError;
use crate::sync_id::{SyncId, TIMESTAMP_LENGTH};
use crate::trie::TrieSnapshot;

/// One node of the path-compressed radix trie.
///
/// Children are kept in a `BTreeMap` so iteration is always in ascending byte
/// order; the subtree hash is defined over that order. Above depth
/// [`TIMESTAMP_LENGTH`] the trie is a plain per-byte radix tree; below it a
/// node holding a single key stores it inline as a leaf instead of growing a
/// chain of single-child nodes.
///
/// The shape and hash of a trie are a pure function of the set of stored
/// keys: inserting and then deleting a key leaves a trie identical to one
/// that never saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrieNode {
    hash: Digest,
    items: usize,
    children: BTreeMap<u8, TrieNode>,
    key: Option<SyncId>,
}

impl Default for TrieNode {
    fn default() -> Self {
        TrieNode {
            hash: Digest::EMPTY,
            items: 0,
            children: BTreeMap::new(),
            key: None,
        }
    }
}

impl TrieNode {
    /// A node with no children. Only leaves carry a value.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of keys stored in this subtree.
    pub fn items(&self) -> usize {
        self.items
    }

    /// Digest of this subtree.
    pub fn hash(&self) -> Digest {
        self.hash
    }

    /// The stored key, present only on leaves that carry a value.
    pub fn value(&self) -> Option<&SyncId> {
        self.key.as_ref()
    }

    /// Child nodes in ascending byte order.
    pub fn children(&self) -> impl Iterator<Item = (u8, &TrieNode)> {
        self.children.iter().map(|(byte, node)| (*byte, node))
    }

    /// Insert `id` into the subtree rooted here. Returns true iff the key was
    /// not present before. Keys are copied into the node, never aliased.
    pub fn insert(&mut self, id: &SyncId, current_index: usize) -> Result<bool, HubError> {
        let key = id.as_bytes();
        if current_index >= key.len() {
            return Err(HubError::invalid_param("sync id exhausted during trie insert"));
        }
        if current_index >= TIMESTAMP_LENGTH && self.is_leaf() {
            match &self.key {
                None => {
                    self.key = Some(*id);
                    self.items = 1;
                    self.update_hash();
                    return Ok(true);
                }
                Some(existing) if existing == id => return Ok(false),
                Some(_) => self.split_leaf(current_index)?,
            }
        }
        let child = self.children.entry(key[current_index]).or_default();
        if child.insert(id, current_index + 1)? {
            self.items += 1;
            self.update_hash();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Delete `id` from the subtree rooted here. Returns true iff it was
    /// present. Empty children are unlinked and, below the timestamp prefix,
    /// a lone keyed leaf is re-absorbed so the trie stays canonical.
    pub fn delete(&mut self, id: &SyncId, current_index: usize) -> Result<bool, HubError> {
        if self.is_leaf() {
            if self.key.as_ref() == Some(id) {
                self.key = None;
                self.items = 0;
                self.update_hash();
                return Ok(true);
            }
            return Ok(false);
        }
        let key = id.as_bytes();
        if current_index >= key.len() {
            return Err(HubError::invalid_param("sync id exhausted during trie delete"));
        }
        let byte = key[current_index];
        let Some(child) = self.children.get_mut(&byte) else {
            return Ok(false);
        };
        if !child.delete(id, current_index + 1)? {
            return Ok(false);
        }
        self.items -= 1;
        if child.items == 0 {
            self.children.remove(&byte);
        }
        if current_index >= TIMESTAMP_LENGTH && self.children.len() == 1 {
            let absorb = self
                .children
                .iter()
                .next()
                .filter(|(_, node)| node.is_leaf() && node.key.is_some())
                .map(|(byte, _)| *byte);
            if let Some(byte) = absorb {
                if let Some(lone) = self.children.remove(&byte) {
                    self.key = lone.key;
                }
            }
        }
        self.update_hash();
        Ok(true)
    }

    /// Non-mutating mirror of [`TrieNode::insert`]'s traversal.
    pub fn exists(&self, id: &SyncId, current_index: usize) -> Result<bool, HubError> {
        if self.is_leaf() {
            return Ok(self.key.as_ref() == Some(id));
        }
        let key = id.as_bytes();
        if current_index >= key.len() {
            return Err(HubError::invalid_param("sync id exhausted during trie lookup"));
        }
        match self.children.get(&key[current_index]) {
            None => Ok(false),
            Some(child) => child.exists(id, current_index + 1),
        }
    }

    /// Walk `prefix` and certify everything *outside* it: at every level the
    /// digest over the non-selected children, plus their total item count.
    /// If the trie ends before the prefix does, the returned snapshot covers
    /// the path actually walked.
    pub fn get_snapshot(&self, prefix: &[u8], current_index: usize) -> TrieSnapshot {
        if current_index == prefix.len() {
            return TrieSnapshot {
                prefix: prefix.to_vec(),
                excluded_hashes: Vec::new(),
                num_messages: 0,
            };
        }
        let byte = prefix[current_index];
        let (excluded_hash, excluded_items) = self.excluded_hash(byte);
        match self.children.get(&byte) {
            None => TrieSnapshot {
                prefix: prefix[..=current_index].to_vec(),
                excluded_hashes: vec![excluded_hash],
                num_messages: excluded_items as u64,
            },
            Some(child) => {
                let inner = child.get_snapshot(prefix, current_index + 1);
                let mut excluded_hashes = Vec::with_capacity(1 + inner.excluded_hashes.len());
                excluded_hashes.push(excluded_hash);
                excluded_hashes.extend(inner.excluded_hashes);
                TrieSnapshot {
                    prefix: inner.prefix,
                    excluded_hashes,
                    num_messages: excluded_items as u64 + inner.num_messages,
                }
            }
        }
    }

    /// The node at exactly `prefix`, if the trie extends that far.
    pub fn get_node(&self, prefix: &[u8]) -> Option<&TrieNode> {
        match prefix.split_first() {
            None => Some(self),
            Some((byte, rest)) => self.children.get(byte)?.get_node(rest),
        }
    }

    /// All keys below this node, in trie (= lexicographic = time) order.
    pub fn get_all_values(&self) -> Vec<SyncId> {
        if self.is_leaf() {
            return self.key.iter().copied().collect();
        }
        let mut values = Vec::with_capacity(self.items);
        for child in self.children.values() {
            values.extend(child.get_all_values());
        }
        values
    }

    /// Recompute every hash in the subtree bottom-up. Only needed after a
    /// bulk load that bypassed the incremental path.
    pub fn recalculate_hash(&mut self) -> Digest {
        if !self.is_leaf() {
            let mut buf = Vec::with_capacity(self.children.len() * DIGEST_LENGTH);
            for child in self.children.values_mut() {
                let digest = child.recalculate_hash();
                buf.extend_from_slice(digest.as_bytes());
            }
            self.hash = Digest::new(&buf);
        } else {
            self.update_hash();
        }
        self.hash
    }

    /// Digest and item count over every child except the one at `byte`, in
    /// ascending byte order. No excluded children digests the empty string.
    fn excluded_hash(&self, byte: u8) -> (String, usize) {
        let mut buf = Vec::with_capacity(self.children.len() * DIGEST_LENGTH);
        let mut items = 0;
        for (child_byte, child) in &self.children {
            if *child_byte != byte {
                buf.extend_from_slice(child.hash.as_bytes());
                items += child.items;
            }
        }
        (Digest::new(&buf).to_hex(), items)
    }

    /// Promote a compressed leaf to an internal node, pushing its resident
    /// key one level down so a new key can branch here.
    fn split_leaf(&mut self, current_index: usize) -> Result<(), HubError> {
        let resident = self
            .key
            .take()
            .ok_or_else(|| HubError::invalid_param("split on a leaf without a key"))?;
        let byte = resident.as_bytes()[current_index];
        self.children
            .entry(byte)
            .or_default()
            .insert(&resident, current_index + 1)?;
        self.update_hash();
        Ok(())
    }

    fn update_hash(&mut self) {
        if self.is_leaf() {
            self.hash = match &self.key {
                Some(key) => Digest::new(key),
                None => Digest::EMPTY,
            };
        } else {
            let mut buf = Vec::with_capacity(self.children.len() * DIGEST_LENGTH);
            for child in self.children.values() {
                buf.extend_from_slice(child.hash.as_bytes());
            }
            self.hash = Digest::new(&buf);
        }
    }
}
