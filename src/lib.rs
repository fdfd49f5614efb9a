//! Merkle-trie based synchronization core for a peer-to-peer message hub.
//!
//! A hub replicates an append-mostly corpus of signed user messages across
//! untrusted nodes. Every message is keyed by a time-ordered 40-byte
//! [`SyncId`] and mirrored into an in-memory [`MerkleTrie`]: a path-compressed
//! radix trie that keeps a [BLAKE3-160](Digest) digest and an item count at
//! every node, so two hubs can test entire subtrees for equality with a
//! single hash comparison.
//!
//! The [`SyncEngine`] drives reconciliation. It hydrates the trie from the
//! local [store](store::HubStore) at startup, tracks the store's merge,
//! prune and revoke events, and on demand compares compact
//! [snapshots](trie::TrieSnapshot) with a remote peer. When the snapshots
//! disagree it walks down to the shortest diverging prefix, fetches only the
//! SyncIds below it, and merges the missing messages in timestamp order,
//! recovering foreign-user dependencies (unknown fid, unknown signer) on the
//! fly.
//!
//! Peers are reached through the [`SyncPeer`] trait. The [`net`] module
//! provides both halves of a framed wire protocol over any
//! `AsyncRead + AsyncWrite` byte stream: [`serve_connection`](net::serve_connection)
//! exposes a hub to remote peers and [`HubClient`](net::HubClient) implements
//! [`SyncPeer`] on top of such a stream.
//!
//! The trie is a pure in-memory projection of the message store. It is not
//! persisted and is rebuilt on startup.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

mod digest;
mod error;
mod sync_id;

pub mod engine;
pub mod message;
pub mod net;
pub mod peer;
pub mod store;
pub mod trie;

pub use self::digest::Digest;
pub use self::engine::SyncEngine;
pub use self::error::{ErrorCode, HubError, StatusCode};
pub use self::message::{IdRegistryEvent, Message, MessageKind, NameRegistryEvent};
pub use self::peer::SyncPeer;
pub use self::sync_id::{SyncId, PRIMARY_KEY_LENGTH, SYNC_ID_LENGTH, TIMESTAMP_LENGTH};
pub use self::trie::MerkleTrie;
