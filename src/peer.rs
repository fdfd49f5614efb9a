//! Remote capability of a peer hub.

use async_trait::async_trait;

use crate::error::HubError;
use crate::message::{IdRegistryEvent, Message};
use crate::sync_id::SyncId;
use crate::trie::NodeMetadata;

/// The five remote calls the sync engine needs from a peer.
///
/// [`HubClient`](crate::net::HubClient) implements this over a byte stream;
/// tests implement it in-process. Every call is fallible with a [`HubError`]
/// so transport failures surface as `unavailable.network_failure`.
#[async_trait]
pub trait SyncPeer: Send + Sync {
    /// The peer's trie node at `prefix`, with one level of children.
    async fn get_metadata_by_prefix(&self, prefix: &[u8]) -> Result<NodeMetadata, HubError>;

    /// All sync ids the peer holds under `prefix`.
    async fn get_sync_ids_by_prefix(&self, prefix: &[u8]) -> Result<Vec<SyncId>, HubError>;

    /// Full messages for the given sync ids. Ids the peer no longer holds
    /// are skipped.
    async fn get_messages_by_sync_ids(&self, ids: &[SyncId]) -> Result<Vec<Message>, HubError>;

    /// The id registry event binding `fid` to its custody address.
    async fn get_id_registry_event_by_fid(&self, fid: u64) -> Result<IdRegistryEvent, HubError>;

    /// All signer add/remove messages for `fid`.
    async fn get_all_signer_messages_by_fid(&self, fid: u64) -> Result<Vec<Message>, HubError>;
}
