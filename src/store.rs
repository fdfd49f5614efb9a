//! Abstraction over the hub's local message store.
//!
//! The sync core does not own message persistence or validation; it consumes
//! the [`HubStore`] capability and mirrors the store's event stream into the
//! trie. [`memory::MemStore`] is the reference implementation.

use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::message::{IdRegistryEvent, Message, NameRegistryEvent};
use crate::sync_id::SyncId;

pub mod memory;

/// An event emitted by the store after a state change commits.
///
/// The engine inserts into the trie on merges and deletes on prunes and
/// revokes. Deletions are applied eagerly: a racy extra delete is repaired by
/// the next sync round, while a missed one would leave the trie permanently
/// diverged from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    /// A message was merged; `deleted` lists messages it displaced.
    MergeMessage {
        /// The merged message.
        message: Message,
        /// Messages removed from their sets as a consequence.
        deleted: Vec<Message>,
    },
    /// A message was evicted to enforce storage limits.
    PruneMessage {
        /// The pruned message.
        message: Message,
    },
    /// A message was dropped because its signer was revoked.
    RevokeMessage {
        /// The revoked message.
        message: Message,
    },
    /// An id registry event was merged.
    MergeIdRegistryEvent {
        /// The merged registry event.
        event: IdRegistryEvent,
    },
    /// A name registry event was merged.
    MergeNameRegistryEvent {
        /// The merged registry event.
        event: NameRegistryEvent,
    },
}

impl StoreEvent {
    /// The filterable type of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            StoreEvent::MergeMessage { .. } => EventType::MergeMessage,
            StoreEvent::PruneMessage { .. } => EventType::PruneMessage,
            StoreEvent::RevokeMessage { .. } => EventType::RevokeMessage,
            StoreEvent::MergeIdRegistryEvent { .. } => EventType::MergeIdRegistryEvent,
            StoreEvent::MergeNameRegistryEvent { .. } => EventType::MergeNameRegistryEvent,
        }
    }
}

/// Filter for [`StoreEvent`]s, used by the wire surface's subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Message merges.
    MergeMessage,
    /// Message prunes.
    PruneMessage,
    /// Message revocations.
    RevokeMessage,
    /// Id registry event merges.
    MergeIdRegistryEvent,
    /// Name registry event merges.
    MergeNameRegistryEvent,
}

/// Local capability the sync core requires of the hub's message store.
///
/// Handles are cheap clones of shared state; implementations hand out
/// `Arc`ed instances.
pub trait HubStore: Clone + Send + Sync + 'static {
    /// Iterate every stored message. Used once at startup to hydrate the
    /// trie.
    fn for_each_message<F>(&self, f: F) -> Result<(), HubError>
    where
        F: FnMut(&Message) -> Result<(), HubError>;

    /// Validate and merge a single message.
    fn merge_message(&self, message: Message) -> Result<(), HubError>;

    /// Merge a batch, returning one result per message in order.
    fn merge_messages(&self, messages: Vec<Message>) -> Vec<Result<(), HubError>> {
        messages.into_iter().map(|m| self.merge_message(m)).collect()
    }

    /// Merge an id registry event. Later block numbers supersede earlier
    /// ones.
    fn merge_id_registry_event(&self, event: IdRegistryEvent) -> Result<(), HubError>;

    /// Merge a name registry event. Later block numbers supersede earlier
    /// ones.
    fn merge_name_registry_event(&self, event: NameRegistryEvent) -> Result<(), HubError>;

    /// Look up messages by sync id. Unknown ids are skipped, not errors.
    fn get_messages_by_sync_ids(&self, ids: &[SyncId]) -> Result<Vec<Message>, HubError>;

    /// The registry event for a fid, or `not_found`.
    fn get_id_registry_event(&self, fid: u64) -> Result<IdRegistryEvent, HubError>;

    /// All signer add/remove messages for a fid, in timestamp order.
    fn get_signer_messages_by_fid(&self, fid: u64) -> Result<Vec<Message>, HubError>;

    /// Subscribe to the store's event stream. Events arrive in commit order;
    /// the subscription ends when the receiver is dropped.
    fn subscribe(&self) -> flume::Receiver<StoreEvent>;
}
