//! Messages and registry events replicated between hubs.
//!
//! The sync core treats messages as mostly opaque: it only reads the four
//! fields a [`SyncId`](crate::SyncId) is derived from (`fid`, `kind`,
//! `timestamp`, `hash`). Payloads are application data and signature
//! validation happens before a message reaches the core.

use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::sync_id::{MESSAGE_FAMILY, PRIMARY_KEY_LENGTH};

/// The hub epoch: 2021-01-01T00:00:00Z. Message timestamps are seconds since
/// this instant, which keeps them inside a `u32` for the next few decades.
pub const HUB_EPOCH_UNIX_SECS: u64 = 1_609_459_200;

/// Seconds since the hub epoch, as of now.
pub fn now_hub_seconds() -> u32 {
    let unix = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("time drift")
        .as_secs();
    unix.saturating_sub(HUB_EPOCH_UNIX_SECS) as u32
}

/// The kind of a message. Add/remove pairs operate on the same logical set
/// and therefore share a [set postfix](MessageKind::set_postfix) in the store
/// keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Publish a post.
    PostAdd = 1,
    /// Retract a previously published post.
    PostRemove = 2,
    /// Add a reaction to a post.
    ReactionAdd = 3,
    /// Retract a reaction.
    ReactionRemove = 4,
    /// Follow a user.
    FollowAdd = 5,
    /// Retract a follow.
    FollowRemove = 6,
    /// Authorize a delegate signer key for the fid.
    SignerAdd = 7,
    /// Revoke a delegate signer key.
    SignerRemove = 8,
    /// Set a profile field.
    ProfileData = 9,
}

impl MessageKind {
    /// The one-byte set discriminator used in store keys. Adds and removes of
    /// the same set map to the same value.
    pub fn set_postfix(&self) -> u8 {
        match self {
            MessageKind::PostAdd | MessageKind::PostRemove => 1,
            MessageKind::ReactionAdd | MessageKind::ReactionRemove => 2,
            MessageKind::FollowAdd | MessageKind::FollowRemove => 3,
            MessageKind::SignerAdd | MessageKind::SignerRemove => 4,
            MessageKind::ProfileData => 5,
        }
    }

    /// True for the remove half of an add/remove pair.
    pub fn is_remove(&self) -> bool {
        matches!(
            self,
            MessageKind::PostRemove
                | MessageKind::ReactionRemove
                | MessageKind::FollowRemove
                | MessageKind::SignerRemove
        )
    }

    /// The add kind whose set this remove operates on, if any.
    pub fn removes(&self) -> Option<MessageKind> {
        match self {
            MessageKind::PostRemove => Some(MessageKind::PostAdd),
            MessageKind::ReactionRemove => Some(MessageKind::ReactionAdd),
            MessageKind::FollowRemove => Some(MessageKind::FollowAdd),
            MessageKind::SignerRemove => Some(MessageKind::SignerAdd),
            _ => None,
        }
    }
}

/// A signed user message.
///
/// `hash` is the BLAKE3-160 digest of the payload and uniquely names the
/// message; `signer` is the delegate key the message was signed with. The
/// signature itself is checked upstream and not carried here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The user the message belongs to.
    pub fid: u64,
    /// What the message does.
    pub kind: MessageKind,
    /// Seconds since the hub epoch.
    pub timestamp: u32,
    /// BLAKE3-160 of the payload.
    pub hash: Digest,
    /// The delegate key that signed the message.
    pub signer: [u8; 32],
    /// Application payload, opaque to the sync core.
    pub payload: Bytes,
}

impl Message {
    /// Assemble a message, deriving `hash` from the payload.
    pub fn new(
        fid: u64,
        kind: MessageKind,
        timestamp: u32,
        signer: [u8; 32],
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        let hash = Digest::new(&payload);
        Message {
            fid,
            kind,
            timestamp,
            hash,
            signer,
            payload,
        }
    }

    /// The key the store files this message under:
    /// `[family | fid(8) | set postfix | timestamp(4) | hash(20)]`,
    /// fid-partitioned and big-endian so per-user ranges scan in time order.
    pub fn primary_key(&self) -> [u8; PRIMARY_KEY_LENGTH] {
        let mut key = [0u8; PRIMARY_KEY_LENGTH];
        key[0] = MESSAGE_FAMILY;
        key[1..9].copy_from_slice(&self.fid.to_be_bytes());
        key[9] = self.kind.set_postfix();
        key[10..14].copy_from_slice(&self.timestamp.to_be_bytes());
        key[14..].copy_from_slice(self.hash.as_bytes());
        key
    }
}

/// An on-chain registration binding a fid to a custody address.
///
/// A hub must have merged the registry event for a fid before it will accept
/// any of that user's messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRegistryEvent {
    /// The registered fid.
    pub fid: u64,
    /// Custody address controlling the fid.
    pub custody: [u8; 20],
    /// Block the registration landed in. Later blocks supersede earlier ones.
    pub block_number: u64,
}

/// An on-chain registration binding a name to an owning address.
///
/// Names do not participate in the sync trie; the event is carried on the
/// store's event stream for subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRegistryEvent {
    /// The registered name, UTF-8.
    pub name: Vec<u8>,
    /// Address owning the name.
    pub owner: [u8; 20],
    /// Block the registration landed in. Later blocks supersede earlier ones.
    pub block_number: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_postfix_groups_adds_and_removes() {
        assert_eq!(
            MessageKind::PostAdd.set_postfix(),
            MessageKind::PostRemove.set_postfix()
        );
        assert_eq!(
            MessageKind::SignerAdd.set_postfix(),
            MessageKind::SignerRemove.set_postfix()
        );
        assert_ne!(
            MessageKind::PostAdd.set_postfix(),
            MessageKind::ReactionAdd.set_postfix()
        );
    }

    #[test]
    fn test_primary_key_layout() {
        let msg = Message::new(0x0102, MessageKind::PostAdd, 1665182332, [7u8; 32], "hi");
        let key = msg.primary_key();
        assert_eq!(key.len(), PRIMARY_KEY_LENGTH);
        assert_eq!(key[0], MESSAGE_FAMILY);
        assert_eq!(&key[1..9], &0x0102u64.to_be_bytes());
        assert_eq!(key[9], 1);
        assert_eq!(&key[10..14], &1665182332u32.to_be_bytes());
        assert_eq!(&key[14..], msg.hash.as_bytes());
    }

    #[test]
    fn test_hash_derived_from_payload() {
        let a = Message::new(1, MessageKind::PostAdd, 100, [0u8; 32], "payload");
        let b = Message::new(2, MessageKind::ReactionAdd, 200, [1u8; 32], "payload");
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash, Digest::new(b"payload"));
    }
}
