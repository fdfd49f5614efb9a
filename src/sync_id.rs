//! The 40-byte sync key deriving trie position and store key from a message.
//!
//! A [`SyncId`] concatenates:
//!
//! ```text
//! [ timestamp, 10 ASCII digits | family(1) | fid(8, BE) | set postfix(1) | hash(20) ]
//! ```
//!
//! The ASCII timestamp prefix makes SyncIds sort lexicographically by time,
//! which the merkle trie exploits for prefix traversal. The remaining bytes
//! carry everything needed to rebuild the store's fid-partitioned primary key
//! without an auxiliary index: [`SyncId::to_primary_key`] re-expands the ten
//! digits back into the 4-byte big-endian timestamp and splices it between
//! the set postfix and the hash. The duplication costs ten bytes per key and
//! buys O(1) translation from trie order to store order.

use std::fmt;

use serde::{
    de::{self, SeqAccess},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::digest::DIGEST_LENGTH;
use crate::error::HubError;
use crate::message::Message;

/// Length of the ASCII timestamp prefix, and the trie depth above which no
/// path compression happens.
pub const TIMESTAMP_LENGTH: usize = 10;

/// Total length of a [`SyncId`] in bytes.
pub const SYNC_ID_LENGTH: usize = TIMESTAMP_LENGTH + 1 + 8 + 1 + DIGEST_LENGTH;

/// Length of the store primary key emitted by [`SyncId::to_primary_key`].
pub const PRIMARY_KEY_LENGTH: usize = 1 + 8 + 1 + 4 + DIGEST_LENGTH;

/// Store-family prefix identifying user messages in the store keyspace.
pub const MESSAGE_FAMILY: u8 = 1;

const FAMILY_OFFSET: usize = TIMESTAMP_LENGTH;
const FID_OFFSET: usize = FAMILY_OFFSET + 1;
const POSTFIX_OFFSET: usize = FID_OFFSET + 8;
const HASH_OFFSET: usize = POSTFIX_OFFSET + 1;

/// Time-prefixed key uniquely naming a message in the sync trie.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncId([u8; SYNC_ID_LENGTH]);

impl SyncId {
    /// Derive the sync id of a message. Total: every message has one.
    pub fn from_message(message: &Message) -> Self {
        let mut bytes = [0u8; SYNC_ID_LENGTH];
        bytes[..TIMESTAMP_LENGTH].copy_from_slice(&timestamp_to_prefix(message.timestamp));
        bytes[FAMILY_OFFSET] = MESSAGE_FAMILY;
        bytes[FID_OFFSET..POSTFIX_OFFSET].copy_from_slice(&message.fid.to_be_bytes());
        bytes[POSTFIX_OFFSET] = message.kind.set_postfix();
        bytes[HASH_OFFSET..].copy_from_slice(message.hash.as_bytes());
        SyncId(bytes)
    }

    /// Parse a sync id received from a peer, validating length and the
    /// decimal timestamp prefix.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, HubError> {
        let bytes = bytes.as_ref();
        if bytes.len() != SYNC_ID_LENGTH {
            return Err(HubError::invalid_param(format!(
                "sync id must be {SYNC_ID_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        let mut timestamp = 0u64;
        for &b in &bytes[..TIMESTAMP_LENGTH] {
            if !b.is_ascii_digit() {
                return Err(HubError::new(
                    crate::error::ErrorCode::BadRequestParseFailure,
                    "sync id timestamp prefix is not decimal",
                ));
            }
            timestamp = timestamp * 10 + u64::from(b - b'0');
        }
        if timestamp > u64::from(u32::MAX) {
            return Err(HubError::new(
                crate::error::ErrorCode::BadRequestParseFailure,
                "sync id timestamp out of range",
            ));
        }
        let mut id = [0u8; SYNC_ID_LENGTH];
        id.copy_from_slice(bytes);
        Ok(SyncId(id))
    }

    /// Raw bytes of the sync id.
    pub fn as_bytes(&self) -> &[u8; SYNC_ID_LENGTH] {
        &self.0
    }

    /// The message timestamp, re-parsed from the ASCII prefix.
    pub fn timestamp(&self) -> u32 {
        self.0[..TIMESTAMP_LENGTH]
            .iter()
            .fold(0u64, |acc, b| acc * 10 + u64::from(b - b'0')) as u32
    }

    /// The fid the message belongs to.
    pub fn fid(&self) -> u64 {
        let mut fid = [0u8; 8];
        fid.copy_from_slice(&self.0[FID_OFFSET..POSTFIX_OFFSET]);
        u64::from_be_bytes(fid)
    }

    /// Re-emit the primary key the store filed the message under:
    /// `[family | fid(8) | set postfix | timestamp(4) | hash(20)]`.
    pub fn to_primary_key(&self) -> [u8; PRIMARY_KEY_LENGTH] {
        let mut key = [0u8; PRIMARY_KEY_LENGTH];
        key[0] = self.0[FAMILY_OFFSET];
        key[1..9].copy_from_slice(&self.0[FID_OFFSET..POSTFIX_OFFSET]);
        key[9] = self.0[POSTFIX_OFFSET];
        key[10..14].copy_from_slice(&self.timestamp().to_be_bytes());
        key[14..].copy_from_slice(&self.0[HASH_OFFSET..]);
        key
    }
}

/// Zero-padded ten-digit ASCII rendering of a timestamp, the leading bytes of
/// every sync id and the alphabet of the trie's upper levels.
pub fn timestamp_to_prefix(timestamp: u32) -> [u8; TIMESTAMP_LENGTH] {
    let mut prefix = [b'0'; TIMESTAMP_LENGTH];
    let mut value = timestamp;
    for slot in prefix.iter_mut().rev() {
        *slot = b'0' + (value % 10) as u8;
        value /= 10;
    }
    prefix
}

impl AsRef<[u8]> for SyncId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncId({} fid={} {})",
            std::str::from_utf8(&self.0[..TIMESTAMP_LENGTH]).unwrap_or("??????????"),
            self.fid(),
            hex::encode(&self.0[HASH_OFFSET..])
        )
    }
}

impl Serialize for SyncId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.0))
        } else {
            let mut s = serializer.serialize_tuple(SYNC_ID_LENGTH)?;
            for item in &self.0 {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for SyncId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(de::Error::custom)?
        } else {
            struct Bytes40;
            impl<'de> de::Visitor<'de> for Bytes40 {
                type Value = Vec<u8>;
                fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "an array of {SYNC_ID_LENGTH} bytes")
                }
                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: SeqAccess<'de>,
                {
                    let mut bytes = Vec::with_capacity(SYNC_ID_LENGTH);
                    while let Some(byte) = seq.next_element::<u8>()? {
                        bytes.push(byte);
                    }
                    Ok(bytes)
                }
            }
            deserializer.deserialize_tuple(SYNC_ID_LENGTH, Bytes40)?
        };
        SyncId::from_bytes(bytes).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn message(fid: u64, timestamp: u32) -> Message {
        Message::new(fid, MessageKind::PostAdd, timestamp, [3u8; 32], "body")
    }

    #[test]
    fn test_layout() {
        let msg = message(0x1122, 1665182332);
        let id = SyncId::from_message(&msg);
        assert_eq!(&id.as_bytes()[..10], b"1665182332");
        assert_eq!(id.as_bytes()[10], MESSAGE_FAMILY);
        assert_eq!(&id.as_bytes()[11..19], &0x1122u64.to_be_bytes());
        assert_eq!(id.as_bytes()[19], MessageKind::PostAdd.set_postfix());
        assert_eq!(&id.as_bytes()[20..], msg.hash.as_bytes());
        assert_eq!(id.timestamp(), 1665182332);
        assert_eq!(id.fid(), 0x1122);
    }

    #[test]
    fn test_zero_padding() {
        let id = SyncId::from_message(&message(1, 42));
        assert_eq!(&id.as_bytes()[..10], b"0000000042");
        assert_eq!(id.timestamp(), 42);
    }

    #[test]
    fn test_primary_key_round_trip() {
        for (fid, ts) in [(1u64, 0u32), (0xdead_beef, 1665182332), (u64::MAX, u32::MAX)] {
            let msg = message(fid, ts);
            let id = SyncId::from_message(&msg);
            assert_eq!(id.to_primary_key(), msg.primary_key());
        }
    }

    #[test]
    fn test_sorts_by_timestamp_first() {
        let early = SyncId::from_message(&message(u64::MAX, 1665182332));
        let late = SyncId::from_message(&message(0, 1665182343));
        assert!(early < late);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(SyncId::from_bytes([0u8; 12]).is_err());
        // right length, non-decimal prefix
        assert!(SyncId::from_bytes([b'x'; SYNC_ID_LENGTH]).is_err());
        // "9999999999" exceeds u32
        let mut bytes = [b'9'; SYNC_ID_LENGTH];
        bytes[TIMESTAMP_LENGTH..].fill(0);
        assert!(SyncId::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let id = SyncId::from_message(&message(77, 1665182345));
        let encoded = postcard::to_stdvec(&id).unwrap();
        assert_eq!(encoded.len(), SYNC_ID_LENGTH);
        let decoded: SyncId = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(id, decoded);
    }
}
