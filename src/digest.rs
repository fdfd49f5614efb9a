//! The truncated blake3 digest used throughout the sync core.

use std::fmt;

use serde::{
    de::{self, SeqAccess},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Number of bytes in a [`Digest`].
pub(crate) const DIGEST_LENGTH: usize = 20;

/// A 160-bit digest: the first 20 bytes of a BLAKE3 hash.
///
/// Used both for message hashes and for the subtree hashes of the merkle
/// trie. On the wire and in logs it renders as 40 lowercase hex characters.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// The digest of the empty byte string.
    pub const EMPTY: Digest = Digest([
        175, 19, 73, 185, 245, 249, 161, 166, 160, 64, 77, 234, 54, 220, 201, 73, 155, 203, 37,
        201,
    ]);

    /// Hash the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        let hash = blake3::hash(buf.as_ref());
        let mut bytes = [0u8; DIGEST_LENGTH];
        bytes.copy_from_slice(&hash.as_bytes()[..DIGEST_LENGTH]);
        Digest(bytes)
    }

    /// Bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    /// Create a `Digest` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Digest(bytes)
    }

    /// Lowercase hex, 40 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(value: [u8; DIGEST_LENGTH]) -> Self {
        Digest(value)
    }
}

impl From<Digest> for [u8; DIGEST_LENGTH] {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            // Fixed-length structures, including arrays, are supported in Serde as tuples
            // See: https://serde.rs/impl-serialize.html#serializing-a-tuple
            let mut s = serializer.serialize_tuple(DIGEST_LENGTH)?;
            for item in &self.0 {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            let mut bytes = [0u8; DIGEST_LENGTH];
            hex::decode_to_slice(s.as_bytes(), &mut bytes).map_err(de::Error::custom)?;
            Ok(Digest(bytes))
        } else {
            deserializer.deserialize_tuple(DIGEST_LENGTH, DigestVisitor)
        }
    }
}

struct DigestVisitor;

impl<'de> de::Visitor<'de> for DigestVisitor {
    type Value = Digest;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of {DIGEST_LENGTH} bytes")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut bytes = [0u8; DIGEST_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Digest(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest() {
        assert_eq!(Digest::new(b""), Digest::EMPTY);
        assert_eq!(
            Digest::EMPTY.to_hex(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9"
        );
    }

    #[test]
    fn test_is_truncated_blake3() {
        let data = b"hello world";
        let full = blake3::hash(data);
        assert_eq!(Digest::new(data).as_bytes()[..], full.as_bytes()[..20]);
    }

    #[test]
    fn test_postcard_roundtrip() {
        let digest = Digest::new(b"roundtrip");
        let encoded = postcard::to_stdvec(&digest).unwrap();
        // fixed-size tuple encoding, no length prefix
        assert_eq!(encoded.len(), DIGEST_LENGTH);
        let decoded: Digest = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(digest, decoded);
    }
}
