//! Framing for the hub wire protocol: a big-endian `u32` length prefix
//! followed by a postcard-encoded frame.

use std::io;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame. A full 50-id message batch stays far below
/// this; anything larger is a broken or hostile peer.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec for one direction of the protocol, generic over the frame type.
#[derive(Debug)]
pub(crate) struct WireCodec<T> {
    _marker: PhantomData<T>,
}

impl<T> Default for WireCodec<T> {
    fn default() -> Self {
        WireCodec {
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for WireCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let bytes: [u8; 4] = src[..4].try_into().expect("checked length");
        let frame_len = u32::from_be_bytes(bytes) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("received frame that is too large: {frame_len}"),
            ));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }
        let frame = postcard::from_bytes(&src[4..4 + frame_len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        src.advance(4 + frame_len);
        Ok(Some(frame))
    }
}

impl<T: Serialize> Encoder<T> for WireCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes =
            postcard::to_stdvec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("attempted to send frame that is too large: {}", bytes.len()),
            ));
        }
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::SinkExt;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::net::Request;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, WireCodec::<Request>::default());
        let mut reader = FramedRead::new(server, WireCodec::<Request>::default());

        writer
            .send(Request::SyncIdsByPrefix {
                prefix: b"16651823".to_vec(),
            })
            .await
            .unwrap();
        writer.send(Request::Info).await.unwrap();

        let first = reader.next().await.unwrap().unwrap();
        assert!(matches!(first, Request::SyncIdsByPrefix { prefix } if prefix == b"16651823"));
        let second = reader.next().await.unwrap().unwrap();
        assert!(matches!(second, Request::Info));
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FramedRead::new(server, WireCodec::<Request>::default());

        // hand-craft a frame header claiming an absurd length
        use tokio::io::AsyncWriteExt;
        let mut client = client;
        client.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
