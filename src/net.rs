//! Wire surface of the hub: a framed request/response protocol over any
//! byte stream.
//!
//! [`serve_connection`] exposes a [`SyncEngine`] to a remote peer and
//! [`HubClient`] is the matching client half, implementing [`SyncPeer`] so a
//! remote hub plugs straight into [`SyncEngine::perform_sync`]. Frames are
//! postcard behind a `u32` length prefix; hashes cross as lowercase hex,
//! sync ids as raw bytes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{SinkExt, Stream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::engine::SyncEngine;
use crate::error::{ErrorCode, HubError, StatusCode};
use crate::message::{IdRegistryEvent, Message};
use crate::peer::SyncPeer;
use crate::store::{EventType, HubStore, StoreEvent};
use crate::sync_id::SyncId;
use crate::trie::NodeMetadata;

mod codec;

use self::codec::WireCodec;

/// A request frame, client to hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Hub identity and sync status.
    Info,
    /// All sync ids under a trie prefix.
    SyncIdsByPrefix {
        /// Trie prefix to enumerate.
        prefix: Vec<u8>,
    },
    /// Full messages for the given sync ids.
    MessagesBySyncIds {
        /// Ids to resolve.
        sync_ids: Vec<SyncId>,
    },
    /// One level of trie metadata at a prefix.
    MetadataByPrefix {
        /// Trie prefix to describe.
        prefix: Vec<u8>,
    },
    /// Snapshot of everything outside a prefix.
    SnapshotByPrefix {
        /// Prefix to walk.
        prefix: Vec<u8>,
    },
    /// The registry event for a fid.
    IdRegistryEventByFid {
        /// The fid to look up.
        fid: u64,
    },
    /// All signer messages for a fid.
    SignerMessagesByFid {
        /// The fid to look up.
        fid: u64,
    },
    /// Switch this connection into a server-push event stream. An empty
    /// filter means all event types.
    Subscribe {
        /// Event types to receive.
        event_types: Vec<EventType>,
    },
}

/// A response frame, hub to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Reply to [`Request::Info`].
    Info(HubInfo),
    /// Reply to [`Request::SyncIdsByPrefix`].
    SyncIds(Vec<SyncId>),
    /// Reply to [`Request::MessagesBySyncIds`] and
    /// [`Request::SignerMessagesByFid`].
    Messages(Vec<Message>),
    /// Reply to [`Request::MetadataByPrefix`].
    Metadata(NodeMetadata),
    /// Reply to [`Request::SnapshotByPrefix`].
    Snapshot(TrieSnapshotResponse),
    /// Reply to [`Request::IdRegistryEventByFid`].
    IdRegistryEvent(IdRegistryEvent),
    /// First frame of an event stream, sent once listeners are attached.
    Ready,
    /// One store event on a subscribed connection.
    Event(StoreEvent),
    /// Any request that failed.
    Err(WireError),
}

/// Identity and sync status of a hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubInfo {
    /// Crate version of the serving hub.
    pub version: String,
    /// False while a sync round is running.
    pub is_synced: bool,
    /// Operator-chosen display name.
    pub nickname: String,
    /// Current trie root hash, empty for an empty trie.
    pub root_hash: String,
}

/// Snapshot reply: the walked prefix, the per-level excluded hashes, and the
/// serving hub's root hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrieSnapshotResponse {
    /// The prefix actually walked.
    pub prefix: Vec<u8>,
    /// Messages excluded along the walk.
    pub num_messages: u64,
    /// Root hash of the serving trie.
    pub root_hash: String,
    /// Per-level digests of the non-selected siblings, lowercase hex.
    pub excluded_hashes: Vec<String>,
}

/// A failed request: coarse status for transport gateways plus the
/// fine-grained code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Coarse status.
    pub status: StatusCode,
    /// Dotted fine-grained code, e.g. `bad_request.duplicate`.
    pub err_code: String,
    /// Human-readable detail.
    pub message: String,
}

impl From<HubError> for WireError {
    fn from(err: HubError) -> Self {
        WireError {
            status: err.code.status(),
            err_code: err.code.as_str().to_string(),
            message: err.message,
        }
    }
}

impl From<WireError> for HubError {
    fn from(err: WireError) -> Self {
        HubError::new(ErrorCode::parse(&err.err_code), err.message)
    }
}

/// Serve one peer connection until it closes.
///
/// Requests are answered in order. A [`Request::Subscribe`] switches the
/// connection into an event stream: the hub replies [`Response::Ready`] once
/// the store subscription is attached and pushes events until the peer hangs
/// up, at which point the subscription is dropped.
pub async fn serve_connection<S, R, W>(
    engine: Arc<SyncEngine<S>>,
    nickname: String,
    reader: R,
    writer: W,
) -> io::Result<()>
where
    S: HubStore,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(reader, WireCodec::<Request>::default());
    let mut writer = FramedWrite::new(writer, WireCodec::<Response>::default());

    while let Some(request) = reader.next().await {
        match request? {
            Request::Subscribe { event_types } => {
                let events = engine.store().subscribe();
                writer.send(Response::Ready).await?;
                loop {
                    tokio::select! {
                        event = events.recv_async() => match event {
                            Ok(event) => {
                                if event_types.is_empty()
                                    || event_types.contains(&event.event_type())
                                {
                                    writer.send(Response::Event(event)).await?;
                                }
                            }
                            // store dropped its senders, nothing more to push
                            Err(_) => return Ok(()),
                        },
                        frame = reader.next() => match frame {
                            None => return Ok(()),
                            Some(Err(err)) => return Err(err),
                            Some(Ok(request)) => {
                                debug!(?request, "ignoring request on subscribed connection");
                            }
                        },
                    }
                }
            }
            request => {
                let response = handle_request(&engine, &nickname, request);
                writer.send(response).await?;
            }
        }
    }
    Ok(())
}

fn handle_request<S: HubStore>(
    engine: &SyncEngine<S>,
    nickname: &str,
    request: Request,
) -> Response {
    match request {
        Request::Info => Response::Info(HubInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            is_synced: !engine.is_syncing(),
            nickname: nickname.to_string(),
            root_hash: engine.root_hash(),
        }),
        Request::SyncIdsByPrefix { prefix } => {
            Response::SyncIds(engine.get_all_sync_ids_by_prefix(&prefix))
        }
        Request::MessagesBySyncIds { sync_ids } => {
            match engine.store().get_messages_by_sync_ids(&sync_ids) {
                Ok(messages) => Response::Messages(messages),
                Err(err) => Response::Err(err.into()),
            }
        }
        Request::MetadataByPrefix { prefix } => match engine.get_node_metadata(&prefix) {
            Some(metadata) => Response::Metadata(metadata),
            None => Response::Err(HubError::not_found("no trie node at prefix").into()),
        },
        Request::SnapshotByPrefix { prefix } => {
            let snapshot = engine.get_snapshot_by_prefix(&prefix);
            Response::Snapshot(TrieSnapshotResponse {
                prefix: snapshot.prefix,
                num_messages: snapshot.num_messages,
                root_hash: engine.root_hash(),
                excluded_hashes: snapshot.excluded_hashes,
            })
        }
        Request::IdRegistryEventByFid { fid } => match engine.store().get_id_registry_event(fid) {
            Ok(event) => Response::IdRegistryEvent(event),
            Err(err) => Response::Err(err.into()),
        },
        Request::SignerMessagesByFid { fid } => {
            match engine.store().get_signer_messages_by_fid(fid) {
                Ok(messages) => Response::Messages(messages),
                Err(err) => Response::Err(err.into()),
            }
        }
        Request::Subscribe { .. } => {
            Response::Err(HubError::new(ErrorCode::BadRequest, "already handled").into())
        }
    }
}

/// Client half of the wire protocol. Implements [`SyncPeer`], so a hub
/// reached over any byte stream can drive a sync round.
#[derive(Debug)]
pub struct HubClient<R, W> {
    inner: tokio::sync::Mutex<ClientInner<R, W>>,
}

#[derive(Debug)]
struct ClientInner<R, W> {
    reader: FramedRead<R, WireCodec<Response>>,
    writer: FramedWrite<W, WireCodec<Request>>,
}

impl<R, W> HubClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap the two halves of a connection to a hub.
    pub fn new(reader: R, writer: W) -> Self {
        HubClient {
            inner: tokio::sync::Mutex::new(ClientInner {
                reader: FramedRead::new(reader, WireCodec::default()),
                writer: FramedWrite::new(writer, WireCodec::default()),
            }),
        }
    }

    async fn call(&self, request: Request) -> Result<Response, HubError> {
        let mut inner = self.inner.lock().await;
        inner
            .writer
            .send(request)
            .await
            .map_err(|err| HubError::network_failure(format!("failed to send request: {err}")))?;
        match inner.reader.next().await {
            Some(Ok(Response::Err(err))) => Err(err.into()),
            Some(Ok(response)) => Ok(response),
            Some(Err(err)) => Err(HubError::network_failure(format!(
                "failed to read response: {err}"
            ))),
            None => Err(HubError::network_failure("connection closed")),
        }
    }

    /// The hub's identity and sync status.
    pub async fn get_info(&self) -> Result<HubInfo, HubError> {
        match self.call(Request::Info).await? {
            Response::Info(info) => Ok(info),
            other => Err(unexpected(&other)),
        }
    }

    /// Snapshot of everything outside `prefix` on the remote hub.
    pub async fn get_snapshot_by_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<TrieSnapshotResponse, HubError> {
        let request = Request::SnapshotByPrefix {
            prefix: prefix.to_vec(),
        };
        match self.call(request).await? {
            Response::Snapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected(&other)),
        }
    }

    /// Switch the connection into an event stream. Consumes the client; the
    /// returned stream yields store events until the hub closes.
    pub async fn subscribe(
        self,
        event_types: Vec<EventType>,
    ) -> Result<EventStream<R, W>, HubError> {
        let mut inner = self.inner.into_inner();
        inner
            .writer
            .send(Request::Subscribe { event_types })
            .await
            .map_err(|err| HubError::network_failure(format!("failed to subscribe: {err}")))?;
        match inner.reader.next().await {
            Some(Ok(Response::Ready)) => Ok(EventStream {
                reader: inner.reader,
                _writer: inner.writer,
            }),
            Some(Ok(Response::Err(err))) => Err(err.into()),
            Some(Ok(other)) => Err(unexpected(&other)),
            Some(Err(err)) => Err(HubError::network_failure(format!(
                "failed to read ready frame: {err}"
            ))),
            None => Err(HubError::network_failure("connection closed")),
        }
    }
}

fn unexpected(response: &Response) -> HubError {
    HubError::new(
        ErrorCode::Unknown,
        format!("unexpected response frame: {response:?}"),
    )
}

#[async_trait]
impl<R, W> SyncPeer for HubClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn get_metadata_by_prefix(&self, prefix: &[u8]) -> Result<NodeMetadata, HubError> {
        let request = Request::MetadataByPrefix {
            prefix: prefix.to_vec(),
        };
        match self.call(request).await? {
            Response::Metadata(metadata) => Ok(metadata),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_sync_ids_by_prefix(&self, prefix: &[u8]) -> Result<Vec<SyncId>, HubError> {
        let request = Request::SyncIdsByPrefix {
            prefix: prefix.to_vec(),
        };
        match self.call(request).await? {
            Response::SyncIds(ids) => Ok(ids),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_messages_by_sync_ids(&self, ids: &[SyncId]) -> Result<Vec<Message>, HubError> {
        let request = Request::MessagesBySyncIds {
            sync_ids: ids.to_vec(),
        };
        match self.call(request).await? {
            Response::Messages(messages) => Ok(messages),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_id_registry_event_by_fid(&self, fid: u64) -> Result<IdRegistryEvent, HubError> {
        match self.call(Request::IdRegistryEventByFid { fid }).await? {
            Response::IdRegistryEvent(event) => Ok(event),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_all_signer_messages_by_fid(&self, fid: u64) -> Result<Vec<Message>, HubError> {
        match self.call(Request::SignerMessagesByFid { fid }).await? {
            Response::Messages(messages) => Ok(messages),
            other => Err(unexpected(&other)),
        }
    }
}

/// Stream of store events from a subscribed connection.
#[derive(Debug)]
pub struct EventStream<R, W> {
    reader: FramedRead<R, WireCodec<Response>>,
    _writer: FramedWrite<W, WireCodec<Request>>,
}

impl<R, W> Stream for EventStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    type Item = Result<StoreEvent, HubError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.reader).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(Ok(Response::Event(event)))) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(Some(Ok(Response::Err(err)))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(Some(Ok(other))) => Poll::Ready(Some(Err(unexpected(&other)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(HubError::network_failure(
                format!("failed to read event frame: {err}"),
            )))),
        }
    }
}
