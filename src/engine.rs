//! The engine driving trie maintenance and remote reconciliation.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, HubError};
use crate::message::{now_hub_seconds, Message};
use crate::peer::SyncPeer;
use crate::store::{HubStore, StoreEvent};
use crate::sync_id::{timestamp_to_prefix, SyncId, TIMESTAMP_LENGTH};
use crate::trie::{MerkleTrie, NodeMetadata, TrieSnapshot};

/// Below this subtree size the walk stops comparing hashes and just fetches
/// the sync ids. Balances RPC count against per-call payload size.
pub const HASHES_PER_FETCH: u64 = 50;

/// Snapshot timestamps are quantized to this many seconds, so messages still
/// propagating through the network are excluded from comparison.
const SYNC_THRESHOLD_SECS: u32 = 10;

const HYDRATE_LOG_INTERVAL: usize = 10_000;

/// Synchronization engine over a local [store](HubStore).
///
/// Owns the [`MerkleTrie`] exclusively: it is hydrated from the store at
/// construction and afterwards mutated only by the store's event stream
/// (insert on merge, delete on prune and revoke). All sync-round steps and
/// event handling are designed to run on one logical task; the internal lock
/// exists only to let the wire surface read concurrently.
#[derive(derive_more::Debug)]
pub struct SyncEngine<S> {
    store: S,
    trie: RwLock<MerkleTrie>,
    #[debug(skip)]
    events: flume::Receiver<StoreEvent>,
    is_syncing: AtomicBool,
}

impl<S: HubStore> SyncEngine<S> {
    /// Build the trie by streaming every stored message through insert, then
    /// attach to the store's event stream.
    pub fn new(store: S) -> Result<Self, HubError> {
        let events = store.subscribe();
        let mut trie = MerkleTrie::new();
        let mut count = 0usize;
        store.for_each_message(|message| {
            trie.insert(&SyncId::from_message(message))?;
            count += 1;
            if count % HYDRATE_LOG_INTERVAL == 0 {
                info!(count, "sync trie: hydrating");
            }
            Ok(())
        })?;
        info!(messages = count, root_hash = %trie.root_hash(), "sync trie: hydrated");
        Ok(SyncEngine {
            store,
            trie: RwLock::new(trie),
            events,
            is_syncing: AtomicBool::new(false),
        })
    }

    /// The local store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether a sync round is currently running. Advisory only.
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Root hash of the trie, empty string when the trie is empty.
    pub fn root_hash(&self) -> String {
        self.apply_pending_events();
        self.trie.read().root_hash()
    }

    /// Number of sync ids in the trie.
    pub fn items(&self) -> usize {
        self.apply_pending_events();
        self.trie.read().items()
    }

    /// Trie metadata at `prefix`, one level of children.
    pub fn get_node_metadata(&self, prefix: &[u8]) -> Option<NodeMetadata> {
        self.apply_pending_events();
        self.trie.read().get_node_metadata(prefix)
    }

    /// All sync ids under `prefix`.
    pub fn get_all_sync_ids_by_prefix(&self, prefix: &[u8]) -> Vec<SyncId> {
        self.apply_pending_events();
        self.trie.read().get_all_values(prefix)
    }

    /// Snapshot at an explicit prefix.
    pub fn get_snapshot_by_prefix(&self, prefix: &[u8]) -> TrieSnapshot {
        self.apply_pending_events();
        self.trie.read().get_snapshot(prefix)
    }

    /// Snapshot at the default prefix: the leading nine digits of the
    /// quantized [snapshot timestamp](SyncEngine::snapshot_timestamp).
    pub fn get_snapshot(&self) -> TrieSnapshot {
        self.get_snapshot_by_prefix(&self.default_snapshot_prefix())
    }

    /// Now, quantized down to the sync threshold.
    pub fn snapshot_timestamp(&self) -> u32 {
        (now_hub_seconds() / SYNC_THRESHOLD_SECS) * SYNC_THRESHOLD_SECS
    }

    fn default_snapshot_prefix(&self) -> Vec<u8> {
        timestamp_to_prefix(self.snapshot_timestamp())[..TIMESTAMP_LENGTH - 1].to_vec()
    }

    /// Apply one store event to the trie.
    pub fn handle_event(&self, event: &StoreEvent) {
        let mut trie = self.trie.write();
        let result = match event {
            StoreEvent::MergeMessage { message, deleted } => deleted
                .iter()
                .try_for_each(|d| trie.delete(&SyncId::from_message(d)).map(drop))
                .and_then(|()| trie.insert(&SyncId::from_message(message)).map(drop)),
            StoreEvent::PruneMessage { message } | StoreEvent::RevokeMessage { message } => {
                trie.delete(&SyncId::from_message(message)).map(drop)
            }
            StoreEvent::MergeIdRegistryEvent { .. }
            | StoreEvent::MergeNameRegistryEvent { .. } => Ok(()),
        };
        if let Err(err) = result {
            warn!(%err, "sync trie: failed to apply store event");
        }
    }

    /// Drain and apply any store events that have queued up. Reads go
    /// through this so the trie always reflects the store before it is
    /// compared or served.
    pub fn apply_pending_events(&self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(&event);
        }
    }

    /// Live mode: apply store events as they arrive, until the store drops
    /// its senders.
    pub async fn run(&self) {
        while let Ok(event) = self.events.recv_async().await {
            self.handle_event(&event);
        }
        debug!("sync engine: event stream closed");
    }

    /// Whether a sync round against a peer with these excluded hashes would
    /// find anything. False while a round is already running.
    pub fn should_sync(&self, their_excluded: &[String]) -> bool {
        if self.is_syncing() {
            return false;
        }
        let ours = self.get_snapshot();
        let excluded_hashes_match = their_excluded.len() == ours.excluded_hashes.len()
            && their_excluded
                .iter()
                .zip(&ours.excluded_hashes)
                .all(|(theirs, ours)| theirs == ours);
        !excluded_hashes_match
    }

    /// Run one sync round against `peer`, whose snapshot carried
    /// `their_excluded`. Failures are logged and abandoned; the outer
    /// scheduler retries by triggering another round. The advisory syncing
    /// flag is cleared on every exit path.
    pub async fn perform_sync<P: SyncPeer>(&self, their_excluded: &[String], peer: &P) {
        if self.is_syncing.swap(true, Ordering::SeqCst) {
            warn!("sync: round already in progress, skipping");
            return;
        }
        match self.sync_with(their_excluded, peer).await {
            Ok(merged) => info!(merged, "sync: round complete"),
            Err(err) => warn!(%err, "sync: round abandoned"),
        }
        self.is_syncing.store(false, Ordering::SeqCst);
    }

    async fn sync_with<P: SyncPeer>(
        &self,
        their_excluded: &[String],
        peer: &P,
    ) -> Result<usize, HubError> {
        let ours = self.get_snapshot();
        let divergence = {
            let trie = self.trie.read();
            trie.get_divergence_prefix(&ours.prefix, their_excluded)
        };
        debug!(
            prefix = %String::from_utf8_lossy(&divergence),
            "sync: walking divergence prefix"
        );
        let missing = self.fetch_missing_sync_ids(&divergence, peer).await?;
        self.fetch_and_merge_messages(&missing, peer).await
    }

    /// Walk the peer's trie below `prefix`, descending only into subtrees
    /// whose hashes differ from ours, and collect the sync ids of small
    /// enough diverging subtrees.
    async fn fetch_missing_sync_ids<P: SyncPeer>(
        &self,
        prefix: &[u8],
        peer: &P,
    ) -> Result<Vec<SyncId>, HubError> {
        let mut missing = Vec::new();
        let mut pending = vec![prefix.to_vec()];
        while let Some(prefix) = pending.pop() {
            let theirs = peer.get_metadata_by_prefix(&prefix).await?;
            if theirs.num_messages == 0 {
                continue;
            }
            if theirs.num_messages <= HASHES_PER_FETCH {
                missing.extend(peer.get_sync_ids_by_prefix(&theirs.prefix).await?);
                continue;
            }
            let ours = {
                self.apply_pending_events();
                self.trie.read().get_node_metadata(&theirs.prefix)
            };
            // depth-first, lowest branch byte first
            for (byte, their_child) in theirs.children.iter().rev() {
                let hashes_match = ours
                    .as_ref()
                    .and_then(|o| o.children.get(byte))
                    .is_some_and(|our_child| our_child.hash == their_child.hash);
                if !hashes_match {
                    pending.push(their_child.prefix.clone());
                }
            }
        }
        Ok(missing)
    }

    /// Fetch full messages for `sync_ids` and merge them. Returns the number
    /// merged successfully.
    async fn fetch_and_merge_messages<P: SyncPeer>(
        &self,
        sync_ids: &[SyncId],
        peer: &P,
    ) -> Result<usize, HubError> {
        if sync_ids.is_empty() {
            return Ok(0);
        }
        debug!(count = sync_ids.len(), "sync: fetching missing messages");
        let messages = peer.get_messages_by_sync_ids(sync_ids).await?;
        let results = self.merge_messages(messages, peer).await;
        Ok(results.iter().filter(|r| r.is_ok()).count())
    }

    /// Merge a batch in ascending timestamp order (stable tie-break by batch
    /// order), one result per message. Sequential so that dependency
    /// recovery stays deterministic and the same foreign user is never
    /// fetched twice concurrently.
    pub async fn merge_messages<P: SyncPeer>(
        &self,
        mut messages: Vec<Message>,
        peer: &P,
    ) -> Vec<Result<(), HubError>> {
        messages.sort_by_key(|m| m.timestamp);
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            let result = match self.store.merge_message(message.clone()) {
                Err(err) if err.is_missing_user_dependency() => {
                    self.sync_user_and_retry_message(message, peer, err).await
                }
                other => other,
            };
            results.push(result);
        }
        self.apply_pending_events();
        results
    }

    /// Repair the one recoverable dependency gap: the message's user is
    /// unknown locally. Fetches the fid's registry event and signer
    /// messages from the peer, then retries the original message once.
    async fn sync_user_and_retry_message<P: SyncPeer>(
        &self,
        message: Message,
        peer: &P,
        original: HubError,
    ) -> Result<(), HubError> {
        let fid = message.fid;
        debug!(fid, "sync: recovering missing user");
        let event = peer.get_id_registry_event_by_fid(fid).await.map_err(|err| {
            HubError::network_failure(format!("failed to fetch registry event for fid {fid}: {err}"))
        })?;
        match self.store.merge_id_registry_event(event) {
            Ok(()) => {}
            // the registration may already be present when only the signer
            // was missing
            Err(err)
                if matches!(
                    err.code,
                    ErrorCode::BadRequestDuplicate | ErrorCode::BadRequestConflict
                ) => {}
            Err(err) => {
                return Err(HubError::storage_failure(format!(
                    "failed to merge registry event for fid {fid}: {err}"
                )))
            }
        }
        let signer_messages = peer.get_all_signer_messages_by_fid(fid).await.map_err(|err| {
            HubError::network_failure(format!("failed to fetch signers for fid {fid}: {err}"))
        })?;
        let any_merged = self
            .store
            .merge_messages(signer_messages)
            .iter()
            .any(|r| r.is_ok());
        if any_merged {
            self.store.merge_message(message)
        } else {
            Err(original)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::message::{IdRegistryEvent, MessageKind};
    use crate::store::memory::MemStore;

    const DELEGATE: [u8; 32] = [9u8; 32];

    fn register_user(store: &MemStore, fid: u64) {
        store
            .merge_id_registry_event(IdRegistryEvent {
                fid,
                custody: [1u8; 20],
                block_number: 100,
            })
            .unwrap();
        store
            .merge_message(Message::new(
                fid,
                MessageKind::SignerAdd,
                1,
                [2u8; 32],
                DELEGATE.to_vec(),
            ))
            .unwrap();
    }

    fn post(fid: u64, timestamp: u32, body: &str) -> Message {
        Message::new(fid, MessageKind::PostAdd, timestamp, DELEGATE, body.to_string())
    }

    /// A peer served straight out of another engine, with a call log.
    struct LocalPeer {
        engine: Arc<SyncEngine<MemStore>>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl LocalPeer {
        fn new(engine: Arc<SyncEngine<MemStore>>) -> Self {
            LocalPeer {
                engine,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SyncPeer for LocalPeer {
        async fn get_metadata_by_prefix(&self, prefix: &[u8]) -> Result<NodeMetadata, HubError> {
            self.calls.lock().push("metadata");
            self.engine
                .get_node_metadata(prefix)
                .ok_or_else(|| HubError::not_found("no trie node at prefix"))
        }

        async fn get_sync_ids_by_prefix(&self, prefix: &[u8]) -> Result<Vec<SyncId>, HubError> {
            self.calls.lock().push("sync_ids");
            Ok(self.engine.get_all_sync_ids_by_prefix(prefix))
        }

        async fn get_messages_by_sync_ids(&self, ids: &[SyncId]) -> Result<Vec<Message>, HubError> {
            self.calls.lock().push("messages");
            self.engine.store().get_messages_by_sync_ids(ids)
        }

        async fn get_id_registry_event_by_fid(&self, fid: u64) -> Result<IdRegistryEvent, HubError> {
            self.calls.lock().push("id_registry");
            self.engine.store().get_id_registry_event(fid)
        }

        async fn get_all_signer_messages_by_fid(&self, fid: u64) -> Result<Vec<Message>, HubError> {
            self.calls.lock().push("signers");
            self.engine.store().get_signer_messages_by_fid(fid)
        }
    }

    fn engine_with_user(fid: u64) -> Arc<SyncEngine<MemStore>> {
        let store = MemStore::new();
        register_user(&store, fid);
        Arc::new(SyncEngine::new(store).unwrap())
    }

    #[test]
    fn test_hydration_from_store() {
        let store = MemStore::new();
        register_user(&store, 42);
        for i in 0..20 {
            store.merge_message(post(42, 1665182300 + i, &format!("m{i}"))).unwrap();
        }
        let engine = SyncEngine::new(store.clone()).unwrap();
        assert_eq!(engine.items(), 21); // 20 posts + 1 signer add
        assert_eq!(store.len(), 21);
        assert!(!engine.root_hash().is_empty());
    }

    #[test]
    fn test_events_keep_trie_in_step() {
        let engine = engine_with_user(42);
        let message = post(42, 1665182332, "hello");
        let id = SyncId::from_message(&message);

        engine.store().merge_message(message.clone()).unwrap();
        engine.apply_pending_events();
        assert!(engine.get_node_metadata(&[]).unwrap().num_messages >= 2);

        let remove = Message::new(42, MessageKind::PostRemove, 1665182340, DELEGATE, "hello");
        let remove_id = SyncId::from_message(&remove);
        engine.store().merge_message(remove).unwrap();
        engine.apply_pending_events();

        // the displaced add left the trie, the remove entered it
        let ids = engine.get_all_sync_ids_by_prefix(&[]);
        assert!(!ids.contains(&id));
        assert!(ids.contains(&remove_id));
    }

    #[test]
    fn test_revoke_event_deletes_from_trie() {
        let engine = engine_with_user(42);
        let message = post(42, 1665182332, "hello");
        engine.store().merge_message(message.clone()).unwrap();
        engine.apply_pending_events();
        let items = engine.items();

        engine.handle_event(&StoreEvent::RevokeMessage { message });
        assert_eq!(engine.items(), items - 1);
    }

    #[test]
    fn test_should_sync() {
        let engine = engine_with_user(42);
        engine.store().merge_message(post(42, 1665182332, "a")).unwrap();

        let ours = engine.get_snapshot();
        assert!(!engine.should_sync(&ours.excluded_hashes));

        let mut theirs = ours.excluded_hashes.clone();
        theirs[0] = crate::Digest::new(b"something else").to_hex();
        assert!(engine.should_sync(&theirs));
        assert!(engine.should_sync(&[]));
    }

    #[tokio::test]
    async fn test_sync_converges_small() {
        let remote = engine_with_user(42);
        for i in 0..10 {
            remote.store().merge_message(post(42, 1665182300 + i, &format!("m{i}"))).unwrap();
        }
        let local = engine_with_user(42);
        let peer = LocalPeer::new(remote.clone());

        let theirs = remote.get_snapshot();
        assert!(local.should_sync(&theirs.excluded_hashes));
        local.perform_sync(&theirs.excluded_hashes, &peer).await;

        assert_eq!(local.root_hash(), remote.root_hash());
        assert_eq!(local.items(), remote.items());
        assert!(!local.is_syncing());
    }

    #[tokio::test]
    async fn test_sync_converges_above_fetch_threshold() {
        let remote = engine_with_user(42);
        // spread across many timestamps so the walk has to descend
        for i in 0..120u32 {
            remote
                .store()
                .merge_message(post(42, 1665182000 + i * 7, &format!("m{i}")))
                .unwrap();
        }
        let local = engine_with_user(42);
        let theirs = remote.get_snapshot();
        let peer = LocalPeer::new(remote.clone());
        local.perform_sync(&theirs.excluded_hashes, &peer).await;

        assert_eq!(local.root_hash(), remote.root_hash());
        // the walk descended instead of fetching everything in one call
        assert!(peer.calls.lock().iter().filter(|c| **c == "metadata").count() > 1);
    }

    #[tokio::test]
    async fn test_unknown_fid_recovery() {
        let remote = engine_with_user(77);
        let message = post(77, 1665182332, "from a stranger");
        remote.store().merge_message(message.clone()).unwrap();

        // local hub has never seen fid 77
        let local = Arc::new(SyncEngine::new(MemStore::new()).unwrap());
        let peer = LocalPeer::new(remote.clone());
        let results = local.merge_messages(vec![message.clone()], &peer).await;
        assert_eq!(results, vec![Ok(())]);

        let calls = peer.calls.lock().clone();
        assert_eq!(calls, vec!["id_registry", "signers"]);
        assert!(local.store().get_id_registry_event(77).is_ok());
        let ids = [SyncId::from_message(&message)];
        assert_eq!(local.store().get_messages_by_sync_ids(&ids).unwrap().len(), 1);
        // the retried message also landed in the trie
        assert!(local.get_all_sync_ids_by_prefix(&[]).contains(&ids[0]));
    }

    #[tokio::test]
    async fn test_recovery_surfaces_original_error_without_signers() {
        let remote_store = MemStore::new();
        remote_store
            .merge_id_registry_event(IdRegistryEvent {
                fid: 77,
                custody: [1u8; 20],
                block_number: 100,
            })
            .unwrap();
        let remote = Arc::new(SyncEngine::new(remote_store).unwrap());
        let local = Arc::new(SyncEngine::new(MemStore::new()).unwrap());
        let peer = LocalPeer::new(remote);

        // the peer knows the fid but has no signers to offer
        let results = local
            .merge_messages(vec![post(77, 1665182332, "orphan")], &peer)
            .await;
        assert_eq!(results.len(), 1);
        let err = results[0].as_ref().unwrap_err();
        assert!(err.is_missing_user_dependency());
    }

    #[tokio::test]
    async fn test_identical_tries_fetch_nothing() {
        let remote = engine_with_user(42);
        remote.store().merge_message(post(42, 1665182332, "a")).unwrap();

        let local_store = MemStore::new();
        register_user(&local_store, 42);
        local_store.merge_message(post(42, 1665182332, "a")).unwrap();
        let local = Arc::new(SyncEngine::new(local_store).unwrap());

        let theirs = remote.get_snapshot();
        assert!(!local.should_sync(&theirs.excluded_hashes));

        // even if a round is forced, the walk fetches no sync ids or messages
        let peer = LocalPeer::new(remote.clone());
        local.perform_sync(&theirs.excluded_hashes, &peer).await;
        assert!(!peer.calls.lock().contains(&"sync_ids"));
        assert!(!peer.calls.lock().contains(&"messages"));
        assert_eq!(local.root_hash(), remote.root_hash());
        assert!(!local.is_syncing());
    }
}
