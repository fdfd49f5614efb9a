//! In-memory reference implementation of [`HubStore`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::HubError;
use crate::message::{IdRegistryEvent, Message, MessageKind, NameRegistryEvent};
use crate::store::{HubStore, StoreEvent};
use crate::sync_id::SyncId;

/// In-memory message store with the set semantics the sync engine depends
/// on: fid and signer validation, duplicate rejection, remove-displaces-add,
/// and revocation of messages whose signer is removed.
///
/// Messages are kept in a `BTreeMap` by primary key, which partitions them by
/// fid and orders each user's sets by timestamp.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<Inner>>,
    subscribers: Arc<RwLock<Vec<flume::Sender<StoreEvent>>>>,
}

#[derive(Debug, Default)]
struct Inner {
    messages: BTreeMap<Vec<u8>, Message>,
    registrations: HashMap<u64, IdRegistryEvent>,
    signers: HashMap<u64, HashSet<[u8; 32]>>,
    names: HashMap<Vec<u8>, NameRegistryEvent>,
}

impl MemStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    /// True if no messages are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.read().messages.is_empty()
    }

    fn emit(&self, event: StoreEvent) {
        self.subscribers
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn delegate_key(message: &Message) -> Result<[u8; 32], HubError> {
        <[u8; 32]>::try_from(message.payload.as_ref())
            .map_err(|_| HubError::validation_failure("malformed signer payload"))
    }
}

impl HubStore for MemStore {
    fn for_each_message<F>(&self, mut f: F) -> Result<(), HubError>
    where
        F: FnMut(&Message) -> Result<(), HubError>,
    {
        let inner = self.inner.read();
        for message in inner.messages.values() {
            f(message)?;
        }
        Ok(())
    }

    fn merge_message(&self, message: Message) -> Result<(), HubError> {
        let mut revoked = Vec::new();
        let deleted;
        {
            let mut inner = self.inner.write();
            if !inner.registrations.contains_key(&message.fid) {
                return Err(HubError::validation_failure(format!(
                    "unknown fid {}",
                    message.fid
                )));
            }
            let is_signer_message = matches!(
                message.kind,
                MessageKind::SignerAdd | MessageKind::SignerRemove
            );
            if !is_signer_message {
                let known = inner
                    .signers
                    .get(&message.fid)
                    .is_some_and(|keys| keys.contains(&message.signer));
                if !known {
                    return Err(HubError::validation_failure(format!(
                        "invalid signer {}",
                        hex::encode(message.signer)
                    )));
                }
            }
            let key = message.primary_key().to_vec();
            if inner.messages.contains_key(&key) {
                return Err(HubError::duplicate("message has already been merged"));
            }
            let delegate = match message.kind {
                MessageKind::SignerAdd | MessageKind::SignerRemove => {
                    Some(Self::delegate_key(&message)?)
                }
                _ => None,
            };

            // a remove displaces the add targeting the same payload
            deleted = match message.kind.removes() {
                Some(add_kind) => {
                    let displaced: Vec<Vec<u8>> = inner
                        .messages
                        .iter()
                        .filter(|(_, m)| {
                            m.fid == message.fid
                                && m.kind == add_kind
                                && m.payload == message.payload
                        })
                        .map(|(k, _)| k.clone())
                        .collect();
                    displaced
                        .iter()
                        .filter_map(|k| inner.messages.remove(k))
                        .collect()
                }
                None => Vec::new(),
            };

            match (message.kind, delegate) {
                (MessageKind::SignerAdd, Some(delegate)) => {
                    inner.signers.entry(message.fid).or_default().insert(delegate);
                }
                (MessageKind::SignerRemove, Some(delegate)) => {
                    if let Some(keys) = inner.signers.get_mut(&message.fid) {
                        keys.remove(&delegate);
                    }
                    // everything signed by the removed key is dropped
                    let dropped: Vec<Vec<u8>> = inner
                        .messages
                        .iter()
                        .filter(|(_, m)| m.fid == message.fid && m.signer == delegate)
                        .map(|(k, _)| k.clone())
                        .collect();
                    revoked = dropped
                        .iter()
                        .filter_map(|k| inner.messages.remove(k))
                        .collect();
                }
                _ => {}
            }

            inner.messages.insert(key, message.clone());
        }

        self.emit(StoreEvent::MergeMessage { message, deleted });
        for message in revoked {
            self.emit(StoreEvent::RevokeMessage { message });
        }
        Ok(())
    }

    fn merge_id_registry_event(&self, event: IdRegistryEvent) -> Result<(), HubError> {
        {
            let mut inner = self.inner.write();
            match inner.registrations.get(&event.fid) {
                Some(existing) if existing.block_number == event.block_number => {
                    return Err(HubError::duplicate("registry event already merged"));
                }
                Some(existing) if existing.block_number > event.block_number => {
                    return Err(HubError::new(
                        crate::error::ErrorCode::BadRequestConflict,
                        "registry event is older than the merged one",
                    ));
                }
                _ => {}
            }
            inner.registrations.insert(event.fid, event.clone());
        }
        self.emit(StoreEvent::MergeIdRegistryEvent { event });
        Ok(())
    }

    fn merge_name_registry_event(&self, event: NameRegistryEvent) -> Result<(), HubError> {
        {
            let mut inner = self.inner.write();
            match inner.names.get(&event.name) {
                Some(existing) if existing.block_number == event.block_number => {
                    return Err(HubError::duplicate("registry event already merged"));
                }
                Some(existing) if existing.block_number > event.block_number => {
                    return Err(HubError::new(
                        crate::error::ErrorCode::BadRequestConflict,
                        "registry event is older than the merged one",
                    ));
                }
                _ => {}
            }
            inner.names.insert(event.name.clone(), event.clone());
        }
        self.emit(StoreEvent::MergeNameRegistryEvent { event });
        Ok(())
    }

    fn get_messages_by_sync_ids(&self, ids: &[SyncId]) -> Result<Vec<Message>, HubError> {
        let inner = self.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id.to_primary_key().as_slice()))
            .cloned()
            .collect())
    }

    fn get_id_registry_event(&self, fid: u64) -> Result<IdRegistryEvent, HubError> {
        self.inner
            .read()
            .registrations
            .get(&fid)
            .cloned()
            .ok_or_else(|| HubError::not_found(format!("no registry event for fid {fid}")))
    }

    fn get_signer_messages_by_fid(&self, fid: u64) -> Result<Vec<Message>, HubError> {
        let inner = self.inner.read();
        Ok(inner
            .messages
            .values()
            .filter(|m| {
                m.fid == fid
                    && matches!(m.kind, MessageKind::SignerAdd | MessageKind::SignerRemove)
            })
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> flume::Receiver<StoreEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.write().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELEGATE: [u8; 32] = [9u8; 32];

    fn registry_event(fid: u64) -> IdRegistryEvent {
        IdRegistryEvent {
            fid,
            custody: [1u8; 20],
            block_number: 100,
        }
    }

    fn signer_add(fid: u64, timestamp: u32) -> Message {
        Message::new(
            fid,
            MessageKind::SignerAdd,
            timestamp,
            [2u8; 32],
            DELEGATE.to_vec(),
        )
    }

    fn post(fid: u64, timestamp: u32, body: &str) -> Message {
        Message::new(fid, MessageKind::PostAdd, timestamp, DELEGATE, body.to_string())
    }

    fn store_with_user(fid: u64) -> MemStore {
        let store = MemStore::new();
        store.merge_id_registry_event(registry_event(fid)).unwrap();
        store.merge_message(signer_add(fid, 1)).unwrap();
        store
    }

    #[test]
    fn test_unknown_fid_rejected() {
        let store = MemStore::new();
        let err = store.merge_message(post(42, 10, "hello")).unwrap_err();
        assert!(err.is_missing_user_dependency());
        assert!(err.message.contains("unknown fid"));
    }

    #[test]
    fn test_unknown_signer_rejected() {
        let store = MemStore::new();
        store.merge_id_registry_event(registry_event(42)).unwrap();
        let err = store.merge_message(post(42, 10, "hello")).unwrap_err();
        assert!(err.is_missing_user_dependency());
        assert!(err.message.contains("invalid signer"));
    }

    #[test]
    fn test_duplicate_rejected() {
        let store = store_with_user(42);
        store.merge_message(post(42, 10, "hello")).unwrap();
        let err = store.merge_message(post(42, 10, "hello")).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadRequestDuplicate);
    }

    #[test]
    fn test_remove_displaces_add() {
        let store = store_with_user(42);
        let events = store.subscribe();
        let add = post(42, 10, "hello");
        store.merge_message(add.clone()).unwrap();

        let remove = Message::new(42, MessageKind::PostRemove, 20, DELEGATE, "hello");
        store.merge_message(remove.clone()).unwrap();

        assert!(matches!(events.recv().unwrap(), StoreEvent::MergeMessage { deleted, .. } if deleted.is_empty()));
        match events.recv().unwrap() {
            StoreEvent::MergeMessage { message, deleted } => {
                assert_eq!(message, remove);
                assert_eq!(deleted, vec![add.clone()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let ids = [SyncId::from_message(&add)];
        assert!(store.get_messages_by_sync_ids(&ids).unwrap().is_empty());
    }

    #[test]
    fn test_signer_remove_revokes_messages() {
        let store = store_with_user(42);
        store.merge_message(post(42, 10, "one")).unwrap();
        store.merge_message(post(42, 11, "two")).unwrap();
        let events = store.subscribe();

        let remove = Message::new(
            42,
            MessageKind::SignerRemove,
            20,
            [2u8; 32],
            DELEGATE.to_vec(),
        );
        store.merge_message(remove).unwrap();

        assert!(matches!(events.recv().unwrap(), StoreEvent::MergeMessage { .. }));
        let mut revoked = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                StoreEvent::RevokeMessage { message } => revoked.push(message),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(revoked.len(), 2);
        // once the signer is gone, new messages from it fail validation
        let err = store.merge_message(post(42, 30, "three")).unwrap_err();
        assert!(err.message.contains("invalid signer"));
    }

    #[test]
    fn test_registry_event_ordering() {
        let store = MemStore::new();
        store.merge_id_registry_event(registry_event(42)).unwrap();
        let err = store.merge_id_registry_event(registry_event(42)).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadRequestDuplicate);

        let older = IdRegistryEvent {
            block_number: 50,
            ..registry_event(42)
        };
        let err = store.merge_id_registry_event(older).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadRequestConflict);

        let newer = IdRegistryEvent {
            block_number: 200,
            ..registry_event(42)
        };
        store.merge_id_registry_event(newer).unwrap();
    }

    #[test]
    fn test_name_registry_event() {
        let store = MemStore::new();
        let events = store.subscribe();
        let event = NameRegistryEvent {
            name: b"alice".to_vec(),
            owner: [3u8; 20],
            block_number: 7,
        };
        store.merge_name_registry_event(event.clone()).unwrap();
        match events.recv().unwrap() {
            StoreEvent::MergeNameRegistryEvent { event: merged } => assert_eq!(merged, event),
            other => panic!("unexpected event {other:?}"),
        }
        let err = store.merge_name_registry_event(event).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::BadRequestDuplicate);
    }

    #[test]
    fn test_lookup_by_sync_id() {
        let store = store_with_user(42);
        let message = post(42, 10, "hello");
        store.merge_message(message.clone()).unwrap();
        let id = SyncId::from_message(&message);
        let unknown = SyncId::from_message(&post(42, 99, "missing"));
        let found = store.get_messages_by_sync_ids(&[id, unknown]).unwrap();
        assert_eq!(found, vec![message]);
    }
}
