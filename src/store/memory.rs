// In-memory backend for tests and ephemeral sessions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use nostr_sdk::prelude::PublicKey;

use crate::chat::{Direction, DmMessage};

use super::{DmStorage, StorageError, StoredMessage};

#[derive(Default)]
struct MemoryInner {
    // account hex -> chat key -> message id -> message
    messages: HashMap<String, BTreeMap<String, BTreeMap<String, DmMessage>>>,
    hidden: HashMap<String, HashSet<(String, String)>>,
    checkpoints: HashMap<String, i64>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryInner) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poison) => f(&poison.into_inner()),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemoryInner) -> T) -> T {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poison) => f(&mut poison.into_inner()),
        }
    }
}

impl DmStorage for MemoryStorage {
    fn load_messages(&self, account: &PublicKey) -> Result<Vec<StoredMessage>, StorageError> {
        Ok(self.read(|inner| {
            inner
                .messages
                .get(&account.to_hex())
                .map(|chats| {
                    chats
                        .iter()
                        .flat_map(|(chat_key, msgs)| {
                            msgs.values().map(|m| StoredMessage {
                                chat_key: chat_key.clone(),
                                message: m.clone(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    fn save_message(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message: &DmMessage,
    ) -> Result<bool, StorageError> {
        Ok(self.write(|inner| {
            let msgs = inner
                .messages
                .entry(account.to_hex())
                .or_default()
                .entry(chat.to_hex())
                .or_default();
            if msgs.contains_key(&message.id) {
                return false;
            }
            msgs.insert(message.id.clone(), message.clone());
            true
        }))
    }

    fn delete_message(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message_id: &str,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            if let Some(msgs) = inner
                .messages
                .get_mut(&account.to_hex())
                .and_then(|chats| chats.get_mut(&chat.to_hex()))
            {
                msgs.remove(message_id);
            }
            if let Some(hidden) = inner.hidden.get_mut(&account.to_hex()) {
                hidden.remove(&(chat.to_hex(), message_id.to_string()));
            }
        });
        Ok(())
    }

    fn mark_chat_read(&self, account: &PublicKey, chat: &PublicKey) -> Result<(), StorageError> {
        self.write(|inner| {
            if let Some(msgs) = inner
                .messages
                .get_mut(&account.to_hex())
                .and_then(|chats| chats.get_mut(&chat.to_hex()))
            {
                for msg in msgs.values_mut() {
                    if msg.direction == Direction::Incoming {
                        msg.read = true;
                    }
                }
            }
        });
        Ok(())
    }

    fn mark_all_read(&self, account: &PublicKey) -> Result<(), StorageError> {
        self.write(|inner| {
            if let Some(chats) = inner.messages.get_mut(&account.to_hex()) {
                for msgs in chats.values_mut() {
                    for msg in msgs.values_mut() {
                        if msg.direction == Direction::Incoming {
                            msg.read = true;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn set_hidden(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message_id: &str,
        hidden: bool,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            let set = inner.hidden.entry(account.to_hex()).or_default();
            let key = (chat.to_hex(), message_id.to_string());
            if hidden {
                set.insert(key);
            } else {
                set.remove(&key);
            }
        });
        Ok(())
    }

    fn hidden_messages(&self, account: &PublicKey) -> Result<Vec<(String, String)>, StorageError> {
        Ok(self.read(|inner| {
            inner
                .hidden
                .get(&account.to_hex())
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    fn checkpoint(&self, account: &PublicKey) -> Result<Option<i64>, StorageError> {
        Ok(self.read(|inner| inner.checkpoints.get(&account.to_hex()).copied()))
    }

    fn set_checkpoint(&self, account: &PublicKey, at: i64) -> Result<(), StorageError> {
        self.write(|inner| {
            inner.checkpoints.insert(account.to_hex(), at);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{DeliveryState, Scheme};
    use nostr_sdk::prelude::Keys;

    fn sample(peer: PublicKey, id: &str, ts: i64) -> DmMessage {
        DmMessage {
            id: id.to_string(),
            peer,
            timestamp: ts,
            content: "hi".into(),
            direction: Direction::Incoming,
            tags: vec![],
            scheme: Scheme::GiftWrap,
            reply_to: None,
            delivery: DeliveryState::Sent,
            read: false,
        }
    }

    #[test]
    fn save_skips_existing_id() {
        let store = MemoryStorage::new();
        let account = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let msg = sample(peer, "m1", 10);

        assert!(store.save_message(&account, &peer, &msg).unwrap());
        assert!(!store.save_message(&account, &peer, &msg).unwrap());
        assert_eq!(store.load_messages(&account).unwrap().len(), 1);
    }

    #[test]
    fn checkpoint_roundtrip() {
        let store = MemoryStorage::new();
        let account = Keys::generate().public_key();

        assert_eq!(store.checkpoint(&account).unwrap(), None);
        store.set_checkpoint(&account, 1234).unwrap();
        assert_eq!(store.checkpoint(&account).unwrap(), Some(1234));
    }

    #[test]
    fn hidden_set_roundtrip() {
        let store = MemoryStorage::new();
        let account = Keys::generate().public_key();
        let peer = Keys::generate().public_key();

        store.set_hidden(&account, &peer, "m1", true).unwrap();
        assert_eq!(
            store.hidden_messages(&account).unwrap(),
            vec![(peer.to_hex(), "m1".to_string())]
        );
        store.set_hidden(&account, &peer, "m1", false).unwrap();
        assert!(store.hidden_messages(&account).unwrap().is_empty());
    }
}
