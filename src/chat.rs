// In-memory chat map: dedup/merge of decrypted messages, unread accounting,
// local hide flags. Published copy-on-write so readers always see a
// consistent snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr_sdk::prelude::{EventId, PublicKey, RelayUrl};
use serde::{Deserialize, Serialize};

use crate::store::{normalize_chat_key, StoredMessage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Encryption scheme of a single message. Tracked per message, not per chat:
/// one conversation can mix both while a peer migrates clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    /// Single-layer NIP-04 envelope, plaintext timestamps.
    Legacy,
    /// Three-layer NIP-17 envelope (rumor, seal, gift wrap).
    GiftWrap,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed { reason: String },
}

/// A tag of the decrypted inner message, parsed once at the unwrap boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTag {
    Recipient(PublicKey),
    Reply(EventId),
    RelayHint(RelayUrl),
    Unknown(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmMessage {
    /// Content-derived event id (hex). Unique within a chat.
    pub id: String,
    /// The counterparty the conversation is filed under. For outgoing
    /// messages this is the recipient, not the wire author.
    pub peer: PublicKey,
    /// Sender-declared creation time in seconds. Gift-wrap outer layers
    /// randomize their own timestamps, so cross-scheme ordering is best
    /// effort by design.
    pub timestamp: i64,
    pub content: String,
    pub direction: Direction,
    pub tags: Vec<MessageTag>,
    pub scheme: Scheme,
    pub reply_to: Option<String>,
    pub delivery: DeliveryState,
    pub read: bool,
}

#[derive(Clone, Debug)]
pub struct Chat {
    pub peer: PublicKey,
    messages: HashMap<String, DmMessage>,
    pub unread_count: u32,
    pub has_legacy_messages: bool,
    last_message_id: Option<String>,
    hidden: HashSet<String>,
}

impl Chat {
    fn new(peer: PublicKey) -> Self {
        Self {
            peer,
            messages: HashMap::new(),
            unread_count: 0,
            has_legacy_messages: false,
            last_message_id: None,
            hidden: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.contains_key(message_id)
    }

    pub fn message(&self, message_id: &str) -> Option<&DmMessage> {
        self.messages.get(message_id)
    }

    /// The message with the maximum timestamp, recomputed on every mutation.
    pub fn last_message(&self) -> Option<&DmMessage> {
        self.last_message_id
            .as_deref()
            .and_then(|id| self.messages.get(id))
    }

    /// Messages ascending by timestamp, ties broken by id so the order is
    /// total and stable across snapshots.
    pub fn sorted_messages(&self) -> Vec<DmMessage> {
        let mut msgs: Vec<DmMessage> = self.messages.values().cloned().collect();
        msgs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        msgs
    }

    pub fn is_hidden(&self, message_id: &str) -> bool {
        self.hidden.contains(message_id)
    }

    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.messages.values().map(|m| m.timestamp).min()
    }

    fn recompute_last_message(&mut self) {
        self.last_message_id = self
            .messages
            .values()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
            .map(|m| m.id.clone());
    }

    fn insert(&mut self, message: DmMessage) {
        if message.direction == Direction::Incoming && !message.read {
            self.unread_count += 1;
        }
        self.has_legacy_messages |= message.scheme == Scheme::Legacy;
        self.messages.insert(message.id.clone(), message);
        self.recompute_last_message();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Same `(peer, id)` already present; delivery from another relay or an
    /// overlapping backfill query. Idempotently ignored.
    Duplicate,
    /// `peer` equals the local identity. Self-chats are rejected outright.
    RejectedSelfChat,
}

/// Map from peer identity to conversation, owned by the core actor.
///
/// Mutations read the current map, build the changed copy, then publish it as
/// a new `Arc` snapshot. The read-modify-publish section contains no await
/// point; the actor serializes all mutations.
pub struct ChatStore {
    local: PublicKey,
    chats: Arc<HashMap<PublicKey, Chat>>,
}

impl ChatStore {
    pub fn new(local: PublicKey) -> Self {
        Self {
            local,
            chats: Arc::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> Arc<HashMap<PublicKey, Chat>> {
        self.chats.clone()
    }

    pub fn chat(&self, peer: &PublicKey) -> Option<&Chat> {
        self.chats.get(peer)
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    /// Messages of one chat, ascending by timestamp.
    pub fn messages(&self, peer: &PublicKey) -> Vec<DmMessage> {
        self.chats
            .get(peer)
            .map(|c| c.sorted_messages())
            .unwrap_or_default()
    }

    pub fn add_message(&mut self, message: DmMessage) -> AddOutcome {
        if message.peer == self.local {
            return AddOutcome::RejectedSelfChat;
        }
        if let Some(chat) = self.chats.get(&message.peer) {
            if chat.contains(&message.id) {
                return AddOutcome::Duplicate;
            }
        }

        let mut next = (*self.chats).clone();
        next.entry(message.peer)
            .or_insert_with(|| Chat::new(message.peer))
            .insert(message);
        self.chats = Arc::new(next);
        AddOutcome::Added
    }

    /// Local-only removal. Relay-held copies are untouched, and for
    /// gift-wrapped messages there is no protocol-level deletion to request.
    pub fn delete_message(&mut self, peer: &PublicKey, message_id: &str) -> bool {
        let Some(chat) = self.chats.get(peer) else {
            return false;
        };
        if !chat.contains(message_id) {
            return false;
        }

        let mut next = (*self.chats).clone();
        let chat = next.get_mut(peer).expect("chat present in snapshot");
        if let Some(removed) = chat.messages.remove(message_id) {
            if removed.direction == Direction::Incoming && !removed.read {
                chat.unread_count = chat.unread_count.saturating_sub(1);
            }
        }
        chat.hidden.remove(message_id);
        chat.recompute_last_message();
        self.chats = Arc::new(next);
        true
    }

    /// Returns false when the chat was already fully read (no-op).
    pub fn mark_chat_read(&mut self, peer: &PublicKey) -> bool {
        let Some(chat) = self.chats.get(peer) else {
            return false;
        };
        if chat.unread_count == 0 && chat.messages.values().all(|m| m.read) {
            return false;
        }

        let mut next = (*self.chats).clone();
        let chat = next.get_mut(peer).expect("chat present in snapshot");
        chat.unread_count = 0;
        for msg in chat.messages.values_mut() {
            if msg.direction == Direction::Incoming {
                msg.read = true;
            }
        }
        self.chats = Arc::new(next);
        true
    }

    pub fn mark_all_read(&mut self) {
        let peers: Vec<PublicKey> = self.chats.keys().copied().collect();
        for peer in peers {
            self.mark_chat_read(&peer);
        }
    }

    /// Local visibility toggle, independent of deletion: the message stays
    /// stored and counted, only suppressed from views.
    pub fn set_hidden(&mut self, peer: &PublicKey, message_id: &str, hidden: bool) -> bool {
        let Some(chat) = self.chats.get(peer) else {
            return false;
        };
        if !chat.contains(message_id) || chat.is_hidden(message_id) == hidden {
            return false;
        }

        let mut next = (*self.chats).clone();
        let chat = next.get_mut(peer).expect("chat present in snapshot");
        if hidden {
            chat.hidden.insert(message_id.to_string());
        } else {
            chat.hidden.remove(message_id);
        }
        self.chats = Arc::new(next);
        true
    }

    pub fn is_hidden(&self, peer: &PublicKey, message_id: &str) -> bool {
        self.chats
            .get(peer)
            .map(|c| c.is_hidden(message_id))
            .unwrap_or(false)
    }

    pub fn set_delivery(&mut self, peer: &PublicKey, message_id: &str, delivery: DeliveryState) {
        let Some(chat) = self.chats.get(peer) else {
            return;
        };
        if !chat.contains(message_id) {
            return;
        }

        let mut next = (*self.chats).clone();
        let chat = next.get_mut(peer).expect("chat present in snapshot");
        if let Some(msg) = chat.messages.get_mut(message_id) {
            msg.delivery = delivery;
        }
        self.chats = Arc::new(next);
    }

    /// Rebuilds the map from durable records. Records persisted under an
    /// older scheme-qualified chat key are merged into the plain peer key, so
    /// a peer with mixed-scheme history always ends up as one chat. Returns
    /// the earliest timestamp seen, seeding the pagination watermark.
    pub fn restore(
        &mut self,
        records: Vec<StoredMessage>,
        hidden: &[(String, String)],
    ) -> Option<i64> {
        let mut next: HashMap<PublicKey, Chat> = HashMap::new();
        let mut oldest: Option<i64> = None;

        for record in records {
            let Some(peer) = normalize_chat_key(&record.chat_key) else {
                tracing::warn!(chat_key = %record.chat_key, "skipping record with unparseable chat key");
                continue;
            };
            if peer == self.local {
                continue;
            }
            let mut message = record.message;
            message.peer = peer;
            // Delivery state is transient; whatever was captured mid-send is
            // stale after a restart.
            message.delivery = DeliveryState::Sent;
            oldest = Some(match oldest {
                Some(t) => t.min(message.timestamp),
                None => message.timestamp,
            });
            let chat = next.entry(peer).or_insert_with(|| Chat::new(peer));
            if !chat.contains(&message.id) {
                chat.insert(message);
            }
        }

        for (chat_key, message_id) in hidden {
            let Some(peer) = normalize_chat_key(chat_key) else {
                continue;
            };
            if let Some(chat) = next.get_mut(&peer) {
                if chat.contains(message_id) {
                    chat.hidden.insert(message_id.clone());
                }
            }
        }

        self.chats = Arc::new(next);
        oldest
    }

    pub fn clear(&mut self) {
        self.chats = Arc::new(HashMap::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::Keys;

    fn msg(peer: PublicKey, id: &str, direction: Direction, scheme: Scheme, ts: i64) -> DmMessage {
        DmMessage {
            id: id.to_string(),
            peer,
            timestamp: ts,
            content: format!("message {id}"),
            direction,
            tags: vec![],
            scheme,
            reply_to: None,
            delivery: DeliveryState::Sent,
            read: direction == Direction::Outgoing,
        }
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let local = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut store = ChatStore::new(local);

        let m = msg(peer, "a1", Direction::Incoming, Scheme::GiftWrap, 100);
        assert_eq!(store.add_message(m.clone()), AddOutcome::Added);
        assert_eq!(store.add_message(m), AddOutcome::Duplicate);

        let chat = store.chat(&peer).unwrap();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat.unread_count, 1);
    }

    #[test]
    fn self_chat_is_rejected() {
        let local = Keys::generate().public_key();
        let mut store = ChatStore::new(local);

        let m = msg(local, "a1", Direction::Incoming, Scheme::GiftWrap, 100);
        assert_eq!(store.add_message(m), AddOutcome::RejectedSelfChat);
        assert!(store.is_empty());
    }

    #[test]
    fn unread_counts_incoming_only_until_marked_read() {
        let local = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut store = ChatStore::new(local);

        for i in 0..4 {
            store.add_message(msg(
                peer,
                &format!("in{i}"),
                Direction::Incoming,
                Scheme::GiftWrap,
                100 + i,
            ));
        }
        for i in 0..3 {
            store.add_message(msg(
                peer,
                &format!("out{i}"),
                Direction::Outgoing,
                Scheme::GiftWrap,
                200 + i,
            ));
        }

        assert_eq!(store.chat(&peer).unwrap().unread_count, 4);

        assert!(store.mark_chat_read(&peer));
        let chat = store.chat(&peer).unwrap();
        assert_eq!(chat.unread_count, 0);
        assert!(chat.sorted_messages().iter().all(|m| m.read));

        // Second call is a no-op.
        assert!(!store.mark_chat_read(&peer));
    }

    #[test]
    fn delete_recomputes_last_message_and_unread() {
        let local = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut store = ChatStore::new(local);

        store.add_message(msg(peer, "a", Direction::Incoming, Scheme::GiftWrap, 100));
        store.add_message(msg(peer, "b", Direction::Incoming, Scheme::GiftWrap, 200));
        assert_eq!(
            store.chat(&peer).unwrap().last_message().unwrap().id,
            "b".to_string()
        );

        assert!(store.delete_message(&peer, "b"));
        let chat = store.chat(&peer).unwrap();
        assert_eq!(chat.unread_count, 1);
        assert_eq!(chat.last_message().unwrap().id, "a".to_string());

        assert!(!store.delete_message(&peer, "b"));
    }

    #[test]
    fn hide_is_reversible_and_keeps_message_counted() {
        let local = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut store = ChatStore::new(local);

        store.add_message(msg(peer, "a", Direction::Incoming, Scheme::Legacy, 100));
        assert!(store.set_hidden(&peer, "a", true));
        assert!(store.is_hidden(&peer, "a"));
        assert_eq!(store.chat(&peer).unwrap().len(), 1);
        assert_eq!(store.chat(&peer).unwrap().unread_count, 1);

        assert!(store.set_hidden(&peer, "a", false));
        assert!(!store.is_hidden(&peer, "a"));
    }

    #[test]
    fn restore_merges_scheme_qualified_keys_by_peer() {
        let local = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut store = ChatStore::new(local);

        let records = vec![
            StoredMessage {
                chat_key: format!("{}:legacy", peer.to_hex()),
                message: msg(peer, "old", Direction::Incoming, Scheme::Legacy, 50),
            },
            StoredMessage {
                chat_key: peer.to_hex(),
                message: msg(peer, "new", Direction::Incoming, Scheme::GiftWrap, 150),
            },
        ];

        let hidden = vec![(format!("{}:legacy", peer.to_hex()), "old".to_string())];
        let oldest = store.restore(records, &hidden);
        assert_eq!(oldest, Some(50));
        assert_eq!(store.len(), 1);

        let chat = store.chat(&peer).unwrap();
        assert_eq!(chat.len(), 2);
        assert!(chat.has_legacy_messages);
        assert_eq!(chat.last_message().unwrap().id, "new".to_string());
        assert!(store.is_hidden(&peer, "old"));
    }

    #[test]
    fn snapshot_is_stable_across_mutations() {
        let local = Keys::generate().public_key();
        let peer = Keys::generate().public_key();
        let mut store = ChatStore::new(local);

        store.add_message(msg(peer, "a", Direction::Incoming, Scheme::GiftWrap, 100));
        let before = store.snapshot();
        store.add_message(msg(peer, "b", Direction::Incoming, Scheme::GiftWrap, 200));

        // The earlier snapshot still sees the old map.
        assert_eq!(before.get(&peer).unwrap().len(), 1);
        assert_eq!(store.chat(&peer).unwrap().len(), 2);
    }
}
