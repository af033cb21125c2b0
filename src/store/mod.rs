// Durable mirror of chat state, scoped per account. The in-memory map stays
// authoritative for a running session; this layer exists so restarts replay
// the same conversations and so incremental sync has a checkpoint to start
// from.

mod memory;
mod sqlite;

use nostr_sdk::prelude::PublicKey;
use thiserror::Error;

use crate::chat::DmMessage;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// One persisted message under its raw chat key. The key is normally the
/// peer's hex pubkey; older databases used a scheme-qualified composite
/// (`<hex>:legacy` / `<hex>:giftwrap`), which loaders merge by peer.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub chat_key: String,
    pub message: DmMessage,
}

/// Resolve a raw stored chat key to the peer identity. Accepts both the
/// current plain-hex layout and the legacy scheme-qualified composite.
pub fn normalize_chat_key(raw: &str) -> Option<PublicKey> {
    let hex = raw.split(':').next().unwrap_or(raw);
    PublicKey::from_hex(hex).ok()
}

pub trait DmStorage: Send + Sync {
    /// Every message stored for the account, raw chat keys included.
    fn load_messages(&self, account: &PublicKey) -> Result<Vec<StoredMessage>, StorageError>;

    /// Write-through save. Returns false if the id already exists under the
    /// chat; checked against storage, not memory, so a restart mid-sync does
    /// not duplicate rows.
    fn save_message(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message: &DmMessage,
    ) -> Result<bool, StorageError>;

    fn delete_message(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message_id: &str,
    ) -> Result<(), StorageError>;

    fn mark_chat_read(&self, account: &PublicKey, chat: &PublicKey) -> Result<(), StorageError>;

    fn mark_all_read(&self, account: &PublicKey) -> Result<(), StorageError>;

    fn set_hidden(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message_id: &str,
        hidden: bool,
    ) -> Result<(), StorageError>;

    /// `(chat_key, message_id)` pairs the user chose to hide locally.
    fn hidden_messages(&self, account: &PublicKey) -> Result<Vec<(String, String)>, StorageError>;

    /// Last-successful-sync timestamp, bounding incremental refresh queries.
    fn checkpoint(&self, account: &PublicKey) -> Result<Option<i64>, StorageError>;

    fn set_checkpoint(&self, account: &PublicKey, at: i64) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::Keys;

    #[test]
    fn normalize_accepts_plain_and_composite_keys() {
        let peer = Keys::generate().public_key();
        let hex = peer.to_hex();

        assert_eq!(normalize_chat_key(&hex), Some(peer));
        assert_eq!(normalize_chat_key(&format!("{hex}:legacy")), Some(peer));
        assert_eq!(normalize_chat_key(&format!("{hex}:giftwrap")), Some(peer));
        assert_eq!(normalize_chat_key("garbage"), None);
    }
}
