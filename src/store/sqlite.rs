// SQLite backend. One database file per data dir; rows are scoped by the
// account pubkey so several identities can share a device.

use std::path::Path;
use std::sync::Mutex;

use nostr_sdk::prelude::PublicKey;
use rusqlite::Connection;

use crate::chat::{Direction, DmMessage};

use super::{DmStorage, StorageError, StoredMessage};

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(data_dir: &str) -> Result<Self, StorageError> {
        let _ = std::fs::create_dir_all(data_dir);
        let path = Path::new(data_dir).join("dm_store.sqlite3");
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                account TEXT NOT NULL,
                chat_key TEXT NOT NULL,
                message_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                direction TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                payload JSONB,
                PRIMARY KEY (account, chat_key, message_id)
            );
            CREATE TABLE IF NOT EXISTS hidden_messages (
                account TEXT NOT NULL,
                chat_key TEXT NOT NULL,
                message_id TEXT NOT NULL,
                PRIMARY KEY (account, chat_key, message_id)
            );
            CREATE TABLE IF NOT EXISTS sync_state (
                account TEXT PRIMARY KEY,
                last_sync_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }
}

impl DmStorage for SqliteStorage {
    fn load_messages(&self, account: &PublicKey) -> Result<Vec<StoredMessage>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT chat_key, payload, read FROM messages WHERE account = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map([account.to_hex()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (chat_key, payload, read) = row?;
            let mut message: DmMessage = serde_json::from_str(&payload)
                .map_err(|e| StorageError::Corrupt(format!("message payload: {e}")))?;
            // The read flag is mutated in place by mark-read without
            // rewriting the payload; the column wins.
            message.read = read != 0;
            out.push(StoredMessage { chat_key, message });
        }
        Ok(out)
    }

    fn save_message(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message: &DmMessage,
    ) -> Result<bool, StorageError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| StorageError::Corrupt(format!("message payload: {e}")))?;
        let direction = match message.direction {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        };
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages
                (account, chat_key, message_id, timestamp, direction, read, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                account.to_hex(),
                chat.to_hex(),
                message.id,
                message.timestamp,
                direction,
                message.read as i64,
                payload,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn delete_message(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message_id: &str,
    ) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM messages WHERE account = ?1 AND chat_key = ?2 AND message_id = ?3",
            rusqlite::params![account.to_hex(), chat.to_hex(), message_id],
        )?;
        conn.execute(
            "DELETE FROM hidden_messages WHERE account = ?1 AND chat_key = ?2 AND message_id = ?3",
            rusqlite::params![account.to_hex(), chat.to_hex(), message_id],
        )?;
        Ok(())
    }

    fn mark_chat_read(&self, account: &PublicKey, chat: &PublicKey) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE messages SET read = 1
             WHERE account = ?1 AND chat_key = ?2 AND direction = 'incoming'",
            rusqlite::params![account.to_hex(), chat.to_hex()],
        )?;
        Ok(())
    }

    fn mark_all_read(&self, account: &PublicKey) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE messages SET read = 1 WHERE account = ?1 AND direction = 'incoming'",
            rusqlite::params![account.to_hex()],
        )?;
        Ok(())
    }

    fn set_hidden(
        &self,
        account: &PublicKey,
        chat: &PublicKey,
        message_id: &str,
        hidden: bool,
    ) -> Result<(), StorageError> {
        let conn = self.lock();
        if hidden {
            conn.execute(
                "INSERT OR IGNORE INTO hidden_messages (account, chat_key, message_id)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![account.to_hex(), chat.to_hex(), message_id],
            )?;
        } else {
            conn.execute(
                "DELETE FROM hidden_messages
                 WHERE account = ?1 AND chat_key = ?2 AND message_id = ?3",
                rusqlite::params![account.to_hex(), chat.to_hex(), message_id],
            )?;
        }
        Ok(())
    }

    fn hidden_messages(&self, account: &PublicKey) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT chat_key, message_id FROM hidden_messages WHERE account = ?1")?;
        let rows = stmt.query_map([account.to_hex()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn checkpoint(&self, account: &PublicKey) -> Result<Option<i64>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT last_sync_at FROM sync_state WHERE account = ?1")?;
        let mut rows = stmt.query([account.to_hex()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set_checkpoint(&self, account: &PublicKey, at: i64) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sync_state (account, last_sync_at) VALUES (?1, ?2)
             ON CONFLICT(account) DO UPDATE SET last_sync_at = excluded.last_sync_at",
            rusqlite::params![account.to_hex(), at],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{DeliveryState, Scheme};
    use nostr_sdk::prelude::Keys;

    fn sample(peer: PublicKey, id: &str, ts: i64, direction: Direction) -> DmMessage {
        DmMessage {
            id: id.to_string(),
            peer,
            timestamp: ts,
            content: format!("body {id}"),
            direction,
            tags: vec![],
            scheme: Scheme::Legacy,
            reply_to: None,
            delivery: DeliveryState::Sent,
            read: direction == Direction::Outgoing,
        }
    }

    #[test]
    fn save_load_roundtrip_and_dedup() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let account = Keys::generate().public_key();
        let peer = Keys::generate().public_key();

        let msg = sample(peer, "m1", 100, Direction::Incoming);
        assert!(store.save_message(&account, &peer, &msg).unwrap());
        assert!(!store.save_message(&account, &peer, &msg).unwrap());

        let loaded = store.load_messages(&account).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].chat_key, peer.to_hex());
        assert_eq!(loaded[0].message, msg);

        // Other accounts see nothing.
        let other = Keys::generate().public_key();
        assert!(store.load_messages(&other).unwrap().is_empty());
    }

    #[test]
    fn mark_read_survives_reload() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let account = Keys::generate().public_key();
        let peer = Keys::generate().public_key();

        store
            .save_message(&account, &peer, &sample(peer, "m1", 100, Direction::Incoming))
            .unwrap();
        store.mark_chat_read(&account, &peer).unwrap();

        let loaded = store.load_messages(&account).unwrap();
        assert!(loaded[0].message.read);
    }

    #[test]
    fn hidden_and_checkpoint_persist() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let account = Keys::generate().public_key();
        let peer = Keys::generate().public_key();

        store
            .save_message(&account, &peer, &sample(peer, "m1", 100, Direction::Incoming))
            .unwrap();
        store.set_hidden(&account, &peer, "m1", true).unwrap();
        store.set_checkpoint(&account, 777).unwrap();

        assert_eq!(
            store.hidden_messages(&account).unwrap(),
            vec![(peer.to_hex(), "m1".to_string())]
        );
        assert_eq!(store.checkpoint(&account).unwrap(), Some(777));

        store.delete_message(&account, &peer, "m1").unwrap();
        assert!(store.hidden_messages(&account).unwrap().is_empty());
        assert!(store.load_messages(&account).unwrap().is_empty());
    }
}
