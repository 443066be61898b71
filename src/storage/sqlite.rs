// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Conversation storage using SQLite.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::info;

use super::{ConversationStats, ExportData, MessageStore};
use crate::bluetooth::{now_millis, ChatMessage, Device, SenderTag};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY,
        name TEXT,
        bonded INTEGER NOT NULL DEFAULT 0,
        supports_serial INTEGER NOT NULL DEFAULT 0,
        first_seen INTEGER,
        last_seen INTEGER
    );
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        text TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        sender TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_device ON messages(device_id, id);
";

/// SQLite-backed [`MessageStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the conversation database in `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("conversations.db");
        info!("Opening conversation database: {:?}", db_path);

        Self::from_connection(Connection::open(&db_path)?)
    }

    /// Database that lives only as long as the store.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Total number of stored messages.
    pub fn message_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(index: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(index, ms))
}

fn opt_from_millis(index: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_millis(index, ms)).transpose()
}

fn message_from_row(row: &Row) -> rusqlite::Result<ChatMessage> {
    let sender: String = row.get(3)?;
    Ok(ChatMessage {
        id: Some(row.get(0)?),
        text: row.get(1)?,
        timestamp: from_millis(2, row.get(2)?)?,
        sender: SenderTag::parse(&sender).unwrap_or(SenderTag::Peer),
    })
}

fn device_from_row(row: &Row) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        bonded: row.get(2)?,
        supports_serial: row.get(3)?,
        first_seen: opt_from_millis(4, row.get(4)?)?,
        last_seen: opt_from_millis(5, row.get(5)?)?,
    })
}

const DEVICE_COLUMNS: &str = "id, name, bonded, supports_serial, first_seen, last_seen";

fn insert_message(conn: &Connection, device_id: &str, message: &ChatMessage) -> Result<i64> {
    conn.execute(
        "INSERT INTO messages (device_id, text, timestamp, sender) VALUES (?1, ?2, ?3, ?4)",
        params![
            device_id,
            message.text,
            to_millis(&message.timestamp),
            message.sender.as_str()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn load_messages(conn: &Connection, device_id: &str) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, text, timestamp, sender
         FROM messages
         WHERE device_id = ?1
         ORDER BY id ASC",
    )?;

    let messages = stmt
        .query_map([device_id], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}

fn load_devices(conn: &Connection) -> Result<Vec<Device>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM devices ORDER BY rowid ASC",
        DEVICE_COLUMNS
    ))?;

    let devices = stmt
        .query_map([], device_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(devices)
}

impl MessageStore for SqliteStore {
    fn save_message(&self, device_id: &str, message: &ChatMessage) -> Result<ChatMessage> {
        let conn = self.conn.lock();
        let id = insert_message(&conn, device_id, message)?;

        let mut saved = message.clone();
        saved.id = Some(id);
        Ok(saved)
    }

    fn get_messages(&self, device_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock();
        load_messages(&conn, device_id)
    }

    fn clear_messages(&self, device_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM messages WHERE device_id = ?1", [device_id])?;
        info!("Cleared {} messages for {}", removed, device_id);
        Ok(())
    }

    fn get_known_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        load_devices(&conn)
    }

    fn save_known_device(&self, device: &Device) -> Result<Device> {
        let conn = self.conn.lock();
        let now = to_millis(&now_millis());

        // A sighting without a name keeps the one we already have
        conn.execute(
            "INSERT INTO devices (id, name, bonded, supports_serial, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = COALESCE(excluded.name, devices.name),
                bonded = excluded.bonded,
                supports_serial = excluded.supports_serial,
                last_seen = excluded.last_seen",
            params![device.id, device.name, device.bonded, device.supports_serial, now],
        )?;

        conn.query_row(
            &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
            [&device.id],
            device_from_row,
        )
        .optional()?
        .ok_or_else(|| anyhow!("Device {} vanished after save", device.id))
    }

    fn remove_known_device(&self, device_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM devices WHERE id = ?1", [device_id])?;
        tx.execute("DELETE FROM messages WHERE device_id = ?1", [device_id])?;
        tx.commit()?;

        info!("Removed device {}", device_id);
        Ok(removed > 0)
    }

    fn get_conversation_stats(&self, device_id: &str) -> Result<ConversationStats> {
        let messages = self.get_messages(device_id)?;

        Ok(ConversationStats {
            total_messages: messages.len(),
            my_messages: messages
                .iter()
                .filter(|m| m.sender == SenderTag::Me)
                .count(),
            their_messages: messages
                .iter()
                .filter(|m| m.sender == SenderTag::Peer)
                .count(),
            first_message: messages.first().map(|m| m.timestamp),
            last_message: messages.last().map(|m| m.timestamp),
        })
    }

    fn export_data(&self) -> Result<ExportData> {
        let conn = self.conn.lock();
        let devices = load_devices(&conn)?;

        let mut data = ExportData::default();
        for device in &devices {
            let messages = load_messages(&conn, &device.id)?;
            data.conversations.insert(device.id.clone(), messages);
        }
        data.devices = Some(devices);

        Ok(data)
    }

    fn import_data(&self, data: &ExportData) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(devices) = &data.devices {
            tx.execute("DELETE FROM devices", [])?;
            for device in devices {
                let first_seen = device.first_seen.as_ref().map(to_millis);
                let last_seen = device.last_seen.as_ref().map(to_millis);
                tx.execute(
                    &format!(
                        "INSERT INTO devices ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        DEVICE_COLUMNS
                    ),
                    params![
                        device.id,
                        device.name,
                        device.bonded,
                        device.supports_serial,
                        first_seen,
                        last_seen
                    ],
                )?;
            }
        }

        for (device_id, messages) in &data.conversations {
            tx.execute("DELETE FROM messages WHERE device_id = ?1", [device_id])?;
            for message in messages {
                insert_message(&tx, device_id, message)?;
            }
        }

        tx.commit()?;
        info!(
            "Imported {} devices and {} conversations",
            data.device_count(),
            data.conversations.len()
        );
        Ok(())
    }

    fn clear_all_data(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DELETE FROM messages; DELETE FROM devices;")?;
        info!("All chat data cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PEER: &str = "00:11:22:33:44:55";

    fn incoming(text: &str) -> ChatMessage {
        ChatMessage {
            sender: SenderTag::Peer,
            ..ChatMessage::outgoing(text)
        }
    }

    #[test]
    fn test_messages_keep_insertion_order() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path()).unwrap();

        let first = store.save_message(PEER, &ChatMessage::outgoing("one")).unwrap();
        store.save_message(PEER, &incoming("two")).unwrap();
        store.save_message("AA:AA:AA:AA:AA:AA", &incoming("elsewhere")).unwrap();
        store.save_message(PEER, &ChatMessage::outgoing("three")).unwrap();

        assert!(first.id.is_some());

        let texts: Vec<_> = store
            .get_messages(PEER)
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_conversation_stats() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(
            store.get_conversation_stats(PEER).unwrap(),
            ConversationStats::default()
        );

        let a = store.save_message(PEER, &ChatMessage::outgoing("a")).unwrap();
        store.save_message(PEER, &incoming("b")).unwrap();
        let c = store.save_message(PEER, &incoming("c")).unwrap();

        let stats = store.get_conversation_stats(PEER).unwrap();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.my_messages, 1);
        assert_eq!(stats.their_messages, 2);
        assert_eq!(stats.first_message, Some(a.timestamp));
        assert_eq!(stats.last_message, Some(c.timestamp));
    }

    #[test]
    fn test_known_device_upsert() {
        let store = SqliteStore::in_memory().unwrap();

        let saved = store
            .save_known_device(&Device::new(PEER).with_name("Pixel"))
            .unwrap();
        assert!(saved.first_seen.is_some());
        assert_eq!(saved.first_seen, saved.last_seen);

        // Seen again without a name
        let again = store.save_known_device(&Device::new(PEER)).unwrap();
        assert_eq!(again.name.as_deref(), Some("Pixel"));
        assert_eq!(again.first_seen, saved.first_seen);
        assert!(again.last_seen >= saved.last_seen);

        assert_eq!(store.get_known_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_device_deletes_conversation() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_known_device(&Device::new(PEER)).unwrap();
        store.save_message(PEER, &incoming("bye")).unwrap();

        assert!(store.remove_known_device(PEER).unwrap());
        assert!(store.get_known_devices().unwrap().is_empty());
        assert!(store.get_messages(PEER).unwrap().is_empty());
        assert!(!store.remove_known_device(PEER).unwrap());
    }

    #[test]
    fn test_export_import() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .save_known_device(&Device::new(PEER).with_name("Pixel"))
            .unwrap();
        store.save_message(PEER, &ChatMessage::outgoing("hello")).unwrap();
        store.save_message(PEER, &incoming("hi")).unwrap();

        let data = store.export_data().unwrap();
        assert_eq!(data.device_count(), 1);
        assert_eq!(data.conversations[PEER].len(), 2);

        // Survives a trip through JSON, as written by /export
        let json = serde_json::to_string(&data).unwrap();
        let parsed: ExportData = serde_json::from_str(&json).unwrap();

        let restored = SqliteStore::in_memory().unwrap();
        restored.import_data(&parsed).unwrap();

        let messages = restored.get_messages(PEER).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[0].sender, SenderTag::Me);
        assert_eq!(messages[1].sender, SenderTag::Peer);
        assert_eq!(restored.get_known_devices().unwrap()[0].name.as_deref(), Some("Pixel"));
    }

    #[test]
    fn test_import_message_without_timestamp() {
        let store = SqliteStore::in_memory().unwrap();
        let data: ExportData = serde_json::from_str(&format!(
            r#"{{"conversations":{{"{}":[{{"text":"old","sender":"other"}}]}}}}"#,
            PEER
        ))
        .unwrap();

        store.import_data(&data).unwrap();
        assert_eq!(store.get_messages(PEER).unwrap()[0].text, "old");
    }

    #[test]
    fn test_import_without_devices_keeps_known_devices() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .save_known_device(&Device::new(PEER).with_name("Pixel"))
            .unwrap();

        let data: ExportData = serde_json::from_str(&format!(
            r#"{{"conversations":{{"{}":[{{"text":"restored","sender":"me"}}]}}}}"#,
            PEER
        ))
        .unwrap();
        assert_eq!(data.devices, None);
        store.import_data(&data).unwrap();

        let devices = store.get_known_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name.as_deref(), Some("Pixel"));
        assert_eq!(store.get_messages(PEER).unwrap()[0].text, "restored");

        // An explicit empty list still replaces the table
        let empty: ExportData = serde_json::from_str(r#"{"devices":[]}"#).unwrap();
        store.import_data(&empty).unwrap();
        assert!(store.get_known_devices().unwrap().is_empty());
    }

    #[test]
    fn test_clear() {
        let store = SqliteStore::in_memory().unwrap();
        store.save_known_device(&Device::new(PEER)).unwrap();
        store.save_message(PEER, &incoming("x")).unwrap();

        store.clear_messages(PEER).unwrap();
        assert!(store.get_messages(PEER).unwrap().is_empty());
        assert_eq!(store.get_known_devices().unwrap().len(), 1);

        store.save_message(PEER, &incoming("y")).unwrap();
        store.clear_all_data().unwrap();
        assert_eq!(store.message_count().unwrap(), 0);
        assert!(store.get_known_devices().unwrap().is_empty());
    }
}
