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

//! Storage module for known devices and conversation history.

mod sqlite;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bluetooth::{ChatMessage, Device};

pub use sqlite::SqliteStore;

/// Per-device message counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total_messages: usize,
    pub my_messages: usize,
    pub their_messages: usize,
    /// Timestamp of the oldest message.
    pub first_message: Option<DateTime<Utc>>,
    /// Timestamp of the newest message.
    pub last_message: Option<DateTime<Utc>>,
}

/// Backup of everything in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportData {
    /// Absent in partial backups; the device list is then left untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<Device>>,
    /// Messages keyed by device id, in insertion order.
    pub conversations: BTreeMap<String, Vec<ChatMessage>>,
}

impl ExportData {
    pub fn device_count(&self) -> usize {
        self.devices.as_ref().map_or(0, Vec::len)
    }
}

/// Persistence for known devices and their message logs.
///
/// Messages are append-only per device and come back in insertion order.
pub trait MessageStore: Send + Sync {
    /// Append a message. Returns it with the storage id filled in.
    fn save_message(&self, device_id: &str, message: &ChatMessage) -> Result<ChatMessage>;

    fn get_messages(&self, device_id: &str) -> Result<Vec<ChatMessage>>;

    fn clear_messages(&self, device_id: &str) -> Result<()>;

    fn get_known_devices(&self) -> Result<Vec<Device>>;

    /// Insert or update a device, stamping `first_seen` on insert and
    /// `last_seen` every time.
    fn save_known_device(&self, device: &Device) -> Result<Device>;

    /// Forget a device and its conversation. Returns whether it was known.
    fn remove_known_device(&self, device_id: &str) -> Result<bool>;

    fn get_conversation_stats(&self, device_id: &str) -> Result<ConversationStats>;

    fn export_data(&self) -> Result<ExportData>;

    /// Replace the device list, if `data` carries one, and every
    /// conversation present in `data`.
    fn import_data(&self, data: &ExportData) -> Result<()>;

    fn clear_all_data(&self) -> Result<()>;
}
