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

//! User notifications.

use anyhow::Result;
use tracing::info;

/// Fallback label for peers that never reported a name.
pub const UNKNOWN_DEVICE: &str = "Unknown device";

/// Default number of characters shown in a message preview.
pub const DEFAULT_PREVIEW_CHARS: usize = 50;

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Conversation the notification belongs to, if any.
    pub device_id: Option<String>,
}

impl Notification {
    /// "New message from ..." with a truncated preview.
    pub fn new_message(
        device_name: Option<&str>,
        text: &str,
        device_id: &str,
        preview_chars: usize,
    ) -> Self {
        Self {
            title: format!(
                "New message from {}",
                device_name.unwrap_or(UNKNOWN_DEVICE)
            ),
            body: preview(text, preview_chars),
            device_id: Some(device_id.to_string()),
        }
    }

    pub fn connection(device_name: Option<&str>, connected: bool) -> Self {
        let name = device_name.unwrap_or(UNKNOWN_DEVICE);
        let (title, verb) = if connected {
            ("Device connected", "connected")
        } else {
            ("Device disconnected", "disconnected")
        };
        Self {
            title: title.to_string(),
            body: format!("{} was {}", name, verb),
            device_id: None,
        }
    }
}

/// Shorten `text` to `max_chars` characters, marking the cut with `...`.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Surface for user notifications.
pub trait Notifier: Send + Sync {
    fn show_new_message(&self, device_name: Option<&str>, text: &str, device_id: &str)
        -> Result<()>;

    fn show_connection(&self, device_name: Option<&str>, connected: bool) -> Result<()>;

    fn clear_all(&self) -> Result<()>;
}

/// Notifier that only writes to the log. Used when no tray is available.
pub struct LogNotifier {
    preview_chars: usize,
}

impl LogNotifier {
    pub fn new(preview_chars: usize) -> Self {
        Self { preview_chars }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_CHARS)
    }
}

impl Notifier for LogNotifier {
    fn show_new_message(
        &self,
        device_name: Option<&str>,
        text: &str,
        device_id: &str,
    ) -> Result<()> {
        let n = Notification::new_message(device_name, text, device_id, self.preview_chars);
        info!("[NOTIFY] {}: {}", n.title, n.body);
        Ok(())
    }

    fn show_connection(&self, device_name: Option<&str>, connected: bool) -> Result<()> {
        let n = Notification::connection(device_name, connected);
        info!("[NOTIFY] {}: {}", n.title, n.body);
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        info!("[NOTIFY] cleared");
        Ok(())
    }
}
