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

//! Message protocol definitions and serialization.
//!
//! A frame is one JSON object with exactly `text`, `timestamp` and `sender`,
//! followed by a newline.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// Standard SPP UUID.
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Default upper bound on message text, in bytes.
pub const DEFAULT_MAX_TEXT_LEN: usize = 1024;

/// Frame delimiter on the byte stream.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Largest encoded frame a text of `max_text_len` bytes can produce.
///
/// JSON escaping expands a control character to six bytes.
pub fn max_frame_len(max_text_len: usize) -> usize {
    max_text_len * 6 + 128
}

/// A Bluetooth device known to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Transport address, e.g. `00:11:22:33:44:55`.
    pub id: String,

    /// Display name, if the device reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Paired at the OS Bluetooth stack level.
    #[serde(default)]
    pub bonded: bool,

    /// Advertises the serial port profile.
    #[serde(default)]
    pub supports_serial: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,

    /// Updated on every successful connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            bonded: false,
            supports_serial: false,
            first_seen: None,
            last_seen: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bonded(mut self, bonded: bool) -> Self {
        self.bonded = bonded;
        self
    }

    /// Name if known, otherwise the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Who wrote a message, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderTag {
    #[serde(rename = "me", alias = "self")]
    Me,
    #[serde(rename = "other", alias = "peer")]
    Peer,
}

impl SenderTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Me => "me",
            Self::Peer => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "me" | "self" => Some(Self::Me),
            "other" | "peer" => Some(Self::Peer),
            _ => None,
        }
    }
}

/// A chat message, as exchanged and as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Synthetic id, assigned by storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub text: String,

    /// Set by the sender's clock.
    #[serde(default = "now_millis")]
    pub timestamp: DateTime<Utc>,

    pub sender: SenderTag,
}

/// Outgoing wire shape. Borrowed so serialization never copies the text.
#[derive(Serialize)]
struct WireFrame<'a> {
    text: &'a str,
    timestamp: &'a DateTime<Utc>,
    sender: SenderTag,
}

/// Incoming wire shape. Whatever the peer put in `sender` is ignored.
#[derive(Deserialize)]
struct IncomingFrame {
    text: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Current time at the millisecond precision used on the wire.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl ChatMessage {
    /// Create a message written locally, stamped now.
    pub fn outgoing(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            timestamp: now_millis(),
            sender: SenderTag::Me,
        }
    }

    /// Serialize to a newline-terminated wire frame.
    pub fn to_frame(&self) -> Result<String> {
        let frame = WireFrame {
            text: &self.text,
            timestamp: &self.timestamp,
            sender: self.sender,
        };
        let mut json = serde_json::to_string(&frame)
            .map_err(|e| ChatError::Transport(format!("could not encode frame: {}", e)))?;
        json.push(FRAME_DELIMITER as char);
        Ok(json)
    }

    /// Parse a received frame. The sender tag is always [`SenderTag::Peer`].
    pub fn from_frame(raw: &str, max_text_len: usize) -> Result<Self> {
        let frame: IncomingFrame = serde_json::from_str(raw.trim())
            .map_err(|e| ChatError::FrameParse(e.to_string()))?;

        if frame.text.len() > max_text_len {
            return Err(ChatError::FrameParse(format!(
                "text of {} bytes exceeds {} bytes",
                frame.text.len(),
                max_text_len
            )));
        }

        Ok(Self {
            id: None,
            text: frame.text,
            timestamp: frame.timestamp.unwrap_or_else(now_millis),
            sender: SenderTag::Peer,
        })
    }
}
