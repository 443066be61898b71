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

//! Application state management.
//!
//! What the presentation layer renders. Updated from core events, never
//! the other way around.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::{ChatMessage, Device, SenderTag};
use crate::events::{ConnectionEvent, MessageEvent};
use crate::watchdog::Lifecycle;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped without an explicit disconnect.
    Lost,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting...",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Lost => "Connection lost",
        }
    }

    pub fn icon_name(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "network-offline",
            ConnectionStatus::Connecting => "network-idle",
            ConnectionStatus::Connected => "network-transmit-receive",
            ConnectionStatus::Lost => "network-error",
        }
    }
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    status: RwLock<ConnectionStatus>,

    /// Connected (or last lost) device.
    device: RwLock<Option<Device>>,

    /// Messages of the current conversation, oldest first.
    conversation: RwLock<Vec<ChatMessage>>,

    /// Peer messages received while in the background.
    unread: RwLock<usize>,

    lifecycle: RwLock<Lifecycle>,

    /// Last error worth showing to the user.
    last_error: RwLock<Option<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            status: RwLock::new(ConnectionStatus::Disconnected),
            device: RwLock::new(None),
            conversation: RwLock::new(Vec::new()),
            unread: RwLock::new(0),
            lifecycle: RwLock::new(Lifecycle::Foreground),
            last_error: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A user-initiated connect is in flight.
    pub fn set_connecting(&self, device: &Device) {
        *self.status.write() = ConnectionStatus::Connecting;
        *self.device.write() = Some(device.clone());
        *self.last_error.write() = None;
    }

    /// Apply a connection event.
    ///
    /// `history` is the stored conversation with the newly connected peer.
    pub fn apply_connection(&self, event: &ConnectionEvent, history: Vec<ChatMessage>) {
        match (event.connected, &event.device) {
            (true, Some(device)) => {
                *self.status.write() = ConnectionStatus::Connected;
                *self.device.write() = Some(device.clone());
                *self.conversation.write() = history;
                *self.last_error.write() = None;
            }
            (false, Some(device)) => {
                *self.status.write() = ConnectionStatus::Lost;
                *self.device.write() = Some(device.clone());
            }
            _ => {
                *self.status.write() = ConnectionStatus::Disconnected;
                *self.device.write() = None;
            }
        }
    }

    /// Apply a message event for the current conversation.
    pub fn apply_message(&self, event: &MessageEvent) {
        let current = self
            .device
            .read()
            .as_ref()
            .map(|d| d.id == event.device.id)
            .unwrap_or(false);
        if !current {
            return;
        }

        self.conversation.write().push(event.message.clone());

        if event.message.sender == SenderTag::Peer
            && *self.lifecycle.read() == Lifecycle::Background
        {
            *self.unread.write() += 1;
        }
    }

    /// Coming back to the foreground marks everything read.
    pub fn set_lifecycle(&self, phase: Lifecycle) {
        *self.lifecycle.write() = phase;
        if phase == Lifecycle::Foreground {
            *self.unread.write() = 0;
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    /// A failed user-initiated connect.
    pub fn set_connect_failed(&self, message: impl Into<String>) {
        *self.status.write() = ConnectionStatus::Disconnected;
        *self.device.write() = None;
        self.set_error(message);
    }

    pub fn set_conversation(&self, messages: Vec<ChatMessage>) {
        *self.conversation.write() = messages;
    }

    pub fn get_status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn get_device(&self) -> Option<Device> {
        self.device.read().clone()
    }

    pub fn get_device_name(&self) -> Option<String> {
        self.device.read().as_ref().map(|d| d.display_name().to_string())
    }

    pub fn conversation(&self) -> Vec<ChatMessage> {
        self.conversation.read().clone()
    }

    pub fn unread_count(&self) -> usize {
        *self.unread.read()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Device {
        Device::new("00:11:22:33:44:55").with_name("Pixel")
    }

    fn from_peer(text: &str) -> MessageEvent {
        MessageEvent {
            device: peer(),
            message: ChatMessage {
                sender: SenderTag::Peer,
                ..ChatMessage::outgoing(text)
            },
        }
    }

    #[test]
    fn test_connection_transitions() {
        let state = AppState::new();
        assert_eq!(state.get_status(), ConnectionStatus::Disconnected);

        state.set_connecting(&peer());
        assert_eq!(state.get_status(), ConnectionStatus::Connecting);

        state.apply_connection(
            &ConnectionEvent::connected(peer()),
            vec![ChatMessage::outgoing("earlier")],
        );
        assert_eq!(state.get_status(), ConnectionStatus::Connected);
        assert_eq!(state.get_device_name().as_deref(), Some("Pixel"));
        assert_eq!(state.conversation().len(), 1);

        state.apply_connection(&ConnectionEvent::lost(peer()), Vec::new());
        assert_eq!(state.get_status(), ConnectionStatus::Lost);
        assert!(state.get_device().is_some());

        state.apply_connection(&ConnectionEvent::disconnected(), Vec::new());
        assert_eq!(state.get_status(), ConnectionStatus::Disconnected);
        assert!(state.get_device().is_none());
    }

    #[test]
    fn test_unread_only_in_background() {
        let state = AppState::new();
        state.apply_connection(&ConnectionEvent::connected(peer()), Vec::new());

        state.apply_message(&from_peer("seen"));
        assert_eq!(state.unread_count(), 0);

        state.set_lifecycle(Lifecycle::Background);
        state.apply_message(&from_peer("missed"));
        state.apply_message(&MessageEvent {
            device: peer(),
            message: ChatMessage::outgoing("mine"),
        });
        assert_eq!(state.unread_count(), 1);
        assert_eq!(state.conversation().len(), 3);

        state.set_lifecycle(Lifecycle::Foreground);
        assert_eq!(state.unread_count(), 0);
    }

    #[test]
    fn test_messages_for_other_devices_ignored() {
        let state = AppState::new();
        state.apply_connection(&ConnectionEvent::connected(peer()), Vec::new());

        state.apply_message(&MessageEvent {
            device: Device::new("AA:AA:AA:AA:AA:AA"),
            message: ChatMessage::outgoing("stray"),
        });
        assert!(state.conversation().is_empty());
    }

    #[test]
    fn test_connect_failure_records_error() {
        let state = AppState::new();
        state.set_connecting(&peer());
        state.set_connect_failed("Failed to connect");
        assert_eq!(state.get_status(), ConnectionStatus::Disconnected);
        assert_eq!(state.last_error().as_deref(), Some("Failed to connect"));
    }
}
