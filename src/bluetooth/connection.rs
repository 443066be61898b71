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

//! Connection core.
//!
//! Owns the single active session. Connect and disconnect are serialized on
//! one async lock so two callers can never race each other into two
//! sessions; reads of the state are lock-free snapshots.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use super::protocol::{ChatMessage, Device};
use super::transport::{ReadCallback, Transport};
use crate::error::{ChatError, Result};
use crate::events::{ConnectionEvent, EventBus, Listener, MessageEvent};

/// State of the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// A connect is in flight.
    Connecting(Device),
    Connected(Device),
}

impl ConnectionState {
    pub fn device(&self) -> Option<&Device> {
        match self {
            Self::Disconnected => None,
            Self::Connecting(device) | Self::Connected(device) => Some(device),
        }
    }
}

/// Snapshot returned by [`ConnectionCore::connection_status`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub connected_device: Option<Device>,
    /// Peer of a session that dropped without an explicit disconnect.
    pub last_peer: Option<Device>,
}

/// Sole owner of the active Bluetooth session.
///
/// Build exactly one per process and share it behind an `Arc`.
pub struct ConnectionCore {
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    max_text_len: usize,
    state: RwLock<ConnectionState>,
    last_peer: RwLock<Option<Device>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl ConnectionCore {
    pub fn new(transport: Arc<dyn Transport>, events: Arc<EventBus>, max_text_len: usize) -> Arc<Self> {
        info!("Connection core using {} transport", transport.name());
        Arc::new(Self {
            transport,
            events,
            max_text_len,
            state: RwLock::new(ConnectionState::Disconnected),
            last_peer: RwLock::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn max_text_len(&self) -> usize {
        self.max_text_len
    }

    /// Request the OS permission bundle. Adapter errors count as denied.
    pub async fn request_capabilities(&self) -> bool {
        match self.transport.request_permissions().await {
            Ok(granted) => granted,
            Err(e) => {
                error!("Permission request failed: {:#}", e);
                false
            }
        }
    }

    pub async fn is_enabled(&self) -> bool {
        match self.transport.is_bluetooth_enabled().await {
            Ok(enabled) => enabled,
            Err(e) => {
                error!("Could not query Bluetooth state: {:#}", e);
                false
            }
        }
    }

    /// Ask for the radio to be turned on.
    pub async fn enable(&self) -> bool {
        match self.transport.request_bluetooth_enabled().await {
            Ok(enabled) => enabled,
            Err(e) => {
                error!("Could not enable Bluetooth: {:#}", e);
                false
            }
        }
    }

    /// Return bonded devices and make sure a scan for the others is running.
    ///
    /// Scan results are read with [`Self::discovered_devices`].
    pub async fn discover(&self) -> Result<Vec<Device>> {
        let granted = self
            .transport
            .request_permissions()
            .await
            .map_err(ChatError::transport)?;
        if !granted {
            return Err(ChatError::PermissionDenied);
        }

        let enabled = self
            .transport
            .is_bluetooth_enabled()
            .await
            .map_err(ChatError::transport)?;
        if !enabled {
            return Err(ChatError::RadioDisabled);
        }

        let bonded = self
            .transport
            .bonded_devices()
            .await
            .map_err(ChatError::transport)?;

        match self.transport.is_discovering().await {
            Ok(true) => debug!("Scan already running"),
            Ok(false) => {
                if let Err(e) = self.transport.start_discovery().await {
                    warn!("Could not start scan: {:#}", e);
                }
            }
            Err(e) => warn!("Could not query scan state: {:#}", e),
        }

        info!("{} bonded devices", bonded.len());
        Ok(bonded)
    }

    /// Devices found by the current or last scan.
    pub async fn discovered_devices(&self) -> Result<Vec<Device>> {
        self.transport
            .discovered_devices()
            .await
            .map_err(ChatError::transport)
    }

    /// Cancel a running scan. No-op if none is running.
    pub async fn stop_discovery(&self) {
        match self.transport.is_discovering().await {
            Ok(true) => {
                if let Err(e) = self.transport.cancel_discovery().await {
                    warn!("Could not cancel scan: {:#}", e);
                }
            }
            Ok(false) => debug!("No scan to stop"),
            Err(e) => warn!("Could not query scan state: {:#}", e),
        }
    }

    /// Connect to `device`, dropping any session with a different device first.
    pub async fn connect(self: &Arc<Self>, device: Device) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let current = self.state.read().clone();
        match current {
            ConnectionState::Connected(ref active) if active.id == device.id => {
                debug!("Already connected to {}", device.id);
                return Ok(());
            }
            ConnectionState::Connected(ref active) => {
                info!("Switching from {} to {}", active.id, device.id);
                self.teardown().await;
            }
            _ => {}
        }

        *self.state.write() = ConnectionState::Connecting(device.clone());
        info!("Connecting to {} ({})", device.display_name(), device.id);

        let refused = match self.transport.connect_to_device(&device.id).await {
            Ok(true) => None,
            Ok(false) => Some("device refused the connection".to_string()),
            Err(e) => Some(format!("{:#}", e)),
        };
        if let Some(reason) = refused {
            *self.state.write() = ConnectionState::Disconnected;
            warn!("Connection to {} failed: {}", device.id, reason);
            return Err(ChatError::Connection {
                device: device.id,
                reason,
            });
        }

        if let Err(e) = self
            .transport
            .on_device_read(&device.id, self.frame_handler(&device.id))
        {
            if let Err(e) = self.transport.disconnect_from_device(&device.id).await {
                warn!("Teardown after failed setup: {:#}", e);
            }
            *self.state.write() = ConnectionState::Disconnected;
            return Err(ChatError::Connection {
                device: device.id,
                reason: format!("could not register read handler: {:#}", e),
            });
        }

        *self.state.write() = ConnectionState::Connected(device.clone());
        *self.last_peer.write() = Some(device.clone());
        info!("Connected to {}", device.display_name());

        self.events
            .connections()
            .emit(&ConnectionEvent::connected(device));
        Ok(())
    }

    /// Tear down the session, if any. Never fails.
    pub async fn disconnect(&self) {
        let _guard = self.op_lock.lock().await;
        self.teardown().await;
    }

    /// Caller holds `op_lock`.
    async fn teardown(&self) {
        let device = self.state.read().device().cloned();

        if let Some(ref device) = device {
            if let Err(e) = self.transport.disconnect_from_device(&device.id).await {
                warn!("Disconnect from {} failed: {:#}", device.id, e);
            }
            info!("Disconnected from {}", device.id);
        }

        *self.state.write() = ConnectionState::Disconnected;
        *self.last_peer.write() = None;

        self.events
            .connections()
            .emit(&ConnectionEvent::disconnected());
    }

    /// Ask the transport whether the session is still up.
    ///
    /// A dead session moves the core to `Disconnected`, keeps the peer as
    /// `last_peer` and emits `(false, Some(peer))`. Returns whether the link
    /// is up.
    pub async fn check_link(&self) -> bool {
        let _guard = self.op_lock.lock().await;

        let device = match &*self.state.read() {
            ConnectionState::Connected(device) => device.clone(),
            _ => return false,
        };

        match self.transport.is_device_connected(&device.id).await {
            Ok(true) => return true,
            Ok(false) => warn!("Link to {} dropped", device.id),
            Err(e) => warn!("Link check for {} failed: {:#}", device.id, e),
        }

        // Release whatever the transport still holds for the dead session
        if let Err(e) = self.transport.disconnect_from_device(&device.id).await {
            debug!("Cleanup of dead session failed: {:#}", e);
        }

        *self.state.write() = ConnectionState::Disconnected;
        *self.last_peer.write() = Some(device.clone());

        self.events.connections().emit(&ConnectionEvent::lost(device));
        false
    }

    /// Send `text` to the connected peer.
    ///
    /// Returns the transport's write acknowledgement. An acknowledged write is
    /// also emitted as a message event tagged `me`.
    pub async fn send(&self, text: &str) -> Result<bool> {
        let device = match &*self.state.read() {
            ConnectionState::Connected(device) => device.clone(),
            _ => return Err(ChatError::NotConnected),
        };

        if text.len() > self.max_text_len {
            return Err(ChatError::MessageTooLong {
                len: text.len(),
                max: self.max_text_len,
            });
        }

        let message = ChatMessage::outgoing(text);
        let frame = message.to_frame()?;

        let acked = self
            .transport
            .write_to_device(&device.id, &frame)
            .await
            .map_err(ChatError::transport)?;

        if acked {
            debug!("Sent {} bytes to {}", frame.len(), device.id);
            self.events
                .messages()
                .emit(&MessageEvent { device, message });
        } else {
            warn!("Write to {} was not acknowledged", device.id);
        }

        Ok(acked)
    }

    /// Handle one raw frame read from the transport.
    pub fn on_frame_received(&self, raw: &str) {
        self.deliver_frame(None, raw);
    }

    /// `origin` is the session the frame was read on; frames from a session
    /// other than the connected one are dropped.
    fn deliver_frame(&self, origin: Option<&str>, raw: &str) {
        let message = match ChatMessage::from_frame(raw, self.max_text_len) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };

        let device = match &*self.state.read() {
            ConnectionState::Connected(device) => device.clone(),
            _ => {
                debug!("Frame arrived without a session, dropping");
                return;
            }
        };

        if let Some(origin) = origin {
            if origin != device.id {
                debug!("Frame from stale session {} while connected to {}", origin, device.id);
                return;
            }
        }

        self.events
            .messages()
            .emit(&MessageEvent { device, message });
    }

    fn frame_handler(self: &Arc<Self>, device_id: &str) -> ReadCallback {
        let core: Weak<Self> = Arc::downgrade(self);
        let origin = device_id.to_string();
        Arc::new(move |raw: String| {
            if let Some(core) = core.upgrade() {
                core.deliver_frame(Some(&origin), &raw);
            }
        })
    }

    pub fn add_message_listener(&self, listener: Listener<MessageEvent>) {
        self.events.messages().add(listener);
    }

    pub fn remove_message_listener(&self, listener: &Listener<MessageEvent>) {
        self.events.messages().remove(listener);
    }

    pub fn add_connection_listener(&self, listener: Listener<ConnectionEvent>) {
        self.events.connections().add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Listener<ConnectionEvent>) {
        self.events.connections().remove(listener);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let connected_device = match &*self.state.read() {
            ConnectionState::Connected(device) => Some(device.clone()),
            _ => None,
        };
        ConnectionStatus {
            is_connected: connected_device.is_some(),
            connected_device,
            last_peer: self.last_peer.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::memory::{ConnectOutcome, MemoryTransport};
    use crate::bluetooth::protocol::{SenderTag, DEFAULT_MAX_TEXT_LEN};
    use crate::events::listener;
    use parking_lot::Mutex;

    const A: &str = "00:11:22:33:44:55";
    const B: &str = "66:77:88:99:AA:BB";

    fn setup() -> (Arc<MemoryTransport>, Arc<ConnectionCore>) {
        let transport = Arc::new(MemoryTransport::new());
        let core = ConnectionCore::new(
            transport.clone(),
            Arc::new(EventBus::new()),
            DEFAULT_MAX_TEXT_LEN,
        );
        (transport, core)
    }

    fn record_connections(core: &ConnectionCore) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        core.add_connection_listener(listener(move |event: &ConnectionEvent| {
            sink.lock().push(event.clone());
            Ok(())
        }));
        log
    }

    fn record_messages(core: &ConnectionCore) -> Arc<Mutex<Vec<MessageEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        core.add_message_listener(listener(move |event: &MessageEvent| {
            sink.lock().push(event.clone());
            Ok(())
        }));
        log
    }

    #[tokio::test]
    async fn test_switching_devices_disconnects_first() {
        let (transport, core) = setup();
        let events = record_connections(&core);

        core.connect(Device::new(A)).await.unwrap();
        core.connect(Device::new(B)).await.unwrap();

        assert_eq!(core.state(), ConnectionState::Connected(Device::new(B)));
        assert_eq!(
            *events.lock(),
            vec![
                ConnectionEvent::connected(Device::new(A)),
                ConnectionEvent::disconnected(),
                ConnectionEvent::connected(Device::new(B)),
            ]
        );
        assert_eq!(transport.disconnect_calls(), vec![A.to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_same_device_is_noop() {
        let (transport, core) = setup();
        let events = record_connections(&core);

        core.connect(Device::new(A)).await.unwrap();
        core.connect(Device::new(A)).await.unwrap();

        assert_eq!(events.lock().len(), 1);
        assert_eq!(transport.connect_attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let (transport, core) = setup();
        let events = record_connections(&core);
        transport.script_connects([
            ConnectOutcome::Fail("host is down".to_string()),
            ConnectOutcome::Refuse,
        ]);

        let err = core.connect(Device::new(A)).await.unwrap_err();
        assert!(matches!(err, ChatError::Connection { .. }));
        assert!(err.to_string().contains("host is down"));
        assert_eq!(core.state(), ConnectionState::Disconnected);

        let err = core.connect(Device::new(A)).await.unwrap_err();
        assert!(matches!(err, ChatError::Connection { .. }));
        assert_eq!(core.state(), ConnectionState::Disconnected);

        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (transport, core) = setup();

        for text in ["", "hello", "a longer message"] {
            assert!(matches!(core.send(text).await, Err(ChatError::NotConnected)));
        }
        assert!(transport.written().is_empty());
    }

    #[tokio::test]
    async fn test_send_writes_frame_and_emits() {
        let (transport, core) = setup();
        let messages = record_messages(&core);
        core.connect(Device::new(A)).await.unwrap();

        assert!(core.send("hello").await.unwrap());

        let written = transport.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, A);
        assert!(written[0].1.ends_with('\n'));
        assert!(written[0].1.contains("\"sender\":\"me\""));

        let messages = messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.text, "hello");
        assert_eq!(messages[0].message.sender, SenderTag::Me);
    }

    #[tokio::test]
    async fn test_unacknowledged_write_emits_nothing() {
        let (transport, core) = setup();
        let messages = record_messages(&core);
        core.connect(Device::new(A)).await.unwrap();
        transport.set_write_ack(false);

        assert!(!core.send("hello").await.unwrap());
        assert!(messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_text() {
        let (transport, core) = setup();
        core.connect(Device::new(A)).await.unwrap();

        let text = "x".repeat(DEFAULT_MAX_TEXT_LEN + 1);
        assert!(matches!(
            core.send(&text).await,
            Err(ChatError::MessageTooLong { .. })
        ));
        assert!(transport.written().is_empty());
    }

    #[tokio::test]
    async fn test_received_frame_round_trip() {
        let (transport, core) = setup();
        let messages = record_messages(&core);
        core.connect(Device::new(A)).await.unwrap();

        let sent = ChatMessage::outgoing("ping");
        assert!(transport.deliver(A, &sent.to_frame().unwrap()));

        let messages = messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].device.id, A);
        assert_eq!(messages[0].message.text, sent.text);
        assert_eq!(messages[0].message.timestamp, sent.timestamp);
        assert_eq!(messages[0].message.sender, SenderTag::Peer);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (transport, core) = setup();
        let messages = record_messages(&core);
        core.connect(Device::new(A)).await.unwrap();

        transport.deliver(A, "{broken");
        transport.deliver(A, r#"{"text":"ok"}"#);

        assert_eq!(messages.lock().len(), 1);
        assert!(core.connection_status().is_connected);
    }

    #[tokio::test]
    async fn test_disconnect_survives_transport_error() {
        let (transport, core) = setup();
        let events = record_connections(&core);
        core.connect(Device::new(A)).await.unwrap();
        transport.set_fail_disconnect(true);

        core.disconnect().await;

        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert_eq!(events.lock().last(), Some(&ConnectionEvent::disconnected()));
        assert_eq!(core.connection_status().last_peer, None);
    }

    #[tokio::test]
    async fn test_check_link_detects_drop() {
        let (transport, core) = setup();
        let events = record_connections(&core);
        core.connect(Device::new(A)).await.unwrap();

        assert!(core.check_link().await);
        transport.drop_link(A);
        assert!(!core.check_link().await);

        let status = core.connection_status();
        assert!(!status.is_connected);
        assert_eq!(status.last_peer, Some(Device::new(A)));
        assert_eq!(events.lock().last(), Some(&ConnectionEvent::lost(Device::new(A))));
    }

    #[tokio::test]
    async fn test_discover_checks_capabilities() {
        let (transport, core) = setup();

        transport.set_permissions(false);
        assert!(matches!(core.discover().await, Err(ChatError::PermissionDenied)));

        transport.set_permissions(true);
        transport.set_radio(false, false);
        assert!(matches!(core.discover().await, Err(ChatError::RadioDisabled)));
        assert!(!core.enable().await);

        transport.set_radio(false, true);
        assert!(core.enable().await);
        assert!(core.discover().await.is_ok());
    }

    #[tokio::test]
    async fn test_discover_starts_scan_once() {
        let transport = Arc::new(
            MemoryTransport::new().with_bonded(vec![Device::new(A).bonded(true)]),
        );
        let core = ConnectionCore::new(
            transport.clone(),
            Arc::new(EventBus::new()),
            DEFAULT_MAX_TEXT_LEN,
        );

        assert_eq!(core.discover().await.unwrap().len(), 1);
        core.discover().await.unwrap();
        assert_eq!(transport.start_discovery_calls(), 1);

        transport.add_discovered(Device::new(B));
        assert_eq!(core.discovered_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_discovery_when_idle_is_noop() {
        let (transport, core) = setup();

        core.stop_discovery().await;
        assert_eq!(transport.cancel_discovery_calls(), 0);

        core.discover().await.unwrap();
        core.stop_discovery().await;
        assert_eq!(transport.cancel_discovery_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_never_overlap() {
        let (transport, core) = setup();
        let events = record_connections(&core);

        let (first, second) = tokio::join!(
            core.connect(Device::new(A)),
            core.connect(Device::new(B))
        );
        assert!(first.is_ok());
        assert!(second.is_ok());

        // One session at the end, and never two open at once along the way
        let connected = core.connection_status().connected_device;
        assert!(connected.is_some());
        assert_eq!(core.state(), ConnectionState::Connected(connected.clone().unwrap()));

        let events = events.lock().clone();
        let mut open = 0;
        for event in &events {
            if event.connected {
                open += 1;
            } else {
                open = 0;
            }
            assert!(open <= 1, "two sessions open at once: {:?}", events);
        }

        let opened = events.iter().filter(|e| e.connected).count();
        assert_eq!(opened, 2);
        assert_eq!(transport.disconnect_calls().len(), opened - 1);
        assert_eq!(transport.connect_attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_frames_from_previous_session_are_dropped() {
        let (transport, core) = setup();
        let messages = record_messages(&core);

        core.connect(Device::new(A)).await.unwrap();
        let stale = transport.read_handler(A).unwrap();
        core.connect(Device::new(B)).await.unwrap();

        // A's read loop still running after the switch
        stale(r#"{"text":"late from A"}"#.to_string());
        assert!(messages.lock().is_empty());

        transport.deliver(B, r#"{"text":"from B"}"#);
        let messages = messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].device.id, B);
    }

    #[tokio::test]
    async fn test_remove_unregistered_listener_is_noop() {
        let (_transport, core) = setup();
        let stranger = listener(|_: &MessageEvent| Ok(()));
        core.remove_message_listener(&stranger);
        assert!(core.events().messages().is_empty());
    }
}
