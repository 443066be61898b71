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

//! In-memory transport for running without a radio.
//!
//! Connect outcomes are scripted, writes are recorded and inbound frames are
//! injected with [`MemoryTransport::deliver`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::info;

use super::protocol::Device;
use super::transport::{ReadCallback, Transport};

/// Scripted result of one `connect_to_device` call.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Accept,
    /// The device refused without an adapter error.
    Refuse,
    /// The adapter raised an error.
    Fail(String),
}

struct Session {
    alive: bool,
    callback: Option<ReadCallback>,
}

struct MemoryState {
    permissions: bool,
    enabled: bool,
    allow_enable: bool,
    bonded: Vec<Device>,
    discovered: Vec<Device>,
    discovering: bool,
    start_discovery_calls: usize,
    cancel_discovery_calls: usize,
    connect_script: VecDeque<ConnectOutcome>,
    connect_attempts: Vec<String>,
    disconnect_calls: Vec<String>,
    fail_disconnect: bool,
    write_ack: bool,
    written: Vec<(String, String)>,
    sessions: HashMap<String, Session>,
}

/// Transport backed by plain memory.
pub struct MemoryTransport {
    inner: Mutex<MemoryState>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Permissions granted, radio on, every connect accepted.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                permissions: true,
                enabled: true,
                allow_enable: true,
                bonded: Vec::new(),
                discovered: Vec::new(),
                discovering: false,
                start_discovery_calls: 0,
                cancel_discovery_calls: 0,
                connect_script: VecDeque::new(),
                connect_attempts: Vec::new(),
                disconnect_calls: Vec::new(),
                fail_disconnect: false,
                write_ack: true,
                written: Vec::new(),
                sessions: HashMap::new(),
            }),
        }
    }

    pub fn with_bonded(self, devices: Vec<Device>) -> Self {
        self.inner.lock().bonded = devices;
        self
    }

    pub fn set_permissions(&self, granted: bool) {
        self.inner.lock().permissions = granted;
    }

    /// Set the radio state and whether a request to enable it succeeds.
    pub fn set_radio(&self, enabled: bool, allow_enable: bool) {
        let mut inner = self.inner.lock();
        inner.enabled = enabled;
        inner.allow_enable = allow_enable;
    }

    /// Queue connect outcomes; once drained every connect is accepted.
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.inner.lock().connect_script.extend(outcomes);
    }

    pub fn connect_attempts(&self) -> Vec<String> {
        self.inner.lock().connect_attempts.clone()
    }

    pub fn disconnect_calls(&self) -> Vec<String> {
        self.inner.lock().disconnect_calls.clone()
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.inner.lock().fail_disconnect = fail;
    }

    pub fn set_write_ack(&self, ack: bool) {
        self.inner.lock().write_ack = ack;
    }

    /// Every `(device id, payload)` written so far.
    pub fn written(&self) -> Vec<(String, String)> {
        self.inner.lock().written.clone()
    }

    /// Simulate a scan result.
    pub fn add_discovered(&self, device: Device) {
        self.inner.lock().discovered.push(device);
    }

    pub fn start_discovery_calls(&self) -> usize {
        self.inner.lock().start_discovery_calls
    }

    pub fn cancel_discovery_calls(&self) -> usize {
        self.inner.lock().cancel_discovery_calls
    }

    /// Silently kill the session, as an out-of-range peer would.
    pub fn drop_link(&self, id: &str) {
        if let Some(session) = self.inner.lock().sessions.get_mut(id) {
            session.alive = false;
        }
    }

    /// The read handler registered for `id`, if any.
    pub fn read_handler(&self, id: &str) -> Option<ReadCallback> {
        self.inner
            .lock()
            .sessions
            .get(id)
            .and_then(|session| session.callback.clone())
    }

    /// Feed a raw frame to the registered read handler.
    ///
    /// Returns `false` if no live session with a handler exists.
    pub fn deliver(&self, id: &str, raw: &str) -> bool {
        let callback = {
            let inner = self.inner.lock();
            match inner.sessions.get(id) {
                Some(session) if session.alive => session.callback.clone(),
                _ => None,
            }
        };

        // Invoke outside the lock so the handler may call back into us
        match callback {
            Some(callback) => {
                callback(raw.to_string());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "Memory"
    }

    async fn request_permissions(&self) -> Result<bool> {
        Ok(self.inner.lock().permissions)
    }

    async fn is_bluetooth_enabled(&self) -> Result<bool> {
        Ok(self.inner.lock().enabled)
    }

    async fn request_bluetooth_enabled(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.allow_enable {
            inner.enabled = true;
        }
        Ok(inner.enabled)
    }

    async fn bonded_devices(&self) -> Result<Vec<Device>> {
        Ok(self.inner.lock().bonded.clone())
    }

    async fn is_discovering(&self) -> Result<bool> {
        Ok(self.inner.lock().discovering)
    }

    async fn start_discovery(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.discovering = true;
        inner.start_discovery_calls += 1;
        Ok(())
    }

    async fn cancel_discovery(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.discovering = false;
        inner.cancel_discovery_calls += 1;
        Ok(())
    }

    async fn discovered_devices(&self) -> Result<Vec<Device>> {
        Ok(self.inner.lock().discovered.clone())
    }

    async fn connect_to_device(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.connect_attempts.push(id.to_string());

        match inner.connect_script.pop_front().unwrap_or(ConnectOutcome::Accept) {
            ConnectOutcome::Accept => {
                inner.sessions.insert(
                    id.to_string(),
                    Session {
                        alive: true,
                        callback: None,
                    },
                );
                info!("[MEMORY] Connected to {}", id);
                Ok(true)
            }
            ConnectOutcome::Refuse => Ok(false),
            ConnectOutcome::Fail(reason) => Err(anyhow!(reason)),
        }
    }

    async fn disconnect_from_device(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.disconnect_calls.push(id.to_string());
        inner.sessions.remove(id);
        if inner.fail_disconnect {
            return Err(anyhow!("teardown failed for {}", id));
        }
        Ok(())
    }

    async fn is_device_connected(&self, id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .sessions
            .get(id)
            .map(|s| s.alive)
            .unwrap_or(false))
    }

    async fn write_to_device(&self, id: &str, payload: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.sessions.get(id) {
            Some(session) if session.alive => {}
            _ => return Err(anyhow!("no open session with {}", id)),
        }
        inner.written.push((id.to_string(), payload.to_string()));
        Ok(inner.write_ack)
    }

    fn on_device_read(&self, id: &str, callback: ReadCallback) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| anyhow!("no open session with {}", id))?;
        session.callback = Some(callback);
        Ok(())
    }
}
