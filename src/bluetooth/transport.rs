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

//! Bluetooth transport abstraction.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::protocol::Device;

/// Callback invoked with each complete frame read from a device.
pub type ReadCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Trait for the OS Bluetooth capability.
///
/// One session per device id. Implementations own the radio, the scan and the
/// byte streams; they know nothing about chat semantics.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the backend name (for logging).
    fn name(&self) -> &str;

    /// Request the permissions needed to scan and connect.
    async fn request_permissions(&self) -> Result<bool>;

    async fn is_bluetooth_enabled(&self) -> Result<bool>;

    /// Ask for the radio to be turned on. `false` if that was refused.
    async fn request_bluetooth_enabled(&self) -> Result<bool>;

    /// Devices paired at the OS level, independent of any scan.
    async fn bonded_devices(&self) -> Result<Vec<Device>>;

    async fn is_discovering(&self) -> Result<bool>;

    async fn start_discovery(&self) -> Result<()>;

    async fn cancel_discovery(&self) -> Result<()>;

    /// Devices seen by the current or last scan.
    async fn discovered_devices(&self) -> Result<Vec<Device>>;

    /// Open a session. `false` if the device refused without an error.
    async fn connect_to_device(&self, id: &str) -> Result<bool>;

    async fn disconnect_from_device(&self, id: &str) -> Result<()>;

    /// Whether the session with `id` is still alive.
    async fn is_device_connected(&self, id: &str) -> Result<bool>;

    /// Write one serialized frame. Returns the write acknowledgement.
    async fn write_to_device(&self, id: &str, payload: &str) -> Result<bool>;

    /// Register the frame handler for an open session.
    fn on_device_read(&self, id: &str, callback: ReadCallback) -> Result<()>;
}
