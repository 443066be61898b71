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

//! BlueZ RFCOMM transport implementation.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bluer::rfcomm::stream::{OwnedReadHalf, OwnedWriteHalf};
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, Address, ErrorKind, Session};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::framing::LineDecoder;
use super::protocol::{Device, SPP_UUID};
use super::transport::{ReadCallback, Transport};
use crate::config::BluetoothConfig;

/// Read buffer size for RFCOMM streams.
const READ_CHUNK: usize = 1024;

/// One open RFCOMM session.
struct Link {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    reader: Option<OwnedReadHalf>,
    read_task: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

/// Transport over the default BlueZ adapter.
pub struct BluezTransport {
    _session: Session,
    adapter: Adapter,
    config: BluetoothConfig,
    max_frame_len: usize,
    links: Mutex<HashMap<String, Link>>,
    scan: Mutex<Option<JoinHandle<()>>>,
    discovered: Arc<Mutex<HashMap<Address, Device>>>,
}

impl BluezTransport {
    /// Open a BlueZ session on the default adapter.
    pub async fn new(config: &BluetoothConfig, max_frame_len: usize) -> Result<Self> {
        info!("Initializing Bluetooth transport...");

        // Create BlueZ session
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        // Get the default adapter
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            config: config.clone(),
            max_frame_len,
            links: Mutex::new(HashMap::new()),
            scan: Mutex::new(None),
            discovered: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn scan_running(&self) -> bool {
        self.scan
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

fn parse_address(id: &str) -> Result<Address> {
    id.parse::<Address>()
        .map_err(|_| anyhow!("Invalid Bluetooth address: {}", id))
}

/// Read the properties we care about from BlueZ.
async fn device_info(adapter: &Adapter, address: Address) -> Result<Device> {
    let device = adapter.device(address)?;
    let uuids = device.uuids().await?.unwrap_or_default();

    Ok(Device {
        id: address.to_string(),
        name: device.name().await?,
        bonded: device.is_paired().await?,
        supports_serial: uuids.contains(&SPP_UUID),
        first_seen: None,
        last_seen: None,
    })
}

/// Scan loop. Discovery stays active for as long as the event stream lives.
async fn scan_loop(
    adapter: Adapter,
    discovered: Arc<Mutex<HashMap<Address, Device>>>,
    require_serial: bool,
) {
    let events = match adapter.discover_devices().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to start discovery: {}", e);
            return;
        }
    };
    pin_mut!(events);

    info!("Discovery started");

    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceAdded(address) => match device_info(&adapter, address).await {
                Ok(device) => {
                    if require_serial && !device.supports_serial {
                        debug!("Skipping {} (no serial port profile)", address);
                        continue;
                    }
                    debug!("Discovered {} ({})", device.display_name(), address);
                    discovered.lock().insert(address, device);
                }
                Err(e) => debug!("Could not read properties of {}: {}", address, e),
            },
            AdapterEvent::DeviceRemoved(address) => {
                discovered.lock().remove(&address);
            }
            _ => {}
        }
    }

    info!("Discovery stream ended");
}

/// Read loop: reassemble frames and hand them to the callback.
async fn read_loop(
    mut reader: OwnedReadHalf,
    callback: ReadCallback,
    alive: Arc<AtomicBool>,
    max_frame_len: usize,
) {
    let mut decoder = LineDecoder::new(max_frame_len);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                // EOF - connection closed
                info!("Connection closed by remote");
                break;
            }
            Ok(n) => {
                for frame in decoder.push(&buf[..n]) {
                    callback(frame);
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
}

#[async_trait]
impl Transport for BluezTransport {
    fn name(&self) -> &str {
        "BlueZ RFCOMM"
    }

    async fn request_permissions(&self) -> Result<bool> {
        // On Linux the D-Bus policy is the permission: probe the adapter.
        match self.adapter.address().await {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind, ErrorKind::NotAuthorized | ErrorKind::NotPermitted) => {
                warn!("Access to Bluetooth adapter denied: {}", e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_bluetooth_enabled(&self) -> Result<bool> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn request_bluetooth_enabled(&self) -> Result<bool> {
        if self.adapter.is_powered().await? {
            return Ok(true);
        }

        if !self.config.auto_enable {
            info!("Adapter is off and auto_enable is disabled");
            return Ok(false);
        }

        // Ensure adapter is powered on
        info!("Powering on Bluetooth adapter...");
        self.adapter.set_powered(true).await?;
        Ok(self.adapter.is_powered().await?)
    }

    async fn bonded_devices(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();

        for address in self.adapter.device_addresses().await? {
            let device = match device_info(&self.adapter, address).await {
                Ok(device) => device,
                Err(e) => {
                    debug!("Could not read properties of {}: {}", address, e);
                    continue;
                }
            };

            if !device.bonded {
                continue;
            }
            if self.config.require_serial_profile && !device.supports_serial {
                continue;
            }
            devices.push(device);
        }

        Ok(devices)
    }

    async fn is_discovering(&self) -> Result<bool> {
        Ok(self.scan_running())
    }

    async fn start_discovery(&self) -> Result<()> {
        let mut scan = self.scan.lock();
        if scan.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return Ok(());
        }

        self.discovered.lock().clear();
        *scan = Some(tokio::spawn(scan_loop(
            self.adapter.clone(),
            self.discovered.clone(),
            self.config.require_serial_profile,
        )));

        Ok(())
    }

    async fn cancel_discovery(&self) -> Result<()> {
        if let Some(task) = self.scan.lock().take() {
            task.abort();
            info!("Discovery cancelled");
        }
        Ok(())
    }

    async fn discovered_devices(&self) -> Result<Vec<Device>> {
        Ok(self.discovered.lock().values().cloned().collect())
    }

    async fn connect_to_device(&self, id: &str) -> Result<bool> {
        let address = parse_address(id)?;
        let target = SocketAddr::new(address, self.config.rfcomm_channel);

        info!(
            "Opening RFCOMM channel {} to {}",
            self.config.rfcomm_channel, address
        );
        let stream = Stream::connect(target)
            .await
            .with_context(|| format!("RFCOMM connect to {} failed", address))?;

        let (reader, writer) = stream.into_split();
        let link = Link {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            reader: Some(reader),
            read_task: None,
            alive: Arc::new(AtomicBool::new(true)),
        };

        // Replacing an old link drops it, which stops its reader.
        self.links.lock().insert(id.to_string(), link);
        Ok(true)
    }

    async fn disconnect_from_device(&self, id: &str) -> Result<()> {
        let link = self.links.lock().remove(id);

        match link {
            Some(link) => {
                link.alive.store(false, Ordering::SeqCst);
                let writer = link.writer.clone();
                drop(link);

                let mut writer = writer.lock().await;
                writer.shutdown().await?;
                info!("RFCOMM session with {} closed", id);
                Ok(())
            }
            None => {
                debug!("No session with {} to close", id);
                Ok(())
            }
        }
    }

    async fn is_device_connected(&self, id: &str) -> Result<bool> {
        Ok(self
            .links
            .lock()
            .get(id)
            .map(|link| link.alive.load(Ordering::SeqCst))
            .unwrap_or(false))
    }

    async fn write_to_device(&self, id: &str, payload: &str) -> Result<bool> {
        let (writer, alive) = {
            let links = self.links.lock();
            let link = links
                .get(id)
                .ok_or_else(|| anyhow!("No session with {}", id))?;
            (link.writer.clone(), link.alive.clone())
        };

        let mut writer = writer.lock().await;
        let result = async {
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                debug!("Wrote {} bytes to {}", payload.len(), id);
                Ok(true)
            }
            Err(e) => {
                alive.store(false, Ordering::SeqCst);
                Err(anyhow!("Write to {} failed: {}", id, e))
            }
        }
    }

    fn on_device_read(&self, id: &str, callback: ReadCallback) -> Result<()> {
        let mut links = self.links.lock();
        let link = links
            .get_mut(id)
            .ok_or_else(|| anyhow!("No session with {}", id))?;
        let reader = link
            .reader
            .take()
            .ok_or_else(|| anyhow!("Read handler already registered for {}", id))?;

        link.read_task = Some(tokio::spawn(read_loop(
            reader,
            callback,
            link.alive.clone(),
            self.max_frame_len,
        )));

        Ok(())
    }
}
