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

//! Application context.
//!
//! Builds exactly one connection core for the process and hangs the
//! watchdog, presentation state, persistence and notifications off it.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{ChatMessage, ConnectionCore, Device, SenderTag, Transport};
use crate::config::Config;
use crate::error::Result as ChatResult;
use crate::events::{listener, ConnectionEvent, EventBus, MessageEvent};
use crate::notifications::Notifier;
use crate::state::AppState;
use crate::storage::MessageStore;
use crate::watchdog::{Lifecycle, Watchdog};

/// Work for the persistence worker.
enum PersistJob {
    Message { device_id: String, message: ChatMessage },
    Device(Device),
    /// Resolved once every job queued before it is done.
    Flush(oneshot::Sender<()>),
}

pub struct AppContext {
    pub config: Config,
    pub core: Arc<ConnectionCore>,
    pub watchdog: Arc<Watchdog>,
    pub store: Arc<dyn MessageStore>,
    pub notifier: Arc<dyn Notifier>,
    pub state: Arc<AppState>,
    persist_tx: async_channel::Sender<PersistJob>,
    worker: JoinHandle<()>,
}

impl AppContext {
    /// Wire everything together. Must run inside a tokio runtime.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn Notifier>,
        state: Arc<AppState>,
    ) -> Self {
        let core = ConnectionCore::new(
            transport,
            Arc::new(EventBus::new()),
            config.chat.max_text_len,
        );
        let watchdog = Watchdog::new(core.clone(), notifier.clone(), config.watchdog.clone());

        let (persist_tx, persist_rx) = async_channel::unbounded();
        let worker = tokio::spawn(persistence_worker(store.clone(), persist_rx));

        let ctx = Self {
            config,
            core,
            watchdog,
            store,
            notifier,
            state,
            persist_tx,
            worker,
        };
        ctx.register_observers();
        ctx
    }

    fn register_observers(&self) {
        // Presentation state first so the UI never lags behind side effects
        let state = self.state.clone();
        let store = self.store.clone();
        self.core
            .add_connection_listener(listener(move |event: &ConnectionEvent| {
                let history = match (&event.device, event.connected) {
                    (Some(device), true) => store.get_messages(&device.id).unwrap_or_else(|e| {
                        warn!("Could not load conversation: {:#}", e);
                        Vec::new()
                    }),
                    _ => Vec::new(),
                };
                state.apply_connection(event, history);
                Ok(())
            }));

        let state = self.state.clone();
        self.core
            .add_message_listener(listener(move |event: &MessageEvent| {
                state.apply_message(event);
                Ok(())
            }));

        // Persistence is queued, never awaited
        let tx = self.persist_tx.clone();
        self.core
            .add_message_listener(listener(move |event: &MessageEvent| {
                tx.try_send(PersistJob::Message {
                    device_id: event.device.id.clone(),
                    message: event.message.clone(),
                })
                .map_err(|e| anyhow!("persistence queue closed: {}", e))
            }));

        let tx = self.persist_tx.clone();
        self.core
            .add_connection_listener(listener(move |event: &ConnectionEvent| {
                match (&event.device, event.connected) {
                    (Some(device), true) => tx
                        .try_send(PersistJob::Device(device.clone()))
                        .map_err(|e| anyhow!("persistence queue closed: {}", e)),
                    _ => Ok(()),
                }
            }));

        // New-message notifications while in the background. Connection
        // notifications come from the watchdog alone.
        if self.config.notifications.enabled {
            let watchdog: Weak<Watchdog> = Arc::downgrade(&self.watchdog);
            let notifier = self.notifier.clone();
            self.core
                .add_message_listener(listener(move |event: &MessageEvent| {
                    let in_background = watchdog
                        .upgrade()
                        .map(|w| w.is_in_background())
                        .unwrap_or(false);
                    if event.message.sender != SenderTag::Peer || !in_background {
                        return Ok(());
                    }
                    notifier.show_new_message(
                        event.device.name.as_deref(),
                        &event.message.text,
                        &event.device.id,
                    )
                }));
        }
    }

    /// Connect on behalf of the user, recording the outcome in the state.
    pub async fn connect(&self, device: Device) -> ChatResult<()> {
        let already = self
            .core
            .connection_status()
            .connected_device
            .is_some_and(|active| active.id == device.id);
        if already {
            // The core emits nothing for this, so leave the state alone
            debug!("Already connected to {}", device.id);
            return Ok(());
        }

        self.state.set_connecting(&device);
        match self.core.connect(device).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.set_connect_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Send on behalf of the user, recording failures in the state.
    pub async fn send(&self, text: &str) -> ChatResult<bool> {
        let result = self.core.send(text).await;
        if let Err(ref e) = result {
            self.state.set_error(e.to_string());
        }
        result
    }

    pub fn set_lifecycle(&self, phase: Lifecycle) {
        self.state.set_lifecycle(phase);
        self.watchdog.set_lifecycle(phase);
    }

    /// Wait until everything queued for storage so far has been written.
    pub async fn flush_persistence(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.persist_tx
            .send(PersistJob::Flush(done_tx))
            .await
            .map_err(|_| anyhow!("persistence worker stopped"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("persistence worker stopped"))
    }

    /// Disconnect, drain the persistence queue and stop the worker.
    pub async fn shutdown(self) {
        self.watchdog.set_lifecycle(Lifecycle::Foreground);
        self.core.disconnect().await;

        if let Err(e) = self.flush_persistence().await {
            warn!("Persistence not flushed: {:#}", e);
        }
        self.persist_tx.close();
        if let Err(e) = self.worker.await {
            error!("Persistence worker failed: {}", e);
        }
        info!("Application context shut down");
    }
}

async fn persistence_worker(
    store: Arc<dyn MessageStore>,
    jobs: async_channel::Receiver<PersistJob>,
) {
    while let Ok(job) = jobs.recv().await {
        match job {
            PersistJob::Message { device_id, message } => {
                match store.save_message(&device_id, &message) {
                    Ok(saved) => debug!("Stored message {:?} for {}", saved.id, device_id),
                    Err(e) => error!("Failed to store message for {}: {:#}", device_id, e),
                }
            }
            PersistJob::Device(device) => {
                if let Err(e) = store.save_known_device(&device) {
                    error!("Failed to store device {}: {:#}", device.id, e);
                }
            }
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Persistence worker stopped");
}
