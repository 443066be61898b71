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

//! Background connection watchdog.
//!
//! While the app is in the background the watchdog polls the link and, when
//! the session has dropped, runs a bounded reconnection sequence with a fixed
//! back-off. Only one sequence runs at a time.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bluetooth::{ConnectionCore, Device};
use crate::config::WatchdogConfig;
use crate::notifications::Notifier;

/// Foreground/background phase of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Foreground,
    Background,
}

/// Snapshot returned by [`Watchdog::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogStatus {
    pub is_in_background: bool,
    /// Periodic poll is scheduled.
    pub has_connection_check: bool,
    /// A reconnection sequence is in flight.
    pub reconnecting: bool,
}

pub struct Watchdog {
    core: Arc<ConnectionCore>,
    notifier: Arc<dyn Notifier>,
    config: WatchdogConfig,
    lifecycle: RwLock<Lifecycle>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
}

impl Watchdog {
    pub fn new(
        core: Arc<ConnectionCore>,
        notifier: Arc<dyn Notifier>,
        config: WatchdogConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            notifier,
            config,
            lifecycle: RwLock::new(Lifecycle::Foreground),
            poll_task: Mutex::new(None),
            reconnect_lock: tokio::sync::Mutex::new(()),
            reconnecting: AtomicBool::new(false),
        })
    }

    /// Switch lifecycle phase.
    ///
    /// Entering the background schedules the periodic check. Returning to the
    /// foreground cancels it and clears notifications; a reconnection already
    /// in flight runs to completion.
    pub fn set_lifecycle(self: &Arc<Self>, phase: Lifecycle) {
        let previous = std::mem::replace(&mut *self.lifecycle.write(), phase);
        if previous != phase {
            info!("Lifecycle: {:?} -> {:?}", previous, phase);
        }

        match phase {
            Lifecycle::Background => self.start_polling(),
            Lifecycle::Foreground => {
                self.stop_polling();
                if let Err(e) = self.notifier.clear_all() {
                    warn!("Failed to clear notifications: {:#}", e);
                }
            }
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    pub fn is_in_background(&self) -> bool {
        self.lifecycle() == Lifecycle::Background
    }

    pub fn status(&self) -> WatchdogStatus {
        WatchdogStatus {
            is_in_background: self.is_in_background(),
            has_connection_check: self
                .poll_task
                .lock()
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false),
            reconnecting: self.reconnecting.load(Ordering::SeqCst),
        }
    }

    fn start_polling(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock();
        if slot.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }

        let period = self.config.poll_interval();
        let weak: Weak<Self> = Arc::downgrade(self);

        *slot = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(watchdog) = weak.upgrade() else {
                    break;
                };
                debug!("Periodic connection check");
                // Detached so cancelling the poll leaves a reconnection running
                tokio::spawn(async move {
                    watchdog.force_connection_check().await;
                });
            }
        }));

        debug!("Connection check scheduled every {:?}", period);
    }

    fn stop_polling(&self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
            debug!("Connection check cancelled");
        }
    }

    /// Check the link now and reconnect to the last peer if it dropped.
    ///
    /// Returns whether a session is up afterwards. A call that arrives while a
    /// reconnection is running waits for it instead of starting another one.
    pub async fn force_connection_check(&self) -> bool {
        if self.core.check_link().await {
            return true;
        }

        let _guard = match self.reconnect_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Reconnection already in progress, waiting for it");
                let _ = self.reconnect_lock.lock().await;
                return self.core.connection_status().is_connected;
            }
        };

        let status = self.core.connection_status();
        if status.is_connected {
            return true;
        }

        match status.last_peer {
            Some(peer) => self.attempt_reconnection(peer).await,
            None => false,
        }
    }

    /// Caller holds `reconnect_lock`.
    async fn attempt_reconnection(&self, device: Device) -> bool {
        self.reconnecting.store(true, Ordering::SeqCst);
        let max_attempts = self.config.max_attempts;
        let mut reconnected = false;

        for attempt in 1..=max_attempts {
            let status = self.core.connection_status();
            if status.is_connected {
                reconnected = true;
                break;
            }
            if status.last_peer.as_ref().map(|p| &p.id) != Some(&device.id) {
                info!("Reconnection to {} abandoned", device.id);
                self.reconnecting.store(false, Ordering::SeqCst);
                return false;
            }

            info!("Reconnection attempt {}/{} to {}", attempt, max_attempts, device.id);
            match self.core.connect(device.clone()).await {
                Ok(()) => {
                    reconnected = true;
                    break;
                }
                Err(e) => warn!("Attempt {} failed: {}", attempt, e),
            }

            if attempt < max_attempts {
                time::sleep(self.config.backoff()).await;
            }
        }

        self.reconnecting.store(false, Ordering::SeqCst);

        if reconnected {
            info!("Reconnected to {}", device.display_name());
        } else {
            error!("All {} reconnection attempts failed", max_attempts);
        }

        if self.is_in_background() {
            if let Err(e) = self
                .notifier
                .show_connection(device.name.as_deref(), reconnected)
            {
                warn!("Failed to show notification: {:#}", e);
            }
        }

        reconnected
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
