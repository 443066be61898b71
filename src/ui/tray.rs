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

//! System tray implementation using ksni.
//!
//! The tray doubles as the notification surface: pending notifications are
//! listed in its menu and its tooltip until cleared.

use anyhow::{bail, Result};
use ksni::{self, menu::StandardItem, Handle, MenuItem, Tray, TrayService};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::notifications::{Notification, Notifier};
use crate::state::{AppState, ConnectionStatus};

/// Notifications shown in the menu at most.
const MAX_MENU_NOTIFICATIONS: usize = 5;

/// Actions that can be triggered from the tray menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrayAction {
    Scan,
    Disconnect,
    ClearNotifications,
    Quit,
}

/// Notifications kept until cleared. Older ones are dropped past this.
const MAX_PENDING_NOTIFICATIONS: usize = 20;

/// Uncleared notifications, newest last, bounded.
#[derive(Default)]
struct PendingNotifications {
    items: Mutex<VecDeque<Notification>>,
}

impl PendingNotifications {
    fn push(&self, notification: Notification) {
        let mut items = self.items.lock();
        items.push_back(notification);
        while items.len() > MAX_PENDING_NOTIFICATIONS {
            items.pop_front();
        }
    }

    fn clear(&self) {
        self.items.lock().clear();
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn latest(&self) -> Option<Notification> {
        self.items.lock().back().cloned()
    }

    /// Up to `n` notifications, newest first.
    fn recent(&self, n: usize) -> Vec<Notification> {
        self.items.lock().iter().rev().take(n).cloned().collect()
    }
}

type Pending = Arc<PendingNotifications>;

/// System tray icon and menu.
pub struct ChatTray {
    state: Arc<AppState>,
    pending: Pending,
    action_tx: mpsc::UnboundedSender<TrayAction>,
}

impl ChatTray {
    fn new(
        state: Arc<AppState>,
        pending: Pending,
        action_tx: mpsc::UnboundedSender<TrayAction>,
    ) -> Self {
        Self {
            state,
            pending,
            action_tx,
        }
    }

    fn status_line(&self) -> String {
        let status = self.state.get_status();
        let device = self
            .state
            .get_device_name()
            .unwrap_or_else(|| "Unknown".to_string());

        match status {
            ConnectionStatus::Connected => format!("● Connected: {}", device),
            ConnectionStatus::Disconnected => "○ Disconnected".to_string(),
            ConnectionStatus::Connecting => format!("◐ Connecting to {}...", device),
            ConnectionStatus::Lost => format!("✕ Lost: {}", device),
        }
    }

    fn action(label: &str, action: TrayAction) -> MenuItem<Self> {
        MenuItem::Standard(StandardItem {
            label: label.to_string(),
            activate: Box::new(move |tray: &mut Self| {
                let _ = tray.action_tx.send(action.clone());
            }),
            ..Default::default()
        })
    }
}

impl Tray for ChatTray {
    fn icon_name(&self) -> String {
        if !self.pending.is_empty() {
            return "mail-unread".to_string();
        }
        self.state.get_status().icon_name().to_string()
    }

    fn title(&self) -> String {
        "BlueChat".to_string()
    }

    fn tool_tip(&self) -> ksni::ToolTip {
        let mut description = self.status_line();

        let unread = self.state.unread_count();
        if unread > 0 {
            description.push_str(&format!("\n{} unread", unread));
        }
        if let Some(latest) = self.pending.latest() {
            description.push_str(&format!("\n{}: {}", latest.title, latest.body));
        }

        ksni::ToolTip {
            icon_name: String::new(),
            icon_pixmap: Vec::new(),
            title: "BlueChat".to_string(),
            description,
        }
    }

    fn menu(&self) -> Vec<MenuItem<Self>> {
        let mut items = vec![];

        // Status header
        items.push(MenuItem::Standard(StandardItem {
            label: self.status_line(),
            enabled: false,
            ..Default::default()
        }));

        let recent = self.pending.recent(MAX_MENU_NOTIFICATIONS);
        if !recent.is_empty() {
            items.push(MenuItem::Separator);
            for n in recent {
                items.push(MenuItem::Standard(StandardItem {
                    label: format!("{}: {}", n.title, n.body),
                    enabled: false,
                    ..Default::default()
                }));
            }
        }

        items.push(MenuItem::Separator);
        items.push(Self::action("Scan for devices", TrayAction::Scan));
        items.push(Self::action("Disconnect", TrayAction::Disconnect));
        items.push(Self::action(
            "Clear notifications",
            TrayAction::ClearNotifications,
        ));

        items.push(MenuItem::Separator);
        items.push(Self::action("Quit", TrayAction::Quit));

        items
    }

    fn id(&self) -> String {
        "bluechat".to_string()
    }

    fn category(&self) -> ksni::Category {
        ksni::Category::Communications
    }
}

/// [`Notifier`] that posts into the tray.
pub struct TrayNotifier {
    handle: Handle<ChatTray>,
    pending: Pending,
    preview_chars: usize,
}

impl TrayNotifier {
    fn post(&self, notification: Notification) {
        info!("[NOTIFY] {}: {}", notification.title, notification.body);
        self.pending.push(notification);
        self.handle.update(|_| {});
    }
}

impl Notifier for TrayNotifier {
    fn show_new_message(
        &self,
        device_name: Option<&str>,
        text: &str,
        device_id: &str,
    ) -> Result<()> {
        self.post(Notification::new_message(
            device_name,
            text,
            device_id,
            self.preview_chars,
        ));
        Ok(())
    }

    fn show_connection(&self, device_name: Option<&str>, connected: bool) -> Result<()> {
        self.post(Notification::connection(device_name, connected));
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        self.pending.clear();
        self.handle.update(|_| {});
        Ok(())
    }
}

/// Handle used to refresh the tray after state changes.
pub struct TrayHandle {
    notifier: Arc<TrayNotifier>,
}

impl TrayHandle {
    /// Re-render icon, tooltip and menu.
    pub fn refresh(&self) {
        self.notifier.handle.update(|_| {});
    }

    pub fn shutdown(&self) {
        self.notifier.handle.shutdown();
    }
}

/// Run the system tray service.
pub fn run_tray(
    state: Arc<AppState>,
    preview_chars: usize,
) -> Result<(
    mpsc::UnboundedReceiver<TrayAction>,
    TrayHandle,
    Arc<TrayNotifier>,
)> {
    if std::env::var_os("DBUS_SESSION_BUS_ADDRESS").is_none() {
        bail!("No D-Bus session bus for the system tray");
    }

    let (action_tx, action_rx) = mpsc::unbounded_channel();
    let pending: Pending = Arc::new(PendingNotifications::default());

    let tray = ChatTray::new(state, pending.clone(), action_tx);
    let service = TrayService::new(tray);
    let handle = service.handle();

    // Spawn the tray service
    std::thread::spawn(move || {
        if let Err(e) = service.run() {
            error!("System tray stopped: {}", e);
        }
    });

    info!("System tray started");

    let notifier = Arc::new(TrayNotifier {
        handle,
        pending,
        preview_chars,
    });
    let tray_handle = TrayHandle {
        notifier: notifier.clone(),
    };

    Ok((action_rx, tray_handle, notifier))
}
