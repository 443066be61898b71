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

//! BlueChat desktop application.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluechat::bluetooth::{self, BluezTransport, Device, SenderTag};
use bluechat::config::Config;
use bluechat::events::{listener, ConnectionEvent, MessageEvent};
use bluechat::notifications::{LogNotifier, Notifier};
use bluechat::state::AppState;
use bluechat::storage::{ExportData, MessageStore, SqliteStore};
use bluechat::ui::{self, TrayAction, TrayHandle};
use bluechat::watchdog::Lifecycle;
use bluechat::{AppContext, ChatError};

const HELP: &str = "\
Commands:
  /scan                 list bonded devices and start scanning
  /stop                 stop scanning
  /devices              devices found by the scan
  /known                devices seen before
  /connect <addr|#>     connect by address or list index
  /disconnect           close the session
  /status               connection and watchdog status
  /check                check the link now, reconnecting if needed
  /bg, /fg              move to background or foreground
  /history              current conversation
  /stats                conversation statistics
  /export <path>        write a JSON backup
  /import <path>        restore a JSON backup
  /forget <addr>        remove a device and its messages
  /clear                clear notifications
  /quit                 exit
Anything else is sent as a message.";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bluechat=info".parse().unwrap()),
        )
        .init();

    info!("Starting BlueChat v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Initialize storage
    let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::new(&config.data_dir)?);
    info!("Conversation storage initialized");

    // Initialize Bluetooth
    let transport = Arc::new(
        BluezTransport::new(
            &config.bluetooth,
            bluetooth::max_frame_len(config.chat.max_text_len),
        )
        .await?,
    );

    // Create application state
    let state = AppState::new();

    // Start system tray, or fall back to log notifications
    let (mut action_rx, tray, notifier): (_, Option<TrayHandle>, Arc<dyn Notifier>) =
        match ui::run_tray(state.clone(), config.notifications.preview_chars) {
            Ok((rx, handle, notifier)) => (rx, Some(handle), notifier as Arc<dyn Notifier>),
            Err(e) => {
                warn!("System tray unavailable ({:#}), notifications go to the log", e);
                let (_tx, rx) = mpsc::unbounded_channel();
                let notifier: Arc<dyn Notifier> =
                    Arc::new(LogNotifier::new(config.notifications.preview_chars));
                (rx, None, notifier)
            }
        };

    let ctx = AppContext::new(config, transport, store, notifier, state);
    let tray = tray.map(Arc::new);
    register_console_output(&ctx, tray.clone());

    println!("{}", HELP);
    info!("Ready.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut listing: Vec<Device> = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(&ctx, line.trim(), &mut listing).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read input: {}", e);
                        break;
                    }
                }
            }
            Some(action) = action_rx.recv() => {
                match action {
                    TrayAction::Scan => {
                        if let Some(devices) = scan(&ctx).await {
                            listing = devices;
                        }
                    }
                    TrayAction::Disconnect => ctx.core.disconnect().await,
                    TrayAction::ClearNotifications => {
                        if let Err(e) = ctx.notifier.clear_all() {
                            warn!("Failed to clear notifications: {:#}", e);
                        }
                    }
                    TrayAction::Quit => {
                        info!("Quit requested");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    ctx.shutdown().await;
    if let Some(tray) = tray {
        tray.shutdown();
    }
    info!("BlueChat stopped");
    Ok(())
}

/// Print incoming traffic and keep the tray current.
fn register_console_output(ctx: &AppContext, tray: Option<Arc<TrayHandle>>) {
    let refresh = tray.clone();
    ctx.core
        .add_message_listener(listener(move |event: &MessageEvent| {
            if event.message.sender == SenderTag::Peer {
                println!(
                    "[{}] {}: {}",
                    event.message.timestamp.format("%H:%M:%S"),
                    event.device.display_name(),
                    event.message.text
                );
            }
            if let Some(ref tray) = refresh {
                tray.refresh();
            }
            Ok(())
        }));

    ctx.core
        .add_connection_listener(listener(move |event: &ConnectionEvent| {
            match (&event.device, event.connected) {
                (Some(device), true) => println!("* Connected to {}", device.display_name()),
                (Some(device), false) => println!("* Lost connection to {}", device.display_name()),
                _ => println!("* Disconnected"),
            }
            if let Some(ref tray) = tray {
                tray.refresh();
            }
            Ok(())
        }));
}

/// Request capabilities, make sure the radio is on and list bonded devices.
async fn scan(ctx: &AppContext) -> Option<Vec<Device>> {
    if !ctx.core.request_capabilities().await {
        println!("Bluetooth permissions were not granted");
        return None;
    }
    if !ctx.core.is_enabled().await && !ctx.core.enable().await {
        println!("Bluetooth is off");
        return None;
    }

    match ctx.core.discover().await {
        Ok(devices) => {
            println!("Bonded devices:");
            print_devices(&devices);
            println!("Scanning... use /devices to see what was found");
            Some(devices)
        }
        Err(e) => {
            report("Discovery", &e);
            ctx.state.set_error(e.to_string());
            None
        }
    }
}

/// Print a failed user operation, with a hint when trying again may help.
fn report(action: &str, err: &ChatError) {
    warn!("{} failed [{}]: {}", action, err.error_code(), err);
    if err.is_retriable() {
        println!("{} failed: {} (try again)", action, err);
    } else {
        println!("{} failed: {}", action, err);
    }
}

fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("  (none)");
    }
    for (i, device) in devices.iter().enumerate() {
        println!(
            "  #{} {} [{}]{}",
            i,
            device.display_name(),
            device.id,
            if device.supports_serial { " serial" } else { "" }
        );
    }
}

/// Resolve `/connect` and `/forget` arguments against the last listing.
fn resolve_device(arg: &str, listing: &[Device], known: &[Device]) -> Device {
    if let Some(index) = arg.strip_prefix('#').and_then(|i| i.parse::<usize>().ok()) {
        if let Some(device) = listing.get(index) {
            return device.clone();
        }
    }
    listing
        .iter()
        .chain(known.iter())
        .find(|d| d.id.eq_ignore_ascii_case(arg))
        .cloned()
        .unwrap_or_else(|| Device::new(arg.to_uppercase()))
}

async fn export(store: &dyn MessageStore, path: &Path) -> Result<usize> {
    let data = store.export_data()?;
    let json = serde_json::to_string_pretty(&data)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(data.device_count())
}

async fn import(store: &dyn MessageStore, path: &Path) -> Result<usize> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let data: ExportData = serde_json::from_str(&json)?;
    store.import_data(&data)?;
    Ok(data.device_count())
}

/// Handle one console line. Returns `false` to quit.
async fn handle_line(ctx: &AppContext, line: &str, listing: &mut Vec<Device>) -> bool {
    if line.is_empty() {
        return true;
    }

    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, arg.trim()),
        None => (line, ""),
    };

    if !command.starts_with('/') {
        match ctx.send(line).await {
            Ok(true) => {}
            Ok(false) => println!("Message was not acknowledged"),
            Err(e) => report("Send", &e),
        }
        return true;
    }

    let current = ctx.core.connection_status().connected_device;

    match command {
        "/scan" => {
            if let Some(devices) = scan(ctx).await {
                *listing = devices;
            }
        }
        "/stop" => ctx.core.stop_discovery().await,
        "/devices" => match ctx.core.discovered_devices().await {
            Ok(devices) => {
                print_devices(&devices);
                *listing = devices;
            }
            Err(e) => println!("{}", e),
        },
        "/known" => match ctx.store.get_known_devices() {
            Ok(devices) => {
                print_devices(&devices);
                *listing = devices;
            }
            Err(e) => println!("{:#}", e),
        },
        "/connect" if !arg.is_empty() => {
            let known = ctx.store.get_known_devices().unwrap_or_default();
            let device = resolve_device(arg, listing, &known);
            if let Err(e) = ctx.connect(device).await {
                report("Connect", &e);
            }
        }
        "/disconnect" => ctx.core.disconnect().await,
        "/status" => {
            let status = ctx.core.connection_status();
            let watchdog = ctx.watchdog.status();
            println!("Status: {}", ctx.state.get_status().as_str());
            if let Some(device) = status.connected_device.or(status.last_peer) {
                println!("Device: {} [{}]", device.display_name(), device.id);
            }
            println!(
                "Background: {}  polling: {}  reconnecting: {}  unread: {}",
                watchdog.is_in_background,
                watchdog.has_connection_check,
                watchdog.reconnecting,
                ctx.state.unread_count()
            );
            if let Some(e) = ctx.state.last_error() {
                println!("Last error: {}", e);
            }
        }
        "/check" => {
            let up = ctx.watchdog.force_connection_check().await;
            println!("Link is {}", if up { "up" } else { "down" });
        }
        "/bg" => ctx.set_lifecycle(Lifecycle::Background),
        "/fg" => ctx.set_lifecycle(Lifecycle::Foreground),
        "/history" => {
            for message in ctx.state.conversation() {
                let who = match message.sender {
                    SenderTag::Me => "me",
                    SenderTag::Peer => "them",
                };
                println!(
                    "[{}] {}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    who,
                    message.text
                );
            }
        }
        "/stats" => {
            let Some(device) = current.or_else(|| ctx.state.get_device()) else {
                println!("No conversation selected");
                return true;
            };
            match ctx.store.get_conversation_stats(&device.id) {
                Ok(stats) => println!(
                    "{} messages ({} mine, {} theirs), first {:?}, last {:?}",
                    stats.total_messages,
                    stats.my_messages,
                    stats.their_messages,
                    stats.first_message,
                    stats.last_message
                ),
                Err(e) => println!("{:#}", e),
            }
        }
        "/export" if !arg.is_empty() => {
            if let Err(e) = ctx.flush_persistence().await {
                warn!("{:#}", e);
            }
            match export(ctx.store.as_ref(), Path::new(arg)).await {
                Ok(n) => println!("Exported {} devices to {}", n, arg),
                Err(e) => println!("Export failed: {:#}", e),
            }
        }
        "/import" if !arg.is_empty() => match import(ctx.store.as_ref(), Path::new(arg)).await {
            Ok(n) => {
                println!("Imported {} devices", n);
                // The open conversation may have been replaced
                if let Some(device) = current.or_else(|| ctx.state.get_device()) {
                    match ctx.store.get_messages(&device.id) {
                        Ok(messages) => ctx.state.set_conversation(messages),
                        Err(e) => warn!("Could not reload conversation: {:#}", e),
                    }
                }
            }
            Err(e) => println!("Import failed: {:#}", e),
        },
        "/forget" if !arg.is_empty() => {
            let known = ctx.store.get_known_devices().unwrap_or_default();
            let device = resolve_device(arg, listing, &known);
            if current.map(|d| d.id == device.id).unwrap_or(false) {
                ctx.core.disconnect().await;
            }
            match ctx.store.remove_known_device(&device.id) {
                Ok(true) => println!("Forgot {}", device.id),
                Ok(false) => println!("{} was not known", device.id),
                Err(e) => println!("{:#}", e),
            }
        }
        "/clear" => {
            if let Err(e) = ctx.notifier.clear_all() {
                warn!("Failed to clear notifications: {:#}", e);
            }
        }
        "/quit" => return false,
        _ => println!("{}", HELP),
    }

    true
}
