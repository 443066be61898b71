//! Integration tests for the full chat flow.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use bluechat::bluetooth::memory::{ConnectOutcome, MemoryTransport};
use bluechat::bluetooth::{ChatMessage, ConnectionCore, Device, SenderTag, DEFAULT_MAX_TEXT_LEN};
use bluechat::config::Config;
use bluechat::events::{listener, EventBus, MessageEvent};
use bluechat::notifications::Notifier;
use bluechat::state::{AppState, ConnectionStatus};
use bluechat::storage::{ConversationStats, ExportData, MessageStore, SqliteStore};
use bluechat::watchdog::Lifecycle;
use bluechat::{AppContext, ChatError};

const LAPTOP: &str = "00:11:22:33:44:55";
const PHONE: &str = "66:77:88:99:AA:BB";

/// Forward everything `from` wrote to `to`, as the radio would.
fn pump(from: &MemoryTransport, to: &MemoryTransport, to_peer: &str, already: &mut usize) {
    let written = from.written();
    for (_, payload) in &written[*already..] {
        to.deliver(to_peer, payload);
    }
    *already = written.len();
}

fn core(transport: Arc<MemoryTransport>) -> Arc<ConnectionCore> {
    ConnectionCore::new(transport, Arc::new(EventBus::new()), DEFAULT_MAX_TEXT_LEN)
}

fn inbox(core: &ConnectionCore) -> Arc<Mutex<Vec<ChatMessage>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    core.add_message_listener(listener(move |event: &MessageEvent| {
        sink.lock().push(event.message.clone());
        Ok(())
    }));
    log
}

#[tokio::test]
async fn test_two_peers_exchange_messages() {
    let laptop_radio = Arc::new(MemoryTransport::new());
    let phone_radio = Arc::new(MemoryTransport::new());
    let laptop = core(laptop_radio.clone());
    let phone = core(phone_radio.clone());
    let laptop_inbox = inbox(&laptop);
    let phone_inbox = inbox(&phone);

    laptop.connect(Device::new(PHONE)).await.unwrap();
    phone.connect(Device::new(LAPTOP)).await.unwrap();

    let (mut from_laptop, mut from_phone) = (0, 0);

    laptop.send("hello phone").await.unwrap();
    pump(&laptop_radio, &phone_radio, LAPTOP, &mut from_laptop);

    phone.send("hello laptop").await.unwrap();
    pump(&phone_radio, &laptop_radio, PHONE, &mut from_phone);

    let laptop_inbox = laptop_inbox.lock();
    let phone_inbox = phone_inbox.lock();

    // Each side sees its own message tagged me, the other's tagged peer
    assert_eq!(laptop_inbox.len(), 2);
    assert_eq!(laptop_inbox[0].sender, SenderTag::Me);
    assert_eq!(laptop_inbox[1].text, "hello laptop");
    assert_eq!(laptop_inbox[1].sender, SenderTag::Peer);

    assert_eq!(phone_inbox.len(), 2);
    assert_eq!(phone_inbox[0].text, "hello phone");
    assert_eq!(phone_inbox[0].sender, SenderTag::Peer);
    assert_eq!(phone_inbox[0].timestamp, laptop_inbox[0].timestamp);
}

#[tokio::test]
async fn test_chunked_frames_over_decoder() {
    use bluechat::bluetooth::{max_frame_len, LineDecoder};

    let frames: String = ["one", "two", "three"]
        .iter()
        .map(|t| ChatMessage::outgoing(*t).to_frame().unwrap())
        .collect();

    let mut decoder = LineDecoder::new(max_frame_len(DEFAULT_MAX_TEXT_LEN));
    let mut texts = Vec::new();
    for chunk in frames.as_bytes().chunks(7) {
        for frame in decoder.push(chunk) {
            texts.push(ChatMessage::from_frame(&frame, DEFAULT_MAX_TEXT_LEN).unwrap().text);
        }
    }

    assert_eq!(texts, vec!["one", "two", "three"]);
}

/// Store that rejects every write.
struct BrokenStore;

impl MessageStore for BrokenStore {
    fn save_message(&self, _: &str, _: &ChatMessage) -> Result<ChatMessage> {
        Err(anyhow!("disk full"))
    }
    fn get_messages(&self, _: &str) -> Result<Vec<ChatMessage>> {
        Err(anyhow!("disk full"))
    }
    fn clear_messages(&self, _: &str) -> Result<()> {
        Err(anyhow!("disk full"))
    }
    fn get_known_devices(&self) -> Result<Vec<Device>> {
        Err(anyhow!("disk full"))
    }
    fn save_known_device(&self, _: &Device) -> Result<Device> {
        Err(anyhow!("disk full"))
    }
    fn remove_known_device(&self, _: &str) -> Result<bool> {
        Err(anyhow!("disk full"))
    }
    fn get_conversation_stats(&self, _: &str) -> Result<ConversationStats> {
        Err(anyhow!("disk full"))
    }
    fn export_data(&self) -> Result<ExportData> {
        Err(anyhow!("disk full"))
    }
    fn import_data(&self, _: &ExportData) -> Result<()> {
        Err(anyhow!("disk full"))
    }
    fn clear_all_data(&self) -> Result<()> {
        Err(anyhow!("disk full"))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<(Option<String>, String)>>,
    connections: Mutex<Vec<bool>>,
}

impl Notifier for RecordingNotifier {
    fn show_new_message(&self, device_name: Option<&str>, text: &str, _: &str) -> Result<()> {
        self.messages
            .lock()
            .push((device_name.map(str::to_string), text.to_string()));
        Ok(())
    }

    fn show_connection(&self, _: Option<&str>, connected: bool) -> Result<()> {
        self.connections.lock().push(connected);
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        self.messages.lock().clear();
        Ok(())
    }
}

#[tokio::test]
async fn test_persistence_failure_does_not_block_delivery() {
    let transport = Arc::new(MemoryTransport::new());
    let ctx = AppContext::new(
        Config::default(),
        transport.clone(),
        Arc::new(BrokenStore),
        Arc::new(RecordingNotifier::default()),
        AppState::new(),
    );
    // Registered after the persistence observer
    let chat = inbox(&ctx.core);

    ctx.connect(Device::new(PHONE)).await.unwrap();
    assert_eq!(ctx.state.get_status(), ConnectionStatus::Connected);

    transport.deliver(PHONE, r#"{"text":"still here","timestamp":"2024-03-01T12:00:00.000Z"}"#);
    ctx.flush_persistence().await.unwrap();

    assert_eq!(chat.lock().len(), 1);
    assert_eq!(ctx.state.conversation().len(), 1);
    assert!(ctx.core.connection_status().is_connected);
}

#[tokio::test]
async fn test_background_message_notification() {
    let transport = Arc::new(MemoryTransport::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = AppContext::new(
        Config::default(),
        transport.clone(),
        Arc::new(SqliteStore::in_memory().unwrap()),
        notifier.clone(),
        AppState::new(),
    );

    ctx.connect(Device::new(PHONE)).await.unwrap();

    // Foreground: no notification
    transport.deliver(PHONE, r#"{"text":"seen live"}"#);
    assert!(notifier.messages.lock().is_empty());

    ctx.set_lifecycle(Lifecycle::Background);
    let long = "x".repeat(80);
    transport.deliver(PHONE, &format!(r#"{{"text":"{}"}}"#, long));
    ctx.send("own messages never notify").await.unwrap();

    {
        let messages = notifier.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, None);
        assert_eq!(messages[0].1, long);
    }
    assert_eq!(ctx.state.unread_count(), 1);

    // Returning to the foreground clears everything
    ctx.set_lifecycle(Lifecycle::Foreground);
    assert!(notifier.messages.lock().is_empty());
    assert_eq!(ctx.state.unread_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_reconnection_end_to_end() {
    let transport = Arc::new(MemoryTransport::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = AppContext::new(
        Config::default(),
        transport.clone(),
        Arc::new(SqliteStore::in_memory().unwrap()),
        notifier.clone(),
        AppState::new(),
    );

    ctx.connect(Device::new(PHONE).with_name("Phone")).await.unwrap();
    ctx.set_lifecycle(Lifecycle::Background);

    transport.drop_link(PHONE);
    transport.script_connects([
        ConnectOutcome::Fail("page timeout".to_string()),
        ConnectOutcome::Accept,
    ]);

    // First poll at 30 s, one back-off of 5 s
    tokio::time::sleep(Duration::from_secs(36)).await;

    assert_eq!(ctx.state.get_status(), ConnectionStatus::Connected);
    assert_eq!(*notifier.connections.lock(), vec![true]);
    assert_eq!(transport.connect_attempts().len(), 3);
}

#[tokio::test]
async fn test_send_errors_reach_the_caller() {
    let transport = Arc::new(MemoryTransport::new());
    let ctx = AppContext::new(
        Config::default(),
        transport.clone(),
        Arc::new(SqliteStore::in_memory().unwrap()),
        Arc::new(RecordingNotifier::default()),
        AppState::new(),
    );

    assert!(matches!(ctx.send("nobody home").await, Err(ChatError::NotConnected)));
    assert!(ctx.state.last_error().is_some());
    assert!(transport.written().is_empty());
}
