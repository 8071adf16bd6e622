// Common test utilities for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::LevelFilter;
use tokio::sync::mpsc;

use tripchat::config::ClientConfig;
use tripchat::error::{ChatError, ChatResult};
use tripchat::models::{Chat, ChatContext, DeliveryStatus, Message, MessagePage, Participant};
use tripchat::sync::api::ChatApi;
use tripchat::sync::engine::{EngineEvent, SyncEngine};
use tripchat::sync::memory::{loopback_responder, MemoryTransport};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub const LOCAL_USER: &str = "u1";
pub const PEER_USER: &str = "u2";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn message(id: &str, chat_id: &str, sender: &str, status: DeliveryStatus, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        chat_id: Some(chat_id.to_string()),
        sender_id: sender.to_string(),
        content: format!("content of {}", id),
        delivery_status: status,
        created_at: at(secs),
        read_at: None,
        read_by: None,
        client_message_id: None,
    }
}

pub fn chat(chat_id: &str, context: &ChatContext, participants: &[&str]) -> Chat {
    Chat {
        chat_id: chat_id.to_string(),
        context_type: context.context_type.clone(),
        context_id: context.context_id.clone(),
        participant_type: Some("customer".to_string()),
        participants: participants
            .iter()
            .map(|user_id| Participant {
                user_id: user_id.to_string(),
                name: None,
            })
            .collect(),
    }
}

pub fn test_config(user_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new("http://localhost:3000/api", user_id)
        .with_request_timeout(Duration::from_millis(300));
    config.typing_idle_ms = 100;
    config.typing_expiry_ms = 100;
    config.page_size = 2;
    config
}

/// Scripted in-memory `ChatApi`.
#[derive(Default)]
pub struct MockApi {
    chats: Mutex<HashMap<ChatContext, Chat>>,
    history: Mutex<HashMap<String, Vec<Message>>>,
    unread: Mutex<HashMap<String, u32>>,
    total_unread: Mutex<u32>,
    fail_history: AtomicBool,
    history_delay: Mutex<Option<Duration>>,
    history_calls: Mutex<Vec<(String, u32, u32)>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(MockApi::default())
    }

    pub fn add_chat(&self, chat: Chat) {
        self.chats.lock().unwrap().insert(chat.context(), chat);
    }

    pub fn set_history(&self, chat_id: &str, messages: Vec<Message>) {
        self.history.lock().unwrap().insert(chat_id.to_string(), messages);
    }

    pub fn set_unread(&self, chat_id: &str, count: u32) {
        self.unread.lock().unwrap().insert(chat_id.to_string(), count);
    }

    pub fn set_total_unread(&self, count: u32) {
        *self.total_unread.lock().unwrap() = count;
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn delay_history(&self, delay: Duration) {
        *self.history_delay.lock().unwrap() = Some(delay);
    }

    pub fn history_calls(&self) -> Vec<(String, u32, u32)> {
        self.history_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn fetch_chat(&self, context: &ChatContext) -> ChatResult<Option<Chat>> {
        Ok(self.chats.lock().unwrap().get(context).cloned())
    }

    async fn fetch_messages(&self, chat_id: &str, page: u32, limit: u32) -> ChatResult<MessagePage> {
        self.history_calls
            .lock()
            .unwrap()
            .push((chat_id.to_string(), page, limit));

        let delay = *self.history_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ChatError::Request("history unavailable".to_string()));
        }

        let all = self.history.lock().unwrap().get(chat_id).cloned().unwrap_or_default();
        let start = ((page.max(1) - 1) * limit) as usize;
        let messages: Vec<Message> = all.iter().skip(start).take(limit as usize).cloned().collect();
        Ok(MessagePage {
            has_more: start + messages.len() < all.len(),
            total: all.len() as u64,
            messages,
        })
    }

    async fn mark_chat_read(&self, chat_id: &str) -> ChatResult<u32> {
        self.unread.lock().unwrap().insert(chat_id.to_string(), 0);
        Ok(0)
    }

    async fn unread_count(&self, chat_id: &str) -> ChatResult<u32> {
        Ok(self.unread.lock().unwrap().get(chat_id).copied().unwrap_or(0))
    }

    async fn total_unread_count(&self) -> ChatResult<u32> {
        Ok(*self.total_unread.lock().unwrap())
    }
}

/// An engine wired to a connected in-memory transport answering like the server.
pub struct EngineHarness {
    pub transport: Arc<MemoryTransport>,
    pub api: Arc<MockApi>,
    pub engine: SyncEngine,
    pub events: mpsc::Receiver<EngineEvent>,
}

pub fn engine_harness(user_id: &str) -> EngineHarness {
    setup_logging();
    let transport = MemoryTransport::new();
    transport.complete_handshake();
    transport.set_responder(loopback_responder(user_id));

    let api = MockApi::new();
    let (engine, events) = SyncEngine::new(test_config(user_id), api.clone(), transport.clone());
    EngineHarness {
        transport,
        api,
        engine,
        events,
    }
}

impl EngineHarness {
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Let spawned reactions (auto mark-read, typing timers) run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Poll `condition` for up to a second.
pub async fn wait_for(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn statuses(messages: &[Message]) -> Vec<(String, DeliveryStatus)> {
    messages
        .iter()
        .map(|m| (m.id.clone(), m.delivery_status))
        .collect()
}
