// In-process push transport.
// Delivery is at-most-once and non-durable: events delivered while the
// transport is down are dropped, exactly like the real push channel.

use chrono::Utc;
use log::{debug, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::channel::{EventHandler, ListenerRegistry, PushChannel, Subscription};
use super::connection::{LifecycleHandle, PushTransport};
use super::events;
use crate::error::{ChatError, ChatResult};

/// Server-side behavior: maps an emitted request to the events the server
/// pushes back in response.
pub type Responder = Box<dyn Fn(&str, &Value) -> Vec<(String, Value)> + Send + Sync>;

/// A minimal server for `user_id`: confirms joins, leaves, sends and
/// mark-reads the way the real server answers them. A send addressed by
/// context creates the chat `chat-<contextId>`.
pub fn loopback_responder(user_id: &str) -> Responder {
    let user_id = user_id.to_string();
    let next_message = AtomicU64::new(1);

    Box::new(move |event: &str, payload: &Value| {
        let request_id = payload.get("requestId").cloned().unwrap_or(Value::Null);
        let chat_id = payload.get("chatId").and_then(Value::as_str).map(str::to_string);

        match event {
            events::JOIN_CHAT => vec![(
                events::CHAT_JOINED.to_string(),
                json!({ "chatId": chat_id, "requestId": request_id }),
            )],
            events::LEAVE_CHAT => vec![(
                events::CHAT_LEFT.to_string(),
                json!({ "chatId": chat_id, "requestId": request_id }),
            )],
            events::SEND_MESSAGE => {
                let chat_id = chat_id.unwrap_or_else(|| {
                    format!("chat-{}", payload["contextId"].as_str().unwrap_or("unknown"))
                });
                let message_id = format!("m{}", next_message.fetch_add(1, Ordering::SeqCst));
                vec![(
                    events::MESSAGE_SENT.to_string(),
                    json!({
                        "message": {
                            "messageId": message_id,
                            "chatId": chat_id,
                            "senderId": user_id,
                            "content": payload["content"],
                            "deliveryStatus": "sent",
                            "createdAt": Utc::now(),
                            "clientMessageId": payload["clientMessageId"],
                        },
                        "contextType": payload["contextType"],
                        "contextId": payload["contextId"],
                        "requestId": request_id,
                    }),
                )]
            }
            events::MARK_AS_READ => vec![(
                events::MESSAGE_READ.to_string(),
                json!({
                    "chatId": chat_id,
                    "readBy": user_id,
                    "readAt": Utc::now(),
                    "requestId": request_id,
                }),
            )],
            _ => Vec::new(),
        }
    })
}

pub struct MemoryTransport {
    registry: Arc<ListenerRegistry>,
    connected: AtomicBool,
    auto_handshake: bool,
    lifecycle: Mutex<Option<LifecycleHandle>>,
    emitted: Mutex<Vec<(String, Value)>>,
    responder: Mutex<Option<Responder>>,
}

impl MemoryTransport {
    /// A transport that acknowledges the handshake as soon as it is opened.
    pub fn new() -> Arc<Self> {
        Self::build(true)
    }

    /// A transport whose handshake must be completed with `complete_handshake`.
    pub fn manual() -> Arc<Self> {
        Self::build(false)
    }

    fn build(auto_handshake: bool) -> Arc<Self> {
        Arc::new(MemoryTransport {
            registry: ListenerRegistry::new(),
            connected: AtomicBool::new(false),
            auto_handshake,
            lifecycle: Mutex::new(None),
            emitted: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        })
    }

    pub fn set_responder(&self, responder: Responder) {
        if let Ok(mut slot) = self.responder.lock() {
            *slot = Some(responder);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn current_lifecycle(&self) -> Option<LifecycleHandle> {
        self.lifecycle.lock().ok().and_then(|slot| slot.clone())
    }

    /// Acknowledge the pending handshake.
    pub fn complete_handshake(&self) -> bool {
        self.connected.store(true, Ordering::SeqCst);
        self.current_lifecycle().map_or(false, |handle| handle.connected())
    }

    /// Simulate the transport dropping.
    pub fn drop_connection(&self, reason: &str) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.current_lifecycle().map_or(false, |handle| handle.disconnected(reason))
    }

    /// Simulate a failed connection attempt.
    pub fn fail_handshake(&self, reason: &str) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        self.current_lifecycle().map_or(false, |handle| handle.failed(reason))
    }

    /// Push an event from the server. Returns false if it was lost because
    /// the transport is down.
    pub fn deliver(&self, event: &str, payload: Value) -> bool {
        if !self.is_connected() {
            debug!("Dropping '{}' event: transport is down", event);
            return false;
        }
        self.registry.dispatch(event, &payload);
        true
    }

    /// Every request emitted so far, in order.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn emitted_named(&self, event: &str) -> Vec<Value> {
        self.emitted()
            .into_iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn clear_emitted(&self) {
        if let Ok(mut log) = self.emitted.lock() {
            log.clear();
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.registry.listener_count(event)
    }
}

impl PushChannel for MemoryTransport {
    fn subscribe(&self, event: &str, handler: EventHandler) -> Subscription {
        self.registry.add(event, handler)
    }

    fn emit(&self, event: &str, payload: Value) -> ChatResult<()> {
        if !self.is_connected() {
            warn!("Cannot emit '{}': transport is not connected", event);
            return Err(ChatError::Transport("push channel is not connected".to_string()));
        }
        if let Ok(mut log) = self.emitted.lock() {
            log.push((event.to_string(), payload.clone()));
        }

        let responses = match self.responder.lock() {
            Ok(responder) => responder
                .as_ref()
                .map(|respond| respond(event, &payload))
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for (name, response) in responses {
            self.deliver(&name, response);
        }
        Ok(())
    }

    fn remove_all_listeners(&self) {
        self.registry.clear();
    }
}

impl PushTransport for MemoryTransport {
    fn open(&self, lifecycle: LifecycleHandle) {
        debug!("Opening in-memory transport (generation {})", lifecycle.generation());
        if let Ok(mut slot) = self.lifecycle.lock() {
            *slot = Some(lifecycle);
        }
        if self.auto_handshake {
            self.complete_handshake();
        }
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
