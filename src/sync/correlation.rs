// One-shot request/response over the broadcast push channel.
//
// Each call registers its own response and error handlers, emits the request,
// waits for exactly one correlated outcome and then removes both handlers.
// Concurrent calls sharing event names never see each other's responses.

use log::{debug, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::channel::PushChannel;
use super::events;
use crate::error::{ChatError, ChatResult};
use crate::models::ErrorEvent;

pub type ResponseMatcher = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Description of one request/response exchange.
pub struct Exchange {
    pub request_event: &'static str,
    pub response_event: &'static str,
    pub payload: Value,
    /// Fallback used when a response carries no `requestId`.
    pub matches: ResponseMatcher,
    pub timeout: Duration,
}

impl Exchange {
    pub fn new(request_event: &'static str, response_event: &'static str, payload: Value) -> Self {
        Exchange {
            request_event,
            response_event,
            payload,
            matches: Box::new(|_| true),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn matching(mut self, matches: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.matches = Box::new(matches);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Predicate matching payloads whose `chatId` equals `chat_id`.
pub fn chat_id_is(chat_id: &str) -> impl Fn(&Value) -> bool + Send + Sync + 'static {
    let chat_id = chat_id.to_string();
    move |payload: &Value| payload.get("chatId").and_then(Value::as_str) == Some(chat_id.as_str())
}

fn request_id_of(payload: &Value) -> Option<&str> {
    payload.get("requestId").and_then(Value::as_str)
}

fn is_response_for(payload: &Value, request_id: &str, matches: &ResponseMatcher) -> bool {
    match request_id_of(payload) {
        Some(id) => id == request_id,
        None => matches(payload),
    }
}

fn is_error_for(error: &ErrorEvent, request_id: &str, request_event: &str) -> bool {
    match &error.request_id {
        Some(id) => id == request_id,
        None => error.event.as_deref() == Some(request_event),
    }
}

type Slot = Arc<Mutex<Option<oneshot::Sender<ChatResult<Value>>>>>;

fn complete(slot: &Slot, outcome: ChatResult<Value>) {
    if let Ok(mut slot) = slot.lock() {
        if let Some(tx) = slot.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Emit `exchange.request_event` and wait for its correlated response.
pub async fn request(channel: &dyn PushChannel, exchange: Exchange) -> ChatResult<Value> {
    let Exchange {
        request_event,
        response_event,
        mut payload,
        matches,
        timeout,
    } = exchange;

    let request_id = Uuid::new_v4().to_string();
    if let Value::Object(map) = &mut payload {
        map.insert("requestId".to_string(), Value::String(request_id.clone()));
    }

    let (tx, rx) = oneshot::channel();
    let slot: Slot = Arc::new(Mutex::new(Some(tx)));

    let response_sub = {
        let slot = slot.clone();
        let request_id = request_id.clone();
        channel.subscribe(
            response_event,
            Arc::new(move |response: &Value| {
                if is_response_for(response, &request_id, &matches) {
                    complete(&slot, Ok(response.clone()));
                }
            }),
        )
    };

    let error_sub = {
        let slot = slot.clone();
        let request_id = request_id.clone();
        channel.subscribe(
            events::ERROR,
            Arc::new(move |raw: &Value| {
                let Ok(error) = serde_json::from_value::<ErrorEvent>(raw.clone()) else {
                    return;
                };
                if is_error_for(&error, &request_id, request_event) {
                    complete(&slot, Err(ChatError::socket(request_event, error.message)));
                }
            }),
        )
    };

    debug!("Emitting '{}' (request {})", request_event, request_id);
    // Handlers are dropped (unregistered) on every exit path.
    channel.emit(request_event, payload)?;

    let outcome = match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(ChatError::socket(request_event, "response handler was dropped")),
        Err(_) => {
            warn!("'{}' timed out after {:?} waiting for '{}'", request_event, timeout, response_event);
            Err(ChatError::socket(request_event, format!("no response within {:?}", timeout)))
        }
    };

    drop(response_sub);
    drop(error_sub);
    outcome
}
