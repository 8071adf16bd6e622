// Publish/subscribe interface over the push channel.
// Every subscription hands back a disposer so components only ever remove
// their own listeners.

use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::ChatResult;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Event-name keyed publish/subscribe interface of the push channel.
pub trait PushChannel: Send + Sync {
    /// Register `handler` for `event`. Dropping (or disposing) the returned
    /// `Subscription` removes exactly this handler.
    fn subscribe(&self, event: &str, handler: EventHandler) -> Subscription;

    /// Publish `payload` under `event` to the server.
    fn emit(&self, event: &str, payload: Value) -> ChatResult<()>;

    /// Remove every listener. Reserved for account-level teardown.
    fn remove_all_listeners(&self);
}

/// Listener table shared by push channel implementations.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<String, Vec<(u64, EventHandler)>>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(self: &Arc<Self>, event: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.entry(event.to_string()).or_default().push((id, handler));
        }
        Subscription {
            event: event.to_string(),
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub fn remove(&self, event: &str, id: u64) -> bool {
        let Ok(mut listeners) = self.listeners.lock() else {
            return false;
        };
        let Some(handlers) = listeners.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Invoke every handler registered for `event`, returning how many ran.
    ///
    /// Handlers are cloned out of the table first, so they may subscribe or
    /// dispose while being dispatched.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let handlers: Vec<EventHandler> = match self.listeners.lock() {
            Ok(listeners) => listeners
                .get(event)
                .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .lock()
            .map(|listeners| listeners.get(event).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            debug!("Clearing {} listener groups", listeners.len());
            listeners.clear();
        }
    }
}

/// Disposer for one registered handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    event: String,
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.event, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}
