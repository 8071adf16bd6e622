// Unread counters for badges: per chat or global.

use log::{debug, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::api::ChatApi;
use super::channel::{PushChannel, Subscription};
use super::events;
use crate::error::ChatResult;
use crate::models::UnreadCountEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnreadScope {
    Chat(String),
    Global,
}

impl UnreadScope {
    pub fn from_chat_id(chat_id: Option<&str>) -> Self {
        match chat_id {
            Some(id) => UnreadScope::Chat(id.to_string()),
            None => UnreadScope::Global,
        }
    }

    /// Per-chat counters take only their chat's events; the global counter
    /// takes only the global variant (no chat id).
    pub fn accepts(&self, event: &UnreadCountEvent) -> bool {
        match (self, event.chat_id.as_deref()) {
            (UnreadScope::Chat(mine), Some(theirs)) => mine == theirs,
            (UnreadScope::Global, None) => true,
            _ => false,
        }
    }
}

pub struct UnreadCounter {
    api: Arc<dyn ChatApi>,
    scope: UnreadScope,
    count: Arc<watch::Sender<u32>>,
    subscription: Mutex<Option<Subscription>>,
}

impl UnreadCounter {
    /// Start tracking `scope`, kept live by `unread-count-updated` events.
    pub fn attach(api: Arc<dyn ChatApi>, channel: &dyn PushChannel, scope: UnreadScope) -> Self {
        let (tx, _) = watch::channel(0u32);
        let counter = UnreadCounter {
            api,
            scope,
            count: Arc::new(tx),
            subscription: Mutex::new(None),
        };
        counter.reattach(channel);
        counter
    }

    /// Subscribe again, replacing the previous listener. Needed after an
    /// account-level teardown removed every listener from `channel`.
    pub fn reattach(&self, channel: &dyn PushChannel) {
        let count = self.count.clone();
        let scope = self.scope.clone();
        let subscription = channel.subscribe(
            events::UNREAD_COUNT_UPDATED,
            Arc::new(move |payload: &Value| {
                match serde_json::from_value::<UnreadCountEvent>(payload.clone()) {
                    Ok(event) if scope.accepts(&event) => {
                        debug!("Unread count for {:?} is now {}", scope, event.unread_count);
                        count.send_replace(event.unread_count);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Malformed unread-count payload: {}", e),
                }
            }),
        );
        let previous = match self.subscription.lock() {
            Ok(mut slot) => slot.replace(subscription),
            Err(poisoned) => poisoned.into_inner().replace(subscription),
        };
        drop(previous);
    }

    pub fn scope(&self) -> &UnreadScope {
        &self.scope
    }

    pub fn count(&self) -> u32 {
        *self.count.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u32> {
        self.count.subscribe()
    }

    pub fn set(&self, count: u32) {
        self.count.send_replace(count);
    }

    /// Fetch the authoritative count over the request/response API.
    pub async fn refresh(&self) -> ChatResult<u32> {
        let fetched = match &self.scope {
            UnreadScope::Chat(chat_id) => self.api.unread_count(chat_id).await?,
            UnreadScope::Global => self.api.total_unread_count().await?,
        };
        self.set(fetched);
        Ok(fetched)
    }
}
