// Chat session resolution and room membership.

use log::{debug, error, info};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::api::ChatApi;
use super::channel::PushChannel;
use super::correlation::{self, chat_id_is, Exchange};
use super::events;
use crate::error::ChatResult;
use crate::models::{Chat, ChatContext};

pub struct SessionResolver {
    api: Arc<dyn ChatApi>,
    channel: Arc<dyn PushChannel>,
    request_timeout: Duration,
    joined: Mutex<Option<String>>,
}

impl SessionResolver {
    pub fn new(api: Arc<dyn ChatApi>, channel: Arc<dyn PushChannel>, request_timeout: Duration) -> Self {
        SessionResolver {
            api,
            channel,
            request_timeout,
            joined: Mutex::new(None),
        }
    }

    /// Map an external context to its chat. Failures are reported, not retried.
    pub async fn resolve(&self, context: &ChatContext) -> ChatResult<Option<Chat>> {
        match self.api.fetch_chat(context).await {
            Ok(Some(chat)) => {
                info!("Resolved {} to chat {}", context, chat.chat_id);
                Ok(Some(chat))
            }
            Ok(None) => {
                info!("No chat exists yet for {}", context);
                Ok(None)
            }
            Err(e) => {
                error!("Failed to resolve chat for {}: {}", context, e);
                Err(e)
            }
        }
    }

    pub fn joined_chat(&self) -> Option<String> {
        self.joined.lock().ok().and_then(|joined| joined.clone())
    }

    fn set_joined(&self, chat_id: Option<String>) {
        if let Ok(mut joined) = self.joined.lock() {
            *joined = chat_id;
        }
    }

    /// Join the room for `chat_id`. A `None` chat is a no-op: membership is
    /// established once the first message creates the chat.
    ///
    /// Returns whether the session is in the room afterwards.
    pub async fn join(&self, chat_id: Option<&str>) -> ChatResult<bool> {
        let Some(chat_id) = chat_id else {
            debug!("No chat yet; deferring room join");
            return Ok(false);
        };

        match self.joined_chat() {
            Some(current) if current == chat_id => {
                debug!("Already joined chat {}", chat_id);
                return Ok(true);
            }
            Some(_) => {
                self.leave().await?;
            }
            None => {}
        }

        let exchange = Exchange::new(events::JOIN_CHAT, events::CHAT_JOINED, json!({ "chatId": chat_id }))
            .matching(chat_id_is(chat_id))
            .with_timeout(self.request_timeout);
        correlation::request(self.channel.as_ref(), exchange).await?;

        info!("Joined chat {}", chat_id);
        self.set_joined(Some(chat_id.to_string()));
        Ok(true)
    }

    /// Leave the joined room, if any. Returns whether a leave was sent.
    pub async fn leave(&self) -> ChatResult<bool> {
        let Some(chat_id) = self.joined_chat() else {
            return Ok(false);
        };

        // Membership is gone locally whether or not the server confirms.
        self.set_joined(None);
        let exchange = Exchange::new(events::LEAVE_CHAT, events::CHAT_LEFT, json!({ "chatId": chat_id }))
            .matching(chat_id_is(&chat_id))
            .with_timeout(self.request_timeout);
        correlation::request(self.channel.as_ref(), exchange).await?;

        info!("Left chat {}", chat_id);
        Ok(true)
    }

    /// Forget membership without talking to the server, e.g. after the
    /// transport dropped and the server discarded it.
    pub fn forget_membership(&self) {
        self.set_joined(None);
    }
}
