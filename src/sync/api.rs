// Request/response API surface consumed by the sync core.

use async_trait::async_trait;
use log::{debug, error};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::models::{Chat, ChatContext, MessagePage};

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// The chat attached to `context`, or `None` if none was created yet.
    async fn fetch_chat(&self, context: &ChatContext) -> ChatResult<Option<Chat>>;

    /// One page of history, 1-based.
    async fn fetch_messages(&self, chat_id: &str, page: u32, limit: u32) -> ChatResult<MessagePage>;

    /// Mark the chat read; returns the remaining unread count.
    async fn mark_chat_read(&self, chat_id: &str) -> ChatResult<u32>;

    async fn unread_count(&self, chat_id: &str) -> ChatResult<u32>;

    async fn total_unread_count(&self) -> ChatResult<u32>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCountResponse {
    unread_count: u32,
}

/// `ChatApi` over HTTP/JSON.
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(config: &ClientConfig) -> ChatResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout().max(Duration::from_secs(1)))
            .build()?;
        Ok(HttpChatApi {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.token(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(request: reqwest::RequestBuilder) -> ChatResult<T> {
        let response = request.send().await.map_err(|e| {
            error!("Request failed to send: {}", e);
            ChatError::Request(e.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Request(format!("server responded with {}", status)));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_chat(&self, context: &ChatContext) -> ChatResult<Option<Chat>> {
        debug!("Fetching chat for {}", context);
        let path = format!("/chats/context/{}/{}", context.context_type, context.context_id);
        let response = self.get(&path).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(response.json::<Option<Chat>>().await?),
            status => Err(ChatError::Request(format!("server responded with {}", status))),
        }
    }

    async fn fetch_messages(&self, chat_id: &str, page: u32, limit: u32) -> ChatResult<MessagePage> {
        debug!("Fetching page {} (limit {}) of chat {}", page, limit, chat_id);
        let request = self
            .get(&format!("/chats/{}/messages", chat_id))
            .query(&[("page", page), ("limit", limit)]);
        Self::send_json(request).await
    }

    async fn mark_chat_read(&self, chat_id: &str) -> ChatResult<u32> {
        let response: UnreadCountResponse = Self::send_json(self.post(&format!("/chats/{}/read", chat_id))).await?;
        Ok(response.unread_count)
    }

    async fn unread_count(&self, chat_id: &str) -> ChatResult<u32> {
        let response: UnreadCountResponse =
            Self::send_json(self.get(&format!("/chats/{}/unread-count", chat_id))).await?;
        Ok(response.unread_count)
    }

    async fn total_unread_count(&self) -> ChatResult<u32> {
        let response: UnreadCountResponse = Self::send_json(self.get("/chats/unread-count")).await?;
        Ok(response.unread_count)
    }
}
