use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of a message, ordered `Sending < Sent < Delivered < Read`.
///
/// `Sending` only exists locally for optimistic entries that the server has
/// not confirmed yet; the server only ever reports the other three.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending = 0,
    Sent = 1,
    Delivered = 2,
    Read = 3,
}

impl DeliveryStatus {
    /// Returns true when moving to `next` would not downgrade the status.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        next >= self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "messageId")]
    pub id: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    pub sender_id: String,
    pub content: String,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: Option<String>,
    /// Pending id of the optimistic entry this message confirms, echoed by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.delivery_status == DeliveryStatus::Sending
    }

    pub fn is_authored_by(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

/// The external context a chat hangs off, e.g. a booking or a quote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContext {
    pub context_type: String,
    pub context_id: String,
}

impl ChatContext {
    pub fn new(context_type: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            context_type: context_type.into(),
            context_id: context_id.into(),
        }
    }
}

impl std::fmt::Display for ChatContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.context_type, self.context_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub chat_id: String,
    pub context_type: String,
    pub context_id: String,
    #[serde(default)]
    pub participant_type: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl Chat {
    pub fn context(&self) -> ChatContext {
        ChatContext::new(self.context_type.clone(), self.context_id.clone())
    }
}

/// One page of REST history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub total: u64,
    pub has_more: bool,
}

/// State of the single push-channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

// Push-channel payloads. Every inbound event may carry the `requestId` of the
// request that caused it; reducers ignore it, correlation uses it.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentEvent {
    pub message: Message,
    #[serde(default)]
    pub context_type: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
}

impl MessageSentEvent {
    pub fn context(&self) -> Option<ChatContext> {
        match (&self.context_type, &self.context_id) {
            (Some(t), Some(id)) => Some(ChatContext::new(t.clone(), id.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeliveredEvent {
    pub message_id: String,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadEvent {
    pub chat_id: String,
    #[serde(default)]
    pub read_by: Option<String>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub chat_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOnlineEvent {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountEvent {
    /// Absent for the global variant of the event.
    #[serde(default)]
    pub chat_id: Option<String>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub message: String,
}
