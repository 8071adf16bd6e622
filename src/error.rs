use thiserror::Error;

/// Errors surfaced by the chat synchronization core.
///
/// None of these are fatal to the engine. The worst outcome is a stalled
/// chat that a reconnect or a history refetch repairs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    /// Connecting or reconnecting the push channel failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A request/response API call failed.
    #[error("Request failed: {0}")]
    Request(String),

    /// The server answered a specific push-channel request with an error,
    /// or never answered it.
    #[error("Socket operation '{event}' failed: {message}")]
    SocketOperation { event: String, message: String },

    /// Rejected locally before any I/O.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A push payload could not be decoded.
    #[error("Malformed payload: {0}")]
    Decode(String),
}

impl ChatError {
    pub fn socket(event: &str, message: impl Into<String>) -> Self {
        ChatError::SocketOperation {
            event: event.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Transport(_) | ChatError::Request(_) | ChatError::SocketOperation { .. }
        )
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Decode(e.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Request(e.to_string())
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
