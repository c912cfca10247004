use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message received from a messaging platform, normalized to a
/// platform-independent shape (§3).
///
/// `raw_event` carries the platform's native update payload so an adapter can
/// recover fields the common shape doesn't model (e.g. Telegram entities)
/// without widening this struct for every platform quirk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub text: String,
    pub chat_id: String,
    pub user_id: String,
    pub message_id: String,
    pub platform: String,
    pub reply_to_message_id: Option<String>,
    pub username: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub raw_event: Value,
}

impl IncomingMessage {
    pub fn is_reply(&self) -> bool {
        self.reply_to_message_id.is_some()
    }
}

/// Processing state of a node in a conversation tree (§3, §4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Completed | MessageState::Error)
    }
}
