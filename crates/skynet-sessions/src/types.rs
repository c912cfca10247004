use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use skynet_tree::MessageNode;

/// Legacy message-id -> Claude-session mapping, kept for backwards
/// compatibility with stores written before the tree-based forest existed
/// (§3 `SessionRecord`, ported from `original_source/messaging/session.py`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub chat_id: String,
    pub initial_msg_id: String,
    pub last_msg_id: String,
    pub platform: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One entry in a chat's best-effort message log, used for `/clear`-style
/// UI cleanup (§3 `message_log`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub message_id: String,
    pub ts: String,
    pub direction: String,
    pub kind: String,
}

/// The full on-disk shape of the session store (§3 `SessionStore` persistent
/// state, §6 "Persisted state format"). Integer chat/msg ids written by an
/// older store are read back as strings automatically since every id field
/// here is already a `String`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub sessions: HashMap<String, SessionRecord>,
    #[serde(default)]
    pub trees: HashMap<String, HashMap<String, MessageNode>>,
    #[serde(default)]
    pub node_to_tree: HashMap<String, String>,
    #[serde(default)]
    pub message_log: HashMap<String, Vec<MessageLogEntry>>,
}

pub(crate) fn chat_key(platform: &str, chat_id: &str) -> String {
    format!("{platform}:{chat_id}")
}
