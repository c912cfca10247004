//! A single turn in a conversation tree (§3 `MessageNode`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skynet_core::types::{IncomingMessage, MessageState};

/// One user turn and everything tracked about its processing.
///
/// Invariants (§3): `state` transitions monotonically
/// `PENDING -> IN_PROGRESS -> (COMPLETED|ERROR)`; `ERROR` is terminal;
/// `session_id` is set at most once (when the agent's real session id is
/// first extracted); `children_ids` is append-only for the tree's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNode {
    pub node_id: String,
    pub incoming: IncomingMessage,
    pub status_message_id: String,
    pub state: MessageState,
    pub parent_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl MessageNode {
    pub fn new_root(node_id: String, incoming: IncomingMessage, status_message_id: String) -> Self {
        Self {
            node_id,
            incoming,
            status_message_id,
            state: MessageState::Pending,
            parent_id: None,
            session_id: None,
            children_ids: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    pub fn new_child(
        node_id: String,
        incoming: IncomingMessage,
        status_message_id: String,
        parent_id: String,
    ) -> Self {
        Self {
            node_id,
            incoming,
            status_message_id,
            state: MessageState::Pending,
            parent_id: Some(parent_id),
            session_id: None,
            children_ids: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }
}
