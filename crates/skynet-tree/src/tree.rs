//! A forest member: one conversation's nodes, FIFO queue, and single-consumer
//! processing state (§3 `MessageTree`, §4.12).

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use skynet_core::types::MessageState;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::node::MessageNode;

/// Mutable state guarded by a single per-tree lock (§5 "Shared-resource
/// policy": the lock guards the node map, FIFO, and current-task state and
/// is never held across awaiting a node processor).
struct TreeInner {
    nodes: HashMap<String, MessageNode>,
    queue: VecDeque<String>,
    is_processing: bool,
    current_node_id: Option<String>,
    current_task: Option<JoinHandle<()>>,
}

/// One conversation thread: a root node plus any reply children, each
/// identified by `node_id` (§3). At most one node is `IN_PROGRESS` at a time;
/// when the queue is empty and nothing is running, `is_processing` is false.
pub struct MessageTree {
    root_id: String,
    inner: Mutex<TreeInner>,
}

impl MessageTree {
    pub fn new(root: MessageNode) -> Self {
        let root_id = root.node_id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Self {
            root_id,
            inner: Mutex::new(TreeInner {
                nodes,
                queue: VecDeque::new(),
                is_processing: false,
                current_node_id: None,
                current_task: None,
            }),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Insert `child` (already parented) and append it to the parent's
    /// `children_ids` (append-only for the tree's lifetime, §3).
    pub async fn add_node(&self, child: MessageNode) {
        let mut inner = self.inner.lock().await;
        if let Some(parent_id) = child.parent_id.clone() {
            if let Some(parent) = inner.nodes.get_mut(&parent_id) {
                parent.children_ids.push(child.node_id.clone());
            }
        }
        inner.nodes.insert(child.node_id.clone(), child);
    }

    pub async fn get_node(&self, node_id: &str) -> Option<MessageNode> {
        self.inner.lock().await.nodes.get(node_id).cloned()
    }

    pub async fn has_node(&self, node_id: &str) -> bool {
        self.inner.lock().await.nodes.contains_key(node_id)
    }

    pub async fn all_nodes(&self) -> Vec<MessageNode> {
        self.inner.lock().await.nodes.values().cloned().collect()
    }

    pub async fn find_node_by_status_message(&self, status_message_id: &str) -> Option<MessageNode> {
        self.inner
            .lock()
            .await
            .nodes
            .values()
            .find(|n| n.status_message_id == status_message_id)
            .cloned()
    }

    /// Walk up to the node's parent and return its `session_id`, used to
    /// fork a child conversation from the parent's agent session (§3 "Fork").
    pub async fn get_parent_session_id(&self, node_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        let node = inner.nodes.get(node_id)?;
        let parent_id = node.parent_id.as_ref()?;
        inner.nodes.get(parent_id)?.session_id.clone()
    }

    /// Apply a monotone state transition, optionally recording the agent
    /// session id (set at most once per node) and an error message.
    pub async fn update_state(
        &self,
        node_id: &str,
        state: MessageState,
        session_id: Option<String>,
        error_message: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.state = state;
            if node.session_id.is_none() {
                if let Some(sid) = session_id {
                    node.session_id = Some(sid);
                }
            }
            if let Some(msg) = error_message {
                node.error_message = Some(msg);
            }
            if state.is_terminal() {
                node.completed_at = Some(Utc::now());
            }
        }
    }

    pub async fn is_processing(&self) -> bool {
        self.inner.lock().await.is_processing
    }

    pub async fn current_node_id(&self) -> Option<String> {
        self.inner.lock().await.current_node_id.clone()
    }

    pub async fn queue_size(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// If idle, atomically claim `node_id` as current and mark the tree busy;
    /// returns `true` on success (caller then spawns the processor task).
    /// Otherwise pushes `node_id` onto the FIFO and returns `false`.
    pub(crate) async fn try_start_or_queue(&self, node_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.is_processing {
            inner.is_processing = true;
            inner.current_node_id = Some(node_id.to_string());
            true
        } else {
            inner.queue.push_back(node_id.to_string());
            false
        }
    }

    pub(crate) async fn set_current_task(&self, handle: JoinHandle<()>) {
        self.inner.lock().await.current_task = Some(handle);
    }

    /// Pop the next queued node id and claim it as current, or mark the
    /// tree idle if the queue is empty.
    pub(crate) async fn advance_queue(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        inner.current_task = None;
        match inner.queue.pop_front() {
            Some(next) => {
                inner.current_node_id = Some(next.clone());
                Some(next)
            }
            None => {
                inner.is_processing = false;
                inner.current_node_id = None;
                None
            }
        }
    }

    /// Abort the currently-running processor task, if any. Returns `true`
    /// when a task was actually aborted.
    pub async fn cancel_current_task(&self) -> bool {
        let handle = self.inner.lock().await.current_task.take();
        match handle {
            Some(h) => {
                h.abort();
                true
            }
            None => false,
        }
    }

    /// Drain the FIFO, marking every dequeued node ERROR("Cancelled by
    /// user"). Used by `cancel_tree` (§4.12 step 2).
    pub async fn drain_queue_and_mark_cancelled(&self) -> Vec<MessageNode> {
        let mut inner = self.inner.lock().await;
        let drained: Vec<String> = inner.queue.drain(..).collect();
        let mut cancelled = Vec::with_capacity(drained.len());
        for node_id in drained {
            if let Some(node) = inner.nodes.get_mut(&node_id) {
                node.state = MessageState::Error;
                node.error_message = Some("Cancelled by user".to_string());
                node.completed_at = Some(Utc::now());
                cancelled.push(node.clone());
            }
        }
        cancelled
    }

    pub async fn remove_from_queue(&self, node_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.queue.retain(|id| id != node_id);
    }

    pub async fn is_current_node(&self, node_id: &str) -> bool {
        self.inner.lock().await.current_node_id.as_deref() == Some(node_id)
    }

    pub async fn reset_processing_state(&self) {
        let mut inner = self.inner.lock().await;
        inner.is_processing = false;
        inner.current_node_id = None;
        inner.current_task = None;
    }

    /// Serialize this tree's nodes for the session store (§3 `SessionStore`).
    pub async fn to_nodes_map(&self) -> HashMap<String, MessageNode> {
        self.inner.lock().await.nodes.clone()
    }

    /// Rebuild a tree from a persisted node map (startup restore, §4.13).
    pub fn from_nodes(root_id: String, nodes: HashMap<String, MessageNode>) -> Self {
        Self {
            root_id,
            inner: Mutex::new(TreeInner {
                nodes,
                queue: VecDeque::new(),
                is_processing: false,
                current_node_id: None,
                current_task: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skynet_core::types::IncomingMessage;

    fn incoming(text: &str) -> IncomingMessage {
        IncomingMessage {
            text: text.to_string(),
            chat_id: "chat-1".to_string(),
            user_id: "user-1".to_string(),
            message_id: "msg-1".to_string(),
            platform: "test".to_string(),
            reply_to_message_id: None,
            username: None,
            timestamp: Utc::now(),
            raw_event: json!({}),
        }
    }

    #[tokio::test]
    async fn add_node_appends_to_parent_children() {
        let root = MessageNode::new_root("root".into(), incoming("hi"), "status-1".into());
        let tree = MessageTree::new(root);

        let child = MessageNode::new_child("child".into(), incoming("reply"), "status-2".into(), "root".into());
        tree.add_node(child).await;

        let root_node = tree.get_node("root").await.unwrap();
        assert_eq!(root_node.children_ids, vec!["child".to_string()]);
        assert!(tree.has_node("child").await);
    }

    #[tokio::test]
    async fn first_caller_claims_tree_later_callers_queue() {
        let root = MessageNode::new_root("root".into(), incoming("hi"), "status-1".into());
        let tree = MessageTree::new(root);

        assert!(tree.try_start_or_queue("root").await);
        assert!(!tree.try_start_or_queue("second").await);
        assert_eq!(tree.queue_size().await, 1);
        assert!(tree.is_processing().await);
    }

    #[tokio::test]
    async fn advance_queue_marks_idle_when_empty() {
        let root = MessageNode::new_root("root".into(), incoming("hi"), "status-1".into());
        let tree = MessageTree::new(root);
        tree.try_start_or_queue("root").await;

        assert_eq!(tree.advance_queue().await, None);
        assert!(!tree.is_processing().await);
    }

    #[tokio::test]
    async fn drain_queue_marks_cancelled() {
        let root = MessageNode::new_root("root".into(), incoming("hi"), "status-1".into());
        let tree = MessageTree::new(root);
        let child = MessageNode::new_child("child".into(), incoming("reply"), "status-2".into(), "root".into());
        tree.add_node(child).await;

        tree.try_start_or_queue("root").await;
        tree.try_start_or_queue("child").await;

        let cancelled = tree.drain_queue_and_mark_cancelled().await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].node_id, "child");
        assert_eq!(cancelled[0].error_message.as_deref(), Some("Cancelled by user"));
    }
}
