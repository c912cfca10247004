//! Facade coordinating [`TreeRepository`] (data) with async FIFO processing
//! (§4.12 queueing & cancellation), grounded on `tree_queue.py`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use skynet_core::types::{IncomingMessage, MessageState};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::TreeError;
use crate::node::MessageNode;
use crate::repository::TreeRepository;
use crate::tree::MessageTree;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Processes one node, typically driving the CLI session and streaming a
/// reply back to the messaging platform.
pub type NodeProcessor = Arc<dyn Fn(String, MessageNode) -> BoxFuture + Send + Sync>;
/// Fired when a node is pushed onto a busy tree's FIFO, so the caller can
/// surface a "queued, position N" status update.
pub type QueueUpdateCallback = Arc<dyn Fn(Arc<MessageTree>) -> BoxFuture + Send + Sync>;
/// Fired when a queued node is dequeued and about to start.
pub type NodeStartedCallback = Arc<dyn Fn(Arc<MessageTree>, String) -> BoxFuture + Send + Sync>;

/// Drives the per-tree chain: runs a node, then keeps pulling the next
/// queued node until the tree is idle again, all inside one task so that
/// cancelling it stops the chain at the node currently in flight.
struct TreeQueueProcessor {
    processor: Mutex<Option<NodeProcessor>>,
    queue_update_callback: Mutex<Option<QueueUpdateCallback>>,
    node_started_callback: Mutex<Option<NodeStartedCallback>>,
}

impl TreeQueueProcessor {
    fn new() -> Self {
        Self {
            processor: Mutex::new(None),
            queue_update_callback: Mutex::new(None),
            node_started_callback: Mutex::new(None),
        }
    }

    /// Start `node_id` immediately if the tree is idle, otherwise queue it.
    /// Returns `true` when the node was queued (not started immediately).
    async fn enqueue_and_start(
        self: &Arc<Self>,
        tree: Arc<MessageTree>,
        node_id: String,
        processor: NodeProcessor,
    ) -> bool {
        *self.processor.lock().await = Some(processor);
        if tree.try_start_or_queue(&node_id).await {
            self.spawn_chain(tree, node_id);
            false
        } else {
            if let Some(cb) = self.queue_update_callback.lock().await.clone() {
                cb(tree.clone()).await;
            }
            true
        }
    }

    fn spawn_chain(self: &Arc<Self>, tree: Arc<MessageTree>, first_node_id: String) {
        let this = self.clone();
        let chain_tree = tree.clone();
        let handle = tokio::spawn(async move {
            this.run_chain(chain_tree, first_node_id).await;
        });
        let tree = tree.clone();
        tokio::spawn(async move {
            tree.set_current_task(handle).await;
        });
    }

    async fn run_chain(self: Arc<Self>, tree: Arc<MessageTree>, first_node_id: String) {
        let mut current = first_node_id;
        loop {
            if let Some(node) = tree.get_node(&current).await {
                let processor = self.processor.lock().await.clone();
                if let Some(p) = processor {
                    p(current.clone(), node).await;
                }
            }
            match tree.advance_queue().await {
                Some(next) => {
                    if let Some(cb) = self.node_started_callback.lock().await.clone() {
                        cb(tree.clone(), next.clone()).await;
                    }
                    current = next;
                }
                None => break,
            }
        }
    }

    async fn cancel_current(&self, tree: &Arc<MessageTree>) -> bool {
        tree.cancel_current_task().await
    }

    async fn set_queue_update_callback(&self, cb: Option<QueueUpdateCallback>) {
        *self.queue_update_callback.lock().await = cb;
    }

    async fn set_node_started_callback(&self, cb: Option<NodeStartedCallback>) {
        *self.node_started_callback.lock().await = cb;
    }
}

/// Top-level entry point for the conversation forest: creates trees, routes
/// replies, enqueues processing, and handles cancellation (§3, §4.12).
pub struct TreeQueueManager {
    repository: TreeRepository,
    processor: Arc<TreeQueueProcessor>,
    lock: Mutex<()>,
}

impl Default for TreeQueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeQueueManager {
    pub fn new() -> Self {
        info!("TreeQueueManager initialized");
        Self {
            repository: TreeRepository::new(),
            processor: Arc::new(TreeQueueProcessor::new()),
            lock: Mutex::new(()),
        }
    }

    pub async fn set_queue_update_callback(&self, cb: Option<QueueUpdateCallback>) {
        self.processor.set_queue_update_callback(cb).await;
    }

    pub async fn set_node_started_callback(&self, cb: Option<NodeStartedCallback>) {
        self.processor.set_node_started_callback(cb).await;
    }

    pub async fn create_tree(
        &self,
        node_id: String,
        incoming: IncomingMessage,
        status_message_id: String,
    ) -> Arc<MessageTree> {
        let _guard = self.lock.lock().await;
        let tree = self.repository.create_tree(node_id.clone(), incoming, status_message_id);
        info!(root_id = %node_id, "created new tree");
        tree
    }

    pub async fn add_to_tree(
        &self,
        parent_node_id: &str,
        node_id: String,
        incoming: IncomingMessage,
        status_message_id: String,
    ) -> Result<(Arc<MessageTree>, MessageNode), TreeError> {
        let tree = {
            let _guard = self.lock.lock().await;
            if !self.repository.has_node(parent_node_id) {
                return Err(TreeError::ParentNotFound(parent_node_id.to_string()));
            }
            self.repository
                .get_tree_by_node(parent_node_id)
                .ok_or_else(|| TreeError::ParentNotFound(parent_node_id.to_string()))?
        };

        let child = MessageNode::new_child(
            node_id.clone(),
            incoming,
            status_message_id,
            parent_node_id.to_string(),
        );
        tree.add_node(child.clone()).await;

        {
            let _guard = self.lock.lock().await;
            self.repository.register_node(node_id.clone(), tree.root_id().to_string());
        }

        info!(node_id = %node_id, root_id = %tree.root_id(), "added node to tree");
        Ok((tree, child))
    }

    pub fn get_tree(&self, root_id: &str) -> Option<Arc<MessageTree>> {
        self.repository.get_tree_by_root(root_id)
    }

    pub fn get_tree_for_node(&self, node_id: &str) -> Option<Arc<MessageTree>> {
        self.repository.get_tree_by_node(node_id)
    }

    pub async fn get_node(&self, node_id: &str) -> Option<MessageNode> {
        self.repository.get_node(node_id).await
    }

    pub async fn resolve_parent_node_id(&self, msg_id: &str) -> Option<String> {
        self.repository.resolve_parent_node_id(msg_id).await
    }

    pub async fn is_tree_busy(&self, root_id: &str) -> bool {
        match self.repository.get_tree_by_root(root_id) {
            Some(tree) => tree.is_processing().await,
            None => false,
        }
    }

    pub async fn is_node_tree_busy(&self, node_id: &str) -> bool {
        match self.repository.get_tree_by_node(node_id) {
            Some(tree) => tree.is_processing().await,
            None => false,
        }
    }

    /// Enqueue `node_id` for processing. Returns `true` if it was queued
    /// behind in-flight work, `false` if it started immediately.
    pub async fn enqueue(&self, node_id: &str, processor: NodeProcessor) -> bool {
        let Some(tree) = self.repository.get_tree_by_node(node_id) else {
            tracing::error!(node_id, "no tree found for node");
            return false;
        };
        self.processor
            .enqueue_and_start(tree, node_id.to_string(), processor)
            .await
    }

    pub async fn get_queue_size(&self, node_id: &str) -> usize {
        match self.repository.get_tree_by_node(node_id) {
            Some(tree) => tree.queue_size().await,
            None => 0,
        }
    }

    pub async fn get_pending_children(&self, node_id: &str) -> Vec<MessageNode> {
        self.repository.get_pending_children(node_id).await
    }

    /// Mark a node ERROR and, by default, cascade the same error to its
    /// still-pending descendants.
    pub async fn mark_node_error(
        &self,
        node_id: &str,
        error_message: &str,
        propagate_to_children: bool,
    ) -> Vec<MessageNode> {
        let Some(tree) = self.repository.get_tree_by_node(node_id) else {
            return Vec::new();
        };

        let mut affected = Vec::new();
        if let Some(node) = tree.get_node(node_id).await {
            tree.update_state(
                node_id,
                MessageState::Error,
                None,
                Some(error_message.to_string()),
            )
            .await;
            affected.push(node);
        }

        if propagate_to_children {
            for child in self.repository.get_pending_children(node_id).await {
                tree.update_state(
                    &child.node_id,
                    MessageState::Error,
                    None,
                    Some(format!("Parent failed: {error_message}")),
                )
                .await;
                affected.push(child);
            }
        }

        affected
    }

    /// Cancel everything active in one tree: abort the running task, drain
    /// the FIFO, then sweep any node left PENDING/IN_PROGRESS (§4.12).
    pub async fn cancel_tree(&self, root_id: &str) -> Vec<MessageNode> {
        let Some(tree) = self.repository.get_tree_by_root(root_id) else {
            return Vec::new();
        };

        let mut cancelled = Vec::new();

        if tree.cancel_current_task().await {
            if let Some(current_id) = tree.current_node_id().await {
                if let Some(node) = tree.get_node(&current_id).await {
                    if !node.state.is_terminal() {
                        tree.update_state(
                            &current_id,
                            MessageState::Error,
                            None,
                            Some("Cancelled by user".to_string()),
                        )
                        .await;
                        if let Some(updated) = tree.get_node(&current_id).await {
                            cancelled.push(updated);
                        }
                    }
                }
            }
        }

        cancelled.extend(tree.drain_queue_and_mark_cancelled().await);
        let cancelled_ids: std::collections::HashSet<_> =
            cancelled.iter().map(|n| n.node_id.clone()).collect();

        let mut cleanup_count = 0;
        for node in tree.all_nodes().await {
            if matches!(node.state, MessageState::Pending | MessageState::InProgress)
                && !cancelled_ids.contains(&node.node_id)
            {
                tree.update_state(
                    &node.node_id,
                    MessageState::Error,
                    None,
                    Some("Stale task cleaned up".to_string()),
                )
                .await;
                cleanup_count += 1;
            }
        }

        tree.reset_processing_state().await;

        if !cancelled.is_empty() {
            info!(root_id, count = cancelled.len(), "cancelled active nodes in tree");
        }
        if cleanup_count > 0 {
            info!(root_id, cleanup_count, "cleaned up stale nodes in tree");
        }

        cancelled
    }

    /// Cancel a single node without touching the rest of its tree.
    pub async fn cancel_node(&self, node_id: &str) -> Vec<MessageNode> {
        let Some(tree) = self.repository.get_tree_by_node(node_id) else {
            return Vec::new();
        };

        let Some(node) = tree.get_node(node_id).await else {
            return Vec::new();
        };
        if node.state.is_terminal() {
            return Vec::new();
        }

        if tree.is_current_node(node_id).await {
            self.processor.cancel_current(&tree).await;
        }
        tree.remove_from_queue(node_id).await;

        tree.update_state(
            node_id,
            MessageState::Error,
            None,
            Some("Cancelled by user".to_string()),
        )
        .await;

        match tree.get_node(node_id).await {
            Some(updated) => vec![updated],
            None => Vec::new(),
        }
    }

    pub async fn cancel_all(&self) -> Vec<MessageNode> {
        let _guard = self.lock.lock().await;
        let mut all = Vec::new();
        for tree in self.repository.all_trees() {
            all.extend(self.cancel_tree(tree.root_id()).await);
        }
        all
    }

    /// Mark any node left PENDING/IN_PROGRESS across the whole forest as
    /// ERROR. Run once at startup after restoring persisted trees (§4.13).
    pub async fn cleanup_stale_nodes(&self) -> usize {
        let mut count = 0;
        for tree in self.repository.all_trees() {
            for node in tree.all_nodes().await {
                if matches!(node.state, MessageState::Pending | MessageState::InProgress) {
                    tree.update_state(
                        &node.node_id,
                        MessageState::Error,
                        None,
                        Some("Lost during server restart".to_string()),
                    )
                    .await;
                    count += 1;
                }
            }
            tree.reset_processing_state().await;
        }
        if count > 0 {
            info!(count, "cleaned up stale nodes during startup");
        }
        count
    }

    pub fn get_tree_count(&self) -> usize {
        self.repository.tree_count()
    }

    pub fn register_node(&self, node_id: String, root_id: String) {
        self.repository.register_node(node_id, root_id);
    }

    /// Serialize every tree's nodes, keyed by root id, for the session store.
    pub async fn to_snapshot(
        &self,
    ) -> std::collections::HashMap<String, std::collections::HashMap<String, MessageNode>> {
        let mut snapshot = std::collections::HashMap::new();
        for tree in self.repository.all_trees() {
            snapshot.insert(tree.root_id().to_string(), tree.to_nodes_map().await);
        }
        debug!(trees = snapshot.len(), "tree forest snapshot taken");
        snapshot
    }

    /// Rebuild the forest from a persisted snapshot (startup restore, §4.13).
    pub fn restore_from_snapshot(
        &self,
        snapshot: std::collections::HashMap<String, std::collections::HashMap<String, MessageNode>>,
    ) {
        for (root_id, nodes) in snapshot {
            self.repository.restore_tree(root_id, nodes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn incoming(text: &str) -> IncomingMessage {
        IncomingMessage {
            text: text.to_string(),
            chat_id: "chat-1".to_string(),
            user_id: "user-1".to_string(),
            message_id: "msg-1".to_string(),
            platform: "test".to_string(),
            reply_to_message_id: None,
            username: None,
            timestamp: chrono::Utc::now(),
            raw_event: json!({}),
        }
    }

    fn counting_processor(counter: Arc<AtomicUsize>) -> NodeProcessor {
        Arc::new(move |_node_id, _node| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn create_tree_then_add_to_tree_routes_to_same_tree() {
        let manager = TreeQueueManager::new();
        manager
            .create_tree("root".into(), incoming("hi"), "status-1".into())
            .await;

        let (tree, child) = manager
            .add_to_tree("root", "child".into(), incoming("reply"), "status-2".into())
            .await
            .unwrap();

        assert_eq!(tree.root_id(), "root");
        assert_eq!(child.parent_id.as_deref(), Some("root"));
        assert_eq!(manager.get_tree_for_node("child").unwrap().root_id(), "root");
    }

    #[tokio::test]
    async fn add_to_tree_rejects_unknown_parent() {
        let manager = TreeQueueManager::new();
        let err = manager
            .add_to_tree("missing", "child".into(), incoming("reply"), "status-2".into())
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::ParentNotFound(_)));
    }

    #[tokio::test]
    async fn enqueue_runs_immediately_when_tree_idle() {
        let manager = TreeQueueManager::new();
        manager
            .create_tree("root".into(), incoming("hi"), "status-1".into())
            .await;

        let count = Arc::new(AtomicUsize::new(0));
        let queued = manager.enqueue("root", counting_processor(count.clone())).await;
        assert!(!queued);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!manager.is_tree_busy("root").await);
    }

    #[tokio::test]
    async fn second_enqueue_while_busy_is_queued_then_drained() {
        let manager = TreeQueueManager::new();
        manager
            .create_tree("root".into(), incoming("hi"), "status-1".into())
            .await;
        manager
            .add_to_tree("root", "child".into(), incoming("reply"), "status-2".into())
            .await
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let processor: NodeProcessor = {
            let count = count.clone();
            Arc::new(move |_node_id, _node| {
                let count = count.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
        };

        let first_queued = manager.enqueue("root", processor.clone()).await;
        let second_queued = manager.enqueue("child", processor).await;
        assert!(!first_queued);
        assert!(second_queued);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mark_node_error_propagates_to_pending_children() {
        let manager = TreeQueueManager::new();
        manager
            .create_tree("root".into(), incoming("hi"), "status-1".into())
            .await;
        manager
            .add_to_tree("root", "child".into(), incoming("reply"), "status-2".into())
            .await
            .unwrap();

        let affected = manager.mark_node_error("root", "boom", true).await;
        assert_eq!(affected.len(), 2);
        let child = manager.get_node("child").await.unwrap();
        assert_eq!(child.error_message.as_deref(), Some("Parent failed: boom"));
    }

    #[tokio::test]
    async fn cleanup_stale_nodes_marks_pending_as_error() {
        let manager = TreeQueueManager::new();
        manager
            .create_tree("root".into(), incoming("hi"), "status-1".into())
            .await;

        let cleaned = manager.cleanup_stale_nodes().await;
        assert_eq!(cleaned, 1);
        let root = manager.get_node("root").await.unwrap();
        assert_eq!(root.error_message.as_deref(), Some("Lost during server restart"));
    }
}
