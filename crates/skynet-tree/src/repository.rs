//! Maps node ids to the tree that owns them, across the whole forest
//! (§3 `TreeRepository`, grounded on `tree_repository.py`).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use skynet_core::types::IncomingMessage;

use crate::node::MessageNode;
use crate::tree::MessageTree;

/// Owns every active [`MessageTree`] and the reverse index from any node id
/// in the forest to its root id, so a reply can be routed to the right tree
/// without scanning all of them.
pub struct TreeRepository {
    trees: DashMap<String, Arc<MessageTree>>,
    node_to_root: DashMap<String, String>,
}

impl Default for TreeRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeRepository {
    pub fn new() -> Self {
        Self {
            trees: DashMap::new(),
            node_to_root: DashMap::new(),
        }
    }

    /// Start a brand new tree rooted at `incoming`, keyed by `root_node_id`.
    pub fn create_tree(
        &self,
        root_node_id: String,
        incoming: IncomingMessage,
        status_message_id: String,
    ) -> Arc<MessageTree> {
        let root = MessageNode::new_root(root_node_id.clone(), incoming, status_message_id);
        let tree = Arc::new(MessageTree::new(root));
        self.node_to_root.insert(root_node_id.clone(), root_node_id.clone());
        self.trees.insert(root_node_id, tree.clone());
        tree
    }

    pub fn get_tree_by_root(&self, root_id: &str) -> Option<Arc<MessageTree>> {
        self.trees.get(root_id).map(|t| t.clone())
    }

    pub fn get_tree_by_node(&self, node_id: &str) -> Option<Arc<MessageTree>> {
        let root_id = self.node_to_root.get(node_id)?.clone();
        self.trees.get(&root_id).map(|t| t.clone())
    }

    /// Fetch a node from whichever tree owns it.
    pub async fn get_node(&self, node_id: &str) -> Option<MessageNode> {
        self.get_tree_by_node(node_id)?.get_node(node_id).await
    }

    pub fn register_node(&self, node_id: String, root_id: String) {
        self.node_to_root.insert(node_id, root_id);
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.node_to_root.contains_key(node_id)
    }

    pub fn has_tree(&self, root_id: &str) -> bool {
        self.trees.contains_key(root_id)
    }

    /// Resolve any id that belongs to a tree (a real node, or one of its
    /// status message ids) down to the node id that should act as the
    /// parent for a reply (grounded on `resolve_parent_node_id`).
    pub async fn resolve_parent_node_id(&self, msg_id: &str) -> Option<String> {
        let tree = self.get_tree_by_node(msg_id)?;
        if tree.has_node(msg_id).await {
            return Some(msg_id.to_string());
        }
        tree.find_node_by_status_message(msg_id).await.map(|n| n.node_id)
    }

    /// Recursively collect a node's still-pending descendants, used to
    /// cascade an error downward (§4.12).
    pub async fn get_pending_children(&self, node_id: &str) -> Vec<MessageNode> {
        let mut pending = Vec::new();
        let Some(tree) = self.get_tree_by_node(node_id) else {
            return pending;
        };
        let Some(node) = tree.get_node(node_id).await else {
            return pending;
        };
        for child_id in &node.children_ids {
            if let Some(child) = tree.get_node(child_id).await {
                if matches!(child.state, skynet_core::types::MessageState::Pending) {
                    pending.push(child.clone());
                    pending.extend(Box::pin(self.get_pending_children(&child.node_id)).await);
                }
            }
        }
        pending
    }

    pub fn all_trees(&self) -> Vec<Arc<MessageTree>> {
        self.trees.iter().map(|e| e.value().clone()).collect()
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Restore a tree (and its reverse index) from a persisted node map,
    /// used by startup recovery (§4.13).
    pub fn restore_tree(&self, root_id: String, nodes: HashMap<String, MessageNode>) -> Arc<MessageTree> {
        for node_id in nodes.keys() {
            self.node_to_root.insert(node_id.clone(), root_id.clone());
        }
        let tree = Arc::new(MessageTree::from_nodes(root_id.clone(), nodes));
        self.trees.insert(root_id, tree.clone());
        tree
    }

    pub fn remove_tree(&self, root_id: &str) {
        if let Some((_, _tree)) = self.trees.remove(root_id) {
            self.node_to_root.retain(|_, r| r != root_id);
        }
    }
}
