//! Platform-agnostic Claude interaction workflow (C17) — ported in behavior
//! from `messaging/handler.py`'s `ClaudeMessageHandler`. Owns the tree-based
//! message queue: a new conversation creates a tree root, a reply becomes a
//! child of the node it replies to, and each tree processes its nodes
//! strictly in order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use skynet_cli::{parse_event, CliError, CliEvent, CliSessionManager, CompletionStatus, ParsedCliEvent};
use skynet_core::types::{IncomingMessage, MessageState};
use skynet_sessions::SessionStore;
use skynet_tree::{MessageNode, TreeQueueManager};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::platform::MessagingPlatform;

/// Prefixes used by our own status messages; an incoming message starting
/// with one of these is our echo, not a user request, and is dropped.
const STATUS_PREFIXES: [&str; 10] = ["⏳", "💭", "🔧", "✅", "❌", "🚀", "🤖", "📋", "📊", "🔄"];

#[derive(Default)]
struct Components {
    thinking: Vec<String>,
    tools: Vec<String>,
    subagents: Vec<String>,
    content: Vec<String>,
    errors: Vec<String>,
}

impl Components {
    fn is_empty(&self) -> bool {
        self.thinking.is_empty()
            && self.tools.is_empty()
            && self.subagents.is_empty()
            && self.content.is_empty()
            && self.errors.is_empty()
    }
}

pub struct ClaudeMessageHandler {
    platform: Arc<dyn MessagingPlatform>,
    cli_manager: Arc<CliSessionManager>,
    session_store: Arc<SessionStore>,
    tree_queue: Arc<TreeQueueManager>,
}

impl ClaudeMessageHandler {
    pub fn new(
        platform: Arc<dyn MessagingPlatform>,
        cli_manager: Arc<CliSessionManager>,
        session_store: Arc<SessionStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            platform,
            cli_manager,
            session_store,
            tree_queue: Arc::new(TreeQueueManager::new()),
        })
    }

    pub fn tree_queue(&self) -> &Arc<TreeQueueManager> {
        &self.tree_queue
    }

    /// Main entry point: routes commands, filters our own status echoes, and
    /// otherwise creates or extends a message tree and enqueues it.
    pub async fn handle_message(self: &Arc<Self>, incoming: IncomingMessage) {
        if incoming.text == "/stop" {
            self.handle_stop_command(&incoming).await;
            return;
        }
        if incoming.text == "/stats" {
            self.handle_stats_command(&incoming).await;
            return;
        }
        if STATUS_PREFIXES.iter().any(|p| incoming.text.starts_with(p)) {
            return;
        }

        let mut parent_node_id = None;
        let mut tree = None;

        if let Some(reply_to) = incoming.reply_to_message_id.clone() {
            if let Some(found_tree) = self.tree_queue.get_tree_for_node(&reply_to) {
                if let Some(resolved) = self.tree_queue.resolve_parent_node_id(&reply_to).await {
                    info!(parent_node = %resolved, "found tree for reply");
                    parent_node_id = Some(resolved);
                    tree = Some(found_tree);
                } else {
                    warn!(reply_to, "reply found a tree but no valid parent node, treating as new conversation");
                }
            }
        }

        let node_id = incoming.message_id.clone();

        let status_text = self.get_initial_status(tree.is_some(), parent_node_id.as_deref()).await;
        let status_msg_id = match self
            .platform
            .send_message(&incoming.chat_id, &status_text, Some(&incoming.message_id), None)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "failed to send initial status message");
                return;
            }
        };

        let tree = if let (Some(parent_id), Some(tree)) = (parent_node_id.clone(), tree) {
            let (tree, _child) = match self
                .tree_queue
                .add_to_tree(&parent_id, node_id.clone(), incoming.clone(), status_msg_id.clone())
                .await
            {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to add node to tree");
                    return;
                }
            };
            self.tree_queue.register_node(status_msg_id.clone(), tree.root_id().to_string());
            self.session_store.register_node(&status_msg_id, tree.root_id()).await;
            self.session_store.register_node(&node_id, tree.root_id()).await;
            tree
        } else {
            let tree = self
                .tree_queue
                .create_tree(node_id.clone(), incoming.clone(), status_msg_id.clone())
                .await;
            self.tree_queue.register_node(status_msg_id.clone(), tree.root_id().to_string());
            self.session_store.register_node(&node_id, tree.root_id()).await;
            self.session_store.register_node(&status_msg_id, tree.root_id()).await;
            tree
        };

        self.session_store.save_tree(tree.root_id(), tree.to_nodes_map().await).await;

        let this = self.clone();
        let processor: skynet_tree::NodeProcessor = Arc::new(move |node_id, node| {
            let this = this.clone();
            Box::pin(async move { this.process_node(node_id, node).await })
        });

        let was_queued = self.tree_queue.enqueue(&node_id, processor).await;

        if was_queued {
            let queue_size = self.tree_queue.get_queue_size(&node_id).await;
            let _ = self
                .platform
                .edit_message(
                    &incoming.chat_id,
                    &status_msg_id,
                    &format!("📋 **Queued** (position {queue_size}) - waiting..."),
                    Some("markdown"),
                )
                .await;
        }
    }

    /// Core task processor: drives one Claude CLI interaction for a single node.
    async fn process_node(self: Arc<Self>, node_id: String, node: MessageNode) {
        let incoming = node.incoming.clone();
        let status_msg_id = node.status_message_id.clone();
        let chat_id = incoming.chat_id.clone();

        let tree = self.tree_queue.get_tree_for_node(&node_id);
        if let Some(tree) = &tree {
            tree.update_state(&node_id, MessageState::InProgress, None, None).await;
        }

        let mut components = Components::default();
        let mut last_ui_update = Instant::now() - Duration::from_secs(10);
        let mut skip_until: Option<Instant> = None;

        let parent_session_id = if let (Some(tree), Some(_)) = (&tree, &node.parent_id) {
            let sid = tree.get_parent_session_id(&node_id).await;
            if let Some(sid) = &sid {
                info!(parent_session_id = %sid, "will fork from parent session");
            }
            sid
        } else {
            None
        };

        macro_rules! update_ui {
            ($status:expr, $force:expr) => {{
                let now = Instant::now();
                let forced: bool = $force;
                let throttled = !forced && now.duration_since(last_ui_update) < Duration::from_secs(1);
                let skipping = skip_until.map(|until| now < until).unwrap_or(false);
                if !throttled && !skipping {
                    let display = build_message(&components, $status);
                    if !display.is_empty() {
                        match self.platform.edit_message(&chat_id, &status_msg_id, &display, Some("markdown")).await {
                            Ok(()) => last_ui_update = now,
                            Err(e) => {
                                if e.flood_wait_secs().is_some() {
                                    skip_until = Some(now + Duration::from_secs(10));
                                }
                                warn!(error = %e, "UI update failed");
                            }
                        }
                    }
                }
            }};
        }

        let mut captured_session_id = None;
        let mut temp_session_id = None;

        let (cli_session, session_or_temp_id, is_new) =
            match self.cli_manager.get_or_create_session(parent_session_id.as_deref()).await {
                Ok(v) => v,
                Err(e @ CliError::SessionLimitReached { .. }) => {
                    components.errors.push(e.to_string());
                    update_ui!(Some("⏳ **Session limit reached**"), true);
                    if let Some(tree) = &tree {
                        tree.update_state(&node_id, MessageState::Error, None, Some(e.to_string())).await;
                    }
                    return;
                }
                Err(e) => {
                    components.errors.push(e.to_string());
                    update_ui!(Some("💥 **Task Failed**"), true);
                    if let Some(tree) = &tree {
                        tree.update_state(&node_id, MessageState::Error, None, Some(e.to_string())).await;
                    }
                    return;
                }
            };

        if is_new {
            temp_session_id = Some(session_or_temp_id);
        } else {
            captured_session_id = Some(session_or_temp_id);
        }

        let mut events = Box::pin(cli_session.start_task(incoming.text.clone(), captured_session_id.clone(), false));

        while let Some(event) = events.next().await {
            match event {
                CliEvent::SessionInfo { session_id } => {
                    if let Some(temp_id) = temp_session_id.take() {
                        self.cli_manager.register_real_session_id(&temp_id, &session_id).await;
                        captured_session_id = Some(session_id);
                    }
                }
                CliEvent::Json(value) => {
                    for parsed in parse_event(&value) {
                        self.apply_parsed_event(
                            parsed,
                            &node_id,
                            &tree,
                            &mut components,
                            &mut captured_session_id,
                            &mut last_ui_update,
                            &mut skip_until,
                            &chat_id,
                            &status_msg_id,
                        )
                        .await;
                    }
                }
                CliEvent::Raw(_) => {}
                CliEvent::Error { message } => {
                    components.errors.push(message.clone());
                    update_ui!(Some("❌ **Error**"), true);
                    self.propagate_error(&node_id, &message).await;
                }
                CliEvent::Exit { code, .. } => {
                    let status = if code == 0 { CompletionStatus::Success } else { CompletionStatus::Failed };
                    self.apply_parsed_event(
                        ParsedCliEvent::Complete { status },
                        &node_id,
                        &tree,
                        &mut components,
                        &mut captured_session_id,
                        &mut last_ui_update,
                        &mut skip_until,
                        &chat_id,
                        &status_msg_id,
                    )
                    .await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_parsed_event(
        &self,
        parsed: ParsedCliEvent,
        node_id: &str,
        tree: &Option<Arc<skynet_tree::MessageTree>>,
        components: &mut Components,
        captured_session_id: &mut Option<String>,
        last_ui_update: &mut Instant,
        skip_until: &mut Option<Instant>,
        chat_id: &str,
        status_msg_id: &str,
    ) {
        match parsed {
            ParsedCliEvent::Thinking { text } => {
                components.thinking.push(text);
                self.render(chat_id, status_msg_id, components, "🧠 **Claude is thinking...**", false, last_ui_update, skip_until)
                    .await;
            }
            ParsedCliEvent::Content { text } => {
                if !text.is_empty() {
                    components.content.push(text);
                    self.render(chat_id, status_msg_id, components, "🧠 **Claude is working...**", false, last_ui_update, skip_until)
                        .await;
                }
            }
            ParsedCliEvent::ToolStart { tools } => {
                for t in tools {
                    if let Some(name) = t.get("name").and_then(|v| v.as_str()) {
                        components.tools.push(name.to_string());
                    }
                }
                self.render(chat_id, status_msg_id, components, "⏳ **Executing tools...**", false, last_ui_update, skip_until)
                    .await;
            }
            ParsedCliEvent::SubagentStart { tasks } => {
                components.subagents.extend(tasks);
                self.render(chat_id, status_msg_id, components, "🤖 **Subagent working...**", false, last_ui_update, skip_until)
                    .await;
            }
            ParsedCliEvent::Complete { .. } => {
                if components.is_empty() {
                    components.content.push("Done.".to_string());
                }
                self.render(chat_id, status_msg_id, components, "✅ **Complete**", true, last_ui_update, skip_until)
                    .await;

                if let (Some(tree), Some(session_id)) = (tree, captured_session_id.clone()) {
                    tree.update_state(node_id, MessageState::Completed, Some(session_id), None).await;
                    self.session_store.save_tree(tree.root_id(), tree.to_nodes_map().await).await;
                }
            }
            ParsedCliEvent::Error { message } => {
                components.errors.push(message.clone());
                self.render(chat_id, status_msg_id, components, "❌ **Error**", true, last_ui_update, skip_until)
                    .await;
                self.propagate_error(node_id, &message).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn render(
        &self,
        chat_id: &str,
        status_msg_id: &str,
        components: &Components,
        status: &str,
        force: bool,
        last_ui_update: &mut Instant,
        skip_until: &mut Option<Instant>,
    ) {
        let now = Instant::now();
        let throttled = !force && now.duration_since(*last_ui_update) < Duration::from_secs(1);
        let skipping = skip_until.map(|until| now < until).unwrap_or(false);
        if throttled || skipping {
            return;
        }

        let display = build_message(components, Some(status));
        if display.is_empty() {
            return;
        }

        match self.platform.edit_message(chat_id, status_msg_id, &display, Some("markdown")).await {
            Ok(()) => *last_ui_update = now,
            Err(e) => {
                if e.flood_wait_secs().is_some() {
                    *skip_until = Some(now + Duration::from_secs(10));
                }
                warn!(error = %e, "UI update failed");
            }
        }
    }

    /// Mark a node and its pending descendants as errored, reflecting the
    /// cancellation in each affected child's status message.
    async fn propagate_error(&self, node_id: &str, message: &str) {
        let affected = self.tree_queue.mark_node_error(node_id, message, true).await;
        for child in affected.iter().skip(1) {
            let _ = self
                .platform
                .edit_message(
                    &child.incoming.chat_id,
                    &child.status_message_id,
                    "❌ **Cancelled:** Parent task failed",
                    Some("markdown"),
                )
                .await;
        }
    }

    async fn get_initial_status(&self, has_tree: bool, parent_node_id: Option<&str>) -> String {
        if has_tree {
            if let Some(parent_id) = parent_node_id {
                if self.tree_queue.is_node_tree_busy(parent_id).await {
                    let queue_size = self.tree_queue.get_queue_size(parent_id).await + 1;
                    return format!("📋 **Queued** (position {queue_size}) - waiting...");
                }
            }
            return "🔄 **Continuing conversation...**".to_string();
        }

        let stats = self.cli_manager.get_stats().await;
        if stats.active_sessions >= stats.max_sessions {
            return format!(
                "⏳ **Waiting for slot...** ({}/{})",
                stats.active_sessions, stats.max_sessions
            );
        }
        "⏳ **Launching new Claude CLI instance...**".to_string()
    }

    /// Stop every active/pending task: CLI subprocesses first (unblocks I/O),
    /// then tree queue tasks, then reflect the cancellation in each UI.
    pub async fn stop_all_tasks(&self) -> usize {
        info!("stopping all CLI sessions");
        self.cli_manager.stop_all().await;

        info!("cancelling tree queue tasks");
        let cancelled = self.tree_queue.cancel_all().await;
        info!(count = cancelled.len(), "cancelled nodes");

        for node in &cancelled {
            let _ = self
                .platform
                .edit_message(&node.incoming.chat_id, &node.status_message_id, "⏹ **Stopped.**", Some("markdown"))
                .await;
        }

        cancelled.len()
    }

    async fn handle_stop_command(&self, incoming: &IncomingMessage) {
        let count = self.stop_all_tasks().await;
        let _ = self
            .platform
            .send_message(
                &incoming.chat_id,
                &format!("⏹ **Stopped.** Cancelled {count} pending or active requests."),
                None,
                None,
            )
            .await;
    }

    async fn handle_stats_command(&self, incoming: &IncomingMessage) {
        let stats = self.cli_manager.get_stats().await;
        let tree_count = self.tree_queue.get_tree_count();
        let _ = self
            .platform
            .send_message(
                &incoming.chat_id,
                &format!(
                    "📊 **Stats**\n• Active CLI: {}\n• Max CLI: {}\n• Message Trees: {}",
                    stats.active_sessions, stats.max_sessions, tree_count
                ),
                None,
                None,
            )
            .await;
    }
}

/// Build the unified status message: thinking, tools, subagents, content,
/// errors, then the bottom status line, truncated to stay under the
/// messaging platform's length limit.
fn build_message(components: &Components, status: Option<&str>) -> String {
    let mut lines = Vec::new();

    if !components.thinking.is_empty() {
        let full = components.thinking.concat();
        let display = if full.chars().count() > 800 {
            let truncated: String = full.chars().take(795).collect();
            format!("{truncated}...")
        } else {
            full
        };
        lines.push(format!("💭 **Thinking:**\n```\n{display}\n```"));
    }

    if !components.tools.is_empty() {
        let mut seen = std::collections::HashSet::new();
        let unique: Vec<&String> = components.tools.iter().filter(|t| seen.insert(t.as_str())).collect();
        let joined = unique.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ");
        lines.push(format!("🛠 **Tools:** `{joined}`"));
    }

    for task in &components.subagents {
        lines.push(format!("🤖 **Subagent:** `{task}`"));
    }

    if !components.content.is_empty() {
        lines.push(components.content.concat());
    }

    for err in &components.errors {
        lines.push(format!("⚠️ **Error:** `{err}`"));
    }

    if let Some(status) = status {
        lines.push(String::new());
        lines.push(status.to_string());
    }

    let mut result = lines.join("\n");
    if result.chars().count() > 3800 {
        let tail: String = result.chars().rev().take(3795).collect::<Vec<_>>().into_iter().rev().collect();
        result = format!("...{tail}");
    }
    result
}
