//! Debounced JSON session store (C16, §4.13) — ported in behavior from
//! `original_source/messaging/session.py`'s `SessionStore`, with persistence
//! made debounced rather than synchronous-on-every-write per spec.md §4.13 /
//! §9's design notes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skynet_core::config::SessionStoreConfig;
use skynet_tree::MessageNode;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::types::{chat_key, MessageLogEntry, SessionRecord, StoreData};

/// Persists `trees`, `node_to_tree`, `message_log` and legacy `sessions` to a
/// single JSON file, debouncing writes so bursts of updates coalesce into
/// one `fs::write` (§4.13, testable property "Debounced persistence").
pub struct SessionStore {
    path: PathBuf,
    debounce: Duration,
    message_log_cap: Option<usize>,
    data: Mutex<StoreData>,
    dirty: AtomicBool,
    notify: Notify,
}

impl SessionStore {
    /// Load any existing store file (missing/corrupt files start empty, per
    /// the original's `_load` which logs and continues) and spawn the
    /// debounce worker.
    pub fn spawn(config: &SessionStoreConfig) -> Arc<Self> {
        let data = Self::load_from_disk(Path::new(&config.path)).unwrap_or_else(|e| {
            warn!(error = %e, path = %config.path, "failed to load session store, starting empty");
            StoreData::default()
        });

        let store = Arc::new(Self {
            path: PathBuf::from(&config.path),
            debounce: Duration::from_millis(config.debounce_ms),
            message_log_cap: config.message_log_cap,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let worker = store.clone();
        tokio::spawn(async move { worker.debounce_loop().await });

        store
    }

    fn load_from_disk(path: &Path) -> Result<StoreData> {
        if !path.exists() {
            return Ok(StoreData::default());
        }
        let bytes = std::fs::read(path)?;
        let data: StoreData = serde_json::from_slice(&bytes)?;
        info!(
            sessions = data.sessions.len(),
            trees = data.trees.len(),
            "loaded session store"
        );
        Ok(data)
    }

    async fn debounce_loop(self: Arc<Self>) {
        loop {
            self.notify.notified().await;
            tokio::time::sleep(self.debounce).await;
            if self.dirty.swap(false, Ordering::SeqCst) {
                self.write_to_disk().await;
            }
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    async fn write_to_disk(&self) {
        let snapshot = self.data.lock().await.clone();
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                let tmp = self.path.with_extension("json.tmp");
                if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
                    error!(error = %e, "failed to write session store temp file");
                    return;
                }
                if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
                    error!(error = %e, "failed to commit session store file");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize session store"),
        }
    }

    /// Force an immediate write regardless of the debounce timer (shutdown
    /// path, §5 "Shutdown path").
    pub async fn flush_pending_save(&self) {
        if self.dirty.swap(false, Ordering::SeqCst) {
            self.write_to_disk().await;
        }
    }

    // ---------------------------------------------------------------
    // Tree persistence
    // ---------------------------------------------------------------

    /// Replace one tree's node map and recompute its `node_to_tree` entries.
    pub async fn save_tree(&self, root_id: &str, nodes: HashMap<String, MessageNode>) {
        let mut data = self.data.lock().await;
        for node_id in nodes.keys() {
            data.node_to_tree.insert(node_id.clone(), root_id.to_string());
        }
        data.trees.insert(root_id.to_string(), nodes);
        drop(data);
        self.mark_dirty();
        debug!(root_id, "saved tree to session store");
    }

    /// Persist the entire forest snapshot at once (e.g. after a batch of
    /// tree mutations produced by `TreeQueueManager::to_snapshot`).
    pub async fn save_all_trees(&self, snapshot: HashMap<String, HashMap<String, MessageNode>>) {
        let mut data = self.data.lock().await;
        data.node_to_tree.clear();
        for (root_id, nodes) in &snapshot {
            for node_id in nodes.keys() {
                data.node_to_tree.insert(node_id.clone(), root_id.clone());
            }
        }
        data.trees = snapshot;
        drop(data);
        self.mark_dirty();
    }

    pub async fn get_all_trees(&self) -> HashMap<String, HashMap<String, MessageNode>> {
        self.data.lock().await.trees.clone()
    }

    pub async fn register_node(&self, node_id: &str, root_id: &str) {
        let mut data = self.data.lock().await;
        data.node_to_tree.insert(node_id.to_string(), root_id.to_string());
        drop(data);
        self.mark_dirty();
    }

    // ---------------------------------------------------------------
    // Legacy session records
    // ---------------------------------------------------------------

    pub async fn save_session(&self, session_id: &str, chat_id: &str, initial_msg_id: &str, platform: &str) {
        let now = Utc::now().to_rfc3339();
        let record = SessionRecord {
            session_id: session_id.to_string(),
            chat_id: chat_id.to_string(),
            initial_msg_id: initial_msg_id.to_string(),
            last_msg_id: initial_msg_id.to_string(),
            platform: platform.to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        let mut data = self.data.lock().await;
        data.sessions.insert(session_id.to_string(), record);
        drop(data);
        self.mark_dirty();
    }

    pub async fn get_session_record(&self, session_id: &str) -> Option<SessionRecord> {
        self.data.lock().await.sessions.get(session_id).cloned()
    }

    // ---------------------------------------------------------------
    // Message log (best-effort chat clearing)
    // ---------------------------------------------------------------

    /// Append `message_id` to the chat's message log, deduplicated and
    /// optionally capped (§4.13 `record_message_id`).
    pub async fn record_message_id(&self, platform: &str, chat_id: &str, message_id: &str, direction: &str, kind: &str) {
        let key = chat_key(platform, chat_id);
        let mut data = self.data.lock().await;
        let log = data.message_log.entry(key).or_default();
        if log.iter().any(|e| e.message_id == message_id) {
            return;
        }
        log.push(MessageLogEntry {
            message_id: message_id.to_string(),
            ts: Utc::now().to_rfc3339(),
            direction: direction.to_string(),
            kind: kind.to_string(),
        });
        if let Some(cap) = self.message_log_cap {
            if log.len() > cap {
                let overflow = log.len() - cap;
                log.drain(0..overflow);
            }
        }
        drop(data);
        self.mark_dirty();
    }

    pub async fn get_message_ids_for_chat(&self, platform: &str, chat_id: &str) -> Vec<String> {
        let key = chat_key(platform, chat_id);
        self.data
            .lock()
            .await
            .message_log
            .get(&key)
            .map(|log| log.iter().map(|e| e.message_id.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn clear_message_log_for_chat(&self, platform: &str, chat_id: &str) {
        let key = chat_key(platform, chat_id);
        let mut data = self.data.lock().await;
        data.message_log.remove(&key);
        drop(data);
        self.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn test_config(path: &Path, debounce_ms: u64) -> SessionStoreConfig {
        SessionStoreConfig {
            path: path.to_string_lossy().into_owned(),
            debounce_ms,
            message_log_cap: None,
        }
    }

    #[tokio::test]
    async fn debounced_writes_coalesce_into_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::spawn(&test_config(&path, 80));

        for i in 0..5 {
            store.record_message_id("test", "chat-1", &format!("m{i}"), "out", "status").await;
        }

        assert!(!path.exists(), "should not have written yet (debounced)");
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert!(path.exists());

        let written = std::fs::read_to_string(&path).unwrap();
        let data: StoreData = serde_json::from_str(&written).unwrap();
        assert_eq!(data.message_log.get("test:chat-1").unwrap().len(), 5);
    }

    #[tokio::test]
    async fn flush_pending_save_writes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::spawn(&test_config(&path, 5_000));

        store.record_message_id("test", "chat-1", "m1", "out", "status").await;
        store.flush_pending_save().await;

        assert!(path.exists());
    }

    #[tokio::test]
    async fn record_message_id_dedups_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::spawn(&test_config(&path, 5_000));

        store.record_message_id("test", "chat-1", "dup", "out", "status").await;
        store.record_message_id("test", "chat-1", "dup", "out", "status").await;

        let ids = store.get_message_ids_for_chat("test", "chat-1").await;
        assert_eq!(ids, vec!["dup".to_string()]);
    }

    #[tokio::test]
    async fn message_log_cap_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let mut config = test_config(&path, 5_000);
        config.message_log_cap = Some(2);
        let store = SessionStore::spawn(&config);

        for i in 0..4 {
            store.record_message_id("test", "chat-1", &format!("m{i}"), "out", "status").await;
        }

        let ids = store.get_message_ids_for_chat("test", "chat-1").await;
        assert_eq!(ids, vec!["m2".to_string(), "m3".to_string()]);
    }

    #[tokio::test]
    async fn save_tree_updates_node_to_tree_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::spawn(&test_config(&path, 5_000));

        let mut nodes = HashMap::new();
        nodes.insert(
            "root".to_string(),
            skynet_tree::MessageNode::new_root(
                "root".to_string(),
                skynet_core::types::IncomingMessage {
                    text: "hi".into(),
                    chat_id: "c1".into(),
                    user_id: "u1".into(),
                    message_id: "root".into(),
                    platform: "test".into(),
                    reply_to_message_id: None,
                    username: None,
                    timestamp: Utc::now(),
                    raw_event: serde_json::json!({}),
                },
                "status-1".to_string(),
            ),
        );
        store.save_tree("root", nodes).await;

        let trees = store.get_all_trees().await;
        assert!(trees.contains_key("root"));
    }

    #[tokio::test]
    async fn reload_restores_previously_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let store = SessionStore::spawn(&test_config(&path, 20));
            store.record_message_id("test", "chat-1", "m1", "out", "status").await;
            store.flush_pending_save().await;
        }

        let reloaded = SessionStore::spawn(&test_config(&path, 20));
        let ids = reloaded.get_message_ids_for_chat("test", "chat-1").await;
        assert_eq!(ids, vec!["m1".to_string()]);
    }
}
