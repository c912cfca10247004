//! Pool of [`CliSession`]s, one per active conversation (C12, §4.11) —
//! ported in behavior from `cli/manager.py`'s `CLISessionManager`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CliError;
use crate::session::CliSession;

struct ManagerState {
    sessions: HashMap<String, Arc<CliSession>>,
    pending_sessions: HashMap<String, Arc<CliSession>>,
    temp_to_real: HashMap<String, String>,
}

/// Statistics snapshot for diagnostics (§4.11).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub pending_sessions: usize,
    pub max_sessions: usize,
    pub busy_count: usize,
}

/// Owns every live CLI subprocess. A new conversation gets its own
/// [`CliSession`]; replies reuse the session keyed by the agent's real
/// session id, routed through a temp id until that id is known.
pub struct CliSessionManager {
    workspace: PathBuf,
    api_url: String,
    allowed_dirs: Vec<PathBuf>,
    cli_command: String,
    max_sessions: usize,
    state: Mutex<ManagerState>,
}

impl CliSessionManager {
    pub fn new(
        workspace: PathBuf,
        api_url: String,
        allowed_dirs: Vec<PathBuf>,
        cli_command: String,
        max_sessions: usize,
    ) -> Self {
        info!(max_sessions, "CLISessionManager initialized");
        Self {
            workspace,
            api_url,
            allowed_dirs,
            cli_command,
            max_sessions,
            state: Mutex::new(ManagerState {
                sessions: HashMap::new(),
                pending_sessions: HashMap::new(),
                temp_to_real: HashMap::new(),
            }),
        }
    }

    /// Get the session behind `session_id` (resolving a temp id if needed),
    /// or spin up a new one. Returns `(session, id_to_use, is_new)`.
    pub async fn get_or_create_session(
        &self,
        session_id: Option<&str>,
    ) -> Result<(Arc<CliSession>, String, bool), CliError> {
        let mut state = self.state.lock().await;

        if let Some(sid) = session_id {
            let lookup_id = state.temp_to_real.get(sid).cloned().unwrap_or_else(|| sid.to_string());

            if let Some(session) = state.sessions.get(&lookup_id) {
                return Ok((session.clone(), lookup_id, false));
            }
            if let Some(session) = state.pending_sessions.get(&lookup_id) {
                return Ok((session.clone(), lookup_id, false));
            }
        }

        let mut total = state.sessions.len() + state.pending_sessions.len();
        if total >= self.max_sessions {
            let idle = Self::take_idle_sessions(&mut state);
            drop(state);
            for (sid, session) in idle {
                session.stop().await;
                debug!(session_id = %sid, "cleaned up idle CLI session");
            }
            state = self.state.lock().await;
            total = state.sessions.len() + state.pending_sessions.len();
            if total >= self.max_sessions {
                return Err(CliError::SessionLimitReached { max: self.max_sessions });
            }
        }

        let temp_id = match session_id {
            Some(sid) => sid.to_string(),
            None => format!("pending_{}", &Uuid::new_v4().simple().to_string()[..8]),
        };

        let session = Arc::new(CliSession::new(
            self.workspace.clone(),
            self.api_url.clone(),
            self.allowed_dirs.clone(),
            self.cli_command.clone(),
        ));
        state.pending_sessions.insert(temp_id.clone(), session.clone());
        info!(temp_id = %temp_id, "created new CLI session");

        Ok((session, temp_id, true))
    }

    /// Promote a pending session to the agent's real session id, once the
    /// CLI has reported one (§4.11 rebind).
    pub async fn register_real_session_id(&self, temp_id: &str, real_session_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(session) = state.pending_sessions.remove(temp_id) else {
            warn!(temp_id, "temp session not found");
            return false;
        };
        state.sessions.insert(real_session_id.to_string(), session);
        state
            .temp_to_real
            .insert(temp_id.to_string(), real_session_id.to_string());
        info!(temp_id, real_session_id, "registered CLI session");
        true
    }

    pub async fn get_real_session_id(&self, temp_id: &str) -> Option<String> {
        self.state.lock().await.temp_to_real.get(temp_id).cloned()
    }

    pub async fn remove_session(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().await;

        if let Some(session) = state.pending_sessions.remove(session_id) {
            drop(state);
            session.stop().await;
            return true;
        }

        if let Some(session) = state.sessions.remove(session_id) {
            state
                .temp_to_real
                .retain(|_, real| real != session_id);
            drop(state);
            session.stop().await;
            return true;
        }

        false
    }

    /// Remove up to three idle (non-busy) registered sessions from `state` to
    /// free room for a new one, returning them for the caller to `stop()`
    /// after releasing the lock — §5 forbids holding it across subprocess I/O.
    fn take_idle_sessions(state: &mut ManagerState) -> Vec<(String, Arc<CliSession>)> {
        let idle: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, s)| !s.is_busy())
            .map(|(sid, _)| sid.clone())
            .take(3)
            .collect();

        idle.into_iter()
            .filter_map(|sid| state.sessions.remove(&sid).map(|session| (sid, session)))
            .collect()
    }

    /// Stop every session, active or pending (used on shutdown and by `/stop`).
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        let sessions: Vec<Arc<CliSession>> = state
            .sessions
            .values()
            .chain(state.pending_sessions.values())
            .cloned()
            .collect();

        for session in sessions {
            session.stop().await;
        }

        state.sessions.clear();
        state.pending_sessions.clear();
        state.temp_to_real.clear();
        info!("all CLI sessions stopped");
    }

    pub async fn get_stats(&self) -> SessionStats {
        let state = self.state.lock().await;
        SessionStats {
            active_sessions: state.sessions.len(),
            pending_sessions: state.pending_sessions.len(),
            max_sessions: self.max_sessions,
            busy_count: state.sessions.values().filter(|s| s.is_busy()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_sessions: usize) -> CliSessionManager {
        CliSessionManager::new(
            PathBuf::from("/tmp"),
            "http://localhost:8080/v1".into(),
            vec![],
            "claude".into(),
            max_sessions,
        )
    }

    #[tokio::test]
    async fn creates_pending_session_without_explicit_id() {
        let mgr = manager(10);
        let (_, id, is_new) = mgr.get_or_create_session(None).await.unwrap();
        assert!(is_new);
        assert!(id.starts_with("pending_"));
        let stats = mgr.get_stats().await;
        assert_eq!(stats.pending_sessions, 1);
    }

    #[tokio::test]
    async fn register_real_session_id_promotes_pending_session() {
        let mgr = manager(10);
        let (_, temp_id, _) = mgr.get_or_create_session(None).await.unwrap();
        assert!(mgr.register_real_session_id(&temp_id, "real-1").await);

        let (_, resolved_id, is_new) = mgr.get_or_create_session(Some(&temp_id)).await.unwrap();
        assert!(!is_new);
        assert_eq!(resolved_id, "real-1");

        let stats = mgr.get_stats().await;
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.pending_sessions, 0);
    }

    #[tokio::test]
    async fn session_limit_reached_errors() {
        let mgr = manager(1);
        mgr.get_or_create_session(None).await.unwrap();
        let err = mgr.get_or_create_session(None).await.unwrap_err();
        assert!(matches!(err, CliError::SessionLimitReached { max: 1 }));
    }

    #[tokio::test]
    async fn remove_session_clears_temp_mapping() {
        let mgr = manager(10);
        let (_, temp_id, _) = mgr.get_or_create_session(None).await.unwrap();
        mgr.register_real_session_id(&temp_id, "real-1").await;

        assert!(mgr.remove_session("real-1").await);
        assert!(mgr.get_real_session_id(&temp_id).await.is_none());
        let stats = mgr.get_stats().await;
        assert_eq!(stats.active_sessions, 0);
    }
}
