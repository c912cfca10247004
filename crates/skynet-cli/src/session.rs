//! A single persistent CLI agent subprocess (C11, §4.11) — ported in behavior
//! (not code) from `cli/session.py`: spawn the agent CLI via
//! `tokio::process::Command`, stream NDJSON events off stdout in 64KiB
//! chunks, extract the session id from the first event that carries one, and
//! drain stderr on EOF.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// How many bytes to read off the CLI's stdout pipe per syscall (§4.11).
pub const STDOUT_CHUNK_SIZE: usize = 65536;
/// Grace period for SIGTERM before escalating to SIGKILL on `stop()` (§4.11).
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// One event surfaced from the CLI's stdout stream, or synthesized by the
/// session itself (`SessionInfo`, `Exit`).
#[derive(Debug, Clone)]
pub enum CliEvent {
    /// Synthesized the first time a session id is recognized in CLI output.
    SessionInfo { session_id: String },
    /// A successfully-parsed NDJSON event from the CLI.
    Json(Value),
    /// A non-JSON stdout line (logged, not silently dropped).
    Raw(String),
    /// Non-empty stderr captured after the process closed stdout.
    Error { message: String },
    /// The process has exited.
    Exit {
        code: i32,
        stderr: Option<String>,
    },
}

/// Manages one persistent CLI agent subprocess end-to-end.
pub struct CliSession {
    workspace: PathBuf,
    api_url: String,
    allowed_dirs: Vec<PathBuf>,
    cli_command: String,
    process: Mutex<Option<Child>>,
    current_session_id: Mutex<Option<String>>,
    is_busy: AtomicBool,
    run_lock: tokio::sync::Mutex<()>,
}

impl CliSession {
    pub fn new(
        workspace: PathBuf,
        api_url: String,
        allowed_dirs: Vec<PathBuf>,
        cli_command: String,
    ) -> Self {
        Self {
            workspace,
            api_url,
            allowed_dirs,
            cli_command,
            process: Mutex::new(None),
            current_session_id: Mutex::new(None),
            is_busy: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.is_busy.load(Ordering::SeqCst)
    }

    pub async fn current_session_id(&self) -> Option<String> {
        self.current_session_id.lock().await.clone()
    }

    fn build_command(&self, prompt: &str, session_id: Option<&str>, fork_session: bool) -> Command {
        let mut cmd = Command::new(&self.cli_command);

        if let Some(sid) = session_id.filter(|s| !s.starts_with("pending_")) {
            cmd.arg("--resume").arg(sid);
            if fork_session {
                cmd.arg("--fork-session");
            }
            info!(session_id = sid, "resuming CLI session");
        } else {
            info!("starting new CLI session");
        }

        cmd.arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--dangerously-skip-permissions")
            .arg("--verbose");

        for dir in &self.allowed_dirs {
            cmd.arg("--add-dir").arg(dir);
        }

        let api_base = self.api_url.strip_suffix("/v1").unwrap_or(&self.api_url);
        cmd.current_dir(&self.workspace)
            .env("ANTHROPIC_API_URL", &self.api_url)
            .env("ANTHROPIC_BASE_URL", api_base)
            .env("TERM", "dumb")
            .env("PYTHONIOENCODING", "utf-8")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if std::env::var_os("ANTHROPIC_API_KEY").is_none() {
            cmd.env("ANTHROPIC_API_KEY", "sk-placeholder-key-for-proxy");
        }

        cmd
    }

    /// Start a task and stream its events. Only one task runs at a time per
    /// session — a second call blocks on `run_lock` until the first finishes,
    /// mirroring the original's `asyncio.Lock`.
    ///
    /// Dropping the returned stream before exhaustion drops the spawned
    /// `Child` (via `kill_on_drop`), which kills the subprocess — the Rust
    /// analogue of the original shielding a `stop()` call on cancellation.
    pub fn start_task(
        self: Arc<Self>,
        prompt: String,
        session_id: Option<String>,
        fork_session: bool,
    ) -> impl Stream<Item = CliEvent> {
        async_stream::stream! {
            let _guard = self.run_lock.lock().await;
            self.is_busy.store(true, Ordering::SeqCst);

            let mut cmd = self.build_command(&prompt, session_id.as_deref(), fork_session);
            let mut child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "failed to spawn CLI process");
                    self.is_busy.store(false, Ordering::SeqCst);
                    yield CliEvent::Exit { code: 1, stderr: Some(e.to_string()) };
                    return;
                }
            };

            if let Some(pid) = child.id() {
                crate::registry::register_pid(pid);
            }

            let mut stdout = child.stdout.take();
            *self.process.lock().await = Some(child);

            let mut session_id_extracted = false;
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunk = vec![0u8; STDOUT_CHUNK_SIZE];

            if let Some(stdout) = stdout.as_mut() {
                loop {
                    let n = match stdout.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            warn!(error = %e, "error reading CLI stdout");
                            break;
                        }
                    };
                    buffer.extend_from_slice(&chunk[..n]);

                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        let line_str = String::from_utf8_lossy(&line[..line.len().saturating_sub(1)])
                            .trim()
                            .to_string();
                        if line_str.is_empty() {
                            continue;
                        }
                        for ev in self.handle_line(&line_str, &mut session_id_extracted).await {
                            yield ev;
                        }
                    }
                }

                if !buffer.is_empty() {
                    let line_str = String::from_utf8_lossy(&buffer).trim().to_string();
                    if !line_str.is_empty() {
                        for ev in self.handle_line(&line_str, &mut session_id_extracted).await {
                            yield ev;
                        }
                    }
                }
            }

            let mut stderr_text = None;
            let mut guard = self.process.lock().await;
            if let Some(child) = guard.as_mut() {
                if let Some(mut stderr) = child.stderr.take() {
                    let mut buf = Vec::new();
                    if stderr.read_to_end(&mut buf).await.is_ok() && !buf.is_empty() {
                        let s = String::from_utf8_lossy(&buf).trim().to_string();
                        if !s.is_empty() {
                            error!(stderr = %s, "CLI process stderr");
                            stderr_text = Some(s);
                        }
                    }
                }
            }
            if let Some(text) = &stderr_text {
                yield CliEvent::Error { message: text.clone() };
            }

            let code = if let Some(mut child) = guard.take() {
                drop(guard);
                let status = child.wait().await;
                if let Some(pid) = child.id() {
                    crate::registry::unregister_pid(pid);
                }
                status.ok().and_then(|s| s.code()).unwrap_or(-1)
            } else {
                -1
            };

            self.is_busy.store(false, Ordering::SeqCst);
            info!(code, "CLI process exited");
            yield CliEvent::Exit { code, stderr: stderr_text };
        }
    }

    async fn handle_line(&self, line: &str, session_id_extracted: &mut bool) -> Vec<CliEvent> {
        let mut out = Vec::new();
        match serde_json::from_str::<Value>(line) {
            Ok(event) => {
                if !*session_id_extracted {
                    if let Some(sid) = extract_session_id(&event) {
                        *self.current_session_id.lock().await = Some(sid.clone());
                        *session_id_extracted = true;
                        info!(session_id = %sid, "extracted CLI session id");
                        out.push(CliEvent::SessionInfo { session_id: sid });
                    }
                }
                out.push(CliEvent::Json(event));
            }
            Err(_) => out.push(CliEvent::Raw(line.to_string())),
        }
        out
    }

    /// Terminate the process: SIGTERM, then SIGKILL after [`STOP_GRACE`] if
    /// it hasn't exited. Returns `true` if a live process was found.
    pub async fn stop(&self) -> bool {
        let mut guard = self.process.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };

        let pid = child.id();
        if let Some(pid) = pid {
            info!(pid, "stopping CLI process");
        }

        #[cfg(unix)]
        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }

        if let Some(pid) = pid {
            crate::registry::unregister_pid(pid);
        }
        *guard = None;
        true
    }
}

/// Recover a session id from an agent-CLI event, mirroring the original's
/// `_extract_session_id` key fallbacks across vendor-specific event shapes.
fn extract_session_id(event: &Value) -> Option<String> {
    let obj = event.as_object()?;

    if let Some(s) = obj.get("session_id").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    if let Some(s) = obj.get("sessionId").and_then(Value::as_str) {
        return Some(s.to_string());
    }

    for key in ["init", "system", "result", "metadata"] {
        if let Some(nested) = obj.get(key).and_then(Value::as_object) {
            if let Some(s) = nested.get("session_id").and_then(Value::as_str) {
                return Some(s.to_string());
            }
            if let Some(s) = nested.get("sessionId").and_then(Value::as_str) {
                return Some(s.to_string());
            }
        }
    }

    if let Some(conv) = obj.get("conversation").and_then(Value::as_object) {
        if let Some(s) = conv.get("id").and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_top_level_session_id() {
        let ev = json!({"session_id": "abc123"});
        assert_eq!(extract_session_id(&ev), Some("abc123".into()));
    }

    #[test]
    fn extracts_camel_case_variant() {
        let ev = json!({"sessionId": "abc123"});
        assert_eq!(extract_session_id(&ev), Some("abc123".into()));
    }

    #[test]
    fn extracts_from_nested_init_block() {
        let ev = json!({"init": {"session_id": "nested1"}});
        assert_eq!(extract_session_id(&ev), Some("nested1".into()));
    }

    #[test]
    fn extracts_from_conversation_id() {
        let ev = json!({"conversation": {"id": "conv1"}});
        assert_eq!(extract_session_id(&ev), Some("conv1".into()));
    }

    #[test]
    fn returns_none_when_absent() {
        let ev = json!({"type": "text", "text": "hi"});
        assert_eq!(extract_session_id(&ev), None);
    }

    #[test]
    fn new_session_starts_idle() {
        let session = CliSession::new(
            PathBuf::from("/tmp"),
            "http://localhost:8080/v1".into(),
            vec![],
            "claude".into(),
        );
        assert!(!session.is_busy());
    }
}
