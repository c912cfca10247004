//! Process registry (C10, §4.11) — a safety net for CLI subprocesses left
//! running if normal shutdown doesn't reach them. Ported in behavior from
//! `cli/process_registry.py`'s atexit hook: we only track PIDs we spawned
//! ourselves, so a best-effort kill here never touches unrelated processes.
//!
//! Safe Rust has no atexit hook equivalent to Python's `atexit.register` —
//! the gateway's shutdown path (§5) must call [`kill_all_best_effort`]
//! explicitly before the process exits (e.g. from its SIGINT/SIGTERM handler).

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use tracing::debug;

fn registry() -> &'static Mutex<HashSet<u32>> {
    static REGISTRY: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn register_pid(pid: u32) {
    if pid == 0 {
        return;
    }
    registry().lock().unwrap().insert(pid);
}

pub fn unregister_pid(pid: u32) {
    if pid == 0 {
        return;
    }
    registry().lock().unwrap().remove(&pid);
}

/// SIGKILL every still-registered pid, best-effort, then clear the registry.
pub fn kill_all_best_effort() {
    let pids: Vec<u32> = {
        let mut guard = registry().lock().unwrap();
        let pids = guard.iter().copied().collect();
        guard.clear();
        pids
    };

    if pids.is_empty() {
        return;
    }

    for pid in pids {
        #[cfg(unix)]
        {
            // SAFETY: `pid` was registered by us via `register_pid` for a
            // process we spawned; signalling it with SIGKILL is safe even if
            // it has already exited (the call simply fails with ESRCH).
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output();
        }
        debug!(pid, "process registry: best-effort kill");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_round_trip() {
        register_pid(999_999);
        assert!(registry().lock().unwrap().contains(&999_999));
        unregister_pid(999_999);
        assert!(!registry().lock().unwrap().contains(&999_999));
    }

    #[test]
    fn zero_pid_is_ignored() {
        register_pid(0);
        assert!(!registry().lock().unwrap().contains(&0));
    }
}
