//! Global outbound-message rate limiter with task compaction (C3, §4.7) —
//! ported in behavior from `messaging/limiter.py`'s `MessagingRateLimiter`.
//!
//! A single [`SlidingWindowLimiter`](skynet_core::SlidingWindowLimiter) gates
//! throughput; a FIFO of dedup keys in front of it means that rapid repeat
//! edits to the same status message collapse into whichever call was
//! enqueued most recently by the time the worker gets to it, instead of
//! replaying every intermediate edit.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use skynet_core::SlidingWindowLimiter;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::error::ChannelError;

type TaskResult = Result<String, ChannelError>;
type TaskFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = TaskResult> + Send>> + Send>;

struct QueueEntry {
    func: TaskFn,
    waiters: Vec<oneshot::Sender<TaskResult>>,
}

struct QueueState {
    order: VecDeque<String>,
    entries: HashMap<String, QueueEntry>,
}

/// Process-wide outbound rate limiter shared by every messaging adapter.
pub struct MessagingRateLimiter {
    limiter: SlidingWindowLimiter,
    queue: Mutex<QueueState>,
    notify: Notify,
    shutdown: AtomicBool,
    /// Monotonic-clock millis until which the worker should pause (FloodWait).
    paused_until_ms: AtomicI64,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MessagingRateLimiter {
    pub fn new(rate_limit: u32, rate_window_secs: f64) -> Arc<Self> {
        let limiter = SlidingWindowLimiter::new(rate_limit, rate_window_secs)
            .expect("messaging rate limit config must be positive");

        let this = Arc::new(Self {
            limiter,
            queue: Mutex::new(QueueState {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            paused_until_ms: AtomicI64::new(0),
            worker: std::sync::Mutex::new(None),
        });

        let worker_handle = {
            let this = this.clone();
            tokio::spawn(async move { this.run_worker().await })
        };
        *this.worker.lock().expect("worker mutex poisoned") = Some(worker_handle);

        info!(rate_limit, rate_window_secs, "MessagingRateLimiter started (task compaction)");
        this
    }

    async fn run_worker(self: Arc<Self>) {
        info!("MessagingRateLimiter worker started");
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let popped = {
                let mut queue = self.queue.lock().await;
                loop {
                    if let Some(key) = queue.order.pop_front() {
                        break Some((key.clone(), queue.entries.remove(&key).unwrap()));
                    }
                    if self.shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                    drop(queue);
                    self.notify.notified().await;
                    queue = self.queue.lock().await;
                }
            };

            let Some((dedup_key, entry)) = popped else {
                break;
            };

            let now_ms = now_millis();
            let paused_until = self.paused_until_ms.load(Ordering::SeqCst);
            if paused_until > now_ms {
                let wait = Duration::from_millis((paused_until - now_ms) as u64);
                warn!(wait_secs = wait.as_secs_f64(), "limiter worker paused, waiting out FloodWait");
                tokio::time::sleep(wait).await;
            }

            self.limiter.acquire().await;

            let result = (entry.func)().await;
            if let Err(e) = &result {
                if let Some(secs) = e.flood_wait_secs() {
                    error!(seconds = secs, "FloodWait detected, pausing limiter worker");
                    self.paused_until_ms
                        .store(now_millis() + (secs as i64) * 1000, Ordering::SeqCst);
                } else {
                    error!(key = %dedup_key, error = %e, "error in limiter worker");
                }
            }

            for waiter in entry.waiters {
                let _ = waiter.send(match &result {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(clone_error(e)),
                });
            }
        }
        debug!("MessagingRateLimiter worker stopped");
    }

    async fn enqueue_internal(&self, func: TaskFn, waiter: oneshot::Sender<TaskResult>, dedup_key: String) {
        let mut queue = self.queue.lock().await;
        if let Some(existing) = queue.entries.get_mut(&dedup_key) {
            existing.func = func;
            existing.waiters.push(waiter);
            debug!(key = %dedup_key, waiters = existing.waiters.len(), "compacted task for key");
        } else {
            queue.entries.insert(dedup_key.clone(), QueueEntry { func, waiters: vec![waiter] });
            queue.order.push_back(dedup_key);
            // `notify_one` stores a permit for a worker that hasn't reached
            // `notified().await` yet; `notify_waiters` wakes only waiters
            // already parked and would drop this wakeup on the floor.
            self.notify.notify_one();
        }
    }

    /// Enqueue a task and wait for its result. If `dedup_key` matches a task
    /// still sitting in the queue, this replaces that task's closure (task
    /// compaction) without reordering the queue.
    pub async fn enqueue<F>(&self, func: F, dedup_key: Option<String>) -> TaskResult
    where
        F: FnOnce() -> Pin<Box<dyn Future<Output = TaskResult> + Send>> + Send + 'static,
    {
        let key = dedup_key.unwrap_or_else(unique_key);
        let (tx, rx) = oneshot::channel();
        self.enqueue_internal(Box::new(func), tx, key).await;
        rx.await.unwrap_or_else(|_| Err(ChannelError::Transport("limiter worker dropped".into())))
    }

    /// Enqueue a task without waiting for the result, retrying up to twice on
    /// transient errors with exponential backoff (ported from the original's
    /// `_wrapped` retry loop).
    pub fn fire_and_forget<F>(self: &Arc<Self>, func: F, dedup_key: Option<String>)
    where
        F: Fn() -> Pin<Box<dyn Future<Output = TaskResult> + Send>> + Send + Sync + 'static,
    {
        let key = dedup_key.unwrap_or_else(unique_key);
        let this = self.clone();
        let func = Arc::new(func);
        tokio::spawn(async move {
            const MAX_RETRIES: u32 = 2;
            for attempt in 0..=MAX_RETRIES {
                let func = func.clone();
                let result = this
                    .enqueue(move || func(), Some(key.clone()))
                    .await;
                match result {
                    Ok(_) => return,
                    Err(e) if attempt < MAX_RETRIES && e.is_transient() => {
                        let wait = Duration::from_secs(2u64.pow(attempt));
                        warn!(attempt, error = %e, wait_secs = wait.as_secs(), "limiter fire_and_forget transient error, retrying");
                        tokio::time::sleep(wait).await;
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "final error in fire_and_forget");
                        return;
                    }
                }
            }
        });
    }

    /// Stop the background worker so shutdown doesn't hang (mirrors
    /// `MessagingRateLimiter.shutdown`).
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();

        let handle = self.worker.lock().expect("worker mutex poisoned").take();
        let Some(handle) = handle else { return };

        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!("MessagingRateLimiter worker did not stop before timeout");
        }
    }
}

fn clone_error(e: &ChannelError) -> ChannelError {
    match e {
        ChannelError::Transport(s) => ChannelError::Transport(s.clone()),
        ChannelError::Rejected(s) => ChannelError::Rejected(s.clone()),
        ChannelError::FloodWait { retry_after_secs } => ChannelError::FloodWait {
            retry_after_secs: *retry_after_secs,
        },
        ChannelError::NotConnected => ChannelError::NotConnected,
    }
}

fn now_millis() -> i64 {
    // Monotonic clock anchored at an arbitrary but stable epoch, matching the
    // original's use of asyncio's monotonic event-loop clock for FloodWait bookkeeping.
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(std::time::Instant::now);
    start.elapsed().as_millis() as i64
}

fn unique_key() -> String {
    format!("task_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ok_task(calls: Arc<AtomicUsize>, value: &'static str) -> impl Fn() -> Pin<Box<dyn Future<Output = TaskResult> + Send>> + Send + Sync + 'static {
        move || {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value.to_string())
            })
        }
    }

    #[tokio::test]
    async fn enqueue_runs_task_and_returns_result() {
        let limiter = MessagingRateLimiter::new(5, 1.0);
        let calls = Arc::new(AtomicUsize::new(0));
        let task = ok_task(calls.clone(), "hi");
        let result = limiter.enqueue(task, None).await.unwrap();
        assert_eq!(result, "hi");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compaction_runs_only_latest_task_for_same_key() {
        let limiter = MessagingRateLimiter::new(5, 1.0);
        let calls = Arc::new(AtomicUsize::new(0));

        let key = "status:chat-1:msg-1".to_string();
        let first = ok_task(calls.clone(), "first");
        let second = ok_task(calls.clone(), "second");

        // Enqueue first without awaiting so it's still sitting in the queue
        // when we enqueue the compacted replacement.
        let limiter_a = limiter.clone();
        let key_a = key.clone();
        let handle_a = tokio::spawn(async move { limiter_a.enqueue(first, Some(key_a)).await });

        tokio::task::yield_now().await;

        let result_b = limiter.enqueue(second, Some(key)).await.unwrap();
        let result_a = handle_a.await.unwrap().unwrap();

        assert_eq!(result_a, "second");
        assert_eq!(result_b, "second");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fire_and_forget_does_not_block_caller() {
        let limiter = MessagingRateLimiter::new(5, 1.0);
        let calls = Arc::new(AtomicUsize::new(0));
        limiter.fire_and_forget(ok_task(calls.clone(), "done"), None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
