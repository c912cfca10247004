//! The adapter seam every messaging platform (Telegram, …) implements —
//! ported in behavior from `messaging/base.py`'s `MessagingPlatform` ABC.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use skynet_core::types::IncomingMessage;

use crate::error::ChannelError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Registered by [`crate::handler::ClaudeMessageHandler`] to receive every
/// normalized inbound message an adapter produces.
pub type MessageHandler = std::sync::Arc<dyn Fn(IncomingMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Base behavior every messaging platform adapter implements (Telegram, …).
///
/// Implementors typically own a [`crate::limiter::MessagingRateLimiter`] and
/// use it internally to throttle and compact `send_message`/`edit_message`
/// calls; the `queue_*` methods are the explicit opt-in path for callers
/// that want queuing semantics without going through direct sends.
#[async_trait]
pub trait MessagingPlatform: Send + Sync {
    /// Stable lowercase identifier (e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// Initialize and connect to the messaging platform.
    async fn start(&self) -> Result<(), ChannelError>;

    /// Disconnect and clean up resources.
    async fn stop(&self) -> Result<(), ChannelError>;

    /// Send a message, returning the platform's id for it.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
        parse_mode: Option<&str>,
    ) -> Result<String, ChannelError>;

    /// Edit an existing message in place.
    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), ChannelError>;

    /// Delete a message.
    async fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<(), ChannelError>;

    /// Enqueue a send through the rate limiter. When `fire_and_forget` is
    /// true, returns `None` immediately; otherwise waits for the limiter and
    /// returns the sent message's id.
    async fn queue_send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
        parse_mode: Option<&str>,
        fire_and_forget: bool,
    ) -> Result<Option<String>, ChannelError>;

    /// Enqueue an edit through the rate limiter, compacted by `message_id` so
    /// bursts of rapid updates to the same message collapse to the latest.
    async fn queue_edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        parse_mode: Option<&str>,
        fire_and_forget: bool,
    ) -> Result<(), ChannelError>;

    /// Enqueue a delete through the rate limiter.
    async fn queue_delete_message(
        &self,
        chat_id: &str,
        message_id: &str,
        fire_and_forget: bool,
    ) -> Result<(), ChannelError>;

    /// Register the callback invoked for each incoming message.
    fn on_message(&self, handler: MessageHandler);

    /// Run a future to completion without the caller awaiting it.
    fn fire_and_forget(&self, task: BoxFuture<'static, ()>);

    /// Whether the platform is currently connected.
    fn is_connected(&self) -> bool {
        false
    }
}
