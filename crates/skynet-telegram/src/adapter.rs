//! Telegram implementation of [`skynet_channels::MessagingPlatform`].
//!
//! Built around teloxide's dptree [`Dispatcher`], the same long-polling
//! pattern the original adapter used, with direct send/edit/delete methods
//! plus the rate-limited `queue_*` variants backed by a
//! [`MessagingRateLimiter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use skynet_channels::platform::{BoxFuture, MessageHandler, MessagingPlatform};
use skynet_channels::{ChannelError, MessagingRateLimiter};
use skynet_core::types::IncomingMessage;

use crate::allow;
use crate::send::{escape_markdown_v2, split_chunks_smart};
use crate::typing::TypingHandle;

type SendResult = Result<String, ChannelError>;
type SendFuture = std::pin::Pin<Box<dyn std::future::Future<Output = SendResult> + Send>>;

/// Telegram adapter: owns the bot handle, the incoming-message callback, and
/// a background dispatcher task.
pub struct TelegramPlatform {
    bot: Bot,
    allowed_user_id: Option<String>,
    handler: Arc<StdMutex<Option<MessageHandler>>>,
    limiter: Arc<MessagingRateLimiter>,
    dispatch_task: AsyncMutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl TelegramPlatform {
    pub fn new(
        bot_token: String,
        allowed_user_id: Option<String>,
        rate_limit_n: u32,
        rate_window_secs: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            bot: Bot::new(bot_token),
            allowed_user_id,
            handler: Arc::new(StdMutex::new(None)),
            limiter: MessagingRateLimiter::new(rate_limit_n, rate_window_secs),
            dispatch_task: AsyncMutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn parse_chat_id(chat_id: &str) -> Result<ChatId, ChannelError> {
        chat_id
            .parse::<i64>()
            .map(ChatId)
            .map_err(|e| ChannelError::Rejected(format!("invalid chat id {chat_id}: {e}")))
    }

    fn parse_message_id(message_id: &str) -> Result<teloxide::types::MessageId, ChannelError> {
        message_id
            .parse::<i32>()
            .map(teloxide::types::MessageId)
            .map_err(|e| ChannelError::Rejected(format!("invalid message id {message_id}: {e}")))
    }

    /// Build a self-contained closure the rate limiter can invoke later,
    /// without capturing `&self` (the limiter's task queue must be `'static`).
    fn queued_send(&self, chat_id: String, text: String, parse_mode: Option<String>) -> impl FnOnce() -> SendFuture {
        let bot = self.bot.clone();
        move || {
            Box::pin(async move {
                let chat_id = TelegramPlatform::parse_chat_id(&chat_id)?;
                send_via_bot(&bot, chat_id, &text, parse_mode.as_deref()).await
            }) as SendFuture
        }
    }

    fn queued_edit(
        &self,
        chat_id: String,
        message_id: String,
        text: String,
        parse_mode: Option<String>,
    ) -> impl FnOnce() -> SendFuture {
        let bot = self.bot.clone();
        move || {
            Box::pin(async move {
                let chat_id = TelegramPlatform::parse_chat_id(&chat_id)?;
                let message_id = TelegramPlatform::parse_message_id(&message_id)?;
                edit_via_bot(&bot, chat_id, message_id, &text, parse_mode.as_deref())
                    .await
                    .map(|_| String::new())
            }) as SendFuture
        }
    }

    fn queued_delete(&self, chat_id: String, message_id: String) -> impl FnOnce() -> SendFuture {
        let bot = self.bot.clone();
        move || {
            Box::pin(async move {
                let chat_id = TelegramPlatform::parse_chat_id(&chat_id)?;
                let message_id = TelegramPlatform::parse_message_id(&message_id)?;
                bot.delete_message(chat_id, message_id)
                    .await
                    .map(|_| String::new())
                    .map_err(|e| ChannelError::Transport(e.to_string()))
            }) as SendFuture
        }
    }
}

/// Send logic shared by the direct [`MessagingPlatform::send_message`] path
/// and the queued closures, taking a borrowed `Bot` so the latter stay
/// `'static` without needing a whole `TelegramPlatform` clone.
async fn send_via_bot(bot: &Bot, chat_id: ChatId, text: &str, parse_mode: Option<&str>) -> SendResult {
    let chunks = split_chunks_smart(text);
    let chunks = if chunks.is_empty() { vec![String::new()] } else { chunks };

    let mut first_id: Option<String> = None;
    for (i, chunk) in chunks.iter().enumerate() {
        let sent = if parse_mode == Some("MarkdownV2") {
            let escaped = escape_markdown_v2(chunk);
            match bot.send_message(chat_id, &escaped).parse_mode(ParseMode::MarkdownV2).await {
                Ok(m) => Ok(m),
                Err(e) => {
                    warn!(error = %e, "telegram markdown send failed, retrying as plain text");
                    bot.send_message(chat_id, chunk).await
                }
            }
        } else {
            bot.send_message(chat_id, chunk).await
        }
        .map_err(|e| ChannelError::Transport(e.to_string()))?;

        if i == 0 {
            first_id = Some(sent.id.0.to_string());
        }
        if chunks.len() > 1 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    first_id.ok_or_else(|| ChannelError::Transport("no chunks sent".to_string()))
}

async fn edit_via_bot(
    bot: &Bot,
    chat_id: ChatId,
    message_id: teloxide::types::MessageId,
    text: &str,
    parse_mode: Option<&str>,
) -> Result<(), ChannelError> {
    let result = if parse_mode == Some("MarkdownV2") {
        let escaped = escape_markdown_v2(text);
        match bot
            .edit_message_text(chat_id, message_id, &escaped)
            .parse_mode(ParseMode::MarkdownV2)
            .await
        {
            Ok(m) => Ok(m),
            Err(e) => {
                warn!(error = %e, "telegram markdown edit failed, retrying as plain text");
                bot.edit_message_text(chat_id, message_id, text).await
            }
        }
    } else {
        bot.edit_message_text(chat_id, message_id, text).await
    };

    result.map(|_| ()).map_err(|e| ChannelError::Transport(e.to_string()))
}

#[async_trait]
impl MessagingPlatform for TelegramPlatform {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<(), ChannelError> {
        let bot = self.bot.clone();
        let allowed_user_id = self.allowed_user_id.clone();
        let handler = Arc::clone(&self.handler);

        let dptree_handler = Update::filter_message().endpoint(handle_update);
        let task = tokio::spawn(async move {
            Dispatcher::builder(bot, dptree_handler)
                .dependencies(dptree::deps![allowed_user_id, handler])
                .default_handler(|_upd| async {})
                .build()
                .dispatch()
                .await;
        });

        *self.dispatch_task.lock().await = Some(task);
        self.connected.store(true, Ordering::SeqCst);
        info!("telegram adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        if let Some(task) = self.dispatch_task.lock().await.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
        parse_mode: Option<&str>,
    ) -> SendResult {
        let chat_id = Self::parse_chat_id(chat_id)?;
        let _ = reply_to;
        send_via_bot(&self.bot, chat_id, text, parse_mode).await
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), ChannelError> {
        let chat_id = Self::parse_chat_id(chat_id)?;
        let message_id = Self::parse_message_id(message_id)?;
        edit_via_bot(&self.bot, chat_id, message_id, text, parse_mode).await
    }

    async fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<(), ChannelError> {
        let chat_id = Self::parse_chat_id(chat_id)?;
        let message_id = Self::parse_message_id(message_id)?;
        self.bot
            .delete_message(chat_id, message_id)
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn queue_send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
        parse_mode: Option<&str>,
        fire_and_forget: bool,
    ) -> Result<Option<String>, ChannelError> {
        let _ = reply_to;
        let func = self.queued_send(chat_id.to_string(), text.to_string(), parse_mode.map(String::from));

        if fire_and_forget {
            self.limiter.fire_and_forget(func, None);
            Ok(None)
        } else {
            self.limiter.enqueue(func, None).await.map(Some)
        }
    }

    async fn queue_edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        parse_mode: Option<&str>,
        fire_and_forget: bool,
    ) -> Result<(), ChannelError> {
        let dedup_key = Some(format!("edit:{chat_id}:{message_id}"));
        let func = self.queued_edit(
            chat_id.to_string(),
            message_id.to_string(),
            text.to_string(),
            parse_mode.map(String::from),
        );

        if fire_and_forget {
            self.limiter.fire_and_forget(func, dedup_key);
            Ok(())
        } else {
            self.limiter.enqueue(func, dedup_key).await.map(|_| ())
        }
    }

    async fn queue_delete_message(
        &self,
        chat_id: &str,
        message_id: &str,
        fire_and_forget: bool,
    ) -> Result<(), ChannelError> {
        let func = self.queued_delete(chat_id.to_string(), message_id.to_string());

        if fire_and_forget {
            self.limiter.fire_and_forget(func, None);
            Ok(())
        } else {
            self.limiter.enqueue(func, None).await.map(|_| ())
        }
    }

    fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock().expect("handler mutex poisoned") = Some(handler);
    }

    fn fire_and_forget(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Endpoint registered with the teloxide [`Dispatcher`] for every incoming
/// message update.
async fn handle_update(
    bot: Bot,
    msg: Message,
    allowed_user_id: Option<String>,
    handler: Arc<StdMutex<Option<MessageHandler>>>,
) -> ResponseResult<()> {
    if msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
        return Ok(());
    }

    let from = match msg.from.as_ref() {
        Some(u) => u,
        None => return Ok(()),
    };
    let user_id = from.id.0.to_string();

    if !allow::is_allowed(allowed_user_id.as_deref(), &user_id) {
        return Ok(());
    }

    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();
    if text.is_empty() {
        return Ok(());
    }

    let typing = TypingHandle::start(bot.clone(), msg.chat.id);

    let incoming = IncomingMessage {
        text,
        chat_id: msg.chat.id.0.to_string(),
        user_id,
        message_id: msg.id.0.to_string(),
        platform: "telegram".to_string(),
        reply_to_message_id: msg.reply_to_message().map(|m| m.id.0.to_string()),
        username: from.username.clone(),
        timestamp: msg.date,
        raw_event: serde_json::to_value(&msg).unwrap_or(serde_json::Value::Null),
    };

    let cb = handler.lock().expect("handler mutex poisoned").clone();
    if let Some(cb) = cb {
        tokio::spawn(async move {
            cb(incoming).await;
            typing.stop();
        });
    } else {
        typing.stop();
    }

    Ok(())
}
