//! Messaging-side rate limiter (C3) and the platform-agnostic Claude
//! interaction workflow (C17) that drives it — ported in behavior from
//! `messaging/limiter.py` and `messaging/handler.py`.

pub mod error;
pub mod handler;
pub mod limiter;
pub mod platform;

pub use error::ChannelError;
pub use handler::ClaudeMessageHandler;
pub use limiter::MessagingRateLimiter;
pub use platform::{MessageHandler, MessagingPlatform};
