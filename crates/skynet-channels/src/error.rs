use thiserror::Error;

/// Errors that can occur within a messaging platform adapter or the
/// rate limiter that sits in front of it (C3/C17).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("platform transport error: {0}")]
    Transport(String),

    #[error("platform rejected the request: {0}")]
    Rejected(String),

    #[error("platform asked us to slow down, retry after {retry_after_secs}s")]
    FloodWait { retry_after_secs: u64 },

    #[error("not connected")]
    NotConnected,
}

impl ChannelError {
    /// Best-effort transient-error classification, ported from the original
    /// `fire_and_forget`'s substring sniffing (`"connect"`, `"timeout"`,
    /// `"broken"`) used to decide whether a retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Transport(msg) => {
                let lower = msg.to_lowercase();
                ["connect", "timeout", "broken"].iter().any(|s| lower.contains(s))
            }
            ChannelError::FloodWait { .. } => true,
            _ => false,
        }
    }

    /// Seconds to pause the limiter worker for, if this looks like a
    /// flood/backoff signal from the platform.
    pub fn flood_wait_secs(&self) -> Option<u64> {
        match self {
            ChannelError::FloodWait { retry_after_secs } => Some(*retry_after_secs),
            ChannelError::Transport(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("flood") || lower.contains("wait") {
                    Some(30)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn into_broker_error(self) -> skynet_core::BrokerError {
        skynet_core::BrokerError::ProcessError(self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
