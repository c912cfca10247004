use thiserror::Error;

/// Errors surfaced by the session store (C16, §4.13).
#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionStoreError {
    pub fn into_broker_error(self) -> skynet_core::BrokerError {
        skynet_core::BrokerError::Internal(self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionStoreError>;
