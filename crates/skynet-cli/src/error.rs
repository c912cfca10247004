//! Error taxonomy for the CLI agent subprocess pool (C10-C12, §4.11).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to spawn CLI process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("maximum concurrent sessions ({max}) reached")]
    SessionLimitReached { max: usize },

    #[error("session {0} not found")]
    SessionNotFound(String),
}

impl CliError {
    pub fn into_broker_error(self) -> skynet_core::BrokerError {
        match self {
            CliError::Spawn(e) => skynet_core::BrokerError::ProcessError(e.to_string()),
            CliError::SessionLimitReached { max } => {
                skynet_core::BrokerError::SessionLimitReached { max }
            }
            CliError::SessionNotFound(id) => {
                skynet_core::BrokerError::InvalidRequest(format!("unknown session: {id}"))
            }
        }
    }
}
