//! Error taxonomy for the conversation tree & queue (C13-C15).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("parent node {0} not found in any tree")]
    ParentNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("tree {0} not found")]
    TreeNotFound(String),
}

impl TreeError {
    pub fn into_broker_error(self) -> skynet_core::BrokerError {
        skynet_core::BrokerError::InvalidRequest(self.to_string())
    }
}
