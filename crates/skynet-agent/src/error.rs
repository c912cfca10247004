//! Provider error taxonomy and its mapping onto the broker-wide error type (§4.10).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether C2's retry loop should attempt another pass for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Overloaded(_)
                | ProviderError::Http(_)
                | ProviderError::Unavailable(_)
        ) || matches!(self, ProviderError::Api { status, .. } if *status >= 500)
    }

    /// Classify an upstream HTTP status + body into a `ProviderError` (§4.10).
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => ProviderError::Api {
                status,
                message: body.to_string(),
            },
            429 => ProviderError::RateLimited {
                retry_after_ms: 0,
            },
            400 | 422 => ProviderError::Api {
                status,
                message: body.to_string(),
            },
            s if s >= 500 => {
                let lower = body.to_ascii_lowercase();
                if lower.contains("overloaded") || lower.contains("capacity") {
                    ProviderError::Overloaded(body.to_string())
                } else {
                    ProviderError::Api {
                        status,
                        message: body.to_string(),
                    }
                }
            }
            _ => ProviderError::Api {
                status,
                message: body.to_string(),
            },
        }
    }

    /// Map to the broker-wide error taxonomy for the HTTP boundary (§4.10, §7).
    pub fn into_broker_error(self) -> skynet_core::BrokerError {
        match self {
            ProviderError::Http(e) => skynet_core::BrokerError::Transient(e.to_string()),
            ProviderError::Api { status, message } if status == 401 || status == 403 => {
                skynet_core::BrokerError::Authentication(message)
            }
            ProviderError::Api { status, message } if status == 400 || status == 422 => {
                skynet_core::BrokerError::InvalidRequest(message)
            }
            ProviderError::Api { status, message } => {
                skynet_core::BrokerError::Api { status, message }
            }
            ProviderError::RateLimited { .. } => {
                skynet_core::BrokerError::RateLimit("upstream rate limit".into())
            }
            ProviderError::Overloaded(msg) => skynet_core::BrokerError::Overloaded(msg),
            ProviderError::Parse(msg) => skynet_core::BrokerError::Internal(msg),
            ProviderError::Unavailable(msg) => skynet_core::BrokerError::Transient(msg),
            ProviderError::Cancelled => skynet_core::BrokerError::Cancelled,
        }
    }

    /// Render as the Anthropic-compatible error envelope emitted inline in a stream (§4.9 step 3).
    pub fn to_anthropic_error_text(&self) -> String {
        format!("Error: {self}")
    }
}
