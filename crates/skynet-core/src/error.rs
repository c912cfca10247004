use thiserror::Error;

/// Error taxonomy shared across the broker.
///
/// Variants map 1:1 onto the externally-visible error kinds: the provider
/// boundary (`Authentication` .. `Api`), the CLI pool (`SessionLimitReached`,
/// `ProcessError`), cooperative cancellation (`Cancelled`), and retried
/// network hiccups (`Transient`). `.code()` and `.http_status()` are used at
/// the HTTP boundary to render the Anthropic error envelope.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Upstream overloaded: {0}")]
    Overloaded(String),

    #[error("Upstream API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Maximum concurrent sessions ({max}) reached")]
    SessionLimitReached { max: usize },

    #[error("Agent process error: {0}")]
    ProcessError(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Short error code used in the Anthropic error envelope's `error.type` field.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Config(_) => "config_error",
            BrokerError::Authentication(_) => "authentication_error",
            BrokerError::InvalidRequest(_) => "invalid_request_error",
            BrokerError::RateLimit(_) => "rate_limit_error",
            BrokerError::Overloaded(_) => "overloaded_error",
            BrokerError::Api { .. } => "api_error",
            BrokerError::SessionLimitReached { .. } => "session_limit_reached",
            BrokerError::ProcessError(_) => "process_error",
            BrokerError::Cancelled => "cancelled",
            BrokerError::Transient(_) => "transient_error",
            BrokerError::Serialization(_) => "serialization_error",
            BrokerError::Io(_) => "io_error",
            BrokerError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status to use when this error reaches the API boundary (§4.10, §7).
    pub fn http_status(&self) -> u16 {
        match self {
            BrokerError::Authentication(_) => 401,
            BrokerError::InvalidRequest(_) => 400,
            BrokerError::RateLimit(_) => 429,
            BrokerError::Overloaded(_) => 529,
            BrokerError::Api { status, .. } => *status,
            BrokerError::SessionLimitReached { .. } => 429,
            BrokerError::Config(_) => 500,
            _ => 500,
        }
    }

    /// Render as the Anthropic-compatible `{type:"error", error:{type, message}}` envelope.
    pub fn to_anthropic_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
