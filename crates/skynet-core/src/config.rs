use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Top-level config (`skynet.toml` + `SKYNET_*` env overrides).
///
/// Loaded once at process start via [`BrokerConfig::load`] and handed down
/// through the application root context (`Arc<AppState>` in `skynet-gateway`)
/// rather than read from globals at call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub cli: CliConfig,
    #[serde(default)]
    pub session_store: SessionStoreConfig,
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the local JSON catalogue served by `GET /v1/models`.
    #[serde(default = "default_models_catalogue")]
    pub models_catalogue_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            models_catalogue_path: default_models_catalogue(),
        }
    }
}

/// Upstream OpenAI-compatible provider — exactly one per process (§1 Non-goals:
/// not a load balancer across multiple providers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout_ms(),
            read_ms: default_read_timeout_ms(),
            write_ms: default_write_timeout_ms(),
        }
    }
}

/// `N` acquires per `window_secs` — feeds C1/C2 (§4.1, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_n")]
    pub n: u32,
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            n: default_rate_n(),
            window_secs: default_rate_window_secs(),
        }
    }
}

/// Messaging-platform front-end configuration (§6 configuration surface).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagingConfig {
    /// Platform tag, e.g. "telegram". Absent means the messaging front-end is disabled.
    pub platform: Option<String>,
    pub bot_token: Option<String>,
    pub allowed_user_id: Option<String>,
    #[serde(default = "default_messaging_rate_n")]
    pub rate_limit_n: u32,
    #[serde(default = "default_messaging_rate_window_secs")]
    pub rate_window_secs: f64,
}

/// CLI agent subprocess pool configuration (C10-C12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    #[serde(default)]
    pub allowed_dirs: Vec<String>,
    #[serde(default = "default_max_cli_sessions")]
    pub max_sessions: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            allowed_dirs: Vec::new(),
            max_sessions: default_max_cli_sessions(),
        }
    }
}

/// Session store persistence configuration (C16).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    #[serde(default = "default_session_store_path")]
    pub path: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Cap on `message_log` entries per chat; `None` is unlimited.
    pub message_log_cap: Option<usize>,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            path: default_session_store_path(),
            debounce_ms: default_debounce_ms(),
            message_log_cap: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_models_catalogue() -> String {
    "models.json".to_string()
}
fn default_base_url() -> String {
    "http://localhost:8000/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_read_timeout_ms() -> u64 {
    120_000
}
fn default_write_timeout_ms() -> u64 {
    10_000
}
fn default_rate_n() -> u32 {
    10
}
fn default_rate_window_secs() -> f64 {
    60.0
}
fn default_messaging_rate_n() -> u32 {
    1
}
fn default_messaging_rate_window_secs() -> f64 {
    2.0
}
fn default_workspace_dir() -> String {
    ".".to_string()
}
fn default_max_cli_sessions() -> usize {
    10
}
fn default_session_store_path() -> String {
    "sessions.json".to_string()
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_log_file() -> String {
    "broker.log".to_string()
}

impl BrokerConfig {
    /// Load config from a TOML file with `SKYNET_*` env var overrides.
    ///
    /// Unknown env keys are ignored (figment's default behavior). Checks, in
    /// order: the explicit path argument, then `./skynet.toml`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or("skynet.toml");

        let config: BrokerConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SKYNET_").split("_"))
            .extract()
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        Ok(config)
    }
}
