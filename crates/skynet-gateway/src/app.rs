//! Application root context (§5 "avoid hidden globals"): every singleton-shaped
//! service the HTTP handlers need is constructed once here and handed down as
//! one `Arc<AppState>`, following the teacher's `AppState` pattern in
//! `skynet-gateway/src/app.rs` — minus its Discord/memory/scheduler/terminal
//! fields, which are outside this broker's scope.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use skynet_agent::openai::OpenAiClient;
use skynet_agent::ProviderLimiter;
use skynet_channels::{ClaudeMessageHandler, MessagingPlatform};
use skynet_cli::CliSessionManager;
use skynet_core::{BrokerConfig, BrokerError};
use skynet_sessions::SessionStore;
use skynet_telegram::TelegramPlatform;
use skynet_tree::TreeQueueManager;
use tracing::{info, warn};

/// The messaging front-end, present only when `messaging.platform` is configured.
pub struct MessagingFrontend {
    pub platform: Arc<dyn MessagingPlatform>,
    pub handler: Arc<ClaudeMessageHandler>,
}

/// Everything a request handler needs, owned once and cloned cheaply via `Arc`.
pub struct AppState {
    pub config: BrokerConfig,
    pub provider_limiter: ProviderLimiter,
    pub provider_client: OpenAiClient,
    pub cli_manager: Arc<CliSessionManager>,
    pub session_store: Arc<SessionStore>,
    pub messaging: Option<MessagingFrontend>,
}

impl AppState {
    pub fn new(config: BrokerConfig) -> skynet_core::Result<Arc<Self>> {
        let provider_limiter = ProviderLimiter::new(
            config.provider.rate_limit.n,
            config.provider.rate_limit.window_secs,
        )
        .map_err(|e| BrokerError::Config(e.to_string()))?;

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.provider.timeouts.connect_ms))
            .timeout(Duration::from_millis(config.provider.timeouts.read_ms))
            .build()
            .map_err(|e| BrokerError::Internal(e.to_string()))?;

        let provider_client = OpenAiClient::new(
            http_client,
            config.provider.api_key.clone(),
            config.provider.base_url.clone(),
        );

        let session_store = SessionStore::spawn(&config.session_store);

        let allowed_dirs: Vec<PathBuf> = config.cli.allowed_dirs.iter().map(PathBuf::from).collect();
        let cli_manager = Arc::new(CliSessionManager::new(
            PathBuf::from(&config.cli.workspace_dir),
            format!("http://{}:{}", config.server.host, config.server.port),
            allowed_dirs,
            "claude".to_string(),
            config.cli.max_sessions,
        ));

        let messaging =
            build_messaging_frontend(&config, Arc::clone(&cli_manager), Arc::clone(&session_store));

        Ok(Arc::new(Self {
            config,
            provider_limiter,
            provider_client,
            cli_manager,
            session_store,
            messaging,
        }))
    }

    /// Tree queue shared by the messaging front-end, if one is configured.
    pub fn tree_queue(&self) -> Option<&Arc<TreeQueueManager>> {
        self.messaging.as_ref().map(|m| m.handler.tree_queue())
    }

    /// Startup reconciliation (§4.13, §5): any node left PENDING/IN_PROGRESS
    /// across a restart is lost work, not resumable — mark it ERROR. Then, if
    /// a messaging platform is configured, start it.
    pub async fn start(&self) {
        if let Some(tree_queue) = self.tree_queue() {
            let snapshot = self.session_store.get_all_trees().await;
            tree_queue.restore_from_snapshot(snapshot);
            let reconciled = tree_queue.cleanup_stale_nodes().await;
            if reconciled > 0 {
                warn!(reconciled, "reconciled stale nodes left over from a previous run");
            }
        }

        if let Some(messaging) = &self.messaging {
            if let Err(e) = messaging.platform.start().await {
                warn!(error = %e, "failed to start messaging platform");
            } else {
                info!(platform = messaging.platform.name(), "messaging platform started");
            }
        }
    }

    /// Graceful shutdown (§5): stop messaging, stop CLI sessions, cancel tree
    /// queues, flush the session store — each step time-bounded and logged,
    /// never propagated.
    pub async fn shutdown(&self) {
        const STEP_TIMEOUT: Duration = Duration::from_secs(5);
        const SHORT_TIMEOUT: Duration = Duration::from_secs(2);

        if let Some(messaging) = &self.messaging {
            if tokio::time::timeout(STEP_TIMEOUT, messaging.handler.stop_all_tasks())
                .await
                .is_err()
            {
                warn!("timed out stopping messaging tasks during shutdown");
            }
            if tokio::time::timeout(SHORT_TIMEOUT, messaging.platform.stop())
                .await
                .is_err()
            {
                warn!("timed out stopping messaging platform during shutdown");
            }
        }

        self.cli_manager.stop_all().await;
        skynet_cli::registry::kill_all_best_effort();

        if tokio::time::timeout(SHORT_TIMEOUT, self.session_store.flush_pending_save())
            .await
            .is_err()
        {
            warn!("timed out flushing session store during shutdown");
        }

        info!("shutdown complete");
    }
}

/// Assemble the full Axum router (§6 HTTP surface), composed the way the
/// teacher's `build_router` wires `Router::new().route(...).with_state(state)`
/// plus a permissive CORS layer and request tracing.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::http::health::root_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/v1/messages", post(crate::http::messages::messages_handler))
        .route(
            "/v1/messages/count_tokens",
            post(crate::http::messages::count_tokens_handler),
        )
        .route("/v1/models", get(crate::http::messages::models_handler))
        .route("/stop", post(crate::stop::stop_handler))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn build_messaging_frontend(
    config: &BrokerConfig,
    cli_manager: Arc<CliSessionManager>,
    session_store: Arc<SessionStore>,
) -> Option<MessagingFrontend> {
    let platform_tag = config.messaging.platform.as_deref()?;

    let platform: Arc<dyn MessagingPlatform> = match platform_tag {
        "telegram" => {
            let token = match &config.messaging.bot_token {
                Some(t) => t.clone(),
                None => {
                    warn!("messaging.platform=telegram but no bot_token configured; messaging front-end disabled");
                    return None;
                }
            };
            TelegramPlatform::new(
                token,
                config.messaging.allowed_user_id.clone(),
                config.messaging.rate_limit_n,
                config.messaging.rate_window_secs,
            )
        }
        other => {
            warn!(platform = other, "unknown messaging platform, messaging front-end disabled");
            return None;
        }
    };

    let handler = ClaudeMessageHandler::new(Arc::clone(&platform), cli_manager, session_store);
    let handler_for_callback = Arc::clone(&handler);
    platform.on_message(Arc::new(move |incoming| {
        let handler = Arc::clone(&handler_for_callback);
        Box::pin(async move {
            handler.handle_message(incoming).await;
        })
    }));

    Some(MessagingFrontend { platform, handler })
}
