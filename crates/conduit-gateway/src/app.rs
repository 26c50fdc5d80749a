use std::sync::Arc;

use conduit_agent::{
    AllowAllEthicsReviewer, ChatOrchestrator, NodeFleetManager, NoopPlaybookMatcher,
    RequestTracker, SingleRoundStrategy,
};
use conduit_agent::llm_client::AnthropicLlmClient;
use conduit_agent::summarizer::LlmSummarizer;
use conduit_core::config::ConduitConfig;
use conduit_core::event_bus::EventBus;
use conduit_core::kv::KeyValueStore;
use conduit_memory::{ContextManager, NoopSummarizer};
use conduit_memory::history::HistoryStore;
use conduit_quota::QuotaController;
use conduit_sessions::SessionRegistry;

/// Central shared state, passed as `Arc<AppState>` to every Axum handler.
pub struct AppState {
    pub config: ConduitConfig,
    pub orchestrator: ChatOrchestrator,
    pub fleet: Arc<NodeFleetManager>,
    pub tracker: Arc<RequestTracker>,
    pub events: Arc<EventBus>,
}

impl AppState {
    pub fn build(config: ConduitConfig) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(&config.database.path)?;
        let history = Arc::new(HistoryStore::new(conn)?);

        let events = EventBus::new();
        let quota = QuotaController::new(conduit_quota::QuotaConfig {
            requests_per_minute: Some(config.quota.requests_per_minute),
            tokens_per_day: Some(config.quota.tokens_per_day),
            concurrent_streams: Some(config.quota.concurrent_streams),
        });
        let kv_root = std::path::Path::new(&config.database.path)
            .parent()
            .map(|p| p.join("nodes"))
            .unwrap_or_else(|| std::path::PathBuf::from("nodes"));
        let kv = Arc::new(KeyValueStore::new(kv_root)?);

        let provider: Arc<dyn conduit_agent::LlmProvider> = Arc::new(AnthropicLlmClient::new(
            config.agent.api_key.clone().unwrap_or_default(),
            config.agent.base_url.clone(),
        ));

        let fleet = NodeFleetManager::new(quota, events.clone(), provider.clone(), Some(kv));
        fleet.restore().ok();
        let summarizer: Arc<dyn conduit_memory::Summarizer> = if config.agent.api_key.is_some() {
            Arc::new(LlmSummarizer::new(provider.clone(), config.context.compression_model.clone()))
        } else {
            Arc::new(NoopSummarizer)
        };

        let context = Arc::new(ContextManager::new(config.context.clone(), history.clone(), summarizer));
        let sessions = SessionRegistry::new();
        let tracker = RequestTracker::new();

        let strategy = Arc::new(SingleRoundStrategy::new(fleet.clone()));
        let orchestrator = ChatOrchestrator::new(
            fleet.clone(),
            sessions,
            history,
            context,
            Arc::new(AllowAllEthicsReviewer),
            Arc::new(NoopPlaybookMatcher),
            strategy,
            events.clone(),
            config.agent.model.clone(),
        );

        Ok(Self { config, orchestrator, fleet, tracker, events })
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/healthz", get(crate::http::healthz))
        .route("/chat", post(crate::http::chat))
        .route("/nodes", get(crate::http::list_nodes))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
