use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use conduit_agent::ChatInput;
use conduit_core::types::{ConversationId, Message};
use serde::{Deserialize, Serialize};

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    status: &'static str,
    git_sha: &'static str,
    nodes_online: usize,
    in_flight_requests: usize,
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthzResponse> {
    let nodes_online = state
        .fleet
        .list()
        .iter()
        .filter(|n| !matches!(n.status, conduit_agent::types::NodeStatus::Offline))
        .count();
    Json(HealthzResponse {
        status: "ok",
        git_sha: env!("CONDUIT_GIT_SHA"),
        nodes_online,
        in_flight_requests: state.tracker.count(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub conversation_id: Option<String>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub node_id: Option<String>,
    pub capability: Option<String>,
    pub model: Option<String>,
    pub messages: Vec<ChatMessageBody>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageBody {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponseBody {
    pub request_id: String,
    pub session_id: Option<String>,
    pub content: String,
    pub iterations: u32,
    pub blocked_by_ethics: bool,
    pub reason: Option<String>,
    pub suggestions: Vec<String>,
    pub error: Option<String>,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatRequestBody>,
) -> Json<ChatResponseBody> {
    let messages: Vec<Message> = body
        .messages
        .into_iter()
        .map(|m| match m.role.as_str() {
            "system" => Message::system(m.content),
            "assistant" => Message::assistant(m.content),
            _ => Message::user(m.content),
        })
        .collect();

    let input = ChatInput {
        messages,
        conversation_id: body.conversation_id.map(ConversationId::new),
        agent_id: body.agent_id,
        user_id: body.user_id,
        node_id: body.node_id,
        capability: body.capability.or_else(|| Some("chat".to_string())),
        request_id: None,
        model: body.model,
    };

    let result = state.orchestrator.chat(input).await;
    Json(ChatResponseBody {
        request_id: result.request_id.to_string(),
        session_id: result.session_id.map(|s| s.to_string()),
        content: result.content,
        iterations: result.iterations,
        blocked_by_ethics: result.blocked_by_ethics,
        reason: result.reason,
        suggestions: result.suggestions,
        error: result.error,
    })
}

pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<conduit_agent::types::Node>> {
    Json(state.fleet.list())
}
