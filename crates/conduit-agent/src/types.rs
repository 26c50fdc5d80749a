use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of worker a node is. `Llm` nodes answer `handleLLMRequest`
/// proxy calls; `Tool` nodes only run dispatched tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Llm,
    Tool,
    Hybrid,
}

/// Node lifecycle state (spec.md §3): `unknown -> online <-> busy -> offline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Unknown,
    Online,
    Busy,
    Offline,
}

/// Running counters updated on every dispatch/result/timeout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub avg_response_ms: Option<u64>,
}

/// Which persona/agent identity a node currently answers requests as, if
/// any. Carried on the node record purely for event/audit payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaBinding {
    pub agent_id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub stats: NodeStats,
    pub connection_id: Option<String>,
    pub persona_binding: PersonaBinding,
}

/// Registration payload for `NodeFleetManager::register`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub connection_id: Option<String>,
    pub persona_binding: PersonaBinding,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            node_type: NodeType::Tool,
            capabilities: Vec::new(),
            tools: Vec::new(),
            max_concurrent_tasks: 1,
            connection_id: None,
            persona_binding: PersonaBinding::default(),
        }
    }
}

/// A heartbeat's optional, partial update to a node's live state.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatPayload {
    pub status: Option<NodeStatus>,
    pub avg_response_ms: Option<u64>,
}

/// A unit of work handed to a node by `assignTask`.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: Option<String>,
    pub tool_name: String,
    pub tool_args: Value,
    pub capability: Option<String>,
    pub timeout: Option<std::time::Duration>,
    pub metadata: Value,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            task_id: None,
            tool_name: String::new(),
            tool_args: Value::Null,
            capability: None,
            timeout: None,
            metadata: Value::Null,
        }
    }
}

/// The outcome a node reports back through `handleTaskResult`.
#[derive(Debug, Clone)]
pub struct TaskResultInput {
    pub task_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub node_id: String,
    pub tool_name: String,
    pub tool_args: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

/// A fan-out follow-up task a completed task's result can request, keyed by
/// the same shape `assignTask` accepts (spec.md §4.7, S5 scenario).
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationSpec {
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: Value,
    pub capability: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

pub fn parse_delegations(result: &Value) -> Vec<DelegationSpec> {
    result
        .get("delegations")
        .and_then(|d| d.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|d| serde_json::from_value(d.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Best-effort merge of a heartbeat's reported stats into `stats`, never
/// destroying counters the heartbeat didn't mention.
pub fn merge_heartbeat_stats(stats: &mut NodeStats, payload: &HeartbeatPayload) {
    if let Some(ms) = payload.avg_response_ms {
        stats.avg_response_ms = Some(ms);
    }
}
