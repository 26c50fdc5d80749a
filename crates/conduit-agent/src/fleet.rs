use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conduit_core::error::AdmissionCode;
use conduit_core::estimator::estimate_messages;
use conduit_core::event_bus::EventBus;
use conduit_core::kv::KeyValueStore;
use conduit_core::types::{Message, RequestId};
use conduit_core::{ConduitError, Result};
use conduit_quota::{CompletionOptions, Decision, DenyCode, QuotaController, RequestOptions};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::stream::StreamEvent;
use crate::types::{
    merge_heartbeat_stats, parse_delegations, DelegationSpec, HeartbeatPayload, Node, NodeInfo,
    NodeStats, NodeStatus, NodeType, Task, TaskResultInput, TaskSpec,
};

const NODES_KV_KEY: &str = "nodes";
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);
const LLM_RETRY_ATTEMPTS: u32 = 3;
const LLM_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// 429 and 5xx are treated as transient per spec; other 4xx and transport
/// failures are not retried.
fn is_retryable_provider_error(err: &ProviderError) -> bool {
    match err {
        ProviderError::RateLimited { .. } => true,
        ProviderError::Api { status, .. } => *status >= 500,
        ProviderError::Http(_) | ProviderError::Unavailable(_) => true,
        ProviderError::Parse(_) => false,
    }
}

/// Exponential backoff with up-to-50%-of-interval jitter, capped at
/// `LLM_RETRY_ATTEMPTS` attempts (spec.md §7: transient I/O is retried up
/// to 3 times with exponential backoff + jitter).
async fn send_with_retry(
    provider: &Arc<dyn LlmProvider>,
    req: &ChatRequest,
) -> std::result::Result<crate::provider::ChatResponse, ProviderError> {
    let mut delay = LLM_RETRY_BASE_DELAY;
    let mut last_err = None;
    for attempt in 1..=LLM_RETRY_ATTEMPTS {
        match provider.send(req).await {
            Ok(resp) => return Ok(resp),
            Err(e) if attempt < LLM_RETRY_ATTEMPTS && is_retryable_provider_error(&e) => {
                let jitter = Duration::from_millis(rand::random::<u64>() % (delay.as_millis() as u64 + 1));
                warn!(attempt, error = %e, "retrying LLM request after transient error");
                tokio::time::sleep(delay + jitter).await;
                delay *= 2;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("loop always runs at least once"))
}

type TaskOutcome = Result<serde_json::Value>;

struct PendingTask {
    tx: Option<oneshot::Sender<TaskOutcome>>,
    node_id: String,
}

/// Usage tallied by an LLM proxy call, for quota bookkeeping and for the
/// caller's own accounting (session metadata, event payloads).
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub request_id: RequestId,
    pub node_id: String,
    pub messages: Vec<Message>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ProxyResult {
    pub content: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub text: Option<String>,
    pub done: bool,
    pub usage: Option<Usage>,
    pub error: Option<String>,
}

/// Registers worker nodes, tracks their liveness, dispatches tool tasks to
/// them, and proxies chat-completion calls through whichever node the
/// caller targets, with quota enforcement and event publication at each
/// step (spec.md §4.7).
///
/// Node identity is the only piece of this manager's state that survives a
/// restart (via `KeyValueStore`); tasks, stream tables, and live counters
/// are rebuilt from scratch on every process start, same as
/// `conduit_sessions::SessionRegistry`.
pub struct NodeFleetManager {
    nodes: DashMap<String, Node>,
    pending_tasks: DashMap<String, PendingTask>,
    streams: DashMap<RequestId, CancellationToken>,
    quota: Arc<QuotaController>,
    events: Arc<EventBus>,
    llm_client: Arc<dyn LlmProvider>,
    store: Option<Arc<KeyValueStore>>,
    heartbeat_timeout: Duration,
}

impl NodeFleetManager {
    pub fn new(
        quota: Arc<QuotaController>,
        events: Arc<EventBus>,
        llm_client: Arc<dyn LlmProvider>,
        store: Option<Arc<KeyValueStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            pending_tasks: DashMap::new(),
            streams: DashMap::new(),
            quota,
            events,
            llm_client,
            store,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        })
    }

    pub fn with_heartbeat_timeout(mut self: Arc<Self>, timeout: Duration) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .map(|s| s.heartbeat_timeout = timeout)
            .unwrap_or_else(|| warn!("with_heartbeat_timeout called on a shared Arc, ignored"));
        self
    }

    /// Load previously persisted node identity. Nodes restored this way
    /// come back in `offline` status until their owner reconnects and
    /// sends a fresh heartbeat.
    pub fn restore(&self) -> Result<()> {
        let Some(store) = &self.store else { return Ok(()) };
        if let Some(nodes) = store.get::<Vec<Node>>(NODES_KV_KEY)? {
            for mut node in nodes {
                node.status = NodeStatus::Offline;
                node.stats.active_tasks = 0;
                self.nodes.insert(node.id.clone(), node);
            }
        }
        Ok(())
    }

    fn persist(&self) {
        let Some(store) = &self.store else { return };
        let snapshot: Vec<Node> = self.nodes.iter().map(|e| e.value().clone()).collect();
        if let Err(e) = store.put(NODES_KV_KEY, &snapshot) {
            warn!(error = %e, "failed to persist node registry");
        }
    }

    // ---- lifecycle ----------------------------------------------------

    pub fn register(&self, info: NodeInfo) -> Node {
        let now = Utc::now();
        let node = Node {
            id: info.id,
            name: info.name,
            node_type: info.node_type,
            status: NodeStatus::Online,
            capabilities: info.capabilities,
            tools: info.tools,
            max_concurrent_tasks: info.max_concurrent_tasks.max(1),
            registered_at: now,
            last_heartbeat: now,
            last_seen: now,
            stats: NodeStats::default(),
            connection_id: info.connection_id,
            persona_binding: info.persona_binding,
        };
        self.nodes.insert(node.id.clone(), node.clone());
        self.persist();
        self.events
            .publish("node_registered", serde_json::to_value(&node).unwrap_or_default());
        node
    }

    pub fn heartbeat(
        &self,
        node_id: &str,
        payload: HeartbeatPayload,
        connection_id: Option<String>,
    ) -> Result<()> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ConduitError::admission(AdmissionCode::NodeNotFound, node_id))?;

        let now = Utc::now();
        entry.last_heartbeat = now;
        entry.last_seen = now;
        merge_heartbeat_stats(&mut entry.stats, &payload);
        if let Some(cid) = connection_id {
            entry.connection_id = Some(cid);
        }

        let old_status = entry.status;
        let new_status = payload.status.unwrap_or(old_status);
        entry.status = new_status;
        let snapshot = entry.value().clone();
        drop(entry);

        self.events
            .publish("node_heartbeat", serde_json::to_value(&snapshot).unwrap_or_default());
        if old_status != new_status {
            self.events.publish(
                "node_status_changed",
                json!({ "nodeId": node_id, "from": status_str(old_status), "to": status_str(new_status) }),
            );
        }
        Ok(())
    }

    /// Mark every node owned by a dropped connection offline.
    pub fn connection_closed(&self, connection_id: &str) {
        let affected: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| e.connection_id.as_deref() == Some(connection_id))
            .map(|e| e.id.clone())
            .collect();
        for node_id in affected {
            if let Some(mut entry) = self.nodes.get_mut(&node_id) {
                entry.status = NodeStatus::Offline;
            }
            self.events
                .publish("node_disconnected", json!({ "nodeId": node_id, "connectionId": connection_id }));
        }
    }

    pub fn unregister(&self, node_id: &str) -> Option<Node> {
        let removed = self.nodes.remove(node_id).map(|(_, n)| n);
        if removed.is_some() {
            self.persist();
            self.events
                .publish("node_unregistered", json!({ "nodeId": node_id }));
        }
        removed
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<Node> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    /// One heartbeat-monitor sweep: any node whose last heartbeat is older
    /// than the configured timeout and isn't already offline is marked
    /// offline. Exposed separately from the interval loop so tests can
    /// drive it deterministically.
    pub fn check_heartbeats(&self) {
        let now = Utc::now();
        let stale: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| {
                e.status != NodeStatus::Offline
                    && now.signed_duration_since(e.last_heartbeat).num_milliseconds()
                        > self.heartbeat_timeout.as_millis() as i64
            })
            .map(|e| e.id.clone())
            .collect();
        for node_id in stale {
            if let Some(mut entry) = self.nodes.get_mut(&node_id) {
                entry.status = NodeStatus::Offline;
            }
            self.events.publish(
                "node_status_changed",
                json!({ "nodeId": node_id, "from": "online", "to": "offline", "reason": "heartbeat_timeout" }),
            );
        }
    }

    pub fn start_heartbeat_monitor(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let fleet = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                fleet.check_heartbeats();
            }
        })
    }

    // ---- task dispatch --------------------------------------------------

    /// Select the best node for dispatch: among online/busy nodes matching
    /// `capability` (if given), prefer online; among online nodes pick the
    /// smallest `active/max` load ratio; among only-busy nodes prefer the
    /// larger `max_concurrent_tasks`, tie-broken by smaller `active`.
    pub fn select_dispatch_node(&self, capability: Option<&str>) -> Result<String> {
        let mut online: Vec<Node> = Vec::new();
        let mut busy: Vec<Node> = Vec::new();
        for entry in self.nodes.iter() {
            let node = entry.value();
            if !matches!(node.status, NodeStatus::Online | NodeStatus::Busy) {
                continue;
            }
            if let Some(cap) = capability {
                if !node.capabilities.iter().any(|c| c == cap) {
                    continue;
                }
            }
            match node.status {
                NodeStatus::Online => online.push(node.clone()),
                NodeStatus::Busy => busy.push(node.clone()),
                _ => {}
            }
        }

        if !online.is_empty() {
            online.sort_by(|a, b| load_ratio(a).partial_cmp(&load_ratio(b)).unwrap());
            return Ok(online[0].id.clone());
        }
        if !busy.is_empty() {
            busy.sort_by(|a, b| {
                b.max_concurrent_tasks
                    .cmp(&a.max_concurrent_tasks)
                    .then(a.stats.active_tasks.cmp(&b.stats.active_tasks))
            });
            return Ok(busy[0].id.clone());
        }
        Err(ConduitError::Liveness { reason: "no node available for dispatch".into() })
    }

    fn bump_active(&self, node_id: &str, delta: i32) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            if delta > 0 {
                node.stats.active_tasks += delta as u32;
                node.status = NodeStatus::Busy;
            } else {
                node.stats.active_tasks = node.stats.active_tasks.saturating_sub((-delta) as u32);
                if node.stats.active_tasks == 0 && node.status == NodeStatus::Busy {
                    node.status = NodeStatus::Online;
                }
            }
        }
    }

    pub async fn assign_task(self: &Arc<Self>, spec: TaskSpec) -> TaskOutcome {
        if spec.tool_name.trim().is_empty() {
            return Err(ConduitError::admission(AdmissionCode::InvalidPayload, "toolName must not be empty"));
        }
        let node_id = self.select_dispatch_node(spec.capability.as_deref())?;
        let task_id = spec.task_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = spec.timeout.unwrap_or(DEFAULT_TASK_TIMEOUT);

        let (tx, rx) = oneshot::channel();
        self.pending_tasks
            .insert(task_id.clone(), PendingTask { tx: Some(tx), node_id: node_id.clone() });
        self.bump_active(&node_id, 1);

        let task = Task {
            id: task_id.clone(),
            node_id: node_id.clone(),
            tool_name: spec.tool_name.clone(),
            tool_args: spec.tool_args.clone(),
            metadata: spec.metadata.clone(),
            created_at: Utc::now(),
            timeout_ms: timeout.as_millis() as u64,
        };
        self.events
            .publish("task_assigned", serde_json::to_value(&task).unwrap_or_default());

        let fleet = Arc::clone(self);
        let timeout_task_id = task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            fleet.expire_task(&timeout_task_id).await;
        });

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ConduitError::Internal("task outcome channel dropped".into())),
        }
    }

    async fn expire_task(self: Arc<Self>, task_id: &str) {
        let Some((_, mut pending)) = self.pending_tasks.remove(task_id) else { return };
        self.bump_active(&pending.node_id, -1);
        if let Some(mut node) = self.nodes.get_mut(&pending.node_id) {
            node.stats.failed_tasks += 1;
        }
        self.events.publish(
            "task_timeout",
            json!({ "taskId": task_id, "nodeId": pending.node_id }),
        );
        if let Some(tx) = pending.tx.take() {
            let _ = tx.send(Err(ConduitError::Timeout { what: format!("task {task_id}"), ms: DEFAULT_TASK_TIMEOUT.as_millis() as u64 }));
        }
    }

    pub fn handle_task_result(self: &Arc<Self>, result: TaskResultInput) {
        let Some((_, mut pending)) = self.pending_tasks.remove(&result.task_id) else {
            warn!(task_id = %result.task_id, "handle_task_result: unknown task id, ignoring");
            return;
        };
        self.bump_active(&pending.node_id, -1);

        if let Some(mut node) = self.nodes.get_mut(&pending.node_id) {
            if result.success {
                node.stats.completed_tasks += 1;
            } else {
                node.stats.failed_tasks += 1;
            }
        }

        self.events.publish(
            "task_completed",
            json!({
                "taskId": result.task_id,
                "nodeId": pending.node_id,
                "success": result.success,
            }),
        );

        if result.success {
            let value = result.result.clone().unwrap_or(serde_json::Value::Null);
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(Ok(value.clone()));
            }
            for delegation in parse_delegations(&value) {
                let fleet = Arc::clone(self);
                let source_task_id = result.task_id.clone();
                tokio::spawn(async move {
                    fleet.dispatch_delegation(delegation, source_task_id).await;
                });
            }
        } else {
            let message = result.error.clone().unwrap_or_else(|| "task failed".into());
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(Err(ConduitError::Internal(message)));
            }
        }
    }

    async fn dispatch_delegation(self: Arc<Self>, delegation: DelegationSpec, source_task_id: String) {
        let mut metadata = delegation.metadata;
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("sourceTaskId".into(), json!(source_task_id));
        }
        let spec = TaskSpec {
            task_id: None,
            tool_name: delegation.tool_name,
            tool_args: delegation.tool_args,
            capability: delegation.capability,
            timeout: None,
            metadata,
        };
        if let Err(e) = self.assign_task(spec).await {
            warn!(error = %e, source_task_id, "delegated task dispatch failed");
        }
    }

    // ---- LLM proxy ------------------------------------------------------

    fn deny_to_admission(code: DenyCode) -> AdmissionCode {
        match code {
            DenyCode::RequestsPerMinuteExceeded => AdmissionCode::RateLimitExceeded,
            DenyCode::TokenQuotaExceeded => AdmissionCode::QuotaExceeded,
            DenyCode::StreamConcurrencyExceeded => AdmissionCode::StreamLimitExceeded,
        }
    }

    fn validate_llm_request(&self, req: &LlmRequest) -> Result<()> {
        if !self.nodes.contains_key(&req.node_id) {
            return Err(ConduitError::admission(AdmissionCode::NodeNotFound, req.node_id.clone()));
        }
        if req.messages.is_empty() {
            return Err(ConduitError::admission(AdmissionCode::InvalidPayload, "messages must not be empty"));
        }
        Ok(())
    }

    pub async fn handle_llm_request_unary(&self, req: LlmRequest) -> Result<ProxyResult> {
        self.validate_llm_request(&req)?;

        let decision = self.quota.consume_request(&req.node_id, RequestOptions { stream: false });
        if let Decision::Denied(code) = decision {
            let admission = Self::deny_to_admission(code);
            self.events.publish(
                "llm_proxy_rate_limited",
                json!({ "requestId": req.request_id.to_string(), "nodeId": req.node_id, "code": admission.as_str() }),
            );
            return Err(ConduitError::admission(admission, code.as_str()));
        }

        self.events.publish(
            "llm_proxy_started",
            json!({ "requestId": req.request_id.to_string(), "nodeId": req.node_id, "model": req.model }),
        );

        let chat_req = ChatRequest {
            model: req.model.clone(),
            system: String::new(),
            messages: req.messages.clone(),
            max_tokens: 4096,
        };

        let outcome = send_with_retry(&self.llm_client, &chat_req).await;
        match outcome {
            Ok(resp) => {
                let usage = Usage { prompt_tokens: resp.tokens_in as u64, completion_tokens: resp.tokens_out as u64 };
                self.quota.complete_request(&req.node_id, CompletionOptions { stream: false, tokens: usage.total() });
                self.events.publish(
                    "llm_proxy_completed",
                    json!({ "requestId": req.request_id.to_string(), "nodeId": req.node_id, "tokens": usage.total() }),
                );
                Ok(ProxyResult { content: Some(resp.content), usage: Some(usage) })
            }
            Err(e) => {
                let estimated = estimate_messages(&req.messages, None);
                self.quota.complete_request(&req.node_id, CompletionOptions { stream: false, tokens: estimated });
                Err(ConduitError::LlmRequestFailed(e.to_string()))
            }
        }
    }

    /// Open a proxied stream. `cancel` is expected to be the same token the
    /// caller registered with `RequestTracker` — cancelling it aborts
    /// delivery and tears down the in-flight stream table entry.
    pub async fn handle_llm_request_stream(
        self: &Arc<Self>,
        req: LlmRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        self.validate_llm_request(&req)?;

        let decision = self.quota.consume_request(&req.node_id, RequestOptions { stream: true });
        if let Decision::Denied(code) = decision {
            let admission = Self::deny_to_admission(code);
            self.events.publish(
                "llm_proxy_rate_limited",
                json!({ "requestId": req.request_id.to_string(), "nodeId": req.node_id, "code": admission.as_str() }),
            );
            return Err(ConduitError::admission(admission, code.as_str()));
        }

        self.streams.insert(req.request_id.clone(), cancel.clone());
        self.events.publish(
            "llm_proxy_started",
            json!({ "requestId": req.request_id.to_string(), "nodeId": req.node_id, "model": req.model, "stream": true }),
        );

        let (out_tx, out_rx) = mpsc::channel(32);
        let fleet = Arc::clone(self);
        tokio::spawn(async move {
            fleet.run_stream(req, cancel, out_tx).await;
        });
        Ok(out_rx)
    }

    async fn run_stream(self: Arc<Self>, req: LlmRequest, cancel: CancellationToken, out_tx: mpsc::Sender<StreamChunk>) {
        let (inner_tx, mut inner_rx) = mpsc::channel(32);
        let chat_req = ChatRequest {
            model: req.model.clone(),
            system: String::new(),
            messages: req.messages.clone(),
            max_tokens: 4096,
        };

        let provider = Arc::clone(&self.llm_client);
        let send_handle = tokio::spawn(async move { provider.send_stream(&chat_req, inner_tx).await });

        let mut aggregated_tokens_out: u32 = 0;
        let mut success = false;
        let mut final_usage = Usage::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = out_tx.send(StreamChunk{text:None, done:true, usage:None, error:Some("cancelled".into())}).await;
                    break;
                }
                event = inner_rx.recv() => {
                    match event {
                        Some(StreamEvent::TextDelta{text}) => {
                            self.events.publish(
                                "llm_proxy_stream_chunk",
                                json!({ "requestId": req.request_id.to_string(), "nodeId": req.node_id, "chunk": text }),
                            );
                            let _ = out_tx.send(StreamChunk{text:Some(text), done:false, usage:None, error:None}).await;
                        }
                        Some(StreamEvent::Done{tokens_in, tokens_out, ..}) => {
                            aggregated_tokens_out = tokens_out;
                            final_usage = Usage{prompt_tokens: tokens_in as u64, completion_tokens: tokens_out as u64};
                            success = true;
                            let _ = out_tx.send(StreamChunk{text:None, done:true, usage:Some(final_usage), error:None}).await;
                            break;
                        }
                        Some(StreamEvent::Error{message}) => {
                            let _ = out_tx.send(StreamChunk{text:None, done:true, usage:None, error:Some(message)}).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = send_handle.await;
        self.streams.remove(&req.request_id);

        self.events.publish(
            "llm_proxy_stream_completed",
            json!({ "requestId": req.request_id.to_string(), "nodeId": req.node_id, "success": success }),
        );

        let tokens = if success { final_usage.total() } else { estimate_messages(&req.messages, None) + aggregated_tokens_out as u64 };
        self.quota.complete_request(&req.node_id, CompletionOptions { stream: true, tokens });

        if success {
            self.events.publish(
                "llm_proxy_completed",
                json!({ "requestId": req.request_id.to_string(), "nodeId": req.node_id, "tokens": tokens }),
            );
        }
    }

    pub fn cancel_stream(&self, request_id: &RequestId) -> bool {
        if let Some(entry) = self.streams.get(request_id) {
            entry.cancel();
            true
        } else {
            false
        }
    }
}

fn load_ratio(node: &Node) -> f64 {
    if node.max_concurrent_tasks == 0 {
        f64::INFINITY
    } else {
        node.stats.active_tasks as f64 / node.max_concurrent_tasks as f64
    }
}

fn status_str(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Unknown => "unknown",
        NodeStatus::Online => "online",
        NodeStatus::Busy => "busy",
        NodeStatus::Offline => "offline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        reply: String,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn send(&self, _req: &ChatRequest) -> std::result::Result<crate::provider::ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Unavailable("down".into()));
            }
            Ok(crate::provider::ChatResponse {
                content: self.reply.clone(),
                model: "stub-model".into(),
                tokens_in: 10,
                tokens_out: 5,
                stop_reason: "end_turn".into(),
            })
        }
    }

    fn fleet_with(reply: &str, fail: bool) -> Arc<NodeFleetManager> {
        let quota = QuotaController::new(conduit_quota::QuotaConfig::default());
        let events = EventBus::new();
        let provider = Arc::new(StubProvider { reply: reply.into(), fail, calls: AtomicUsize::new(0) });
        NodeFleetManager::new(quota, events, provider, None)
    }

    fn register_node(fleet: &NodeFleetManager, id: &str) {
        fleet.register(NodeInfo {
            id: id.into(),
            name: "n".into(),
            node_type: NodeType::Llm,
            capabilities: vec!["chat".into()],
            tools: vec![],
            max_concurrent_tasks: 2,
            connection_id: None,
            persona_binding: Default::default(),
        });
    }

    #[test]
    fn select_prefers_online_over_busy() {
        let fleet = fleet_with("hi", false);
        register_node(&fleet, "n1");
        register_node(&fleet, "n2");
        fleet
            .heartbeat("n2", HeartbeatPayload { status: Some(NodeStatus::Busy), avg_response_ms: None }, None)
            .unwrap();
        assert_eq!(fleet.select_dispatch_node(None).unwrap(), "n1");
    }

    #[test]
    fn select_with_no_nodes_fails_liveness() {
        let fleet = fleet_with("hi", false);
        let err = fleet.select_dispatch_node(None).unwrap_err();
        assert_eq!(err.code(), "no_available_node");
    }

    #[tokio::test]
    async fn assign_task_rejects_empty_tool_name() {
        let fleet = fleet_with("hi", false);
        register_node(&fleet, "n1");
        let err = fleet.assign_task(TaskSpec::default()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_payload");
    }

    #[tokio::test]
    async fn assign_task_completes_on_result() {
        let fleet = fleet_with("hi", false);
        register_node(&fleet, "n1");
        let fleet_for_result = Arc::clone(&fleet);
        let assign = tokio::spawn({
            let fleet = Arc::clone(&fleet);
            async move {
                fleet
                    .assign_task(TaskSpec { tool_name: "echo".into(), ..Default::default() })
                    .await
            }
        });
        // Give assign_task a moment to register the pending entry.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let task_id = fleet_for_result.pending_tasks.iter().next().unwrap().key().clone();
        fleet_for_result.handle_task_result(TaskResultInput {
            task_id,
            success: true,
            result: Some(json!({"ok": true})),
            error: None,
        });
        let result = assign.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn llm_request_unary_rejects_unknown_node() {
        let fleet = fleet_with("hi", false);
        let err = fleet
            .handle_llm_request_unary(LlmRequest {
                request_id: RequestId::new(),
                node_id: "missing".into(),
                messages: vec![Message::user("hi")],
                model: "m".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "node_not_found");
    }

    #[tokio::test]
    async fn llm_request_unary_succeeds_and_consumes_quota() {
        let fleet = fleet_with("hello there", false);
        register_node(&fleet, "n1");
        let result = fleet
            .handle_llm_request_unary(LlmRequest {
                request_id: RequestId::new(),
                node_id: "n1".into(),
                messages: vec![Message::user("hi")],
                model: "m".into(),
            })
            .await
            .unwrap();
        assert_eq!(result.content.unwrap(), "hello there");
        assert_eq!(result.usage.unwrap().total(), 15);
    }

    #[tokio::test]
    async fn llm_request_unary_maps_rate_limit_deny_code() {
        let fleet = fleet_with("hi", false);
        register_node(&fleet, "n1");
        fleet.quota.update_config(
            "n1",
            conduit_quota::QuotaConfig { requests_per_minute: Some(0), ..Default::default() },
        );
        let err = fleet
            .handle_llm_request_unary(LlmRequest {
                request_id: RequestId::new(),
                node_id: "n1".into(),
                messages: vec![Message::user("hi")],
                model: "m".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn llm_request_unary_surfaces_provider_failure() {
        let fleet = fleet_with("hi", true);
        register_node(&fleet, "n1");
        let err = fleet
            .handle_llm_request_unary(LlmRequest {
                request_id: RequestId::new(),
                node_id: "n1".into(),
                messages: vec![Message::user("hi")],
                model: "m".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "llm_request_failed");
    }

    #[tokio::test]
    async fn send_with_retry_exhausts_attempts_on_persistent_failure() {
        let provider: Arc<dyn LlmProvider> =
            Arc::new(StubProvider { reply: "hi".into(), fail: true, calls: AtomicUsize::new(0) });
        let req = ChatRequest { model: "m".into(), system: String::new(), messages: vec![], max_tokens: 10 };
        let result = send_with_retry(&provider, &req).await;
        assert!(result.is_err());
    }

    #[test]
    fn heartbeat_timeout_marks_node_offline() {
        let fleet = fleet_with("hi", false).with_heartbeat_timeout(Duration::from_millis(0));
        register_node(&fleet, "n1");
        std::thread::sleep(Duration::from_millis(5));
        fleet.check_heartbeats();
        assert_eq!(fleet.get("n1").unwrap().status, NodeStatus::Offline);
    }

    #[test]
    fn unregister_removes_node() {
        let fleet = fleet_with("hi", false);
        register_node(&fleet, "n1");
        assert!(fleet.unregister("n1").is_some());
        assert!(fleet.get("n1").is_none());
    }

    #[test]
    fn connection_closed_offlines_owned_nodes() {
        let fleet = fleet_with("hi", false);
        fleet.register(NodeInfo {
            id: "n1".into(),
            name: "n".into(),
            node_type: NodeType::Tool,
            capabilities: vec![],
            tools: vec![],
            max_concurrent_tasks: 1,
            connection_id: Some("conn-1".into()),
            persona_binding: Default::default(),
        });
        fleet.connection_closed("conn-1");
        assert_eq!(fleet.get("n1").unwrap().status, NodeStatus::Offline);
    }
}
