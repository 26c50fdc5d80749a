use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::types::{Message, RequestId};

use crate::fleet::{LlmRequest, NodeFleetManager, Usage};

/// Everything `EthicsReviewer` needs to decide whether a turn may proceed.
#[derive(Debug, Clone)]
pub struct EthicsInput {
    pub messages: Vec<Message>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum EthicsVerdict {
    Allow,
    Deny { reason: String, suggestions: Vec<String> },
}

/// First stage of `ChatOrchestrator::chat` — can reject a turn before any
/// dispatch or quota consumption happens.
pub trait EthicsReviewer: Send + Sync {
    fn review(&self, input: &EthicsInput) -> EthicsVerdict;
}

/// Default reviewer: allows everything. A real deployment swaps this for a
/// policy-backed implementation.
pub struct AllowAllEthicsReviewer;

impl EthicsReviewer for AllowAllEthicsReviewer {
    fn review(&self, _input: &EthicsInput) -> EthicsVerdict {
        EthicsVerdict::Allow
    }
}

#[derive(Debug, Clone)]
pub struct PlaybookInput {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct PlaybookMatch {
    pub name: String,
    pub variables: HashMap<String, String>,
}

/// Matches a turn against known conversational playbooks before dispatch.
/// Purely advisory — a match is passed along to the strategy engine, never
/// required.
pub trait PlaybookMatcher: Send + Sync {
    fn match_playbook(&self, input: &PlaybookInput) -> Option<PlaybookMatch>;
}

pub struct NoopPlaybookMatcher;

impl PlaybookMatcher for NoopPlaybookMatcher {
    fn match_playbook(&self, _input: &PlaybookInput) -> Option<PlaybookMatch> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct StrategyInput {
    pub request_id: RequestId,
    pub node_id: String,
    pub messages: Vec<Message>,
    pub model: String,
    pub playbook: Option<PlaybookMatch>,
}

#[derive(Debug, Clone)]
pub struct StrategyOutput {
    pub content: String,
    pub usage: Option<Usage>,
    pub iterations: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Conduit(#[from] conduit_core::ConduitError),
}

/// Runs the actual model-interaction loop for a turn once ethics and
/// playbook matching have cleared it. The default implementation is a
/// single round-trip through `NodeFleetManager::handle_llm_request_unary`;
/// a richer engine could loop (tool use, self-critique) behind the same
/// signature.
#[async_trait]
pub trait StrategyEngine: Send + Sync {
    async fn run(&self, input: StrategyInput) -> Result<StrategyOutput, OrchestratorError>;
}

pub struct SingleRoundStrategy {
    fleet: Arc<NodeFleetManager>,
}

impl SingleRoundStrategy {
    pub fn new(fleet: Arc<NodeFleetManager>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl StrategyEngine for SingleRoundStrategy {
    async fn run(&self, input: StrategyInput) -> Result<StrategyOutput, OrchestratorError> {
        let result = self
            .fleet
            .handle_llm_request_unary(LlmRequest {
                request_id: input.request_id,
                node_id: input.node_id,
                messages: input.messages,
                model: input.model,
            })
            .await?;
        Ok(StrategyOutput {
            content: result.content.unwrap_or_default(),
            usage: result.usage,
            iterations: 1,
        })
    }
}
