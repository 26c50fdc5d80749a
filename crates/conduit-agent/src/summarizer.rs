use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::types::Message;
use conduit_memory::Summarizer;
use tracing::warn;

use crate::provider::{ChatRequest, LlmProvider};

const SUMMARY_SYSTEM_PROMPT: &str = "Summarize the conversation below in a short paragraph. \
Capture decisions, facts, and open threads; drop small talk and restated context.";

/// `conduit-memory`'s compact strategy summarization port, backed by a real
/// LLM call. Adapted from the teacher's `compact_session_if_needed` fact
/// extraction — same bounded-timeout chat-request idiom, generalized from
/// fact extraction into prose summary generation.
pub struct LlmSummarizer {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmSummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, model: String) -> Self {
        Self { provider, model }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message], timeout: Duration) -> Option<String> {
        if messages.is_empty() {
            return None;
        }
        let req = ChatRequest {
            model: self.model.clone(),
            system: SUMMARY_SYSTEM_PROMPT.to_string(),
            messages: messages.to_vec(),
            max_tokens: 512,
        };
        match tokio::time::timeout(timeout, self.provider.send(&req)).await {
            Ok(Ok(resp)) if !resp.content.trim().is_empty() => Some(resp.content),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!(error = %e, "summarizer LLM call failed, falling back to stub summary");
                None
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "summarizer LLM call timed out");
                None
            }
        }
    }
}
