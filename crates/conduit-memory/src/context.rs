use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::config::{ContextConfig, ContextStrategy};
use conduit_core::estimator::{estimate_messages, fit_recent};
use conduit_core::types::{CheckpointId, Content, ConversationId, Message, Role};

use crate::error::Result;
use crate::history::HistoryStore;
use crate::types::{ActionType, CompressionStrategy, ContextAction, ManageResult};

/// External LLM summarization port. `conduit-agent` supplies a real
/// implementation backed by its LLM client; the default `NoopSummarizer`
/// always misses, which exercises the spec's documented local-stub
/// fallback path.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message], timeout: Duration) -> Option<String>;
}

pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize(&self, _messages: &[Message], _timeout: Duration) -> Option<String> {
        None
    }
}

/// Options accompanying a `manage` call.
#[derive(Debug, Clone, Default)]
pub struct ManageOptions {
    pub force: bool,
    pub strategy: Option<CompressionStrategy>,
    pub reason: Option<String>,
}

pub struct ContextManager {
    config: ContextConfig,
    history: Arc<HistoryStore>,
    summarizer: Arc<dyn Summarizer>,
}

impl ContextManager {
    pub fn new(config: ContextConfig, history: Arc<HistoryStore>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            history,
            summarizer,
        }
    }

    pub async fn manage(
        &self,
        session_id: &ConversationId,
        messages: &[Message],
        opts: ManageOptions,
    ) -> Result<ManageResult> {
        let tokens = estimate_messages(messages, None);

        if !opts.force
            && tokens <= self.config.management_threshold
            && messages.len() <= self.config.max_messages
        {
            return Ok(ManageResult {
                managed: false,
                action: ContextAction::none(),
                effective_messages: messages.to_vec(),
                token_count: tokens,
                message_count: messages.len(),
            });
        }

        let strategy = opts.strategy.unwrap_or_else(|| self.resolve_strategy(tokens));
        let (action_type, managed_messages, summary, affected_message_ids) =
            self.apply_strategy(strategy, messages, tokens).await;

        if self.config.auto_checkpoint
            && self.config.checkpoint_interval > 0
            && messages.len() % self.config.checkpoint_interval == 0
        {
            self.history
                .create_checkpoint(
                    session_id,
                    messages,
                    tokens,
                    &format!("auto before {action_type:?}"),
                    self.config.max_checkpoints,
                )
                .ok();
        }

        let tokens_after = estimate_messages(&managed_messages, None);
        let action = ContextAction {
            action_type,
            affected_message_ids,
            summary,
            tokens_before: tokens,
            tokens_after,
            timestamp: chrono::Utc::now(),
            reason: opts.reason.unwrap_or_else(|| format!("{action_type:?} strategy")),
        };

        Ok(ManageResult {
            managed: true,
            action,
            message_count: managed_messages.len(),
            effective_messages: managed_messages,
            token_count: tokens_after,
        })
    }

    /// Temporarily force the compact strategy regardless of configuration.
    pub async fn force_compact(
        &self,
        session_id: &ConversationId,
        messages: &[Message],
        threshold: Option<u64>,
    ) -> Result<ManageResult> {
        let _ = threshold;
        self.manage(
            session_id,
            messages,
            ManageOptions {
                force: true,
                strategy: Some(CompressionStrategy::Compact),
                reason: Some("forced compact".to_string()),
            },
        )
        .await
    }

    /// Restore a checkpoint as the current effective context, replacing
    /// the conversation's full history atomically (spec.md §4.5).
    pub async fn rollback_to_checkpoint(
        &self,
        session_id: &ConversationId,
        checkpoint_id: &CheckpointId,
    ) -> Result<ManageResult> {
        let checkpoint = self
            .history
            .restore_checkpoint(checkpoint_id)?
            .ok_or_else(|| crate::error::MemoryError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.clone(),
            })?;

        if &checkpoint.conversation_id != session_id {
            return Err(crate::error::MemoryError::CheckpointMismatch {
                checkpoint_id: checkpoint_id.clone(),
                expected: session_id.clone(),
                actual: checkpoint.conversation_id.clone(),
            });
        }

        self.history
            .replace_history(session_id, &checkpoint.messages)?;

        let action = ContextAction {
            action_type: ActionType::Restore,
            affected_message_ids: Vec::new(),
            summary: None,
            tokens_before: checkpoint.token_count,
            tokens_after: checkpoint.token_count,
            timestamp: chrono::Utc::now(),
            reason: format!("restore from checkpoint {checkpoint_id}"),
        };

        Ok(ManageResult {
            managed: true,
            message_count: checkpoint.messages.len(),
            token_count: checkpoint.token_count,
            effective_messages: checkpoint.messages,
            action,
        })
    }

    fn resolve_strategy(&self, tokens: u64) -> CompressionStrategy {
        match self.config.compression_strategy {
            ContextStrategy::Truncate => CompressionStrategy::Truncate,
            ContextStrategy::Prune => CompressionStrategy::Prune,
            ContextStrategy::Compact => CompressionStrategy::Compact,
            ContextStrategy::Hybrid => self.resolve_hybrid(tokens),
        }
    }

    fn resolve_hybrid(&self, tokens: u64) -> CompressionStrategy {
        let usage = tokens as f64 / self.config.max_tokens as f64;
        if usage > 0.9 {
            CompressionStrategy::Compact
        } else if usage > 0.7 {
            CompressionStrategy::Prune
        } else {
            CompressionStrategy::Truncate
        }
    }

    async fn apply_strategy(
        &self,
        strategy: CompressionStrategy,
        messages: &[Message],
        tokens: u64,
    ) -> (ActionType, Vec<Message>, Option<String>, Vec<i64>) {
        let strategy = match strategy {
            CompressionStrategy::Hybrid => self.resolve_hybrid(tokens),
            other => other,
        };
        match strategy {
            CompressionStrategy::Truncate => {
                let (kept, removed) = self.truncate(messages);
                (ActionType::Truncate, kept, None, removed)
            }
            CompressionStrategy::Prune => {
                let (kept, removed) = self.prune(messages);
                (ActionType::Prune, kept, None, removed)
            }
            CompressionStrategy::Compact => {
                let (managed, summary) = self.compact(messages, tokens).await;
                (ActionType::Compact, managed, Some(summary), Vec::new())
            }
            CompressionStrategy::Hybrid => unreachable!("resolved above"),
        }
    }

    /// Keep the most recent `max_messages` messages. `removedMessageIds` are
    /// the 1-based positional indices of everything dropped from the front.
    fn truncate(&self, messages: &[Message]) -> (Vec<Message>, Vec<i64>) {
        let keep = self.config.max_messages.min(messages.len());
        let cut = messages.len() - keep;
        let removed = (1..=cut as i64).collect();
        (messages[cut..].to_vec(), removed)
    }

    /// Keep every system message, the first message, and the last five
    /// non-system messages, in original order, deduplicated. Everything
    /// else is reported as removed via its 1-based positional index.
    fn prune(&self, messages: &[Message]) -> (Vec<Message>, Vec<i64>) {
        let mut kept_indices: Vec<usize> = Vec::new();

        for (i, m) in messages.iter().enumerate() {
            if m.role == Role::System {
                kept_indices.push(i);
            }
        }
        if !messages.is_empty() {
            kept_indices.push(0);
        }
        let non_system_tail: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != Role::System)
            .map(|(i, _)| i)
            .rev()
            .take(5)
            .collect();
        kept_indices.extend(non_system_tail);

        kept_indices.sort_unstable();
        kept_indices.dedup();

        let removed: Vec<i64> = (0..messages.len())
            .filter(|i| !kept_indices.contains(i))
            .map(|i| (i + 1) as i64)
            .collect();
        let kept = kept_indices.into_iter().map(|i| messages[i].clone()).collect();
        (kept, removed)
    }

    async fn compact(&self, messages: &[Message], tokens: u64) -> (Vec<Message>, String) {
        let system: Vec<Message> = messages.iter().filter(|m| m.role == Role::System).cloned().collect();
        let non_system: Vec<Message> = messages.iter().filter(|m| m.role != Role::System).cloned().collect();

        let timeout = Duration::from_millis(self.config.compression_timeout_ms);
        if let Some(summary_text) = self.summarizer.summarize(&non_system, timeout).await {
            let budget = (self.config.max_tokens as f64 * 0.7) as u64;
            let fit = fit_recent(&non_system, budget);
            let mut out = system;
            out.extend(fit.messages);
            out.push(summary_message(&summary_text));

            // Best-effort re-trim if the summary itself pushed us over budget.
            let total = estimate_messages(&out, None);
            if total > self.config.max_tokens {
                let over = total - self.config.max_tokens;
                let trimmed = fit_recent(&out, self.config.max_tokens.saturating_sub(over));
                return (trimmed.messages, summary_text);
            }
            (out, summary_text)
        } else {
            let mut out = system;
            let tail: Vec<Message> = non_system.iter().rev().take(10).rev().cloned().collect();
            let user_count = tail.iter().filter(|m| m.role == Role::User).count();
            let assistant_count = tail.iter().filter(|m| m.role == Role::Assistant).count();
            let stub = format!(
                "{user_count} user / {assistant_count} assistant messages compacted ({tokens} tokens before); topics: unavailable (summarizer offline)"
            );
            out.extend(tail);
            out.push(summary_message(&stub));
            (out, stub)
        }
    }
}

fn summary_message(text: &str) -> Message {
    Message::new(Role::Assistant, Content::text(text)).with_name("summary")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn manager(config: ContextConfig) -> ContextManager {
        let history = Arc::new(HistoryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        ContextManager::new(config, history, Arc::new(NoopSummarizer))
    }

    fn long_message() -> Message {
        Message::user("x".repeat(400))
    }

    #[tokio::test]
    async fn below_threshold_is_not_managed() {
        let config = ContextConfig {
            management_threshold: 1_000_000,
            max_messages: 1_000,
            ..ContextConfig::default()
        };
        let mgr = manager(config);
        let conv = ConversationId::new("c1");
        let messages = vec![Message::user("hi")];
        let result = mgr.manage(&conv, &messages, ManageOptions::default()).await.unwrap();
        assert!(!result.managed);
        assert_eq!(result.effective_messages.len(), 1);
    }

    #[tokio::test]
    async fn truncate_keeps_max_messages_most_recent() {
        let config = ContextConfig {
            management_threshold: 0,
            max_messages: 2,
            compression_strategy: ContextStrategy::Truncate,
            auto_checkpoint: false,
            ..ContextConfig::default()
        };
        let mgr = manager(config);
        let conv = ConversationId::new("c1");
        let messages = vec![Message::user("a"), Message::user("b"), Message::user("c")];
        let result = mgr.manage(&conv, &messages, ManageOptions::default()).await.unwrap();
        assert!(result.managed);
        assert_eq!(result.effective_messages.len(), 2);
        assert_eq!(result.effective_messages[0].content.render(), "b");
    }

    #[tokio::test]
    async fn prune_keeps_system_first_and_last_five() {
        let config = ContextConfig {
            management_threshold: 0,
            max_messages: 1_000,
            compression_strategy: ContextStrategy::Prune,
            auto_checkpoint: false,
            ..ContextConfig::default()
        };
        let mgr = manager(config);
        let conv = ConversationId::new("c1");
        let mut messages = vec![Message::system("sys"), Message::user("first")];
        for i in 0..10 {
            messages.push(Message::user(format!("m{i}")));
        }
        let result = mgr.manage(&conv, &messages, ManageOptions::default()).await.unwrap();
        assert!(result.managed);
        let rendered: Vec<String> = result.effective_messages.iter().map(|m| m.content.render()).collect();
        assert!(rendered.contains(&"sys".to_string()));
        assert!(rendered.contains(&"first".to_string()));
        assert!(rendered.contains(&"m9".to_string()));
        assert!(!rendered.contains(&"m3".to_string()));
    }

    #[tokio::test]
    async fn compact_without_summarizer_falls_back_to_stub() {
        let config = ContextConfig {
            management_threshold: 0,
            max_messages: 1_000,
            compression_strategy: ContextStrategy::Compact,
            auto_checkpoint: false,
            ..ContextConfig::default()
        };
        let mgr = manager(config);
        let conv = ConversationId::new("c1");
        let messages = vec![long_message(), Message::assistant("ok")];
        let result = mgr.manage(&conv, &messages, ManageOptions::default()).await.unwrap();
        assert!(result.managed);
        let last = result.effective_messages.last().unwrap();
        assert!(last.is_summary());
        assert!(last.content.render().contains("summarizer offline"));
    }

    #[tokio::test]
    async fn hybrid_selects_compact_above_90_percent_usage() {
        let config = ContextConfig {
            management_threshold: 0,
            max_messages: 1_000,
            max_tokens: 100,
            compression_strategy: ContextStrategy::Hybrid,
            auto_checkpoint: false,
            ..ContextConfig::default()
        };
        let mgr = manager(config);
        let conv = ConversationId::new("c1");
        let messages = vec![Message::user("x".repeat(400))]; // ~100 tokens + overhead > 90 tokens
        let result = mgr.manage(&conv, &messages, ManageOptions::default()).await.unwrap();
        assert!(result.effective_messages.last().unwrap().is_summary());
    }

    #[tokio::test]
    async fn rollback_restores_checkpoint_and_replaces_history() {
        let config = ContextConfig::default();
        let history = Arc::new(HistoryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let mgr = ContextManager::new(config, history.clone(), Arc::new(NoopSummarizer));
        let conv = ConversationId::new("c3");

        history
            .append(&conv, &(0..5).map(|i| Message::user(format!("m{i}"))).collect::<Vec<_>>())
            .unwrap();
        let checkpoint_messages = history.read(&conv, 100, 0).unwrap();
        let messages: Vec<Message> = checkpoint_messages.into_iter().map(|e| e.message).collect();
        let cp_id = history.create_checkpoint(&conv, &messages, 20, "test", 10).unwrap();

        history
            .append(&conv, &(5..10).map(|i| Message::user(format!("m{i}"))).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(history.count(&conv).unwrap(), 10);

        let result = mgr.rollback_to_checkpoint(&conv, &cp_id).await.unwrap();
        assert_eq!(result.effective_messages.len(), 5);
        assert_eq!(history.count(&conv).unwrap(), 5);
    }
}
