use std::sync::Arc;
use std::time::Duration;

use conduit_core::event_bus::EventBus;
use conduit_core::types::{ConversationId, Message, RequestId, Role};
use conduit_memory::{ContextManager, ManageOptions};
use conduit_memory::history::HistoryStore;
use conduit_sessions::{SessionRegistry, UsageUpdate};
use serde_json::json;
use tracing::warn;

use crate::fleet::{NodeFleetManager, Usage};
use crate::ports::{
    EthicsInput, EthicsReviewer, EthicsVerdict, PlaybookInput, PlaybookMatch, PlaybookMatcher,
    StrategyEngine, StrategyInput,
};

const HISTORY_LOOKBACK: i64 = 40;
const SAVE_RETRY_ATTEMPTS: u32 = 3;
const SAVE_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ChatInput {
    pub messages: Vec<Message>,
    pub conversation_id: Option<ConversationId>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub node_id: Option<String>,
    pub capability: Option<String>,
    pub request_id: Option<RequestId>,
    pub model: Option<String>,
}

impl Default for ChatInput {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            conversation_id: None,
            agent_id: None,
            user_id: None,
            node_id: None,
            capability: Some("chat".to_string()),
            request_id: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResult {
    pub request_id: RequestId,
    pub session_id: Option<ConversationId>,
    pub content: String,
    pub iterations: u32,
    pub usage: Option<Usage>,
    pub blocked_by_ethics: bool,
    pub reason: Option<String>,
    pub suggestions: Vec<String>,
    pub error: Option<String>,
}

impl ChatResult {
    fn error(request_id: RequestId, session_id: Option<ConversationId>, error: impl Into<String>) -> Self {
        Self {
            request_id,
            session_id,
            content: String::new(),
            iterations: 0,
            usage: None,
            blocked_by_ethics: false,
            reason: None,
            suggestions: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Coordinates one chat turn end to end: ethics review, session resolution,
/// context shaping, strategy dispatch, then history persistence
/// (spec.md §4.9). Never propagates a strategy/storage failure as an `Err`
/// — every failure mode degrades into a `ChatResult` field the caller can
/// inspect, so a single bad turn can't take down a request handler.
pub struct ChatOrchestrator {
    fleet: Arc<NodeFleetManager>,
    sessions: Arc<SessionRegistry>,
    history: Arc<HistoryStore>,
    context: Arc<ContextManager>,
    ethics: Arc<dyn EthicsReviewer>,
    playbooks: Arc<dyn PlaybookMatcher>,
    strategy: Arc<dyn StrategyEngine>,
    events: Arc<EventBus>,
    default_model: String,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fleet: Arc<NodeFleetManager>,
        sessions: Arc<SessionRegistry>,
        history: Arc<HistoryStore>,
        context: Arc<ContextManager>,
        ethics: Arc<dyn EthicsReviewer>,
        playbooks: Arc<dyn PlaybookMatcher>,
        strategy: Arc<dyn StrategyEngine>,
        events: Arc<EventBus>,
        default_model: String,
    ) -> Self {
        Self { fleet, sessions, history, context, ethics, playbooks, strategy, events, default_model }
    }

    pub async fn chat(&self, input: ChatInput) -> ChatResult {
        let request_id = input.request_id.clone().unwrap_or_default();

        let ethics_input = EthicsInput { messages: input.messages.clone(), user_id: input.user_id.clone() };
        if let EthicsVerdict::Deny { reason, suggestions } = self.ethics.review(&ethics_input) {
            self.events.publish(
                "USER_REQUEST_REJECTED",
                json!({ "requestId": request_id.to_string(), "reason": reason }),
            );
            return ChatResult {
                request_id,
                session_id: None,
                content: String::new(),
                iterations: 0,
                usage: None,
                blocked_by_ethics: true,
                reason: Some(reason),
                suggestions,
                error: None,
            };
        }

        let session_id = match &input.conversation_id {
            Some(conv) => match self.sessions.get_or_create(input.agent_id.clone(), input.user_id.clone(), conv).await {
                Ok(sid) => Some(sid),
                Err(e) => {
                    warn!(error = %e, "session resolution failed, continuing without a session");
                    None
                }
            },
            None => None,
        };

        let (model_messages, is_first_turn) = match &input.conversation_id {
            Some(conv) => self.build_model_messages(conv, &input.messages).await,
            None => (input.messages.clone(), true),
        };

        let playbook = self.playbooks.match_playbook(&PlaybookInput { messages: model_messages.clone() });

        let node_id = match input.node_id.clone() {
            Some(n) => n,
            None => match self.fleet.select_dispatch_node(input.capability.as_deref()) {
                Ok(n) => n,
                Err(e) => return ChatResult::error(request_id, session_id, e.to_string()),
            },
        };

        let model = input.model.clone().unwrap_or_else(|| self.default_model.clone());
        let strategy_input = StrategyInput {
            request_id: request_id.clone(),
            node_id,
            messages: model_messages,
            model,
            playbook,
        };

        let (content, usage, iterations) = match self.strategy.run(strategy_input).await {
            Ok(out) => (out.content, out.usage, out.iterations),
            Err(e) => return ChatResult::error(request_id, session_id, e.to_string()),
        };

        if let Some(conv) = &input.conversation_id {
            let to_save = messages_to_save(is_first_turn, &input.messages);
            let mut turn = to_save;
            if !content.is_empty() {
                turn.push(Message::assistant(clean_error_markers(&content)));
            }
            if !turn.is_empty() {
                self.save_history_with_retry(conv, turn).await;
            }
        }

        if let (Some(sid), Some(u)) = (&session_id, &usage) {
            let _ = self.sessions.update_metadata(
                sid,
                UsageUpdate { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens },
            );
        }

        ChatResult {
            request_id,
            session_id,
            content,
            iterations,
            usage,
            blocked_by_ethics: false,
            reason: None,
            suggestions: Vec::new(),
            error: None,
        }
    }

    /// Load prior turns, run them through `ContextManager`, and append the
    /// new turn's messages on top of whatever effective context comes back.
    async fn build_model_messages(&self, conv: &ConversationId, incoming: &[Message]) -> (Vec<Message>, bool) {
        let history_entries = self.history.read(conv, HISTORY_LOOKBACK, 0).unwrap_or_default();
        let is_first_turn = history_entries.is_empty();
        let history_messages: Vec<Message> = history_entries.into_iter().map(|e| e.message).collect();

        let effective = match self
            .context
            .manage(conv, &history_messages, ManageOptions { force: false, strategy: None, reason: Some("chat turn".into()) })
            .await
        {
            Ok(result) => result.effective_messages,
            Err(e) => {
                warn!(error = %e, "context management failed, using raw history");
                history_messages
            }
        };

        let mut model_messages = effective;
        model_messages.extend(incoming.iter().cloned());
        (model_messages, is_first_turn)
    }

    async fn save_history_with_retry(&self, conv: &ConversationId, messages: Vec<Message>) {
        let mut delay = SAVE_RETRY_BASE_DELAY;
        for attempt in 1..=SAVE_RETRY_ATTEMPTS {
            match self.history.append(conv, &messages) {
                Ok(()) => return,
                Err(e) => {
                    warn!(attempt, error = %e, conversation_id = %conv, "history save failed");
                    if attempt == SAVE_RETRY_ATTEMPTS {
                        self.events.publish(
                            "history_save_failed",
                            json!({ "conversationId": conv.to_string(), "attempts": attempt }),
                        );
                        return;
                    }
                    let jitter = Duration::from_millis(rand::random::<u64>() % (delay.as_millis() as u64 + 1));
                    tokio::time::sleep(delay + jitter).await;
                    delay *= 2;
                }
            }
        }
    }
}

/// Which of the new turn's messages get appended to history: on the first
/// turn, every non-system/non-assistant message (so an opening system
/// prompt plus the user's first message both land); on later turns, just
/// the most recent user message.
fn messages_to_save(is_first_turn: bool, incoming: &[Message]) -> Vec<Message> {
    if is_first_turn {
        incoming
            .iter()
            .filter(|m| !matches!(m.role, Role::Assistant | Role::System))
            .cloned()
            .collect()
    } else {
        incoming
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .cloned()
            .into_iter()
            .collect()
    }
}

/// Strip artifacts that only make sense mid-conversation before a turn is
/// committed to history: tool-error wrappers, system feedback banners, and
/// raw stack traces a downstream tool call may have leaked into the model's
/// own output.
fn clean_error_markers(text: &str) -> String {
    let mut out = strip_between(text, "<tool_output status=\"error\">", "</tool_output>");
    out = strip_lines_matching(&out, |line| {
        line.contains("[SYSTEM_FEEDBACK]") && line.to_lowercase().contains("error")
    });
    out = strip_lines_matching(&out, |line| line.contains("MCP error") || line.trim_start().starts_with("at "));
    out = strip_lines_matching(&out, |line| line.trim() == "Traceback (most recent call last):");
    out.trim().to_string()
}

fn strip_between(text: &str, start: &str, end: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start_idx) = rest.find(start) {
        out.push_str(&rest[..start_idx]);
        let after_start = &rest[start_idx + start.len()..];
        match after_start.find(end) {
            Some(end_idx) => rest = &after_start[end_idx + end.len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn strip_lines_matching(text: &str, predicate: impl Fn(&str) -> bool) -> String {
    text.lines().filter(|line| !predicate(line)).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tool_output_error_blocks() {
        let text = "before <tool_output status=\"error\">boom</tool_output> after";
        assert_eq!(clean_error_markers(text), "before  after");
    }

    #[test]
    fn strips_system_feedback_error_lines_only() {
        let text = "keep this\n[SYSTEM_FEEDBACK] an error occurred\n[SYSTEM_FEEDBACK] all good here";
        let cleaned = clean_error_markers(text);
        assert!(cleaned.contains("keep this"));
        assert!(cleaned.contains("all good here"));
        assert!(!cleaned.contains("an error occurred"));
    }

    #[test]
    fn messages_to_save_first_turn_keeps_system_and_user() {
        let incoming = vec![Message::system("sys"), Message::user("hi")];
        let saved = messages_to_save(true, &incoming);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content.render(), "hi");
    }

    #[test]
    fn messages_to_save_later_turn_keeps_only_last_user_message() {
        let incoming = vec![Message::user("first"), Message::user("second")];
        let saved = messages_to_save(false, &incoming);
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content.render(), "second");
    }
}
