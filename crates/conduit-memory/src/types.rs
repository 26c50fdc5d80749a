use conduit_core::types::{CheckpointId, ConversationId, Message};
use serde::{Deserialize, Serialize};

/// One row of the append-only conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullHistoryEntry {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub message: Message,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The shaped message list currently sent to the model for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveContext {
    pub session_id: ConversationId,
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub token_count: u64,
    pub message_count: usize,
    pub compression_summary: Option<String>,
    pub compressed_message_ids: Vec<i64>,
    pub last_action: ContextAction,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Immutable snapshot of a conversation's messages, enabling deterministic
/// rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub token_count: u64,
    pub message_count: usize,
    pub reason: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkKind {
    Compressed,
    Truncated,
    Pruned,
    Important,
    Pinned,
}

/// Advisory annotation against a `FullHistoryEntry`. Never affects what is
/// read back — purely informational bookkeeping for an action that touched
/// that entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMark {
    pub message_id: i64,
    pub conversation_id: ConversationId,
    pub kind: MarkKind,
    pub action_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// The shape of work a ContextManager strategy performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    None,
    Truncate,
    Prune,
    Compact,
    Restore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub affected_message_ids: Vec<i64>,
    pub summary: Option<String>,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub reason: String,
}

impl ContextAction {
    pub fn none() -> Self {
        Self {
            action_type: ActionType::None,
            affected_message_ids: Vec::new(),
            summary: None,
            tokens_before: 0,
            tokens_after: 0,
            timestamp: chrono::Utc::now(),
            reason: "below management threshold".to_string(),
        }
    }
}

/// Which compaction strategy ContextManager should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    Truncate,
    Prune,
    Compact,
    Hybrid,
}

/// Outcome of a `manage` call.
#[derive(Debug, Clone)]
pub struct ManageResult {
    pub managed: bool,
    pub action: ContextAction,
    pub effective_messages: Vec<Message>,
    pub token_count: u64,
    pub message_count: usize,
}
