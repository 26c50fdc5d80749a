use serde::{Deserialize, Serialize};

/// Token counters bumped after a request completes, folded into
/// `SessionMetadata` by `updateMetadata`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageUpdate {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Per-session counters. Process-local: loss on restart is acceptable
/// because it is recomputable from `HistoryStore` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_message_at: chrono::DateTime<chrono::Utc>,
    pub message_count: u64,
    pub total_tokens: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl SessionMetadata {
    pub fn new(agent_id: Option<String>, user_id: Option<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            agent_id,
            user_id,
            created_at: now,
            last_message_at: now,
            message_count: 0,
            total_tokens: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
        }
    }

    pub fn apply_usage(&mut self, usage: UsageUpdate) {
        self.last_message_at = chrono::Utc::now();
        self.message_count += 1;
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_tokens += usage.input_tokens + usage.output_tokens;
    }
}
