use conduit_core::types::{CheckpointId, ConversationId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("checkpoint {checkpoint_id} not found")]
    CheckpointNotFound { checkpoint_id: CheckpointId },

    #[error("checkpoint {checkpoint_id} belongs to conversation {actual}, not {expected}")]
    CheckpointMismatch {
        checkpoint_id: CheckpointId,
        expected: ConversationId,
        actual: ConversationId,
    },

    #[error("LLM compaction failed: {0}")]
    CompactionFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
