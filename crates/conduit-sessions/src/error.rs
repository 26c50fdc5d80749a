use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("conversation id is empty")]
    EmptyConversationId,

    #[error("session not found: {conversation_id}")]
    NotFound { conversation_id: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;
